//! Pending transfers and scheduled informs
//!
//! A Download or Upload RPC parks a request here with an absolute fire time.
//! The daemon loop launches due entries through the transfer executor, turns
//! the result into a persisted transfer-complete record and an `M` event,
//! then asks for an inform.

/// Slot bounds per process; the eleventh concurrent request of a kind is
/// refused with fault 9004.
pub const MAX_DOWNLOAD: usize = 10;
pub const MAX_UPLOAD: usize = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct PendingDownload {
    /// Backup-store record id; the pending entry survives restarts.
    pub backup_id: u32,
    pub command_key: String,
    pub file_type: String,
    pub url: String,
    pub username: String,
    pub password: String,
    pub file_size: String,
    /// Absolute execution time, seconds since the epoch.
    pub time_execute: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingUpload {
    pub backup_id: u32,
    pub command_key: String,
    pub file_type: String,
    pub url: String,
    pub username: String,
    pub password: String,
    pub time_execute: i64,
}

/// A transfer whose fire time has elapsed.
#[derive(Debug, Clone, PartialEq)]
pub enum DueTransfer {
    Download(PendingDownload),
    Upload(PendingUpload),
}

#[derive(Debug, Default)]
pub struct TransferQueue {
    downloads: Vec<PendingDownload>,
    uploads: Vec<PendingUpload>,
}

impl TransferQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn download_count(&self) -> usize {
        self.downloads.len()
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.len()
    }

    pub fn add_download(&mut self, download: PendingDownload) {
        self.downloads.push(download);
    }

    pub fn add_upload(&mut self, upload: PendingUpload) {
        self.uploads.push(upload);
    }

    /// Earliest fire time over both kinds.
    pub fn next_fire_at(&self) -> Option<i64> {
        let d = self.downloads.iter().map(|d| d.time_execute).min();
        let u = self.uploads.iter().map(|u| u.time_execute).min();
        match (d, u) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Remove and return the earliest entry that is due at `now`. Entries
    /// loaded with a fire time in the past are due immediately.
    pub fn pop_due(&mut self, now: i64) -> Option<DueTransfer> {
        let due_download = self
            .downloads
            .iter()
            .enumerate()
            .filter(|(_, d)| d.time_execute <= now)
            .min_by_key(|(_, d)| d.time_execute)
            .map(|(i, d)| (i, d.time_execute));
        let due_upload = self
            .uploads
            .iter()
            .enumerate()
            .filter(|(_, u)| u.time_execute <= now)
            .min_by_key(|(_, u)| u.time_execute)
            .map(|(i, u)| (i, u.time_execute));

        match (due_download, due_upload) {
            (Some((i, dt)), Some((_, ut))) if dt <= ut => {
                Some(DueTransfer::Download(self.downloads.remove(i)))
            }
            (_, Some((j, _))) => Some(DueTransfer::Upload(self.uploads.remove(j))),
            (Some((i, _)), None) => Some(DueTransfer::Download(self.downloads.remove(i))),
            (None, None) => None,
        }
    }
}

/// A ScheduleInform RPC waiting to fire. Transient: not persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledInform {
    pub command_key: String,
    /// Absolute fire time, seconds since the epoch.
    pub fire_at: i64,
}

pub fn next_scheduled_at(scheduled: &[ScheduledInform]) -> Option<i64> {
    scheduled.iter().map(|s| s.fire_at).min()
}

pub fn pop_due_scheduled(scheduled: &mut Vec<ScheduledInform>, now: i64) -> Option<ScheduledInform> {
    let index = scheduled
        .iter()
        .enumerate()
        .filter(|(_, s)| s.fire_at <= now)
        .min_by_key(|(_, s)| s.fire_at)
        .map(|(i, _)| i)?;
    Some(scheduled.remove(index))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn download(key: &str, at: i64) -> PendingDownload {
        PendingDownload {
            backup_id: 0,
            command_key: key.to_string(),
            file_type: "1 Firmware Upgrade Image".to_string(),
            url: "http://srv/fw.bin".to_string(),
            username: String::new(),
            password: String::new(),
            file_size: "1048576".to_string(),
            time_execute: at,
        }
    }

    fn upload(key: &str, at: i64) -> PendingUpload {
        PendingUpload {
            backup_id: 0,
            command_key: key.to_string(),
            file_type: "1 Vendor Configuration File".to_string(),
            url: "http://srv/up".to_string(),
            username: String::new(),
            password: String::new(),
            time_execute: at,
        }
    }

    #[test]
    fn pops_transfers_in_fire_order() {
        let mut queue = TransferQueue::new();
        queue.add_download(download("late", 200));
        queue.add_download(download("early", 100));
        queue.add_upload(upload("middle", 150));

        assert_eq!(queue.next_fire_at(), Some(100));
        match queue.pop_due(300) {
            Some(DueTransfer::Download(d)) => assert_eq!(d.command_key, "early"),
            other => panic!("unexpected {:?}", other),
        }
        match queue.pop_due(300) {
            Some(DueTransfer::Upload(u)) => assert_eq!(u.command_key, "middle"),
            other => panic!("unexpected {:?}", other),
        }
        match queue.pop_due(300) {
            Some(DueTransfer::Download(d)) => assert_eq!(d.command_key, "late"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(queue.pop_due(300).is_none());
    }

    #[test]
    fn entries_in_the_future_are_not_due() {
        let mut queue = TransferQueue::new();
        queue.add_download(download("fw", 500));
        assert!(queue.pop_due(499).is_none());
        assert!(queue.pop_due(500).is_some());
    }

    #[test]
    fn past_due_entries_fire_immediately() {
        let mut queue = TransferQueue::new();
        queue.add_download(download("stale", -5));
        assert!(queue.pop_due(0).is_some());
    }

    #[test]
    fn scheduled_informs_pop_earliest_first() {
        let mut scheduled = vec![
            ScheduledInform {
                command_key: "b".to_string(),
                fire_at: 20,
            },
            ScheduledInform {
                command_key: "a".to_string(),
                fire_at: 10,
            },
        ];
        assert_eq!(next_scheduled_at(&scheduled), Some(10));
        assert_eq!(
            pop_due_scheduled(&mut scheduled, 30).unwrap().command_key,
            "a"
        );
        assert_eq!(
            pop_due_scheduled(&mut scheduled, 30).unwrap().command_key,
            "b"
        );
        assert!(pop_due_scheduled(&mut scheduled, 30).is_none());
    }
}
