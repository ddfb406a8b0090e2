//! CWMP event codes and the pending-event queue
//!
//! Removal behavior is metadata on the code itself: events leave the queue
//! after the Inform that carried them, after their paired TransferComplete
//! is acknowledged, or immediately when a session fails (no retry).

use crate::protocols::soap::EventStruct;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventCode {
    Bootstrap,
    Boot,
    Periodic,
    Scheduled,
    ValueChange,
    Kicked,
    ConnectionRequest,
    TransferComplete,
    DiagnosticsComplete,
    RequestDownload,
    AutonomousTransferComplete,
    MReboot,
    MScheduleInform,
    MDownload,
    MUpload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovePolicy {
    AfterInform,
    AfterTransferComplete,
    NoRetry,
}

impl EventCode {
    pub const ALL: [EventCode; 15] = [
        EventCode::Bootstrap,
        EventCode::Boot,
        EventCode::Periodic,
        EventCode::Scheduled,
        EventCode::ValueChange,
        EventCode::Kicked,
        EventCode::ConnectionRequest,
        EventCode::TransferComplete,
        EventCode::DiagnosticsComplete,
        EventCode::RequestDownload,
        EventCode::AutonomousTransferComplete,
        EventCode::MReboot,
        EventCode::MScheduleInform,
        EventCode::MDownload,
        EventCode::MUpload,
    ];

    /// Wire spelling used in EventStruct and for the control surface.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventCode::Bootstrap => "0 BOOTSTRAP",
            EventCode::Boot => "1 BOOT",
            EventCode::Periodic => "2 PERIODIC",
            EventCode::Scheduled => "3 SCHEDULED",
            EventCode::ValueChange => "4 VALUE CHANGE",
            EventCode::Kicked => "5 KICKED",
            EventCode::ConnectionRequest => "6 CONNECTION REQUEST",
            EventCode::TransferComplete => "7 TRANSFER COMPLETE",
            EventCode::DiagnosticsComplete => "8 DIAGNOSTICS COMPLETE",
            EventCode::RequestDownload => "9 REQUEST DOWNLOAD",
            EventCode::AutonomousTransferComplete => "10 AUTONOMOUS TRANSFER COMPLETE",
            EventCode::MReboot => "M Reboot",
            EventCode::MScheduleInform => "M ScheduleInform",
            EventCode::MDownload => "M Download",
            EventCode::MUpload => "M Upload",
        }
    }

    pub fn from_name(name: &str) -> Option<EventCode> {
        EventCode::ALL.iter().copied().find(|c| c.as_str() == name)
    }

    /// Stable index used in the backup document's `<event_number>`.
    pub fn index(&self) -> u8 {
        EventCode::ALL
            .iter()
            .position(|c| c == self)
            .unwrap_or_default() as u8
    }

    pub fn from_index(index: u8) -> Option<EventCode> {
        EventCode::ALL.get(index as usize).copied()
    }

    /// Single events appear at most once in the queue; M-events repeat, one
    /// per outstanding RPC.
    pub fn is_single(&self) -> bool {
        !matches!(
            self,
            EventCode::MReboot
                | EventCode::MScheduleInform
                | EventCode::MDownload
                | EventCode::MUpload
        )
    }

    pub fn remove_policy(&self) -> RemovePolicy {
        match self {
            EventCode::ConnectionRequest => RemovePolicy::NoRetry,
            EventCode::TransferComplete
            | EventCode::AutonomousTransferComplete
            | EventCode::MDownload
            | EventCode::MUpload => RemovePolicy::AfterTransferComplete,
            _ => RemovePolicy::AfterInform,
        }
    }

    /// Whether the event survives a restart through the backup document.
    pub fn persisted(&self) -> bool {
        !matches!(
            self,
            EventCode::ValueChange | EventCode::Kicked | EventCode::ConnectionRequest
        )
    }
}

#[derive(Debug, Clone)]
pub struct Event {
    /// Queue-local id, used to snapshot the Inform body of a session.
    pub id: u64,
    pub code: EventCode,
    pub key: Option<String>,
    /// Correlation id linking an M-event to its transfer record; 0 = none.
    pub method_id: u32,
    /// Backup-store record id for persisted events.
    pub backup_id: Option<u32>,
}

#[derive(Debug, Default)]
pub struct EventQueue {
    events: Vec<Event>,
    next_id: u64,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event, preserving insertion order. A single-type code that
    /// is already queued is not duplicated; the existing entry wins.
    pub fn add(
        &mut self,
        code: EventCode,
        key: Option<String>,
        method_id: u32,
        backup_id: Option<u32>,
    ) -> Option<u64> {
        if code.is_single() && self.events.iter().any(|e| e.code == code) {
            return None;
        }
        self.next_id += 1;
        let id = self.next_id;
        self.events.push(Event {
            id,
            code,
            key,
            method_id,
            backup_id,
        });
        Some(id)
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.events.iter()
    }

    pub fn contains(&self, code: EventCode) -> bool {
        self.events.iter().any(|e| e.code == code)
    }

    /// Ids of everything currently queued; the session snapshots this at
    /// Inform time so later additions stay out of the running session.
    pub fn snapshot_ids(&self) -> Vec<u64> {
        self.events.iter().map(|e| e.id).collect()
    }

    /// The EventStruct list for an Inform, restricted to a snapshot.
    pub fn inform_body(&self, snapshot: &[u64]) -> Vec<EventStruct> {
        self.events
            .iter()
            .filter(|e| snapshot.contains(&e.id))
            .map(|e| EventStruct {
                event_code: e.code.as_str().to_string(),
                command_key: e.key.clone().unwrap_or_default(),
            })
            .collect()
    }

    /// Remove events matching a policy, returning the backup record ids that
    /// must be dropped alongside. `snapshot` restricts removal to a session's
    /// Inform body; `method_id` restricts to one transfer correlation.
    pub fn remove_by_policy(
        &mut self,
        policy: RemovePolicy,
        snapshot: Option<&[u64]>,
        method_id: Option<u32>,
    ) -> Vec<u32> {
        let mut removed_backup = Vec::new();
        self.events.retain(|e| {
            let mut matches = e.code.remove_policy() == policy;
            if let Some(ids) = snapshot {
                matches &= ids.contains(&e.id);
            }
            if let Some(mid) = method_id {
                matches &= e.method_id == mid;
            }
            if matches {
                if let Some(backup_id) = e.backup_id {
                    removed_backup.push(backup_id);
                }
            }
            !matches
        });
        removed_backup
    }

    /// Drop everything; used when a BOOTSTRAP rewrites the protocol state.
    pub fn clear(&mut self) -> Vec<u32> {
        let removed = self.events.iter().filter_map(|e| e.backup_id).collect();
        self.events.clear();
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_table_matches_wire_spellings() {
        assert_eq!(EventCode::Bootstrap.as_str(), "0 BOOTSTRAP");
        assert_eq!(EventCode::ConnectionRequest.as_str(), "6 CONNECTION REQUEST");
        assert_eq!(EventCode::MDownload.as_str(), "M Download");
        assert_eq!(
            EventCode::from_name("10 AUTONOMOUS TRANSFER COMPLETE"),
            Some(EventCode::AutonomousTransferComplete)
        );
        assert_eq!(EventCode::from_name("11 NOPE"), None);
    }

    #[test]
    fn index_roundtrips() {
        for code in EventCode::ALL {
            assert_eq!(EventCode::from_index(code.index()), Some(code));
        }
    }

    #[test]
    fn policies_follow_the_code_table() {
        assert_eq!(EventCode::Boot.remove_policy(), RemovePolicy::AfterInform);
        assert_eq!(
            EventCode::ConnectionRequest.remove_policy(),
            RemovePolicy::NoRetry
        );
        assert_eq!(
            EventCode::MDownload.remove_policy(),
            RemovePolicy::AfterTransferComplete
        );
        assert!(!EventCode::ValueChange.persisted());
        assert!(!EventCode::Kicked.persisted());
        assert!(!EventCode::ConnectionRequest.persisted());
        assert!(EventCode::MReboot.persisted());
    }

    #[test]
    fn single_events_do_not_duplicate() {
        let mut queue = EventQueue::new();
        assert!(queue.add(EventCode::Boot, None, 0, None).is_some());
        assert!(queue.add(EventCode::Boot, None, 0, None).is_none());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn m_events_repeat() {
        let mut queue = EventQueue::new();
        queue.add(EventCode::MDownload, Some("a".to_string()), 1, None);
        queue.add(EventCode::MDownload, Some("b".to_string()), 2, None);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn snapshot_keeps_later_events_out_of_the_inform() {
        let mut queue = EventQueue::new();
        queue.add(EventCode::Boot, None, 0, None);
        let snapshot = queue.snapshot_ids();
        queue.add(EventCode::Periodic, None, 0, None);

        let body = queue.inform_body(&snapshot);
        assert_eq!(body.len(), 1);
        assert_eq!(body[0].event_code, "1 BOOT");
    }

    #[test]
    fn remove_after_inform_spares_transfer_events() {
        let mut queue = EventQueue::new();
        queue.add(EventCode::Boot, None, 0, Some(10));
        queue.add(EventCode::MDownload, Some("k".to_string()), 3, Some(11));
        let snapshot = queue.snapshot_ids();

        let dropped = queue.remove_by_policy(RemovePolicy::AfterInform, Some(&snapshot), None);
        assert_eq!(dropped, vec![10]);
        assert_eq!(queue.len(), 1);
        assert!(queue.contains(EventCode::MDownload));
    }

    #[test]
    fn remove_by_method_id_targets_one_transfer() {
        let mut queue = EventQueue::new();
        queue.add(EventCode::MDownload, Some("a".to_string()), 3, Some(20));
        queue.add(EventCode::MDownload, Some("b".to_string()), 4, Some(21));

        let dropped =
            queue.remove_by_policy(RemovePolicy::AfterTransferComplete, None, Some(4));
        assert_eq!(dropped, vec![21]);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.iter().next().unwrap().method_id, 3);
    }

    #[test]
    fn no_retry_events_drop_even_outside_a_snapshot() {
        let mut queue = EventQueue::new();
        queue.add(EventCode::ConnectionRequest, None, 0, None);
        queue.add(EventCode::Boot, None, 0, None);

        queue.remove_by_policy(RemovePolicy::NoRetry, None, None);
        assert_eq!(queue.len(), 1);
        assert!(queue.contains(EventCode::Boot));
    }
}
