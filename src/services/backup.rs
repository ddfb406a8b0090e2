//! Durable protocol state: the `<backup_file>` document
//!
//! Everything that must survive a reboot lives here: the ACS URL the device
//! last bootstrapped against, the last observed software version, pending
//! events, undelivered transfer-complete records and scheduled transfers.
//! Records are typed and keyed by opaque ids; the XML document is re-rendered
//! from the typed state and written atomically on every mutation.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, error, warn};

use crate::protocols::xml::{DocBuilder, Element};
use crate::utils::time::UNKNOWN_TIME;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct StoredEvent {
    pub id: u32,
    pub code: u8,
    pub key: Option<String>,
    pub method_id: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransferRecord {
    pub id: u32,
    pub command_key: String,
    pub fault_code: String,
    pub fault_string: String,
    pub start_time: String,
    pub complete_time: String,
    pub method_id: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredDownload {
    pub id: u32,
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
pub struct StoredUpload {
    pub id: u32,
    pub command_key: String,
    pub file_type: String,
    pub url: String,
    pub username: String,
    pub password: String,
    pub time_execute: i64,
}

#[derive(Debug)]
pub struct BackupStore {
    path: PathBuf,
    acs_url: Option<String>,
    software_version: Option<String>,
    events: Vec<StoredEvent>,
    transfers: Vec<TransferRecord>,
    downloads: Vec<StoredDownload>,
    uploads: Vec<StoredUpload>,
    next_id: u32,
}

impl BackupStore {
    /// Load the backup document. A missing file yields an empty store. A
    /// corrupt file is preserved on disk untouched; the agent continues with
    /// an empty in-memory tree.
    pub fn load<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let mut store = Self {
            path,
            acs_url: None,
            software_version: None,
            events: Vec::new(),
            transfers: Vec::new(),
            downloads: Vec::new(),
            uploads: Vec::new(),
            next_id: 0,
        };

        let contents = match fs::read_to_string(&store.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("no backup file at {}", store.path.display());
                return store;
            }
            Err(e) => {
                error!("cannot read backup file {}: {}", store.path.display(), e);
                return store;
            }
        };

        match Element::parse(&contents) {
            Ok(root) if root.local_name() == "backup_file" => store.absorb(&root),
            Ok(_) => error!(
                "backup file {} has an unexpected root element, starting empty",
                store.path.display()
            ),
            Err(e) => error!(
                "backup file {} does not parse ({}), keeping it on disk and starting empty",
                store.path.display(),
                e
            ),
        }

        store
    }

    fn absorb(&mut self, root: &Element) {
        if let Some(url) = root.children.iter().find(|c| c.name == "acs_url") {
            self.acs_url = Some(url.text.clone());
        }
        let cwmp = match root.children.iter().find(|c| c.name == "cwmp") {
            Some(c) => c,
            None => return,
        };
        for child in &cwmp.children {
            match child.name.as_str() {
                "software_version" => self.software_version = Some(child.text.clone()),
                "event" => {
                    let code = child
                        .find_local("event_number")
                        .and_then(|e| e.trimmed_text().parse::<u8>().ok());
                    let key = child.find_local("event_key").map(|e| e.text.clone());
                    let method_id = child
                        .find_local("event_method_id")
                        .and_then(|e| e.trimmed_text().parse::<u32>().ok())
                        .unwrap_or(0);
                    match code {
                        Some(code) => {
                            let id = self.mint_id();
                            self.events.push(StoredEvent {
                                id,
                                code,
                                key,
                                method_id,
                            });
                        }
                        None => warn!("skipping backup event without a number"),
                    }
                }
                "transfer_complete" => {
                    let id = self.mint_id();
                    self.transfers.push(TransferRecord {
                        id,
                        command_key: text_of(child, "command_key"),
                        fault_code: text_of(child, "fault_code"),
                        fault_string: text_of(child, "fault_string"),
                        start_time: text_of(child, "start_time"),
                        complete_time: text_of(child, "complete_time"),
                        method_id: text_of(child, "method_id").trim().parse().unwrap_or(0),
                    });
                }
                "download" => {
                    let id = self.mint_id();
                    self.downloads.push(StoredDownload {
                        id,
                        command_key: text_of(child, "command_key"),
                        file_type: text_of(child, "file_type"),
                        url: text_of(child, "url"),
                        username: text_of(child, "username"),
                        password: text_of(child, "password"),
                        file_size: text_of(child, "file_size"),
                        time_execute: text_of(child, "time_execute").trim().parse().unwrap_or(0),
                    });
                }
                "upload" => {
                    let id = self.mint_id();
                    self.uploads.push(StoredUpload {
                        id,
                        command_key: text_of(child, "command_key"),
                        file_type: text_of(child, "file_type"),
                        url: text_of(child, "url"),
                        username: text_of(child, "username"),
                        password: text_of(child, "password"),
                        time_execute: text_of(child, "time_execute").trim().parse().unwrap_or(0),
                    });
                }
                other => debug!("ignoring unknown backup element <{}>", other),
            }
        }
    }

    fn mint_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    /// Render the whole document on one line, ready for any sink.
    pub fn render(&self) -> String {
        let mut b = DocBuilder::new();
        b.open("backup_file");
        if let Some(url) = &self.acs_url {
            b.leaf("acs_url", url);
        }
        b.open("cwmp");
        if let Some(version) = &self.software_version {
            b.leaf("software_version", version);
        }
        for event in &self.events {
            b.open("event");
            b.leaf("event_number", &event.code.to_string());
            if let Some(key) = &event.key {
                b.leaf("event_key", key);
            }
            if event.method_id != 0 {
                b.leaf("event_method_id", &event.method_id.to_string());
            }
            b.close("event");
        }
        for t in &self.transfers {
            b.open("transfer_complete");
            b.leaf("command_key", &t.command_key);
            b.leaf("fault_code", &t.fault_code);
            b.leaf("fault_string", &t.fault_string);
            b.leaf("start_time", &t.start_time);
            b.leaf("complete_time", &t.complete_time);
            b.leaf("method_id", &t.method_id.to_string());
            b.close("transfer_complete");
        }
        for d in &self.downloads {
            b.open("download");
            b.leaf("command_key", &d.command_key);
            b.leaf("file_type", &d.file_type);
            b.leaf("url", &d.url);
            b.leaf("username", &d.username);
            b.leaf("password", &d.password);
            b.leaf("file_size", &d.file_size);
            b.leaf("time_execute", &d.time_execute.to_string());
            b.close("download");
        }
        for u in &self.uploads {
            b.open("upload");
            b.leaf("command_key", &u.command_key);
            b.leaf("file_type", &u.file_type);
            b.leaf("url", &u.url);
            b.leaf("username", &u.username);
            b.leaf("password", &u.password);
            b.leaf("time_execute", &u.time_execute.to_string());
            b.close("upload");
        }
        b.close("cwmp");
        b.close("backup_file");

        let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>");
        out.push_str(&b.finish());
        out
    }

    /// Write the document to its temp sibling, fsync, then rename over the
    /// live file so a crash never leaves a half-written document.
    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file_name = self
            .path
            .file_name()
            .ok_or_else(|| Error::backup("backup path has no file name"))?
            .to_string_lossy()
            .into_owned();
        let tmp = self
            .path
            .with_file_name(format!("{}.tmp", file_name));

        let mut file = fs::File::create(&tmp)?;
        file.write_all(self.render().as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn acs_url(&self) -> Option<&str> {
        self.acs_url.as_deref()
    }

    /// Record a new ACS URL. This resets the whole protocol state: a URL
    /// change means the device re-bootstraps against a different server.
    pub fn set_acs_url(&mut self, url: &str) -> Result<()> {
        self.events.clear();
        self.transfers.clear();
        self.downloads.clear();
        self.uploads.clear();
        self.software_version = None;
        self.acs_url = Some(url.to_string());
        self.save()
    }

    pub fn software_version(&self) -> Option<&str> {
        self.software_version.as_deref()
    }

    pub fn set_software_version(&mut self, version: &str) -> Result<()> {
        self.software_version = Some(version.to_string());
        self.save()
    }

    pub fn events(&self) -> &[StoredEvent] {
        &self.events
    }

    pub fn add_event(&mut self, code: u8, key: Option<&str>, method_id: u32) -> Result<u32> {
        let id = self.mint_id();
        self.events.push(StoredEvent {
            id,
            code,
            key: key.map(str::to_string),
            method_id,
        });
        self.save()?;
        Ok(id)
    }

    pub fn remove_events(&mut self, ids: &[u32]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.events.retain(|e| !ids.contains(&e.id));
        self.save()
    }

    /// Wipe the `<cwmp>` subtree (a BOOTSTRAP rewrite keeps only the URL).
    pub fn clear_protocol_state(&mut self) -> Result<()> {
        self.events.clear();
        self.transfers.clear();
        self.downloads.clear();
        self.uploads.clear();
        self.save()
    }

    pub fn transfer_completes(&self) -> &[TransferRecord] {
        &self.transfers
    }

    pub fn add_transfer_complete(
        &mut self,
        command_key: &str,
        fault_code: &str,
        fault_string: &str,
        start_time: &str,
        method_id: u32,
    ) -> Result<u32> {
        let id = self.mint_id();
        self.transfers.push(TransferRecord {
            id,
            command_key: command_key.to_string(),
            fault_code: fault_code.to_string(),
            fault_string: fault_string.to_string(),
            start_time: start_time.to_string(),
            complete_time: UNKNOWN_TIME.to_string(),
            method_id,
        });
        self.save()?;
        Ok(id)
    }

    pub fn set_transfer_complete_time(&mut self, id: u32, complete_time: &str) -> Result<()> {
        let record = self
            .transfers
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| Error::backup(format!("no transfer record {}", id)))?;
        record.complete_time = complete_time.to_string();
        self.save()
    }

    /// Startup pass: a sentinel complete-time means the reboot itself
    /// finished the transfer, so stamp it with the current time.
    pub fn retrofit_complete_times(&mut self, now: &str) -> Result<usize> {
        let mut changed = 0;
        for record in &mut self.transfers {
            if record.complete_time == UNKNOWN_TIME {
                record.complete_time = now.to_string();
                changed += 1;
            }
        }
        if changed > 0 {
            self.save()?;
        }
        Ok(changed)
    }

    pub fn remove_transfer_complete(&mut self, id: u32) -> Result<()> {
        self.transfers.retain(|t| t.id != id);
        self.save()
    }

    pub fn downloads(&self) -> &[StoredDownload] {
        &self.downloads
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_download(
        &mut self,
        command_key: &str,
        file_type: &str,
        url: &str,
        username: &str,
        password: &str,
        file_size: &str,
        time_execute: i64,
    ) -> Result<u32> {
        let id = self.mint_id();
        self.downloads.push(StoredDownload {
            id,
            command_key: command_key.to_string(),
            file_type: file_type.to_string(),
            url: url.to_string(),
            username: username.to_string(),
            password: password.to_string(),
            file_size: file_size.to_string(),
            time_execute,
        });
        self.save()?;
        Ok(id)
    }

    pub fn remove_download(&mut self, id: u32) -> Result<()> {
        self.downloads.retain(|d| d.id != id);
        self.save()
    }

    pub fn uploads(&self) -> &[StoredUpload] {
        &self.uploads
    }

    pub fn add_upload(
        &mut self,
        command_key: &str,
        file_type: &str,
        url: &str,
        username: &str,
        password: &str,
        time_execute: i64,
    ) -> Result<u32> {
        let id = self.mint_id();
        self.uploads.push(StoredUpload {
            id,
            command_key: command_key.to_string(),
            file_type: file_type.to_string(),
            url: url.to_string(),
            username: username.to_string(),
            password: password.to_string(),
            time_execute,
        });
        self.save()?;
        Ok(id)
    }

    pub fn remove_upload(&mut self, id: u32) -> Result<()> {
        self.uploads.retain(|u| u.id != id);
        self.save()
    }
}

fn text_of(elem: &Element, local: &str) -> String {
    elem.find_local(local)
        .map(|e| e.text.clone())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store_in(dir: &tempfile::TempDir) -> BackupStore {
        BackupStore::load(dir.path().join(".backup.xml"))
    }

    #[test]
    fn starts_empty_without_a_file() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);
        assert!(store.acs_url().is_none());
        assert!(store.events().is_empty());
    }

    #[test]
    fn roundtrips_every_record_type() {
        let dir = tempdir().unwrap();
        let mut store = store_in(&dir);

        store.set_acs_url("http://acs.example/acs").unwrap();
        store.set_software_version("2.1.0").unwrap();
        store.add_event(1, None, 0).unwrap();
        store.add_event(11, Some("r1"), 0).unwrap();
        store
            .add_transfer_complete("fw1", "0", "", "2026-01-01T00:00:00Z", 4)
            .unwrap();
        store
            .add_download("fw1", "1 Firmware Upgrade Image", "http://srv/fw.bin", "u", "p", "1048576", 1700000000)
            .unwrap();
        store
            .add_upload("cfg1", "1 Vendor Configuration File", "http://srv/up", "", "", 1700000500)
            .unwrap();

        let reloaded = store_in(&dir);
        assert_eq!(reloaded.acs_url(), Some("http://acs.example/acs"));
        assert_eq!(reloaded.software_version(), Some("2.1.0"));
        assert_eq!(reloaded.events().len(), 2);
        assert_eq!(reloaded.events()[1].key.as_deref(), Some("r1"));
        assert_eq!(reloaded.transfer_completes().len(), 1);
        assert_eq!(reloaded.transfer_completes()[0].command_key, "fw1");
        assert_eq!(reloaded.transfer_completes()[0].complete_time, UNKNOWN_TIME);
        assert_eq!(reloaded.transfer_completes()[0].method_id, 4);
        assert_eq!(reloaded.downloads().len(), 1);
        assert_eq!(reloaded.downloads()[0].time_execute, 1700000000);
        assert_eq!(reloaded.uploads().len(), 1);
        assert_eq!(reloaded.uploads()[0].command_key, "cfg1");
    }

    #[test]
    fn rendered_document_is_single_line_and_parseable() {
        let dir = tempdir().unwrap();
        let mut store = store_in(&dir);
        store.set_acs_url("http://acs.example/acs").unwrap();
        store.add_event(2, None, 0).unwrap();

        let on_disk = fs::read_to_string(dir.path().join(".backup.xml")).unwrap();
        assert!(!on_disk.contains('\n'));
        let root = Element::parse(&on_disk).unwrap();
        assert_eq!(root.local_name(), "backup_file");
        assert_eq!(root.children[0].name, "acs_url");
        assert_eq!(root.children[1].name, "cwmp");
    }

    #[test]
    fn acs_url_change_resets_protocol_state() {
        let dir = tempdir().unwrap();
        let mut store = store_in(&dir);
        store.set_acs_url("http://old/acs").unwrap();
        store.add_event(1, None, 0).unwrap();
        store
            .add_transfer_complete("k", "0", "", "t", 1)
            .unwrap();

        store.set_acs_url("http://new/acs").unwrap();
        assert!(store.events().is_empty());
        assert!(store.transfer_completes().is_empty());
        assert_eq!(store.acs_url(), Some("http://new/acs"));
    }

    #[test]
    fn retrofit_stamps_only_sentinel_times() {
        let dir = tempdir().unwrap();
        let mut store = store_in(&dir);
        store.set_acs_url("http://acs/acs").unwrap();
        let pending = store
            .add_transfer_complete("a", "0", "", "t0", 1)
            .unwrap();
        let done = store
            .add_transfer_complete("b", "9010", "Download failure", "t0", 2)
            .unwrap();
        store
            .set_transfer_complete_time(done, "2026-02-01T00:00:00Z")
            .unwrap();

        let changed = store.retrofit_complete_times("2026-03-01T00:00:00Z").unwrap();
        assert_eq!(changed, 1);
        let records = store.transfer_completes();
        let a = records.iter().find(|r| r.id == pending).unwrap();
        let b = records.iter().find(|r| r.id == done).unwrap();
        assert_eq!(a.complete_time, "2026-03-01T00:00:00Z");
        assert_eq!(b.complete_time, "2026-02-01T00:00:00Z");
    }

    #[test]
    fn corrupt_file_is_preserved_on_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".backup.xml");
        fs::write(&path, "<backup_file><cwmp>").unwrap();

        let store = BackupStore::load(&path);
        assert!(store.events().is_empty());
        assert_eq!(fs::read_to_string(&path).unwrap(), "<backup_file><cwmp>");
    }

    #[test]
    fn values_with_markup_characters_survive() {
        let dir = tempdir().unwrap();
        let mut store = store_in(&dir);
        store.set_acs_url("http://acs/acs?a=1&b=2").unwrap();
        store
            .add_download("k<1>", "1 Firmware \"Upgrade\"", "http://s/f?x=1&y=2", "u&u", "p<p", "0", 1)
            .unwrap();

        let reloaded = store_in(&dir);
        assert_eq!(reloaded.acs_url(), Some("http://acs/acs?a=1&b=2"));
        assert_eq!(reloaded.downloads()[0].command_key, "k<1>");
        assert_eq!(reloaded.downloads()[0].username, "u&u");
    }
}
