//! Daemon orchestrator: one cooperative loop around the session engine
//!
//! All mutable protocol state lives in [`Engine`]; the [`Daemon`] drives it
//! from a single loop that multiplexes trigger messages with the armed
//! timers (periodic inform, retry, scheduled informs, transfer fire times).
//! Sessions run inline, so a second inform can never start while one is in
//! flight; triggers arriving meanwhile only queue events.

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::config::AgentConfig;
use crate::core::events::{EventCode, EventQueue, RemovePolicy};
use crate::core::session::{
    periodic_due_in, retry_delay_secs, SessionState, ENDS_FACTORY_RESET, ENDS_REBOOT,
    ENDS_RELOAD_CONFIG,
};
use crate::core::transfers::{
    next_scheduled_at, pop_due_scheduled, DueTransfer, ScheduledInform, TransferQueue,
};
use crate::protocols::soap::{CwmpFault, DeviceId, ParameterValue};
use crate::services::backup::BackupStore;
use crate::services::datamodel::{DataModelProvider, TransferRequest};
use crate::utils::time::{epoch_now, now_iso8601, parse_config_time};
use crate::{Error, Result};

/// Wake-up messages posted by trigger sources into the daemon loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// Run a session without queueing anything new.
    Inform,
    /// Queue the given event, then run a session.
    Event(EventCode),
    /// Poll the provider for parameter changes.
    Notify,
    /// Reload the configuration.
    Reload,
    /// Leave the loop.
    Stop,
}

/// The whole mutable state of the agent, built once at startup and threaded
/// through every component.
pub struct Engine {
    pub config: AgentConfig,
    pub config_path: Option<PathBuf>,
    pub device_id: DeviceId,
    pub backup: BackupStore,
    pub events: EventQueue,
    pub notifications: Vec<ParameterValue>,
    pub transfers: TransferQueue,
    pub scheduled_informs: Vec<ScheduledInform>,
    pub session: SessionState,
    pub provider: Box<dyn DataModelProvider + Send>,
}

impl Engine {
    pub fn new(
        config: AgentConfig,
        config_path: Option<PathBuf>,
        device_id: DeviceId,
        backup: BackupStore,
        provider: Box<dyn DataModelProvider + Send>,
    ) -> Self {
        let session = SessionState::new(&config.acs.url);
        Self {
            config,
            config_path,
            device_id,
            backup,
            events: EventQueue::new(),
            notifications: Vec::new(),
            transfers: TransferQueue::new(),
            scheduled_informs: Vec::new(),
            session,
            provider,
        }
    }

    /// Queue an event, persisting it when the code calls for it. A
    /// BOOTSTRAP wipes every prior event first.
    pub fn add_event(
        &mut self,
        code: EventCode,
        key: Option<String>,
        method_id: u32,
        persist: bool,
    ) -> Result<()> {
        if code == EventCode::Bootstrap {
            self.events.clear();
            self.backup.clear_protocol_state()?;
        }
        if code.is_single() && self.events.contains(code) {
            return Ok(());
        }
        let backup_id = if persist && code.persisted() {
            Some(
                self.backup
                    .add_event(code.index(), key.as_deref(), method_id)?,
            )
        } else {
            None
        };
        self.events.add(code, key, method_id, backup_id);
        Ok(())
    }

    /// Reconcile the backup document with the running configuration: a
    /// changed ACS URL re-bootstraps, a changed software version reports a
    /// value change. Returns whether an inform became due.
    fn reconcile_backup(&mut self) -> Result<bool> {
        let mut inform = false;

        let configured = self.config.acs.url.clone();
        let stored_url = self.backup.acs_url().map(str::to_string);
        match stored_url.as_deref() {
            Some(stored) if stored == configured => {}
            Some(_) => {
                // A different server owns the device now; the protocol state
                // belongs to the old one.
                info!("ACS URL changed, re-bootstrapping against {}", configured);
                self.events.clear();
                self.backup.set_acs_url(&configured)?;
                self.session.acs_url = configured;
                self.add_event(EventCode::Bootstrap, None, 0, true)?;
                inform = true;
            }
            None => {
                self.backup.set_acs_url(&configured)?;
                self.session.acs_url = configured;
            }
        }

        let version = self.config.device.software_version.clone();
        let stored_version = self.backup.software_version().map(str::to_string);
        if stored_version.as_deref() != Some(version.as_str()) {
            if stored_version.is_some() {
                info!("software version changed to {}", version);
                self.add_event(EventCode::ValueChange, None, 0, false)?;
                inform = true;
            }
            self.backup.set_software_version(&version)?;
        }

        Ok(inform)
    }

    /// Bring persisted state back to life after a restart and apply the
    /// start-event flags. Returns whether an inform is already due.
    pub fn startup(&mut self, boot_event: bool, get_rpc_methods: bool) -> Result<bool> {
        let mut inform = false;

        let retrofitted = self.backup.retrofit_complete_times(&now_iso8601())?;
        if retrofitted > 0 {
            info!(
                "{} interrupted transfer(s) completed by the reboot",
                retrofitted
            );
        }

        inform |= self.reconcile_backup()?;

        for stored in self.backup.events().to_vec() {
            let code = match EventCode::from_index(stored.code) {
                Some(code) => code,
                None => {
                    warn!("backup carries unknown event number {}", stored.code);
                    continue;
                }
            };
            self.events
                .add(code, stored.key.clone(), stored.method_id, Some(stored.id));
            inform = true;
        }

        for d in self.backup.downloads().to_vec() {
            self.transfers.add_download(crate::core::transfers::PendingDownload {
                backup_id: d.id,
                command_key: d.command_key,
                file_type: d.file_type,
                url: d.url,
                username: d.username,
                password: d.password,
                file_size: d.file_size,
                time_execute: d.time_execute,
            });
        }
        for u in self.backup.uploads().to_vec() {
            self.transfers.add_upload(crate::core::transfers::PendingUpload {
                backup_id: u.id,
                command_key: u.command_key,
                file_type: u.file_type,
                url: u.url,
                username: u.username,
                password: u.password,
                time_execute: u.time_execute,
            });
        }

        if !self.backup.transfer_completes().is_empty() {
            inform = true;
        }

        if boot_event {
            self.add_event(EventCode::Boot, None, 0, true)?;
            inform = true;
        }
        if get_rpc_methods {
            self.session.get_rpc_methods = true;
            self.add_event(EventCode::Periodic, None, 0, true)?;
            inform = true;
        }

        Ok(inform)
    }

    /// Reload the configuration in place. A failed reload keeps the old
    /// configuration running. Returns whether an inform became due.
    pub async fn reload_config(&mut self) -> bool {
        info!("configuration reload");
        let loaded = match &self.config_path {
            Some(path) => AgentConfig::load_from_file(path),
            None => AgentConfig::load_from_env(),
        };
        let config = match loaded.and_then(|c| c.validate().map(|_| c)) {
            Ok(config) => config,
            Err(e) => {
                error!("configuration reload failed, keeping the old one: {}", e);
                return false;
            }
        };
        self.config = config;

        let mut inform = match self.reconcile_backup() {
            Ok(inform) => inform,
            Err(e) => {
                error!("backup reconciliation failed: {}", e);
                false
            }
        };
        inform |= self.poll_value_change().await;
        inform
    }

    /// Run a due transfer through the executor and turn the outcome into a
    /// persisted transfer-complete record plus its M-event.
    pub async fn launch_transfer(&mut self, due: DueTransfer) {
        match due {
            DueTransfer::Download(d) => {
                info!("launching download '{}' from {}", d.command_key, d.url);
                let start_time = now_iso8601();
                let request = TransferRequest {
                    url: d.url.clone(),
                    file_type: d.file_type.clone(),
                    file_size: d.file_size.clone(),
                    username: d.username.clone(),
                    password: d.password.clone(),
                };
                let fault = match self.provider.download(&request).await {
                    Ok(fault) => fault,
                    Err(e) => {
                        warn!("download execution failed: {}", e);
                        CwmpFault::DownloadFailure
                    }
                };
                if let Err(e) = self.backup.remove_download(d.backup_id) {
                    warn!("cannot drop pending download from backup: {}", e);
                }
                self.record_transfer_result(
                    EventCode::MDownload,
                    &d.command_key,
                    fault,
                    &start_time,
                );
            }
            DueTransfer::Upload(u) => {
                info!("launching upload '{}' to {}", u.command_key, u.url);
                let start_time = now_iso8601();
                let request = TransferRequest {
                    url: u.url.clone(),
                    file_type: u.file_type.clone(),
                    file_size: String::new(),
                    username: u.username.clone(),
                    password: u.password.clone(),
                };
                let fault = match self.provider.upload(&request).await {
                    Ok(fault) => fault,
                    Err(e) => {
                        warn!("upload execution failed: {}", e);
                        CwmpFault::UploadFailure
                    }
                };
                if let Err(e) = self.backup.remove_upload(u.backup_id) {
                    warn!("cannot drop pending upload from backup: {}", e);
                }
                self.record_transfer_result(EventCode::MUpload, &u.command_key, fault, &start_time);
            }
        }
    }

    fn record_transfer_result(
        &mut self,
        event: EventCode,
        command_key: &str,
        fault: CwmpFault,
        start_time: &str,
    ) {
        let method_id = self.session.next_method_id();
        match self.backup.add_transfer_complete(
            command_key,
            fault.code(),
            fault.text(),
            start_time,
            method_id,
        ) {
            Ok(record_id) => {
                if let Err(e) = self
                    .backup
                    .set_transfer_complete_time(record_id, &now_iso8601())
                {
                    warn!("cannot stamp transfer completion: {}", e);
                }
            }
            Err(e) => error!("cannot persist transfer-complete record: {}", e),
        }
        if let Err(e) = self.add_event(EventCode::TransferComplete, None, method_id, true) {
            warn!("cannot queue transfer-complete event: {}", e);
        }
        if let Err(e) = self.add_event(event, Some(command_key.to_string()), method_id, true) {
            warn!("cannot queue transfer event: {}", e);
        }
    }

    /// A ScheduleInform fired: report the scheduled event with its key.
    pub fn fire_scheduled_inform(&mut self, scheduled: ScheduledInform) {
        info!("scheduled inform '{}' fired", scheduled.command_key);
        if let Err(e) = self.add_event(
            EventCode::Scheduled,
            Some(scheduled.command_key.clone()),
            0,
            true,
        ) {
            warn!("cannot queue scheduled event: {}", e);
        }
        if let Err(e) = self.add_event(
            EventCode::MScheduleInform,
            Some(scheduled.command_key),
            0,
            true,
        ) {
            warn!("cannot queue schedule-inform event: {}", e);
        }
    }

    /// Execute the deferred end-of-session actions. Runs after every
    /// session, successful or not.
    pub async fn run_end_session(&mut self) -> bool {
        let ends = std::mem::take(&mut self.session.end_session);
        let mut inform = false;
        if ends & ENDS_RELOAD_CONFIG != 0 {
            inform |= self.reload_config().await;
        }
        if ends & ENDS_FACTORY_RESET != 0 {
            info!("end of session: factory reset");
            if let Err(e) = self.provider.factory_reset().await {
                error!("factory reset failed: {}", e);
            }
        }
        if ends & ENDS_REBOOT != 0 {
            info!("end of session: reboot");
            if let Err(e) = self.provider.reboot().await {
                error!("reboot failed: {}", e);
            }
        }
        inform
    }

    fn periodic_time_epoch(&self) -> Option<i64> {
        self.config
            .acs
            .periodic_time
            .as_deref()
            .and_then(|t| parse_config_time(t).ok())
            .map(|t| t.timestamp())
    }
}

pub struct Daemon {
    engine: Engine,
    trigger_rx: mpsc::UnboundedReceiver<Trigger>,
    pending_inform: bool,
    retry_at: Option<Instant>,
    periodic_at: Option<Instant>,
}

impl Daemon {
    pub fn new(
        engine: Engine,
        trigger_rx: mpsc::UnboundedReceiver<Trigger>,
        inform_pending: bool,
    ) -> Self {
        let mut daemon = Self {
            engine,
            trigger_rx,
            pending_inform: inform_pending,
            retry_at: None,
            periodic_at: None,
        };
        daemon.arm_periodic();
        daemon
    }

    /// Always re-armed after each session end.
    fn arm_periodic(&mut self) {
        if !self.engine.config.acs.periodic_enable {
            self.periodic_at = None;
            return;
        }
        let interval = i64::from(self.engine.config.acs.periodic_interval);
        let phase = self.engine.periodic_time_epoch();
        self.periodic_at = periodic_due_in(epoch_now(), phase, interval)
            .map(|secs| Instant::now() + Duration::from_secs(secs as u64));
    }

    fn next_deadline(&self) -> Instant {
        let now_epoch = epoch_now();
        let mut deadline = Instant::now() + Duration::from_secs(24 * 3600);

        for candidate in [self.retry_at, self.periodic_at] {
            if let Some(at) = candidate {
                deadline = deadline.min(at);
            }
        }
        for fire_at in [
            self.engine.transfers.next_fire_at(),
            next_scheduled_at(&self.engine.scheduled_informs),
        ]
        .into_iter()
        .flatten()
        {
            let delta = (fire_at - now_epoch).max(0) as u64;
            deadline = deadline.min(Instant::now() + Duration::from_secs(delta));
        }
        deadline
    }

    /// A session that stalls past the periodic schedule is abandoned; the
    /// event queue is left intact for the retry.
    fn session_deadline(&self) -> Duration {
        if self.engine.config.acs.periodic_enable && self.engine.config.acs.periodic_interval > 0 {
            Duration::from_secs(u64::from(self.engine.config.acs.periodic_interval))
        } else {
            Duration::from_secs(4 * 3600)
        }
    }

    async fn run_session_once(&mut self) {
        let deadline = self.session_deadline();
        let outcome = match tokio::time::timeout(deadline, self.engine.run_session()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::timeout("session abandoned: deadline elapsed")),
        };

        match outcome {
            Ok(()) => {
                self.retry_at = None;
            }
            Err(e) => {
                warn!("session failed: {}", e);
                self.engine.session.retry_count += 1;
                let dropped =
                    self.engine
                        .events
                        .remove_by_policy(RemovePolicy::NoRetry, None, None);
                if let Err(e) = self.engine.backup.remove_events(&dropped) {
                    warn!("cannot drop no-retry events from backup: {}", e);
                }
                let delay = retry_delay_secs(self.engine.session.retry_count);
                info!(
                    "retry {} scheduled in {:.1}s",
                    self.engine.session.retry_count, delay
                );
                self.retry_at = Some(Instant::now() + Duration::from_secs_f64(delay));
            }
        }

        if self.engine.run_end_session().await {
            self.pending_inform = true;
        }
        self.arm_periodic();
    }

    async fn handle_trigger(&mut self, trigger: Trigger) -> bool {
        match trigger {
            Trigger::Inform => {
                self.pending_inform = true;
            }
            Trigger::Event(code) => {
                if let Err(e) = self.engine.add_event(code, None, 0, true) {
                    warn!("cannot queue {} event: {}", code.as_str(), e);
                }
                self.pending_inform = true;
            }
            Trigger::Notify => {
                if self.engine.poll_value_change().await {
                    self.pending_inform = true;
                }
            }
            Trigger::Reload => {
                if self.engine.reload_config().await {
                    self.pending_inform = true;
                }
                self.arm_periodic();
            }
            Trigger::Stop => {
                info!("stop requested");
                return false;
            }
        }
        true
    }

    /// The central loop. Returns when a stop is requested or every trigger
    /// sender is gone.
    pub async fn run(&mut self) -> Result<()> {
        info!("entering main loop");
        loop {
            let now = epoch_now();

            while let Some(due) = self.engine.transfers.pop_due(now) {
                self.engine.launch_transfer(due).await;
                self.pending_inform = true;
            }
            while let Some(scheduled) = pop_due_scheduled(&mut self.engine.scheduled_informs, now)
            {
                self.engine.fire_scheduled_inform(scheduled);
                self.pending_inform = true;
            }
            if let Some(at) = self.periodic_at {
                if at <= Instant::now() {
                    self.periodic_at = None;
                    if let Err(e) = self.engine.add_event(EventCode::Periodic, None, 0, true) {
                        warn!("cannot queue periodic event: {}", e);
                    }
                    self.pending_inform = true;
                }
            }
            if let Some(at) = self.retry_at {
                if at <= Instant::now() {
                    self.retry_at = None;
                    self.pending_inform = true;
                }
            }

            if self.pending_inform {
                self.pending_inform = false;
                self.run_session_once().await;
                continue;
            }

            let deadline = self.next_deadline();
            tokio::select! {
                trigger = self.trigger_rx.recv() => {
                    match trigger {
                        None => return Ok(()),
                        Some(trigger) => {
                            if !self.handle_trigger(trigger).await {
                                return Ok(());
                            }
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::datamodel::testing::NullProvider;
    use tempfile::TempDir;

    fn engine_with(dir: &TempDir, provider: NullProvider) -> Engine {
        let config = AgentConfig::default_config();
        let backup = BackupStore::load(dir.path().join(".backup.xml"));
        Engine::new(config, None, DeviceId::default(), backup, Box::new(provider))
    }

    #[tokio::test]
    async fn first_run_records_the_acs_url_without_bootstrapping() {
        let dir = TempDir::new().unwrap();
        let mut engine = engine_with(&dir, NullProvider::default());

        let inform = engine.startup(false, false).unwrap();
        assert!(!inform);
        assert!(engine.events.is_empty());
        assert_eq!(
            engine.backup.acs_url(),
            Some(engine.config.acs.url.as_str())
        );
    }

    #[tokio::test]
    async fn changed_acs_url_rebootstraps_and_drops_old_state() {
        let dir = TempDir::new().unwrap();
        {
            let mut engine = engine_with(&dir, NullProvider::default());
            engine.startup(false, false).unwrap();
            engine
                .add_event(EventCode::MReboot, Some("old".to_string()), 0, true)
                .unwrap();
        }

        let mut engine = engine_with(&dir, NullProvider::default());
        engine.config.acs.url = "http://other-acs.example/acs".to_string();
        let inform = engine.startup(false, false).unwrap();

        assert!(inform);
        assert!(engine.events.contains(EventCode::Bootstrap));
        assert!(!engine.events.contains(EventCode::MReboot));
        assert_eq!(engine.backup.acs_url(), Some("http://other-acs.example/acs"));
        assert_eq!(engine.session.acs_url, "http://other-acs.example/acs");
    }

    #[tokio::test]
    async fn boot_flag_queues_a_persistent_boot_event() {
        let dir = TempDir::new().unwrap();
        let mut engine = engine_with(&dir, NullProvider::default());

        engine.startup(true, false).unwrap();
        assert!(engine.events.contains(EventCode::Boot));
        assert!(engine
            .backup
            .events()
            .iter()
            .any(|e| e.code == EventCode::Boot.index()));
    }

    #[tokio::test]
    async fn get_rpc_method_flag_arms_the_request_and_a_periodic_event() {
        let dir = TempDir::new().unwrap();
        let mut engine = engine_with(&dir, NullProvider::default());

        engine.startup(false, true).unwrap();
        assert!(engine.session.get_rpc_methods);
        assert!(engine.events.contains(EventCode::Periodic));
    }

    #[tokio::test]
    async fn persisted_events_and_transfers_survive_a_restart() {
        let dir = TempDir::new().unwrap();
        {
            let mut engine = engine_with(&dir, NullProvider::default());
            engine.startup(false, false).unwrap();
            engine
                .add_event(EventCode::MReboot, Some("r1".to_string()), 0, true)
                .unwrap();
            engine
                .backup
                .add_download("fw", "1 Firmware Upgrade Image", "http://s/f", "", "", "0", 42)
                .unwrap();
        }

        let mut engine = engine_with(&dir, NullProvider::default());
        let inform = engine.startup(true, false).unwrap();
        assert!(inform);
        assert!(engine.events.contains(EventCode::MReboot));
        assert!(engine.events.contains(EventCode::Boot));
        assert_eq!(engine.transfers.download_count(), 1);
    }

    #[tokio::test]
    async fn software_version_change_reports_a_value_change() {
        let dir = TempDir::new().unwrap();
        {
            let mut engine = engine_with(&dir, NullProvider::default());
            engine.startup(false, false).unwrap();
        }

        let mut engine = engine_with(&dir, NullProvider::default());
        engine.config.device.software_version = "99.0".to_string();
        engine.startup(false, false).unwrap();
        assert!(engine.events.contains(EventCode::ValueChange));
        assert!(!engine.events.contains(EventCode::Bootstrap));
        assert_eq!(engine.backup.software_version(), Some("99.0"));
    }

    #[tokio::test]
    async fn connection_request_events_are_never_persisted() {
        let dir = TempDir::new().unwrap();
        let mut engine = engine_with(&dir, NullProvider::default());
        engine.startup(false, false).unwrap();
        let persisted = engine.backup.events().len();

        engine
            .add_event(EventCode::ConnectionRequest, None, 0, true)
            .unwrap();
        assert!(engine.events.contains(EventCode::ConnectionRequest));
        assert_eq!(engine.backup.events().len(), persisted);
    }

    #[tokio::test]
    async fn completed_download_yields_record_event_and_inform_linkage() {
        let dir = TempDir::new().unwrap();
        let mut engine = engine_with(&dir, NullProvider::default());
        engine.startup(false, false).unwrap();

        let backup_id = engine
            .backup
            .add_download("fw1", "1 Firmware Upgrade Image", "http://srv/fw.bin", "", "", "1048576", 0)
            .unwrap();
        engine
            .transfers
            .add_download(crate::core::transfers::PendingDownload {
                backup_id,
                command_key: "fw1".to_string(),
                file_type: "1 Firmware Upgrade Image".to_string(),
                url: "http://srv/fw.bin".to_string(),
                username: String::new(),
                password: String::new(),
                file_size: "1048576".to_string(),
                time_execute: 0,
            });

        let due = engine.transfers.pop_due(epoch_now()).unwrap();
        engine.launch_transfer(due).await;

        assert!(engine.backup.downloads().is_empty());
        let records = engine.backup.transfer_completes();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].command_key, "fw1");
        assert_eq!(records[0].fault_code, "0");
        assert_ne!(records[0].complete_time, crate::utils::time::UNKNOWN_TIME);

        let method_id = records[0].method_id;
        let linked: Vec<_> = engine
            .events
            .iter()
            .filter(|e| e.method_id == method_id)
            .collect();
        assert!(linked.iter().any(|e| e.code == EventCode::MDownload));
        assert!(linked.iter().any(|e| e.code == EventCode::TransferComplete));
    }

    #[tokio::test]
    async fn failed_download_records_the_transfer_fault() {
        let dir = TempDir::new().unwrap();
        let mut engine = engine_with(
            &dir,
            NullProvider {
                download_fault: CwmpFault::FileServerUnreachable,
                ..Default::default()
            },
        );
        engine.startup(false, false).unwrap();

        engine
            .transfers
            .add_download(crate::core::transfers::PendingDownload {
                backup_id: 0,
                command_key: "bad".to_string(),
                file_type: "t".to_string(),
                url: "http://unreachable/f".to_string(),
                username: String::new(),
                password: String::new(),
                file_size: "0".to_string(),
                time_execute: 0,
            });
        let due = engine.transfers.pop_due(epoch_now()).unwrap();
        engine.launch_transfer(due).await;

        let records = engine.backup.transfer_completes();
        assert_eq!(records[0].fault_code, "9015");
        assert_eq!(
            records[0].fault_string,
            "Download failure: unable to contact file server"
        );
    }
}
