//! The CWMP session state machine
//!
//! One session at a time: Inform, response handling, pending CPE requests
//! (GetRPCMethods, TransferComplete in record order), then the empty-POST
//! loop serving ACS requests until the ACS has nothing left to say.

use rand::Rng;
use tracing::{info, warn};

use crate::core::daemon::Engine;
use crate::core::events::{EventCode, RemovePolicy};
use crate::protocols::rpc::RpcContext;
use crate::protocols::soap::{
    self, AcsReply, Namespaces, ParameterValue,
};
use crate::protocols::{rpc, xml};
use crate::services::acs::AcsClient;
use crate::services::datamodel::ParameterRecord;
use crate::utils::time::now_iso8601;
use crate::{Error, Result};

/// Deferred device actions executed once the session terminates.
pub const ENDS_REBOOT: u8 = 0x01;
pub const ENDS_FACTORY_RESET: u8 = 0x02;
pub const ENDS_RELOAD_CONFIG: u8 = 0x04;

/// Retry backoff ceiling: four hours.
pub const RETRY_MAX_SECS: f64 = 4.0 * 3600.0;

/// Process-wide mutable protocol state.
#[derive(Debug)]
pub struct SessionState {
    pub retry_count: u32,
    pub end_session: u8,
    pub hold_requests: bool,
    pub get_rpc_methods: bool,
    /// Next correlation id minted for an outstanding M-RPC.
    pub method_id: u32,
    /// Monotonic outgoing `cwmp:ID` counter.
    message_id: u32,
    /// Persistent ACS URL; session redirects never touch this.
    pub acs_url: String,
    /// Namespace bindings learned from the most recent ACS envelope.
    pub namespaces: Option<Namespaces>,
}

impl SessionState {
    pub fn new(acs_url: &str) -> Self {
        Self {
            retry_count: 0,
            end_session: 0,
            hold_requests: false,
            get_rpc_methods: false,
            method_id: 0,
            message_id: 0,
            acs_url: acs_url.to_string(),
            namespaces: None,
        }
    }

    pub fn next_message_id(&mut self) -> String {
        self.message_id = self.message_id.wrapping_add(1);
        self.message_id.to_string()
    }

    pub fn next_method_id(&mut self) -> u32 {
        self.method_id += 1;
        self.method_id
    }
}

/// Backoff after the Nth consecutive failure:
/// `min(5 * 2^(N-1), 4h)` seconds, jittered by ±10 % and never above the
/// four-hour ceiling.
pub fn retry_delay_secs(retry_count: u32) -> f64 {
    let n = retry_count.max(1);
    let base = (5.0 * 2f64.powi(n as i32 - 1)).min(RETRY_MAX_SECS);
    let jitter = 0.9 + 0.2 * rand::thread_rng().gen::<f64>();
    (base * jitter).min(RETRY_MAX_SECS)
}

/// Seconds until the next periodic inform. The schedule is phase-locked to
/// `periodic_time` (UTC); an unset phase reference means "now".
pub fn periodic_due_in(now: i64, periodic_time: Option<i64>, interval: i64) -> Option<i64> {
    if interval <= 0 {
        return None;
    }
    let phase = periodic_time.unwrap_or(now);
    let next = phase + ((now - phase).div_euclid(interval) + 1) * interval;
    Some((next - now).max(0))
}

fn records_to_values(records: Vec<ParameterRecord>) -> Vec<ParameterValue> {
    records
        .into_iter()
        .filter(|r| !r.is_fault())
        .map(|r| ParameterValue {
            name: r.name,
            value: r.data,
            xsi_type: r.xsi_type,
        })
        .collect()
}

impl Engine {
    /// Ask the provider which parameters changed and stage them as
    /// notifications. A detected change also queues a `4 VALUE CHANGE`
    /// event (transient, never persisted).
    pub async fn poll_value_change(&mut self) -> bool {
        let records = match self.provider.check_value_change().await {
            Ok(records) => records,
            Err(e) => {
                warn!("value-change poll failed: {}", e);
                return false;
            }
        };

        let mut changed = false;
        for record in records {
            if record.is_fault() || record.name.is_empty() {
                continue;
            }
            changed = true;
            let value = ParameterValue {
                name: record.name,
                value: record.data,
                xsi_type: record.xsi_type,
            };
            match self.notifications.iter_mut().find(|n| n.name == value.name) {
                Some(existing) => *existing = value,
                None => self.notifications.push(value),
            }
        }

        if changed {
            self.events.add(EventCode::ValueChange, None, 0, None);
        }
        changed
    }

    /// Run one full session against the ACS. `Ok` ends the session cleanly;
    /// `Err` marks it failed and the caller schedules the retry.
    pub async fn run_session(&mut self) -> Result<()> {
        let mut client = AcsClient::new(&self.config.acs, &self.session.acs_url)?;

        self.poll_value_change().await;

        // The Inform body is a snapshot: events added while the session is
        // running surface in the next one.
        let snapshot = self.events.snapshot_ids();
        let events_body = self.events.inform_body(&snapshot);
        let parameters = records_to_values(
            self.provider
                .inform_parameters()
                .await
                .map_err(|e| Error::bridge(format!("inform parameter read failed: {}", e)))?,
        );

        let inform = soap::render_inform(
            &self.session.next_message_id(),
            &self.device_id,
            &events_body,
            &parameters,
            &self.notifications,
            &now_iso8601(),
            self.session.retry_count,
        );

        info!(
            "sending Inform with {} event(s) to {}",
            events_body.len(),
            client.url()
        );
        let response = client
            .send(Some(inform))
            .await?
            .ok_or_else(|| Error::protocol("ACS answered Inform with an empty response"))?;

        match soap::parse_inform_response(&response)? {
            AcsReply::Retry8005 => {
                return Err(Error::protocol("ACS asked for a session retry (8005)"))
            }
            AcsReply::Ok { hold_requests } => self.session.hold_requests = hold_requests,
        }

        // Reported notifications are consumed by the accepted Inform.
        self.notifications.clear();

        if !self.session.hold_requests {
            self.send_get_rpc_methods(&mut client).await?;
            self.deliver_transfer_completes(&mut client).await?;
        }

        // Empty POST, then serve ACS requests until it stops sending them.
        let mut outgoing: Option<String> = None;
        loop {
            let response = client.send(outgoing.take()).await?;
            let request = match response {
                None => break,
                Some(xml) => xml,
            };
            let mut ctx = RpcContext {
                provider: self.provider.as_mut(),
                backup: &mut self.backup,
                events: &mut self.events,
                transfers: &mut self.transfers,
                scheduled: &mut self.scheduled_informs,
                session: &mut self.session,
            };
            outgoing = Some(rpc::handle_message(&mut ctx, &request).await?);
        }

        let mut dropped = self
            .events
            .remove_by_policy(RemovePolicy::AfterInform, Some(&snapshot), None);
        dropped.extend(
            self.events
                .remove_by_policy(RemovePolicy::NoRetry, Some(&snapshot), None),
        );
        self.backup.remove_events(&dropped)?;
        self.session.retry_count = 0;

        info!("session completed");
        Ok(())
    }

    async fn send_get_rpc_methods(&mut self, client: &mut AcsClient) -> Result<()> {
        if !self.session.get_rpc_methods {
            return Ok(());
        }
        let message = soap::render_get_rpc_methods(&self.session.next_message_id());
        let response = client
            .send(Some(message))
            .await?
            .ok_or_else(|| Error::protocol("ACS answered GetRPCMethods with an empty response"))?;
        match soap::parse_rpc_response(&response)? {
            AcsReply::Retry8005 => {
                return Err(Error::protocol("ACS asked for a session retry (8005)"))
            }
            AcsReply::Ok { hold_requests } => self.session.hold_requests = hold_requests,
        }
        if let Ok(root) = xml::Element::parse(&response) {
            if let Some(list) = root.find_local("MethodList") {
                info!("ACS supports {} method(s)", list.children.len());
            }
        }
        self.session.get_rpc_methods = false;
        Ok(())
    }

    /// Deliver pending transfer-complete records in insertion order. Each
    /// acknowledged record is removed together with the events tied to its
    /// method id.
    async fn deliver_transfer_completes(&mut self, client: &mut AcsClient) -> Result<()> {
        let records = self.backup.transfer_completes().to_vec();
        for record in records {
            let message = soap::render_transfer_complete(
                &self.session.next_message_id(),
                &record.command_key,
                &record.fault_code,
                &record.fault_string,
                &record.start_time,
                &record.complete_time,
            );
            let response = client.send(Some(message)).await?.ok_or_else(|| {
                Error::protocol("ACS answered TransferComplete with an empty response")
            })?;
            match soap::parse_rpc_response(&response)? {
                AcsReply::Retry8005 => {
                    return Err(Error::protocol("ACS asked for a session retry (8005)"))
                }
                AcsReply::Ok { hold_requests } => self.session.hold_requests = hold_requests,
            }

            self.backup.remove_transfer_complete(record.id)?;
            let dropped = self.events.remove_by_policy(
                RemovePolicy::AfterTransferComplete,
                None,
                Some(record.method_id),
            );
            self.backup.remove_events(&dropped)?;
            info!(
                "TransferComplete for '{}' acknowledged by the ACS",
                record.command_key
            );
        }
        Ok(())
    }
}
