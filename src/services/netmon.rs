//! Interface address watcher
//!
//! Polls the configured interface's IPv4 address and posts a
//! `4 VALUE CHANGE` event when it moves. The first observation only records
//! the address; a change is only a change once a previous address is known.

use std::time::Duration;

use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::core::daemon::Trigger;
use crate::core::events::EventCode;

pub const POLL_INTERVAL_SECS: u64 = 30;

pub struct InterfaceWatcher {
    interface: String,
    poll_interval: Duration,
    trigger_tx: mpsc::UnboundedSender<Trigger>,
}

impl InterfaceWatcher {
    pub fn new(interface: &str, trigger_tx: mpsc::UnboundedSender<Trigger>) -> Self {
        Self {
            interface: interface.to_string(),
            poll_interval: Duration::from_secs(POLL_INTERVAL_SECS),
            trigger_tx,
        }
    }

    async fn current_ip(&self) -> Option<String> {
        let output = Command::new("ip")
            .args(["-4", "-o", "addr", "show", "dev", &self.interface])
            .output()
            .await
            .ok()?;
        parse_ip_output(&String::from_utf8_lossy(&output.stdout))
    }

    pub async fn run(self) {
        let mut last: Option<String> = None;
        loop {
            match self.current_ip().await {
                Some(ip) => {
                    match &last {
                        Some(previous) if previous != &ip => {
                            info!(
                                "ip address of the interface {} is changed to {}",
                                self.interface, ip
                            );
                            let _ = self.trigger_tx.send(Trigger::Event(EventCode::ValueChange));
                        }
                        None => info!("interface {} has ip {}", self.interface, ip),
                        _ => {}
                    }
                    last = Some(ip);
                }
                None => debug!("interface {} has no IPv4 address", self.interface),
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

/// Pull the first IPv4 address out of `ip -4 -o addr show` output.
fn parse_ip_output(output: &str) -> Option<String> {
    for line in output.lines() {
        let mut tokens = line.split_whitespace();
        while let Some(token) = tokens.next() {
            if token == "inet" {
                let address = tokens.next()?;
                let ip = address.split('/').next().unwrap_or(address);
                return Some(ip.to_string());
            }
        }
    }
    None
}
