//! Local control surface over a Unix socket
//!
//! One JSON object per line: `{"method":"notify"}` kicks the value-change
//! poll, `{"method":"inform","event":"6 CONNECTION REQUEST"}` queues the
//! named event and runs a session, `{"method":"command","name":"reload"}`
//! reloads the configuration and `"stop"` leaves the main loop.

use std::path::Path;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::core::daemon::Trigger;
use crate::core::events::EventCode;
use crate::Result;

pub struct ControlServer {
    socket_path: String,
    trigger_tx: mpsc::UnboundedSender<Trigger>,
}

impl ControlServer {
    pub fn new(socket_path: &str, trigger_tx: mpsc::UnboundedSender<Trigger>) -> Self {
        Self {
            socket_path: socket_path.to_string(),
            trigger_tx,
        }
    }

    pub async fn run(self) -> Result<()> {
        if Path::new(&self.socket_path).exists() {
            let _ = std::fs::remove_file(&self.socket_path);
        }
        let listener = UnixListener::bind(&self.socket_path)?;
        info!("control socket at {}", self.socket_path);
        loop {
            let (stream, _) = listener.accept().await?;
            if let Err(e) = self.handle_client(stream).await {
                debug!("control client failed: {}", e);
            }
        }
    }

    async fn handle_client(&self, stream: UnixStream) -> Result<()> {
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();
        while let Some(line) = lines.next_line().await? {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let reply = self.dispatch(trimmed);
            write_half
                .write_all(format!("{}\n", reply).as_bytes())
                .await?;
        }
        Ok(())
    }

    fn dispatch(&self, line: &str) -> Value {
        let request: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(_) => return json!({"status": -1, "info": "request is not a JSON object"}),
        };

        match request.get("method").and_then(Value::as_str) {
            Some("notify") => {
                info!("triggered control notify");
                let _ = self.trigger_tx.send(Trigger::Notify);
                json!({"status": 0, "info": "value change check triggered"})
            }
            Some("inform") => {
                let event = request.get("event").and_then(Value::as_str).unwrap_or("");
                match EventCode::from_name(event) {
                    Some(code) => {
                        info!("triggered control inform {}", event);
                        let _ = self.trigger_tx.send(Trigger::Event(code));
                        json!({"status": 0, "info": "inform triggered"})
                    }
                    None => json!({"status": -1, "info": format!("unknown event '{}'", event)}),
                }
            }
            Some("command") => {
                let name = request.get("name").and_then(Value::as_str).unwrap_or("");
                match name {
                    "reload" => {
                        info!("triggered control reload");
                        let _ = self.trigger_tx.send(Trigger::Reload);
                        json!({"status": 0, "info": "configuration reloaded"})
                    }
                    "stop" => {
                        info!("triggered control stop");
                        let _ = self.trigger_tx.send(Trigger::Stop);
                        json!({"status": 0, "info": "daemon stopped"})
                    }
                    other => {
                        json!({"status": -1, "info": format!("{} command is not supported", other)})
                    }
                }
            }
            _ => json!({"status": -1, "info": "unknown method"}),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    async fn spawn_control(dir: &TempDir) -> (String, mpsc::UnboundedReceiver<Trigger>) {
        let socket_path = dir
            .path()
            .join("control.sock")
            .to_string_lossy()
            .into_owned();
        let (tx, rx) = mpsc::unbounded_channel();
        let server = ControlServer::new(&socket_path, tx);
        let path = socket_path.clone();
        tokio::spawn(async move {
            let _ = server.run().await;
        });
        // Wait for the socket to appear.
        for _ in 0..100 {
            if Path::new(&path).exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        (socket_path, rx)
    }

    async fn request(socket_path: &str, line: &str) -> Value {
        let mut stream = UnixStream::connect(socket_path).await.unwrap();
        stream
            .write_all(format!("{}\n", line).as_bytes())
            .await
            .unwrap();
        stream.shutdown().await.unwrap();
        let mut reply = String::new();
        stream.read_to_string(&mut reply).await.unwrap();
        serde_json::from_str(reply.trim()).unwrap()
    }

    #[tokio::test]
    async fn notify_triggers_the_value_change_poll() {
        let dir = TempDir::new().unwrap();
        let (socket, mut rx) = spawn_control(&dir).await;

        let reply = request(&socket, r#"{"method":"notify"}"#).await;
        assert_eq!(reply["status"], 0);
        assert_eq!(rx.recv().await, Some(Trigger::Notify));
    }

    #[tokio::test]
    async fn inform_maps_event_names_to_codes() {
        let dir = TempDir::new().unwrap();
        let (socket, mut rx) = spawn_control(&dir).await;

        let reply = request(
            &socket,
            r#"{"method":"inform","event":"6 CONNECTION REQUEST"}"#,
        )
        .await;
        assert_eq!(reply["status"], 0);
        assert_eq!(
            rx.recv().await,
            Some(Trigger::Event(EventCode::ConnectionRequest))
        );

        let reply = request(&socket, r#"{"method":"inform","event":"not an event"}"#).await;
        assert_eq!(reply["status"], -1);
    }

    #[tokio::test]
    async fn command_reload_and_stop_map_to_triggers() {
        let dir = TempDir::new().unwrap();
        let (socket, mut rx) = spawn_control(&dir).await;

        let reply = request(&socket, r#"{"method":"command","name":"reload"}"#).await;
        assert_eq!(reply["status"], 0);
        assert_eq!(rx.recv().await, Some(Trigger::Reload));

        let reply = request(&socket, r#"{"method":"command","name":"stop"}"#).await;
        assert_eq!(reply["status"], 0);
        assert_eq!(rx.recv().await, Some(Trigger::Stop));

        let reply = request(&socket, r#"{"method":"command","name":"dance"}"#).await;
        assert_eq!(reply["status"], -1);
    }
}
