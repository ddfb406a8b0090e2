//! Connection-request listener
//!
//! The ACS pokes this tiny HTTP endpoint to ask for a session. A request
//! that passes authentication answers `200 OK` and queues a
//! `6 CONNECTION REQUEST` event; when credentials are not configured the
//! check is bypassed. A request carrying `X-Redfire-Command` is a local
//! command execution instead and answers with a JSON result.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{CrAuthScheme, LocalConfig};
use crate::core::daemon::Trigger;
use crate::core::events::EventCode;
use crate::services::command;
use crate::utils::auth::{basic_challenge, basic_check, DigestGate};
use crate::Result;

/// Maximum request-head size accepted from a client.
const MAX_HEAD_BYTES: usize = 16 * 1024;

pub struct ConnReqServer {
    port: u16,
    username: Option<String>,
    password: Option<String>,
    scheme: CrAuthScheme,
    gate: DigestGate,
    trigger_tx: mpsc::UnboundedSender<Trigger>,
}

struct Request {
    method: String,
    uri: String,
    authorization: Option<String>,
    command_header: Option<String>,
    empty: bool,
}

impl ConnReqServer {
    pub fn new(local: &LocalConfig, trigger_tx: mpsc::UnboundedSender<Trigger>) -> Self {
        Self {
            port: local.port,
            username: local.username.clone(),
            password: local.password.clone(),
            scheme: local.authentication,
            gate: DigestGate::new(),
            trigger_tx,
        }
    }

    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.port)).await?;
        info!("connection-request listener on 0.0.0.0:{}", self.port);
        self.run_on(listener).await
    }

    /// Accept loop. Every accepted connection is served; slow side-channel
    /// commands must not starve connection requests, so each client gets its
    /// own task.
    pub async fn run_on(self, listener: TcpListener) -> Result<()> {
        let server = Arc::new(self);
        loop {
            let (stream, peer) = listener.accept().await?;
            let server = Arc::clone(&server);
            tokio::spawn(async move {
                if let Err(e) = server.handle_client(stream).await {
                    debug!("connection-request client {} failed: {}", peer, e);
                }
            });
        }
    }

    async fn read_request(reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>) -> Request {
        let mut request = Request {
            method: String::new(),
            uri: String::new(),
            authorization: None,
            command_header: None,
            empty: true,
        };

        let mut read_bytes = 0;
        let mut first = true;
        loop {
            let mut line = String::new();
            match reader.read_line(&mut line).await {
                Ok(0) | Err(_) => break,
                Ok(n) => read_bytes += n,
            }
            if read_bytes > MAX_HEAD_BYTES {
                break;
            }
            let trimmed = line.trim_end_matches(['\r', '\n']);
            if trimmed.is_empty() {
                break;
            }
            request.empty = false;
            if first {
                first = false;
                let mut parts = trimmed.split_whitespace();
                request.method = parts.next().unwrap_or_default().to_string();
                request.uri = parts.next().unwrap_or_default().to_string();
                continue;
            }
            if let Some(value) = header_value(trimmed, "Authorization:") {
                request.authorization = Some(value.to_string());
            } else if let Some(value) = header_value(trimmed, "X-Redfire-Command:") {
                request.command_header = Some(value.to_string());
            }
        }
        request
    }

    fn authorized(&self, request: &Request) -> bool {
        let (username, password) = match (&self.username, &self.password) {
            (Some(u), Some(p)) => (u.as_str(), p.as_str()),
            // No credentials configured: authentication is bypassed.
            _ => return true,
        };

        let authorization = match &request.authorization {
            Some(value) => value.as_str(),
            None => return false,
        };

        match self.scheme {
            CrAuthScheme::Basic => authorization
                .strip_prefix("Basic ")
                .map(|token| basic_check(token, username, password))
                .unwrap_or(false),
            CrAuthScheme::Digest => authorization
                .strip_prefix("Digest ")
                .map(|params| {
                    self.gate
                        .check(&request.method, &request.uri, params, username, password)
                })
                .unwrap_or(false),
        }
    }

    async fn handle_client(&self, stream: TcpStream) -> Result<()> {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let request = Self::read_request(&mut reader).await;

        debug!("+++ RECEIVED HTTP REQUEST +++");

        if request.empty {
            write_half
                .write_all(b"HTTP/1.1 409 Conflict\r\nConnection: close\r\n\r\n")
                .await?;
            return Ok(());
        }

        if !self.authorized(&request) {
            warn!("Connection Request authorization failed");
            let challenge = match self.scheme {
                CrAuthScheme::Basic => basic_challenge(),
                CrAuthScheme::Digest => self.gate.challenge(),
            };
            let reply = format!(
                "HTTP/1.1 401 Unauthorized\r\nContent-Length: 0\r\nConnection: close\r\n{}\r\n\r\n",
                challenge
            );
            write_half.write_all(reply.as_bytes()).await?;
            return Ok(());
        }

        if let Some(header) = &request.command_header {
            info!("processing local command request");
            let reply = match command::parse_header(header) {
                Some(cmd_request) => match command::execute(&cmd_request).await {
                    Ok(result) => {
                        let body = serde_json::to_string(&result)?;
                        http_json(200, "OK", &body)
                    }
                    Err(e) => {
                        let body = format!(
                            "{{\"status\":\"error\",\"message\":\"{}\"}}",
                            "Command execution failed"
                        );
                        debug!("command execution failed: {}", e);
                        http_json(400, "Bad Request", &body)
                    }
                },
                None => http_json(
                    400,
                    "Bad Request",
                    "{\"status\":\"error\",\"message\":\"Invalid command format\"}",
                ),
            };
            write_half.write_all(reply.as_bytes()).await?;
            return Ok(());
        }

        // Standard CWMP connection request.
        info!("ACS initiated connection");
        write_half
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
            .await?;
        let _ = self
            .trigger_tx
            .send(Trigger::Event(EventCode::ConnectionRequest));
        Ok(())
    }
}

fn header_value<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    if line.len() < name.len() || !line[..name.len()].eq_ignore_ascii_case(name) {
        return None;
    }
    Some(line[name.len()..].trim())
}

fn http_json(code: u16, reason: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        code,
        reason,
        body.len(),
        body
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::utils::auth::basic_credentials;
    use tokio::io::AsyncReadExt;

    async fn spawn_server(
        local: LocalConfig,
    ) -> (std::net::SocketAddr, mpsc::UnboundedReceiver<Trigger>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let server = ConnReqServer::new(&local, tx);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = server.run_on(listener).await;
        });
        (addr, rx)
    }

    async fn roundtrip(addr: std::net::SocketAddr, request: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut reply = String::new();
        stream.read_to_string(&mut reply).await.unwrap();
        reply
    }

    fn local_config() -> LocalConfig {
        AgentConfig::default_config().local
    }

    #[tokio::test]
    async fn open_listener_accepts_and_queues_a_connection_request() {
        let (addr, mut rx) = spawn_server(local_config()).await;

        let reply = roundtrip(addr, "GET / HTTP/1.1\r\nHost: cpe\r\n\r\n").await;
        assert!(reply.starts_with("HTTP/1.1 200 OK"));
        assert!(reply.contains("Content-Length: 0"));

        assert_eq!(
            rx.recv().await,
            Some(Trigger::Event(EventCode::ConnectionRequest))
        );
    }

    #[tokio::test]
    async fn basic_credentials_are_enforced_when_configured() {
        let mut local = local_config();
        local.username = Some("admin".to_string());
        local.password = Some("secret".to_string());
        local.authentication = CrAuthScheme::Basic;
        let (addr, mut rx) = spawn_server(local).await;

        let reply = roundtrip(addr, "GET / HTTP/1.1\r\nHost: cpe\r\n\r\n").await;
        assert!(reply.starts_with("HTTP/1.1 401"));
        assert!(reply.contains("WWW-Authenticate: Basic"));
        assert!(rx.try_recv().is_err());

        let authorized = format!(
            "GET / HTTP/1.1\r\nAuthorization: {}\r\n\r\n",
            basic_credentials("admin", "secret")
        );
        let reply = roundtrip(addr, &authorized).await;
        assert!(reply.starts_with("HTTP/1.1 200 OK"));
        assert_eq!(
            rx.recv().await,
            Some(Trigger::Event(EventCode::ConnectionRequest))
        );
    }

    #[tokio::test]
    async fn digest_scheme_challenges_unauthenticated_clients() {
        let mut local = local_config();
        local.username = Some("admin".to_string());
        local.password = Some("secret".to_string());
        local.authentication = CrAuthScheme::Digest;
        let (addr, _rx) = spawn_server(local).await;

        let reply = roundtrip(addr, "GET / HTTP/1.1\r\nHost: cpe\r\n\r\n").await;
        assert!(reply.starts_with("HTTP/1.1 401"));
        assert!(reply.contains("WWW-Authenticate: Digest"));
        assert!(reply.contains("nonce="));
    }

    #[tokio::test]
    async fn empty_requests_answer_conflict() {
        let (addr, _rx) = spawn_server(local_config()).await;
        let reply = roundtrip(addr, "\r\n").await;
        assert!(reply.starts_with("HTTP/1.1 409 Conflict"));
    }

    #[tokio::test]
    async fn command_header_runs_the_side_channel() {
        let (addr, mut rx) = spawn_server(local_config()).await;

        let reply = roundtrip(
            addr,
            "GET / HTTP/1.1\r\nX-Redfire-Command: uname\r\n\r\n",
        )
        .await;
        assert!(reply.starts_with("HTTP/1.1 200 OK"));
        assert!(reply.contains("\"exit_code\":0"));
        assert!(reply.contains("\"status\":\"success\""));
        // A command request is not a connection request.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn rejected_command_answers_400() {
        let (addr, _rx) = spawn_server(local_config()).await;
        let reply = roundtrip(
            addr,
            "GET / HTTP/1.1\r\nX-Redfire-Command: rm -rf /\r\n\r\n",
        )
        .await;
        assert!(reply.starts_with("HTTP/1.1 400 Bad Request"));
        assert!(reply.contains("error"));
    }
}
