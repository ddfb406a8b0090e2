//! Whitelisted local command execution for the connection-request side channel
//!
//! The listener hands over the `X-Redfire-Command` header value: either a
//! literal command line or a JSON object with arguments, timeout, working
//! directory and user. Only commands matching the fixed prefix whitelist run;
//! output is captured with a hard size cap and the child is killed at its
//! deadline.

use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{info, warn};

use crate::utils::time::now_iso8601;
use crate::{Error, Result};

pub const COMMAND_MAX_LENGTH: usize = 1024;
pub const COMMAND_DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const COMMAND_MAX_TIMEOUT_SECS: u64 = 300;
/// Per-stream capture cap: 1 MiB.
pub const COMMAND_MAX_OUTPUT_SIZE: usize = 1024 * 1024;

/// Only command lines starting with one of these prefixes are executed.
pub const SAFE_COMMAND_PATTERNS: [&str; 37] = [
    "ping",
    "ping6",
    "traceroute",
    "traceroute6",
    "nslookup",
    "dig",
    "curl",
    "wget",
    "iperf",
    "iperf3",
    "speedtest",
    "uci",
    "cat /proc/",
    "cat /sys/",
    "ls",
    "ps",
    "top",
    "free",
    "df",
    "uptime",
    "date",
    "whoami",
    "id",
    "uname",
    "ifconfig",
    "ip",
    "route",
    "netstat",
    "ss",
    "iwconfig",
    "iwlist",
    "logread",
    "dmesg",
    "ethtool",
    "iw",
    "iwinfo",
    "/etc/init.d/",
];

#[derive(Debug, Clone, PartialEq)]
pub struct CommandRequest {
    pub command: String,
    pub args: Option<String>,
    pub timeout_secs: u64,
    pub workdir: String,
    pub user: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CommandResult {
    pub status: &'static str,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub execution_time_ms: u128,
    pub start_time: String,
    pub end_time: String,
}

/// Parse the header value: a JSON object, or a literal command line.
pub fn parse_header(header_value: &str) -> Option<CommandRequest> {
    let trimmed = header_value.trim();
    if trimmed.is_empty() {
        return None;
    }

    let mut request = CommandRequest {
        command: String::new(),
        args: None,
        timeout_secs: COMMAND_DEFAULT_TIMEOUT_SECS,
        workdir: "/tmp".to_string(),
        user: None,
    };

    match serde_json::from_str::<Value>(trimmed) {
        Ok(json) => {
            request.command = json
                .get("command")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            request.args = json
                .get("args")
                .and_then(Value::as_str)
                .map(str::to_string);
            if let Some(timeout) = json.get("timeout").and_then(Value::as_u64) {
                if (1..=COMMAND_MAX_TIMEOUT_SECS).contains(&timeout) {
                    request.timeout_secs = timeout;
                }
            }
            if let Some(workdir) = json.get("workdir").and_then(Value::as_str) {
                request.workdir = sanitize_path(workdir);
            }
            request.user = json
                .get("user")
                .and_then(Value::as_str)
                .map(str::to_string);
        }
        Err(_) => request.command = trimmed.to_string(),
    }

    if request.command.is_empty() || request.command.len() > COMMAND_MAX_LENGTH {
        return None;
    }
    Some(request)
}

/// True when the command line starts with a whitelisted prefix.
pub fn validate_safe(command: &str) -> bool {
    if command.is_empty() || command.len() > COMMAND_MAX_LENGTH {
        return false;
    }
    SAFE_COMMAND_PATTERNS
        .iter()
        .any(|prefix| command.starts_with(prefix))
}

/// Neutralize directory-traversal sequences in a path.
pub fn sanitize_path(path: &str) -> String {
    let mut sanitized = path.to_string();
    for pattern in ["../", "..\\", "/..", "\\.."] {
        while let Some(pos) = sanitized.find(pattern) {
            sanitized.replace_range(pos..pos + pattern.len(), &"_".repeat(pattern.len()));
        }
    }
    sanitized
}

async fn read_capped(
    stream: Option<impl tokio::io::AsyncRead + Unpin>,
    cap: usize,
) -> String {
    let mut out = Vec::new();
    if let Some(mut stream) = stream {
        let mut buf = [0u8; 4096];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if out.len() + n > cap {
                        out.extend_from_slice(&buf[..cap - out.len()]);
                        break;
                    }
                    out.extend_from_slice(&buf[..n]);
                }
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Execute a validated request. The child runs under `sh -c`, its output is
/// capped and it is killed when the timeout elapses.
pub async fn execute(request: &CommandRequest) -> Result<CommandResult> {
    if !validate_safe(&request.command) {
        warn!("unsafe command rejected: {}", request.command);
        return Err(Error::auth(format!(
            "command not in whitelist: {}",
            request.command
        )));
    }

    let command_line = match &request.args {
        Some(args) => format!("{} {}", request.command, args),
        None => request.command.clone(),
    };

    run_command_line(&command_line, &request.workdir, request.timeout_secs).await
}

async fn run_command_line(
    command_line: &str,
    workdir: &str,
    timeout_secs: u64,
) -> Result<CommandResult> {
    let start_time = now_iso8601();
    let started = std::time::Instant::now();

    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command_line)
        .current_dir(workdir)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::internal(format!("cannot spawn command: {}", e)))?;

    let stdout_task = tokio::spawn(read_capped(child.stdout.take(), COMMAND_MAX_OUTPUT_SIZE));
    let stderr_task = tokio::spawn(read_capped(child.stderr.take(), COMMAND_MAX_OUTPUT_SIZE));

    let timeout = Duration::from_secs(timeout_secs);
    let (exit_code, mut stderr_override) =
        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => (status.code().unwrap_or(-1), None),
            Ok(Err(e)) => (-1, Some(format!("Failed to wait for command: {}", e))),
            Err(_) => {
                let _ = child.kill().await;
                (-1, Some("Command timed out".to_string()))
            }
        };

    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = match stderr_override.take() {
        Some(message) => message,
        None => stderr_task.await.unwrap_or_default(),
    };

    let end_time = now_iso8601();
    let execution_time_ms = started.elapsed().as_millis();

    info!(
        "command executed: {}, exit_code: {}, time: {}ms",
        command_line, exit_code, execution_time_ms
    );

    Ok(CommandResult {
        status: "success",
        exit_code,
        stdout,
        stderr,
        execution_time_ms,
        start_time,
        end_time,
    })
}
