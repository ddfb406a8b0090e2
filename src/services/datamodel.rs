//! Bridge to the external data-model helper
//!
//! Parameter access, apply semantics, transfer execution and device identity
//! all go through one helper process. The agent writes line-oriented
//! commands; the helper answers with one JSON object per line and a final
//! prompt line. The exchange is strictly serial: responses arrive in request
//! order and nothing else runs while the helper is being waited on.

use std::process::Stdio;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::protocols::soap::{CwmpFault, DeviceId};
use crate::{Error, Result};

/// Line the helper prints when a command batch is fully answered.
pub const PROVIDER_PROMPT: &str = "redfire-cwmp>";

/// One parameter-shaped response line. `data` doubles as the value for
/// get-value, writability for get-names and the notification level for
/// get-attributes, mirroring the helper's record shape.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterRecord {
    pub name: String,
    pub data: String,
    pub xsi_type: String,
    pub fault_code: String,
}

impl ParameterRecord {
    pub fn is_fault(&self) -> bool {
        self.fault_code.starts_with('9')
    }
}

/// Outcome of a set + apply exchange.
#[derive(Debug, Default)]
pub struct SetOutcome {
    /// "0" = applied, "1" = needs reboot.
    pub status: Option<String>,
    pub faults: Vec<ParameterRecord>,
}

/// Outcome of AddObject / DeleteObject.
#[derive(Debug, Default)]
pub struct ObjectOutcome {
    pub status: Option<String>,
    pub instance: Option<String>,
    pub fault: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub url: String,
    pub file_type: String,
    pub file_size: String,
    pub username: String,
    pub password: String,
}

/// The seam between the session engine and the parameter backend.
#[async_trait]
pub trait DataModelProvider: Send {
    async fn get_parameter_values(&mut self, names: &[String]) -> Result<Vec<ParameterRecord>>;
    async fn get_parameter_names(
        &mut self,
        path: &str,
        next_level: &str,
    ) -> Result<Vec<ParameterRecord>>;
    async fn get_parameter_attributes(&mut self, names: &[String])
        -> Result<Vec<ParameterRecord>>;
    async fn set_parameter_values(
        &mut self,
        values: &[(String, String)],
        parameter_key: &str,
    ) -> Result<SetOutcome>;
    async fn set_parameter_attributes(
        &mut self,
        notifications: &[(String, String)],
    ) -> Result<SetOutcome>;
    async fn add_object(&mut self, object_name: &str, parameter_key: &str)
        -> Result<ObjectOutcome>;
    async fn delete_object(
        &mut self,
        object_name: &str,
        parameter_key: &str,
    ) -> Result<ObjectOutcome>;
    async fn check_value_change(&mut self) -> Result<Vec<ParameterRecord>>;
    async fn inform_parameters(&mut self) -> Result<Vec<ParameterRecord>>;
    async fn device_id(&mut self) -> Result<DeviceId>;
    async fn download(&mut self, request: &TransferRequest) -> Result<CwmpFault>;
    async fn upload(&mut self, request: &TransferRequest) -> Result<CwmpFault>;
    async fn reboot(&mut self) -> Result<()>;
    async fn factory_reset(&mut self) -> Result<()>;
}

/// Production implementation spawning the configured helper per exchange.
pub struct ExternalProvider {
    command: String,
}

impl ExternalProvider {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
        }
    }

    /// Run one command batch: spawn the helper, feed it the command lines,
    /// collect JSON records until the prompt, then reap the child.
    async fn invoke(&self, commands: &[String]) -> Result<Vec<Value>> {
        debug!("provider exchange: {:?}", commands);

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::bridge(format!("cannot spawn provider helper: {}", e)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::bridge("provider helper has no stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::bridge("provider helper has no stdout"))?;

        for command in commands {
            stdin
                .write_all(format!("{}\n", command).as_bytes())
                .await
                .map_err(|e| Error::bridge(format!("cannot write to provider helper: {}", e)))?;
        }
        stdin
            .flush()
            .await
            .map_err(|e| Error::bridge(format!("cannot flush provider helper: {}", e)))?;
        drop(stdin);

        // The helper answers every command with zero or more JSON lines and
        // one prompt line, in request order.
        let mut records = Vec::new();
        let mut prompts_seen = 0;
        let mut lines = BufReader::new(stdout).lines();
        while prompts_seen < commands.len() {
            let line = lines
                .next_line()
                .await
                .map_err(|e| Error::bridge(format!("cannot read from provider helper: {}", e)))?;
            let line = match line {
                Some(l) => l,
                None => {
                    return Err(Error::bridge(
                        "provider helper closed its output before the prompt",
                    ))
                }
            };
            let trimmed = line.trim();
            if trimmed == PROVIDER_PROMPT {
                prompts_seen += 1;
                continue;
            }
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(trimmed) {
                Ok(value) => records.push(value),
                Err(e) => warn!("ignoring unparseable provider line '{}': {}", trimmed, e),
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| Error::bridge(format!("cannot reap provider helper: {}", e)))?;
        if !status.success() {
            warn!("provider helper exited with {}", status);
        }

        Ok(records)
    }

    async fn invoke_parameters(&self, commands: &[String]) -> Result<Vec<ParameterRecord>> {
        let values = self.invoke(commands).await?;
        Ok(values.iter().map(parameter_record).collect())
    }
}

fn field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn parameter_record(value: &Value) -> ParameterRecord {
    ParameterRecord {
        name: field(value, "parameter"),
        data: field(value, "value"),
        xsi_type: field(value, "type"),
        fault_code: field(value, "fault_code"),
    }
}

fn set_outcome(values: &[Value]) -> SetOutcome {
    let mut outcome = SetOutcome::default();
    for value in values {
        if let Some(status) = value.get("status").and_then(Value::as_str) {
            outcome.status = Some(status.to_string());
            continue;
        }
        let record = parameter_record(value);
        if record.is_fault() {
            outcome.faults.push(record);
        }
    }
    outcome
}

#[async_trait]
impl DataModelProvider for ExternalProvider {
    async fn get_parameter_values(&mut self, names: &[String]) -> Result<Vec<ParameterRecord>> {
        let mut out = Vec::new();
        for name in names {
            let records = self
                .invoke_parameters(&[format!("get value {}", name)])
                .await?;
            let faulted = records.iter().any(ParameterRecord::is_fault);
            out.extend(records);
            if faulted {
                break;
            }
        }
        Ok(out)
    }

    async fn get_parameter_names(
        &mut self,
        path: &str,
        next_level: &str,
    ) -> Result<Vec<ParameterRecord>> {
        self.invoke_parameters(&[format!("get name {} {}", next_level, path)])
            .await
    }

    async fn get_parameter_attributes(
        &mut self,
        names: &[String],
    ) -> Result<Vec<ParameterRecord>> {
        let mut out = Vec::new();
        for name in names {
            let records = self
                .invoke_parameters(&[format!("get notification {}", name)])
                .await?;
            let faulted = records.iter().any(ParameterRecord::is_fault);
            out.extend(records);
            if faulted {
                break;
            }
        }
        Ok(out)
    }

    async fn set_parameter_values(
        &mut self,
        values: &[(String, String)],
        parameter_key: &str,
    ) -> Result<SetOutcome> {
        let mut commands: Vec<String> = values
            .iter()
            .map(|(name, value)| format!("set value {} {}", name, value))
            .collect();
        commands.push(format!("apply value {}", parameter_key));
        let records = self.invoke(&commands).await?;
        Ok(set_outcome(&records))
    }

    async fn set_parameter_attributes(
        &mut self,
        notifications: &[(String, String)],
    ) -> Result<SetOutcome> {
        let mut commands: Vec<String> = notifications
            .iter()
            .map(|(name, level)| format!("set notification {} {}", name, level))
            .collect();
        commands.push("apply notification".to_string());
        let records = self.invoke(&commands).await?;
        Ok(set_outcome(&records))
    }

    async fn add_object(
        &mut self,
        object_name: &str,
        parameter_key: &str,
    ) -> Result<ObjectOutcome> {
        let records = self.invoke(&[format!("add object {}", object_name)]).await?;
        let mut outcome = ObjectOutcome::default();
        for value in &records {
            if value.get("status").is_some() || value.get("instance").is_some() {
                outcome.status = value.get("status").and_then(Value::as_str).map(String::from);
                outcome.instance = value
                    .get("instance")
                    .and_then(Value::as_str)
                    .map(String::from);
                let fault = field(value, "fault_code");
                if !fault.is_empty() {
                    outcome.fault = Some(fault);
                }
            }
        }
        if outcome.fault.as_deref().map(|f| f.starts_with('9')) != Some(true) {
            self.invoke(&[format!("apply object {}", parameter_key)])
                .await?;
        }
        Ok(outcome)
    }

    async fn delete_object(
        &mut self,
        object_name: &str,
        parameter_key: &str,
    ) -> Result<ObjectOutcome> {
        let records = self
            .invoke(&[format!("delete object {}", object_name)])
            .await?;
        let mut outcome = ObjectOutcome::default();
        for value in &records {
            if value.get("status").is_some() {
                outcome.status = value.get("status").and_then(Value::as_str).map(String::from);
                let fault = field(value, "fault_code");
                if !fault.is_empty() {
                    outcome.fault = Some(fault);
                }
            }
        }
        if outcome.fault.as_deref().map(|f| f.starts_with('9')) != Some(true) {
            self.invoke(&[format!("apply object {}", parameter_key)])
                .await?;
        }
        Ok(outcome)
    }

    async fn check_value_change(&mut self) -> Result<Vec<ParameterRecord>> {
        self.invoke_parameters(&["check_value_change".to_string()])
            .await
    }

    async fn inform_parameters(&mut self) -> Result<Vec<ParameterRecord>> {
        self.invoke_parameters(&["inform parameter".to_string()])
            .await
    }

    async fn device_id(&mut self) -> Result<DeviceId> {
        let records = self.invoke(&["inform device_id".to_string()]).await?;
        let record = records
            .first()
            .ok_or_else(|| Error::bridge("provider returned no device identity"))?;
        serde_json::from_value(record.clone())
            .map_err(|e| Error::bridge(format!("bad device identity record: {}", e)))
    }

    async fn download(&mut self, request: &TransferRequest) -> Result<CwmpFault> {
        let records = self
            .invoke(&[format!(
                "download {} {} {} {} {}",
                request.url,
                request.file_size,
                request.username,
                request.password,
                request.file_type
            )])
            .await?;
        Ok(transfer_fault(&records, CwmpFault::DownloadFailure))
    }

    async fn upload(&mut self, request: &TransferRequest) -> Result<CwmpFault> {
        let records = self
            .invoke(&[format!(
                "upload {} {} {} {}",
                request.url, request.username, request.password, request.file_type
            )])
            .await?;
        Ok(transfer_fault(&records, CwmpFault::UploadFailure))
    }

    async fn reboot(&mut self) -> Result<()> {
        self.invoke(&["reboot".to_string()]).await?;
        Ok(())
    }

    async fn factory_reset(&mut self) -> Result<()> {
        self.invoke(&["factory_reset".to_string()]).await?;
        Ok(())
    }
}

fn transfer_fault(records: &[Value], fallback: CwmpFault) -> CwmpFault {
    for value in records {
        let fault = field(value, "fault_code");
        if fault.starts_with('9') {
            return CwmpFault::from_code(&fault);
        }
        if value.get("status").and_then(Value::as_str) == Some("0") {
            return CwmpFault::None;
        }
    }
    // No verdict from the helper at all counts as a failed transfer.
    if records.is_empty() {
        fallback
    } else {
        CwmpFault::None
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;

    /// Inert provider for engine-level tests: canned answers, no helper
    /// process.
    #[derive(Default)]
    pub struct NullProvider {
        pub download_fault: CwmpFault,
        pub upload_fault: CwmpFault,
        pub changed: Vec<ParameterRecord>,
        pub inform: Vec<ParameterRecord>,
    }

    #[async_trait]
    impl DataModelProvider for NullProvider {
        async fn get_parameter_values(
            &mut self,
            _names: &[String],
        ) -> Result<Vec<ParameterRecord>> {
            Ok(Vec::new())
        }

        async fn get_parameter_names(
            &mut self,
            _path: &str,
            _next_level: &str,
        ) -> Result<Vec<ParameterRecord>> {
            Ok(Vec::new())
        }

        async fn get_parameter_attributes(
            &mut self,
            _names: &[String],
        ) -> Result<Vec<ParameterRecord>> {
            Ok(Vec::new())
        }

        async fn set_parameter_values(
            &mut self,
            _values: &[(String, String)],
            _parameter_key: &str,
        ) -> Result<SetOutcome> {
            Ok(SetOutcome {
                status: Some("0".to_string()),
                faults: Vec::new(),
            })
        }

        async fn set_parameter_attributes(
            &mut self,
            _notifications: &[(String, String)],
        ) -> Result<SetOutcome> {
            Ok(SetOutcome {
                status: Some("0".to_string()),
                faults: Vec::new(),
            })
        }

        async fn add_object(
            &mut self,
            _object_name: &str,
            _parameter_key: &str,
        ) -> Result<ObjectOutcome> {
            Ok(ObjectOutcome::default())
        }

        async fn delete_object(
            &mut self,
            _object_name: &str,
            _parameter_key: &str,
        ) -> Result<ObjectOutcome> {
            Ok(ObjectOutcome::default())
        }

        async fn check_value_change(&mut self) -> Result<Vec<ParameterRecord>> {
            Ok(std::mem::take(&mut self.changed))
        }

        async fn inform_parameters(&mut self) -> Result<Vec<ParameterRecord>> {
            Ok(self.inform.clone())
        }

        async fn device_id(&mut self) -> Result<DeviceId> {
            Ok(DeviceId::default())
        }

        async fn download(&mut self, _request: &TransferRequest) -> Result<CwmpFault> {
            Ok(self.download_fault)
        }

        async fn upload(&mut self, _request: &TransferRequest) -> Result<CwmpFault> {
            Ok(self.upload_fault)
        }

        async fn reboot(&mut self) -> Result<()> {
            Ok(())
        }

        async fn factory_reset(&mut self) -> Result<()> {
            Ok(())
        }
    }
}
