//! Configuration management for the Redfire CWMP agent

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub device: DeviceConfig,
    pub acs: AcsConfig,
    pub local: LocalConfig,
    pub provider: ProviderConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub software_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcsConfig {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub periodic_enable: bool,
    pub periodic_interval: u32,
    /// ISO-8601 phase reference for the periodic schedule, interpreted as UTC
    /// whether or not a trailing 'Z' is present.
    pub periodic_time: Option<String>,
    pub http100continue_disable: bool,
    pub ssl_cert: Option<String>,
    pub ssl_cacert: Option<String>,
    pub ssl_verify: SslVerify,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    /// Interface whose IPv4 address is watched for changes.
    pub interface: String,
    /// Connection-request listener port.
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub authentication: CrAuthScheme,
    /// Unix socket for the local control surface (notify/inform/command).
    pub control_socket: String,
    /// Durable backup document location.
    pub backup_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// External data-model helper invoked for parameter access, transfers
    /// and device identity.
    pub command: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
    pub format: LogFormat,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SslVerify {
    #[serde(rename = "enabled")]
    Enabled,
    #[serde(rename = "disabled")]
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CrAuthScheme {
    #[serde(rename = "Basic")]
    Basic,
    #[serde(rename = "Digest")]
    Digest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LogFormat {
    #[serde(rename = "json")]
    Json,
    #[serde(rename = "compact")]
    Compact,
    #[serde(rename = "full")]
    Full,
}

impl AgentConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: AgentConfig = toml::from_str(&contents)
            .map_err(|e| Error::parse(format!("Invalid TOML: {}", e)))?;
        Ok(config)
    }

    pub fn load_from_env() -> Result<Self> {
        let mut settings = config::Config::builder();

        settings = settings.add_source(
            config::Environment::with_prefix("REDFIRE_CWMP")
                .separator("__")
        );

        let config = settings.build()?;
        let agent_config = config.try_deserialize()?;
        Ok(agent_config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.acs.url.starts_with("http:") && !self.acs.url.starts_with("https:") {
            return Err(Error::parse("acs.url scheme must be either http or https"));
        }

        if self.local.port == 0 {
            return Err(Error::parse("local.port must be defined and non-zero"));
        }

        if self.acs.periodic_enable && self.acs.periodic_interval == 0 {
            return Err(Error::parse("acs.periodic_interval must be non-zero when periodic informs are enabled"));
        }

        if let Some(t) = &self.acs.periodic_time {
            crate::utils::time::parse_config_time(t)
                .map_err(|_| Error::parse(format!("acs.periodic_time '{}' is not an ISO-8601 timestamp", t)))?;
        }

        if self.provider.command.trim().is_empty() {
            return Err(Error::parse("provider.command must be defined"));
        }

        Ok(())
    }

    pub fn default_config() -> Self {
        Self {
            device: DeviceConfig {
                software_version: crate::VERSION.to_string(),
            },
            acs: AcsConfig {
                url: "http://acs.example.com:8080/openacs/acs".to_string(),
                username: None,
                password: None,
                periodic_enable: true,
                periodic_interval: 100,
                periodic_time: None,
                http100continue_disable: false,
                ssl_cert: None,
                ssl_cacert: None,
                ssl_verify: SslVerify::Enabled,
            },
            local: LocalConfig {
                interface: "eth0".to_string(),
                port: 7547,
                username: None,
                password: None,
                authentication: CrAuthScheme::Digest,
                control_socket: "/var/run/redfire-cwmp.sock".to_string(),
                backup_file: "/etc/redfire-cwmp/.backup.xml".to_string(),
            },
            provider: ProviderConfig {
                command: "/usr/sbin/redfire-cwmp-provider".to_string(),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                file: None,
                format: LogFormat::Compact,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = AgentConfig::default_config();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_non_http_acs_url() {
        let mut config = AgentConfig::default_config();
        config.acs.url = "ftp://acs.example.com/acs".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_missing_listener_port() {
        let mut config = AgentConfig::default_config();
        config.local.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unparseable_periodic_time() {
        let mut config = AgentConfig::default_config();
        config.acs.periodic_time = Some("next tuesday".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn roundtrips_through_toml() {
        let config = AgentConfig::default_config();
        let rendered = toml::to_string_pretty(&config).unwrap();
        let parsed: AgentConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.acs.url, config.acs.url);
        assert_eq!(parsed.local.port, config.local.port);
    }
}
