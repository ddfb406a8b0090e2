//! Redfire CWMP - TR-069 CPE management agent
//!
//! A CPE-side implementation of the CPE WAN Management Protocol (TR-069):
//! a long-running daemon that lets a remote Auto-Configuration Server manage
//! the device through Inform sessions, the standard RPC set, persistent
//! protocol state and connection requests.
//!
//! **Sponsored by [Carrier One Inc](https://carrierone.com) - Professional Telecommunications Solutions**

pub mod config;
pub mod core;
pub mod protocols;
pub mod services;
pub mod error;
pub mod utils;

pub use error::{Error, Result};

/// Agent version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");

/// Daemon name: used as the User-Agent towards the ACS and for runtime paths.
pub const DAEMON_NAME: &str = "redfire-cwmpd";
