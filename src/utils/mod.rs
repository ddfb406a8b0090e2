//! Utility modules for the Redfire CWMP agent

pub mod auth;
pub mod logger;
pub mod time;

pub use logger::setup_logging;
