//! Services module for the Redfire CWMP agent

pub mod acs;
pub mod backup;
pub mod command;
pub mod connreq;
pub mod control;
pub mod datamodel;
pub mod netmon;

pub use acs::AcsClient;
pub use backup::{BackupStore, TransferRecord};
pub use connreq::ConnReqServer;
pub use control::ControlServer;
pub use datamodel::{DataModelProvider, ExternalProvider, ParameterRecord};
pub use netmon::InterfaceWatcher;
