//! Protocol implementations for the Redfire CWMP agent

pub mod rpc;
pub mod soap;
pub mod xml;

pub use soap::{CwmpFault, DeviceId, EventStruct, Namespaces, ParameterValue};
