//! Core engine for the Redfire CWMP agent

pub mod daemon;
pub mod events;
pub mod session;
pub mod transfers;

pub use daemon::{Daemon, Engine, Trigger};
pub use events::{Event, EventCode, EventQueue, RemovePolicy};
pub use session::SessionState;
