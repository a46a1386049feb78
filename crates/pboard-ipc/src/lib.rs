//! Loopback IPC bridge between the Pulseboard core and its UI process, plus
//! the single-instance lock that rides on the same port.

pub mod events;
pub mod instance;
pub mod server;

pub use events::{AppEvent, EventHub};
pub use instance::{InstanceGate, acquire_instance};
pub use server::{AppContext, build_router, serve};
