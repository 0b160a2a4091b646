//! InstantSOUP networking layer: announcer, timers, and the two engines.

pub mod announcer;
pub mod client;
pub mod deadline;
pub mod server;
mod session;
pub mod types;

// Re-exports
pub use announcer::Announcer;
pub use client::{ClientEngine, ClientHandle};
pub use deadline::{earliest, DeadlineMap};
pub use server::{ServerEngine, ServerHandle};
pub use types::*;
