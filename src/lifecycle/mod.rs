//! Starting and stopping the sampling streams

/// Supervisor owning every stream thread and sink
pub mod agent;

/// Stop and abort flags shared with every stream
pub mod signal;

pub use agent::{Agent, StreamSpec};
pub use signal::ShutdownSignal;
