//! scuttle supervisor library.
//!
//! The process-facing half of scuttle: the signal relay, executable
//! resolution and the control loop that ties them to the core lifecycle
//! logic. Used by the `scuttle` binary and by the integration tests.

pub mod executable;
pub mod signals;
pub mod supervisor;

pub use supervisor::Supervisor;
