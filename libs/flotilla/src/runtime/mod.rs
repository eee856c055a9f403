//! Runtime: listener serving and the lifecycle runner.

pub mod runner;
pub mod server;
pub mod shutdown;

pub use runner::{run, RunOptions, ShutdownOptions};
pub use server::{build_listener_router, serve_listener};
