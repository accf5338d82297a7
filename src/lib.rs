//! Trace process executions, system-wide or below a process.

mod prelude;

pub mod app;
pub mod config;
pub mod events;
pub mod process;
pub mod quote;
pub mod run;
pub mod source;
pub mod tracer;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
