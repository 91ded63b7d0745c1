//! I/O seams for the session driver.

pub mod checks;
pub mod clock;
pub mod config;
pub mod prompt;
pub mod pty;
pub mod store;
pub mod submit;
pub mod telemetry;
