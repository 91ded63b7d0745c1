//! Drives an interactive, full-screen coding CLI through a pseudo-terminal.
//!
//! Tasks are queued, fed one at a time into a PTY-attached child process, and
//! resolved when the CLI's screen says it is idle again. The architecture keeps
//! the same split throughout:
//!
//! - **[`core`]**: Pure, deterministic logic (screen buffer, readiness
//!   classification, backoff, circuit breaker). No I/O.
//! - **[`io`]**: Side effects (PTY spawning, submission writes, telemetry,
//!   task storage, check commands, configuration).
//!
//! Orchestration modules ([`session`], [`health`], [`recovery`], [`dispatch`],
//! [`distributor`]) combine the two into the running driver.

pub mod cancel;
pub mod core;
pub mod dispatch;
pub mod distributor;
pub mod error;
pub mod exit_codes;
pub mod health;
pub mod io;
pub mod logging;
pub mod recovery;
pub mod registry;
pub mod session;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use error::DriverError;
