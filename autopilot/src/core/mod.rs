//! Deterministic, pure logic shared by the session driver.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! byte buffers, timestamps passed in by the caller, and plain data, so every
//! rule here can be exercised without spawning a process.

pub mod ansi;
pub mod breaker;
pub mod chunks;
pub mod classifier;
pub mod context;
pub mod health;
pub mod patterns;
pub mod resilience;
pub mod screen;
pub mod task;
pub mod types;
