//! Injectable sleeping.
//!
//! Every fixed delay in the driver (inter-chunk spacing, backoff, iteration
//! pauses) goes through a [`Sleeper`] so tests can record delays instead of
//! waiting for them.

use std::thread;
use std::time::Duration;

pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

/// Real wall-clock sleeping.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            thread::sleep(duration);
        }
    }
}
