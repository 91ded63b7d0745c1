//! Chunked submission of task text into the child's input.
//!
//! Large pastes into a PTY race the line discipline and the CLI's own input
//! handling, so text goes in as fixed-size chunks with spacing, then a settle
//! pause, then the submit keystroke as a separate write.

use std::io::{self, Write};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::chunks::{DEFAULT_CHUNK_SIZE, plan_chunks};
use crate::core::resilience::backoff_delay;
use crate::error::DriverError;
use crate::io::clock::Sleeper;

const MAX_WRITE_RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubmissionConfig {
    pub chunk_size: usize,
    pub inter_chunk_delay_ms: u64,
    /// Pause between the last chunk and the submit keystroke.
    pub settle_delay_ms: u64,
    /// Retries per write after the first failure.
    pub write_retries: u32,
    pub retry_base_delay_ms: u64,
    pub submit_sequence: String,
}

impl Default for SubmissionConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            inter_chunk_delay_ms: 200,
            settle_delay_ms: 200,
            write_retries: 3,
            retry_base_delay_ms: 100,
            submit_sequence: "\r".to_string(),
        }
    }
}

impl SubmissionConfig {
    pub fn validate(&self) -> Result<(), DriverError> {
        if self.chunk_size == 0 {
            return Err(DriverError::Configuration(
                "submission.chunk_size must be > 0".to_string(),
            ));
        }
        if self.submit_sequence.is_empty() {
            return Err(DriverError::Configuration(
                "submission.submit_sequence must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubmitReport {
    pub bytes: usize,
    pub chunk_writes: usize,
    /// Write retries across all chunks and the submit keystroke.
    pub retries: u32,
}

pub struct Submitter<'a> {
    config: &'a SubmissionConfig,
    sleeper: &'a dyn Sleeper,
}

impl<'a> Submitter<'a> {
    pub fn new(config: &'a SubmissionConfig, sleeper: &'a dyn Sleeper) -> Self {
        Self { config, sleeper }
    }

    /// Write `text` and then the submit keystroke.
    pub fn submit(&self, sink: Option<&mut dyn Write>, text: &str) -> Result<SubmitReport, DriverError> {
        self.submit_with(sink, text, || {})
    }

    /// Like [`Submitter::submit`], calling `before_submit` after the settle
    /// pause and immediately before the submit keystroke is written.
    pub fn submit_with(
        &self,
        sink: Option<&mut dyn Write>,
        text: &str,
        before_submit: impl FnOnce(),
    ) -> Result<SubmitReport, DriverError> {
        let Some(sink) = sink else {
            return Err(DriverError::ProcessUnavailable(
                "no input sink attached".to_string(),
            ));
        };

        let mut report = SubmitReport {
            bytes: text.len(),
            ..SubmitReport::default()
        };
        let spacing = Duration::from_millis(self.config.inter_chunk_delay_ms);
        for (index, chunk) in plan_chunks(text, self.config.chunk_size).enumerate() {
            if index > 0 {
                self.sleeper.sleep(spacing);
            }
            report.retries += self.write_with_retry(sink, chunk)?;
            report.chunk_writes += 1;
        }

        self.sleeper
            .sleep(Duration::from_millis(self.config.settle_delay_ms));
        before_submit();
        report.retries += self.write_with_retry(sink, self.config.submit_sequence.as_bytes())?;

        debug!(
            bytes = report.bytes,
            chunks = report.chunk_writes,
            retries = report.retries,
            "submitted text"
        );
        Ok(report)
    }

    /// One logical write, retried with backoff. Returns the retry count.
    ///
    /// A retry resumes after the bytes the sink already accepted, so a
    /// partial write never duplicates text.
    fn write_with_retry(&self, sink: &mut dyn Write, bytes: &[u8]) -> Result<u32, DriverError> {
        let attempts = self.config.write_retries + 1;
        let mut written = 0;
        let mut attempt = 1;
        loop {
            let err = match write_remaining(sink, bytes, &mut written) {
                Ok(()) => return Ok(attempt - 1),
                Err(err) => err,
            };
            warn!(attempt, attempts, written, error = %err, "pty write failed");
            if attempt >= attempts {
                return Err(if is_disconnect(&err) {
                    DriverError::ProcessUnavailable(err.to_string())
                } else {
                    DriverError::WriteRejected {
                        attempts,
                        message: err.to_string(),
                    }
                });
            }
            self.sleeper.sleep(backoff_delay(
                Duration::from_millis(self.config.retry_base_delay_ms),
                2.0,
                attempt - 1,
                MAX_WRITE_RETRY_DELAY,
            ));
            attempt += 1;
        }
    }
}

fn write_remaining(sink: &mut dyn Write, bytes: &[u8], written: &mut usize) -> io::Result<()> {
    while *written < bytes.len() {
        match sink.write(&bytes[*written..]) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
            Ok(accepted) => *written += accepted,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    sink.flush()
}

fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::NotConnected | io::ErrorKind::UnexpectedEof
    )
}
