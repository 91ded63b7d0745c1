//! Readiness classification over the live screen.
//!
//! [`ScreenAnalyzer::classify`] is a pure function of the buffer and the quiet
//! time. [`ReadinessTracker`] adds the one piece of memory the protocol needs:
//! a permission prompt stays latched until a resolved marker shows up without
//! the prompt text, even if the prompt itself has been evicted.

use std::time::Duration;

use crate::core::patterns::{CompiledPatterns, FrameText};
use crate::core::types::ReadinessState;

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(1000);

/// Which pattern families matched the live frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameMatch {
    pub permission: Option<String>,
    pub ready: Option<String>,
    pub busy: bool,
    pub resolved: bool,
}

#[derive(Debug, Clone)]
pub struct ScreenAnalyzer {
    patterns: CompiledPatterns,
    debounce: Duration,
}

impl ScreenAnalyzer {
    pub fn new(patterns: CompiledPatterns, debounce: Duration) -> Self {
        Self { patterns, debounce }
    }

    pub fn debounce(&self) -> Duration {
        self.debounce
    }

    pub fn patterns(&self) -> &CompiledPatterns {
        &self.patterns
    }

    /// Match every pattern family against the live suffix of `buffer`.
    pub fn inspect(&self, buffer: &[u8]) -> FrameMatch {
        let live = self.patterns.clear_markers().live_suffix(buffer);
        if live.is_empty() {
            return FrameMatch::default();
        }
        let frame = FrameText::from_bytes(live);
        FrameMatch {
            permission: self.patterns.permission_match(&frame).map(str::to_string),
            ready: self.patterns.ready_match(&frame).map(str::to_string),
            busy: self.patterns.busy_after_ready(&frame),
            resolved: self.patterns.is_resolved(&frame),
        }
    }

    /// Stateless classification.
    pub fn classify(&self, buffer: &[u8], quiet: Duration) -> ReadinessState {
        decide(&self.inspect(buffer), quiet, self.debounce)
    }
}

fn decide(frame: &FrameMatch, quiet: Duration, debounce: Duration) -> ReadinessState {
    if frame.permission.is_some() {
        ReadinessState::WaitingForPermission
    } else if frame.ready.is_some() && !frame.busy && quiet >= debounce {
        ReadinessState::Ready
    } else {
        ReadinessState::Busy
    }
}

/// Result of one tracked poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub state: ReadinessState,
    /// True only on the poll that opened a new permission episode.
    pub prompt_opened: bool,
    /// The permission pattern that matched on this poll, if any.
    pub prompt_pattern: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ReadinessTracker {
    latched: bool,
    episodes: u64,
}

impl ReadinessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, analyzer: &ScreenAnalyzer, buffer: &[u8], quiet: Duration) -> Observation {
        let frame = analyzer.inspect(buffer);

        if let Some(pattern) = frame.permission {
            let prompt_opened = !self.latched;
            if prompt_opened {
                self.episodes += 1;
            }
            self.latched = true;
            return Observation {
                state: ReadinessState::WaitingForPermission,
                prompt_opened,
                prompt_pattern: Some(pattern),
            };
        }

        if self.latched {
            if !frame.resolved {
                return Observation {
                    state: ReadinessState::WaitingForPermission,
                    prompt_opened: false,
                    prompt_pattern: None,
                };
            }
            self.latched = false;
        }

        Observation {
            state: decide(&frame, quiet, analyzer.debounce()),
            prompt_opened: false,
            prompt_pattern: None,
        }
    }

    pub fn is_latched(&self) -> bool {
        self.latched
    }

    /// Number of permission episodes seen so far.
    pub fn episodes(&self) -> u64 {
        self.episodes
    }

    pub fn reset(&mut self) {
        self.latched = false;
    }
}
