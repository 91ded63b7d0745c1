//! Bounded ring of recent interaction snippets.

use std::collections::VecDeque;

pub const DEFAULT_CONTEXT_CAPACITY: usize = 10;
pub const DEFAULT_SNIPPET_CHARS: usize = 500;

#[derive(Debug, Clone)]
pub struct ContextRing {
    entries: VecDeque<String>,
    capacity: usize,
    max_snippet_chars: usize,
}

impl ContextRing {
    pub fn new(capacity: usize, max_snippet_chars: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            max_snippet_chars,
        }
    }

    /// Record `role: text`, truncated. The oldest entry is dropped at capacity.
    pub fn push(&mut self, role: &str, text: &str) {
        if self.capacity == 0 {
            return;
        }
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        let snippet: String = text.chars().take(self.max_snippet_chars).collect();
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(format!("{role}: {snippet}"));
    }

    /// Oldest first.
    pub fn snapshot(&self) -> Vec<String> {
        self.entries.iter().cloned().collect()
    }

    /// Replace the contents with `entries`, keeping only the newest `capacity`.
    pub fn restore(&mut self, entries: &[String]) {
        self.entries.clear();
        let skip = entries.len().saturating_sub(self.capacity);
        self.entries.extend(entries.iter().skip(skip).cloned());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl Default for ContextRing {
    fn default() -> Self {
        Self::new(DEFAULT_CONTEXT_CAPACITY, DEFAULT_SNIPPET_CHARS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_newest_entries() {
        let mut ring = ContextRing::new(2, 100);
        ring.push("user", "one");
        ring.push("assistant", "two");
        ring.push("user", "three");
        assert_eq!(ring.snapshot(), vec!["assistant: two", "user: three"]);
    }

    #[test]
    fn truncates_and_skips_blank_snippets() {
        let mut ring = ContextRing::new(4, 3);
        ring.push("user", "   ");
        ring.push("user", "abcdef");
        assert_eq!(ring.snapshot(), vec!["user: abc"]);
    }

    #[test]
    fn restore_respects_capacity() {
        let mut ring = ContextRing::new(2, 100);
        let saved = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        ring.restore(&saved);
        assert_eq!(ring.snapshot(), vec!["b", "c"]);
    }
}
