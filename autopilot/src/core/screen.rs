//! Bounded accumulator for the child's current visible screen.

use crate::core::ansi::strip_ansi;
use crate::core::patterns::ClearMarkers;

pub const DEFAULT_MAX_BYTES: usize = 50_000;

/// Raw bytes of the current screen, not the full scrollback.
///
/// A full-clear marker resets the buffer to the bytes after it, so the buffer
/// never holds a complete marker. Markers split across two chunks are still
/// found because each scan starts `max_len - 1` bytes before the new chunk.
#[derive(Debug, Clone)]
pub struct ScreenBuffer {
    bytes: Vec<u8>,
    max_bytes: usize,
    markers: ClearMarkers,
    total_bytes: u64,
    clears: u64,
}

impl ScreenBuffer {
    pub fn new(max_bytes: usize, markers: ClearMarkers) -> Self {
        // The tail kept for split markers must always fit.
        let max_bytes = max_bytes.max(markers.max_len());
        Self {
            bytes: Vec::new(),
            max_bytes,
            markers,
            total_bytes: 0,
            clears: 0,
        }
    }

    /// Append one output chunk. Returns true when a clear marker reset the screen.
    pub fn append(&mut self, chunk: &[u8]) -> bool {
        if chunk.is_empty() {
            return false;
        }
        self.total_bytes += chunk.len() as u64;

        let overlap = self
            .markers
            .max_len()
            .saturating_sub(1)
            .min(self.bytes.len());
        let scan_from = self.bytes.len() - overlap;
        self.bytes.extend_from_slice(chunk);

        let cleared = match self.markers.last_end(&self.bytes[scan_from..]) {
            Some(end) => {
                self.bytes.drain(..scan_from + end);
                self.clears += 1;
                true
            }
            None => false,
        };

        if self.bytes.len() > self.max_bytes {
            let excess = self.bytes.len() - self.max_bytes;
            self.bytes.drain(..excess);
        }
        cleared
    }

    /// Live screen bytes.
    pub fn live(&self) -> &[u8] {
        &self.bytes
    }

    /// ANSI-stripped live screen.
    pub fn text(&self) -> String {
        strip_ansi(&self.bytes)
    }

    /// Last `max_chars` characters of the stripped screen, trimmed.
    pub fn tail_text(&self, max_chars: usize) -> String {
        let text = self.text();
        let trimmed = text.trim();
        let count = trimmed.chars().count();
        if count <= max_chars {
            return trimmed.to_string();
        }
        trimmed.chars().skip(count - max_chars).collect()
    }

    /// Drop the live screen. Growth counters are kept.
    pub fn clear(&mut self) {
        self.bytes.clear();
    }

    /// Bytes ever appended, including evicted and cleared ones.
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn clear_count(&self) -> u64 {
        self.clears
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::patterns::PatternSet;

    fn buffer(max_bytes: usize) -> ScreenBuffer {
        let patterns = PatternSet::default().compile().expect("compile");
        ScreenBuffer::new(max_bytes, patterns.clear_markers().clone())
    }

    #[test]
    fn clear_marker_resets_to_suffix() {
        let mut screen = buffer(1024);
        screen.append(b"stale output");
        assert!(screen.append(b"more\x1b[2Jfresh"));
        assert_eq!(screen.live(), b"fresh");
        assert_eq!(screen.total_bytes(), 25);
    }

    #[test]
    fn last_marker_in_chunk_wins() {
        let mut screen = buffer(1024);
        screen.append(b"a\x1b[2Jb\x1bcc");
        assert_eq!(screen.live(), b"c");
        assert_eq!(screen.clear_count(), 1);
    }

    #[test]
    fn split_marker_across_chunks_is_detected() {
        let mut screen = buffer(1024);
        screen.append(b"old screen\x1b[");
        assert_eq!(screen.clear_count(), 0);
        assert!(screen.append(b"2Jnew screen"));
        assert_eq!(screen.live(), b"new screen");
    }

    #[test]
    fn overflow_drops_oldest_bytes() {
        let mut screen = buffer(8);
        screen.append(b"0123456789");
        assert_eq!(screen.live(), b"23456789");
        assert_eq!(screen.total_bytes(), 10);
    }

    #[test]
    fn eviction_keeps_split_marker_prefix() {
        let mut screen = buffer(6);
        screen.append(b"abcdefgh\x1b[2");
        assert!(screen.live().ends_with(b"\x1b[2"));
        assert!(screen.append(b"Jdone"));
        assert_eq!(screen.live(), b"done");
    }

    #[test]
    fn tail_text_strips_and_truncates() {
        let mut screen = buffer(1024);
        screen.append(b"\x1b[1mhello world\x1b[0m\r\n");
        assert_eq!(screen.tail_text(5), "world");
        assert_eq!(screen.tail_text(100), "hello world");
    }

    #[test]
    fn clear_keeps_growth_counter() {
        let mut screen = buffer(1024);
        screen.append(b"abc");
        screen.clear();
        assert!(screen.is_empty());
        assert_eq!(screen.total_bytes(), 3);
    }
}
