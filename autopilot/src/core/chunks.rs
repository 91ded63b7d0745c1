//! Chunk planning for submissions.

pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// Split `text` into fixed-size byte chunks.
///
/// Chunks may split a multi-byte character; the PTY reassembles the stream.
/// Empty text yields no chunks.
pub fn plan_chunks(text: &str, chunk_size: usize) -> std::slice::Chunks<'_, u8> {
    text.as_bytes().chunks(chunk_size.max(1))
}

/// `ceil(len / chunk_size)`.
pub fn chunk_count(len: usize, chunk_size: usize) -> usize {
    len.div_ceil(chunk_size.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_count_matches_plan() {
        for (len, size) in [(0, 4), (1, 4), (4, 4), (5, 4), (2500, 1024)] {
            let text = "x".repeat(len);
            assert_eq!(plan_chunks(&text, size).count(), chunk_count(len, size));
        }
    }

    #[test]
    fn chunks_are_bytes_not_chars() {
        let chunks: Vec<_> = plan_chunks("héllo", 2).collect();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.concat(), "héllo".as_bytes());
    }
}
