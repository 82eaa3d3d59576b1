//! Rolling buffer - bounded replay of recent stream output.
//!
//! Not the provider's context: a reconstructable transcript the daemon can
//! prepend to the next prompt after compaction. Budgeted in tokens at the
//! usual ~4 chars/token, FIFO eviction.

use std::collections::VecDeque;

pub struct RollingBuffer {
    max_chars: usize,
    chunks: VecDeque<String>,
    total_chars: usize,
}

impl RollingBuffer {
    pub fn new(max_tokens: usize) -> RollingBuffer {
        RollingBuffer {
            max_chars: max_tokens.saturating_mul(4),
            chunks: VecDeque::new(),
            total_chars: 0,
        }
    }

    pub fn append(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        self.total_chars += text.len();
        self.chunks.push_back(text.to_string());
        while self.total_chars > self.max_chars {
            match self.chunks.pop_front() {
                Some(evicted) => self.total_chars -= evicted.len(),
                None => break,
            }
        }
    }

    /// The current replay, oldest chunk first.
    pub fn snapshot(&self) -> String {
        self.chunks.iter().map(String::as_str).collect()
    }

    /// Snapshot truncated to at most `max_chars`, keeping the newest tail.
    pub fn snapshot_capped(&self, max_chars: usize) -> String {
        let full = self.snapshot();
        if full.len() <= max_chars {
            return full;
        }
        let cut = full.len() - max_chars;
        // Cut on a char boundary.
        let mut start = cut;
        while !full.is_char_boundary(start) {
            start += 1;
        }
        full[start..].to_string()
    }

    pub fn len(&self) -> usize {
        self.total_chars
    }

    pub fn is_empty(&self) -> bool {
        self.total_chars == 0
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.total_chars = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest_first() {
        // 2 tokens = 8 chars of budget.
        let mut buffer = RollingBuffer::new(2);
        buffer.append("aaaa");
        buffer.append("bbbb");
        assert_eq!(buffer.snapshot(), "aaaabbbb");
        buffer.append("cc");
        assert_eq!(buffer.snapshot(), "bbbbcc");
        assert!(buffer.len() <= 8);
    }

    #[test]
    fn capped_snapshot_keeps_the_tail() {
        let mut buffer = RollingBuffer::new(100);
        buffer.append("0123456789");
        assert_eq!(buffer.snapshot_capped(4), "6789");
        assert_eq!(buffer.snapshot_capped(100), "0123456789");
    }

    #[test]
    fn oversized_single_chunk_is_dropped_when_over_budget() {
        let mut buffer = RollingBuffer::new(1);
        buffer.append("0123456789abcdef"); // 16 > 4-char budget
        assert!(buffer.is_empty());
    }
}
