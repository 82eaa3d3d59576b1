//! Stream handling - tail mirror and per-turn accounting.

use minion_core::StoreError;
use std::path::{Path, PathBuf};

/// Mirrors the tail of recent stream output to `streams/<agent>.tail` for
/// observability. Bounded; rewritten wholesale from an in-memory ring.
pub struct StreamTail {
    path: PathBuf,
    ring: crate::RollingBuffer,
}

impl StreamTail {
    /// `max_chars` bounds the on-disk tail.
    pub fn new(path: PathBuf, max_chars: usize) -> StreamTail {
        StreamTail {
            path,
            // RollingBuffer budgets in tokens at 4 chars each.
            ring: crate::RollingBuffer::new(max_chars.div_ceil(4)),
        }
    }

    pub fn push(&mut self, chunk: &str) {
        self.ring.append(chunk);
    }

    /// Flush the current ring to disk. Called at turn boundaries, not per
    /// event.
    pub fn flush(&self) -> minion_core::MinionResult<()> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)
                .map_err(|e| StoreError::io(dir.display().to_string(), e))?;
        }
        std::fs::write(&self.path, self.ring.snapshot())
            .map_err(|e| StoreError::io(self.path.display().to_string(), e))?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Accumulated facts about one provider turn.
#[derive(Debug, Clone, Default)]
pub struct TurnStats {
    pub exit_code: i32,
    pub timed_out: bool,
    pub interrupted: bool,
    pub compaction_detected: bool,
    /// Last-wins usage totals: the result event carries the full picture.
    pub turn_input: u64,
    pub turn_output: u64,
    pub context_window: Option<u64>,
    pub session_id: Option<String>,
}

impl TurnStats {
    pub fn ok(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_is_bounded_and_flushed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("streams").join("c1.tail");
        let mut tail = StreamTail::new(path.clone(), 8);
        tail.push("aaaa");
        tail.push("bbbb");
        tail.push("cccc");
        tail.flush().unwrap();
        let on_disk = std::fs::read_to_string(&path).unwrap();
        assert!(on_disk.len() <= 8);
        assert!(on_disk.ends_with("cccc"));
    }
}
