use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Bounded ring buffer of captured output lines.
///
/// The supervisor's capture task is the writer; log queries and crash
/// diagnosis are the readers. The buffer keeps the most recent N lines
/// and evicts the oldest first. All access goes through one mutex, so
/// readers always see a consistent snapshot, never a torn buffer.
///
/// Cloning is cheap and shares the underlying buffer.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    inner: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl LogBuffer {
    /// Creates an empty buffer holding at most `capacity` lines.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(1024)))),
            capacity,
        }
    }

    /// Appends one line, evicting the oldest when full.
    pub fn push(&self, line: String) {
        let mut buf = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if buf.len() == self.capacity {
            buf.pop_front();
        }
        buf.push_back(line);
    }

    /// Returns up to the `tail` most recent lines, oldest first,
    /// optionally keeping only lines containing `level`
    /// (case-insensitive).
    pub fn tail(&self, tail: usize, level: Option<&str>) -> Vec<String> {
        let buf = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let (front, back) = buf.as_slices();
        let mut lines = Vec::with_capacity(buf.len());
        lines.extend_from_slice(front);
        lines.extend_from_slice(back);
        tail_lines(&lines, tail, level)
    }

    /// Copies the whole buffer, oldest first.
    pub fn snapshot(&self) -> Vec<String> {
        let buf = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        buf.iter().cloned().collect()
    }

    /// Number of retained lines.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// True when no lines are retained.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Discards all retained lines.
    pub fn clear(&self) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

/// Returns up to the `tail` most recent entries of `lines`, oldest
/// first, optionally keeping only lines containing `level`
/// (case-insensitive). Also used against exit snapshots, where the
/// live buffer is gone.
pub fn tail_lines(lines: &[String], tail: usize, level: Option<&str>) -> Vec<String> {
    let filter = level.map(|l| l.to_uppercase());

    let matched: Vec<String> = lines
        .iter()
        .filter(|line| match &filter {
            Some(level) => line.to_uppercase().contains(level),
            None => true,
        })
        .cloned()
        .collect();

    let skip = matched.len().saturating_sub(tail);
    matched.into_iter().skip(skip).collect()
}
