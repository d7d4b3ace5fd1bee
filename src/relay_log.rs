//! Bounded diagnostic line buffers

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Default capacity for pipeline process logs
pub const PIPELINE_LOG_CAPACITY: usize = 50;

/// Default capacity for satellite relay diagnostics
pub const RELAY_LOG_CAPACITY: usize = 100;

/// Fixed-capacity FIFO of diagnostic lines
///
/// Cloning yields another handle onto the same buffer, so the session, the
/// process output pumps and the diagnostics endpoint can all share one log.
/// Appending beyond capacity evicts the oldest line.
#[derive(Debug, Clone)]
pub struct RelayLog {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl RelayLog {
    pub fn new(capacity: usize) -> Self {
        Self { lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))), capacity }
    }

    /// Append a line, evicting the oldest when full
    pub fn append(&self, line: impl Into<String>) {
        if self.capacity == 0 {
            return;
        }

        let mut lines = self.lock();
        while lines.len() >= self.capacity {
            lines.pop_front();
        }
        lines.push_back(line.into());
    }

    /// The last `min(n, len)` lines, oldest first
    pub fn recent(&self, n: usize) -> Vec<String> {
        let lines = self.lock();
        let skip = lines.len().saturating_sub(n);
        lines.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    // A panic while holding the lock cannot leave the deque half-written
    fn lock(&self) -> MutexGuard<'_, VecDeque<String>> {
        self.lines.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for RelayLog {
    fn default() -> Self {
        Self::new(RELAY_LOG_CAPACITY)
    }
}
