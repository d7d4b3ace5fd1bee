//! Update rate control for frame subscriptions

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Update rate for frame streams
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateRate {
    /// Every frame the pipeline produces
    #[default]
    Native,

    /// Throttled to at most this many frames per second
    /// A rate of zero is treated as Native
    Max(u32),
}

impl UpdateRate {
    /// Check if throttling is needed
    pub fn needs_throttle(self) -> bool {
        self.interval().is_some()
    }

    /// Get throttle interval if needed
    pub fn interval(self) -> Option<Duration> {
        match self {
            UpdateRate::Native | UpdateRate::Max(0) => None,
            UpdateRate::Max(hz) => Some(Duration::from_secs_f64(1.0 / hz as f64)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_rate_is_native() {
        assert!(!UpdateRate::Max(0).needs_throttle());
        assert!(!UpdateRate::Native.needs_throttle());
        assert!(UpdateRate::Max(5).needs_throttle());
    }

    #[test]
    fn interval_matches_rate() {
        assert_eq!(UpdateRate::Max(4).interval(), Some(Duration::from_millis(250)));
    }
}
