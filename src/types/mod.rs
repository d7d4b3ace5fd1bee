//! Core value types shared by the telemetry and video paths.
//!
//! - [`TelemetryRecord`] is one decoded position/kinematics fix
//! - [`Frame`] is one complete image extracted from the pipeline's multipart stream
//! - [`UpdateRate`] controls how fast frame subscriptions are delivered
//!
//! ## Usage Example
//!
//! ```rust
//! use skyrelay::types::{Frame, UpdateRate};
//! use std::time::Duration;
//!
//! let frame = Frame::new(vec![0xFF, 0xD8, 0xFF, 0xD9], 1);
//! assert_eq!(frame.len(), 4);
//!
//! assert_eq!(UpdateRate::Max(10).interval(), Some(Duration::from_millis(100)));
//! assert_eq!(UpdateRate::Native.interval(), None);
//! ```

mod frame;
mod record;
mod update_rate;

pub use frame::Frame;
pub use record::TelemetryRecord;
pub use update_rate::UpdateRate;

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;

    proptest! {
        #[test]
        fn frame_clones_share_the_buffer(
            data in prop::collection::vec(any::<u8>(), 0..512),
            seq in any::<u64>(),
        ) {
            let frame = Frame::new(data.clone(), seq);
            let cloned = frame.clone();

            prop_assert!(std::sync::Arc::ptr_eq(&frame.data, &cloned.data));
            prop_assert_eq!(cloned.as_bytes(), data.as_slice());
            prop_assert_eq!(cloned.sequence, seq);
        }

        #[test]
        fn throttled_rates_always_have_positive_interval(hz in 1u32..1000) {
            let interval = UpdateRate::Max(hz).interval().expect("throttled rate has an interval");
            prop_assert!(interval > std::time::Duration::ZERO);
        }
    }
}
