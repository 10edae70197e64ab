//! Rotation schedules.
//!
//! Answers must change slowly: a requester who asks twice in one period
//! gets the same bridges, and a different set the next period.  A
//! schedule turns the current time into an opaque epoch string that is
//! mixed into every hashring position.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A schedule dividing all of time into fixed-length intervals.
#[derive(Clone, Debug)]
pub struct IntervalSchedule {
    /// Length of one interval, in seconds.  Never zero.
    length_in_sec: u64,
}

impl IntervalSchedule {
    /// Return a schedule with intervals of the given length.
    ///
    /// Sub-second lengths are rounded up to one second.
    pub fn new(length: Duration) -> Self {
        IntervalSchedule {
            length_in_sec: length.as_secs().max(1),
        }
    }

    /// Return the epoch string of the interval containing `when`.
    ///
    /// The string is the index of the interval since the Unix epoch;
    /// its only important property is that it is stable within an
    /// interval and different across intervals.
    pub fn interval_at(&self, when: SystemTime) -> String {
        let secs = when
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        (secs / self.length_in_sec).to_string()
    }
}
