use crate::error::Result;

use chrono::{DateTime, TimeDelta, Utc};
use std::sync::Mutex;

/// The replica's loosely synchronized clock. Network time is the local wall
/// clock shifted by a signed offset, which the Berkeley pass nudges toward
/// the cluster mean. The offset lives in memory only; on restart it is
/// reseeded from the CLI, so timestamps across restarts are advisory.
pub struct Clock {
    offset: Mutex<TimeDelta>,
}

impl Clock {
    /// Creates a clock with the given initial offset.
    pub fn new(offset: TimeDelta) -> Self {
        Clock { offset: Mutex::new(offset) }
    }

    /// Returns the current network time.
    pub fn now(&self) -> Result<DateTime<Utc>> {
        Ok(Utc::now() + *self.offset.lock()?)
    }

    /// Shifts the offset by the given delta.
    pub fn adjust(&self, delta: TimeDelta) -> Result<()> {
        let mut offset = self.offset.lock()?;
        *offset += delta;
        Ok(())
    }

    /// Returns the current offset.
    pub fn offset(&self) -> Result<TimeDelta> {
        Ok(*self.offset.lock()?)
    }
}

/// Computes the Berkeley correction from the observed peer offsets: the mean
/// over the peers plus the coordinating leader, whose own offset is zero by
/// definition.
pub fn average_offset(deltas: &[TimeDelta]) -> TimeDelta {
    let sum: i64 = deltas.iter().filter_map(|d| d.num_microseconds()).sum();
    TimeDelta::microseconds(sum / (deltas.len() as i64 + 1))
}
