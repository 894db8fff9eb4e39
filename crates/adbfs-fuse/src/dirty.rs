//! A dirty flag that remembers when it was first raised.

use std::time::{Duration, Instant};

/// Tracks whether in-memory contents diverge from the device, and since
/// when. Setting an already-set flag keeps the original instant, so the age
/// measures the oldest un-flushed modification.
#[derive(Debug, Default)]
pub struct DirtyTimestamp {
    since: Option<Instant>,
}

impl DirtyTimestamp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self) {
        if self.since.is_none() {
            self.since = Some(Instant::now());
        }
    }

    pub fn clear(&mut self) {
        self.since = None;
    }

    pub fn is_set(&self) -> bool {
        self.since.is_some()
    }

    /// True iff set and the flag has been up for longer than `age`.
    pub fn has_been_dirty_for(&self, age: Duration) -> bool {
        match self.since {
            Some(since) => since.elapsed() > age,
            None => false,
        }
    }
}
