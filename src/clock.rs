// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::lock;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Deadline timer backing the session keepalive ticker. The timer is armed
/// on creation and re-armed with `reset`. Expiration is checked by the
/// loops that own the timer rather than delivered asynchronously, so a
/// timer is only as precise as the resolution of the loop polling it.
pub struct Timer {
    /// How long the timer runs until it fires.
    pub interval: Duration,

    deadline: Mutex<Instant>,
}

impl Timer {
    /// Create a new timer with the specified interval.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            deadline: Mutex::new(Instant::now() + interval),
        }
    }

    /// Check if the timer has fired. Returns true once the interval has
    /// elapsed and keeps returning true until `reset` is called.
    pub fn expired(&self) -> bool {
        Instant::now() >= *lock!(self.deadline)
    }

    /// Re-arm the timer a full interval out from now.
    pub fn reset(&self) {
        *lock!(self.deadline) = Instant::now() + self.interval;
    }
}
