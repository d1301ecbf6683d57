//! Millisecond clock arithmetic shared by both bus nodes.
//!
//! Wire timestamps are 13-bit (modulo 8192 ms) and the node clocks are u32
//! milliseconds since boot; every delta here is wraparound-safe.

/// Wire timestamps wrap at this value.
pub const TIMESTAMP_MODULO: u32 = 0x2000;

/// Truncate a node clock to the 13-bit wire timestamp.
pub fn wire_timestamp(now_ms: u32) -> u16 {
    (now_ms % TIMESTAMP_MODULO) as u16
}

/// Elapsed milliseconds between two wire timestamps, assuming at most one
/// wrap between them.
pub fn timestamp_delta(prev: u16, curr: u16) -> u32 {
    if prev <= curr {
        (curr - prev) as u32
    } else {
        TIMESTAMP_MODULO - prev as u32 + curr as u32
    }
}

/// Delta between two readings of the lifetime pulse counter.
pub fn pulse_delta(prev: u32, curr: u32) -> u32 {
    curr.wrapping_sub(prev)
}

/// Fixed-period timer against a wrapping u32 millisecond clock.
///
/// `fire` advances the deadline by exactly one period per firing (never
/// resets to `now`), so the long-run rate does not drift when the caller
/// polls late. A stalled caller catches up one period per poll.
#[derive(Debug, Clone, Copy)]
pub struct PeriodicTimer {
    period_ms: u32,
    last_ms: u32,
}

impl PeriodicTimer {
    pub fn new(period_ms: u32) -> Self {
        Self { period_ms, last_ms: 0 }
    }

    /// Timer whose first deadline is one period after `now_ms`.
    pub fn starting_at(period_ms: u32, now_ms: u32) -> Self {
        Self { period_ms, last_ms: now_ms }
    }

    pub fn fire(&mut self, now_ms: u32) -> bool {
        if now_ms.wrapping_sub(self.last_ms) >= self.period_ms {
            self.last_ms = self.last_ms.wrapping_add(self.period_ms);
            true
        } else {
            false
        }
    }
}
