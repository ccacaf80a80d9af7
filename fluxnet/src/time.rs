//! Timestamp helpers shared by the latency planner and the header-option
//! writer, grounded in the teacher's `flux::time` module (`timestamp_secs`)
//! and in the original source's `Client::getTimestamp_ms` family.

use std::time::{SystemTime, UNIX_EPOCH};

/// The 16-bit modulo timestamps wrap at this many milliseconds (spec.md §9).
pub const TIMESTAMP_MODULO: u32 = 1 << 16;

/// Current time in milliseconds since the epoch, truncated to 16 bits.
/// Sufficient for sub-minute RTT measurement (spec.md §9).
#[inline]
pub fn now_ms() -> u16 {
    (now_full_ms() % TIMESTAMP_MODULO as u64) as u16
}

/// Current time in milliseconds since the epoch, full resolution. Used only
/// by the clock-offset smoother (spec.md §9).
#[inline]
pub fn now_full_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("closed timelike curve, reality compromised")
        .as_millis() as u64
}

/// Modulo-wrap aware one-way latency between a 16-bit `sent` and `received`
/// timestamp (spec.md §9: "wrap handled by signed subtraction with modular
/// correction").
#[inline]
pub fn compute_latency_ms(sent: u16, received: u16) -> u16 {
    let mut t = received as i32 - sent as i32;
    if t < 0 {
        t += TIMESTAMP_MODULO as i32;
    }
    t as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latency_without_wrap() {
        assert_eq!(compute_latency_ms(100, 150), 50);
    }

    #[test]
    fn latency_across_wrap_boundary() {
        // sent just before wraparound, received just after
        assert_eq!(compute_latency_ms(65530, 5), 11);
    }

    #[test]
    fn zero_latency() {
        assert_eq!(compute_latency_ms(42, 42), 0);
    }
}
