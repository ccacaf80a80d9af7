//! Per-peer latency/clock-offset planner (spec.md §4.4), grounded in the
//! original source's `Client` latency bookkeeping (`C_client.cpp`:
//! `g_CTOSLatency_ms`/`g_STOCLatency_ms`/`g_correctorTimestamp` and the
//! `computeLatency_ms` helper, now shared as [`crate::time::compute_latency_ms`]).

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::config::{BAD_LATENCY, DEFAULT_LATENCY_MS, DEFAULT_OFFSET_WINDOW};
use crate::time::compute_latency_ms;

/// Tracks one-way latency estimates in both directions plus a smoothed
/// clock-offset correction, all keyed off piggy-backed 16-bit timestamps
/// (spec.md §4.4, §9).
pub struct LatencyPlanner {
    ctos_latency_ms: u16,
    stoc_latency_ms: u16,
    corrector_timestamp: Option<u16>,
    pending_echo: Option<u16>,
    offset_samples: VecDeque<i32>,
    offset_window: usize,
    last_packet_at: Instant,
}

impl LatencyPlanner {
    pub fn new(offset_window: usize) -> LatencyPlanner {
        LatencyPlanner {
            ctos_latency_ms: DEFAULT_LATENCY_MS,
            stoc_latency_ms: DEFAULT_LATENCY_MS,
            corrector_timestamp: None,
            pending_echo: None,
            offset_samples: VecDeque::with_capacity(offset_window),
            offset_window,
            last_packet_at: Instant::now(),
        }
    }

    pub fn set_ctos_latency_ms(&mut self, latency: u16) {
        self.ctos_latency_ms = latency;
    }

    pub fn set_stoc_latency_ms(&mut self, latency: u16) {
        self.stoc_latency_ms = latency;
    }

    pub fn ctos_latency_ms(&self) -> u16 {
        self.ctos_latency_ms
    }

    pub fn stoc_latency_ms(&self) -> u16 {
        self.stoc_latency_ms
    }

    /// Round-trip estimate: sum of both one-way legs (spec.md §4.4
    /// `getPing_ms`). `BAD_LATENCY` propagates through if either leg hasn't
    /// been measured yet.
    pub fn ping_ms(&self) -> u16 {
        if self.ctos_latency_ms == BAD_LATENCY || self.stoc_latency_ms == BAD_LATENCY {
            return BAD_LATENCY;
        }
        self.ctos_latency_ms.saturating_add(self.stoc_latency_ms)
    }

    /// Round-trip-time estimate used by the ack cache's retransmit delay
    /// (spec.md §4.5).
    pub fn round_trip_time_ms(&self) -> Option<u16> {
        match self.ping_ms() {
            BAD_LATENCY => None,
            ping => Some(ping),
        }
    }

    /// Stashes the timestamp the peer wants echoed back so the corrector
    /// latency can be computed once the echo returns (spec.md §4.4
    /// `setCorrectorTimestamp`).
    pub fn set_corrector_timestamp(&mut self, timestamp: u16) {
        self.corrector_timestamp = Some(timestamp);
    }

    /// Remembers a timestamp the peer just sent us, to be echoed back in
    /// this side's next outgoing return packet (spec.md §4.4 ping-pong).
    pub fn note_peer_timestamp(&mut self, timestamp: u16) {
        self.pending_echo = Some(timestamp);
    }

    /// Takes the timestamp due to be echoed back, if any.
    pub fn take_pending_echo(&mut self) -> Option<u16> {
        self.pending_echo.take()
    }

    /// Consumes the pending corrector timestamp (if any) against `now`,
    /// recording a smoothed offset sample (spec.md §4.4 `getCorrectorLatency`).
    pub fn take_corrector_latency_ms(&mut self, now_ms: u16) -> Option<u16> {
        let sent = self.corrector_timestamp.take()?;
        let latency = compute_latency_ms(sent, now_ms);
        if self.offset_samples.len() >= self.offset_window {
            self.offset_samples.pop_front();
        }
        self.offset_samples.push_back(latency as i32);
        Some(latency)
    }

    /// Smoothed average of the last `offset_window` corrector samples
    /// (spec.md §9 clock-offset smoothing).
    pub fn smoothed_offset_ms(&self) -> Option<i32> {
        if self.offset_samples.is_empty() {
            return None;
        }
        let sum: i32 = self.offset_samples.iter().sum();
        Some(sum / self.offset_samples.len() as i32)
    }

    pub fn reset_last_packet_time(&mut self) {
        self.last_packet_at = Instant::now();
    }

    pub fn last_packet_elapsed(&self) -> Duration {
        self.last_packet_at.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_sums_both_legs() {
        let mut p = LatencyPlanner::new(DEFAULT_OFFSET_WINDOW);
        p.set_ctos_latency_ms(30);
        p.set_stoc_latency_ms(45);
        assert_eq!(p.ping_ms(), 75);
    }

    #[test]
    fn bad_latency_propagates() {
        let mut p = LatencyPlanner::new(DEFAULT_OFFSET_WINDOW);
        p.set_ctos_latency_ms(BAD_LATENCY);
        p.set_stoc_latency_ms(10);
        assert_eq!(p.ping_ms(), BAD_LATENCY);
        assert_eq!(p.round_trip_time_ms(), None);
    }

    #[test]
    fn corrector_latency_feeds_smoothed_offset() {
        let mut p = LatencyPlanner::new(2);
        p.set_corrector_timestamp(100);
        let latency = p.take_corrector_latency_ms(150).unwrap();
        assert_eq!(latency, 50);
        assert_eq!(p.smoothed_offset_ms(), Some(50));

        p.set_corrector_timestamp(100);
        p.take_corrector_latency_ms(160).unwrap();
        assert_eq!(p.smoothed_offset_ms(), Some((50 + 60) / 2));

        // window of 2: a third sample evicts the oldest
        p.set_corrector_timestamp(100);
        p.take_corrector_latency_ms(140).unwrap();
        assert_eq!(p.smoothed_offset_ms(), Some((60 + 40) / 2));
    }

    #[test]
    fn take_corrector_latency_is_none_without_a_pending_timestamp() {
        let mut p = LatencyPlanner::new(DEFAULT_OFFSET_WINDOW);
        assert_eq!(p.take_corrector_latency_ms(50), None);
    }

    #[test]
    fn pending_echo_is_taken_once() {
        let mut p = LatencyPlanner::new(DEFAULT_OFFSET_WINDOW);
        assert_eq!(p.take_pending_echo(), None);
        p.note_peer_timestamp(42);
        assert_eq!(p.take_pending_echo(), Some(42));
        assert_eq!(p.take_pending_echo(), None);
    }
}
