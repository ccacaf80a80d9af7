//! Tunable constants (spec.md §6.6), gathered into a builder struct the way
//! `quinn-proto::TransportConfig` groups its knobs: private fields, chained
//! `&mut self -> &mut Self` setters, and a `Default` seeded with the spec's
//! defaults.

use std::time::Duration;

/// Max flux packets (per flux).
pub const DEFAULT_MAX_FLUX_PACKETS: usize = 200;
/// Reception `select` timeout.
pub const DEFAULT_RECEPTION_TIMEOUT_MS: u64 = 100;
/// Command queue update tick.
pub const DEFAULT_CMD_UPDATE_TICK_MS: u64 = 50;
/// Timeout once `connected`.
pub const DEFAULT_CONNECTED_TIMEOUT_S: u64 = 30;
/// Timeout before `connected` (handshake/MTU/DTLS in progress).
pub const DEFAULT_STATUS_TIMEOUT_S: u64 = 5;
/// Piggy-back return-packet cadence.
pub const DEFAULT_PACKET_RETURN_RATE_MS: u64 = 100;
/// Reorderer capacity before it enters forced mode.
pub const DEFAULT_REORDERER_CAPACITY: usize = 8;
/// Ack-cache capacity before the alarm flag is raised.
pub const DEFAULT_CACHE_MAX: usize = 512;
/// Ack-cache delay factor (× return-rate).
pub const DEFAULT_CACHE_DELAY_FACTOR: f32 = 2.0;
/// Ack-cache minimum latency floor, in milliseconds.
pub const DEFAULT_CACHE_MIN_LATENCY_MS: u64 = 40;
/// Ack-cache retry limit: the 4th attempt drops the packet.
pub const DEFAULT_CACHE_RETRY_LIMIT: u32 = 3;
/// Maximum uncompressed datagram payload.
pub const DEFAULT_MAX_UNCOMPRESSED_DATAGRAM: usize = 64 * 1024;
/// UDP datagram ceiling.
pub const FULL_DATAGRAM_SIZE: usize = 65_507;
/// Client GC sweep delay (weak-reference reap).
pub const DEFAULT_CLIENT_GC_DELAY_MS: u64 = 5_000;
/// Floor for IPv4 path MTUs.
pub const MTU_FLOOR_V4: u16 = 576;
/// Floor for IPv6 path MTUs.
pub const MTU_FLOOR_V6: u16 = 1280;
/// Default default-latency value used before any measurement exists.
pub const DEFAULT_LATENCY_MS: u16 = 100;
/// Sentinel marking "no measurement" in latency wire fields.
pub const BAD_LATENCY: u16 = u16::MAX;
/// Clock-offset smoothing window length.
pub const DEFAULT_OFFSET_WINDOW: usize = 8;

/// Grouped, overridable tunables for a client or server engine.
#[derive(Debug, Clone)]
pub struct NetConfig {
    max_flux_packets: usize,
    reception_timeout: Duration,
    cmd_update_tick: Duration,
    connected_timeout: Duration,
    status_timeout: Duration,
    packet_return_rate: Duration,
    reorderer_capacity: usize,
    cache_max: usize,
    cache_delay_factor: f32,
    cache_min_latency: Duration,
    cache_retry_limit: u32,
    max_uncompressed_datagram: usize,
    client_gc_delay: Duration,
    defragmenter_max_groups: usize,
}

impl Default for NetConfig {
    fn default() -> Self {
        NetConfig {
            max_flux_packets: DEFAULT_MAX_FLUX_PACKETS,
            reception_timeout: Duration::from_millis(DEFAULT_RECEPTION_TIMEOUT_MS),
            cmd_update_tick: Duration::from_millis(DEFAULT_CMD_UPDATE_TICK_MS),
            connected_timeout: Duration::from_secs(DEFAULT_CONNECTED_TIMEOUT_S),
            status_timeout: Duration::from_secs(DEFAULT_STATUS_TIMEOUT_S),
            packet_return_rate: Duration::from_millis(DEFAULT_PACKET_RETURN_RATE_MS),
            reorderer_capacity: DEFAULT_REORDERER_CAPACITY,
            cache_max: DEFAULT_CACHE_MAX,
            cache_delay_factor: DEFAULT_CACHE_DELAY_FACTOR,
            cache_min_latency: Duration::from_millis(DEFAULT_CACHE_MIN_LATENCY_MS),
            cache_retry_limit: DEFAULT_CACHE_RETRY_LIMIT,
            max_uncompressed_datagram: DEFAULT_MAX_UNCOMPRESSED_DATAGRAM,
            client_gc_delay: Duration::from_millis(DEFAULT_CLIENT_GC_DELAY_MS),
            // spec.md §9 open question: the original has no explicit cap
            // ("TODO: remove the oldest data if the cache is full"); we pick
            // 16 concurrent fragment groups per peer, oldest evicted.
            defragmenter_max_groups: 16,
        }
    }
}

macro_rules! accessor {
    ($field:ident, $setter:ident, $ty:ty) => {
        pub fn $setter(&mut self, value: $ty) -> &mut Self {
            self.$field = value;
            self
        }

        pub fn $field(&self) -> $ty {
            self.$field
        }
    };
}

impl NetConfig {
    accessor!(max_flux_packets, set_max_flux_packets, usize);
    accessor!(reception_timeout, set_reception_timeout, Duration);
    accessor!(cmd_update_tick, set_cmd_update_tick, Duration);
    accessor!(connected_timeout, set_connected_timeout, Duration);
    accessor!(status_timeout, set_status_timeout, Duration);
    accessor!(packet_return_rate, set_packet_return_rate, Duration);
    accessor!(reorderer_capacity, set_reorderer_capacity, usize);
    accessor!(cache_max, set_cache_max, usize);
    accessor!(cache_delay_factor, set_cache_delay_factor, f32);
    accessor!(cache_min_latency, set_cache_min_latency, Duration);
    accessor!(cache_retry_limit, set_cache_retry_limit, u32);
    accessor!(
        max_uncompressed_datagram,
        set_max_uncompressed_datagram,
        usize
    );
    accessor!(client_gc_delay, set_client_gc_delay, Duration);
    accessor!(defragmenter_max_groups, set_defragmenter_max_groups, usize);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let cfg = NetConfig::default();
        assert_eq!(cfg.max_flux_packets(), 200);
        assert_eq!(cfg.reorderer_capacity(), 8);
        assert_eq!(cfg.cache_max(), 512);
        assert_eq!(cfg.cache_retry_limit(), 3);
    }

    #[test]
    fn setters_chain_and_stick() {
        let mut cfg = NetConfig::default();
        cfg.set_reorderer_capacity(4).set_cache_max(16);
        assert_eq!(cfg.reorderer_capacity(), 4);
        assert_eq!(cfg.cache_max(), 16);
    }
}
