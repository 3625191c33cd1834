//! Wire constants and per-mux tunables.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::timing::OptionalDuration;
use std::time::Duration;

/// Total size of one pooled frame buffer: the largest encoded frame.
pub(crate) const POOL_SIZE_BUFFER: usize = 4096;
/// Usable payload bytes in a pooled window buffer. The rest of the pooled
/// frame is reserved for the flag, stream id, length, and credit fields.
pub(crate) const POOL_SIZE_WINDOW: usize = POOL_SIZE_BUFFER - 2 - 4 - 4 - 1;
/// Largest payload of one data frame.
pub(crate) const MAXIMUM_SEGMENT_SIZE: usize = POOL_SIZE_WINDOW;
/// Hard cap on the sum of all receive windows.
pub(crate) const MAXIMUM_WINDOW_SIZE: u32 = 1 << 22;
/// A fresh stream starts with room for ten full segments.
pub(crate) const INITIAL_WINDOW_SIZE: u32 = (MAXIMUM_SEGMENT_SIZE * 10) as u32;

/// Bytes that must accumulate before the bandwidth estimator folds in a
/// new sample.
pub(crate) const BANDWIDTH_SAMPLE_BYTES: u64 = (MAXIMUM_SEGMENT_SIZE * 300) as u64;
/// Reported read bandwidth until a real sample exists (bytes/sec).
pub(crate) const BANDWIDTH_FLOOR: f64 = 100.0;
/// Smoothing factor for the bandwidth EWMA.
pub(crate) const BANDWIDTH_EWMA_ALPHA: f64 = 0.1;
/// Smoothing factor for the latency EWMA.
pub(crate) const LATENCY_EWMA_ALPHA: f64 = 0.2;
/// Latency samples above this are assumed to be clock artifacts and dropped.
pub(crate) const LATENCY_SAMPLE_CAP: f64 = 60.0;

/// Default interval between keepalive pings.
pub(crate) const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);
/// Default bound on how long a dial waits for the peer's verdict.
pub(crate) const DIAL_TIMEOUT: Duration = Duration::from_secs(30);
/// Initial capacity of the smallest receive-queue ring.
pub(crate) const INITIAL_RING_CAPACITY: usize = 64;
/// Rings stop doubling at this capacity.
pub(crate) const MAXIMUM_RING_CAPACITY: usize = 1 << 16;
/// Idle objects kept per pool before surplus is dropped.
pub(crate) const POOL_MAX_IDLE: usize = 1024;

/// Tunables for one [`Mux`](crate::Mux).
#[derive(Clone, Copy, Debug)]
pub struct MuxConfig {
    /// Interval between keepalive pings. [`OptionalDuration::NONE`]
    /// disables pinging (and with it the dead-peer detection).
    pub keepalive_interval: OptionalDuration,
    /// The mux shuts down after this many keepalive intervals without a
    /// pong from the peer.
    pub ping_timeout_intervals: u32,
    /// Streams the peer may open ahead of `accept` calls before new opens
    /// are refused.
    pub accept_backlog: usize,
    /// How long `new_stream` waits for the peer to accept or refuse.
    pub dial_timeout: Duration,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: OptionalDuration::new(KEEPALIVE_INTERVAL),
            ping_timeout_intervals: 3,
            accept_backlog: 64,
            dial_timeout: DIAL_TIMEOUT,
        }
    }
}
