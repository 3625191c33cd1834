//! Passive bandwidth and latency estimation. Both figures feed the
//! receive-window sizer, which reads them lock-free as `f64` bit patterns.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::config::{
    BANDWIDTH_EWMA_ALPHA, BANDWIDTH_FLOOR, BANDWIDTH_SAMPLE_BYTES, LATENCY_EWMA_ALPHA,
    LATENCY_SAMPLE_CAP,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Default)]
struct SampleWindow {
    bytes: u64,
    started: Option<Instant>,
}

/// Per-mux estimator. Inbound payload bytes are counted into a rolling
/// window; once enough accumulate, the observed rate is folded into an EWMA.
/// Latency comes from halved ping round trips, folded the same way.
#[derive(Debug)]
pub(crate) struct Estimator {
    /// Smoothed read rate in bytes/sec, stored as `f64` bits.
    read_bandwidth: AtomicU64,
    /// Smoothed one-way latency in seconds, stored as `f64` bits.
    latency: AtomicU64,
    window: Mutex<SampleWindow>,
    /// Only wall-clock transports feed the estimator.
    enabled: bool,
}

impl Estimator {
    pub(crate) fn new(enabled: bool) -> Self {
        Self {
            read_bandwidth: AtomicU64::new(0f64.to_bits()),
            latency: AtomicU64::new(0f64.to_bits()),
            window: Mutex::new(SampleWindow::default()),
            enabled,
        }
    }

    /// Count `n` inbound payload bytes, folding in a rate sample once the
    /// window holds enough of them.
    pub(crate) fn on_read(&self, n: u16) {
        if !self.enabled {
            return;
        }
        let mut window = self.window.lock();
        let now = Instant::now();
        let started = *window.started.get_or_insert(now);
        window.bytes += u64::from(n);
        if window.bytes >= BANDWIDTH_SAMPLE_BYTES {
            let elapsed = (now - started).as_secs_f64();
            if elapsed > 0.0 {
                let sample = window.bytes as f64 / elapsed;
                let prev = f64::from_bits(self.read_bandwidth.load(Ordering::Relaxed));
                let next = if prev > 0.0 {
                    prev.mul_add(1.0 - BANDWIDTH_EWMA_ALPHA, sample * BANDWIDTH_EWMA_ALPHA)
                } else {
                    sample
                };
                self.read_bandwidth.store(next.to_bits(), Ordering::Relaxed);
            }
            window.bytes = 0;
            window.started = Some(now);
        }
    }

    /// Fold one ping round trip into the latency estimate.
    pub(crate) fn on_pong(&self, rtt: Duration) {
        if !self.enabled {
            return;
        }
        let sample = rtt.as_secs_f64() / 2.0;
        if sample <= 0.0 || sample > LATENCY_SAMPLE_CAP {
            return;
        }
        loop {
            let current = self.latency.load(Ordering::Relaxed);
            let prev = f64::from_bits(current);
            let next = if prev > 0.0 {
                prev.mul_add(1.0 - LATENCY_EWMA_ALPHA, sample * LATENCY_EWMA_ALPHA)
            } else {
                sample
            };
            if self
                .latency
                .compare_exchange_weak(current, next.to_bits(), Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Smoothed read rate in bytes/sec, never nonpositive.
    pub(crate) fn read_bandwidth(&self) -> f64 {
        let bw = f64::from_bits(self.read_bandwidth.load(Ordering::Relaxed));
        if bw <= 0.0 {
            BANDWIDTH_FLOOR
        } else {
            bw
        }
    }

    /// Smoothed one-way latency in seconds; zero until the first pong.
    pub(crate) fn latency(&self) -> f64 {
        f64::from_bits(self.latency.load(Ordering::Relaxed))
    }
}
