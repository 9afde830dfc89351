//! Timely congestion control.
//!
//! An RTT-gradient rate controller: each response fragment yields an RTT
//! sample (`ev_loop_tsc - tx_tsc` of the matching packet), and the estimated
//! rate drives the timing wheel's dispatch-time assignment. The rate is
//! clamped to `[MIN_RATE_BPS, link_rate]`.

/// Floor for the estimated rate, bytes per second (~40 Mbit/s).
pub const MIN_RATE_BPS: f64 = 5_000_000.0;

/// Samples below this RTT trigger additive increase, microseconds.
const T_LOW_US: f64 = 30.0;

/// Samples above this RTT trigger multiplicative decrease, microseconds.
const T_HIGH_US: f64 = 500.0;

/// EWMA weight for the RTT gradient.
const ALPHA: f64 = 0.875;

/// Multiplicative decrease factor.
const BETA: f64 = 0.8;

/// Additive increase step, bytes per second (5 MB/s).
const DELTA_BPS: f64 = 5_000_000.0;

/// Floor used when normalizing the gradient, microseconds.
const MIN_RTT_US: f64 = 2.0;

/// Samples between rate updates.
const UPDATE_INTERVAL: u32 = 16;

/// Per-session Timely state.
#[derive(Debug, Clone)]
pub struct Timely {
    rate_bps: f64,
    link_rate_bps: f64,
    prev_rtt_us: f64,
    rtt_grad: f64,
    min_rtt_us: f64,
    samples_since_update: u32,
    /// Datapath retransmissions charged to this session.
    pub num_retransmissions: u64,
    freq_ghz: f64,
}

impl Timely {
    pub fn new(link_bandwidth_gbps: f64, freq_ghz: f64) -> Self {
        let link_rate_bps = link_bandwidth_gbps * 1e9 / 8.0;
        Self {
            rate_bps: link_rate_bps,
            link_rate_bps,
            prev_rtt_us: 0.0,
            rtt_grad: 0.0,
            min_rtt_us: f64::MAX,
            samples_since_update: 0,
            num_retransmissions: 0,
            freq_ghz,
        }
    }

    /// Current estimated rate in bytes per second.
    #[inline]
    pub fn rate_bps(&self) -> f64 {
        self.rate_bps
    }

    /// Cycles of spacing the wheel should put between `pkt_bytes`-sized
    /// packets at the current rate.
    #[inline]
    pub fn pkt_spacing_tsc(&self, pkt_bytes: usize) -> u64 {
        let secs = pkt_bytes as f64 / self.rate_bps;
        (secs * self.freq_ghz * 1e9) as u64
    }

    /// Feed one RTT sample, in TSC cycles.
    pub fn update(&mut self, rtt_tsc: u64) {
        let rtt_us = rtt_tsc as f64 / (self.freq_ghz * 1e3);
        if rtt_us < self.min_rtt_us {
            self.min_rtt_us = rtt_us;
        }

        self.samples_since_update += 1;
        if self.samples_since_update < UPDATE_INTERVAL {
            return;
        }
        self.samples_since_update = 0;

        let prev = self.prev_rtt_us;
        self.prev_rtt_us = rtt_us;
        if prev == 0.0 {
            return;
        }

        self.rtt_grad = ALPHA * self.rtt_grad + (1.0 - ALPHA) * (rtt_us - prev);

        let new_rate = if rtt_us < T_LOW_US {
            self.rate_bps + DELTA_BPS
        } else if rtt_us > T_HIGH_US {
            self.rate_bps * BETA
        } else {
            let normalized = self.rtt_grad / self.min_rtt_us.max(MIN_RTT_US);
            if normalized <= 0.0 {
                self.rate_bps + DELTA_BPS
            } else {
                (self.rate_bps * (1.0 - normalized * BETA)).max(MIN_RATE_BPS)
            }
        };

        self.rate_bps = new_rate.clamp(MIN_RATE_BPS, self.link_rate_bps);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FREQ: f64 = 2.0; // GHz

    fn cycles_us(us: f64) -> u64 {
        (us * FREQ * 1e3) as u64
    }

    #[test]
    fn rate_starts_at_link_rate() {
        let t = Timely::new(10.0, FREQ);
        assert_eq!(t.rate_bps(), 10.0 * 1e9 / 8.0);
    }

    #[test]
    fn high_rtt_decreases_rate() {
        let mut t = Timely::new(10.0, FREQ);
        let initial = t.rate_bps();
        // Two full update windows so prev_rtt is primed.
        for _ in 0..(UPDATE_INTERVAL * 2 + 2) {
            t.update(cycles_us(600.0));
        }
        assert!(t.rate_bps() < initial);
        assert!(t.rate_bps() >= MIN_RATE_BPS);
    }

    #[test]
    fn low_rtt_recovers_rate() {
        let mut t = Timely::new(10.0, FREQ);
        for _ in 0..(UPDATE_INTERVAL * 4) {
            t.update(cycles_us(600.0));
        }
        let depressed = t.rate_bps();
        for _ in 0..(UPDATE_INTERVAL * 4) {
            t.update(cycles_us(5.0));
        }
        assert!(t.rate_bps() > depressed);
    }

    #[test]
    fn rate_never_exceeds_link() {
        let mut t = Timely::new(1.0, FREQ);
        for _ in 0..(UPDATE_INTERVAL * 8) {
            t.update(cycles_us(5.0));
        }
        assert!(t.rate_bps() <= 1.0 * 1e9 / 8.0);
    }

    #[test]
    fn spacing_scales_with_packet_size() {
        let t = Timely::new(10.0, FREQ);
        assert!(t.pkt_spacing_tsc(2048) >= t.pkt_spacing_tsc(1024));
    }
}
