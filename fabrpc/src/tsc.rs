//! Timestamp-counter clock.
//!
//! The dispatch loop and the loss-detection scan run entirely on raw TSC
//! reads; wall-clock conversions go through a frequency measured once at
//! endpoint construction.

use std::time::{Duration, Instant};

/// Read the timestamp counter.
#[inline]
pub fn rdtsc() -> u64 {
    #[cfg(target_arch = "x86_64")]
    {
        unsafe { std::arch::x86_64::_rdtsc() }
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        use std::sync::OnceLock;
        static START: OnceLock<Instant> = OnceLock::new();
        let start = START.get_or_init(Instant::now);
        start.elapsed().as_nanos() as u64
    }
}

/// Measure the TSC frequency in GHz against the monotonic clock.
pub fn measure_freq_ghz() -> f64 {
    let wall_start = Instant::now();
    let tsc_start = rdtsc();
    // 10ms is enough for three significant digits, which is all the RTO
    // arithmetic needs.
    while wall_start.elapsed() < Duration::from_millis(10) {
        std::hint::spin_loop();
    }
    let cycles = rdtsc().wrapping_sub(tsc_start);
    let nanos = wall_start.elapsed().as_nanos() as f64;
    (cycles as f64 / nanos).max(0.001)
}

#[inline]
pub fn ms_to_cycles(ms: u64, freq_ghz: f64) -> u64 {
    (ms as f64 * 1_000_000.0 * freq_ghz) as u64
}

#[inline]
pub fn ns_to_cycles(ns: u64, freq_ghz: f64) -> u64 {
    ((ns as f64 * freq_ghz) as u64).max(1)
}

#[inline]
pub fn to_ms(cycles: u64, freq_ghz: f64) -> u64 {
    (cycles as f64 / (freq_ghz * 1_000_000.0)) as u64
}

#[inline]
pub fn to_us(cycles: u64, freq_ghz: f64) -> f64 {
    cycles as f64 / (freq_ghz * 1_000.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tsc_is_monotonic() {
        let a = rdtsc();
        let b = rdtsc();
        assert!(b >= a);
    }

    #[test]
    fn freq_is_plausible() {
        let ghz = measure_freq_ghz();
        // Anything from an emulator to a turbo-clocked server core.
        assert!(ghz > 0.001 && ghz < 10.0, "freq {ghz} GHz");
    }

    #[test]
    fn conversions_round_trip() {
        let ghz = 2.5;
        assert_eq!(to_ms(ms_to_cycles(5, ghz), ghz), 5);
        assert!(ns_to_cycles(0, ghz) >= 1);
    }
}
