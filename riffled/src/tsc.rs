//! Cycle counter access and calibration.
//!
//! The scheduler accounts everything in TSC cycles. On x86 we read the
//! counter directly; elsewhere we fall back to CLOCK_MONOTONIC nanoseconds,
//! which keeps the arithmetic identical (hz == 1e9).

use std::time::{Duration, Instant};

use once_cell::sync::Lazy;

#[cfg(target_arch = "x86_64")]
#[inline(always)]
pub fn rdtsc() -> u64 {
    // SAFETY: RDTSC is unprivileged and has no memory effects.
    unsafe { core::arch::x86_64::_rdtsc() }
}

#[cfg(not(target_arch = "x86_64"))]
#[inline(always)]
pub fn rdtsc() -> u64 {
    use nix::time::{clock_gettime, ClockId};
    match clock_gettime(ClockId::CLOCK_MONOTONIC) {
        Ok(ts) => (ts.tv_sec() as u64) * 1_000_000_000 + (ts.tv_nsec() as u64),
        Err(_) => 0,
    }
}

static TSC_HZ: Lazy<u64> = Lazy::new(calibrate);

/// Counter frequency in Hz. Calibrated once, on first use.
pub fn tsc_hz() -> u64 {
    *TSC_HZ
}

/// Nanoseconds per cycle, for converting accounting results.
pub fn ns_per_cycle() -> f64 {
    1e9 / tsc_hz() as f64
}

#[inline]
pub fn cycles_to_ns(cycles: u64) -> u64 {
    ((cycles as u128) * 1_000_000_000 / tsc_hz() as u128) as u64
}

#[inline]
pub fn ns_to_cycles(ns: u64) -> u64 {
    ((ns as u128) * tsc_hz() as u128 / 1_000_000_000) as u64
}

#[cfg(not(target_arch = "x86_64"))]
fn calibrate() -> u64 {
    1_000_000_000
}

#[cfg(target_arch = "x86_64")]
fn calibrate() -> u64 {
    // Measure the counter against the OS clock over a short window. 20ms is
    // enough for <0.1% error, which is fine for rate limiting.
    let wall_start = Instant::now();
    let tsc_start = rdtsc();
    while wall_start.elapsed() < Duration::from_millis(20) {
        std::hint::spin_loop();
    }
    let cycles = rdtsc().wrapping_sub(tsc_start);
    let nanos = wall_start.elapsed().as_nanos() as u64;
    if nanos == 0 {
        return 1_000_000_000;
    }
    ((cycles as u128) * 1_000_000_000 / nanos as u128) as u64
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
    fn hz_is_sane() {
        let hz = tsc_hz();
        // Anything from an embedded board to a boosted desktop core.
        assert!(hz > 100_000_000, "hz = {hz}");
        assert!(hz < 10_000_000_000, "hz = {hz}");
    }

    #[test]
    fn ns_round_trip() {
        let cycles = ns_to_cycles(1_000_000);
        let ns = cycles_to_ns(cycles);
        assert!(ns.abs_diff(1_000_000) < 1_000);
    }
}
