/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! A free-running monotonic host clock disciplined onto the grandmaster's
//! timescale. The clock state is plain old data so the PTP engine can publish
//! snapshots to the audio callback through a seqlock without blocking either
//! side.

use crate::ptp::types::PtpTimestamp;
use lazy_static::lazy_static;
use std::{
    cell::UnsafeCell,
    sync::atomic::{AtomicUsize, Ordering},
    time::Instant,
};

lazy_static! {
    static ref MONOTONIC_EPOCH: Instant = Instant::now();
}

/// Nanoseconds on the host's monotonic high-resolution clock.
pub fn now_host_nanos() -> u64 {
    MONOTONIC_EPOCH.elapsed().as_nanos() as u64
}

const LOCK_THRESHOLD: u32 = 10;
const MAX_RATIO_DEVIATION: f64 = 0.5;

/// Host-time to grandmaster-time transform: a shift plus a frequency ratio
/// applied to the time elapsed since the last synchronization point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocalClock {
    last_sync_host_ns: u64,
    shift_s: f64,
    frequency_ratio: f64,
    adjustments_since_last_step: u32,
    calibrated: bool,
}

impl Default for LocalClock {
    fn default() -> Self {
        LocalClock {
            last_sync_host_ns: 0,
            shift_s: 0.0,
            frequency_ratio: 1.0,
            adjustments_since_last_step: 0,
            calibrated: false,
        }
    }
}

impl LocalClock {
    pub fn new() -> Self {
        LocalClock::default()
    }

    /// The best estimate of 'now' in the grandmaster's timescale.
    pub fn now(&self) -> PtpTimestamp {
        self.adjusted(now_host_nanos())
    }

    /// Transforms a host monotonic time into the grandmaster's timescale.
    pub fn adjusted(&self, host_ns: u64) -> PtpTimestamp {
        let elapsed_s = (host_ns as f64 - self.last_sync_host_ns as f64) / 1e9;
        PtpTimestamp::from_nanos(self.last_sync_host_ns)
            .add_seconds(elapsed_s * self.frequency_ratio + self.shift_s)
    }

    /// Applies a measured offset from the master. Accumulates the negated
    /// offset into the shift and re-steers the frequency ratio with a cubic
    /// of the offset: near zero the ratio stays at unity, large residuals
    /// steer harder, and the clamp bounds the slew.
    pub fn adjust(&mut self, offset_from_master_s: f64) {
        self.last_sync_host_ns = now_host_nanos();
        self.shift_s += -offset_from_master_s;
        let nominal_ratio = 0.001 * (-offset_from_master_s).powi(3) + 1.0;
        self.frequency_ratio = nominal_ratio.clamp(1.0 - MAX_RATIO_DEVIATION, 1.0 + MAX_RATIO_DEVIATION);
        self.adjustments_since_last_step += 1;
    }

    /// Steps the clock on gross disagreement with the master. Resets the
    /// frequency ratio and the lock and calibration progress.
    pub fn step(&mut self, offset_from_master_s: f64) {
        self.last_sync_host_ns = now_host_nanos();
        self.shift_s += -offset_from_master_s;
        self.frequency_ratio = 1.0;
        self.adjustments_since_last_step = 0;
        self.calibrated = false;
    }

    pub fn frequency_ratio(&self) -> f64 {
        self.frequency_ratio
    }

    pub fn shift(&self) -> f64 {
        self.shift_s
    }

    pub fn is_valid(&self) -> bool {
        self.last_sync_host_ns != 0
    }

    /// A clock is locked once it has seen enough adjustments since the last
    /// step.
    pub fn is_locked(&self) -> bool {
        self.adjustments_since_last_step >= LOCK_THRESHOLD
    }

    pub fn set_calibrated(&mut self, calibrated: bool) {
        self.calibrated = calibrated;
    }

    pub fn is_calibrated(&self) -> bool {
        self.is_locked() && self.calibrated
    }
}

/// Single-slot seqlock publishing [`LocalClock`] snapshots from the PTP
/// engine to the realtime reader. The writer bumps the generation to odd,
/// stores the value, then bumps it to even; the reader retries until it
/// observes a stable even generation. One writer only.
#[derive(Debug, Default)]
pub struct ClockCell {
    generation: AtomicUsize,
    value: UnsafeCell<LocalClock>,
}

// The seqlock protocol makes concurrent reads safe: a torn read is detected
// through the generation counter and retried.
unsafe impl Sync for ClockCell {}

impl ClockCell {
    pub fn new() -> Self {
        ClockCell::default()
    }

    pub fn publish(&self, clock: LocalClock) {
        let generation = self.generation.load(Ordering::Relaxed);
        self.generation
            .store(generation.wrapping_add(1), Ordering::Release);
        std::sync::atomic::fence(Ordering::Release);
        unsafe {
            *self.value.get() = clock;
        }
        self.generation
            .store(generation.wrapping_add(2), Ordering::Release);
    }

    pub fn read(&self) -> LocalClock {
        loop {
            let before = self.generation.load(Ordering::Acquire);
            if before & 1 == 1 {
                std::hint::spin_loop();
                continue;
            }
            let value = unsafe { *self.value.get() };
            std::sync::atomic::fence(Ordering::Acquire);
            let after = self.generation.load(Ordering::Relaxed);
            if before == after {
                return value;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ten_adjustments_lock_the_clock() {
        let mut clock = LocalClock::new();
        assert!(!clock.is_locked());
        for _ in 0..10 {
            clock.adjust(0.0);
        }
        assert!(clock.is_locked());
        assert_eq!(clock.frequency_ratio(), 1.0);
    }

    #[test]
    fn step_resets_lock_and_calibration() {
        let mut clock = LocalClock::new();
        for _ in 0..10 {
            clock.adjust(0.0);
        }
        clock.set_calibrated(true);
        assert!(clock.is_calibrated());

        clock.step(1e-3);
        assert!(!clock.is_locked());
        assert!(!clock.is_calibrated());
        assert_eq!(clock.frequency_ratio(), 1.0);
    }

    #[test]
    fn shift_accumulates_negated_offsets() {
        let mut clock = LocalClock::new();
        for _ in 0..10 {
            clock.adjust(-50e-6);
        }
        // Ten adjustments of -50 µs accumulate to +500 µs of shift.
        assert!((clock.shift() - 500e-6).abs() < 1e-12);
    }

    #[test]
    fn cubic_steering_is_clamped() {
        let mut clock = LocalClock::new();
        clock.adjust(-100.0);
        assert_eq!(clock.frequency_ratio(), 1.5);
        clock.adjust(100.0);
        assert_eq!(clock.frequency_ratio(), 0.5);
        clock.adjust(0.0);
        assert_eq!(clock.frequency_ratio(), 1.0);
    }

    #[test]
    fn adjusted_applies_shift() {
        let mut clock = LocalClock::new();
        clock.step(-2.0);
        let host = now_host_nanos();
        let adjusted = clock.adjusted(host);
        let raw = PtpTimestamp::from_nanos(host);
        let diff = adjusted.diff(&raw).total_seconds_f64();
        assert!((diff - 2.0).abs() < 1e-3, "shift not applied: {diff}");
    }

    #[test]
    fn calibrated_requires_lock() {
        let mut clock = LocalClock::new();
        clock.set_calibrated(true);
        assert!(!clock.is_calibrated());
    }

    #[test]
    fn clock_cell_round_trips_snapshots() {
        let cell = ClockCell::new();
        let mut clock = LocalClock::new();
        clock.adjust(-1e-6);
        cell.publish(clock);
        assert_eq!(cell.read(), clock);
    }
}
