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

//! Shared counters and signal levels. The hot paths only touch relaxed
//! atomics; a reporter task reads them once a second and emits a digest.

use std::sync::{
    Arc,
    atomic::{AtomicI64, AtomicU8, AtomicU64, Ordering},
};
use tokio::{select, time};
use tokio_graceful_shutdown::SubsystemHandle;
use tracing::info;

const CLOCK_VALID: u8 = 0x1;
const CLOCK_LOCKED: u8 = 0x2;
const CLOCK_CALIBRATED: u8 = 0x4;

#[derive(Debug)]
pub struct Counters {
    pub rtp_packets_received: AtomicU64,
    pub rtp_malformed: AtomicU64,
    pub rtp_out_of_window: AtomicU64,
    pub rtp_wrong_sender: AtomicU64,
    pub rtp_inconsistent_timestamp: AtomicU64,
    pub rtp_out_of_order: AtomicU64,
    pub ptp_announces_received: AtomicU64,
    pub ptp_syncs_received: AtomicU64,
    pub ptp_follow_ups_received: AtomicU64,
    pub ptp_delay_resps_received: AtomicU64,
    pub ptp_malformed: AtomicU64,
    pub buffers_with_data: AtomicU64,
    pub buffers_no_data: AtomicU64,
    pub desyncs: AtomicU64,
    pub missing_frames: AtomicU64,
    last_offset_ns: AtomicI64,
    mean_link_delay_ns: AtomicI64,
    signal_rms_db_bits: AtomicU64,
    signal_peak_db_bits: AtomicU64,
    clock_flags: AtomicU8,
}

impl Default for Counters {
    fn default() -> Self {
        Counters {
            rtp_packets_received: AtomicU64::new(0),
            rtp_malformed: AtomicU64::new(0),
            rtp_out_of_window: AtomicU64::new(0),
            rtp_wrong_sender: AtomicU64::new(0),
            rtp_inconsistent_timestamp: AtomicU64::new(0),
            rtp_out_of_order: AtomicU64::new(0),
            ptp_announces_received: AtomicU64::new(0),
            ptp_syncs_received: AtomicU64::new(0),
            ptp_follow_ups_received: AtomicU64::new(0),
            ptp_delay_resps_received: AtomicU64::new(0),
            ptp_malformed: AtomicU64::new(0),
            buffers_with_data: AtomicU64::new(0),
            buffers_no_data: AtomicU64::new(0),
            desyncs: AtomicU64::new(0),
            missing_frames: AtomicU64::new(0),
            last_offset_ns: AtomicI64::new(0),
            mean_link_delay_ns: AtomicI64::new(0),
            signal_rms_db_bits: AtomicU64::new(f64::NAN.to_bits()),
            signal_peak_db_bits: AtomicU64::new(f64::NAN.to_bits()),
            clock_flags: AtomicU8::new(0),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Monitoring {
    counters: Arc<Counters>,
}

impl Monitoring {
    pub fn new() -> Self {
        Monitoring::default()
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    pub fn count(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_signal_levels(&self, rms_db: f64, peak_db: f64) {
        self.counters
            .signal_rms_db_bits
            .store(rms_db.to_bits(), Ordering::Relaxed);
        self.counters
            .signal_peak_db_bits
            .store(peak_db.to_bits(), Ordering::Relaxed);
    }

    pub fn signal_levels(&self) -> (f64, f64) {
        (
            f64::from_bits(self.counters.signal_rms_db_bits.load(Ordering::Relaxed)),
            f64::from_bits(self.counters.signal_peak_db_bits.load(Ordering::Relaxed)),
        )
    }

    pub fn set_clock_flags(&self, valid: bool, locked: bool, calibrated: bool) {
        let mut flags = 0;
        if valid {
            flags |= CLOCK_VALID;
        }
        if locked {
            flags |= CLOCK_LOCKED;
        }
        if calibrated {
            flags |= CLOCK_CALIBRATED;
        }
        self.counters.clock_flags.store(flags, Ordering::Relaxed);
    }

    pub fn clock_flags(&self) -> (bool, bool, bool) {
        let flags = self.counters.clock_flags.load(Ordering::Relaxed);
        (
            flags & CLOCK_VALID != 0,
            flags & CLOCK_LOCKED != 0,
            flags & CLOCK_CALIBRATED != 0,
        )
    }

    pub fn set_offset_nanos(&self, offset: i64) {
        self.counters.last_offset_ns.store(offset, Ordering::Relaxed);
    }

    pub fn offset_nanos(&self) -> i64 {
        self.counters.last_offset_ns.load(Ordering::Relaxed)
    }

    pub fn set_mean_link_delay_nanos(&self, delay: i64) {
        self.counters
            .mean_link_delay_ns
            .store(delay, Ordering::Relaxed);
    }

    pub fn mean_link_delay_nanos(&self) -> i64 {
        self.counters.mean_link_delay_ns.load(Ordering::Relaxed)
    }
}

/// Emits a digest of the counters once a second until shutdown. Purely
/// observational, the receive paths never wait for it.
pub async fn stats_reporter(
    subsys: SubsystemHandle,
    monitoring: Monitoring,
) -> Result<(), &'static str> {
    let mut interval = time::interval(time::Duration::from_secs(1));
    interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

    let mut prev_with_data = 0u64;
    let mut prev_no_data = 0u64;
    let mut prev_packets = 0u64;

    loop {
        select! {
            _ = interval.tick() => {
                let counters = monitoring.counters();
                let with_data = counters.buffers_with_data.load(Ordering::Relaxed);
                let no_data = counters.buffers_no_data.load(Ordering::Relaxed);
                let packets = counters.rtp_packets_received.load(Ordering::Relaxed);
                let (rms_db, peak_db) = monitoring.signal_levels();
                let (valid, locked, calibrated) = monitoring.clock_flags();

                let data_per_sec = with_data - prev_with_data;
                let empty_per_sec = no_data - prev_no_data;
                let packets_per_sec = packets - prev_packets;
                prev_with_data = with_data;
                prev_no_data = no_data;
                prev_packets = packets;

                if rms_db.is_nan() {
                    info!(
                        "[signal] RMS: --- dB (no data) | pkts/s={packets_per_sec}, data/s={data_per_sec}, empty/s={empty_per_sec} | PTP[valid={}, locked={}, cal={}] offset={} ns, link delay={} ns",
                        valid, locked, calibrated,
                        monitoring.offset_nanos(),
                        monitoring.mean_link_delay_nanos(),
                    );
                } else {
                    info!(
                        "[signal] RMS: {rms_db:.1} dB, Peak: {peak_db:.1} dB | pkts/s={packets_per_sec}, data/s={data_per_sec}, empty/s={empty_per_sec} | PTP[valid={}, locked={}, cal={}] offset={} ns, link delay={} ns",
                        valid, locked, calibrated,
                        monitoring.offset_nanos(),
                        monitoring.mean_link_delay_nanos(),
                    );
                }
            },
            _ = subsys.on_shutdown_requested() => break,
        }
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn signal_levels_default_to_nan() {
        let monitoring = Monitoring::new();
        let (rms, peak) = monitoring.signal_levels();
        assert!(rms.is_nan());
        assert!(peak.is_nan());
    }

    #[test]
    fn clock_flags_round_trip() {
        let monitoring = Monitoring::new();
        monitoring.set_clock_flags(true, true, false);
        assert_eq!(monitoring.clock_flags(), (true, true, false));
        monitoring.set_clock_flags(true, true, true);
        assert_eq!(monitoring.clock_flags(), (true, true, true));
    }

    #[test]
    fn counters_increment() {
        let monitoring = Monitoring::new();
        Monitoring::count(&monitoring.counters().rtp_packets_received);
        Monitoring::count(&monitoring.counters().rtp_packets_received);
        assert_eq!(
            monitoring
                .counters()
                .rtp_packets_received
                .load(Ordering::Relaxed),
            2
        );
    }
}
