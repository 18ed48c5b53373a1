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

//! The receive session: wires an SDP-described RTP receiver and a PTP
//! ordinary clock together and bridges the playout ring to the host audio
//! callback at the grandmaster's timebase.
//!
//! The subsystems communicate through bounded event channels owned by the
//! session's event task; no observer back-pointers exist. Shutdown stops the
//! receiver first, then the PTP port, waiting for each to acknowledge.

use crate::{
    error::{SessionError, SessionResult},
    formats::{AudioFormat, ByteOrder, SampleEncoding, swap_bytes},
    monitoring::{Monitoring, stats_reporter},
    nic::{interface_ipv4, resolve_interface},
    ptp::{
        local_clock::ClockCell,
        port::{PtpEvent, PtpPortConfig, ptp_port_task},
        profile::DEFAULT_DELAY_REQUEST_RESPONSE_PROFILE,
        types::ClockIdentity,
    },
    receiver::{
        ReceiverEvent, StreamState, config::ReceiverParams, receiver_task,
        ring::{RingReader, ring_frames_for, playout_ring},
    },
    sdp::StreamDescription,
    socket::{create_ptp_sockets, create_rx_socket},
    utils::WrappingU32,
};
use std::{
    net::IpAddr,
    sync::Arc,
};
use tokio::{select, sync::mpsc};
use tokio_graceful_shutdown::{NestedSubsystem, SubsystemBuilder, SubsystemHandle};
use tracing::{info, warn};

type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Interface selector: a name like `eth0` or one of its IPv4 addresses.
    pub interface: String,
    /// Playout offset behind the PTP-derived now, in frames.
    pub delay_frames: u32,
    /// Byte order the audio callback wants in its output buffers.
    pub output_byte_order: ByteOrder,
}

/// Handles to the running session subsystems, in charge of ordered shutdown.
pub struct RxSession {
    events: NestedSubsystem<BoxedError>,
    receiver: NestedSubsystem<BoxedError>,
    ptp: NestedSubsystem<BoxedError>,
    stats: NestedSubsystem<BoxedError>,
}

impl RxSession {
    /// Builds the full receive chain under `subsys` from a parsed stream
    /// description. Socket setup errors (bad SDP, unusable interface,
    /// missing privileges for the PTP ports) surface here.
    pub fn start(
        subsys: &SubsystemHandle,
        desc: &StreamDescription,
        config: &SessionConfig,
    ) -> SessionResult<(RxSession, RealtimeOutput)> {
        let iface = resolve_interface(&config.interface)?;
        let iface_ip = interface_ipv4(&iface)?;
        info!(
            "Session '{}' on interface {} ({})",
            desc.session_name, iface.name, iface_ip
        );

        let params = ReceiverParams::from_stream_description(desc, config.delay_frames);
        let stream = params.primary_stream().clone();

        let clock_identity = iface
            .mac
            .and_then(|mac| ClockIdentity::from_mac_address(mac.octets()))
            .unwrap_or_else(|| {
                let ip = iface_ip.octets();
                ClockIdentity([0x0a, 0x00, ip[0], ip[1], ip[2], ip[3], 0x00, 0x01])
            });

        if let Some(pinned) = stream.clock_identity {
            info!(
                "Stream pins PTP grandmaster {} in domain {}",
                pinned, stream.ptp_domain
            );
        }

        let connection_v4 = match stream.connection_address {
            IpAddr::V4(v4) => v4,
            IpAddr::V6(_) => {
                return Err(SessionError::ConfigError(
                    crate::error::ConfigError::InvalidSdp(
                        "IPv6 connection addresses are not supported".to_owned(),
                    ),
                ));
            }
        };

        let rtp_socket = create_rx_socket(connection_v4, &iface, stream.rtp_port)?;
        let (event_socket, general_socket) = create_ptp_sockets(&iface)?;

        let monitoring = Monitoring::new();
        let clock_cell = Arc::new(ClockCell::new());

        let bytes_per_frame = params.bytes_per_frame();
        let ring_frames = ring_frames_for(
            params.delay_frames as usize,
            stream.packet_time_frames,
        );
        let (writer, reader) = playout_ring(
            ring_frames,
            bytes_per_frame,
            params.audio_format.ground_value(),
        );

        let (ptp_events_tx, ptp_events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (receiver_events_tx, receiver_events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let output = RealtimeOutput {
            reader,
            clock: clock_cell.clone(),
            format: params.audio_format,
            output_byte_order: config.output_byte_order,
            delay_frames: params.delay_frames,
            media_clock_offset: stream.media_clock_offset,
            monitoring: monitoring.clone(),
        };

        let ptp_config = PtpPortConfig {
            clock_identity,
            domain_number: stream.ptp_domain,
            profile: DEFAULT_DELAY_REQUEST_RESPONSE_PROFILE,
        };

        let ptp_monitoring = monitoring.clone();
        let ptp = subsys.start(SubsystemBuilder::new("ptp", move |s| {
            ptp_port_task(
                s,
                ptp_config,
                event_socket,
                general_socket,
                clock_cell,
                ptp_monitoring,
                ptp_events_tx,
            )
        }));

        let receiver_monitoring = monitoring.clone();
        let receiver = subsys.start(SubsystemBuilder::new("receiver", move |s| {
            receiver_task(
                s,
                params,
                rtp_socket,
                writer,
                receiver_monitoring,
                receiver_events_tx,
            )
        }));

        let pinned_grandmaster = stream.clock_identity;
        let events = subsys.start(SubsystemBuilder::new("session-events", move |s| {
            event_task(s, ptp_events_rx, receiver_events_rx, pinned_grandmaster)
        }));

        let stats_monitoring = monitoring.clone();
        let stats = subsys.start(SubsystemBuilder::new("stats", move |s| {
            stats_reporter(s, stats_monitoring)
        }));

        Ok((
            RxSession {
                events,
                receiver,
                ptp,
                stats,
            },
            output,
        ))
    }

    /// Stops the session: unsubscribes from events, then stops the receiver,
    /// then the PTP port, waiting for each to acknowledge.
    pub async fn stop(self) {
        self.events.initiate_shutdown();
        let _ = self.events.join().await;
        self.receiver.initiate_shutdown();
        let _ = self.receiver.join().await;
        self.ptp.initiate_shutdown();
        let _ = self.ptp.join().await;
        self.stats.initiate_shutdown();
        let _ = self.stats.join().await;
        info!("Session stopped.");
    }
}

/// Consumes the subsystems' domain events.
async fn event_task(
    subsys: SubsystemHandle,
    mut ptp_events: mpsc::Receiver<PtpEvent>,
    mut receiver_events: mpsc::Receiver<ReceiverEvent>,
    pinned_grandmaster: Option<ClockIdentity>,
) -> SessionResult<()> {
    loop {
        select! {
            Some(event) = ptp_events.recv() => match event {
                PtpEvent::StateChanged(state) => info!("PTP port state changed: {state}"),
                PtpEvent::ParentChanged(parent) => {
                    info!(
                        "PTP parent changed: grandmaster {} (priority1 {}, priority2 {})",
                        parent.grandmaster_identity,
                        parent.grandmaster_priority1,
                        parent.grandmaster_priority2
                    );
                    if let Some(pinned) = pinned_grandmaster
                        && parent.grandmaster_identity != pinned
                    {
                        warn!(
                            "Selected grandmaster {} differs from the one pinned in the SDP ({})",
                            parent.grandmaster_identity, pinned
                        );
                    }
                }
                PtpEvent::CalibrationChanged(calibrated) => {
                    info!("PTP clock calibration: {calibrated}");
                }
            },
            Some(event) = receiver_events.recv() => match event {
                ReceiverEvent::ParametersUpdated(params) => {
                    info!(
                        "Receiver parameters: {} ch, {} Hz, {} bytes/frame, delay {} frames",
                        params.audio_format.num_channels,
                        params.audio_format.sample_rate,
                        params.bytes_per_frame(),
                        params.delay_frames
                    );
                }
                ReceiverEvent::StreamStateChanged(state) => {
                    info!("Stream state changed: {state:?}");
                    if state == StreamState::Receiving {
                        info!("Receiving RTP data.");
                    }
                }
            },
            _ = subsys.on_shutdown_requested() => break,
            else => break,
        }
    }
    Ok(())
}

/// What the audio callback got out of a realtime read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    /// The local clock is not yet calibrated; ground samples were written.
    ClockNotReady,
    /// No stream data was available; ground samples were written.
    NoData,
    /// The ring could not match the target timestamp; ground samples were
    /// written and the next read will resync.
    Desync,
    /// Stream audio was written.
    Playing,
}

/// The realtime bridge handed to the platform audio layer. `read` is the
/// only method meant to run on the audio callback thread; it never blocks,
/// locks or allocates.
pub struct RealtimeOutput {
    reader: RingReader,
    clock: Arc<ClockCell>,
    format: AudioFormat,
    output_byte_order: ByteOrder,
    delay_frames: u32,
    media_clock_offset: u32,
    monitoring: Monitoring,
}

impl RealtimeOutput {
    pub fn format(&self) -> &AudioFormat {
        &self.format
    }

    /// Fills `out` with audio aligned to the grandmaster's timebase minus
    /// the configured playout delay. `out` must be a whole number of frames.
    pub fn read(&mut self, out: &mut [u8]) -> BridgeState {
        let counters = self.monitoring.counters();
        let frames = out.len() / self.format.bytes_per_frame();

        let clock = self.clock.read();
        self.monitoring.set_clock_flags(
            clock.is_valid(),
            clock.is_locked(),
            clock.is_calibrated(),
        );

        if !clock.is_calibrated() {
            out.fill(self.format.ground_value());
            Monitoring::count(&counters.buffers_no_data);
            self.monitoring.set_signal_levels(f64::NAN, f64::NAN);
            return BridgeState::ClockNotReady;
        }

        let ptp_ts = clock
            .now()
            .to_rtp_timestamp32(self.format.sample_rate)
            .wrapping_add(self.media_clock_offset)
            .wrapping_sub(self.delay_frames);

        // First read without a target; a second, aligned read only happens
        // when the returned position has drifted too far.
        let result = self.reader.read_realtime(out, None);

        let Some(first_ts) = result.first_timestamp else {
            out.fill(self.format.ground_value());
            Monitoring::count(&counters.buffers_no_data);
            self.monitoring.set_signal_levels(f64::NAN, f64::NAN);
            return BridgeState::NoData;
        };

        let mut missing_frames = result.missing_frames;
        let drift = WrappingU32(ptp_ts).diff(WrappingU32(first_ts));
        if drift.unsigned_abs() as usize > frames * 2 {
            let corrected = self.reader.read_realtime(out, Some(ptp_ts));
            if corrected.desync {
                Monitoring::count(&counters.desyncs);
                Monitoring::count(&counters.buffers_no_data);
                self.monitoring.set_signal_levels(f64::NAN, f64::NAN);
                return BridgeState::Desync;
            }
            missing_frames = corrected.missing_frames;
        }

        if missing_frames == frames {
            Monitoring::count(&counters.buffers_no_data);
            self.monitoring.set_signal_levels(f64::NAN, f64::NAN);
            return BridgeState::NoData;
        }
        if missing_frames > 0 {
            counters
                .missing_frames
                .fetch_add(missing_frames as u64, std::sync::atomic::Ordering::Relaxed);
        }

        if self.output_byte_order != self.format.byte_order {
            swap_bytes(out, self.format.bytes_per_sample());
        }

        let (rms_db, peak_db) =
            signal_levels(out, self.format.encoding, self.output_byte_order);
        self.monitoring.set_signal_levels(rms_db, peak_db);
        Monitoring::count(&counters.buffers_with_data);

        BridgeState::Playing
    }
}

/// RMS level in dBFS and peak magnitude in dB of a PCM buffer. Digital
/// silence yields NaN. Unsupported encodings yield NaN as well, signal
/// metering is best-effort.
pub fn signal_levels(data: &[u8], encoding: SampleEncoding, byte_order: ByteOrder) -> (f64, f64) {
    let bytes_per_sample = encoding.bytes_per_sample();
    let num_samples = data.len() / bytes_per_sample;
    if num_samples == 0 {
        return (f64::NAN, f64::NAN);
    }

    let mut sum_squares = 0.0f64;
    let mut max_abs = 0.0f64;

    let mut accumulate = |normalized: f64| {
        sum_squares += normalized * normalized;
        max_abs = max_abs.max(normalized.abs());
    };

    match encoding {
        SampleEncoding::PcmS16 => {
            for sample in data.chunks_exact(2) {
                let value = match byte_order {
                    ByteOrder::Be => i16::from_be_bytes([sample[0], sample[1]]),
                    ByteOrder::Le => i16::from_le_bytes([sample[0], sample[1]]),
                };
                accumulate(value as f64 / 32768.0);
            }
        }
        SampleEncoding::PcmS24 => {
            for sample in data.chunks_exact(3) {
                let bytes = match byte_order {
                    ByteOrder::Le => [sample[0], sample[1], sample[2]],
                    ByteOrder::Be => [sample[2], sample[1], sample[0]],
                };
                let value = crate::bytes::unpack_i24_le(bytes);
                accumulate(value as f64 / 8388608.0);
            }
        }
        SampleEncoding::PcmS32 => {
            for sample in data.chunks_exact(4) {
                let value = match byte_order {
                    ByteOrder::Be => {
                        i32::from_be_bytes([sample[0], sample[1], sample[2], sample[3]])
                    }
                    ByteOrder::Le => {
                        i32::from_le_bytes([sample[0], sample[1], sample[2], sample[3]])
                    }
                };
                accumulate(value as f64 / 2147483648.0);
            }
        }
        _ => return (f64::NAN, f64::NAN),
    }

    let rms = (sum_squares / num_samples as f64).sqrt();
    let rms_db = if rms <= 0.0 {
        f64::NAN
    } else {
        20.0 * rms.log10()
    };
    let peak_db = if max_abs <= 0.0 {
        f64::NAN
    } else {
        20.0 * max_abs.log10()
    };
    (rms_db, peak_db)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn silence_measures_as_nan() {
        let silence = vec![0u8; 64];
        let (rms, peak) = signal_levels(&silence, SampleEncoding::PcmS16, ByteOrder::Le);
        assert!(rms.is_nan());
        assert!(peak.is_nan());
    }

    #[test]
    fn full_scale_s16_is_zero_dbfs() {
        let mut data = Vec::new();
        for _ in 0..64 {
            data.extend_from_slice(&i16::MIN.to_le_bytes());
        }
        let (rms, peak) = signal_levels(&data, SampleEncoding::PcmS16, ByteOrder::Le);
        assert!((rms - 0.0).abs() < 0.01, "rms {rms}");
        assert!((peak - 0.0).abs() < 0.01, "peak {peak}");
    }

    #[test]
    fn half_scale_s24_is_minus_six_dbfs() {
        let mut data = Vec::new();
        for _ in 0..64 {
            data.extend_from_slice(&crate::bytes::pack_i24_le(0x400000));
        }
        let (rms, _) = signal_levels(&data, SampleEncoding::PcmS24, ByteOrder::Le);
        assert!((rms + 6.02).abs() < 0.05, "rms {rms}");
    }

    #[test]
    fn byte_order_is_respected() {
        let mut be = Vec::new();
        let mut le = Vec::new();
        for _ in 0..16 {
            be.extend_from_slice(&0x4000i16.to_be_bytes());
            le.extend_from_slice(&0x4000i16.to_le_bytes());
        }
        let (rms_be, _) = signal_levels(&be, SampleEncoding::PcmS16, ByteOrder::Be);
        let (rms_le, _) = signal_levels(&le, SampleEncoding::PcmS16, ByteOrder::Le);
        assert!((rms_be - rms_le).abs() < 1e-9);
    }

    #[test]
    fn float_encodings_are_not_metered() {
        let data = vec![0x3fu8; 32];
        let (rms, peak) = signal_levels(&data, SampleEncoding::PcmF32, ByteOrder::Le);
        assert!(rms.is_nan());
        assert!(peak.is_nan());
    }
}
