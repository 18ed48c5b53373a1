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

//! AES67 RTP ingest. Joins the multicast group described by the receiver
//! parameters, decodes RTP packets and writes their PCM payloads into the
//! timestamp-indexed playout ring. The ring's realtime reader is handed to
//! the session, which drives it from the audio callback.

pub mod config;
pub mod ring;

use crate::{
    error::ReceiverResult,
    monitoring::Monitoring,
    ptp::local_clock::now_host_nanos,
    receiver::{
        config::ReceiverParams,
        ring::{RingWriter, WriteOutcome},
    },
    utils::WrappingU32,
};
use rtp_rs::RtpReader;
use std::net::SocketAddr;
use tokio::{net::UdpSocket, select, sync::mpsc};
use tokio_graceful_shutdown::SubsystemHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Inactive,
    Receiving,
}

/// Domain events published to the session instead of observer callbacks.
#[derive(Debug, Clone)]
pub enum ReceiverEvent {
    ParametersUpdated(ReceiverParams),
    StreamStateChanged(StreamState),
}

pub async fn receiver_task(
    subsys: SubsystemHandle,
    params: ReceiverParams,
    socket: UdpSocket,
    writer: RingWriter,
    monitoring: Monitoring,
    events: mpsc::Sender<ReceiverEvent>,
) -> ReceiverResult<()> {
    let mut ingest = Ingest::new(params, writer, monitoring, events);
    let mut receive_buffer = [0u8; 65_535];

    info!(
        "Receiver started for {}:{}.",
        ingest.params.primary_stream().connection_address,
        ingest.params.primary_stream().rtp_port
    );

    ingest
        .events
        .send(ReceiverEvent::ParametersUpdated(ingest.params.clone()))
        .await
        .ok();

    loop {
        select! {
            received = socket.recv_from(&mut receive_buffer) => {
                match received {
                    Ok((len, addr)) => {
                        let host_ns = now_host_nanos();
                        ingest.rtp_data_received(&receive_buffer[..len], addr, host_ns).await;
                    }
                    Err(e) => {
                        warn!("RTP socket receive error: {e}");
                        return Err(e.into());
                    }
                }
            },
            _ = subsys.on_shutdown_requested() => {
                info!("Shutdown of receiver requested.");
                break;
            },
        }
    }

    if ingest.state == StreamState::Receiving {
        ingest
            .events
            .send(ReceiverEvent::StreamStateChanged(StreamState::Inactive))
            .await
            .ok();
    }

    info!("Receiver stopped.");
    Ok(())
}

/// The packet-to-ring path, separated from the socket loop.
struct Ingest {
    params: ReceiverParams,
    writer: RingWriter,
    monitoring: Monitoring,
    events: mpsc::Sender<ReceiverEvent>,
    last_sequence: Option<u16>,
    last_timestamp: Option<u32>,
    accepted_ssrc: Option<u32>,
    state: StreamState,
}

impl Ingest {
    fn new(
        params: ReceiverParams,
        writer: RingWriter,
        monitoring: Monitoring,
        events: mpsc::Sender<ReceiverEvent>,
    ) -> Self {
        Ingest {
            params,
            writer,
            monitoring,
            events,
            last_sequence: None,
            last_timestamp: None,
            accepted_ssrc: None,
            state: StreamState::Inactive,
        }
    }

    async fn rtp_data_received(&mut self, data: &[u8], addr: SocketAddr, host_ns: u64) {
        let counters = self.monitoring.counters();
        let stream = &self.params.streams[0];

        if let Some(source) = stream.source_filter
            && addr.ip() != source
        {
            Monitoring::count(&counters.rtp_wrong_sender);
            return;
        }

        let rtp = match RtpReader::new(data) {
            Ok(it) => it,
            Err(e) => {
                debug!("Malformed RTP packet from {addr}: {e:?}");
                Monitoring::count(&counters.rtp_malformed);
                return;
            }
        };

        if rtp.payload_type() != stream.payload_type {
            Monitoring::count(&counters.rtp_malformed);
            return;
        }

        match (stream.ssrc, self.accepted_ssrc) {
            (Some(expected), _) if rtp.ssrc() != expected => {
                Monitoring::count(&counters.rtp_wrong_sender);
                return;
            }
            (None, Some(accepted)) if rtp.ssrc() != accepted => {
                Monitoring::count(&counters.rtp_wrong_sender);
                return;
            }
            (None, None) => self.accepted_ssrc = Some(rtp.ssrc()),
            _ => (),
        }

        let bpf = self.params.bytes_per_frame();
        let payload = rtp.payload();
        if payload.is_empty() || !payload.len().is_multiple_of(bpf) {
            Monitoring::count(&counters.rtp_malformed);
            return;
        }

        let seq = u16::from(rtp.sequence_number());
        let ts = rtp.timestamp();
        let frames_in_packet = (payload.len() / bpf) as u32;

        if let (Some(last_seq), Some(last_ts)) = (self.last_sequence, self.last_timestamp) {
            let expected_seq = last_seq.wrapping_add(1);
            if seq != expected_seq {
                let seq_delta = seq.wrapping_sub(expected_seq) as i16;
                let expected_ts = last_ts.wrapping_add(frames_in_packet);
                let consistent_ts =
                    expected_ts.wrapping_add((seq_delta as i64 * frames_in_packet as i64) as u32);
                if consistent_ts == ts {
                    debug!(
                        "Out-of-order packet {seq} has a timestamp consistent with its sequence number, queueing for playout"
                    );
                    Monitoring::count(&counters.rtp_out_of_order);
                } else {
                    warn!(
                        "Timestamp of out-of-order packet {seq} is not consistent with its sequence number, discarding it"
                    );
                    Monitoring::count(&counters.rtp_inconsistent_timestamp);
                    return;
                }
            }
        }

        self.last_sequence = Some(seq);
        self.last_timestamp = Some(ts);

        match self.writer.write_packet(seq, ts, payload, host_ns) {
            WriteOutcome::Accepted { .. } => {
                Monitoring::count(&counters.rtp_packets_received);
                if self.state == StreamState::Inactive {
                    self.state = StreamState::Receiving;
                    self.events
                        .send(ReceiverEvent::StreamStateChanged(StreamState::Receiving))
                        .await
                        .ok();
                }
            }
            WriteOutcome::OutsideWindow => {
                let cursor = self.writer.cursor().unwrap_or(ts);
                debug!(
                    "Packet {seq} at rtp_ts {ts} is outside the reorder window (cursor {cursor}, drift {})",
                    WrappingU32(ts).diff(WrappingU32(cursor))
                );
                Monitoring::count(&counters.rtp_out_of_window);
            }
            WriteOutcome::BadLength => {
                Monitoring::count(&counters.rtp_malformed);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        formats::{AudioFormat, ByteOrder, ChannelOrdering, SampleEncoding},
        receiver::{config::StreamConfig, ring::playout_ring},
    };
    use std::sync::atomic::Ordering;

    fn params(source_filter: Option<std::net::IpAddr>) -> ReceiverParams {
        ReceiverParams {
            audio_format: AudioFormat {
                byte_order: ByteOrder::Be,
                encoding: SampleEncoding::PcmS16,
                ordering: ChannelOrdering::Interleaved,
                sample_rate: 48_000,
                num_channels: 2,
            },
            delay_frames: 240,
            streams: vec![StreamConfig {
                connection_address: "239.69.11.44".parse().expect("ip"),
                rtp_port: 5004,
                packet_time_frames: 48,
                ssrc: None,
                payload_type: 98,
                clock_identity: None,
                ptp_domain: 0,
                media_clock_offset: 0,
                source_filter,
            }],
        }
    }

    fn ingest(source_filter: Option<std::net::IpAddr>) -> (Ingest, Monitoring) {
        let params = params(source_filter);
        let monitoring = Monitoring::new();
        let (writer, _reader) = playout_ring(1024, params.bytes_per_frame(), 0);
        let (events_tx, _events_rx) = mpsc::channel(16);
        (
            Ingest::new(params, writer, monitoring.clone(), events_tx),
            monitoring,
        )
    }

    fn rtp_packet(seq: u16, ts: u32, payload_frames: usize, bpf: usize) -> Vec<u8> {
        let mut packet = vec![0u8; 12 + payload_frames * bpf];
        packet[0] = 0x80; // V=2
        packet[1] = 98; // PT
        packet[2..4].copy_from_slice(&seq.to_be_bytes());
        packet[4..8].copy_from_slice(&ts.to_be_bytes());
        packet[8..12].copy_from_slice(&0x1234_5678u32.to_be_bytes());
        for (i, byte) in packet[12..].iter_mut().enumerate() {
            *byte = i as u8;
        }
        packet
    }

    fn sender() -> SocketAddr {
        "192.168.1.68:5004".parse().expect("addr")
    }

    #[tokio::test]
    async fn accepts_well_formed_packets() {
        let (mut ingest, monitoring) = ingest(None);
        ingest
            .rtp_data_received(&rtp_packet(1, 1000, 48, 4), sender(), 0)
            .await;
        ingest
            .rtp_data_received(&rtp_packet(2, 1048, 48, 4), sender(), 0)
            .await;
        let counters = monitoring.counters();
        assert_eq!(counters.rtp_packets_received.load(Ordering::Relaxed), 2);
        assert_eq!(ingest.state, StreamState::Receiving);
    }

    #[tokio::test]
    async fn drops_malformed_and_wrong_payload_type() {
        let (mut ingest, monitoring) = ingest(None);
        ingest.rtp_data_received(&[0u8; 4], sender(), 0).await;
        let mut wrong_pt = rtp_packet(1, 1000, 48, 4);
        wrong_pt[1] = 96;
        ingest.rtp_data_received(&wrong_pt, sender(), 0).await;
        let counters = monitoring.counters();
        assert_eq!(counters.rtp_malformed.load(Ordering::Relaxed), 2);
        assert_eq!(counters.rtp_packets_received.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn enforces_source_filter() {
        let (mut ingest, monitoring) =
            ingest(Some("192.168.1.68".parse().expect("ip")));
        ingest
            .rtp_data_received(
                &rtp_packet(1, 1000, 48, 4),
                "10.0.0.1:5004".parse().expect("addr"),
                0,
            )
            .await;
        assert_eq!(
            monitoring
                .counters()
                .rtp_wrong_sender
                .load(Ordering::Relaxed),
            1
        );
        ingest
            .rtp_data_received(&rtp_packet(2, 1048, 48, 4), sender(), 0)
            .await;
        assert_eq!(
            monitoring
                .counters()
                .rtp_packets_received
                .load(Ordering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn locks_onto_first_ssrc() {
        let (mut ingest, monitoring) = ingest(None);
        ingest
            .rtp_data_received(&rtp_packet(1, 1000, 48, 4), sender(), 0)
            .await;
        let mut other_ssrc = rtp_packet(2, 1048, 48, 4);
        other_ssrc[8..12].copy_from_slice(&0xdead_beefu32.to_be_bytes());
        ingest.rtp_data_received(&other_ssrc, sender(), 0).await;
        let counters = monitoring.counters();
        assert_eq!(counters.rtp_packets_received.load(Ordering::Relaxed), 1);
        assert_eq!(counters.rtp_wrong_sender.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn out_of_order_with_consistent_timestamp_is_queued() {
        let (mut ingest, monitoring) = ingest(None);
        ingest
            .rtp_data_received(&rtp_packet(1, 1000, 48, 4), sender(), 0)
            .await;
        // Sequence 3 arrives before 2 but its timestamp is consistent.
        ingest
            .rtp_data_received(&rtp_packet(3, 1096, 48, 4), sender(), 0)
            .await;
        let counters = monitoring.counters();
        assert_eq!(counters.rtp_out_of_order.load(Ordering::Relaxed), 1);
        assert_eq!(counters.rtp_packets_received.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn inconsistent_timestamp_is_discarded() {
        let (mut ingest, monitoring) = ingest(None);
        ingest
            .rtp_data_received(&rtp_packet(1, 1000, 48, 4), sender(), 0)
            .await;
        ingest
            .rtp_data_received(&rtp_packet(3, 5000, 48, 4), sender(), 0)
            .await;
        let counters = monitoring.counters();
        assert_eq!(
            counters.rtp_inconsistent_timestamp.load(Ordering::Relaxed),
            1
        );
        assert_eq!(counters.rtp_packets_received.load(Ordering::Relaxed), 1);
    }
}
