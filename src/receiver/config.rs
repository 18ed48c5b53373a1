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

use crate::{
    formats::{AudioFormat, ByteOrder, ChannelOrdering},
    ptp::types::ClockIdentity,
    sdp::StreamDescription,
};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Playout offset behind the PTP-derived 'now', in frames.
pub const DEFAULT_DELAY_FRAMES: u32 = 240;

/// One RTP flow feeding the receiver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub connection_address: IpAddr,
    pub rtp_port: u16,
    pub packet_time_frames: usize,
    pub ssrc: Option<u32>,
    pub payload_type: u8,
    pub clock_identity: Option<ClockIdentity>,
    pub ptp_domain: u8,
    /// RTP timestamp offset on the PTP timescale (`a=mediaclk:direct`).
    pub media_clock_offset: u32,
    /// Accept datagrams from this source only (SSM / declared origin).
    pub source_filter: Option<IpAddr>,
}

/// Everything the RTP receive pipeline needs to run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiverParams {
    pub audio_format: AudioFormat,
    pub delay_frames: u32,
    pub streams: Vec<StreamConfig>,
}

impl ReceiverParams {
    pub fn from_stream_description(desc: &StreamDescription, delay_frames: u32) -> Self {
        ReceiverParams {
            audio_format: AudioFormat {
                // RTP payloads are big-endian on the wire and stay that way
                // in the ring.
                byte_order: ByteOrder::Be,
                encoding: desc.encoding,
                ordering: ChannelOrdering::Interleaved,
                sample_rate: desc.sample_rate,
                num_channels: desc.channels,
            },
            delay_frames,
            streams: vec![StreamConfig {
                connection_address: desc.connection_address,
                rtp_port: desc.rtp_port,
                packet_time_frames: desc.packet_time_frames,
                ssrc: None,
                payload_type: desc.payload_type,
                clock_identity: desc
                    .reference_clock
                    .as_ref()
                    .map(|clk| clk.grandmaster_identity),
                ptp_domain: desc
                    .reference_clock
                    .as_ref()
                    .map(|clk| clk.domain)
                    .unwrap_or(0),
                media_clock_offset: desc.media_clock_offset,
                source_filter: desc.source_filter.or(Some(desc.origin_ip)),
            }],
        }
    }

    pub fn bytes_per_frame(&self) -> usize {
        self.audio_format.bytes_per_frame()
    }

    pub fn primary_stream(&self) -> &StreamConfig {
        &self.streams[0]
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{formats::SampleEncoding, sdp::ReferenceClock};

    fn desc() -> StreamDescription {
        StreamDescription {
            session_name: "test".to_owned(),
            origin_ip: "192.168.1.68".parse().expect("ip"),
            connection_address: "239.69.11.44".parse().expect("ip"),
            rtp_port: 5004,
            payload_type: 98,
            encoding: SampleEncoding::PcmS24,
            sample_rate: 48_000,
            channels: 8,
            packet_time_ms: 1.0,
            packet_time_frames: 48,
            reference_clock: Some(ReferenceClock {
                grandmaster_identity: ClockIdentity([1; 8]),
                domain: 0,
            }),
            media_clock_offset: 0,
            source_filter: None,
        }
    }

    #[test]
    fn params_derive_from_stream_description() {
        let params = ReceiverParams::from_stream_description(&desc(), DEFAULT_DELAY_FRAMES);
        assert_eq!(params.bytes_per_frame(), 24);
        assert_eq!(params.delay_frames, 240);
        let stream = params.primary_stream();
        assert_eq!(stream.packet_time_frames, 48);
        assert_eq!(stream.clock_identity, Some(ClockIdentity([1; 8])));
        // Without an explicit source filter the declared origin is enforced.
        assert_eq!(
            stream.source_filter,
            Some("192.168.1.68".parse().expect("ip"))
        );
    }
}
