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

//! Extraction of the SDP fields an AES67 receiver consumes: connection data,
//! the audio media description with its `rtpmap` and `ptime`, the PTP
//! reference clock and media clock attributes, and the optional SSM source
//! filter.

use crate::{
    error::ConfigError,
    formats::{MilliSeconds, SampleEncoding, frames_per_packet},
    ptp::types::ClockIdentity,
};
use lazy_static::lazy_static;
use regex::Regex;
use sdp::SessionDescription;
use serde::{Deserialize, Serialize};
use std::{io::Cursor, net::IpAddr};

lazy_static! {
    static ref RTPMAP_REGEX: Regex = Regex::new(r"([0-9]+) (L[0-9]+)/([0-9]+)(?:/([0-9]+))?")
        .expect("no dynamic input, can't fail");
    static ref TS_REFCLK_REGEX: Regex =
        Regex::new(r"ptp=(.+?):([0-9a-fA-F-]+)(?::([0-9]+))?").expect("no dynamic input, can't fail");
    static ref MEDIACLK_REGEX: Regex =
        Regex::new(r"direct(?:=([0-9]+))?").expect("no dynamic input, can't fail");
    static ref SOURCE_FILTER_REGEX: Regex =
        Regex::new(r"incl IN IP4 (\S+) (\S+)").expect("no dynamic input, can't fail");
}

/// The PTP reference clock pinned by `a=ts-refclk`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceClock {
    pub grandmaster_identity: ClockIdentity,
    pub domain: u8,
}

/// Everything the receiver consumes from one SDP audio media description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamDescription {
    pub session_name: String,
    pub origin_ip: IpAddr,
    pub connection_address: IpAddr,
    pub rtp_port: u16,
    pub payload_type: u8,
    pub encoding: SampleEncoding,
    pub sample_rate: usize,
    pub channels: usize,
    pub packet_time_ms: MilliSeconds,
    pub packet_time_frames: usize,
    pub reference_clock: Option<ReferenceClock>,
    /// Media clock offset on the PTP timescale from `a=mediaclk:direct=<n>`.
    pub media_clock_offset: u32,
    /// Source address from `a=source-filter: incl`, if present.
    pub source_filter: Option<IpAddr>,
}

impl StreamDescription {
    pub fn parse(sdp_content: &str) -> Result<Self, ConfigError> {
        let sd = SessionDescription::unmarshal(&mut Cursor::new(sdp_content))
            .map_err(|e| ConfigError::InvalidSdp(e.to_string()))?;
        Self::try_from(&sd)
    }
}

fn media_or_session_attribute(
    sd: &SessionDescription,
    media: &sdp::description::media::MediaDescription,
    name: &str,
) -> Option<String> {
    if let Some(Some(value)) = media.attribute(name) {
        return Some(value.to_owned());
    }
    sd.attributes
        .iter()
        .find(|attribute| attribute.key == name)
        .and_then(|attribute| attribute.value.clone())
}

impl TryFrom<&SessionDescription> for StreamDescription {
    type Error = ConfigError;

    fn try_from(sd: &SessionDescription) -> Result<Self, Self::Error> {
        let origin_ip = sd.origin.unicast_address.parse()?;

        let media = sd
            .media_descriptions
            .first()
            .ok_or_else(|| ConfigError::InvalidSdp("no media description found".to_owned()))?;

        if media.media_name.media != "audio" {
            return Err(ConfigError::InvalidSdp(format!(
                "unsupported media type: {}",
                media.media_name.media
            )));
        }

        if !(media.media_name.protos.contains(&"RTP".to_owned())
            && media.media_name.protos.contains(&"AVP".to_owned()))
        {
            return Err(ConfigError::InvalidSdp(format!(
                "unsupported media protocols: {:?}; only RTP/AVP is supported",
                media.media_name.protos
            )));
        }

        let fmt = media
            .media_name
            .formats
            .first()
            .ok_or_else(|| ConfigError::InvalidSdp("no media format found".to_owned()))?;

        let rtpmap = media
            .attribute("rtpmap")
            .and_then(|it| it)
            .ok_or_else(|| ConfigError::InvalidSdp("no rtpmap found".to_owned()))?;

        let (payload_type, encoding, sample_rate, channels) =
            if let Some(caps) = RTPMAP_REGEX.captures(rtpmap) {
                (
                    caps[1].to_owned(),
                    caps[2].parse::<SampleEncoding>()?,
                    caps[3].parse().expect("regex guarantees this is a number"),
                    caps.get(4)
                        .map(|c| c.as_str().parse().expect("regex guarantees this is a number"))
                        .unwrap_or(1),
                )
            } else {
                return Err(ConfigError::InvalidSdp("malformed rtpmap".to_owned()));
            };

        if &payload_type != fmt {
            return Err(ConfigError::InvalidSdp(
                "rtpmap and media description payload types do not match".to_owned(),
            ));
        }

        let payload_type = payload_type
            .parse::<u8>()
            .map_err(|_| ConfigError::InvalidSdp(format!("invalid payload type: {payload_type}")))?;

        let packet_time_ms: MilliSeconds = media
            .attribute("ptime")
            .and_then(|it| it)
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| ConfigError::InvalidSdp("no ptime".to_owned()))?;

        let global_c = sd.connection_information.as_ref();
        let destination_address = media
            .connection_information
            .as_ref()
            .or(global_c)
            .ok_or_else(|| {
                ConfigError::InvalidSdp("no connection information for media".to_owned())
            })?
            .address
            .as_ref()
            .ok_or_else(|| ConfigError::InvalidSdp("no address for media".to_owned()))?
            .address
            .to_owned();

        // Strip the TTL/prefix suffix of `c=IN IP4 239.1.2.3/32`.
        let ip = destination_address
            .split('/')
            .next()
            .ok_or_else(|| ConfigError::InvalidSdp("empty connection address".to_owned()))?;
        let connection_address: IpAddr = ip.parse()?;

        let rtp_port = media.media_name.port.value as u16;

        let reference_clock = media_or_session_attribute(sd, media, "ts-refclk")
            .and_then(|value| parse_ts_refclk(&value));

        let media_clock_offset = media_or_session_attribute(sd, media, "mediaclk")
            .and_then(|clk| {
                MEDIACLK_REGEX
                    .captures(&clk)
                    .and_then(|caps| caps.get(1))
                    .and_then(|offset| offset.as_str().parse().ok())
            })
            .unwrap_or(0);

        let source_filter = media_or_session_attribute(sd, media, "source-filter")
            .and_then(|value| {
                SOURCE_FILTER_REGEX
                    .captures(&value)
                    .and_then(|caps| caps[2].parse().ok())
            });

        Ok(StreamDescription {
            session_name: sd.session_name.clone(),
            origin_ip,
            connection_address,
            rtp_port,
            payload_type,
            encoding,
            sample_rate,
            channels,
            packet_time_ms,
            packet_time_frames: frames_per_packet(sample_rate, packet_time_ms),
            reference_clock,
            media_clock_offset,
            source_filter,
        })
    }
}

fn parse_ts_refclk(value: &str) -> Option<ReferenceClock> {
    let caps = TS_REFCLK_REGEX.captures(value)?;
    let id_bytes = hex::decode(caps[2].replace('-', "")).ok()?;
    let grandmaster_identity = ClockIdentity::from_data(&id_bytes)?;
    let domain = caps
        .get(3)
        .and_then(|d| d.as_str().parse().ok())
        .unwrap_or(0);
    Some(ReferenceClock {
        grandmaster_identity,
        domain,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    const SDP: &str = "v=0\r\n\
o=- 1311738121 1311738121 IN IP4 192.168.1.68\r\n\
s=Stage Box 8ch\r\n\
c=IN IP4 239.69.11.44/32\r\n\
t=0 0\r\n\
a=clock-domain:PTPv2 0\r\n\
m=audio 5004 RTP/AVP 98\r\n\
i=Channels 1-8\r\n\
a=rtpmap:98 L24/48000/8\r\n\
a=recvonly\r\n\
a=ptime:1\r\n\
a=ts-refclk:ptp=IEEE1588-2008:39-A7-94-FF-FE-07-CB-D0:0\r\n\
a=mediaclk:direct=963214424\r\n\
a=source-filter: incl IN IP4 239.69.11.44 192.168.1.68\r\n";

    #[test]
    fn parses_a_ravenna_stream_description() {
        let desc = StreamDescription::parse(SDP).expect("valid sdp");
        assert_eq!(desc.session_name, "Stage Box 8ch");
        assert_eq!(desc.connection_address, "239.69.11.44".parse::<IpAddr>().expect("ip"));
        assert_eq!(desc.rtp_port, 5004);
        assert_eq!(desc.payload_type, 98);
        assert_eq!(desc.encoding, SampleEncoding::PcmS24);
        assert_eq!(desc.sample_rate, 48_000);
        assert_eq!(desc.channels, 8);
        assert_eq!(desc.packet_time_frames, 48);
        assert_eq!(desc.media_clock_offset, 963214424);
        assert_eq!(
            desc.source_filter,
            Some("192.168.1.68".parse::<IpAddr>().expect("ip"))
        );

        let refclk = desc.reference_clock.expect("ts-refclk present");
        assert_eq!(refclk.domain, 0);
        assert_eq!(
            refclk.grandmaster_identity,
            ClockIdentity([0x39, 0xa7, 0x94, 0xff, 0xfe, 0x07, 0xcb, 0xd0])
        );
    }

    #[test]
    fn rejects_missing_ptime() {
        let sdp = SDP.replace("a=ptime:1\r\n", "");
        assert!(matches!(
            StreamDescription::parse(&sdp),
            Err(ConfigError::InvalidSdp(_))
        ));
    }

    #[test]
    fn rejects_video_media() {
        let sdp = SDP.replace("m=audio", "m=video");
        assert!(StreamDescription::parse(&sdp).is_err());
    }

    #[test]
    fn mono_rtpmap_defaults_to_one_channel() {
        let sdp = SDP
            .replace("a=rtpmap:98 L24/48000/8", "a=rtpmap:98 L16/44100")
            .replace("i=Channels 1-8\r\n", "");
        let desc = StreamDescription::parse(&sdp).expect("valid sdp");
        assert_eq!(desc.channels, 1);
        assert_eq!(desc.encoding, SampleEncoding::PcmS16);
        assert_eq!(desc.sample_rate, 44_100);
    }
}
