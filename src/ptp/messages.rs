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

//! Bit-exact codec for PTP messages (IEEE 1588-2019 clause 13). All messages
//! share a 34-byte header; the bodies implemented here are the five the
//! delay request-response mechanism needs: Announce, Sync, Follow_Up,
//! Delay_Req and Delay_Resp.

use crate::{
    bytes::{read_i64_be, read_u16_be, write_i64_be, write_u16_be},
    ptp::types::{ClockIdentity, ClockQuality, PortIdentity, PtpTimestamp, TimeSource},
};
use thiserror::Error;

/// IEEE 1588-2019 Table 36.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Sync = 0x0,
    DelayReq = 0x1,
    PdelayReq = 0x2,
    PdelayResp = 0x3,
    FollowUp = 0x8,
    DelayResp = 0x9,
    PdelayRespFollowUp = 0xa,
    Announce = 0xb,
    Signaling = 0xc,
    Management = 0xd,
}

impl MessageType {
    pub fn from_nibble(value: u8) -> Result<Self, ParseError> {
        match value & 0x0f {
            0x0 => Ok(MessageType::Sync),
            0x1 => Ok(MessageType::DelayReq),
            0x2 => Ok(MessageType::PdelayReq),
            0x3 => Ok(MessageType::PdelayResp),
            0x8 => Ok(MessageType::FollowUp),
            0x9 => Ok(MessageType::DelayResp),
            0xa => Ok(MessageType::PdelayRespFollowUp),
            0xb => Ok(MessageType::Announce),
            0xc => Ok(MessageType::Signaling),
            0xd => Ok(MessageType::Management),
            other => Err(ParseError::UnknownMessageType(other)),
        }
    }

    /// Event messages are timestamped on receipt and travel on port 319.
    pub fn is_event(&self) -> bool {
        matches!(
            self,
            MessageType::Sync
                | MessageType::DelayReq
                | MessageType::PdelayReq
                | MessageType::PdelayResp
        )
    }
}

/// The header flag field, named per IEEE 1588-2019 Table 37. Octet 0 carries
/// the per-message flags, octet 1 the timescale properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlagField {
    pub alternate_master: bool,
    pub two_step: bool,
    pub unicast: bool,
    pub profile_specific_1: bool,
    pub profile_specific_2: bool,
    pub leap61: bool,
    pub leap59: bool,
    pub current_utc_offset_valid: bool,
    pub ptp_timescale: bool,
    pub time_traceable: bool,
    pub frequency_traceable: bool,
    pub synchronization_uncertain: bool,
}

impl FlagField {
    pub fn from_octets(octet0: u8, octet1: u8) -> Self {
        FlagField {
            alternate_master: octet0 & 0x01 != 0,
            two_step: octet0 & 0x02 != 0,
            unicast: octet0 & 0x04 != 0,
            profile_specific_1: octet0 & 0x20 != 0,
            profile_specific_2: octet0 & 0x40 != 0,
            leap61: octet1 & 0x01 != 0,
            leap59: octet1 & 0x02 != 0,
            current_utc_offset_valid: octet1 & 0x04 != 0,
            ptp_timescale: octet1 & 0x08 != 0,
            time_traceable: octet1 & 0x10 != 0,
            frequency_traceable: octet1 & 0x20 != 0,
            synchronization_uncertain: octet1 & 0x40 != 0,
        }
    }

    pub fn to_octets(self) -> [u8; 2] {
        let mut octet0 = 0u8;
        let mut octet1 = 0u8;
        if self.alternate_master {
            octet0 |= 0x01;
        }
        if self.two_step {
            octet0 |= 0x02;
        }
        if self.unicast {
            octet0 |= 0x04;
        }
        if self.profile_specific_1 {
            octet0 |= 0x20;
        }
        if self.profile_specific_2 {
            octet0 |= 0x40;
        }
        if self.leap61 {
            octet1 |= 0x01;
        }
        if self.leap59 {
            octet1 |= 0x02;
        }
        if self.current_utc_offset_valid {
            octet1 |= 0x04;
        }
        if self.ptp_timescale {
            octet1 |= 0x08;
        }
        if self.time_traceable {
            octet1 |= 0x10;
        }
        if self.frequency_traceable {
            octet1 |= 0x20;
        }
        if self.synchronization_uncertain {
            octet1 |= 0x40;
        }
        [octet0, octet1]
    }
}

pub const PTP_MAJOR_VERSION: u8 = 2;

/// The common 34-byte message header (IEEE 1588-2019 13.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// 12-bit SDO id: major nibble from byte 0, minor byte at offset 5.
    pub sdo_id: u16,
    pub message_type: MessageType,
    pub version_major: u8,
    pub version_minor: u8,
    pub message_length: u16,
    pub domain_number: u8,
    pub flags: FlagField,
    /// Scaled nanoseconds (ns * 2^16), signed.
    pub correction_field: i64,
    pub source_port_identity: PortIdentity,
    pub sequence_id: u16,
    pub control_field: u8,
    pub log_message_interval: i8,
}

impl MessageHeader {
    pub const SIZE: usize = 34;

    pub fn new(message_type: MessageType, source: PortIdentity, sequence_id: u16) -> Self {
        let control_field = match message_type {
            MessageType::Sync => 0x00,
            MessageType::DelayReq => 0x01,
            MessageType::FollowUp => 0x02,
            MessageType::DelayResp => 0x03,
            MessageType::Announce => 0x05,
            _ => 0x05,
        };
        MessageHeader {
            sdo_id: 0,
            message_type,
            version_major: PTP_MAJOR_VERSION,
            version_minor: 0,
            message_length: 0,
            domain_number: 0,
            flags: FlagField::default(),
            correction_field: 0,
            source_port_identity: source,
            sequence_id,
            control_field,
            log_message_interval: 0x7f,
        }
    }

    pub fn from_data(data: &[u8]) -> Result<Self, ParseError> {
        if data.len() < Self::SIZE {
            return Err(ParseError::TooShort {
                needed: Self::SIZE,
                have: data.len(),
            });
        }
        let message_type = MessageType::from_nibble(data[0])?;
        let version_major = data[1] & 0x0f;
        if version_major != PTP_MAJOR_VERSION {
            return Err(ParseError::UnsupportedVersion(version_major));
        }
        let source_port_identity =
            PortIdentity::from_data(&data[20..30]).ok_or(ParseError::TooShort {
                needed: 30,
                have: data.len(),
            })?;
        Ok(MessageHeader {
            sdo_id: ((data[0] as u16 >> 4) << 8) | data[5] as u16,
            message_type,
            version_major,
            version_minor: data[1] >> 4,
            message_length: read_u16_be(&data[2..]),
            domain_number: data[4],
            flags: FlagField::from_octets(data[6], data[7]),
            correction_field: read_i64_be(&data[8..]),
            source_port_identity,
            sequence_id: read_u16_be(&data[30..]),
            control_field: data[32],
            log_message_interval: data[33] as i8,
        })
    }

    pub fn write_to(&self, buf: &mut [u8]) {
        buf[0] = (((self.sdo_id >> 8) as u8) << 4) | (self.message_type as u8 & 0x0f);
        buf[1] = (self.version_minor << 4) | (self.version_major & 0x0f);
        write_u16_be(&mut buf[2..], self.message_length);
        buf[4] = self.domain_number;
        buf[5] = (self.sdo_id & 0xff) as u8;
        let flags = self.flags.to_octets();
        buf[6] = flags[0];
        buf[7] = flags[1];
        write_i64_be(&mut buf[8..], self.correction_field);
        buf[16..20].fill(0);
        self.source_port_identity.write_to(&mut buf[20..30]);
        write_u16_be(&mut buf[30..], self.sequence_id);
        buf[32] = self.control_field;
        buf[33] = self.log_message_interval as u8;
    }

    /// Two headers match when their source port identity and sequence id are
    /// equal (IEEE 1588-2019 9.5.5).
    pub fn matches(&self, other: &MessageHeader) -> bool {
        self.source_port_identity == other.source_port_identity
            && self.sequence_id == other.sequence_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnnounceMessage {
    pub header: MessageHeader,
    pub origin_timestamp: PtpTimestamp,
    pub current_utc_offset: i16,
    pub grandmaster_priority1: u8,
    pub grandmaster_clock_quality: ClockQuality,
    pub grandmaster_priority2: u8,
    pub grandmaster_identity: ClockIdentity,
    pub steps_removed: u16,
    pub time_source: TimeSource,
}

impl AnnounceMessage {
    pub const BODY_SIZE: usize = 30;

    pub fn from_data(header: MessageHeader, body: &[u8]) -> Result<Self, ParseError> {
        if body.len() < Self::BODY_SIZE {
            return Err(ParseError::TooShort {
                needed: MessageHeader::SIZE + Self::BODY_SIZE,
                have: MessageHeader::SIZE + body.len(),
            });
        }
        Ok(AnnounceMessage {
            header,
            origin_timestamp: PtpTimestamp::from_data(body).ok_or(ParseError::TooShort {
                needed: MessageHeader::SIZE + Self::BODY_SIZE,
                have: MessageHeader::SIZE + body.len(),
            })?,
            current_utc_offset: read_u16_be(&body[10..]) as i16,
            grandmaster_priority1: body[13],
            grandmaster_clock_quality: ClockQuality::from_data(&body[14..18]).ok_or(
                ParseError::TooShort {
                    needed: MessageHeader::SIZE + Self::BODY_SIZE,
                    have: MessageHeader::SIZE + body.len(),
                },
            )?,
            grandmaster_priority2: body[18],
            grandmaster_identity: ClockIdentity::from_data(&body[19..27]).ok_or(
                ParseError::TooShort {
                    needed: MessageHeader::SIZE + Self::BODY_SIZE,
                    have: MessageHeader::SIZE + body.len(),
                },
            )?,
            steps_removed: read_u16_be(&body[27..]),
            time_source: TimeSource::from_u8(body[29]),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; MessageHeader::SIZE + Self::BODY_SIZE];
        let mut header = self.header;
        header.message_length = buf.len() as u16;
        header.write_to(&mut buf);
        let body = &mut buf[MessageHeader::SIZE..];
        self.origin_timestamp.write_to(body);
        write_u16_be(&mut body[10..], self.current_utc_offset as u16);
        body[13] = self.grandmaster_priority1;
        self.grandmaster_clock_quality.write_to(&mut body[14..18]);
        body[18] = self.grandmaster_priority2;
        body[19..27].copy_from_slice(&self.grandmaster_identity.0);
        write_u16_be(&mut body[27..], self.steps_removed);
        body[29] = self.time_source as u8;
        buf
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncMessage {
    pub header: MessageHeader,
    pub origin_timestamp: PtpTimestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FollowUpMessage {
    pub header: MessageHeader,
    pub precise_origin_timestamp: PtpTimestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayReqMessage {
    pub header: MessageHeader,
    pub origin_timestamp: PtpTimestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayRespMessage {
    pub header: MessageHeader,
    pub receive_timestamp: PtpTimestamp,
    pub requesting_port_identity: PortIdentity,
}

const TIMESTAMP_BODY_SIZE: usize = PtpTimestamp::WIRE_SIZE;
const DELAY_RESP_BODY_SIZE: usize = 20;

fn timestamp_body(body: &[u8], total_len: usize) -> Result<PtpTimestamp, ParseError> {
    PtpTimestamp::from_data(body).ok_or(ParseError::TooShort {
        needed: MessageHeader::SIZE + TIMESTAMP_BODY_SIZE,
        have: total_len,
    })
}

fn encode_with_timestamp(header: MessageHeader, timestamp: PtpTimestamp) -> Vec<u8> {
    let mut buf = vec![0u8; MessageHeader::SIZE + TIMESTAMP_BODY_SIZE];
    let mut header = header;
    header.message_length = buf.len() as u16;
    header.write_to(&mut buf);
    timestamp.write_to(&mut buf[MessageHeader::SIZE..]);
    buf
}

impl SyncMessage {
    pub fn from_data(header: MessageHeader, body: &[u8]) -> Result<Self, ParseError> {
        Ok(SyncMessage {
            header,
            origin_timestamp: timestamp_body(body, MessageHeader::SIZE + body.len())?,
        })
    }

    pub fn two_step(&self) -> bool {
        self.header.flags.two_step
    }

    pub fn encode(&self) -> Vec<u8> {
        encode_with_timestamp(self.header, self.origin_timestamp)
    }
}

impl FollowUpMessage {
    pub fn from_data(header: MessageHeader, body: &[u8]) -> Result<Self, ParseError> {
        Ok(FollowUpMessage {
            header,
            precise_origin_timestamp: timestamp_body(body, MessageHeader::SIZE + body.len())?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        encode_with_timestamp(self.header, self.precise_origin_timestamp)
    }
}

impl DelayReqMessage {
    /// Builds a Delay_Req ready for sending. The origin timestamp may stay
    /// zero; the slave records t3 at actual send time.
    pub fn new(source: PortIdentity, sequence_id: u16, domain_number: u8) -> Self {
        let mut header = MessageHeader::new(MessageType::DelayReq, source, sequence_id);
        header.domain_number = domain_number;
        DelayReqMessage {
            header,
            origin_timestamp: PtpTimestamp::default(),
        }
    }

    pub fn from_data(header: MessageHeader, body: &[u8]) -> Result<Self, ParseError> {
        Ok(DelayReqMessage {
            header,
            origin_timestamp: timestamp_body(body, MessageHeader::SIZE + body.len())?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        encode_with_timestamp(self.header, self.origin_timestamp)
    }
}

impl DelayRespMessage {
    pub fn from_data(header: MessageHeader, body: &[u8]) -> Result<Self, ParseError> {
        if body.len() < DELAY_RESP_BODY_SIZE {
            return Err(ParseError::TooShort {
                needed: MessageHeader::SIZE + DELAY_RESP_BODY_SIZE,
                have: MessageHeader::SIZE + body.len(),
            });
        }
        Ok(DelayRespMessage {
            header,
            receive_timestamp: timestamp_body(body, MessageHeader::SIZE + body.len())?,
            requesting_port_identity: PortIdentity::from_data(&body[10..20]).ok_or(
                ParseError::TooShort {
                    needed: MessageHeader::SIZE + DELAY_RESP_BODY_SIZE,
                    have: MessageHeader::SIZE + body.len(),
                },
            )?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; MessageHeader::SIZE + DELAY_RESP_BODY_SIZE];
        let mut header = self.header;
        header.message_length = buf.len() as u16;
        header.write_to(&mut buf);
        self.receive_timestamp
            .write_to(&mut buf[MessageHeader::SIZE..]);
        self.requesting_port_identity
            .write_to(&mut buf[MessageHeader::SIZE + 10..]);
        buf
    }
}

/// A fully decoded PTP message. Types the engine has no use for decode to
/// `Other` so their arrival can still be counted.
#[derive(Debug, Clone)]
pub enum Message {
    Announce(AnnounceMessage),
    Sync(SyncMessage),
    FollowUp(FollowUpMessage),
    DelayReq(DelayReqMessage),
    DelayResp(DelayRespMessage),
    Other(MessageHeader),
}

impl Message {
    pub fn decode(data: &[u8]) -> Result<Self, ParseError> {
        let header = MessageHeader::from_data(data)?;
        let body = &data[MessageHeader::SIZE..];
        match header.message_type {
            MessageType::Announce => AnnounceMessage::from_data(header, body).map(Message::Announce),
            MessageType::Sync => SyncMessage::from_data(header, body).map(Message::Sync),
            MessageType::FollowUp => FollowUpMessage::from_data(header, body).map(Message::FollowUp),
            MessageType::DelayReq => DelayReqMessage::from_data(header, body).map(Message::DelayReq),
            MessageType::DelayResp => {
                DelayRespMessage::from_data(header, body).map(Message::DelayResp)
            }
            _ => Ok(Message::Other(header)),
        }
    }

    pub fn header(&self) -> &MessageHeader {
        match self {
            Message::Announce(m) => &m.header,
            Message::Sync(m) => &m.header,
            Message::FollowUp(m) => &m.header,
            Message::DelayReq(m) => &m.header,
            Message::DelayResp(m) => &m.header,
            Message::Other(h) => h,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum ParseError {
    #[error("packet too short: need {needed} bytes, have {have}")]
    TooShort { needed: usize, have: usize },
    #[error("unsupported PTP version: {0}")]
    UnsupportedVersion(u8),
    #[error("unknown PTP message type: {0:#x}")]
    UnknownMessageType(u8),
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ptp::types::ClockAccuracy;

    fn source() -> PortIdentity {
        PortIdentity::new(
            ClockIdentity([0x2c, 0xcf, 0x67, 0x55, 0xb2, 0x9a, 0x2f, 0xaa]),
            1,
        )
    }

    #[test]
    fn header_round_trips_every_field() {
        let mut header = MessageHeader::new(MessageType::Sync, source(), 4711);
        header.domain_number = 3;
        header.sdo_id = 0x123;
        header.flags.two_step = true;
        header.flags.ptp_timescale = true;
        header.correction_field = -42 << 16;
        header.log_message_interval = -3;
        header.message_length = MessageHeader::SIZE as u16;

        let mut buf = [0u8; MessageHeader::SIZE];
        header.write_to(&mut buf);
        let decoded = MessageHeader::from_data(&buf).expect("valid header");
        assert_eq!(decoded, header);
    }

    #[test]
    fn header_rejects_wrong_version() {
        let header = MessageHeader::new(MessageType::Sync, source(), 1);
        let mut buf = [0u8; MessageHeader::SIZE];
        header.write_to(&mut buf);
        buf[1] = 0x01;
        assert!(matches!(
            MessageHeader::from_data(&buf),
            Err(ParseError::UnsupportedVersion(1))
        ));
    }

    #[test]
    fn announce_round_trips() {
        let mut header = MessageHeader::new(MessageType::Announce, source(), 77);
        header.domain_number = 0;
        let announce = AnnounceMessage {
            header,
            origin_timestamp: PtpTimestamp::new(1000, 500),
            current_utc_offset: 37,
            grandmaster_priority1: 128,
            grandmaster_clock_quality: ClockQuality {
                clock_class: 6,
                clock_accuracy: ClockAccuracy::Lt25Ns,
                offset_scaled_log_variance: 0x8000,
            },
            grandmaster_priority2: 128,
            grandmaster_identity: ClockIdentity([0xaa; 8]),
            steps_removed: 2,
            time_source: TimeSource::Gnss,
        };
        let bytes = announce.encode();
        assert_eq!(bytes.len(), MessageHeader::SIZE + AnnounceMessage::BODY_SIZE);
        match Message::decode(&bytes).expect("valid announce") {
            Message::Announce(decoded) => {
                let mut expected = announce;
                expected.header.message_length = bytes.len() as u16;
                assert_eq!(decoded, expected);
            }
            other => panic!("decoded wrong message type: {other:?}"),
        }
    }

    #[test]
    fn sync_two_step_flag() {
        let mut header = MessageHeader::new(MessageType::Sync, source(), 5);
        header.flags.two_step = true;
        let sync = SyncMessage {
            header,
            origin_timestamp: PtpTimestamp::default(),
        };
        let bytes = sync.encode();
        // The two-step flag is bit 1 of flag octet 0 at offset 6.
        assert_eq!(bytes[6] & 0x02, 0x02);
        match Message::decode(&bytes).expect("valid sync") {
            Message::Sync(decoded) => assert!(decoded.two_step()),
            other => panic!("decoded wrong message type: {other:?}"),
        }
    }

    #[test]
    fn delay_resp_round_trips() {
        let header = MessageHeader::new(MessageType::DelayResp, source(), 99);
        let resp = DelayRespMessage {
            header,
            receive_timestamp: PtpTimestamp::new(12, 2_200_000),
            requesting_port_identity: PortIdentity::new(ClockIdentity([7; 8]), 1),
        };
        let bytes = resp.encode();
        match Message::decode(&bytes).expect("valid delay resp") {
            Message::DelayResp(decoded) => {
                assert_eq!(decoded.receive_timestamp, resp.receive_timestamp);
                assert_eq!(
                    decoded.requesting_port_identity,
                    resp.requesting_port_identity
                );
            }
            other => panic!("decoded wrong message type: {other:?}"),
        }
    }

    #[test]
    fn short_packets_are_rejected() {
        assert!(matches!(
            Message::decode(&[0u8; 10]),
            Err(ParseError::TooShort { .. })
        ));
        let header = MessageHeader::new(MessageType::Announce, source(), 1);
        let mut buf = [0u8; MessageHeader::SIZE + 4];
        header.write_to(&mut buf);
        assert!(matches!(
            Message::decode(&buf),
            Err(ParseError::TooShort { .. })
        ));
    }

    #[test]
    fn delay_req_defaults() {
        let req = DelayReqMessage::new(source(), 42, 7);
        let bytes = req.encode();
        let decoded = MessageHeader::from_data(&bytes).expect("valid header");
        assert_eq!(decoded.message_type, MessageType::DelayReq);
        assert_eq!(decoded.domain_number, 7);
        assert_eq!(decoded.sequence_id, 42);
        assert_eq!(decoded.control_field, 0x01);
        assert_eq!(decoded.log_message_interval, 0x7f);
    }
}
