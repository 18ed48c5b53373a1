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

//! Elementary PTP data types: clock and port identities, the 80-bit
//! timestamp, the fixed-point time interval and the clock quality bundle
//! (IEEE 1588-2019 clauses 5.3 and 7.6).

use crate::{
    bytes::{read_u16_be, read_u32_be, read_u48_be, write_u16_be, write_u32_be, write_u48_be},
    formats::FramesPerSecond,
};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const NANOS_PER_SEC: i64 = 1_000_000_000;

/// 8-octet clock identity. When constructed from an EUI-48 the MAC occupies
/// octets 0..6 and two implementer-specific octets fill octets 6 and 7
/// (IEEE 1588-2019 7.5.2.2.2.2).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct ClockIdentity(pub [u8; 8]);

impl ClockIdentity {
    pub const IMPLEMENTER_SPECIFIC_OCTETS: [u8; 2] = [0x2f, 0xaa];

    pub fn from_mac_address(mac: [u8; 6]) -> Option<Self> {
        if mac.iter().all(|byte| *byte == 0) {
            return None;
        }
        Some(ClockIdentity([
            mac[0],
            mac[1],
            mac[2],
            mac[3],
            mac[4],
            mac[5],
            Self::IMPLEMENTER_SPECIFIC_OCTETS[0],
            Self::IMPLEMENTER_SPECIFIC_OCTETS[1],
        ]))
    }

    pub fn from_data(data: &[u8]) -> Option<Self> {
        if data.len() < 8 {
            return None;
        }
        let mut id = [0u8; 8];
        id.copy_from_slice(&data[..8]);
        Some(ClockIdentity(id))
    }

    pub fn all_zero(&self) -> bool {
        self.0.iter().all(|byte| *byte == 0)
    }

    pub fn is_valid(&self) -> bool {
        if self.all_zero() {
            return false;
        }
        if self.0[6] == Self::IMPLEMENTER_SPECIFIC_OCTETS[0]
            && self.0[7] == Self::IMPLEMENTER_SPECIFIC_OCTETS[1]
        {
            return self.0[..6].iter().any(|byte| *byte != 0);
        }
        true
    }
}

impl fmt::Display for ClockIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Port number 0 is invalid, 0xffff addresses all ports of a clock.
pub const ALL_PORTS: u16 = 0xffff;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct PortIdentity {
    pub clock_identity: ClockIdentity,
    pub port_number: u16,
}

impl PortIdentity {
    pub fn new(clock_identity: ClockIdentity, port_number: u16) -> Self {
        PortIdentity {
            clock_identity,
            port_number,
        }
    }

    pub fn from_data(data: &[u8]) -> Option<Self> {
        if data.len() < 10 {
            return None;
        }
        Some(PortIdentity {
            clock_identity: ClockIdentity::from_data(&data[..8])?,
            port_number: read_u16_be(&data[8..]),
        })
    }

    pub fn write_to(&self, buf: &mut [u8]) {
        buf[..8].copy_from_slice(&self.clock_identity.0);
        write_u16_be(&mut buf[8..], self.port_number);
    }

    pub fn is_valid(&self) -> bool {
        self.clock_identity.is_valid() && self.port_number >= 1 && self.port_number < ALL_PORTS
    }
}

impl fmt::Display for PortIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.clock_identity, self.port_number)
    }
}

/// PTP timestamp: 48-bit seconds since the PTP epoch plus nanoseconds,
/// normalized so that `nanoseconds < 10^9`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct PtpTimestamp {
    pub seconds: u64,
    pub nanoseconds: u32,
}

impl PtpTimestamp {
    pub const WIRE_SIZE: usize = 10;

    pub fn new(seconds: u64, nanoseconds: u32) -> Self {
        let carry = (nanoseconds / NANOS_PER_SEC as u32) as u64;
        PtpTimestamp {
            seconds: seconds + carry,
            nanoseconds: nanoseconds % NANOS_PER_SEC as u32,
        }
    }

    pub fn from_nanos(total_nanos: u64) -> Self {
        PtpTimestamp {
            seconds: total_nanos / NANOS_PER_SEC as u64,
            nanoseconds: (total_nanos % NANOS_PER_SEC as u64) as u32,
        }
    }

    pub fn total_nanos(&self) -> i128 {
        self.seconds as i128 * NANOS_PER_SEC as i128 + self.nanoseconds as i128
    }

    pub fn is_valid(&self) -> bool {
        self.seconds != 0 || self.nanoseconds != 0
    }

    /// Adds a real-valued number of seconds. Negative results clamp to zero,
    /// a timestamp cannot lie before the epoch.
    pub fn add_seconds(&self, seconds: f64) -> Self {
        let delta = (seconds * NANOS_PER_SEC as f64).round() as i128;
        let total = (self.total_nanos() + delta).max(0);
        PtpTimestamp {
            seconds: (total / NANOS_PER_SEC as i128) as u64,
            nanoseconds: (total % NANOS_PER_SEC as i128) as u32,
        }
    }

    /// Signed difference `self - earlier` as a time interval.
    pub fn diff(&self, earlier: &PtpTimestamp) -> TimeInterval {
        TimeInterval::from_total_nanos(self.total_nanos() - earlier.total_nanos())
    }

    /// Projects this timestamp onto the 32-bit RTP media clock running at
    /// `sample_rate`. Periodic with period `2^32 / sample_rate` seconds and
    /// monotonic within a period.
    pub fn to_rtp_timestamp32(&self, sample_rate: FramesPerSecond) -> u32 {
        let rate = sample_rate as u128;
        let whole = self.seconds as u128 * rate;
        let frac = (self.nanoseconds as u128 * rate + NANOS_PER_SEC as u128 / 2)
            / NANOS_PER_SEC as u128;
        (whole.wrapping_add(frac) & 0xffff_ffff) as u32
    }

    pub fn from_data(data: &[u8]) -> Option<Self> {
        if data.len() < Self::WIRE_SIZE {
            return None;
        }
        Some(PtpTimestamp {
            seconds: read_u48_be(data),
            nanoseconds: read_u32_be(&data[6..]),
        })
    }

    pub fn write_to(&self, buf: &mut [u8]) {
        write_u48_be(buf, self.seconds);
        write_u32_be(&mut buf[6..], self.nanoseconds);
    }
}

impl fmt::Display for PtpTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.seconds, self.nanoseconds)
    }
}

const FRACTIONAL_SCALE: i64 = 0x10000;
const SCALED_NANOS_PER_SEC: i64 = NANOS_PER_SEC * FRACTIONAL_SCALE;

/// Signed fixed-point span of time with a 16-bit sub-nanosecond fraction.
/// On the wire this is a signed 64-bit count of nanoseconds scaled by 2^16
/// (IEEE 1588-2019 5.3.2). Internally the value is kept as seconds plus a
/// non-negative scaled-nanoseconds remainder so that arithmetic never loses
/// the fraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct TimeInterval {
    seconds: i64,
    scaled_nanos: i64,
}

impl TimeInterval {
    pub const ZERO: TimeInterval = TimeInterval {
        seconds: 0,
        scaled_nanos: 0,
    };

    pub fn new(seconds: i64, nanos: i32, fraction: u16) -> Self {
        let mut interval = TimeInterval {
            seconds,
            scaled_nanos: nanos as i64 * FRACTIONAL_SCALE + fraction as i64,
        };
        interval.normalize();
        interval
    }

    pub fn from_nanos(nanos: i64) -> Self {
        Self::from_total_nanos(nanos as i128)
    }

    pub(crate) fn from_total_nanos(nanos: i128) -> Self {
        Self::from_total_scaled(nanos * FRACTIONAL_SCALE as i128)
    }

    fn from_total_scaled(scaled: i128) -> Self {
        let seconds = scaled.div_euclid(SCALED_NANOS_PER_SEC as i128);
        let remainder = scaled.rem_euclid(SCALED_NANOS_PER_SEC as i128) as i64;
        let seconds = seconds.clamp(i64::MIN as i128, i64::MAX as i128) as i64;
        TimeInterval {
            seconds,
            scaled_nanos: remainder,
        }
    }

    pub fn seconds(&self) -> i64 {
        self.seconds
    }

    /// The nanoseconds part without the seconds or the fraction.
    pub fn nanos(&self) -> i64 {
        self.scaled_nanos / FRACTIONAL_SCALE
    }

    /// Total nanoseconds including the seconds part, fraction truncated.
    pub fn total_nanos(&self) -> i64 {
        self.seconds * NANOS_PER_SEC + self.nanos()
    }

    pub fn nanos_rounded(&self) -> i64 {
        if self.fraction() as i64 >= FRACTIONAL_SCALE / 2 {
            self.nanos() + 1
        } else {
            self.nanos()
        }
    }

    pub fn fraction(&self) -> u16 {
        (self.scaled_nanos % FRACTIONAL_SCALE) as u16
    }

    pub fn total_seconds_f64(&self) -> f64 {
        self.seconds as f64 + self.scaled_nanos as f64 / SCALED_NANOS_PER_SEC as f64
    }

    /// Decodes the wire representation: nanoseconds in the high 48 bits, the
    /// fraction in the low 16.
    pub fn from_wire(value: i64) -> Self {
        let mut nanos = value >> 16;
        let seconds = nanos / NANOS_PER_SEC;
        nanos -= seconds * NANOS_PER_SEC;
        TimeInterval::new(seconds, nanos as i32, (value & 0xffff) as u16)
    }

    /// Encodes to the wire representation, saturating to `i64::MIN`/`MAX`
    /// when the interval does not fit.
    pub fn to_wire(&self) -> i64 {
        match self
            .seconds
            .checked_mul(SCALED_NANOS_PER_SEC)
            .and_then(|scaled_seconds| scaled_seconds.checked_add(self.scaled_nanos))
        {
            Some(value) => value,
            None => {
                if self.seconds < 0 {
                    i64::MIN
                } else {
                    i64::MAX
                }
            }
        }
    }

    /// Converts a real-valued number of seconds to the wire representation,
    /// clamping out-of-range values.
    pub fn wire_from_seconds_f64(seconds: f64) -> i64 {
        let scaled = seconds * SCALED_NANOS_PER_SEC as f64;
        if scaled <= i64::MIN as f64 {
            i64::MIN
        } else if scaled >= i64::MAX as f64 {
            i64::MAX
        } else {
            scaled as i64
        }
    }

    fn total_scaled(&self) -> i128 {
        self.seconds as i128 * SCALED_NANOS_PER_SEC as i128 + self.scaled_nanos as i128
    }

    fn normalize(&mut self) {
        let carry = self.scaled_nanos.div_euclid(SCALED_NANOS_PER_SEC);
        self.scaled_nanos = self.scaled_nanos.rem_euclid(SCALED_NANOS_PER_SEC);
        self.seconds = self.seconds.saturating_add(carry);
    }
}

impl std::ops::Add for TimeInterval {
    type Output = TimeInterval;

    fn add(self, rhs: TimeInterval) -> TimeInterval {
        let mut r = TimeInterval {
            seconds: self.seconds.saturating_add(rhs.seconds),
            scaled_nanos: self.scaled_nanos + rhs.scaled_nanos,
        };
        r.normalize();
        r
    }
}

impl std::ops::Sub for TimeInterval {
    type Output = TimeInterval;

    fn sub(self, rhs: TimeInterval) -> TimeInterval {
        let mut r = TimeInterval {
            seconds: self.seconds.saturating_sub(rhs.seconds),
            scaled_nanos: self.scaled_nanos - rhs.scaled_nanos,
        };
        r.normalize();
        r
    }
}

impl std::ops::Mul<i64> for TimeInterval {
    type Output = TimeInterval;

    fn mul(self, rhs: i64) -> TimeInterval {
        TimeInterval::from_total_scaled(self.total_scaled() * rhs as i128)
    }
}

impl std::ops::Div<i64> for TimeInterval {
    type Output = TimeInterval;

    fn div(self, rhs: i64) -> TimeInterval {
        TimeInterval::from_total_scaled(self.total_scaled() / rhs as i128)
    }
}

/// IEEE 1588-2019 7.6.2.6, Table 5.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum ClockAccuracy {
    Lt1Ps = 0x17,
    Lt2_5Ps = 0x18,
    Lt10Ps = 0x19,
    Lt25Ps = 0x1a,
    Lt100Ps = 0x1b,
    Lt250Ps = 0x1c,
    Lt1Ns = 0x1d,
    Lt2_5Ns = 0x1e,
    Lt10Ns = 0x1f,
    Lt25Ns = 0x20,
    Lt100Ns = 0x21,
    Lt250Ns = 0x22,
    Lt1Us = 0x23,
    Lt2_5Us = 0x24,
    Lt10Us = 0x25,
    Lt25Us = 0x26,
    Lt100Us = 0x27,
    Lt250Us = 0x28,
    Lt1Ms = 0x29,
    Lt2_5Ms = 0x2a,
    Lt10Ms = 0x2b,
    Lt25Ms = 0x2c,
    Lt100Ms = 0x2d,
    Lt250Ms = 0x2e,
    Lt1S = 0x2f,
    Lt10S = 0x30,
    Gt10S = 0x31,
    Unknown = 0xfe,
    Reserved = 0xff,
}

impl ClockAccuracy {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x17 => ClockAccuracy::Lt1Ps,
            0x18 => ClockAccuracy::Lt2_5Ps,
            0x19 => ClockAccuracy::Lt10Ps,
            0x1a => ClockAccuracy::Lt25Ps,
            0x1b => ClockAccuracy::Lt100Ps,
            0x1c => ClockAccuracy::Lt250Ps,
            0x1d => ClockAccuracy::Lt1Ns,
            0x1e => ClockAccuracy::Lt2_5Ns,
            0x1f => ClockAccuracy::Lt10Ns,
            0x20 => ClockAccuracy::Lt25Ns,
            0x21 => ClockAccuracy::Lt100Ns,
            0x22 => ClockAccuracy::Lt250Ns,
            0x23 => ClockAccuracy::Lt1Us,
            0x24 => ClockAccuracy::Lt2_5Us,
            0x25 => ClockAccuracy::Lt10Us,
            0x26 => ClockAccuracy::Lt25Us,
            0x27 => ClockAccuracy::Lt100Us,
            0x28 => ClockAccuracy::Lt250Us,
            0x29 => ClockAccuracy::Lt1Ms,
            0x2a => ClockAccuracy::Lt2_5Ms,
            0x2b => ClockAccuracy::Lt10Ms,
            0x2c => ClockAccuracy::Lt25Ms,
            0x2d => ClockAccuracy::Lt100Ms,
            0x2e => ClockAccuracy::Lt250Ms,
            0x2f => ClockAccuracy::Lt1S,
            0x30 => ClockAccuracy::Lt10S,
            0x31 => ClockAccuracy::Gt10S,
            0xff => ClockAccuracy::Reserved,
            _ => ClockAccuracy::Unknown,
        }
    }
}

/// IEEE 1588-2019 7.6.2.8, Table 6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TimeSource {
    Undefined = 0x00,
    AtomicClock = 0x10,
    Gnss = 0x20,
    TerrestrialRadio = 0x30,
    SerialTimeCode = 0x39,
    Ptp = 0x40,
    Ntp = 0x50,
    HandSet = 0x60,
    Other = 0x90,
    InternalOscillator = 0xa0,
    Reserved = 0xff,
}

impl TimeSource {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x10 => TimeSource::AtomicClock,
            0x20 => TimeSource::Gnss,
            0x30 => TimeSource::TerrestrialRadio,
            0x39 => TimeSource::SerialTimeCode,
            0x40 => TimeSource::Ptp,
            0x50 => TimeSource::Ntp,
            0x60 => TimeSource::HandSet,
            0x90 => TimeSource::Other,
            0xa0 => TimeSource::InternalOscillator,
            0xff => TimeSource::Reserved,
            _ => TimeSource::Undefined,
        }
    }
}

pub const SLAVE_ONLY_CLOCK_CLASS: u8 = 255;
pub const DEFAULT_CLOCK_CLASS: u8 = 248;

/// IEEE 1588-2019 7.6.2.5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClockQuality {
    pub clock_class: u8,
    pub clock_accuracy: ClockAccuracy,
    pub offset_scaled_log_variance: u16,
}

impl Default for ClockQuality {
    fn default() -> Self {
        ClockQuality {
            clock_class: DEFAULT_CLOCK_CLASS,
            clock_accuracy: ClockAccuracy::Unknown,
            offset_scaled_log_variance: 0xffff,
        }
    }
}

impl ClockQuality {
    pub const WIRE_SIZE: usize = 4;

    pub fn from_data(data: &[u8]) -> Option<Self> {
        if data.len() < Self::WIRE_SIZE {
            return None;
        }
        Some(ClockQuality {
            clock_class: data[0],
            clock_accuracy: ClockAccuracy::from_u8(data[1]),
            offset_scaled_log_variance: read_u16_be(&data[2..]),
        })
    }

    pub fn write_to(&self, buf: &mut [u8]) {
        buf[0] = self.clock_class;
        buf[1] = self.clock_accuracy as u8;
        write_u16_be(&mut buf[2..], self.offset_scaled_log_variance);
    }
}

/// IEEE 1588-2019 8.2.15.3.1, Table 27.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PortState {
    #[default]
    Initializing,
    Faulty,
    Disabled,
    Listening,
    PreMaster,
    Master,
    Passive,
    Uncalibrated,
    Slave,
}

impl fmt::Display for PortState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PortState::Initializing => "initializing",
            PortState::Faulty => "faulty",
            PortState::Disabled => "disabled",
            PortState::Listening => "listening",
            PortState::PreMaster => "pre_master",
            PortState::Master => "master",
            PortState::Passive => "passive",
            PortState::Uncalibrated => "uncalibrated",
            PortState::Slave => "slave",
        };
        write!(f, "{name}")
    }
}

/// IEEE 1588-2019 8.2.15.4.4, Table 21.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum DelayMechanism {
    #[default]
    Undefined = 0x00,
    E2e = 0x01,
    P2p = 0x02,
    CommonPtp = 0x03,
    Special = 0x04,
    NoMechanism = 0xfe,
}
