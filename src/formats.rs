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

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::{str::FromStr, time::Duration};

pub type MilliSeconds = f32;
pub type Frames = u64;
pub type FramesPerSecond = usize;

/// Byte order of the samples in a buffer. RTP payloads are always big-endian;
/// host audio APIs usually want little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum ByteOrder {
    Be,
    Le,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum ChannelOrdering {
    Interleaved,
    NonInterleaved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum SampleEncoding {
    PcmU8,
    PcmS8,
    PcmS16,
    PcmS24,
    PcmS32,
    PcmF32,
    PcmF64,
}

impl SampleEncoding {
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            SampleEncoding::PcmU8 | SampleEncoding::PcmS8 => 1,
            SampleEncoding::PcmS16 => 2,
            SampleEncoding::PcmS24 => 3,
            SampleEncoding::PcmS32 | SampleEncoding::PcmF32 => 4,
            SampleEncoding::PcmF64 => 8,
        }
    }

    /// The byte value of digital silence for this encoding. Unsigned 8 bit
    /// audio idles at mid-scale, everything else at zero.
    pub fn ground_value(&self) -> u8 {
        match self {
            SampleEncoding::PcmU8 => 0x80,
            _ => 0,
        }
    }
}

impl FromStr for SampleEncoding {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "L16" => Ok(SampleEncoding::PcmS16),
            "L24" => Ok(SampleEncoding::PcmS24),
            "L32" => Ok(SampleEncoding::PcmS32),
            other => Err(ConfigError::UnsupportedEncoding(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct AudioFormat {
    pub byte_order: ByteOrder,
    pub encoding: SampleEncoding,
    pub ordering: ChannelOrdering,
    pub sample_rate: FramesPerSecond,
    pub num_channels: usize,
}

impl AudioFormat {
    pub fn bytes_per_sample(&self) -> usize {
        self.encoding.bytes_per_sample()
    }

    pub fn bytes_per_frame(&self) -> usize {
        self.num_channels * self.bytes_per_sample()
    }

    pub fn ground_value(&self) -> u8 {
        self.encoding.ground_value()
    }

    pub fn is_valid(&self) -> bool {
        self.sample_rate > 0 && self.num_channels > 0
    }
}

/// Swaps the byte order of every sample in `buf` in place. A no-op for single
/// byte samples. `buf` must hold a whole number of samples.
pub fn swap_bytes(buf: &mut [u8], bytes_per_sample: usize) {
    match bytes_per_sample {
        1 => (),
        2 => {
            for sample in buf.chunks_exact_mut(2) {
                sample.swap(0, 1);
            }
        }
        3 => {
            for sample in buf.chunks_exact_mut(3) {
                sample.swap(0, 2);
            }
        }
        4 => {
            for sample in buf.chunks_exact_mut(4) {
                sample.swap(0, 3);
                sample.swap(1, 2);
            }
        }
        8 => {
            for sample in buf.chunks_exact_mut(8) {
                sample.reverse();
            }
        }
        other => panic!("unsupported sample width: {other}"),
    }
}

pub fn frames_per_packet(sample_rate: FramesPerSecond, packet_time: MilliSeconds) -> usize {
    ((sample_rate as f32 * packet_time) / 1000.0).round() as usize
}

pub fn bytes_per_frame(channels: usize, encoding: SampleEncoding) -> usize {
    channels * encoding.bytes_per_sample()
}

pub fn duration_to_frames(duration: Duration, sample_rate: FramesPerSecond) -> Frames {
    (duration.as_nanos() * sample_rate as u128 / 1_000_000_000) as Frames
}

pub fn frames_to_duration(frames: Frames, sample_rate: FramesPerSecond) -> Duration {
    Duration::from_nanos((frames as u128 * 1_000_000_000 / sample_rate as u128) as u64)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn frames_per_packet_works() {
        assert_eq!(48, frames_per_packet(48_000, 1.0));
        assert_eq!(6, frames_per_packet(48_000, 0.125));
        assert_eq!(96, frames_per_packet(96_000, 1.0));
    }

    #[test]
    fn ground_values() {
        assert_eq!(0x80, SampleEncoding::PcmU8.ground_value());
        assert_eq!(0, SampleEncoding::PcmS16.ground_value());
        assert_eq!(0, SampleEncoding::PcmS24.ground_value());
        assert_eq!(0, SampleEncoding::PcmF64.ground_value());
    }

    #[test]
    fn swap_is_an_involution() {
        for (width, data) in [
            (2usize, vec![1u8, 2, 3, 4]),
            (3, vec![1, 2, 3, 4, 5, 6]),
            (4, vec![1, 2, 3, 4, 5, 6, 7, 8]),
            (8, vec![1, 2, 3, 4, 5, 6, 7, 8]),
        ] {
            let mut buf = data.clone();
            swap_bytes(&mut buf, width);
            swap_bytes(&mut buf, width);
            assert_eq!(buf, data, "width {width}");
        }
    }

    #[test]
    fn swap_of_24_bit_samples_reverses_each_triplet() {
        let mut buf = vec![1u8, 2, 3, 4, 5, 6];
        swap_bytes(&mut buf, 3);
        assert_eq!(buf, [3, 2, 1, 6, 5, 4]);
    }

    #[test]
    fn rtpmap_encodings_parse() {
        assert_eq!(
            SampleEncoding::PcmS16,
            "L16".parse::<SampleEncoding>().expect("known encoding")
        );
        assert_eq!(
            SampleEncoding::PcmS24,
            "L24".parse::<SampleEncoding>().expect("known encoding")
        );
        assert!("L20".parse::<SampleEncoding>().is_err());
    }
}
