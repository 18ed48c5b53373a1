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

use miette::IntoDiagnostic;
use thread_priority::{
    RealtimeThreadSchedulePolicy, ThreadPriority, ThreadSchedulePolicy,
    set_thread_priority_and_policy, thread_native_id,
};
use tracing::{info, warn};

pub const U16_WRAP: u32 = 65536;
pub const U32_WRAP: u64 = 4294967296;

/// A point on the 32-bit circle. Signed differences treat the half range as
/// the wrap-around threshold, so two RTP timestamps or extended sequence
/// numbers can be ordered across a wrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WrappingU32(pub u32);

impl WrappingU32 {
    /// Signed distance from `other` to `self`, i.e. `self - other` on the
    /// circle. The result is in `[-2^31, 2^31)`.
    pub fn diff(self, other: WrappingU32) -> i32 {
        self.0.wrapping_sub(other.0) as i32
    }
}

impl From<u32> for WrappingU32 {
    fn from(value: u32) -> Self {
        WrappingU32(value)
    }
}

/// Fixed-length window that yields the median of the most recent samples.
/// Used for the port data set's mean link delay, where a median rejects the
/// occasional queuing outlier better than an average.
pub struct SlidingMedian {
    buffer: Box<[i64]>,
    cursor: usize,
    filled: usize,
}

impl SlidingMedian {
    pub fn new(len: usize) -> Self {
        Self {
            buffer: vec![0; len.max(1)].into_boxed_slice(),
            cursor: 0,
            filled: 0,
        }
    }

    pub fn update(&mut self, value: i64) -> i64 {
        self.buffer[self.cursor] = value;
        self.cursor = (self.cursor + 1) % self.buffer.len();
        self.filled = (self.filled + 1).min(self.buffer.len());

        let mut window: Vec<i64> = if self.filled < self.buffer.len() {
            let start = self.cursor - self.filled;
            self.buffer[start..self.cursor].to_vec()
        } else {
            self.buffer.to_vec()
        };
        window.sort_unstable();
        window[window.len() / 2]
    }

    pub fn len(&self) -> usize {
        self.filled
    }

    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }
}

pub fn set_realtime_priority() {
    let pid = thread_native_id();
    if let Err(e) = set_thread_priority_and_policy(
        pid,
        ThreadPriority::Max,
        ThreadSchedulePolicy::Realtime(RealtimeThreadSchedulePolicy::Fifo),
    )
    .into_diagnostic()
    {
        warn!("Could not set thread priority: {:?}", e);
    } else {
        info!("Successfully set real time priority for thread {pid}.");
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn diff_is_inverse_of_add() {
        let cases = [
            (0u32, 0u32),
            (10, 3),
            (3, 10),
            (0xffff_fff0, 0x10),
            (0x10, 0xffff_fff0),
            (0x8000_0000, 0),
        ];
        for (a, b) in cases {
            let d = WrappingU32(a).diff(WrappingU32(b));
            assert_eq!(b.wrapping_add(d as u32), a, "diff({a:#x},{b:#x})");
        }
    }

    #[test]
    fn diff_wraps_at_half_range() {
        assert_eq!(WrappingU32(5).diff(WrappingU32(0xffff_fffe)), 7);
        assert_eq!(WrappingU32(0xffff_fffe).diff(WrappingU32(5)), -7);
        assert_eq!(WrappingU32(0).diff(WrappingU32(0x8000_0000)), i32::MIN);
    }

    #[test]
    fn sliding_median_settles_on_the_middle_value() {
        let mut median = SlidingMedian::new(5);
        for v in [100, 1, 100, 100, 5000] {
            median.update(v);
        }
        assert_eq!(median.update(100), 100);
    }

    #[test]
    fn sliding_median_with_partial_window() {
        let mut median = SlidingMedian::new(16);
        assert_eq!(median.update(7), 7);
        assert_eq!(median.update(9), 9);
        assert_eq!(median.update(8), 8);
    }
}
