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

//! Frame-addressed playout ring indexed by RTP timestamp.
//!
//! The network ingest task is the single writer, the audio callback the
//! single reader. A frame's bytes live at `rtp_timestamp % ring_frames`; a
//! per-frame slot tag records which timestamp the bytes belong to, so the
//! reader can tell written frames from stale or missing ones and fill the
//! gaps with the encoding's ground value. Sample bytes are published before
//! the slot tag with release ordering, the reader acquires the tag before
//! copying.
//!
//! The ring capacity is a power of two so that the timestamp-to-slot mapping
//! stays consistent across the 32-bit timestamp wrap.

use crate::{fifo::Position, formats::Frames, utils::WrappingU32};
use std::{
    cell::UnsafeCell,
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    },
};

const ANCHOR_HISTORY: usize = 64;

/// `(sequence, rtp_timestamp)` pair recorded at packet arrival, with the
/// host receive time for latency accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Anchor {
    pub sequence: u16,
    pub rtp_timestamp: u32,
    pub host_receive_ns: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Accepted { frames: usize },
    /// Packet timestamp outside the reorder window; counted, dropped.
    OutsideWindow,
    /// Payload length is not a whole number of frames.
    BadLength,
}

/// Result of a realtime read. `first_timestamp` is the RTP timestamp of the
/// first frame actually read, when any stream data backed the read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadResult {
    pub first_timestamp: Option<u32>,
    pub desync: bool,
    pub missing_frames: usize,
}

struct RingShared {
    frames: usize,
    bytes_per_frame: usize,
    ground_value: u8,
    data: UnsafeCell<Box<[u8]>>,
    /// Per ring frame: the owning RTP timestamp plus one, zero when the slot
    /// has never been written.
    slots: Box<[AtomicU64]>,
    producer_initialized: AtomicBool,
    /// Next frame the producer expects to write, i.e. the end of the highest
    /// contiguous write so far.
    producer_cursor: AtomicU32,
    /// Set by the reader on catastrophic desync; allows the writer to
    /// re-anchor onto a stream that jumped outside the reorder window.
    resync_requested: AtomicBool,
}

// Safety: bytes are only written by the single writer and only read by the
// single reader after acquiring the matching slot tag.
unsafe impl Sync for RingShared {}
unsafe impl Send for RingShared {}

/// Sizes the ring to cover the playout delay plus a jitter budget, rounded
/// up to a power of two.
pub fn ring_frames_for(delay_frames: usize, packet_time_frames: usize) -> usize {
    (2 * delay_frames + 8 * packet_time_frames.max(1)).next_power_of_two()
}

pub fn playout_ring(
    frames: usize,
    bytes_per_frame: usize,
    ground_value: u8,
) -> (RingWriter, RingReader) {
    assert!(frames.is_power_of_two(), "ring size must be a power of two");
    let shared = Arc::new(RingShared {
        frames,
        bytes_per_frame,
        ground_value,
        data: UnsafeCell::new(vec![ground_value; frames * bytes_per_frame].into_boxed_slice()),
        slots: (0..frames).map(|_| AtomicU64::new(0)).collect(),
        producer_initialized: AtomicBool::new(false),
        producer_cursor: AtomicU32::new(0),
        resync_requested: AtomicBool::new(false),
    });
    (
        RingWriter {
            shared: shared.clone(),
            anchors: VecDeque::with_capacity(ANCHOR_HISTORY),
        },
        RingReader {
            shared,
            cursor: None,
            pending_full_seek: false,
        },
    )
}

pub struct RingWriter {
    shared: Arc<RingShared>,
    anchors: VecDeque<Anchor>,
}

impl RingWriter {
    /// Copies one RTP payload into the ring at the slot addressed by its
    /// timestamp. Packets within half the ring of the producer cursor are
    /// accepted in place, out-of-order writes never rewind the cursor.
    pub fn write_packet(
        &mut self,
        sequence: u16,
        rtp_timestamp: u32,
        payload: &[u8],
        host_receive_ns: u64,
    ) -> WriteOutcome {
        let bpf = self.shared.bytes_per_frame;
        if payload.is_empty() || !payload.len().is_multiple_of(bpf) {
            return WriteOutcome::BadLength;
        }
        let frames_in_packet = payload.len() / bpf;
        if frames_in_packet > self.shared.frames {
            return WriteOutcome::BadLength;
        }

        let initialized = self.shared.producer_initialized.load(Ordering::Relaxed);
        if initialized {
            let cursor = WrappingU32(self.shared.producer_cursor.load(Ordering::Relaxed));
            let drift = WrappingU32(rtp_timestamp).diff(cursor);
            if drift.unsigned_abs() as usize > self.shared.frames / 2 {
                // The reader has declared a desync: accept the jump and
                // re-anchor instead of dropping.
                if self.shared.resync_requested.swap(false, Ordering::Relaxed) {
                    self.copy_in(rtp_timestamp, payload, frames_in_packet);
                    self.shared
                        .producer_cursor
                        .store(rtp_timestamp.wrapping_add(frames_in_packet as u32), Ordering::Release);
                    self.record_anchor(sequence, rtp_timestamp, host_receive_ns);
                    return WriteOutcome::Accepted {
                        frames: frames_in_packet,
                    };
                }
                return WriteOutcome::OutsideWindow;
            }
        }

        self.copy_in(rtp_timestamp, payload, frames_in_packet);

        let end = rtp_timestamp.wrapping_add(frames_in_packet as u32);
        if initialized {
            let cursor = WrappingU32(self.shared.producer_cursor.load(Ordering::Relaxed));
            // Out-of-order packets must not rewind the cursor.
            if WrappingU32(end).diff(cursor) > 0 {
                self.shared.producer_cursor.store(end, Ordering::Release);
            }
        } else {
            self.shared.producer_cursor.store(end, Ordering::Release);
            self.shared
                .producer_initialized
                .store(true, Ordering::Release);
        }

        self.record_anchor(sequence, rtp_timestamp, host_receive_ns);
        WriteOutcome::Accepted {
            frames: frames_in_packet,
        }
    }

    fn copy_in(&mut self, rtp_timestamp: u32, payload: &[u8], frames_in_packet: usize) {
        let bpf = self.shared.bytes_per_frame;
        let ring_frames = self.shared.frames;
        let frame_index = rtp_timestamp as usize & (ring_frames - 1);
        let byte_index = frame_index * bpf;

        // Safety: single writer; readers only touch these bytes after the
        // slot tags stored below become visible.
        let data = unsafe { &mut *self.shared.data.get() };
        let position = Position::new(byte_index, data.len(), payload.len());
        let (head, tail) = position.slices_mut(data);
        head.copy_from_slice(&payload[..head.len()]);
        tail.copy_from_slice(&payload[head.len()..]);

        for offset in 0..frames_in_packet {
            let ts = rtp_timestamp.wrapping_add(offset as u32);
            let slot = ts as usize & (ring_frames - 1);
            self.shared.slots[slot].store(ts as u64 + 1, Ordering::Release);
        }
    }

    fn record_anchor(&mut self, sequence: u16, rtp_timestamp: u32, host_receive_ns: u64) {
        if self.anchors.len() == ANCHOR_HISTORY {
            self.anchors.pop_front();
        }
        self.anchors.push_back(Anchor {
            sequence,
            rtp_timestamp,
            host_receive_ns,
        });
    }

    pub fn last_anchor(&self) -> Option<Anchor> {
        self.anchors.back().copied()
    }

    /// The producer cursor, once the first packet has been written.
    pub fn cursor(&self) -> Option<u32> {
        if self.shared.producer_initialized.load(Ordering::Relaxed) {
            Some(self.shared.producer_cursor.load(Ordering::Relaxed))
        } else {
            None
        }
    }
}

pub struct RingReader {
    shared: Arc<RingShared>,
    cursor: Option<u32>,
    pending_full_seek: bool,
}

impl RingReader {
    /// Fills `out` with `out.len() / bytes_per_frame` frames, aligned to
    /// `target_rtp_ts` when given. Never blocks and never allocates; frames
    /// the producer has not covered are filled with the ground value.
    pub fn read_realtime(&mut self, out: &mut [u8], target_rtp_ts: Option<u32>) -> ReadResult {
        let bpf = self.shared.bytes_per_frame;
        let frames_requested = out.len() / bpf;

        if !self.shared.producer_initialized.load(Ordering::Acquire) {
            out.fill(self.shared.ground_value);
            return ReadResult {
                first_timestamp: None,
                desync: false,
                missing_frames: frames_requested,
            };
        }

        let producer = self.shared.producer_cursor.load(Ordering::Acquire);
        let mut cursor = self
            .cursor
            .unwrap_or_else(|| producer.wrapping_sub(frames_requested as u32));

        if let Some(target) = target_rtp_ts {
            let drift = WrappingU32(target).diff(WrappingU32(cursor));
            if self.pending_full_seek {
                // Previous call flagged a desync: resync with a full seek.
                cursor = target;
                self.pending_full_seek = false;
            } else if drift.unsigned_abs() as usize <= frames_requested {
                // Small drift is absorbed by the buffer's own tolerance.
            } else if drift.unsigned_abs() as usize <= self.shared.frames / 2 {
                cursor = target;
            } else {
                out.fill(self.shared.ground_value);
                self.pending_full_seek = true;
                self.shared.resync_requested.store(true, Ordering::Relaxed);
                return ReadResult {
                    first_timestamp: None,
                    desync: true,
                    missing_frames: frames_requested,
                };
            }
        }

        let missing = self.copy_out(out, cursor, frames_requested);
        self.cursor = Some(cursor.wrapping_add(frames_requested as u32));

        ReadResult {
            first_timestamp: Some(cursor),
            desync: false,
            missing_frames: missing,
        }
    }

    fn copy_out(&self, out: &mut [u8], first_ts: u32, frames_requested: usize) -> usize {
        let bpf = self.shared.bytes_per_frame;
        let ring_frames = self.shared.frames;
        // Safety: the slot tag acquired per frame orders these reads after
        // the writer's byte stores.
        let data = unsafe { &*self.shared.data.get() };

        let mut missing = 0;
        for frame in 0..frames_requested {
            let ts = first_ts.wrapping_add(frame as u32);
            let slot = ts as usize & (ring_frames - 1);
            let out_bytes = &mut out[frame * bpf..(frame + 1) * bpf];

            if self.shared.slots[slot].load(Ordering::Acquire) == ts as u64 + 1 {
                let byte_index = slot * bpf;
                out_bytes.copy_from_slice(&data[byte_index..byte_index + bpf]);
            } else {
                out_bytes.fill(self.shared.ground_value);
                missing += 1;
            }
        }
        missing
    }

    /// Frames currently buffered ahead of the consumer cursor.
    pub fn frames_ahead(&self) -> Frames {
        if !self.shared.producer_initialized.load(Ordering::Acquire) {
            return 0;
        }
        let producer = self.shared.producer_cursor.load(Ordering::Acquire);
        match self.cursor {
            Some(cursor) => {
                let ahead = WrappingU32(producer).diff(WrappingU32(cursor));
                ahead.max(0) as Frames
            }
            None => 0,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn frame_bytes(ts: u32, bpf: usize) -> Vec<u8> {
        (0..bpf).map(|i| (ts as usize + i) as u8).collect()
    }

    fn packet(first_ts: u32, frames: usize, bpf: usize) -> Vec<u8> {
        let mut payload = Vec::with_capacity(frames * bpf);
        for f in 0..frames {
            payload.extend_from_slice(&frame_bytes(first_ts.wrapping_add(f as u32), bpf));
        }
        payload
    }

    #[test]
    fn in_order_packets_are_readable_at_their_timestamps() {
        let (mut writer, mut reader) = playout_ring(1024, 2, 0);
        for i in 0..4u32 {
            let ts = 1000 + i * 48;
            assert_eq!(
                writer.write_packet(i as u16, ts, &packet(ts, 48, 2), 0),
                WriteOutcome::Accepted { frames: 48 }
            );
        }

        let mut out = vec![0u8; 192 * 2];
        let result = reader.read_realtime(&mut out, Some(1000));
        assert_eq!(result.first_timestamp, Some(1000));
        assert!(!result.desync);
        assert_eq!(result.missing_frames, 0);
        for f in 0..192u32 {
            assert_eq!(
                &out[f as usize * 2..f as usize * 2 + 2],
                &frame_bytes(1000 + f, 2)[..],
                "frame {f}"
            );
        }
    }

    #[test]
    fn reorder_window_boundary() {
        let (mut writer, _reader) = playout_ring(1024, 2, 0);
        // Anchor the cursor at 10_000.
        writer.write_packet(0, 10_000 - 48, &packet(10_000 - 48, 48, 2), 0);
        assert_eq!(writer.cursor(), Some(10_000));

        // 500 frames behind: within +-512 of the cursor, accepted. Writing
        // behind the cursor does not advance it.
        assert_eq!(
            writer.write_packet(1, 10_000 - 500, &packet(10_000 - 500, 48, 2), 0),
            WriteOutcome::Accepted { frames: 48 }
        );
        assert_eq!(writer.cursor(), Some(10_000));

        // One frame beyond half the ring is dropped.
        assert_eq!(
            writer.write_packet(2, 10_000 + 513, &packet(10_000 + 513, 48, 2), 0),
            WriteOutcome::OutsideWindow
        );
        // Exactly half the ring away is still within budget.
        assert_eq!(
            writer.write_packet(3, 10_000 + 512, &packet(10_000 + 512, 48, 2), 0),
            WriteOutcome::Accepted { frames: 48 }
        );
    }

    #[test]
    fn out_of_order_write_does_not_rewind_cursor() {
        let (mut writer, _reader) = playout_ring(1024, 2, 0);
        writer.write_packet(0, 2000, &packet(2000, 48, 2), 0);
        let cursor = writer.cursor();
        writer.write_packet(1, 1904, &packet(1904, 48, 2), 0);
        assert_eq!(writer.cursor(), cursor);
    }

    #[test]
    fn missing_frames_are_ground_filled() {
        let (mut writer, mut reader) = playout_ring(1024, 1, 0x80);
        writer.write_packet(0, 100, &packet(100, 8, 1), 0);
        // Leave a hole at 108..116, then write 116..124.
        writer.write_packet(2, 116, &packet(116, 8, 1), 0);

        let mut out = vec![0u8; 24];
        let result = reader.read_realtime(&mut out, Some(100));
        assert_eq!(result.missing_frames, 8);
        assert_eq!(&out[8..16], &[0x80; 8]);
        assert_eq!(out[0], 100u32 as u8);
        assert_eq!(out[16], 116u32 as u8);
    }

    #[test]
    fn small_drift_is_absorbed_without_seeking() {
        let (mut writer, mut reader) = playout_ring(1024, 1, 0);
        writer.write_packet(0, 0, &packet(0, 512, 1), 0);

        let mut out = vec![0u8; 64];
        let first = reader.read_realtime(&mut out, Some(100));
        assert_eq!(first.first_timestamp, Some(100));

        // Cursor is now 164; a target within +-64 frames reads in place.
        let second = reader.read_realtime(&mut out, Some(170));
        assert_eq!(second.first_timestamp, Some(164));

        // Beyond the block size but inside half the ring: seek.
        let third = reader.read_realtime(&mut out, Some(400));
        assert_eq!(third.first_timestamp, Some(400));
    }

    #[test]
    fn catastrophic_desync_grounds_and_recovers() {
        let (mut writer, mut reader) = playout_ring(1024, 1, 0x80);
        writer.write_packet(0, 0, &packet(0, 48, 1), 0);

        let target = 1u32 << 20;
        let mut out = vec![0u8; 256];
        let result = reader.read_realtime(&mut out, Some(target));
        assert!(result.desync);
        assert_eq!(result.first_timestamp, None);
        assert!(out.iter().all(|b| *b == 0x80));

        // The stream jumped: the writer re-anchors because the reader
        // requested a resync.
        assert_eq!(
            writer.write_packet(1, target, &packet(target, 256, 1), 0),
            WriteOutcome::Accepted { frames: 256 }
        );

        let result = reader.read_realtime(&mut out, Some(target));
        assert!(!result.desync);
        assert_eq!(result.first_timestamp, Some(target));
        assert_eq!(result.missing_frames, 0);
        assert_eq!(out[0], target as u8);
    }

    #[test]
    fn read_without_target_follows_consumer_cursor() {
        let (mut writer, mut reader) = playout_ring(256, 1, 0);
        writer.write_packet(0, 64, &packet(64, 128, 1), 0);

        let mut out = vec![0u8; 32];
        let first = reader.read_realtime(&mut out, None);
        // Uninitialized consumer starts one block behind the producer.
        assert_eq!(first.first_timestamp, Some(192 - 32));
        let second = reader.read_realtime(&mut out, None);
        assert_eq!(second.first_timestamp, Some(192));
    }

    #[test]
    fn ring_wrap_keeps_frame_addressing() {
        let (mut writer, mut reader) = playout_ring(64, 2, 0);
        let near_wrap = u32::MAX - 16;
        writer.write_packet(0, near_wrap, &packet(near_wrap, 32, 2), 0);

        let mut out = vec![0u8; 32 * 2];
        let result = reader.read_realtime(&mut out, Some(near_wrap));
        assert_eq!(result.missing_frames, 0);
        for f in 0..32u32 {
            let ts = near_wrap.wrapping_add(f);
            assert_eq!(
                &out[f as usize * 2..f as usize * 2 + 2],
                &frame_bytes(ts, 2)[..],
                "frame {f}"
            );
        }
    }

    #[test]
    fn ring_sizing_is_a_power_of_two() {
        assert!(ring_frames_for(240, 48).is_power_of_two());
        assert!(ring_frames_for(240, 48) >= 240 + 48);
        assert_eq!(ring_frames_for(240, 48), 1024);
    }
}
