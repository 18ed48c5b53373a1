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

//! One outstanding delay measurement: the Sync/Follow_Up and
//! Delay_Req/Delay_Resp exchange that yields the four timestamps t1..t4
//! (IEEE 1588-2019 11.3). The four timestamps are only ever observed in
//! increasing state order.

use crate::ptp::{
    messages::{DelayRespMessage, FollowUpMessage, SyncMessage},
    types::{PortIdentity, PtpTimestamp, TimeInterval},
};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceState {
    AwaitingFollowUp,
    ReadyToBeScheduled,
    DelayReqSendScheduled,
    AwaitingDelayResp,
    DelayRespReceived,
}

/// State machine for a single delay measurement. Constructed from a received
/// Sync; in two-step mode t1 arrives later in the matching Follow_Up.
#[derive(Debug, Clone)]
pub struct DelaySequence {
    state: SequenceState,
    /// Identity and sequence id of the Sync that started this measurement.
    pub sync_source: PortIdentity,
    pub sync_sequence_id: u16,
    /// Sequence id of our Delay_Req, assigned when the send is scheduled.
    pub delay_req_sequence_id: Option<u16>,
    pub created_at: Instant,
    t1: Option<PtpTimestamp>,
    t2: PtpTimestamp,
    t3: Option<PtpTimestamp>,
    t4: Option<PtpTimestamp>,
}

impl DelaySequence {
    /// Starts a measurement from a Sync. `receive_timestamp` is t2, the
    /// slave's reception time of the Sync.
    pub fn new(sync: &SyncMessage, receive_timestamp: PtpTimestamp, now: Instant) -> Self {
        let two_step = sync.two_step();
        DelaySequence {
            state: if two_step {
                SequenceState::AwaitingFollowUp
            } else {
                SequenceState::ReadyToBeScheduled
            },
            sync_source: sync.header.source_port_identity,
            sync_sequence_id: sync.header.sequence_id,
            delay_req_sequence_id: None,
            created_at: now,
            t1: if two_step {
                None
            } else {
                Some(sync.origin_timestamp)
            },
            t2: receive_timestamp,
            t3: None,
            t4: None,
        }
    }

    pub fn state(&self) -> SequenceState {
        self.state
    }

    /// True if `follow_up` carries the precise origin timestamp for this
    /// measurement's Sync.
    pub fn matches_follow_up(&self, follow_up: &FollowUpMessage) -> bool {
        follow_up.header.source_port_identity == self.sync_source
            && follow_up.header.sequence_id == self.sync_sequence_id
    }

    /// Takes t1 from a Follow_Up. Duplicates are tolerated, the last one
    /// wins and the state advances idempotently.
    pub fn update_follow_up(&mut self, follow_up: &FollowUpMessage) {
        if !matches!(
            self.state,
            SequenceState::AwaitingFollowUp | SequenceState::ReadyToBeScheduled
        ) {
            return;
        }
        self.t1 = Some(follow_up.precise_origin_timestamp);
        self.state = SequenceState::ReadyToBeScheduled;
    }

    pub fn schedule_delay_req(&mut self, sequence_id: u16) {
        debug_assert_eq!(self.state, SequenceState::ReadyToBeScheduled);
        self.delay_req_sequence_id = Some(sequence_id);
        self.state = SequenceState::DelayReqSendScheduled;
    }

    /// Records t3, the send time of our Delay_Req.
    pub fn mark_delay_req_sent(&mut self, send_timestamp: PtpTimestamp) {
        debug_assert_eq!(self.state, SequenceState::DelayReqSendScheduled);
        self.t3 = Some(send_timestamp);
        self.state = SequenceState::AwaitingDelayResp;
    }

    /// True if `resp` answers this measurement's Delay_Req sent by `us`.
    pub fn matches_delay_resp(&self, resp: &DelayRespMessage, us: &PortIdentity) -> bool {
        self.delay_req_sequence_id == Some(resp.header.sequence_id)
            && resp.requesting_port_identity == *us
    }

    /// Takes t4 from a Delay_Resp.
    pub fn update_delay_resp(&mut self, resp: &DelayRespMessage) {
        debug_assert_eq!(self.state, SequenceState::AwaitingDelayResp);
        self.t4 = Some(resp.receive_timestamp);
        self.state = SequenceState::DelayRespReceived;
    }

    /// Mean one-way path delay: `((t2 - t1) + (t4 - t3)) / 2`. Only complete
    /// once the Delay_Resp has arrived.
    pub fn mean_path_delay(&self) -> Option<TimeInterval> {
        let (t1, t3, t4) = (self.t1?, self.t3?, self.t4?);
        Some((self.t2.diff(&t1) + t4.diff(&t3)) / 2)
    }

    /// Offset of the slave from the master: `(t2 - t1) - mean_path_delay`.
    pub fn offset_from_master(&self) -> Option<TimeInterval> {
        let delay = self.mean_path_delay()?;
        Some(self.t2.diff(&self.t1?) - delay)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ptp::{
        messages::{MessageHeader, MessageType},
        types::ClockIdentity,
    };

    fn master() -> PortIdentity {
        PortIdentity::new(ClockIdentity([0xaa; 8]), 1)
    }

    fn slave() -> PortIdentity {
        PortIdentity::new(ClockIdentity([0xbb; 8]), 1)
    }

    fn sync(two_step: bool, sequence_id: u16) -> SyncMessage {
        let mut header = MessageHeader::new(MessageType::Sync, master(), sequence_id);
        header.flags.two_step = two_step;
        SyncMessage {
            header,
            origin_timestamp: PtpTimestamp::new(10, 0),
        }
    }

    #[test]
    fn two_step_sequence_walks_all_states() {
        let t1 = PtpTimestamp::new(10, 0);
        let t2 = PtpTimestamp::new(11, 0);
        let t3 = PtpTimestamp::new(12, 0);
        let t4 = PtpTimestamp::new(14, 0);

        let mut seq = DelaySequence::new(&sync(true, 5), t2, Instant::now());
        assert_eq!(seq.state(), SequenceState::AwaitingFollowUp);

        let follow_up = FollowUpMessage {
            header: MessageHeader::new(MessageType::FollowUp, master(), 5),
            precise_origin_timestamp: t1,
        };
        assert!(seq.matches_follow_up(&follow_up));
        seq.update_follow_up(&follow_up);
        assert_eq!(seq.state(), SequenceState::ReadyToBeScheduled);

        seq.schedule_delay_req(1);
        assert_eq!(seq.state(), SequenceState::DelayReqSendScheduled);

        seq.mark_delay_req_sent(t3);
        assert_eq!(seq.state(), SequenceState::AwaitingDelayResp);

        let resp = DelayRespMessage {
            header: MessageHeader::new(MessageType::DelayResp, master(), 1),
            receive_timestamp: t4,
            requesting_port_identity: slave(),
        };
        assert!(seq.matches_delay_resp(&resp, &slave()));
        seq.update_delay_resp(&resp);
        assert_eq!(seq.state(), SequenceState::DelayRespReceived);

        let delay = seq.mean_path_delay().expect("complete sequence");
        assert!((delay.total_seconds_f64() - 1.5).abs() < 1e-12);
    }

    #[test]
    fn one_step_sequence_skips_follow_up() {
        let seq = DelaySequence::new(&sync(false, 9), PtpTimestamp::new(11, 0), Instant::now());
        assert_eq!(seq.state(), SequenceState::ReadyToBeScheduled);
    }

    #[test]
    fn duplicate_follow_up_is_idempotent() {
        let mut seq = DelaySequence::new(&sync(true, 5), PtpTimestamp::new(11, 0), Instant::now());
        let follow_up = FollowUpMessage {
            header: MessageHeader::new(MessageType::FollowUp, master(), 5),
            precise_origin_timestamp: PtpTimestamp::new(10, 100),
        };
        seq.update_follow_up(&follow_up);
        let later = FollowUpMessage {
            precise_origin_timestamp: PtpTimestamp::new(10, 200),
            ..follow_up
        };
        seq.update_follow_up(&later);
        assert_eq!(seq.state(), SequenceState::ReadyToBeScheduled);
    }

    #[test]
    fn offset_from_master_example() {
        let mut seq = DelaySequence::new(&sync(true, 5), PtpTimestamp::new(0, 1_000_000), Instant::now());
        seq.update_follow_up(&FollowUpMessage {
            header: MessageHeader::new(MessageType::FollowUp, master(), 5),
            precise_origin_timestamp: PtpTimestamp::new(0, 900_000),
        });
        seq.schedule_delay_req(1);
        seq.mark_delay_req_sent(PtpTimestamp::new(0, 2_000_000));
        seq.update_delay_resp(&DelayRespMessage {
            header: MessageHeader::new(MessageType::DelayResp, master(), 1),
            receive_timestamp: PtpTimestamp::new(0, 2_200_000),
            requesting_port_identity: slave(),
        });

        assert_eq!(
            seq.mean_path_delay().expect("complete").total_nanos(),
            150_000
        );
        assert_eq!(
            seq.offset_from_master().expect("complete").total_nanos(),
            -50_000
        );
    }

    #[test]
    fn mismatched_delay_resp_is_rejected() {
        let mut seq = DelaySequence::new(&sync(false, 5), PtpTimestamp::new(11, 0), Instant::now());
        seq.schedule_delay_req(7);
        seq.mark_delay_req_sent(PtpTimestamp::new(12, 0));

        let wrong_seq = DelayRespMessage {
            header: MessageHeader::new(MessageType::DelayResp, master(), 8),
            receive_timestamp: PtpTimestamp::new(14, 0),
            requesting_port_identity: slave(),
        };
        assert!(!seq.matches_delay_resp(&wrong_seq, &slave()));

        let wrong_port = DelayRespMessage {
            header: MessageHeader::new(MessageType::DelayResp, master(), 7),
            receive_timestamp: PtpTimestamp::new(14, 0),
            requesting_port_identity: master(),
        };
        assert!(!seq.matches_delay_resp(&wrong_port, &slave()));
    }
}
