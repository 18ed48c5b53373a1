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

//! Best master clock algorithm (IEEE 1588-2019 9.3): the data set comparison
//! and the foreign master tracking that feeds it.

use crate::ptp::{
    datasets::DefaultDs,
    messages::AnnounceMessage,
    types::{ClockIdentity, ClockQuality, PortIdentity},
};
use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

/// Outcome of comparing data set A (`self`) against data set B (`other`),
/// IEEE 1588-2019 Figure 33/34.
///
/// `Error1` signals identical-looking advertisements from the same sender,
/// `Error2` a message of our own looping back on the same port. Both are
/// surfaced so the engine can flag a topology fault instead of silently
/// dropping the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Better,
    BetterByTopology,
    Error1,
    Error2,
    WorseByTopology,
    Worse,
}

impl Comparison {
    pub fn is_better(&self) -> bool {
        matches!(self, Comparison::Better | Comparison::BetterByTopology)
    }
}

/// IEEE 1588-2019 9.3.4, Table 29.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComparisonDataSet {
    pub grandmaster_priority1: u8,
    pub grandmaster_identity: ClockIdentity,
    pub grandmaster_clock_quality: ClockQuality,
    pub grandmaster_priority2: u8,
    pub steps_removed: u16,
    pub identity_of_senders: ClockIdentity,
    pub identity_of_receiver: PortIdentity,
}

impl ComparisonDataSet {
    pub fn from_announce(announce: &AnnounceMessage, receiver_identity: PortIdentity) -> Self {
        ComparisonDataSet {
            grandmaster_priority1: announce.grandmaster_priority1,
            grandmaster_identity: announce.grandmaster_identity,
            grandmaster_clock_quality: announce.grandmaster_clock_quality,
            grandmaster_priority2: announce.grandmaster_priority2,
            steps_removed: announce.steps_removed,
            identity_of_senders: announce.header.source_port_identity.clock_identity,
            identity_of_receiver: receiver_identity,
        }
    }

    pub fn from_default_ds(default_ds: &DefaultDs) -> Self {
        ComparisonDataSet {
            grandmaster_priority1: default_ds.priority1,
            grandmaster_identity: default_ds.clock_identity,
            grandmaster_clock_quality: default_ds.clock_quality,
            grandmaster_priority2: default_ds.priority2,
            steps_removed: 0,
            identity_of_senders: default_ds.clock_identity,
            identity_of_receiver: PortIdentity::new(default_ds.clock_identity, 0),
        }
    }

    /// Compares this data set against `other`. The relation is a strict total
    /// order whenever the grandmaster identities differ; with the same
    /// grandmaster the topology branch decides, with `Error1`/`Error2`
    /// reserved for advertisement collisions.
    pub fn compare(&self, other: &ComparisonDataSet) -> Comparison {
        if self.grandmaster_identity == other.grandmaster_identity {
            // Same grandmaster: decide by position in the topology.

            if self.steps_removed > other.steps_removed + 1 {
                return Comparison::Worse;
            }

            if self.steps_removed + 1 < other.steps_removed {
                return Comparison::Better;
            }

            if self.steps_removed > other.steps_removed {
                if self.identity_of_receiver.clock_identity < self.identity_of_senders {
                    return Comparison::Worse;
                }
                if self.identity_of_receiver.clock_identity > self.identity_of_senders {
                    return Comparison::WorseByTopology;
                }
                return Comparison::Error1;
            }

            if self.steps_removed < other.steps_removed {
                if other.identity_of_receiver.clock_identity < other.identity_of_senders {
                    return Comparison::Better;
                }
                if other.identity_of_receiver.clock_identity > other.identity_of_senders {
                    return Comparison::BetterByTopology;
                }
                return Comparison::Error1;
            }

            if self.identity_of_senders > other.identity_of_senders {
                return Comparison::WorseByTopology;
            }

            if self.identity_of_senders < other.identity_of_senders {
                return Comparison::BetterByTopology;
            }

            if self.identity_of_receiver.port_number > other.identity_of_receiver.port_number {
                return Comparison::WorseByTopology;
            }

            if self.identity_of_receiver.port_number < other.identity_of_receiver.port_number {
                return Comparison::BetterByTopology;
            }

            return Comparison::Error2;
        }

        if self.grandmaster_priority1 < other.grandmaster_priority1 {
            return Comparison::Better;
        }
        if self.grandmaster_priority1 > other.grandmaster_priority1 {
            return Comparison::Worse;
        }

        if self.grandmaster_clock_quality.clock_class < other.grandmaster_clock_quality.clock_class
        {
            return Comparison::Better;
        }
        if self.grandmaster_clock_quality.clock_class > other.grandmaster_clock_quality.clock_class
        {
            return Comparison::Worse;
        }

        if self.grandmaster_clock_quality.clock_accuracy
            < other.grandmaster_clock_quality.clock_accuracy
        {
            return Comparison::Better;
        }
        if self.grandmaster_clock_quality.clock_accuracy
            > other.grandmaster_clock_quality.clock_accuracy
        {
            return Comparison::Worse;
        }

        if self.grandmaster_clock_quality.offset_scaled_log_variance
            < other.grandmaster_clock_quality.offset_scaled_log_variance
        {
            return Comparison::Better;
        }
        if self.grandmaster_clock_quality.offset_scaled_log_variance
            > other.grandmaster_clock_quality.offset_scaled_log_variance
        {
            return Comparison::Worse;
        }

        if self.grandmaster_priority2 < other.grandmaster_priority2 {
            return Comparison::Better;
        }
        if self.grandmaster_priority2 > other.grandmaster_priority2 {
            return Comparison::Worse;
        }

        // IEEE 1588-2019 7.5.2.4: ordering of clockIdentity values breaks the
        // remaining tie; identities are known to differ here.
        if self.grandmaster_identity > other.grandmaster_identity {
            return Comparison::Better;
        }
        Comparison::Worse
    }
}

/// A remote master observed through its Announce messages. Qualification
/// requires at least `FOREIGN_MASTER_THRESHOLD` messages within the
/// announce-receipt window (IEEE 1588-2019 9.3.2.4.4).
#[derive(Debug)]
pub struct ForeignMaster {
    pub announce: AnnounceMessage,
    arrivals: Vec<Instant>,
}

pub const FOREIGN_MASTER_THRESHOLD: usize = 2;

/// Per-port table of foreign masters keyed by the sender's port identity.
#[derive(Debug, Default)]
pub struct ForeignMasterTable {
    masters: HashMap<PortIdentity, ForeignMaster>,
}

impl ForeignMasterTable {
    pub fn new() -> Self {
        ForeignMasterTable::default()
    }

    /// Records an Announce arrival, keeping only arrivals inside `window`.
    pub fn record(&mut self, announce: AnnounceMessage, now: Instant, window: Duration) {
        let entry = self
            .masters
            .entry(announce.header.source_port_identity)
            .or_insert_with(|| ForeignMaster {
                announce,
                arrivals: Vec::new(),
            });
        entry.announce = announce;
        entry.arrivals.push(now);
        entry
            .arrivals
            .retain(|arrival| now.duration_since(*arrival) <= window);
    }

    /// Drops masters that have not announced within `window`.
    pub fn evict_stale(&mut self, now: Instant, window: Duration) {
        self.masters.retain(|_, master| {
            master
                .arrivals
                .last()
                .is_some_and(|last| now.duration_since(*last) <= window)
        });
    }

    pub fn remove(&mut self, source: &PortIdentity) {
        self.masters.remove(source);
    }

    pub fn is_empty(&self) -> bool {
        self.masters.is_empty()
    }

    /// Selects E_best: the best announce among qualified foreign masters, or
    /// `None` if no master is qualified. Comparison collisions are reported
    /// through `on_error` so the engine can flag them.
    pub fn best(
        &self,
        receiver_identity: PortIdentity,
        mut on_error: impl FnMut(Comparison, &PortIdentity),
    ) -> Option<&AnnounceMessage> {
        let mut best: Option<(&PortIdentity, &ForeignMaster)> = None;

        for (source, master) in &self.masters {
            if master.arrivals.len() < FOREIGN_MASTER_THRESHOLD {
                continue;
            }
            match best {
                None => best = Some((source, master)),
                Some((_, incumbent)) => {
                    let challenger =
                        ComparisonDataSet::from_announce(&master.announce, receiver_identity);
                    let reigning =
                        ComparisonDataSet::from_announce(&incumbent.announce, receiver_identity);
                    match challenger.compare(&reigning) {
                        Comparison::Better | Comparison::BetterByTopology => {
                            best = Some((source, master));
                        }
                        error @ (Comparison::Error1 | Comparison::Error2) => {
                            on_error(error, source);
                        }
                        Comparison::Worse | Comparison::WorseByTopology => (),
                    }
                }
            }
        }

        best.map(|(_, master)| &master.announce)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ptp::{
        messages::{MessageHeader, MessageType},
        types::ClockAccuracy,
    };

    fn announce(
        sender: ClockIdentity,
        gm: ClockIdentity,
        clock_class: u8,
        steps_removed: u16,
    ) -> AnnounceMessage {
        AnnounceMessage {
            header: MessageHeader::new(
                MessageType::Announce,
                PortIdentity::new(sender, 1),
                1,
            ),
            origin_timestamp: Default::default(),
            current_utc_offset: 37,
            grandmaster_priority1: 128,
            grandmaster_clock_quality: ClockQuality {
                clock_class,
                clock_accuracy: ClockAccuracy::Lt25Ns,
                offset_scaled_log_variance: 0x8000,
            },
            grandmaster_priority2: 128,
            grandmaster_identity: gm,
            steps_removed,
            time_source: crate::ptp::types::TimeSource::Gnss,
        }
    }

    fn receiver() -> PortIdentity {
        PortIdentity::new(ClockIdentity([0x10; 8]), 1)
    }

    #[test]
    fn lower_clock_class_wins() {
        let a = ComparisonDataSet::from_announce(
            &announce(ClockIdentity([1; 8]), ClockIdentity([0xaa; 8]), 6, 0),
            receiver(),
        );
        let b = ComparisonDataSet::from_announce(
            &announce(ClockIdentity([2; 8]), ClockIdentity([0xbb; 8]), 7, 0),
            receiver(),
        );
        assert_eq!(a.compare(&b), Comparison::Better);
        assert_eq!(b.compare(&a), Comparison::Worse);
    }

    #[test]
    fn identity_breaks_full_tie() {
        let a = ComparisonDataSet::from_announce(
            &announce(ClockIdentity([1; 8]), ClockIdentity([0xaa; 8]), 6, 0),
            receiver(),
        );
        let b = ComparisonDataSet::from_announce(
            &announce(ClockIdentity([2; 8]), ClockIdentity([0xab; 8]), 6, 0),
            receiver(),
        );
        // All priority and quality fields equal: the identity bytes decide,
        // and the result is strict in both directions.
        assert_eq!(b.compare(&a), Comparison::Better);
        assert_eq!(a.compare(&b), Comparison::Worse);
    }

    #[test]
    fn same_grandmaster_compares_steps_removed_with_tolerance() {
        let gm = ClockIdentity([0xaa; 8]);
        let near = ComparisonDataSet::from_announce(
            &announce(ClockIdentity([1; 8]), gm, 6, 0),
            receiver(),
        );
        let far = ComparisonDataSet::from_announce(
            &announce(ClockIdentity([2; 8]), gm, 6, 2),
            receiver(),
        );
        assert_eq!(near.compare(&far), Comparison::Better);
        assert_eq!(far.compare(&near), Comparison::Worse);
    }

    #[test]
    fn same_grandmaster_same_steps_breaks_on_sender_identity() {
        let gm = ClockIdentity([0xaa; 8]);
        let low = ComparisonDataSet::from_announce(
            &announce(ClockIdentity([1; 8]), gm, 6, 1),
            receiver(),
        );
        let high = ComparisonDataSet::from_announce(
            &announce(ClockIdentity([2; 8]), gm, 6, 1),
            receiver(),
        );
        assert_eq!(low.compare(&high), Comparison::BetterByTopology);
        assert_eq!(high.compare(&low), Comparison::WorseByTopology);
    }

    #[test]
    fn duplicate_advertisement_is_error2() {
        let gm = ClockIdentity([0xaa; 8]);
        let a = ComparisonDataSet::from_announce(
            &announce(ClockIdentity([1; 8]), gm, 6, 1),
            receiver(),
        );
        assert_eq!(a.compare(&a), Comparison::Error2);
    }

    #[test]
    fn foreign_master_qualifies_after_two_announces() {
        let mut table = ForeignMasterTable::new();
        let now = Instant::now();
        let window = Duration::from_secs(6);
        let message = announce(ClockIdentity([1; 8]), ClockIdentity([0xaa; 8]), 6, 0);

        table.record(message, now, window);
        assert!(table.best(receiver(), |_, _| ()).is_none());

        table.record(message, now + Duration::from_secs(1), window);
        assert!(table.best(receiver(), |_, _| ()).is_some());
    }

    #[test]
    fn best_picks_the_superior_master() {
        let mut table = ForeignMasterTable::new();
        let now = Instant::now();
        let window = Duration::from_secs(6);
        let worse = announce(ClockIdentity([1; 8]), ClockIdentity([0xaa; 8]), 7, 0);
        let better = announce(ClockIdentity([2; 8]), ClockIdentity([0xbb; 8]), 6, 0);

        for message in [worse, better] {
            table.record(message, now, window);
            table.record(message, now + Duration::from_millis(10), window);
        }

        let best = table.best(receiver(), |_, _| ()).expect("qualified master");
        assert_eq!(best.grandmaster_identity, ClockIdentity([0xbb; 8]));
    }

    #[test]
    fn stale_masters_are_evicted() {
        let mut table = ForeignMasterTable::new();
        let now = Instant::now();
        let window = Duration::from_secs(6);
        let message = announce(ClockIdentity([1; 8]), ClockIdentity([0xaa; 8]), 6, 0);
        table.record(message, now, window);
        table.evict_stale(now + Duration::from_secs(7), window);
        assert!(table.is_empty());
    }
}
