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

//! The PTP ordinary clock: port state machine, BMCA-driven parent selection,
//! the Sync/Follow_Up and Delay_Req/Delay_Resp exchange, and the discipline
//! of the local clock towards the selected grandmaster.
//!
//! The engine runs on the IO reactor; all of its state is single-threaded.
//! The only things that leave it are clock snapshots through the seqlock
//! cell, domain events through a bounded channel, and counters.

use crate::{
    error::{PtpError, PtpResult},
    monitoring::Monitoring,
    ptp::{
        bmca::{Comparison, ComparisonDataSet, ForeignMasterTable},
        datasets::{DefaultDs, ParentDs, PortDs},
        local_clock::{ClockCell, LocalClock, now_host_nanos},
        messages::{
            AnnounceMessage, DelayReqMessage, DelayRespMessage, FollowUpMessage, Message,
            SyncMessage,
        },
        profile::Profile,
        sequence::{DelaySequence, SequenceState},
        types::{ClockIdentity, PortIdentity, PortState, TimeInterval},
    },
    socket::ptp_event_destination,
    utils::SlidingMedian,
};
use rand::Rng;
use std::{
    collections::VecDeque,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{net::UdpSocket, select, sync::mpsc, time};
use tokio_graceful_shutdown::SubsystemHandle;
use tracing::{debug, info, warn};

/// Offsets above this are considered gross disagreement and step the clock
/// instead of slewing it.
const GROSS_OFFSET_STEP_THRESHOLD_S: f64 = 0.010;
/// Calibration band: the offset must stay within this for the dwell.
const CALIBRATION_TOLERANCE_S: f64 = 1e-6;
/// Number of consecutive in-band Sync pairs required for calibration.
const CALIBRATION_DWELL: u32 = 5;
/// Outstanding measurements older than this many sync intervals are evicted.
const MAX_OUTSTANDING_SYNC_INTERVALS: u32 = 8;
/// Consecutive expected Syncs that may be missed before a warning.
const SYNC_MISS_WARN_THRESHOLD: u32 = 5;
/// Median window for the port data set's mean link delay.
const LINK_DELAY_WINDOW: usize = 16;
/// Consecutive socket errors tolerated before the port goes faulty.
const MAX_SOCKET_ERRORS: u32 = 3;

/// Domain events published to the session.
#[derive(Debug, Clone)]
pub enum PtpEvent {
    StateChanged(PortState),
    ParentChanged(ParentDs),
    CalibrationChanged(bool),
}

#[derive(Debug, Clone)]
pub struct PtpPortConfig {
    pub clock_identity: ClockIdentity,
    pub domain_number: u8,
    pub profile: Profile,
}

/// Runs the ordinary clock until shutdown. The sockets must already be bound
/// to the PTP event and general ports so that permission problems surface at
/// session start.
#[allow(clippy::too_many_arguments)]
pub async fn ptp_port_task(
    subsys: SubsystemHandle,
    config: PtpPortConfig,
    event_socket: UdpSocket,
    general_socket: UdpSocket,
    clock_cell: Arc<ClockCell>,
    monitoring: Monitoring,
    events: mpsc::Sender<PtpEvent>,
) -> PtpResult<()> {
    let port_identity = PortIdentity::new(config.clock_identity, 1);
    let default_ds =
        DefaultDs::slave_only(config.clock_identity, config.domain_number, &config.profile);
    let port_ds = PortDs::new(port_identity, &config.profile);

    let port = OrdinaryClock {
        subsys,
        default_ds,
        port_ds,
        parent_announce: None,
        event_socket,
        general_socket,
        foreign_masters: ForeignMasterTable::new(),
        sequences: VecDeque::new(),
        local_clock: LocalClock::new(),
        clock_cell,
        monitoring,
        events,
        delay_req_sequence_id: 0,
        next_delay_req_at: Instant::now(),
        calibration: CalibrationTracker::new(CALIBRATION_TOLERANCE_S, CALIBRATION_DWELL),
        pending_step: true,
        announce_deadline: None,
        last_sync_at: None,
        sync_warned: false,
        link_delay: SlidingMedian::new(LINK_DELAY_WINDOW),
        socket_errors: 0,
    };

    port.run().await
}

/// Tracks how long the measured offset has stayed inside the calibration
/// band. Calibration is gained after a dwell of consecutive in-band
/// measurements and lost by a single out-of-band one.
#[derive(Debug)]
struct CalibrationTracker {
    tolerance_s: f64,
    dwell: u32,
    streak: u32,
}

impl CalibrationTracker {
    fn new(tolerance_s: f64, dwell: u32) -> Self {
        CalibrationTracker {
            tolerance_s,
            dwell,
            streak: 0,
        }
    }

    /// Feeds one offset measurement; returns whether the clock should now be
    /// considered within the calibration band.
    fn update(&mut self, offset_s: f64) -> bool {
        if offset_s.abs() <= self.tolerance_s {
            self.streak = self.streak.saturating_add(1);
        } else {
            self.streak = 0;
        }
        self.streak >= self.dwell
    }

    fn reset(&mut self) {
        self.streak = 0;
    }
}

struct OrdinaryClock {
    subsys: SubsystemHandle,
    default_ds: DefaultDs,
    port_ds: PortDs,
    parent_announce: Option<AnnounceMessage>,
    event_socket: UdpSocket,
    general_socket: UdpSocket,
    foreign_masters: ForeignMasterTable,
    sequences: VecDeque<DelaySequence>,
    local_clock: LocalClock,
    clock_cell: Arc<ClockCell>,
    monitoring: Monitoring,
    events: mpsc::Sender<PtpEvent>,
    delay_req_sequence_id: u16,
    next_delay_req_at: Instant,
    calibration: CalibrationTracker,
    /// The next valid offset steps the clock instead of adjusting it; set on
    /// startup and whenever the grandmaster changes.
    pending_step: bool,
    announce_deadline: Option<Instant>,
    last_sync_at: Option<Instant>,
    sync_warned: bool,
    link_delay: SlidingMedian,
    socket_errors: u32,
}

impl OrdinaryClock {
    async fn run(mut self) -> PtpResult<()> {
        let mut event_buf = [0u8; 1500];
        let mut general_buf = [0u8; 1500];
        let mut tick = time::interval(Duration::from_millis(250));
        tick.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

        info!(
            "PTP port {} started in domain {}.",
            self.port_ds.port_identity, self.default_ds.domain_number
        );
        self.set_state(PortState::Listening).await;

        loop {
            select! {
                received = self.event_socket.recv_from(&mut event_buf) => {
                    match received {
                        Ok((len, addr)) => {
                            self.socket_errors = 0;
                            self.datagram_received(&event_buf[..len], addr).await;
                        }
                        Err(e) => self.socket_error(e).await?,
                    }
                },
                received = self.general_socket.recv_from(&mut general_buf) => {
                    match received {
                        Ok((len, addr)) => {
                            self.socket_errors = 0;
                            self.datagram_received(&general_buf[..len], addr).await;
                        }
                        Err(e) => self.socket_error(e).await?,
                    }
                },
                _ = tick.tick() => self.tick().await?,
                _ = self.subsys.on_shutdown_requested() => {
                    info!("Shutdown of PTP port requested.");
                    break;
                },
            }
        }

        self.set_state(PortState::Disabled).await;
        info!("PTP port stopped.");
        Ok(())
    }

    async fn socket_error(&mut self, e: std::io::Error) -> PtpResult<()> {
        self.socket_errors += 1;
        warn!(
            "PTP socket error ({}/{MAX_SOCKET_ERRORS}): {e}",
            self.socket_errors
        );
        if self.socket_errors >= MAX_SOCKET_ERRORS {
            self.set_state(PortState::Faulty).await;
            return Err(PtpError::Faulty(e.to_string()));
        }
        // One retry with backoff before the next receive attempt.
        time::sleep(Duration::from_millis(100 * self.socket_errors as u64)).await;
        Ok(())
    }

    async fn datagram_received(&mut self, data: &[u8], addr: SocketAddr) {
        let message = match Message::decode(data) {
            Ok(it) => it,
            Err(e) => {
                debug!("Malformed PTP message from {addr}: {e}");
                Monitoring::count(&self.monitoring.counters().ptp_malformed);
                return;
            }
        };

        if message.header().domain_number != self.default_ds.domain_number {
            return;
        }

        match message {
            Message::Announce(announce) => self.announce_received(announce).await,
            Message::Sync(sync) => self.sync_received(sync),
            Message::FollowUp(follow_up) => self.follow_up_received(follow_up),
            Message::DelayResp(resp) => self.delay_resp_received(resp).await,
            // A slave-only port answers no Delay_Reqs and ignores the rest.
            Message::DelayReq(_) | Message::Other(_) => (),
        }
    }

    async fn announce_received(&mut self, announce: AnnounceMessage) {
        Monitoring::count(&self.monitoring.counters().ptp_announces_received);

        let sender = announce.header.source_port_identity;
        if sender.clock_identity == self.default_ds.clock_identity {
            // Our own (or an identity-colliding) message looped back.
            warn!(
                "Announce with our own clock identity received from port {}: topology fault",
                sender
            );
            return;
        }

        let now = Instant::now();
        let window = self.announce_window();
        self.foreign_masters.record(announce, now, window);

        let from_parent = self
            .parent_announce
            .as_ref()
            .is_some_and(|parent| parent.header.source_port_identity == sender);
        if from_parent {
            self.parent_announce = Some(announce);
            self.announce_deadline = Some(now + self.announce_timeout());
        }

        self.run_bmca().await;
    }

    async fn run_bmca(&mut self) {
        let receiver_identity = self.port_ds.port_identity;
        let best = self
            .foreign_masters
            .best(receiver_identity, |error, source| {
                warn!("BMCA comparison fault {error:?} involving {source}: topology fault");
            })
            .copied();

        let Some(best) = best else {
            return;
        };

        // A slave-only instance never beats a remote master, but guard the
        // decision the standard way.
        let challenger = ComparisonDataSet::from_announce(&best, receiver_identity);
        let own = ComparisonDataSet::from_default_ds(&self.default_ds);
        if !challenger.compare(&own).is_better() {
            if self.port_ds.state != PortState::Passive {
                info!("Local data set beats all foreign masters, port goes passive.");
                self.set_state(PortState::Passive).await;
            }
            return;
        }

        let parent_source = self
            .parent_announce
            .as_ref()
            .map(|parent| parent.header.source_port_identity);

        match parent_source {
            Some(source) if source == best.header.source_port_identity => (),
            Some(_) => {
                let reigning = ComparisonDataSet::from_announce(
                    self.parent_announce.as_ref().expect("parent present"),
                    receiver_identity,
                );
                let comparison = challenger.compare(&reigning);
                if comparison.is_better() {
                    self.adopt_parent(best).await;
                } else if matches!(comparison, Comparison::Error1 | Comparison::Error2) {
                    warn!("BMCA comparison fault {comparison:?} against current parent: topology fault");
                }
            }
            None => self.adopt_parent(best).await,
        }
    }

    async fn adopt_parent(&mut self, announce: AnnounceMessage) {
        let grandmaster_changed = self
            .parent_announce
            .as_ref()
            .map(|parent| parent.grandmaster_identity != announce.grandmaster_identity)
            .unwrap_or(true);

        info!(
            "New PTP parent: port {}, grandmaster {} (priority1 {}, class {})",
            announce.header.source_port_identity,
            announce.grandmaster_identity,
            announce.grandmaster_priority1,
            announce.grandmaster_clock_quality.clock_class
        );

        self.parent_announce = Some(announce);
        self.announce_deadline = Some(Instant::now() + self.announce_timeout());

        if grandmaster_changed {
            self.pending_step = true;
            self.calibration.reset();
            self.local_clock.set_calibrated(false);
            self.publish_clock();
        }

        let parent_ds = ParentDs::from_announce(&announce);
        self.events.send(PtpEvent::ParentChanged(parent_ds)).await.ok();

        if matches!(
            self.port_ds.state,
            PortState::Listening | PortState::Passive | PortState::Slave
        ) {
            self.set_state(PortState::Uncalibrated).await;
        }
    }

    fn sync_received(&mut self, sync: SyncMessage) {
        Monitoring::count(&self.monitoring.counters().ptp_syncs_received);

        let Some(parent) = &self.parent_announce else {
            return;
        };
        if sync.header.source_port_identity != parent.header.source_port_identity {
            return;
        }

        self.last_sync_at = Some(Instant::now());
        self.sync_warned = false;

        // t2 on the slave timescale: the disciplined clock's view of now.
        let t2 = self.local_clock.adjusted(now_host_nanos());
        let sequence = DelaySequence::new(&sync, t2, Instant::now());

        // Duplicate Syncs for the same key replace the older measurement.
        self.sequences.retain(|existing| {
            existing.sync_source != sequence.sync_source
                || existing.sync_sequence_id != sequence.sync_sequence_id
        });
        self.sequences.push_back(sequence);

        while self.sequences.len() > MAX_OUTSTANDING_SYNC_INTERVALS as usize {
            self.sequences.pop_front();
        }
    }

    fn follow_up_received(&mut self, follow_up: FollowUpMessage) {
        Monitoring::count(&self.monitoring.counters().ptp_follow_ups_received);

        for sequence in &mut self.sequences {
            if sequence.matches_follow_up(&follow_up) {
                sequence.update_follow_up(&follow_up);
                return;
            }
        }
        debug!(
            "Follow_Up {} from {} matches no outstanding Sync",
            follow_up.header.sequence_id, follow_up.header.source_port_identity
        );
    }

    async fn delay_resp_received(&mut self, resp: DelayRespMessage) {
        Monitoring::count(&self.monitoring.counters().ptp_delay_resps_received);

        let us = self.port_ds.port_identity;
        let Some(index) = self
            .sequences
            .iter()
            .position(|sequence| sequence.matches_delay_resp(&resp, &us))
        else {
            return;
        };

        let mut sequence = self.sequences.remove(index).expect("index valid");
        sequence.update_delay_resp(&resp);

        let (Some(delay), Some(offset)) =
            (sequence.mean_path_delay(), sequence.offset_from_master())
        else {
            return;
        };

        self.measurement_complete(delay, offset).await;
    }

    async fn measurement_complete(&mut self, delay: TimeInterval, offset: TimeInterval) {
        let offset_s = offset.total_seconds_f64();

        self.monitoring.set_offset_nanos(offset.total_nanos());
        let median_delay = self.link_delay.update(delay.total_nanos());
        self.port_ds.mean_link_delay = TimeInterval::from_nanos(median_delay);
        self.monitoring.set_mean_link_delay_nanos(median_delay);

        if self.pending_step || offset_s.abs() > GROSS_OFFSET_STEP_THRESHOLD_S {
            info!("Stepping local clock by {:.9} s", -offset_s);
            self.local_clock.step(offset_s);
            self.pending_step = false;
            self.calibration.reset();
        } else {
            self.local_clock.adjust(offset_s);
        }

        let was_calibrated = self.local_clock.is_calibrated();
        let in_band = self.calibration.update(offset_s);
        self.local_clock.set_calibrated(in_band);
        let is_calibrated = self.local_clock.is_calibrated();

        self.publish_clock();

        debug!(
            "Delay measurement complete: offset {} ns, path delay {} ns (median {} ns)",
            offset.total_nanos(),
            delay.total_nanos(),
            median_delay
        );

        if is_calibrated != was_calibrated {
            self.events
                .send(PtpEvent::CalibrationChanged(is_calibrated))
                .await
                .ok();
            if is_calibrated {
                info!("Local clock is calibrated to the grandmaster.");
                self.set_state(PortState::Slave).await;
            } else {
                warn!("Local clock lost calibration.");
                self.set_state(PortState::Uncalibrated).await;
            }
        }
    }

    async fn tick(&mut self) -> PtpResult<()> {
        let now = Instant::now();

        if let Some(deadline) = self.announce_deadline
            && now >= deadline
            && self.parent_announce.is_some()
        {
            warn!(
                "Announce receipt timeout: no qualifying Announce from parent within {:?}",
                self.announce_timeout()
            );
            self.drop_parent().await;
        }

        self.foreign_masters.evict_stale(now, self.announce_window());

        if let Some(last_sync) = self.last_sync_at
            && self.parent_announce.is_some()
            && !self.sync_warned
        {
            let missed = Duration::from_secs_f64(
                SYNC_MISS_WARN_THRESHOLD as f64 * self.port_ds.sync_interval_secs(),
            );
            if now.duration_since(last_sync) > missed {
                warn!(
                    "No Sync from parent for {SYNC_MISS_WARN_THRESHOLD} expected intervals"
                );
                self.sync_warned = true;
            }
        }

        self.evict_sequences(now);

        if now >= self.next_delay_req_at && self.parent_announce.is_some() {
            self.send_delay_req().await?;
            self.schedule_next_delay_req(now);
        }

        Ok(())
    }

    fn evict_sequences(&mut self, now: Instant) {
        let sync_interval = self.port_ds.sync_interval_secs();
        let pending_window = Duration::from_secs_f64(
            MAX_OUTSTANDING_SYNC_INTERVALS as f64 * sync_interval,
        );
        let resp_window =
            Duration::from_secs_f64(2.0 * self.port_ds.min_delay_req_interval_secs());

        self.sequences.retain(|sequence| {
            let age = now.duration_since(sequence.created_at);
            match sequence.state() {
                SequenceState::AwaitingDelayResp => age <= pending_window + resp_window,
                _ => age <= pending_window,
            }
        });
    }

    async fn send_delay_req(&mut self) -> PtpResult<()> {
        let Some(index) = self
            .sequences
            .iter()
            .rposition(|sequence| sequence.state() == SequenceState::ReadyToBeScheduled)
        else {
            return Ok(());
        };

        self.delay_req_sequence_id = self.delay_req_sequence_id.wrapping_add(1);
        let sequence_id = self.delay_req_sequence_id;

        let request = DelayReqMessage::new(
            self.port_ds.port_identity,
            sequence_id,
            self.default_ds.domain_number,
        );
        let bytes = request.encode();

        let sequence = &mut self.sequences[index];
        sequence.schedule_delay_req(sequence_id);

        match self
            .event_socket
            .send_to(&bytes, ptp_event_destination())
            .await
        {
            Ok(_) => {
                let t3 = self.local_clock.adjusted(now_host_nanos());
                self.sequences[index].mark_delay_req_sent(t3);
                // Older measurements that never got scheduled are stale now.
                let current_id = self.sequences[index].sync_sequence_id;
                self.sequences.retain(|sequence| {
                    sequence.state() != SequenceState::ReadyToBeScheduled
                        || sequence.sync_sequence_id == current_id
                });
                Ok(())
            }
            Err(e) => {
                warn!("Failed to send Delay_Req: {e}");
                self.sequences.remove(index);
                self.socket_error(e).await
            }
        }
    }

    fn schedule_next_delay_req(&mut self, now: Instant) {
        let base = self.port_ds.min_delay_req_interval_secs();
        let factor = rand::rng().random_range(0.75..1.5);
        self.next_delay_req_at = now + Duration::from_secs_f64(base * factor);
    }

    async fn drop_parent(&mut self) {
        if let Some(parent) = self.parent_announce.take() {
            self.foreign_masters
                .remove(&parent.header.source_port_identity);
        }
        self.announce_deadline = None;
        self.calibration.reset();
        self.local_clock.set_calibrated(false);
        self.publish_clock();
        self.set_state(PortState::Listening).await;
    }

    fn announce_window(&self) -> Duration {
        self.announce_timeout()
    }

    fn announce_timeout(&self) -> Duration {
        let interval = self
            .parent_announce
            .as_ref()
            .map(|parent| 2f64.powi(parent.header.log_message_interval as i32))
            .unwrap_or_else(|| self.port_ds.announce_interval_secs());
        Duration::from_secs_f64(self.port_ds.announce_receipt_timeout as f64 * interval)
    }

    fn publish_clock(&self) {
        self.clock_cell.publish(self.local_clock);
        self.monitoring.set_clock_flags(
            self.local_clock.is_valid(),
            self.local_clock.is_locked(),
            self.local_clock.is_calibrated(),
        );
    }

    async fn set_state(&mut self, state: PortState) {
        if self.port_ds.state == state {
            return;
        }
        info!("PTP port state: {} -> {}", self.port_ds.state, state);
        self.port_ds.state = state;
        self.events.send(PtpEvent::StateChanged(state)).await.ok();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn calibration_requires_a_dwell_of_in_band_offsets() {
        let mut tracker = CalibrationTracker::new(1e-6, 5);
        for _ in 0..4 {
            assert!(!tracker.update(0.5e-6));
        }
        assert!(tracker.update(0.5e-6));
        // Stays calibrated while in band.
        assert!(tracker.update(-0.9e-6));
    }

    #[test]
    fn single_out_of_band_offset_resets_the_streak() {
        let mut tracker = CalibrationTracker::new(1e-6, 5);
        for _ in 0..5 {
            tracker.update(0.1e-6);
        }
        assert!(!tracker.update(5e-6));
        assert!(!tracker.update(0.1e-6));
    }
}
