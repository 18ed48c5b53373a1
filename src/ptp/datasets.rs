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

//! The subsets of the IEEE 1588-2019 clause 8 data sets this ordinary clock
//! actually consumes.

use crate::ptp::{
    messages::AnnounceMessage,
    profile::Profile,
    types::{
        ClockIdentity, ClockQuality, DelayMechanism, PortIdentity, PortState, TimeInterval,
        SLAVE_ONLY_CLOCK_CLASS,
    },
};
use serde::Serialize;

/// IEEE 1588-2019 8.2.1.
#[derive(Debug, Clone, Serialize)]
pub struct DefaultDs {
    pub clock_identity: ClockIdentity,
    pub priority1: u8,
    pub priority2: u8,
    pub clock_quality: ClockQuality,
    pub domain_number: u8,
    pub slave_only: bool,
    pub sdo_id: u16,
    pub number_ports: u16,
}

impl DefaultDs {
    /// A slave-only instance advertises clock class 255 and never wins BMCA.
    pub fn slave_only(clock_identity: ClockIdentity, domain_number: u8, profile: &Profile) -> Self {
        DefaultDs {
            clock_identity,
            priority1: profile.default_ds.priority1,
            priority2: profile.default_ds.priority2,
            clock_quality: ClockQuality {
                clock_class: SLAVE_ONLY_CLOCK_CLASS,
                ..ClockQuality::default()
            },
            domain_number,
            slave_only: true,
            sdo_id: profile.default_ds.sdo_id,
            number_ports: 1,
        }
    }
}

/// IEEE 1588-2019 8.2.3.
#[derive(Debug, Clone, Serialize)]
pub struct ParentDs {
    pub parent_port_identity: PortIdentity,
    pub grandmaster_identity: ClockIdentity,
    pub grandmaster_clock_quality: ClockQuality,
    pub grandmaster_priority1: u8,
    pub grandmaster_priority2: u8,
    pub parent_stats: bool,
}

impl ParentDs {
    pub fn from_announce(announce: &AnnounceMessage) -> Self {
        ParentDs {
            parent_port_identity: announce.header.source_port_identity,
            grandmaster_identity: announce.grandmaster_identity,
            grandmaster_clock_quality: announce.grandmaster_clock_quality,
            grandmaster_priority1: announce.grandmaster_priority1,
            grandmaster_priority2: announce.grandmaster_priority2,
            parent_stats: false,
        }
    }
}

/// IEEE 1588-2019 8.2.15.
#[derive(Debug, Clone, Serialize)]
pub struct PortDs {
    pub port_identity: PortIdentity,
    pub state: PortState,
    pub log_announce_interval: i8,
    pub announce_receipt_timeout: u8,
    pub log_sync_interval: i8,
    pub log_min_delay_req_interval: i8,
    pub delay_mechanism: DelayMechanism,
    #[serde(skip)]
    pub mean_link_delay: TimeInterval,
    pub version: u8,
}

impl PortDs {
    pub fn new(port_identity: PortIdentity, profile: &Profile) -> Self {
        PortDs {
            port_identity,
            state: PortState::Initializing,
            log_announce_interval: profile.port_ds.log_announce_interval,
            announce_receipt_timeout: profile.port_ds.announce_receipt_timeout,
            log_sync_interval: profile.port_ds.log_sync_interval,
            log_min_delay_req_interval: profile.port_ds.log_min_delay_req_interval,
            delay_mechanism: DelayMechanism::E2e,
            mean_link_delay: TimeInterval::ZERO,
            version: 2,
        }
    }

    pub fn announce_interval_secs(&self) -> f64 {
        2f64.powi(self.log_announce_interval as i32)
    }

    pub fn sync_interval_secs(&self) -> f64 {
        2f64.powi(self.log_sync_interval as i32)
    }

    pub fn min_delay_req_interval_secs(&self) -> f64 {
        2f64.powi(self.log_min_delay_req_interval as i32)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ptp::profile::DEFAULT_DELAY_REQUEST_RESPONSE_PROFILE;

    #[test]
    fn slave_only_default_ds_advertises_class_255() {
        let ds = DefaultDs::slave_only(
            ClockIdentity([1; 8]),
            0,
            &DEFAULT_DELAY_REQUEST_RESPONSE_PROFILE,
        );
        assert!(ds.slave_only);
        assert_eq!(ds.clock_quality.clock_class, SLAVE_ONLY_CLOCK_CLASS);
        assert_eq!(ds.priority1, 128);
    }

    #[test]
    fn port_ds_intervals_are_powers_of_two() {
        let port_ds = PortDs::new(
            PortIdentity::new(ClockIdentity([1; 8]), 1),
            &DEFAULT_DELAY_REQUEST_RESPONSE_PROFILE,
        );
        assert_eq!(port_ds.announce_interval_secs(), 2.0);
        assert_eq!(port_ds.sync_interval_secs(), 1.0);
        assert_eq!(port_ds.min_delay_req_interval_secs(), 1.0);
    }
}
