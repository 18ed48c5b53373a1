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

//! SDK for receiving RAVENNA/AES67/ST2110-30 audio streams: an SDP-described
//! RTP receiver with a timestamp-indexed playout buffer, disciplined to an
//! external grandmaster by a built-in PTP ordinary clock.

pub mod bytes;
pub mod config;
pub mod error;
pub mod fifo;
pub mod formats;
pub mod monitoring;
pub mod nic;
pub mod nmos;
pub mod ptp;
pub mod receiver;
pub mod sdp;
pub mod session;
pub mod socket;
pub mod telemetry;
pub mod utils;
