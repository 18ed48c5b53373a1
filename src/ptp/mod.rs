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

//! IEEE 1588-2019 ordinary clock, receive-only deployment: wire codecs,
//! data sets, BMCA, the delay request-response mechanism and the disciplined
//! local clock.

pub mod bmca;
pub mod datasets;
pub mod local_clock;
pub mod messages;
pub mod port;
pub mod profile;
pub mod sequence;
pub mod types;
