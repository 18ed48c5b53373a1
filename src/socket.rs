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

use crate::error::{ConfigResult, PtpError, PtpResult};
use socket2::{Domain, InterfaceIndexOrAddress, Protocol as SockProto, SockAddr, Socket, Type};
use pnet::datalink::NetworkInterface;
use std::{
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    num::NonZeroU32,
};
use tokio::net::UdpSocket;
use tracing::{info, instrument};

/// IPv4 multicast group for PTP over UDP (IEEE 1588-2019 annex C).
pub const PTP_PRIMARY_MULTICAST: Ipv4Addr = Ipv4Addr::new(224, 0, 1, 129);
pub const PTP_EVENT_PORT: u16 = 319;
pub const PTP_GENERAL_PORT: u16 = 320;

#[instrument]
pub fn create_rx_socket(
    ip_addr: Ipv4Addr,
    iface: &NetworkInterface,
    port: u16,
) -> ConfigResult<UdpSocket> {
    info!(
        "Creating IPv4 {} RX socket for stream {}:{} at {}",
        if ip_addr.is_multicast() {
            "multicast"
        } else {
            "unicast"
        },
        ip_addr,
        port,
        iface.name
    );

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(SockProto::UDP))?;

    socket.set_reuse_address(true)?;

    if ip_addr.is_multicast() {
        socket.join_multicast_v4_n(&ip_addr, &InterfaceIndexOrAddress::Index(iface.index))?;
        socket.bind(&SockAddr::from(SocketAddr::new(IpAddr::V4(ip_addr), port)))?;
    } else {
        socket.bind_device_by_index_v4(NonZeroU32::new(iface.index))?;
        socket.bind(&SockAddr::from(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port,
        )))?;
    }

    socket.set_nonblocking(true)?;
    Ok(UdpSocket::from_std(socket.into())?)
}

/// Binds the PTP event (319) and general (320) sockets on `iface` and joins
/// the primary PTP multicast group on both. Binding these ports requires
/// elevated privileges on most hosts; that failure is surfaced as a
/// permission error.
#[instrument]
pub fn create_ptp_sockets(iface: &NetworkInterface) -> PtpResult<(UdpSocket, UdpSocket)> {
    let event = create_ptp_socket(iface, PTP_EVENT_PORT)?;
    let general = create_ptp_socket(iface, PTP_GENERAL_PORT)?;
    Ok((event, general))
}

fn create_ptp_socket(iface: &NetworkInterface, port: u16) -> PtpResult<UdpSocket> {
    info!(
        "Creating PTP socket on port {} at {}",
        port, iface.name
    );

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(SockProto::UDP))
        .map_err(PtpError::IoError)?;

    socket.set_reuse_address(true).map_err(PtpError::IoError)?;
    socket
        .join_multicast_v4_n(
            &PTP_PRIMARY_MULTICAST,
            &InterfaceIndexOrAddress::Index(iface.index),
        )
        .map_err(PtpError::IoError)?;

    if let Err(e) = socket.bind(&SockAddr::from(SocketAddr::new(
        IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        port,
    ))) {
        return Err(if e.kind() == io::ErrorKind::PermissionDenied {
            PtpError::Permission(e)
        } else {
            PtpError::IoError(e)
        });
    }

    socket.set_nonblocking(true).map_err(PtpError::IoError)?;
    Ok(UdpSocket::from_std(socket.into()).map_err(PtpError::IoError)?)
}

/// Destination for Delay_Req messages on the primary PTP domain.
pub fn ptp_event_destination() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(PTP_PRIMARY_MULTICAST), PTP_EVENT_PORT)
}
