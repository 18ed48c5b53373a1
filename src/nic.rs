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

use crate::error::{ConfigError, ConfigResult};
use pnet::datalink::{self, NetworkInterface};
use std::net::{IpAddr, Ipv4Addr};

pub fn find_nic_with_name(name: &str) -> ConfigResult<NetworkInterface> {
    for iface in datalink::interfaces() {
        if iface.name == name {
            return Ok(iface);
        }
    }

    Err(ConfigError::NoSuchNic(name.to_owned()))
}

pub fn find_nic_for_ip(ip: IpAddr) -> ConfigResult<NetworkInterface> {
    for iface in datalink::interfaces() {
        for ipn in &iface.ips {
            if ipn.ip() == ip {
                return Ok(iface);
            }
        }
    }

    Err(ConfigError::NoSuchNic(ip.to_string()))
}

/// Resolves an interface selector (a name like `eth0` or one of the
/// interface's IPv4 addresses) to an interface. The interface must carry
/// exactly one IPv4 address usable for multicast.
pub fn resolve_interface(selector: &str) -> ConfigResult<NetworkInterface> {
    let iface = if let Ok(ip) = selector.parse::<IpAddr>() {
        find_nic_for_ip(ip)?
    } else {
        find_nic_with_name(selector)?
    };

    interface_ipv4(&iface)?;
    Ok(iface)
}

/// The single usable IPv4 address of `iface`. Zero or more than one is a
/// configuration error, a receiver must not guess which leg to join
/// multicast on.
pub fn interface_ipv4(iface: &NetworkInterface) -> ConfigResult<Ipv4Addr> {
    let mut addresses = iface.ips.iter().filter_map(|ipn| match ipn.ip() {
        IpAddr::V4(v4) if !v4.is_loopback() && !v4.is_link_local() => Some(v4),
        _ => None,
    });

    let first = addresses
        .next()
        .ok_or_else(|| ConfigError::AmbiguousNic(iface.name.clone()))?;

    if addresses.next().is_some() {
        return Err(ConfigError::AmbiguousNic(iface.name.clone()));
    }

    Ok(first)
}
