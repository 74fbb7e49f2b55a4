use std::net::Ipv4Addr;

use crate::error::{Error, Result};

/// Local IPv4 addresses and the broadcast addresses to beacon on.
#[derive(Debug, Clone)]
pub struct NetworkInfo {
    pub addresses: Vec<Ipv4Addr>,
    pub broadcasts: Vec<Ipv4Addr>,
}

/// Enumerate non-loopback IPv4 interfaces and their broadcast addresses.
///
/// When `bind` names a specific interface address, the result is
/// restricted to that interface. Binding to all interfaces keeps every
/// broadcast so hellos reach each attached network.
pub fn enumerate(bind: Option<Ipv4Addr>) -> Result<NetworkInfo> {
    // Loopback binds bypass the interface scan entirely; 127/8 has its
    // own broadcast range.
    if let Some(ip) = bind
        && ip.is_loopback()
    {
        return Ok(NetworkInfo {
            addresses: vec![ip],
            broadcasts: vec![Ipv4Addr::new(127, 255, 255, 255)],
        });
    }

    let interfaces = if_addrs::get_if_addrs()
        .map_err(|e| Error::Config(format!("cannot enumerate interfaces: {e}")))?;

    let mut addresses = Vec::new();
    let mut broadcasts = Vec::new();

    for iface in interfaces {
        if iface.is_loopback() {
            continue;
        }
        let if_addrs::IfAddr::V4(v4) = iface.addr else {
            continue;
        };
        if let Some(want) = bind
            && v4.ip != want
        {
            continue;
        }
        addresses.push(v4.ip);
        // Some interfaces (point-to-point) report no broadcast; derive
        // it from the netmask.
        let broadcast = v4
            .broadcast
            .unwrap_or_else(|| broadcast_of(v4.ip, v4.netmask));
        broadcasts.push(broadcast);
    }

    addresses.sort();
    addresses.dedup();
    broadcasts.sort();
    broadcasts.dedup();

    if let Some(want) = bind
        && addresses.is_empty()
    {
        return Err(Error::Config(format!("no interface has address {want}")));
    }

    Ok(NetworkInfo {
        addresses,
        broadcasts,
    })
}

/// Directed broadcast address for an `ip`/`netmask` pair.
fn broadcast_of(ip: Ipv4Addr, netmask: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(ip) | !u32::from(netmask))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_from_class_c_netmask() {
        let bc = broadcast_of(
            Ipv4Addr::new(192, 168, 1, 17),
            Ipv4Addr::new(255, 255, 255, 0),
        );
        assert_eq!(bc, Ipv4Addr::new(192, 168, 1, 255));
    }

    #[test]
    fn broadcast_from_wider_netmask() {
        let bc = broadcast_of(Ipv4Addr::new(10, 3, 7, 9), Ipv4Addr::new(255, 255, 0, 0));
        assert_eq!(bc, Ipv4Addr::new(10, 3, 255, 255));
    }

    #[test]
    fn binding_to_unknown_address_is_a_config_error() {
        // 203.0.113.0/24 is TEST-NET-3, never assigned to a local interface.
        let result = enumerate(Some(Ipv4Addr::new(203, 0, 113, 7)));
        assert!(result.is_err());
    }
}
