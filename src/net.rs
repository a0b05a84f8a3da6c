//! Local address probing and discovery target selection.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
const GLOBAL_BROADCAST: IpAddr = IpAddr::V4(Ipv4Addr::BROADCAST);

/// Address of the default-route interface. Connecting a UDP socket sends
/// no traffic; it only resolves which local interface would be used.
pub fn primary_ip() -> IpAddr {
    probe_toward(SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 80)).unwrap_or(LOOPBACK)
}

/// The local interface address a reply to `peer` would leave from. Matters
/// on multi-homed hosts where the default route is the wrong interface.
pub fn local_ip_for_peer(peer: IpAddr) -> IpAddr {
    probe_toward(SocketAddr::new(peer, 9)).unwrap_or_else(primary_ip)
}

fn probe_toward(target: SocketAddr) -> Option<IpAddr> {
    let socket = UdpSocket::bind(("0.0.0.0", 0)).ok()?;
    socket.connect(target).ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_loopback() || target.ip().is_loopback()).then_some(ip)
}

/// /24 directed broadcast. A heuristic, but the right one for the home and
/// campus LANs this runs on.
pub fn directed_broadcast(ip: Ipv4Addr) -> Ipv4Addr {
    let [a, b, c, _] = ip.octets();
    Ipv4Addr::new(a, b, c, 255)
}

/// Addresses discovery, heartbeat and election datagrams are sent to.
///
/// Multi-host: the LAN /24 broadcast plus the global broadcast; loopback is
/// excluded so a peer never binds to itself through 127.0.0.1. Single-host
/// mode adds loopback so several peers on one machine can find each other.
pub fn discovery_targets(single_host: bool) -> Vec<IpAddr> {
    let mut targets = Vec::new();

    if let IpAddr::V4(ip) = primary_ip()
        && !ip.is_loopback()
    {
        targets.push(IpAddr::V4(directed_broadcast(ip)));
    }
    targets.push(GLOBAL_BROADCAST);
    if single_host {
        targets.push(LOOPBACK);
    }

    targets.dedup();
    targets
}
