//! Primary-interface discovery.

use std::net::Ipv4Addr;

use nix::ifaddrs::getifaddrs;

/// First IPv4 address on an interface whose name starts with `prefix`.
pub fn primary_ipv4(prefix: &str) -> Option<Ipv4Addr> {
    let addrs = getifaddrs().ok()?;
    for ifaddr in addrs {
        if !ifaddr.interface_name.starts_with(prefix) {
            continue;
        }
        let Some(address) = ifaddr.address else {
            continue;
        };
        if let Some(sin) = address.as_sockaddr_in() {
            return Some(Ipv4Addr::from(sin.ip()));
        }
    }
    None
}
