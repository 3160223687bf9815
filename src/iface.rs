//! Bind address discovery from a named network interface.

use std::io;
use std::net::IpAddr;

/// Returns the first address of `interface` that is not link-local unicast.
///
/// `Ok(None)` means the interface does not exist or carries no usable address.
#[cfg(unix)]
pub fn discover_host(interface: &str) -> io::Result<Option<IpAddr>> {
    let addrs = nix::ifaddrs::getifaddrs()?;

    let found = addrs
        .filter(|ifaddr| ifaddr.interface_name == interface)
        .filter_map(|ifaddr| {
            let addr = ifaddr.address?;
            if let Some(sin) = addr.as_sockaddr_in() {
                Some(IpAddr::V4(sin.ip()))
            } else {
                addr.as_sockaddr_in6().map(|sin6| IpAddr::V6(sin6.ip()))
            }
        })
        .find(|ip| !is_link_local_unicast(ip));
    Ok(found)
}

#[cfg(not(unix))]
pub fn discover_host(_interface: &str) -> io::Result<Option<IpAddr>> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "interface discovery is only supported on unix",
    ))
}

fn is_link_local_unicast(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_link_local(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}
