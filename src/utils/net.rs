use std::error::Error;
use std::fmt;
use std::net::{IpAddr, ToSocketAddrs, UdpSocket};

pub type NetResult<T> = Result<T, NetError>;

#[derive(Debug)]
pub enum NetError {
    InterfaceDetection(String),
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InterfaceDetection(s) => write!(f, "interface detection failed: {s}"),
        }
    }
}

impl Error for NetError {}

/// Resolve a hostname to an IP address, preferring IPv4.
///
/// Already-numeric hosts pass through unchanged; `None` means the resolver
/// returned no addresses.
pub fn resolve_host(host: &str) -> Option<IpAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Some(ip);
    }

    let addrs: Vec<IpAddr> = (host, 0u16)
        .to_socket_addrs()
        .ok()?
        .map(|sa| sa.ip())
        .collect();

    addrs
        .iter()
        .find(|ip| ip.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
}

/// Local address of the named network interface.
///
/// `"default"` is detected from the default route by opening a routed (but
/// never used) UDP socket and reading its local address. Named interfaces
/// need platform ifaddrs lookups this crate does not carry; callers fall
/// back to a wildcard bind on error.
pub fn local_address(interface: &str) -> NetResult<IpAddr> {
    if interface != "default" {
        return Err(NetError::InterfaceDetection(format!(
            "cannot determine the address of interface '{interface}'"
        )));
    }

    let socket = UdpSocket::bind("0.0.0.0:0")
        .map_err(|e| NetError::InterfaceDetection(e.to_string()))?;
    socket
        .connect("1.1.1.1:53")
        .map_err(|e| NetError::InterfaceDetection(e.to_string()))?;
    let local = socket
        .local_addr()
        .map_err(|e| NetError::InterfaceDetection(e.to_string()))?;

    if local.ip().is_unspecified() {
        return Err(NetError::InterfaceDetection("no default route".into()));
    }

    Ok(local.ip())
}
