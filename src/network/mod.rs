//! Network side of a scale link
//!
//! This module handles socket allocation, the per-device link engine and
//! identity lookup over HTTP.

mod identity;
mod link;

pub use self::identity::{parse_realm, HttpIdentityResolver, IdentityConfig, IdentityResolver};
pub use self::link::{LinkEvent, ScaleLink};

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::warn;

use crate::core::{Result, ScaleEndpointConfig};

/// Local address a link binds for the given endpoint
pub fn local_bind_addr(endpoint: &ScaleEndpointConfig) -> SocketAddr {
    let ip: IpAddr = match endpoint.address {
        IpAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
        IpAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
    };
    SocketAddr::new(ip, endpoint.local_port)
}

/// Binds a non-blocking UDP socket, falling back to an ephemeral port
/// when the preferred one is already taken
pub fn bind_socket(local: SocketAddr) -> Result<UdpSocket> {
    match try_bind(local) {
        Ok(socket) => Ok(socket),
        Err(e) if e.kind() == io::ErrorKind::AddrInUse && local.port() != 0 => {
            warn!(port = local.port(), "local port busy, binding ephemeral port");
            Ok(try_bind(SocketAddr::new(local.ip(), 0))?)
        }
        Err(e) => Err(e.into()),
    }
}

fn try_bind(addr: SocketAddr) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}
