use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::net::UdpSocket;

/// Finds the local interface address the OS would route `remote` through.
/// Connecting a UDP socket only selects a route; nothing is sent.
///
/// # Errors
///
/// Returns an error when no route to `remote` exists.
pub async fn discover_local_ip(remote: SocketAddr) -> io::Result<IpAddr> {
    let unspecified: IpAddr = if remote.is_ipv4() {
        Ipv4Addr::UNSPECIFIED.into()
    } else {
        Ipv6Addr::UNSPECIFIED.into()
    };
    let socket = UdpSocket::bind(SocketAddr::new(unspecified, 0)).await?;
    socket.connect(remote).await?;
    Ok(socket.local_addr()?.ip())
}
