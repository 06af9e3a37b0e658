//! Source-pinned outbound connections.
//!
//! Every dialed connection binds its local endpoint to the endpoint's outbound address before
//! connecting, which is what lets each listener in the pool egress from its own address.

use std::{
    fmt::Write,
    io::{self, Error, ErrorKind},
    net::{IpAddr, SocketAddr, SocketAddrV6},
    time::Duration,
};

use inlined::InlineString;
use tokio::net::{TcpSocket, TcpStream};

use crate::{
    socks::{Request, Target},
    sockopt,
};

/// How long a single connect attempt may take before it is abandoned.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Opens a connection to the request's destination with the local address pinned to `source`.
///
/// Domain name targets may resolve to multiple candidates; candidates whose address family
/// matches the source address are tried first, and the last error is returned if none of them
/// connect.
pub async fn connect_pinned(request: &Request, source: IpAddr) -> io::Result<TcpStream> {
    match &request.target {
        Target::Ip(ip) => try_connect(SocketAddr::new(*ip, request.port), source).await,
        Target::Name(name) => {
            // Longest possible form: 255 bytes of name, a colon and a 5-digit port
            let mut host = InlineString::<262>::new();
            let _ = write!(host, "{}:{}", name, request.port);

            let mut candidates: Vec<SocketAddr> = tokio::net::lookup_host(host.as_str()).await?.collect();
            candidates.sort_by_key(|candidate| candidate.is_ipv4() != source.is_ipv4());

            let mut last_error = None;
            for candidate in candidates {
                match try_connect(candidate, source).await {
                    Ok(stream) => return Ok(stream),
                    Err(error) => last_error = Some(error),
                }
            }

            Err(last_error.unwrap_or_else(|| {
                let message = format!("the domainname \"{host}\" could not be resolved to any addresses");
                Error::new(ErrorKind::NotFound, message)
            }))
        }
    }
}

async fn try_connect(destination: SocketAddr, source: IpAddr) -> io::Result<TcpStream> {
    let (socket, bind_address) = match (destination, source) {
        (SocketAddr::V4(_), IpAddr::V4(ip)) => (TcpSocket::new_v4()?, SocketAddr::new(IpAddr::V4(ip), 0)),
        (SocketAddr::V6(_), IpAddr::V6(ip)) => (TcpSocket::new_v6()?, SocketAddr::V6(SocketAddrV6::new(ip, 0, 0, 0))),
        _ => {
            return Err(Error::new(
                ErrorKind::AddrNotAvailable,
                "destination address family does not match the outbound address",
            ))
        }
    };

    // Best-effort performance tuning; a failure here never fails the dial
    if let Err(error) = sockopt::tune(&socket) {
        tracing::debug!(%destination, %error, "could not tune outbound socket");
    }

    socket.bind(bind_address)?;

    match tokio::time::timeout(CONNECT_TIMEOUT, socket.connect(destination)).await {
        Ok(result) => result,
        Err(_) => Err(Error::new(ErrorKind::TimedOut, "connect timed out")),
    }
}
