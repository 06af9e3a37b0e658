use std::{
    io::{self, Error},
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
};

use inlined::TinyVec;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::SOCKS_VERSION;

/// An empty IPv4 [`SocketAddr`] with port 0, used as the bound address on failure replies.
pub const UNSPECIFIED_SOCKADDR_V4: SocketAddr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));

/// The SOCKS5 reply status vocabulary (RFC 1928 §6).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksStatus {
    Succeeded = 0,
    GeneralFailure = 1,
    NotAllowedByRuleset = 2,
    NetworkUnreachable = 3,
    HostUnreachable = 4,
    ConnectionRefused = 5,
    CommandNotSupported = 7,
    AtypNotSupported = 8,
}

impl SocksStatus {
    /// Maps a dial failure onto the reply vocabulary. The mapping is deterministic by error
    /// class: refused, network-unreachable and host-unreachable keep their precise statuses,
    /// everything else (including resolution failures and connect timeouts) is a general
    /// failure.
    pub fn from_dial_error(error: &Error) -> Self {
        if error.kind() == io::ErrorKind::ConnectionRefused {
            return Self::ConnectionRefused;
        }

        #[cfg(unix)]
        match error.raw_os_error() {
            Some(libc::ENETUNREACH) => return Self::NetworkUnreachable,
            Some(libc::EHOSTUNREACH) => return Self::HostUnreachable,
            _ => {}
        }

        Self::GeneralFailure
    }
}

/// The SOCKS5 address type byte.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksAtyp {
    IPv4 = 1,
    Domainname = 3,
    IPv6 = 4,
}

impl SocksAtyp {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::IPv4),
            3 => Some(Self::Domainname),
            4 => Some(Self::IPv6),
            _ => None,
        }
    }
}

/// Encodes a reply: `VER | REP | RSV | ATYP | BND.ADDR | BND.PORT`. An IPv4 bound address uses
/// the 4-byte form, anything else the 16-byte form; failure replies pass
/// [`UNSPECIFIED_SOCKADDR_V4`].
pub fn encode_reply(status: SocksStatus, bound_address: SocketAddr) -> TinyVec<22, u8> {
    let mut reply = TinyVec::<22, u8>::new();
    reply.push(SOCKS_VERSION);
    reply.push(status as u8);
    reply.push(0);

    match bound_address {
        SocketAddr::V4(addr4) => {
            reply.push(SocksAtyp::IPv4 as u8);
            reply.extend_from_slice_copied(&addr4.ip().octets());
        }
        SocketAddr::V6(addr6) => {
            reply.push(SocksAtyp::IPv6 as u8);
            reply.extend_from_slice_copied(&addr6.ip().octets());
        }
    }

    reply.extend_from_slice_copied(&bound_address.port().to_be_bytes());
    reply
}

/// Writes a reply to the client in a single write.
pub async fn send_reply<W>(writer: &mut W, status: SocksStatus, bound_address: SocketAddr) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let reply = encode_reply(status, bound_address);
    writer.write_all(&reply).await
}
