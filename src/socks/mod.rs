//! The per-connection SOCKS5 state machine.
//!
//! Each accepted connection walks greeting → request → dial → relay. Malformed input (wrong
//! version, truncated reads) drops the connection without a reply, since the stream itself
//! cannot be trusted; well-formed but unsupported requests get a precise status reply before
//! the close. Dial failures always get a reply. The handshake phase runs under a single short
//! deadline; the relay phase is unbounded.

use std::{
    fmt,
    io::{self, Error},
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    rc::Rc,
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};

use crate::{
    dial,
    relay::{self, BufferPool},
};

pub mod reply;

use reply::{send_reply, SocksAtyp, SocksStatus, UNSPECIFIED_SOCKADDR_V4};

pub const SOCKS_VERSION: u8 = 5;

const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_NO_ACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;

/// Bounds the greeting and request phases combined. Expiry drops the connection silently.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// The destination a CONNECT request points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Ip(IpAddr),
    Name(String),
}

/// A parsed CONNECT request. Immutable once parsed; scoped to one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub target: Target,
    pub port: u16,
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            Target::Ip(IpAddr::V4(ip)) => write!(f, "{ip}:{}", self.port),
            Target::Ip(IpAddr::V6(ip)) => write!(f, "[{ip}]:{}", self.port),
            Target::Name(name) => write!(f, "{name}:{}", self.port),
        }
    }
}

#[derive(Debug)]
pub enum HandshakeError {
    IO(Error),
    InvalidVersion(u8),
    NoMethods,
    NoAcceptableMethod,
    InvalidCommand(u8),
    InvalidAtyp(u8),
    EmptyDomainname,
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IO(error) => error.fmt(f),
            Self::InvalidVersion(version) => write!(f, "Client requested invalid SOCKS version: {version}"),
            Self::NoMethods => write!(f, "Client offered zero authentication methods"),
            Self::NoAcceptableMethod => write!(f, "No acceptable authentication method"),
            Self::InvalidCommand(cmd) => write!(f, "Client requested unsupported command: {cmd}"),
            Self::InvalidAtyp(atyp) => write!(f, "Client requested unsupported address type: {atyp}"),
            Self::EmptyDomainname => write!(f, "Client sent a zero-length domainname"),
        }
    }
}

impl From<Error> for HandshakeError {
    fn from(value: Error) -> Self {
        Self::IO(value)
    }
}

impl HandshakeError {
    /// The reply status for well-formed but unsupported requests. `None` means the input was
    /// malformed and the connection is dropped without a reply.
    fn reply_status(&self) -> Option<SocksStatus> {
        match self {
            Self::InvalidCommand(_) => Some(SocksStatus::CommandNotSupported),
            Self::InvalidAtyp(_) => Some(SocksStatus::AtypNotSupported),
            Self::EmptyDomainname => Some(SocksStatus::GeneralFailure),
            _ => None,
        }
    }
}

/// Reads the greeting and request off a fresh connection, answering the method negotiation
/// along the way. Returns the parsed request, or the reason the handshake cannot proceed.
pub async fn read_handshake<S>(stream: &mut S) -> Result<Request, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    // Greeting: VER | NMETHODS | METHODS...
    let version = stream.read_u8().await?;
    if version != SOCKS_VERSION {
        return Err(HandshakeError::InvalidVersion(version));
    }

    let nmethods = stream.read_u8().await? as usize;
    if nmethods == 0 {
        return Err(HandshakeError::NoMethods);
    }

    let mut methods = [0u8; 255];
    stream.read_exact(&mut methods[..nmethods]).await?;
    if !methods[..nmethods].contains(&METHOD_NO_AUTH) {
        return Err(HandshakeError::NoAcceptableMethod);
    }

    // Select "no authentication"
    stream.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;

    // Request: VER | CMD | RSV | ATYP
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS_VERSION {
        return Err(HandshakeError::InvalidVersion(header[0]));
    }

    if header[1] != CMD_CONNECT {
        return Err(HandshakeError::InvalidCommand(header[1]));
    }

    let target = match SocksAtyp::from_u8(header[3]) {
        Some(SocksAtyp::IPv4) => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            Target::Ip(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        Some(SocksAtyp::IPv6) => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            Target::Ip(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        Some(SocksAtyp::Domainname) => {
            let length = stream.read_u8().await? as usize;
            if length == 0 {
                return Err(HandshakeError::EmptyDomainname);
            }

            let mut name = [0u8; 255];
            stream.read_exact(&mut name[..length]).await?;
            Target::Name(String::from_utf8_lossy(&name[..length]).into_owned())
        }
        None => return Err(HandshakeError::InvalidAtyp(header[3])),
    };

    let port = stream.read_u16().await?;
    Ok(Request { target, port })
}

/// Answers a failed handshake. Unsupported-but-well-formed requests get their precise status;
/// an unacceptable method list gets the `0xFF` sentinel; malformed input gets nothing.
pub async fn write_handshake_error<W>(writer: &mut W, error: &HandshakeError) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    match error.reply_status() {
        Some(status) => send_reply(writer, status, UNSPECIFIED_SOCKADDR_V4).await,
        None => match error {
            HandshakeError::NoAcceptableMethod => writer.write_all(&[SOCKS_VERSION, METHOD_NO_ACCEPTABLE]).await,
            _ => Ok(()),
        },
    }
}

/// Runs one connection's whole lifecycle: handshake, dial, reply, relay, teardown.
pub async fn handle_session(mut stream: TcpStream, peer: SocketAddr, outbound: IpAddr, pool: Rc<BufferPool>) {
    let request = match timeout(HANDSHAKE_TIMEOUT, read_handshake(&mut stream)).await {
        Err(_) => {
            tracing::debug!(%peer, "handshake timed out");
            return;
        }
        Ok(Err(error)) => {
            let _ = write_handshake_error(&mut stream, &error).await;
            tracing::debug!(%peer, %error, "handshake rejected");
            return;
        }
        Ok(Ok(request)) => request,
    };

    let mut remote = match dial::connect_pinned(&request, outbound).await {
        Ok(remote) => remote,
        Err(error) => {
            let status = SocksStatus::from_dial_error(&error);
            let _ = send_reply(&mut stream, status, UNSPECIFIED_SOCKADDR_V4).await;
            tracing::debug!(%peer, destination = %request, %error, ?status, "dial failed");
            return;
        }
    };

    let bound_address = remote.local_addr().unwrap_or(UNSPECIFIED_SOCKADDR_V4);
    if send_reply(&mut stream, SocksStatus::Succeeded, bound_address).await.is_err() {
        return;
    }

    tracing::debug!(%peer, destination = %request, %bound_address, "relaying");
    let (up, down) = relay::relay(&mut stream, &mut remote, &pool).await;

    match (up, down) {
        (Ok(sent), Ok(received)) => tracing::debug!(%peer, sent, received, "session ended"),
        (up, down) => tracing::debug!(%peer, ?up, ?down, "session ended with error"),
    }
}

#[cfg(test)]
mod tests {
    use tokio::{
        io::duplex,
        net::TcpListener,
        task::{spawn_local, LocalSet},
    };

    use super::*;

    #[tokio::test]
    async fn no_auth_is_selected_regardless_of_position() {
        for methods in [vec![0u8], vec![2, 0], vec![1, 2, 0], vec![0, 1, 2]] {
            let (mut client, mut server) = duplex(1024);

            let mut greeting = vec![5, methods.len() as u8];
            greeting.extend_from_slice(&methods);
            client.write_all(&greeting).await.unwrap();
            client.write_all(&[5, 1, 0, 1, 1, 2, 3, 4, 0, 80]).await.unwrap();

            let request = read_handshake(&mut server).await.unwrap();
            assert_eq!(request.target, Target::Ip(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4))));
            assert_eq!(request.port, 80);

            let mut selection = [0u8; 2];
            client.read_exact(&mut selection).await.unwrap();
            assert_eq!(selection, [5, 0]);
        }
    }

    #[tokio::test]
    async fn greeting_without_no_auth_gets_the_sentinel() {
        let (mut client, mut server) = duplex(1024);
        client.write_all(&[5, 2, 1, 2]).await.unwrap();

        let error = read_handshake(&mut server).await.unwrap_err();
        assert!(matches!(error, HandshakeError::NoAcceptableMethod));

        write_handshake_error(&mut server, &error).await.unwrap();
        drop(server);

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, vec![5, 0xFF]);
    }

    #[tokio::test]
    async fn wrong_version_closes_silently() {
        let (mut client, mut server) = duplex(1024);
        client.write_all(&[4, 1, 0]).await.unwrap();

        let error = read_handshake(&mut server).await.unwrap_err();
        assert!(matches!(error, HandshakeError::InvalidVersion(4)));

        write_handshake_error(&mut server, &error).await.unwrap();
        drop(server);

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert!(received.is_empty());
    }

    #[tokio::test]
    async fn zero_methods_closes_silently() {
        let (mut client, mut server) = duplex(1024);
        client.write_all(&[5, 0]).await.unwrap();

        let error = read_handshake(&mut server).await.unwrap_err();
        assert!(matches!(error, HandshakeError::NoMethods));
        assert!(error.reply_status().is_none());
    }

    #[tokio::test]
    async fn unsupported_command_gets_status_seven() {
        let (mut client, mut server) = duplex(1024);
        client.write_all(&[5, 1, 0]).await.unwrap();
        client.write_all(&[5, 2, 0, 1, 127, 0, 0, 1, 0, 80]).await.unwrap();

        let error = read_handshake(&mut server).await.unwrap_err();
        assert!(matches!(error, HandshakeError::InvalidCommand(2)));

        write_handshake_error(&mut server, &error).await.unwrap();
        drop(server);

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, vec![5, 0, 5, 7, 0, 1, 0, 0, 0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn unknown_address_type_gets_status_eight() {
        let (mut client, mut server) = duplex(1024);
        client.write_all(&[5, 1, 0]).await.unwrap();
        client.write_all(&[5, 1, 0, 9]).await.unwrap();

        let error = read_handshake(&mut server).await.unwrap_err();
        assert!(matches!(error, HandshakeError::InvalidAtyp(9)));
        assert_eq!(error.reply_status(), Some(SocksStatus::AtypNotSupported));
    }

    #[tokio::test]
    async fn empty_domainname_gets_general_failure() {
        let (mut client, mut server) = duplex(1024);
        client.write_all(&[5, 1, 0]).await.unwrap();
        client.write_all(&[5, 1, 0, 3, 0]).await.unwrap();

        let error = read_handshake(&mut server).await.unwrap_err();
        assert!(matches!(error, HandshakeError::EmptyDomainname));
        assert_eq!(error.reply_status(), Some(SocksStatus::GeneralFailure));
    }

    #[tokio::test]
    async fn domainname_request_parses() {
        let (mut client, mut server) = duplex(1024);
        client.write_all(&[5, 1, 0]).await.unwrap();

        let mut request = vec![5, 1, 0, 3, 15];
        request.extend_from_slice(b"example.invalid");
        request.extend_from_slice(&443u16.to_be_bytes());
        client.write_all(&request).await.unwrap();

        let parsed = read_handshake(&mut server).await.unwrap();
        assert_eq!(parsed.target, Target::Name(String::from("example.invalid")));
        assert_eq!(parsed.port, 443);
    }

    #[tokio::test]
    async fn ipv6_request_roundtrips_through_the_reply() {
        let (mut client, mut server) = duplex(1024);
        let ip: Ipv6Addr = "2001:db8::42".parse().unwrap();

        client.write_all(&[5, 1, 0]).await.unwrap();
        let mut request = vec![5, 1, 0, 4];
        request.extend_from_slice(&ip.octets());
        request.extend_from_slice(&8080u16.to_be_bytes());
        client.write_all(&request).await.unwrap();

        let parsed = read_handshake(&mut server).await.unwrap();
        assert_eq!(parsed.target, Target::Ip(IpAddr::V6(ip)));
        assert_eq!(parsed.port, 8080);

        // Echo the parsed address back as a bound address and decode it again
        let bound = SocketAddr::new(IpAddr::V6(ip), parsed.port);
        let encoded = reply::encode_reply(SocksStatus::Succeeded, bound);
        let mut octets = [0u8; 16];
        octets.copy_from_slice(&encoded[4..20]);
        assert_eq!(Ipv6Addr::from(octets), ip);
        assert_eq!(u16::from_be_bytes([encoded[20], encoded[21]]), 8080);
    }

    #[tokio::test]
    async fn truncated_request_is_an_io_error() {
        let (mut client, mut server) = duplex(1024);
        client.write_all(&[5, 1, 0]).await.unwrap();
        client.write_all(&[5, 1, 0, 1, 127, 0]).await.unwrap();
        drop(client);

        let error = read_handshake(&mut server).await.unwrap_err();
        assert!(matches!(error, HandshakeError::IO(_)));
        assert!(error.reply_status().is_none());
    }

    /// Accepts one connection and feeds `handle_session` with it, the way the listener does.
    async fn start_session(outbound: IpAddr, pool: &Rc<BufferPool>) -> (TcpStream, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (stream, peer) = listener.accept().await.unwrap();
        let handle = spawn_local(handle_session(stream, peer, outbound, Rc::clone(pool)));
        (client, handle)
    }

    #[tokio::test]
    async fn connect_session_relays_end_to_end() {
        LocalSet::new()
            .run_until(async {
                let pool = Rc::new(BufferPool::new());

                // Destination: reads until end-of-stream, echoes everything back, closes.
                let destination = TcpListener::bind("127.0.0.1:0").await.unwrap();
                let destination_addr = destination.local_addr().unwrap();
                spawn_local(async move {
                    let (mut socket, _) = destination.accept().await.unwrap();
                    let mut received = Vec::new();
                    socket.read_to_end(&mut received).await.unwrap();
                    socket.write_all(&received).await.unwrap();
                    socket.shutdown().await.unwrap();
                });

                let (mut client, session) = start_session(IpAddr::V4(Ipv4Addr::LOCALHOST), &pool).await;

                client.write_all(&[5, 1, 0]).await.unwrap();
                let mut selection = [0u8; 2];
                client.read_exact(&mut selection).await.unwrap();
                assert_eq!(selection, [5, 0]);

                let mut request = vec![5, 1, 0, 1, 127, 0, 0, 1];
                request.extend_from_slice(&destination_addr.port().to_be_bytes());
                client.write_all(&request).await.unwrap();

                let mut reply = [0u8; 10];
                client.read_exact(&mut reply).await.unwrap();
                assert_eq!(reply[1], 0);
                assert_eq!(reply[3], 1);
                // The bound address is the pinned outbound address
                assert_eq!(Ipv4Addr::new(reply[4], reply[5], reply[6], reply[7]), Ipv4Addr::LOCALHOST);

                // Many small writes must arrive byte-for-byte, in order
                let payload = b"hello through the manifold, byte for byte";
                for chunk in payload.chunks(5) {
                    client.write_all(chunk).await.unwrap();
                }
                client.shutdown().await.unwrap();

                let mut echoed = Vec::new();
                client.read_to_end(&mut echoed).await.unwrap();
                assert_eq!(echoed, payload);

                session.await.unwrap();
            })
            .await;
    }

    #[tokio::test]
    async fn refused_dial_replies_and_never_relays() {
        LocalSet::new()
            .run_until(async {
                let pool = Rc::new(BufferPool::new());

                // Find a port with nothing listening on it
                let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
                let closed_addr = closed.local_addr().unwrap();
                drop(closed);

                let (mut client, session) = start_session(IpAddr::V4(Ipv4Addr::LOCALHOST), &pool).await;

                client.write_all(&[5, 1, 0]).await.unwrap();
                let mut selection = [0u8; 2];
                client.read_exact(&mut selection).await.unwrap();

                let mut request = vec![5, 1, 0, 1, 127, 0, 0, 1];
                request.extend_from_slice(&closed_addr.port().to_be_bytes());
                client.write_all(&request).await.unwrap();

                let mut reply = [0u8; 10];
                client.read_exact(&mut reply).await.unwrap();
                assert_eq!(reply[1], 5);
                assert_eq!(&reply[2..], &[0, 1, 0, 0, 0, 0, 0, 0]);

                // The session terminates without entering relay
                let mut rest = Vec::new();
                client.read_to_end(&mut rest).await.unwrap();
                assert!(rest.is_empty());

                session.await.unwrap();
            })
            .await;
    }

    #[tokio::test]
    async fn command_other_than_connect_ends_the_session() {
        LocalSet::new()
            .run_until(async {
                let pool = Rc::new(BufferPool::new());
                let (mut client, session) = start_session(IpAddr::V4(Ipv4Addr::LOCALHOST), &pool).await;

                client.write_all(&[5, 1, 0]).await.unwrap();
                let mut selection = [0u8; 2];
                client.read_exact(&mut selection).await.unwrap();

                // BIND is not supported
                client.write_all(&[5, 2, 0, 1, 127, 0, 0, 1, 0, 80]).await.unwrap();

                let mut reply = [0u8; 10];
                client.read_exact(&mut reply).await.unwrap();
                assert_eq!(reply[1], 7);

                let mut rest = Vec::new();
                client.read_to_end(&mut rest).await.unwrap();
                assert!(rest.is_empty());

                session.await.unwrap();
            })
            .await;
    }
}
