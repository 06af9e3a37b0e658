//! TCP performance options for outbound sockets, applied before connect.
//!
//! On Linux this sets SO_REUSEADDR, TCP_NODELAY and a full keepalive
//! configuration. On other platforms it is a no-op; the proxy works without
//! the tuning, only less efficiently.

use std::io;

use tokio::net::TcpSocket;

/// Seconds of idle time before the first keepalive probe is sent.
pub const KEEPALIVE_IDLE_SECS: i32 = 30;

/// Seconds between keepalive probes.
pub const KEEPALIVE_INTERVAL_SECS: i32 = 10;

/// Unanswered probes before the connection is considered dead.
pub const KEEPALIVE_PROBE_COUNT: i32 = 3;

/// Configures TCP options on an outbound socket's file descriptor.
#[cfg(target_os = "linux")]
pub fn tune(socket: &TcpSocket) -> io::Result<()> {
    use std::os::fd::AsRawFd;

    let fd = socket.as_raw_fd();

    // Allow address reuse for rapid restart
    setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)?;

    // Disable Nagle's algorithm for lower latency
    setsockopt_int(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, 1)?;

    // Enable TCP keepalive with idle/interval/probe-count parameters
    setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, 1)?;
    setsockopt_int(fd, libc::IPPROTO_TCP, libc::TCP_KEEPIDLE, KEEPALIVE_IDLE_SECS)?;
    setsockopt_int(fd, libc::IPPROTO_TCP, libc::TCP_KEEPINTVL, KEEPALIVE_INTERVAL_SECS)?;
    setsockopt_int(fd, libc::IPPROTO_TCP, libc::TCP_KEEPCNT, KEEPALIVE_PROBE_COUNT)?;

    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn tune(_socket: &TcpSocket) -> io::Result<()> {
    Ok(())
}

#[cfg(target_os = "linux")]
fn setsockopt_int(fd: i32, level: i32, optname: i32, value: i32) -> io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            optname,
            &value as *const i32 as *const libc::c_void,
            std::mem::size_of::<i32>() as libc::socklen_t,
        )
    };

    match ret {
        0 => Ok(()),
        _ => Err(io::Error::last_os_error()),
    }
}
