//! Bidirectional byte relay between an accepted client and its dialed destination.
//!
//! The two directions run as independent futures joined at the end; each one, on reaching its
//! source's end-of-stream (or an error), half-closes the destination's write side and the
//! source's read side, letting the opposite direction drain at its own pace. On Linux the
//! primary path is a kernel-mediated `splice(2)` transfer; everywhere else (and when pipe
//! creation fails) bytes are moved through a pooled 32 KiB buffer.

use std::io;

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
};

mod pool;
#[cfg(target_os = "linux")]
mod splice;

pub use pool::{BufferPool, BUFFER_SIZE};

/// Copies bytes between `client` and `remote` in both directions until each side's source
/// signals end-of-stream or errors. Returns only after both directions have completed, with
/// the byte count (or error) of the client→remote and remote→client directions respectively.
pub async fn relay(client: &mut TcpStream, remote: &mut TcpStream, pool: &BufferPool) -> (io::Result<u64>, io::Result<u64>) {
    #[cfg(target_os = "linux")]
    {
        match (splice::Pipe::new(), splice::Pipe::new()) {
            (Ok(up_pipe), Ok(down_pipe)) => return relay_spliced(client, remote, &up_pipe, &down_pipe).await,
            _ => {}
        }
    }

    relay_buffered(client, remote, pool).await
}

#[cfg(target_os = "linux")]
async fn relay_spliced(
    client: &mut TcpStream,
    remote: &mut TcpStream,
    up_pipe: &splice::Pipe,
    down_pipe: &splice::Pipe,
) -> (io::Result<u64>, io::Result<u64>) {
    let client = &*client;
    let remote = &*remote;

    tokio::join!(
        async {
            let result = splice::splice_copy(client, remote, up_pipe).await;
            shutdown_write(remote);
            shutdown_read(client);
            result
        },
        async {
            let result = splice::splice_copy(remote, client, down_pipe).await;
            shutdown_write(client);
            shutdown_read(remote);
            result
        },
    )
}

/// The pooled-buffer path. Observable behavior is identical to the spliced path; only the
/// transfer mechanism differs.
pub(crate) async fn relay_buffered(
    client: &mut TcpStream,
    remote: &mut TcpStream,
    pool: &BufferPool,
) -> (io::Result<u64>, io::Result<u64>) {
    let (mut client_read, mut client_write) = client.split();
    let (mut remote_read, mut remote_write) = remote.split();

    tokio::join!(
        async {
            let result = copy_buffered(&mut client_read, &mut remote_write, pool).await;
            let _ = remote_write.shutdown().await;
            shutdown_read(client_read.as_ref());
            result
        },
        async {
            let result = copy_buffered(&mut remote_read, &mut client_write, pool).await;
            let _ = client_write.shutdown().await;
            shutdown_read(remote_read.as_ref());
            result
        },
    )
}

/// Copies from `reader` to `writer` through one pooled buffer until end-of-stream or the first
/// I/O error. The buffer is released on every exit path.
pub(crate) async fn copy_buffered<R, W>(reader: &mut R, writer: &mut W, pool: &BufferPool) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buffer = pool.acquire();
    let mut total = 0u64;

    let result = loop {
        let count = match reader.read(&mut buffer).await {
            Ok(0) => break Ok(total),
            Ok(count) => count,
            Err(error) => break Err(error),
        };

        if let Err(error) = writer.write_all(&buffer[..count]).await {
            break Err(error);
        }

        total += count as u64;
    };

    pool.release(buffer);
    result
}

/// Closes a socket's write direction. The peer observes end-of-stream once it drains any
/// buffered data.
#[cfg(target_os = "linux")]
fn shutdown_write(stream: &TcpStream) {
    use std::os::fd::AsRawFd;
    unsafe { libc::shutdown(stream.as_raw_fd(), libc::SHUT_WR) };
}

/// Closes a socket's read direction; any data the peer sends afterwards is discarded.
#[cfg(unix)]
fn shutdown_read(stream: &TcpStream) {
    use std::os::fd::AsRawFd;
    unsafe { libc::shutdown(stream.as_raw_fd(), libc::SHUT_RD) };
}

#[cfg(not(unix))]
fn shutdown_read(_stream: &TcpStream) {}
