//! Zero-copy transfer between two TCP sockets using `splice(2)`.
//!
//! Each relay direction owns a non-blocking pipe; bytes move socket → pipe →
//! socket entirely inside the kernel. Readiness is driven through tokio's
//! [`TcpStream::async_io`], so a `WouldBlock` from either splice suspends the
//! task until the corresponding socket is ready again.

use std::{
    io::{self, Error, ErrorKind},
    os::fd::{AsRawFd, RawFd},
    ptr,
};

use tokio::{io::Interest, net::TcpStream};

/// The maximum byte count requested per splice call. The pipe's default capacity is 64 KiB;
/// staying at or below it guarantees the fill step never blocks on a full pipe.
const SPLICE_CHUNK: usize = 64 * 1024;

/// A non-blocking pipe serving as the kernel-side intermediary for one relay direction.
pub struct Pipe {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl Pipe {
    pub fn new() -> io::Result<Self> {
        let mut fds = [0 as RawFd; 2];
        let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };

        match ret {
            0 => Ok(Self {
                read_fd: fds[0],
                write_fd: fds[1],
            }),
            _ => Err(Error::last_os_error()),
        }
    }
}

impl Drop for Pipe {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

fn splice(fd_in: RawFd, fd_out: RawFd, len: usize) -> io::Result<usize> {
    let ret = unsafe {
        libc::splice(
            fd_in,
            ptr::null_mut(),
            fd_out,
            ptr::null_mut(),
            len,
            libc::SPLICE_F_MOVE | libc::SPLICE_F_NONBLOCK,
        )
    };

    match ret {
        r if r < 0 => Err(Error::last_os_error()),
        r => Ok(r as usize),
    }
}

/// Copies bytes from `src` to `dst` through `pipe` until `src` reaches end-of-stream or either
/// socket errors. Returns the number of bytes moved. The caller is responsible for the
/// half-close of both sockets afterwards.
pub async fn splice_copy(src: &TcpStream, dst: &TcpStream, pipe: &Pipe) -> io::Result<u64> {
    let src_fd = src.as_raw_fd();
    let dst_fd = dst.as_raw_fd();
    let mut total = 0u64;

    loop {
        // Fill: socket → pipe. The pipe is always empty here, so a WouldBlock can only mean the
        // socket has no data yet; async_io then waits for read readiness and retries.
        let filled = src.async_io(Interest::READABLE, || splice(src_fd, pipe.write_fd, SPLICE_CHUNK)).await?;
        if filled == 0 {
            break;
        }

        // Drain: pipe → socket, until everything the fill step moved is flushed out.
        let mut remaining = filled;
        while remaining > 0 {
            let drained = dst.async_io(Interest::WRITABLE, || splice(pipe.read_fd, dst_fd, remaining)).await?;
            if drained == 0 {
                return Err(Error::new(ErrorKind::WriteZero, "splice returned zero while draining pipe"));
            }

            remaining -= drained;
        }

        total += filled as u64;
    }

    Ok(total)
}
