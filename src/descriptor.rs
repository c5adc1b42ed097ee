// message-preserving receive descriptor (a TAP fd, or a SOCK_SEQPACKET socket
// standing in for one). one readv returns at most one frame.

use {
    libc::{
        c_int, c_void, iovec, setsockopt, socketpair, AF_UNIX, SOCK_CLOEXEC, SOCK_NONBLOCK,
        SOCK_SEQPACKET, SOL_SOCKET, SO_RCVBUF,
    },
    std::{
        io::{self, Error},
        mem,
        os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    },
};

pub struct RxDescriptor {
    fd: OwnedFd,
}

impl RxDescriptor {
    pub fn from_fd(fd: OwnedFd) -> Self {
        RxDescriptor { fd }
    }

    /// a connected seqpacket pair: the receive side and the peer that
    /// injects frames into it. both ends are non-blocking.
    pub fn seqpacket_pair(recv_buf_size: usize) -> io::Result<(Self, OwnedFd)> {
        let mut fds = [0 as c_int; 2];
        unsafe {
            if socketpair(
                AF_UNIX,
                SOCK_SEQPACKET | SOCK_NONBLOCK | SOCK_CLOEXEC,
                0,
                fds.as_mut_ptr(),
            ) < 0
            {
                return Err(Error::last_os_error());
            }
            let rx = RxDescriptor {
                fd: OwnedFd::from_raw_fd(fds[0]),
            };
            let peer = OwnedFd::from_raw_fd(fds[1]);

            if recv_buf_size > 0 {
                rx.set_recv_buffer(recv_buf_size)?;
            }
            Ok((rx, peer))
        }
    }

    /// grow the kernel receive queue so bursts are not dropped
    pub fn set_recv_buffer(&self, size: usize) -> io::Result<()> {
        let val = size as c_int;
        unsafe {
            if setsockopt(
                self.fd.as_raw_fd(),
                SOL_SOCKET,
                SO_RCVBUF,
                &val as *const _ as *const c_void,
                mem::size_of::<c_int>() as u32,
            ) < 0
            {
                return Err(Error::last_os_error());
            }
        }
        Ok(())
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        unsafe {
            let flags = libc::fcntl(self.fd.as_raw_fd(), libc::F_GETFL);
            if flags < 0 {
                return Err(Error::last_os_error());
            }
            let flags = if nonblocking {
                flags | libc::O_NONBLOCK
            } else {
                flags & !libc::O_NONBLOCK
            };
            if libc::fcntl(self.fd.as_raw_fd(), libc::F_SETFL, flags) < 0 {
                return Err(Error::last_os_error());
            }
        }
        Ok(())
    }

    /// scatter one frame across `iov`. returns the bytes stored; a frame
    /// longer than the vector is cut at its total length.
    ///
    /// the caller guarantees every iovec points at writable memory of
    /// `iov_len` bytes.
    pub fn readv(&self, iov: &[iovec]) -> io::Result<usize> {
        let n = unsafe { libc::readv(self.fd.as_raw_fd(), iov.as_ptr(), iov.len() as c_int) };
        if n < 0 {
            Err(Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }
}

impl AsRawFd for RxDescriptor {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// send one frame on the injecting side of a descriptor pair
pub fn send_frame(fd: &impl AsRawFd, frame: &[u8]) -> io::Result<usize> {
    let n = unsafe {
        libc::send(
            fd.as_raw_fd(),
            frame.as_ptr() as *const c_void,
            frame.len(),
            libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL,
        )
    };
    if n < 0 {
        Err(Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seqpacket_keeps_message_boundaries() {
        let (rx, peer) = RxDescriptor::seqpacket_pair(0).unwrap();
        send_frame(&peer, &[1; 100]).unwrap();
        send_frame(&peer, &[2; 50]).unwrap();

        let mut a = [0u8; 64];
        let mut b = [0u8; 64];
        let iov = [
            iovec {
                iov_base: a.as_mut_ptr() as *mut c_void,
                iov_len: a.len(),
            },
            iovec {
                iov_base: b.as_mut_ptr() as *mut c_void,
                iov_len: b.len(),
            },
        ];
        assert_eq!(rx.readv(&iov).unwrap(), 100);
        assert_eq!(rx.readv(&iov).unwrap(), 50);
        assert_eq!(a[..50], [2; 50]);
        assert_eq!(b[..36], [1; 36]);

        let err = rx.readv(&iov).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_long_message_cut_at_vector_length() {
        let (rx, peer) = RxDescriptor::seqpacket_pair(0).unwrap();
        send_frame(&peer, &[7; 300]).unwrap();

        let mut a = [0u8; 128];
        let iov = [iovec {
            iov_base: a.as_mut_ptr() as *mut c_void,
            iov_len: a.len(),
        }];
        assert_eq!(rx.readv(&iov).unwrap(), 128);
        // the rest of the message is gone
        assert_eq!(rx.readv(&iov).unwrap_err().kind(), io::ErrorKind::WouldBlock);
    }
}
