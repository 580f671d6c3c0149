//! Raw transport to the kernel's connector: a blocking netlink datagram
//! socket. Concurrency is supplied by the listener, which is the only
//! reader; the facade owns the socket and closes it to cancel a blocked
//! receive.

use std::mem;
use std::sync::atomic::{AtomicI32, Ordering};

use nix::errno::Errno;
use thiserror::Error;

use crate::codec;

/// One page is enough for the largest process-event datagram.
pub const RECV_BUFFER_SIZE: usize = 4096;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("creating netlink connector socket")]
    Open(#[source] Errno),
    #[error("binding netlink socket for pid {pid}")]
    Bind {
        #[source]
        source: Errno,
        pid: u32,
    },
    #[error("sending control message")]
    Send(#[source] Errno),
    #[error("partial send ({sent} of {len} bytes)")]
    ShortSend { sent: usize, len: usize },
    #[error("receiving datagram")]
    Recv(#[source] Errno),
    #[error("socket closed")]
    Closed,
}

/// A datagram socket on the kernel-control netlink family, speaking the
/// connector protocol. The descriptor is swapped to a sentinel on close so
/// that close is idempotent and a receive blocked on another thread
/// surfaces [`TransportError::Closed`] instead of touching a dead fd.
pub struct ConnectorSocket {
    fd: AtomicI32,
}

impl ConnectorSocket {
    pub fn open() -> Result<Self, TransportError> {
        let fd = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_DGRAM | libc::SOCK_CLOEXEC,
                libc::NETLINK_CONNECTOR,
            )
        };
        if fd < 0 {
            return Err(TransportError::Open(Errno::last()));
        }
        Ok(Self {
            fd: AtomicI32::new(fd),
        })
    }

    /// Bind the unicast address (`nl_pid` = our process id) and join the
    /// process-events multicast group. Requires CAP_NET_ADMIN.
    pub fn bind(&self, pid: u32) -> Result<(), TransportError> {
        let fd = self.raw()?;
        let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        addr.nl_pid = pid;
        addr.nl_groups = codec::CN_IDX_PROC;
        let ret = unsafe {
            libc::bind(
                fd,
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(TransportError::Bind {
                source: Errno::last(),
                pid,
            });
        }
        Ok(())
    }

    /// Send one datagram to the kernel unicast address (pid 0, no groups).
    pub fn send(&self, bytes: &[u8]) -> Result<(), TransportError> {
        let fd = self.raw()?;
        let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        let sent = unsafe {
            libc::sendto(
                fd,
                bytes.as_ptr() as *const libc::c_void,
                bytes.len(),
                0,
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if sent < 0 {
            return Err(TransportError::Send(Errno::last()));
        }
        if sent as usize != bytes.len() {
            return Err(TransportError::ShortSend {
                sent: sent as usize,
                len: bytes.len(),
            });
        }
        Ok(())
    }

    /// Block until one datagram arrives and return the bytes read.
    pub fn recv(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let fd = self.raw()?;
        let read = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
        if read < 0 {
            let errno = Errno::last();
            // A close on another thread invalidated the fd under us.
            if self.fd.load(Ordering::SeqCst) < 0 {
                return Err(TransportError::Closed);
            }
            return Err(TransportError::Recv(errno));
        }
        Ok(read as usize)
    }

    /// Close the descriptor. Idempotent; unblocks an in-flight recv.
    pub fn close(&self) {
        let fd = self.fd.swap(-1, Ordering::SeqCst);
        if fd >= 0 {
            unsafe { libc::close(fd) };
        }
    }

    fn raw(&self) -> Result<i32, TransportError> {
        let fd = self.fd.load(Ordering::SeqCst);
        if fd < 0 {
            return Err(TransportError::Closed);
        }
        Ok(fd)
    }
}

impl Drop for ConnectorSocket {
    fn drop(&mut self) {
        self.close();
    }
}
