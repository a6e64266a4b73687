//! Non-blocking UDP endpoint with ECN and path-MTU handling.
//!
//! Datagram sends and receives are the transport's only suspension
//! points: when the kernel reports would-block the calling task parks on
//! readiness with an optional absolute deadline. A timed-out wait is a
//! zero-byte result, not an error, so expiry handling stays in the
//! caller.
//!
//! The ECN codepoint is applied with one `setsockopt` per change and read
//! back from the TOS / traffic-class control message on every receive.

use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Mutex;

use socket2::{Domain, Protocol, SockAddr, Type};
use thiserror::Error;
use tokio::io::unix::{AsyncFd, AsyncFdReadyGuard};
use tokio::sync::Notify;

use cairn_core::{Ecn, Family, Timestamp};

/// Largest datagram the endpoint will read in one receive.
pub const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum SocketError {
    #[error("failed to open socket: {0}")]
    Open(#[source] io::Error),

    #[error("failed to bind to {address}: {source}")]
    Bind {
        address: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("send failed: {0}")]
    Send(#[source] io::Error),

    #[error("receive failed: {0}")]
    Receive(#[source] io::Error),

    #[error("socket is closed")]
    Closed,
}

/// One received datagram.
#[derive(Debug, Clone, Copy)]
pub struct Received {
    pub len: usize,
    pub remote: SocketAddr,
    pub ecn: Ecn,
}

/// A non-blocking UDP socket. Move-only; shared by `Arc` where a path
/// needs to reference it.
pub struct Socket {
    inner: AsyncFd<socket2::Socket>,
    family: Family,
    local: Mutex<Option<SocketAddr>>,
    remote: Mutex<Option<SocketAddr>>,
    last_ecn: AtomicU8,
    closed: AtomicBool,
    close_signal: Notify,
}

impl Socket {
    /// Create an unbound non-blocking UDP socket with receive-side ECN
    /// and path-MTU discovery enabled.
    pub fn new(family: Family) -> Result<Self, SocketError> {
        let domain = match family {
            Family::V4 => Domain::IPV4,
            Family::V6 => Domain::IPV6,
            Family::Unspecified => {
                return Err(SocketError::Open(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "socket requires a concrete address family",
                )))
            }
        };

        let socket =
            socket2::Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).map_err(SocketError::Open)?;
        socket.set_nonblocking(true).map_err(SocketError::Open)?;
        enable_recv_ecn(&socket, family).map_err(SocketError::Open)?;
        enable_pmtu_discovery(&socket, family).map_err(SocketError::Open)?;

        let inner = AsyncFd::new(socket).map_err(SocketError::Open)?;

        Ok(Socket {
            inner,
            family,
            local: Mutex::new(None),
            remote: Mutex::new(None),
            last_ecn: AtomicU8::new(Ecn::NotEct.as_u8()),
            closed: AtomicBool::new(false),
            close_signal: Notify::new(),
        })
    }

    /// Create a socket bound to `address`.
    pub fn bound(address: SocketAddr) -> Result<Self, SocketError> {
        let socket = Self::new(Family::of(&address))?;
        socket.bind(address)?;
        Ok(socket)
    }

    /// Create a socket connected to `address`.
    pub fn connected(address: SocketAddr) -> Result<Self, SocketError> {
        let socket = Self::new(Family::of(&address))?;
        socket.connect(address)?;
        Ok(socket)
    }

    pub fn bind(&self, address: SocketAddr) -> Result<(), SocketError> {
        self.inner
            .get_ref()
            .bind(&SockAddr::from(address))
            .map_err(|source| SocketError::Bind { address, source })?;
        self.refresh_local();
        Ok(())
    }

    pub fn connect(&self, address: SocketAddr) -> Result<(), SocketError> {
        self.inner
            .get_ref()
            .connect(&SockAddr::from(address))
            .map_err(|source| SocketError::Connect { address, source })?;
        self.refresh_local();
        *self.remote.lock().expect("address lock") = Some(address);
        Ok(())
    }

    fn refresh_local(&self) {
        let local = self
            .inner
            .get_ref()
            .local_addr()
            .ok()
            .and_then(|address| address.as_socket());
        *self.local.lock().expect("address lock") = local;
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local.lock().expect("address lock")
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        *self.remote.lock().expect("address lock")
    }

    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    /// Close the socket. Idempotent; any task parked in a send or receive
    /// wait unwinds with [`SocketError::Closed`]. The descriptor itself is
    /// released on drop.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.close_signal.notify_waiters();
        }
    }

    /// Send one datagram to `destination` marked with `ecn`.
    ///
    /// Suspends on a writable wait if the kernel would block, up to the
    /// absolute `deadline`; returns `Ok(0)` when the deadline elapses.
    /// `EINTR` is retried.
    pub async fn send_packet(
        &self,
        data: &[u8],
        destination: SocketAddr,
        ecn: Ecn,
        deadline: Option<Timestamp>,
    ) -> Result<usize, SocketError> {
        self.set_ecn(ecn).map_err(SocketError::Send)?;
        // A connected socket rejects an explicit destination on some
        // platforms (EISCONN), so use the connected fast path for the
        // peer address.
        let connected = self.remote_addr() == Some(destination);
        let destination = SockAddr::from(destination);
        loop {
            let Some(mut guard) = self.writable(deadline).await? else {
                return Ok(0);
            };
            let result = guard.try_io(|inner| {
                if connected {
                    inner.get_ref().send(data)
                } else {
                    inner.get_ref().send_to(data, &destination)
                }
            });
            match result {
                Ok(Ok(sent)) => return Ok(sent),
                Ok(Err(error)) if error.kind() == io::ErrorKind::Interrupted => continue,
                Ok(Err(error)) => return Err(SocketError::Send(error)),
                Err(_would_block) => continue,
            }
        }
    }

    /// Receive one datagram and its ECN codepoint.
    ///
    /// Suspends on a readable wait, up to the absolute `deadline`;
    /// returns `Ok(None)` when the deadline elapses.
    pub async fn receive_packet(
        &self,
        buffer: &mut [u8],
        deadline: Option<Timestamp>,
    ) -> Result<Option<Received>, SocketError> {
        loop {
            let Some(mut guard) = self.readable(deadline).await? else {
                return Ok(None);
            };
            let family = self.family;
            match guard.try_io(|inner| recvmsg_ecn(inner.get_ref(), buffer, family)) {
                Ok(Ok(received)) => return Ok(Some(received)),
                Ok(Err(error)) if error.kind() == io::ErrorKind::Interrupted => continue,
                Ok(Err(error)) => return Err(SocketError::Receive(error)),
                Err(_would_block) => continue,
            }
        }
    }

    async fn writable(
        &self,
        deadline: Option<Timestamp>,
    ) -> Result<Option<AsyncFdReadyGuard<'_, socket2::Socket>>, SocketError> {
        let notified = self.close_signal.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.closed.load(Ordering::Acquire) {
            return Err(SocketError::Closed);
        }
        let wait = async {
            tokio::select! {
                guard = self.inner.writable() => guard.map(Some).map_err(SocketError::Send),
                _ = &mut notified => Err(SocketError::Closed),
            }
        };
        match deadline {
            Some(deadline) => {
                let instant = tokio::time::Instant::from_std(deadline.as_instant());
                match tokio::time::timeout_at(instant, wait).await {
                    Ok(result) => result,
                    Err(_elapsed) => Ok(None),
                }
            }
            None => wait.await,
        }
    }

    async fn readable(
        &self,
        deadline: Option<Timestamp>,
    ) -> Result<Option<AsyncFdReadyGuard<'_, socket2::Socket>>, SocketError> {
        let notified = self.close_signal.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.closed.load(Ordering::Acquire) {
            return Err(SocketError::Closed);
        }
        let wait = async {
            tokio::select! {
                guard = self.inner.readable() => guard.map(Some).map_err(SocketError::Receive),
                _ = &mut notified => Err(SocketError::Closed),
            }
        };
        match deadline {
            Some(deadline) => {
                let instant = tokio::time::Instant::from_std(deadline.as_instant());
                match tokio::time::timeout_at(instant, wait).await {
                    Ok(result) => result,
                    Err(_elapsed) => Ok(None),
                }
            }
            None => wait.await,
        }
    }

    fn set_ecn(&self, ecn: Ecn) -> io::Result<()> {
        let value = ecn.as_u8();
        if self.last_ecn.load(Ordering::Relaxed) == value {
            return Ok(());
        }
        let fd = self.inner.get_ref().as_raw_fd();
        match self.family {
            Family::V4 => set_option(fd, libc::IPPROTO_IP, libc::IP_TOS, value as libc::c_int)?,
            Family::V6 => set_option(
                fd,
                libc::IPPROTO_IPV6,
                libc::IPV6_TCLASS,
                value as libc::c_int,
            )?,
            Family::Unspecified => unreachable!("constructor requires a concrete family"),
        }
        self.last_ecn.store(value, Ordering::Relaxed);
        Ok(())
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("local", &self.local_addr())
            .field("remote", &self.remote_addr())
            .field("open", &self.is_open())
            .finish()
    }
}

fn set_option(
    fd: std::os::fd::RawFd,
    level: libc::c_int,
    name: libc::c_int,
    value: libc::c_int,
) -> io::Result<()> {
    let result = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            (&value as *const libc::c_int).cast(),
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if result == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn enable_recv_ecn(socket: &socket2::Socket, family: Family) -> io::Result<()> {
    let fd = socket.as_raw_fd();
    match family {
        Family::V4 => set_option(fd, libc::IPPROTO_IP, libc::IP_RECVTOS, 1),
        Family::V6 => set_option(fd, libc::IPPROTO_IPV6, libc::IPV6_RECVTCLASS, 1),
        Family::Unspecified => Ok(()),
    }
}

#[cfg(target_os = "linux")]
fn enable_pmtu_discovery(socket: &socket2::Socket, family: Family) -> io::Result<()> {
    let fd = socket.as_raw_fd();
    match family {
        Family::V4 => set_option(
            fd,
            libc::IPPROTO_IP,
            libc::IP_MTU_DISCOVER,
            libc::IP_PMTUDISC_DO,
        ),
        Family::V6 => set_option(
            fd,
            libc::IPPROTO_IPV6,
            libc::IPV6_MTU_DISCOVER,
            libc::IPV6_PMTUDISC_DO,
        ),
        Family::Unspecified => Ok(()),
    }
}

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
fn enable_pmtu_discovery(socket: &socket2::Socket, family: Family) -> io::Result<()> {
    let fd = socket.as_raw_fd();
    match family {
        Family::V4 => set_option(fd, libc::IPPROTO_IP, libc::IP_DONTFRAG, 1),
        Family::V6 => set_option(fd, libc::IPPROTO_IPV6, libc::IPV6_DONTFRAG, 1),
        Family::Unspecified => Ok(()),
    }
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd"
)))]
fn enable_pmtu_discovery(_socket: &socket2::Socket, _family: Family) -> io::Result<()> {
    Ok(())
}

/// `recvmsg` with a control buffer large enough for the TOS / traffic
/// class ancillary data.
fn recvmsg_ecn(socket: &socket2::Socket, buffer: &mut [u8], family: Family) -> io::Result<Received> {
    let fd = socket.as_raw_fd();

    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut iov = libc::iovec {
        iov_base: buffer.as_mut_ptr().cast(),
        iov_len: buffer.len(),
    };
    let mut control = [0u8; 64];

    let mut message: libc::msghdr = unsafe { mem::zeroed() };
    message.msg_name = (&mut storage as *mut libc::sockaddr_storage).cast();
    message.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    message.msg_iov = &mut iov;
    message.msg_iovlen = 1;
    message.msg_control = control.as_mut_ptr().cast();
    message.msg_controllen = mem::size_of_val(&control) as _;

    let length = unsafe { libc::recvmsg(fd, &mut message, 0) };
    if length < 0 {
        return Err(io::Error::last_os_error());
    }

    let remote = unsafe { SockAddr::new(storage, message.msg_namelen) }
        .as_socket()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "non-IP sender address"))?;
    let ecn = parse_ecn(&message, family);

    Ok(Received {
        len: length as usize,
        remote,
        ecn,
    })
}

fn parse_ecn(message: &libc::msghdr, family: Family) -> Ecn {
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(message);
        while !cmsg.is_null() {
            let header = &*cmsg;
            let wanted = match family {
                Family::V4 => {
                    header.cmsg_level == libc::IPPROTO_IP && header.cmsg_type == libc::IP_TOS
                }
                Family::V6 => {
                    header.cmsg_level == libc::IPPROTO_IPV6 && header.cmsg_type == libc::IPV6_TCLASS
                }
                Family::Unspecified => false,
            };
            if wanted {
                let data = libc::CMSG_DATA(cmsg);
                // IPV6_TCLASS arrives as an int, IP_TOS as a single byte;
                // the codepoint is in the low bits either way.
                let int_len = libc::CMSG_LEN(mem::size_of::<libc::c_int>() as u32) as usize;
                let byte = if header.cmsg_len as usize >= int_len {
                    (data.cast::<libc::c_int>().read_unaligned() & 0xff) as u8
                } else {
                    data.read()
                };
                return Ecn::from_tos(byte);
            }
            cmsg = libc::CMSG_NXTHDR(message, cmsg);
        }
    }
    Ecn::NotEct
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn send_and_receive_with_ecn() {
        let receiver = Socket::bound(loopback()).unwrap();
        let receiver_addr = receiver.local_addr().unwrap();
        let sender = Socket::connected(receiver_addr).unwrap();

        let sent = sender
            .send_packet(b"datagram", receiver_addr, Ecn::Ect0, None)
            .await
            .unwrap();
        assert_eq!(sent, 8);

        let mut buffer = [0u8; 64];
        let received = receiver
            .receive_packet(&mut buffer, None)
            .await
            .unwrap()
            .expect("datagram expected");
        assert_eq!(&buffer[..received.len], b"datagram");
        assert_eq!(received.remote, sender.local_addr().unwrap());
        assert_eq!(received.ecn, Ecn::Ect0);
    }

    #[tokio::test]
    async fn receive_times_out_with_zero_bytes() {
        let socket = Socket::bound(loopback()).unwrap();
        let deadline = Timestamp::now() + Duration::from_millis(20);
        let mut buffer = [0u8; 64];
        let received = socket.receive_packet(&mut buffer, Some(deadline)).await.unwrap();
        assert!(received.is_none());
    }

    #[tokio::test]
    async fn close_wakes_parked_receiver() {
        let socket = Arc::new(Socket::bound(loopback()).unwrap());
        let parked = socket.clone();
        let task = tokio::spawn(async move {
            let mut buffer = [0u8; 64];
            parked.receive_packet(&mut buffer, None).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        socket.close();
        socket.close(); // idempotent

        let result = task.await.unwrap();
        assert!(matches!(result, Err(SocketError::Closed)));
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let receiver = Socket::bound(loopback()).unwrap();
        let target = receiver.local_addr().unwrap();
        let sender = Socket::connected(target).unwrap();
        sender.close();
        let result = sender.send_packet(b"x", target, Ecn::NotEct, None).await;
        assert!(matches!(result, Err(SocketError::Closed)));
    }
}
