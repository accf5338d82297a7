use crate::events::{
    CN_IDX_PROC, PROC_CN_MCAST_IGNORE, PROC_CN_MCAST_LISTEN, ProcEvent, decode_datagram,
    mcast_control_message,
};
use anyhow::{Context, Result};
use log::{debug, warn};
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};

const RECV_BUFFER_SIZE: usize = 16 * 1024;

/// Requested kernel-side receive buffer. Bursts of forks (e.g. a build) can
/// easily overflow the default one.
const SOCKET_RCVBUF: libc::c_int = 4 * 1024 * 1024;

/// Netlink socket subscribed to the kernel process connector.
///
/// Requires `CAP_NET_ADMIN`. The socket is non-blocking: callers are expected
/// to wait for readiness (e.g. with `poll(2)`) and then drain it with
/// [`ProcConnector::recv`] until it returns `Ok(None)`.
pub struct ProcConnector {
    fd: OwnedFd,
    port: u32,
    buf: Vec<u8>,
}

impl ProcConnector {
    /// Open the socket, join the process events group and ask the kernel to
    /// start multicasting events.
    pub fn open() -> Result<Self> {
        let raw = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_DGRAM | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
                libc::NETLINK_CONNECTOR,
            )
        };
        if raw < 0 {
            return Err(io::Error::last_os_error())
                .context("Failed to create the netlink connector socket");
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let port = std::process::id();
        let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        addr.nl_pid = port;
        addr.nl_groups = CN_IDX_PROC;

        let ret = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            return Err(io::Error::last_os_error())
                .context("Failed to bind the netlink connector socket (are you root?)");
        }

        let connector = Self {
            fd,
            port,
            buf: vec![0; RECV_BUFFER_SIZE],
        };
        connector.grow_receive_buffer();
        connector
            .send_control(PROC_CN_MCAST_LISTEN)
            .context("Failed to subscribe to process events")?;
        debug!("Listening to process events on netlink port {port}");

        Ok(connector)
    }

    fn grow_receive_buffer(&self) {
        let size = SOCKET_RCVBUF;
        let ret = unsafe {
            libc::setsockopt(
                self.fd.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_RCVBUF,
                &size as *const libc::c_int as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            warn!(
                "Failed to grow the netlink receive buffer: {}",
                io::Error::last_os_error()
            );
        }
    }

    fn send_control(&self, op: u32) -> io::Result<()> {
        let msg = mcast_control_message(op, self.port);
        let ret = unsafe {
            libc::send(
                self.fd.as_raw_fd(),
                msg.as_ptr() as *const libc::c_void,
                msg.len(),
                0,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Receive one datagram and decode the events it holds.
    ///
    /// Returns `Ok(None)` once the socket has nothing left to read. An
    /// `ENOBUFS` error means the kernel dropped events because the socket
    /// buffer was full; the socket stays usable.
    pub fn recv(&mut self) -> io::Result<Option<Vec<ProcEvent>>> {
        let ret = unsafe {
            libc::recv(
                self.fd.as_raw_fd(),
                self.buf.as_mut_ptr() as *mut libc::c_void,
                self.buf.len(),
                0,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(err);
        }

        Ok(Some(decode_datagram(&self.buf[..ret as usize])))
    }
}

impl AsFd for ProcConnector {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl Drop for ProcConnector {
    fn drop(&mut self) {
        if let Err(err) = self.send_control(PROC_CN_MCAST_IGNORE) {
            debug!("Failed to unsubscribe from process events: {err}");
        }
    }
}
