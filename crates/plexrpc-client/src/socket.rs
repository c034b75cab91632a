//! Non-blocking Unix stream connections to services

use std::io::{self, IoSlice};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::sys::socket::{
    self, getsockopt, setsockopt, sockopt, AddressFamily, ControlMessage, MsgFlags, SockFlag,
    SockProtocol, SockType, UnixAddr,
};

use plexrpc_core::{Fault, FaultCode, FaultResult};

/// Send and receive buffer size set once a connection is up
pub const SOCKET_BUFFER: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectState {
    Connected,
    /// Completion is reported by writability
    InProgress,
}

/// One connection to a service
#[derive(Debug)]
pub struct Conn {
    fd: OwnedFd,
}

fn errno_fault(code: FaultCode, op: &str, err: Errno) -> Fault {
    Fault::from_io(code, op, &io::Error::from(err))
}

fn stream_socket() -> FaultResult<OwnedFd> {
    cfg_if::cfg_if! {
        if #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))] {
            socket::socket(
                AddressFamily::Unix,
                SockType::Stream,
                SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
                None::<SockProtocol>,
            )
            .map_err(|e| errno_fault(FaultCode::OpenSocketFailed, "socket", e))
        } else {
            use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};

            let fd = socket::socket(AddressFamily::Unix, SockType::Stream, SockFlag::empty(), None::<SockProtocol>)
                .map_err(|e| errno_fault(FaultCode::OpenSocketFailed, "socket", e))?;
            fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK))
                .map_err(|e| errno_fault(FaultCode::FcntlFailed, "fcntl(O_NONBLOCK)", e))?;
            fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
                .map_err(|e| errno_fault(FaultCode::FcntlFailed, "fcntl(FD_CLOEXEC)", e))?;

            let on: libc::c_int = 1;
            // Safety: valid socket and a correctly sized option value
            let rc = unsafe {
                libc::setsockopt(
                    fd.as_raw_fd(),
                    libc::SOL_SOCKET,
                    libc::SO_NOSIGPIPE,
                    &on as *const _ as *const libc::c_void,
                    std::mem::size_of_val(&on) as libc::socklen_t,
                )
            };
            if rc != 0 {
                return Err(Fault::last_os(FaultCode::SetsockoptFailed, "setsockopt(SO_NOSIGPIPE)"));
            }
            Ok(fd)
        }
    }
}

#[inline]
fn send_flags() -> MsgFlags {
    cfg_if::cfg_if! {
        if #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))] {
            MsgFlags::MSG_NOSIGNAL
        } else {
            MsgFlags::empty()
        }
    }
}

impl Conn {
    /// Start a connection to the socket at `path`
    pub fn connect(path: &str) -> FaultResult<(Conn, ConnectState)> {
        let addr = UnixAddr::new(path)
            .map_err(|e| errno_fault(FaultCode::ConnectFailed, &format!("connect to {}", path), e))?;
        let conn = Conn { fd: stream_socket()? };

        loop {
            match socket::connect(conn.fd.as_raw_fd(), &addr) {
                Ok(()) => {
                    conn.tune()?;
                    return Ok((conn, ConnectState::Connected));
                }
                Err(Errno::EINPROGRESS) => return Ok((conn, ConnectState::InProgress)),
                // A full listen backlog on a Unix socket; nothing is pending
                Err(Errno::EAGAIN) => {
                    return Err(errno_fault(
                        FaultCode::ConnectFailed,
                        &format!("connect to {} (backlog full)", path),
                        Errno::EAGAIN,
                    ))
                }
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    return Err(errno_fault(
                        FaultCode::ConnectFailed,
                        &format!("connect to {}", path),
                        e,
                    ))
                }
            }
        }
    }

    /// Outcome of a connect that reported `InProgress`, once writable
    pub fn finish_connect(&self) -> FaultResult<()> {
        let err = getsockopt(&self.fd, sockopt::SocketError)
            .map_err(|e| errno_fault(FaultCode::SeriousInternalOsError, "getsockopt(SO_ERROR)", e))?;
        if err != 0 {
            return Err(errno_fault(FaultCode::ConnectFailed, "connect", Errno::from_raw(err)));
        }
        self.tune()
    }

    fn tune(&self) -> FaultResult<()> {
        setsockopt(&self.fd, sockopt::SndBuf, &SOCKET_BUFFER)
            .map_err(|e| errno_fault(FaultCode::SetsockoptFailed, "setsockopt(SO_SNDBUF)", e))?;
        setsockopt(&self.fd, sockopt::RcvBuf, &SOCKET_BUFFER)
            .map_err(|e| errno_fault(FaultCode::SetsockoptFailed, "setsockopt(SO_RCVBUF)", e))?;
        Ok(())
    }

    /// Gather-write `slices`, passing `pass_fd` alongside when given.
    ///
    /// Short writes are normal; `WouldBlock` means wait for writability.
    pub fn send(&self, slices: &[IoSlice<'_>], pass_fd: Option<RawFd>) -> io::Result<usize> {
        let fds = pass_fd.map(|fd| [fd]);
        let rights;
        let cmsgs: &[ControlMessage<'_>] = match &fds {
            Some(fds) => {
                rights = [ControlMessage::ScmRights(fds)];
                &rights
            }
            None => &[],
        };
        socket::sendmsg(self.fd.as_raw_fd(), slices, cmsgs, send_flags(), None::<&UnixAddr>)
            .map_err(io::Error::from)
    }

    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        socket::recv(self.fd.as_raw_fd(), buf, MsgFlags::empty()).map_err(io::Error::from)
    }
}

impl AsRawFd for Conn {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl AsFd for Conn {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}
