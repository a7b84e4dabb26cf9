// src/syscalls.rs
use crate::error::ServerResult;
use libc::{c_int, c_void, socklen_t};
use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::unix::io::RawFd;
use std::ptr;

/// Large backlog so an accept storm never bounces on the listen queue.
pub const LISTEN_BACKLOG: c_int = 4096;

// ---- Socket operations ----

/// Create a non-blocking TCP listening socket with address and port reuse
/// enabled, bound and listening on `addr`.
pub fn create_listen_socket(addr: &SocketAddr) -> ServerResult<RawFd> {
    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };

    unsafe {
        let fd = libc::socket(
            domain,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        );
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        let one: c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        ) < 0
            || libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEPORT,
                &one as *const _ as *const c_void,
                mem::size_of_val(&one) as socklen_t,
            ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        bind_addr(fd, addr)?;

        if libc::listen(fd, LISTEN_BACKLOG) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        Ok(fd)
    }
}

fn bind_addr(fd: c_int, addr: &SocketAddr) -> ServerResult<()> {
    unsafe {
        let rc = match addr {
            SocketAddr::V4(a) => {
                let sin = libc::sockaddr_in {
                    sin_family: libc::AF_INET as libc::sa_family_t,
                    sin_port: a.port().to_be(),
                    sin_addr: libc::in_addr {
                        s_addr: u32::from_ne_bytes(a.ip().octets()),
                    },
                    sin_zero: [0; 8],
                };
                libc::bind(
                    fd,
                    &sin as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin) as socklen_t,
                )
            }
            SocketAddr::V6(a) => {
                let sin6 = libc::sockaddr_in6 {
                    sin6_family: libc::AF_INET6 as libc::sa_family_t,
                    sin6_port: a.port().to_be(),
                    sin6_flowinfo: a.flowinfo(),
                    sin6_addr: libc::in6_addr {
                        s6_addr: a.ip().octets(),
                    },
                    sin6_scope_id: a.scope_id(),
                };
                libc::bind(
                    fd,
                    &sin6 as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin6) as socklen_t,
                )
            }
        };

        if rc < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }
        Ok(())
    }
}

/// Accept one pending connection. `Ok(None)` means the accept queue is
/// drained; callers loop until they see it.
pub fn accept_connection(listen_fd: RawFd) -> ServerResult<Option<(RawFd, SocketAddr)>> {
    unsafe {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;

        let fd = libc::accept4(
            listen_fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        );

        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err.into())
            }
        } else {
            let peer = sockaddr_to_std(&storage)
                .unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));
            Ok(Some((fd, peer)))
        }
    }
}

/// Local address of a bound socket; lets callers bind port 0 and discover
/// the kernel-assigned port.
pub fn local_addr(fd: RawFd) -> io::Result<SocketAddr> {
    unsafe {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
        if libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) < 0 {
            return Err(io::Error::last_os_error());
        }
        sockaddr_to_std(&storage)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "unsupported address family"))
    }
}

fn sockaddr_to_std(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            Some(SocketAddr::new(IpAddr::V4(ip), u16::from_be(sin.sin_port)))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::new(IpAddr::V6(ip), u16::from_be(sin6.sin6_port)))
        }
        _ => None,
    }
}

pub fn recv(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut c_void, buf.len(), 0) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

/// Send with `MSG_NOSIGNAL`: a broken pipe comes back as an error return
/// instead of a process-wide SIGPIPE.
pub fn send(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let n = unsafe { libc::send(fd, buf.as_ptr() as *const c_void, buf.len(), libc::MSG_NOSIGNAL) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

pub fn close(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

pub fn ignore_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

// ---- Epoll operations ----

/// Thin wrapper over the kernel epoll instance. `epoll_ctl` calls are safe
/// to issue concurrently from the reactor and worker threads.
pub struct Epoll {
    fd: RawFd,
}

const READ_EDGE: u32 = (libc::EPOLLIN | libc::EPOLLET) as u32;
const READ_ONESHOT: u32 = (libc::EPOLLIN | libc::EPOLLET | libc::EPOLLONESHOT) as u32;

impl Epoll {
    pub fn new() -> ServerResult<Self> {
        unsafe {
            let fd = libc::epoll_create1(libc::EPOLL_CLOEXEC);
            if fd < 0 {
                return Err(io::Error::last_os_error().into());
            }
            Ok(Self { fd })
        }
    }

    fn ctl(&self, op: c_int, fd: RawFd, events: u32) -> ServerResult<()> {
        let mut event = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        unsafe {
            if libc::epoll_ctl(self.fd, op, fd, &mut event) < 0 {
                return Err(io::Error::last_os_error().into());
            }
        }
        Ok(())
    }

    /// Register for edge-triggered read-readiness (the listening socket).
    pub fn register_read(&self, fd: RawFd) -> ServerResult<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, READ_EDGE)
    }

    /// Register a client fd edge-triggered AND one-shot: after one event the
    /// fd stays disarmed until `rearm`, so at most one worker ever handles it.
    pub fn register_oneshot(&self, fd: RawFd) -> ServerResult<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, READ_ONESHOT)
    }

    /// Re-enable a one-shot fd. The kernel re-checks readiness on MOD, so
    /// data that arrived while disarmed still produces an event.
    pub fn rearm(&self, fd: RawFd) -> ServerResult<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, READ_ONESHOT)
    }

    /// Remove an fd. ENOENT/EBADF are ignored: the fd may already be gone.
    pub fn deregister(&self, fd: RawFd) -> ServerResult<()> {
        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ENOENT)
                    && err.raw_os_error() != Some(libc::EBADF)
                {
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }

    /// Block for ready events, at most `timeout_ms`. EINTR reads as zero
    /// events so the caller's loop re-checks its running flag.
    pub fn wait(&self, events: &mut [libc::epoll_event], timeout_ms: i32) -> ServerResult<usize> {
        unsafe {
            let n = libc::epoll_wait(
                self.fd,
                events.as_mut_ptr(),
                events.len() as c_int,
                timeout_ms,
            );
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    return Ok(0);
                }
                return Err(err.into());
            }
            Ok(n as usize)
        }
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_socket_binds_and_reports_port() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let fd = create_listen_socket(&addr).unwrap();
        let local = local_addr(fd).unwrap();
        assert!(local.port() > 0);
        assert!(local.ip().is_loopback());
        close(fd);
    }

    #[test]
    fn accept_on_idle_listener_would_block() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let fd = create_listen_socket(&addr).unwrap();
        assert!(accept_connection(fd).unwrap().is_none());
        close(fd);
    }

    #[test]
    fn epoll_wait_times_out_with_no_events() {
        let epoll = Epoll::new().unwrap();
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; 8];
        assert_eq!(epoll.wait(&mut events, 0).unwrap(), 0);
    }

    #[test]
    fn deregister_unknown_fd_is_ignored() {
        let epoll = Epoll::new().unwrap();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let fd = create_listen_socket(&addr).unwrap();
        // never registered; DEL reports ENOENT which deregister swallows
        assert!(epoll.deregister(fd).is_ok());
        close(fd);
    }
}
