//! Readiness multiplexer: a thin wrapper over epoll.
//!
//! Connection fds are registered edge-triggered and one-shot, so a
//! connection is owned by at most one worker at a time; the fd is rearmed
//! only after the worker finishes a service round. The accept socket is
//! edge-triggered but persistent.

use std::io;
use std::os::fd::RawFd;

use nix::errno::Errno;

/// Events reported for connection fds that mean the peer is gone.
pub const EV_CLOSED: u32 =
    (libc::EPOLLRDHUP | libc::EPOLLHUP | libc::EPOLLERR) as u32;

pub struct Reactor {
    epfd: RawFd,
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        let epfd = Errno::result(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })
            .map_err(io::Error::from)?;
        Ok(Self { epfd })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        let event_ptr = if op == libc::EPOLL_CTL_DEL {
            std::ptr::null_mut()
        } else {
            &mut event as *mut libc::epoll_event
        };
        Errno::result(unsafe { libc::epoll_ctl(self.epfd, op, fd, event_ptr) })
            .map(drop)
            .map_err(io::Error::from)
    }

    pub fn add(&self, fd: RawFd, one_shot: bool) -> io::Result<()> {
        let mut events = (libc::EPOLLIN | libc::EPOLLET | libc::EPOLLRDHUP) as u32;
        if one_shot {
            events |= libc::EPOLLONESHOT as u32;
        }
        self.ctl(libc::EPOLL_CTL_ADD, fd, events)
    }

    /// Rearm a one-shot fd for the next service round.
    pub fn rearm(&self, fd: RawFd, writable: bool) -> io::Result<()> {
        let mut events =
            (libc::EPOLLIN | libc::EPOLLET | libc::EPOLLRDHUP | libc::EPOLLONESHOT) as u32;
        if writable {
            events |= libc::EPOLLOUT as u32;
        }
        self.ctl(libc::EPOLL_CTL_MOD, fd, events)
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, 0)
    }

    /// Wait for readiness. EINTR reports zero events so the caller can
    /// check its stop flag.
    pub fn wait(&self, events: &mut [libc::epoll_event], timeout_ms: i32) -> io::Result<usize> {
        let ret = unsafe {
            libc::epoll_wait(
                self.epfd,
                events.as_mut_ptr(),
                events.len() as libc::c_int,
                timeout_ms,
            )
        };
        match Errno::result(ret) {
            Ok(n) => Ok(n as usize),
            Err(Errno::EINTR) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        unsafe { libc::close(self.epfd) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::os::fd::AsRawFd;

    fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    fn empty_events() -> Vec<libc::epoll_event> {
        vec![libc::epoll_event { events: 0, u64: 0 }; 16]
    }

    #[test]
    fn reports_readable_fd() {
        let reactor = Reactor::new().unwrap();
        let (mut client, server) = connected_pair();
        reactor.add(server.as_raw_fd(), true).unwrap();

        let mut events = empty_events();
        assert_eq!(reactor.wait(&mut events, 0).unwrap(), 0);

        client.write_all(b"ping").unwrap();
        assert_eq!(reactor.wait(&mut events, 1000).unwrap(), 1);
        let fd = events[0].u64 as RawFd;
        assert_eq!(fd, server.as_raw_fd());
        assert_ne!(events[0].events & libc::EPOLLIN as u32, 0);
    }

    #[test]
    fn one_shot_fires_once_until_rearmed() {
        let reactor = Reactor::new().unwrap();
        let (mut client, server) = connected_pair();
        reactor.add(server.as_raw_fd(), true).unwrap();

        client.write_all(b"a").unwrap();
        let mut events = empty_events();
        assert_eq!(reactor.wait(&mut events, 1000).unwrap(), 1);

        // Unserviced data does not re-report until the fd is rearmed.
        assert_eq!(reactor.wait(&mut events, 50).unwrap(), 0);
        reactor.rearm(server.as_raw_fd(), false).unwrap();
        assert_eq!(reactor.wait(&mut events, 1000).unwrap(), 1);
    }

    #[test]
    fn peer_close_reports_rdhup() {
        let reactor = Reactor::new().unwrap();
        let (client, server) = connected_pair();
        reactor.add(server.as_raw_fd(), true).unwrap();

        drop(client);
        let mut events = empty_events();
        assert_eq!(reactor.wait(&mut events, 1000).unwrap(), 1);
        assert_ne!(events[0].events & EV_CLOSED, 0);
    }

    #[test]
    fn deleted_fd_is_silent() {
        let reactor = Reactor::new().unwrap();
        let (mut client, server) = connected_pair();
        reactor.add(server.as_raw_fd(), false).unwrap();
        reactor.delete(server.as_raw_fd()).unwrap();

        client.write_all(b"a").unwrap();
        let mut events = empty_events();
        assert_eq!(reactor.wait(&mut events, 50).unwrap(), 0);
    }
}
