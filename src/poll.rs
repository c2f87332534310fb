//! Readiness multiplexer.
//!
//! [`Poller`] is a thin wrapper around [`epoll(7)`]. File descriptors are
//! registered with an [`Interest`] and two mode flags:
//!
//!  * *edge-triggered*: readiness is reported once per transition, the
//!    consumer must drain the fd until `EAGAIN`.
//!  * *one-shot*: the registration is disabled after a single event until
//!    [`Poller::modify`] re-arms it. Client sockets use this to guarantee
//!    at most one worker touches a connection at a time.
//!
//! `Poller` is `Sync`: worker threads re-arm registrations through a shared
//! reference while the reactor is waiting, which `epoll` explicitly allows.
//!
//! [`epoll(7)`]: https://man7.org/linux/man-pages/man7/epoll.7.html

use std::io;
use std::os::fd::RawFd;
use std::ptr;
use std::time::Duration;

/// Readiness interest, a subset of `{readable, writable}`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Interest(u8);

impl Interest {
    pub const READABLE: Interest = Interest(1);
    pub const WRITABLE: Interest = Interest(2);

    pub const fn is_readable(self) -> bool {
        self.0 & Interest::READABLE.0 != 0
    }

    pub const fn is_writable(self) -> bool {
        self.0 & Interest::WRITABLE.0 != 0
    }

    /// Both interests combined.
    pub const fn add(self, other: Interest) -> Interest {
        Interest(self.0 | other.0)
    }
}

/// A single readiness event returned by [`Poller::wait`].
#[derive(Copy, Clone, Debug)]
pub struct Event {
    fd: RawFd,
    events: u32,
}

impl Event {
    /// The fd this event is for.
    pub const fn fd(&self) -> RawFd {
        self.fd
    }

    pub const fn is_readable(&self) -> bool {
        self.events & libc::EPOLLIN as u32 != 0
    }

    pub const fn is_writable(&self) -> bool {
        self.events & libc::EPOLLOUT as u32 != 0
    }

    /// The peer hung up. Reported regardless of the registered interest.
    pub const fn is_hangup(&self) -> bool {
        self.events & libc::EPOLLHUP as u32 != 0
    }

    /// An error condition on the fd. Reported regardless of the registered
    /// interest.
    pub const fn is_error(&self) -> bool {
        self.events & libc::EPOLLERR as u32 != 0
    }
}

/// Readiness multiplexer over an `epoll` instance.
#[derive(Debug)]
pub struct Poller {
    epoll: RawFd,
}

/// Maximum number of events retrieved in a single `wait` call.
const EVENT_CAPACITY: usize = 1024;

impl Poller {
    pub fn new() -> io::Result<Poller> {
        let epoll = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
        Ok(Poller { epoll })
    }

    /// Register `fd` with the given interest and modes.
    pub fn add(
        &self,
        fd: RawFd,
        interest: Interest,
        edge_triggered: bool,
        one_shot: bool,
    ) -> io::Result<()> {
        let mut event = to_epoll_event(fd, interest, edge_triggered, one_shot);
        syscall!(epoll_ctl(self.epoll, libc::EPOLL_CTL_ADD, fd, &mut event))?;
        Ok(())
    }

    /// Change the interest and modes of a registered `fd`.
    ///
    /// For a one-shot registration this re-arms the fd after an event was
    /// delivered.
    pub fn modify(
        &self,
        fd: RawFd,
        interest: Interest,
        edge_triggered: bool,
        one_shot: bool,
    ) -> io::Result<()> {
        let mut event = to_epoll_event(fd, interest, edge_triggered, one_shot);
        syscall!(epoll_ctl(self.epoll, libc::EPOLL_CTL_MOD, fd, &mut event))?;
        Ok(())
    }

    /// Remove `fd` from the set.
    ///
    /// Removing an fd that was already closed or never registered is a
    /// no-op: the kernel drops closed fds from the set on its own.
    pub fn remove(&self, fd: RawFd) -> io::Result<()> {
        match syscall!(epoll_ctl(self.epoll, libc::EPOLL_CTL_DEL, fd, ptr::null_mut())) {
            Ok(_) => Ok(()),
            Err(ref err) if matches!(err.raw_os_error(), Some(libc::ENOENT | libc::EBADF)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Wait for readiness, filling `events`.
    ///
    /// `events` is cleared first and left empty when the timeout expires.
    /// An interrupted wait (`EINTR`) also returns an empty list; callers
    /// treat it like a timeout and retry on the next loop iteration.
    pub fn wait(&self, events: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<()> {
        events.clear();
        let timeout = timeout.map_or(-1, |t| t.as_millis().min(i32::MAX as u128) as i32);
        let mut raw = [libc::epoll_event { events: 0, u64: 0 }; EVENT_CAPACITY];
        let n = match syscall!(epoll_wait(self.epoll, raw.as_mut_ptr(), raw.len() as i32, timeout)) {
            Ok(n) => n as usize,
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => 0,
            Err(err) => return Err(err),
        };
        for event in &raw[..n] {
            events.push(Event {
                // Fields of a packed struct can't be borrowed, copy them out.
                fd: { event.u64 } as RawFd,
                events: { event.events },
            });
        }
        Ok(())
    }
}

fn to_epoll_event(fd: RawFd, interest: Interest, edge_triggered: bool, one_shot: bool) -> libc::epoll_event {
    let mut events = 0;
    if interest.is_readable() {
        events |= libc::EPOLLIN as u32;
    }
    if interest.is_writable() {
        events |= libc::EPOLLOUT as u32;
    }
    if edge_triggered {
        events |= libc::EPOLLET as u32;
    }
    if one_shot {
        events |= libc::EPOLLONESHOT as u32;
    }
    libc::epoll_event { events, u64: fd as u64 }
}

impl Drop for Poller {
    fn drop(&mut self) {
        let _ = syscall!(close(self.epoll));
    }
}
