use crate::error::SocketError;
use std::mem;
use std::os::unix::io::RawFd;

/// Events fetched per poller wait.
pub(crate) const EVENT_MAX: usize = 256;

/// One decoded readiness event.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Event {
    /// The token supplied at registration (socket slot id, or the
    /// reactor's control token).
    pub token: u64,
    pub read: bool,
    pub write: bool,
    pub error: bool,
    pub eof: bool,
}

/// Thin level-triggered epoll wrapper.
///
/// Registrations carry a token rather than a pointer, so a stale event can
/// never dangle: the reactor re-validates the slot it names.
pub(crate) struct Poller {
    epfd: RawFd,
}

impl Poller {
    pub(crate) fn new() -> Result<Self, SocketError> {
        // SAFETY: plain syscall, no pointers involved.
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(SocketError::last_os("epoll_create1"));
        }
        Ok(Self { epfd })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32, token: u64) -> Result<(), SocketError> {
        let mut ev = libc::epoll_event { events, u64: token };
        // SAFETY: ev is a valid epoll_event for the duration of the call.
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if rc < 0 {
            return Err(SocketError::last_os("epoll_ctl"));
        }
        Ok(())
    }

    /// Adds `fd`, optionally read-armed.
    pub(crate) fn register(&self, fd: RawFd, token: u64, read: bool) -> Result<(), SocketError> {
        let events = if read { libc::EPOLLIN as u32 } else { 0 };
        self.ctl(libc::EPOLL_CTL_ADD, fd, events, token)
    }

    /// Rewrites `fd`'s interest set; read and write arm independently.
    pub(crate) fn rearm(
        &self,
        fd: RawFd,
        token: u64,
        read: bool,
        write: bool,
    ) -> Result<(), SocketError> {
        let mut events = 0u32;
        if read {
            events |= libc::EPOLLIN as u32;
        }
        if write {
            events |= libc::EPOLLOUT as u32;
        }
        self.ctl(libc::EPOLL_CTL_MOD, fd, events, token)
    }

    /// Removes `fd` from the interest set.
    pub(crate) fn deregister(&self, fd: RawFd) -> Result<(), SocketError> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, 0, 0)
    }

    /// Waits up to `timeout_ms` (-1 blocks) and decodes into `out`.
    ///
    /// `EINTR` surfaces as an error for the caller to swallow and retry.
    pub(crate) fn wait(&self, out: &mut [Event], timeout_ms: i32) -> Result<usize, SocketError> {
        let cap = out.len().min(EVENT_MAX) as libc::c_int;
        // SAFETY: zeroed epoll_event array is a valid out-buffer.
        let mut raw: [libc::epoll_event; EVENT_MAX] = unsafe { mem::zeroed() };
        // SAFETY: raw has room for `cap` entries.
        let n = unsafe { libc::epoll_wait(self.epfd, raw.as_mut_ptr(), cap, timeout_ms) };
        if n < 0 {
            return Err(SocketError::last_os("epoll_wait"));
        }
        let n = n as usize;
        for i in 0..n {
            let flags = raw[i].events;
            out[i] = Event {
                token: raw[i].u64,
                read: flags & libc::EPOLLIN as u32 != 0,
                write: flags & libc::EPOLLOUT as u32 != 0,
                error: flags & libc::EPOLLERR as u32 != 0,
                eof: flags & libc::EPOLLHUP as u32 != 0,
            };
        }
        Ok(n)
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        // SAFETY: epfd is owned by this poller and closed exactly once.
        unsafe { libc::close(self.epfd) };
    }
}
