//! Readiness poller over the platform primitive (epoll on Linux, kqueue on
//! the BSD family). Registration is per-descriptor with a {Read, Write}
//! interest set; one wait returns at most one coalesced event per
//! descriptor.

use std::collections::HashMap;
use std::io;
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::os::unix::io::RawFd;

/// Bitset of readiness interests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest(u8);

impl Interest {
    pub const NONE: Interest = Interest(0);
    pub const READ: Interest = Interest(1 << 0);
    pub const WRITE: Interest = Interest(1 << 1);

    pub fn contains(self, other: Interest) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Interest {
    type Output = Interest;
    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

impl BitOrAssign for Interest {
    fn bitor_assign(&mut self, rhs: Interest) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Interest {
    type Output = Interest;
    fn bitand(self, rhs: Interest) -> Interest {
        Interest(self.0 & rhs.0)
    }
}

impl Interest {
    fn without(self, other: Interest) -> Interest {
        Interest(self.0 & !other.0)
    }
}

/// One coalesced readiness event.
#[derive(Debug, Clone, Copy)]
pub struct PollEvent {
    pub fd: RawFd,
    readable: bool,
    writable: bool,
    hup: bool,
    err: bool,
}

impl PollEvent {
    pub fn readable(&self) -> bool {
        self.readable
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn hup(&self) -> bool {
        self.hup
    }

    pub fn err(&self) -> bool {
        self.err
    }
}

const WAIT_CHUNK: usize = 64;

#[cfg(target_os = "linux")]
pub use epoll::Poller;

#[cfg(target_os = "linux")]
mod epoll {
    use super::*;

    pub struct Poller {
        epfd: RawFd,
        interests: HashMap<RawFd, Interest>,
    }

    impl Poller {
        pub fn new() -> io::Result<Self> {
            let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
            if epfd < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(Self {
                epfd,
                interests: HashMap::new(),
            })
        }

        fn events_for(interest: Interest) -> u32 {
            let mut ev = 0u32;
            if interest.contains(Interest::READ) {
                ev |= libc::EPOLLIN as u32;
            }
            if interest.contains(Interest::WRITE) {
                ev |= libc::EPOLLOUT as u32;
            }
            ev
        }

        fn ctl(&self, op: libc::c_int, fd: RawFd, interest: Interest) -> io::Result<()> {
            let mut ev = libc::epoll_event {
                events: Self::events_for(interest),
                u64: fd as u64,
            };
            let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
            if rc < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        /// Register (or extend) interest for `fd`. Re-adding an existing
        /// interest is a no-op.
        pub fn add(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
            match self.interests.get(&fd).copied() {
                Some(cur) if cur.contains(interest) => Ok(()),
                Some(cur) => {
                    let merged = cur | interest;
                    self.ctl(libc::EPOLL_CTL_MOD, fd, merged)?;
                    self.interests.insert(fd, merged);
                    Ok(())
                }
                None => {
                    self.ctl(libc::EPOLL_CTL_ADD, fd, interest)?;
                    self.interests.insert(fd, interest);
                    Ok(())
                }
            }
        }

        /// Drop part of the interest set. Removing an interest that was
        /// never registered is benign.
        pub fn remove(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
            let Some(cur) = self.interests.get(&fd).copied() else {
                return Ok(());
            };
            let rest = cur.without(interest);
            if rest == cur {
                return Ok(());
            }
            let result = if rest.is_empty() {
                let rc = unsafe {
                    libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
                };
                if rc < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(())
                }
            } else {
                self.ctl(libc::EPOLL_CTL_MOD, fd, rest)
            };
            match result {
                // The descriptor may already be closed; registration is gone
                // either way.
                Err(e) if matches!(e.raw_os_error(), Some(libc::ENOENT) | Some(libc::EBADF)) => {}
                Err(e) => return Err(e),
                Ok(()) => {}
            }
            if rest.is_empty() {
                self.interests.remove(&fd);
            } else {
                self.interests.insert(fd, rest);
            }
            Ok(())
        }

        /// Wait for events: `timeout_ms < 0` blocks, `0` polls, otherwise
        /// bounded. EINTR surfaces as `ErrorKind::Interrupted`.
        pub fn wait(&mut self, timeout_ms: i32, out: &mut Vec<PollEvent>) -> io::Result<usize> {
            out.clear();
            let mut raw: [libc::epoll_event; WAIT_CHUNK] =
                unsafe { std::mem::zeroed() };
            let n = unsafe {
                libc::epoll_wait(self.epfd, raw.as_mut_ptr(), WAIT_CHUNK as i32, timeout_ms)
            };
            if n < 0 {
                return Err(io::Error::last_os_error());
            }
            for ev in raw.iter().take(n as usize) {
                out.push(PollEvent {
                    fd: ev.u64 as RawFd,
                    readable: ev.events & libc::EPOLLIN as u32 != 0,
                    writable: ev.events & libc::EPOLLOUT as u32 != 0,
                    hup: ev.events & (libc::EPOLLHUP | libc::EPOLLRDHUP) as u32 != 0,
                    err: ev.events & libc::EPOLLERR as u32 != 0,
                });
            }
            Ok(n as usize)
        }
    }

    impl Drop for Poller {
        fn drop(&mut self) {
            unsafe { libc::close(self.epfd) };
        }
    }
}

#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
))]
pub use kqueue::Poller;

#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
))]
mod kqueue {
    use super::*;

    pub struct Poller {
        kq: RawFd,
        interests: HashMap<RawFd, Interest>,
    }

    impl Poller {
        pub fn new() -> io::Result<Self> {
            let kq = unsafe { libc::kqueue() };
            if kq < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(Self {
                kq,
                interests: HashMap::new(),
            })
        }

        fn change(&self, fd: RawFd, filter: i16, flags: u16) -> io::Result<()> {
            let ev = libc::kevent {
                ident: fd as usize,
                filter,
                flags,
                fflags: 0,
                data: 0,
                udata: std::ptr::null_mut(),
            };
            let rc = unsafe {
                libc::kevent(self.kq, &ev, 1, std::ptr::null_mut(), 0, std::ptr::null())
            };
            if rc < 0 {
                let e = io::Error::last_os_error();
                // Deleting a filter that is not registered is benign.
                if flags & libc::EV_DELETE != 0
                    && matches!(e.raw_os_error(), Some(libc::ENOENT) | Some(libc::EBADF))
                {
                    return Ok(());
                }
                return Err(e);
            }
            Ok(())
        }

        pub fn add(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
            let cur = self.interests.get(&fd).copied().unwrap_or(Interest::NONE);
            if interest.contains(Interest::READ) && !cur.contains(Interest::READ) {
                self.change(fd, libc::EVFILT_READ, libc::EV_ADD)?;
            }
            if interest.contains(Interest::WRITE) && !cur.contains(Interest::WRITE) {
                self.change(fd, libc::EVFILT_WRITE, libc::EV_ADD)?;
            }
            self.interests.insert(fd, cur | interest);
            Ok(())
        }

        pub fn remove(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
            let Some(cur) = self.interests.get(&fd).copied() else {
                return Ok(());
            };
            if interest.contains(Interest::READ) && cur.contains(Interest::READ) {
                self.change(fd, libc::EVFILT_READ, libc::EV_DELETE)?;
            }
            if interest.contains(Interest::WRITE) && cur.contains(Interest::WRITE) {
                self.change(fd, libc::EVFILT_WRITE, libc::EV_DELETE)?;
            }
            let rest = cur.without(interest);
            if rest.is_empty() {
                self.interests.remove(&fd);
            } else {
                self.interests.insert(fd, rest);
            }
            Ok(())
        }

        pub fn wait(&mut self, timeout_ms: i32, out: &mut Vec<PollEvent>) -> io::Result<usize> {
            out.clear();
            let ts;
            let ts_ptr = if timeout_ms < 0 {
                std::ptr::null()
            } else {
                ts = libc::timespec {
                    tv_sec: (timeout_ms / 1000) as libc::time_t,
                    tv_nsec: ((timeout_ms % 1000) * 1_000_000) as libc::c_long,
                };
                &ts as *const libc::timespec
            };
            let mut raw: [libc::kevent; WAIT_CHUNK] = unsafe { std::mem::zeroed() };
            let n = unsafe {
                libc::kevent(
                    self.kq,
                    std::ptr::null(),
                    0,
                    raw.as_mut_ptr(),
                    WAIT_CHUNK as i32,
                    ts_ptr,
                )
            };
            if n < 0 {
                return Err(io::Error::last_os_error());
            }
            // kqueue reports filters separately; fold them into one event
            // per descriptor.
            let mut merged: HashMap<RawFd, PollEvent> = HashMap::new();
            for ev in raw.iter().take(n as usize) {
                let fd = ev.ident as RawFd;
                let entry = merged.entry(fd).or_insert(PollEvent {
                    fd,
                    readable: false,
                    writable: false,
                    hup: false,
                    err: false,
                });
                match ev.filter {
                    libc::EVFILT_READ => entry.readable = true,
                    libc::EVFILT_WRITE => entry.writable = true,
                    _ => {}
                }
                if ev.flags & libc::EV_EOF != 0 {
                    entry.hup = true;
                }
                if ev.flags & libc::EV_ERROR != 0 {
                    entry.err = true;
                }
            }
            out.extend(merged.into_values());
            Ok(out.len())
        }
    }

    impl Drop for Poller {
        fn drop(&mut self) {
            unsafe { libc::close(self.kq) };
        }
    }
}
