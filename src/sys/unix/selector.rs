//! Linux `epoll` backend, modernized off the teacher's historical
//! `sys/unix/epoll.rs` (no `dlsym!` probing -- every libc this crate
//! targets has `epoll_create1`).

use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::error::{IoError, IoResult};
use crate::sys::{Event, Events, Interest, Token};

#[derive(Debug)]
pub struct Selector {
    epfd: RawFd,
}

impl Selector {
    pub fn new() -> IoResult<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(IoError::from(std::io::Error::last_os_error()));
        }
        Ok(Selector { epfd })
    }

    pub fn select(&self, events: &mut Events, timeout: Option<Duration>) -> IoResult<()> {
        let timeout_ms = timeout
            .map(|d| d.as_millis().min(i32::MAX as u128) as i32)
            .unwrap_or(-1);

        events.inner.clear();
        let capacity = events.inner.capacity().max(64);
        let mut raw: Vec<libc::epoll_event> = Vec::with_capacity(capacity);

        let n = unsafe {
            libc::epoll_wait(
                self.epfd,
                raw.as_mut_ptr(),
                capacity as i32,
                timeout_ms,
            )
        };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(IoError::from(err));
        }
        unsafe { raw.set_len(n as usize) };

        for ev in &raw {
            events.inner.push(Event {
                token: Token(ev.u64 as usize),
                readable: ev.events & (libc::EPOLLIN as u32) != 0,
                writable: ev.events & (libc::EPOLLOUT as u32) != 0,
                error: ev.events & (libc::EPOLLERR as u32) != 0,
                hup: ev.events & (libc::EPOLLHUP as u32 | libc::EPOLLRDHUP as u32) != 0,
            });
        }
        Ok(())
    }

    pub fn register(&self, fd: RawFd, token: Token, interest: Interest) -> IoResult<()> {
        let mut ev = libc::epoll_event {
            events: to_epoll_mask(interest),
            u64: token.0 as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut ev) };
        check(rc)
    }

    pub fn reregister(&self, fd: RawFd, token: Token, interest: Interest) -> IoResult<()> {
        let mut ev = libc::epoll_event {
            events: to_epoll_mask(interest),
            u64: token.0 as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_MOD, fd, &mut ev) };
        check(rc)
    }

    pub fn deregister(&self, fd: RawFd) -> IoResult<()> {
        let mut ev = libc::epoll_event { events: 0, u64: 0 };
        let rc = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut ev) };
        check(rc)
    }
}

fn to_epoll_mask(interest: Interest) -> u32 {
    let mut mask = 0u32;
    if interest.is_readable() {
        mask |= libc::EPOLLIN as u32;
    }
    if interest.is_writable() {
        mask |= libc::EPOLLOUT as u32;
    }
    mask
}

fn check(rc: i32) -> IoResult<()> {
    if rc < 0 {
        Err(IoError::from(std::io::Error::last_os_error()))
    } else {
        Ok(())
    }
}

impl Drop for Selector {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}
