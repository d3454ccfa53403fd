//! Wakes a blocked `epoll_wait` from another thread, via `eventfd`.

use std::os::unix::io::RawFd;

use crate::error::{IoError, IoResult};
use crate::sys::{Interest, Selector, Token};

#[derive(Debug)]
pub struct Waker {
    fd: RawFd,
}

impl Waker {
    pub fn new(selector: &Selector, token: Token) -> IoResult<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if fd < 0 {
            return Err(IoError::from(std::io::Error::last_os_error()));
        }
        selector.register(fd, token, Interest::READABLE)?;
        Ok(Waker { fd })
    }

    pub fn wake(&self) -> IoResult<()> {
        let buf: u64 = 1;
        let rc = unsafe {
            libc::write(
                self.fd,
                &buf as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            // EAGAIN means the eventfd counter is already saturated, i.e.
            // a wake is already pending -- not a failure to wake.
            if err.kind() == std::io::ErrorKind::WouldBlock {
                return Ok(());
            }
            return Err(IoError::from(err));
        }
        Ok(())
    }

    /// Drain the eventfd counter so it can be waited on again.
    pub fn reset(&self) {
        let mut buf = [0u8; 8];
        unsafe {
            libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, 8);
        }
    }
}

impl Drop for Waker {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}
