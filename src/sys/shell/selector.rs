use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::error::IoResult;
use crate::sys::{Events, Interest, Token};

#[derive(Debug)]
pub struct Selector {}

impl Selector {
    pub fn new() -> IoResult<Self> {
        os_required!();
    }

    pub fn select(&self, _events: &mut Events, _timeout: Option<Duration>) -> IoResult<()> {
        os_required!();
    }

    pub fn register(&self, _fd: RawFd, _token: Token, _interest: Interest) -> IoResult<()> {
        os_required!();
    }

    pub fn reregister(&self, _fd: RawFd, _token: Token, _interest: Interest) -> IoResult<()> {
        os_required!();
    }

    pub fn deregister(&self, _fd: RawFd) -> IoResult<()> {
        os_required!();
    }
}
