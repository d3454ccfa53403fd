use crate::error::IoResult;
use crate::sys::{Selector, Token};

#[derive(Debug)]
pub struct Waker {}

impl Waker {
    pub fn new(_selector: &Selector, _token: Token) -> IoResult<Self> {
        os_required!();
    }

    pub fn wake(&self) -> IoResult<()> {
        os_required!();
    }

    pub fn reset(&self) {
        os_required!();
    }
}
