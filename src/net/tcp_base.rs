use std::any::Any;
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};

use socket2::{Domain, Protocol, Socket, Type};

use crate::error::{IoError, IoResult};
use crate::event_type::EventType;
use crate::io_state::IoState;
use crate::layer::{Layer, LayerContext};
use crate::sys::{Interest, Pollable, Selector, Token};

/// The base transport layer for a connected (or connecting) TCP socket.
pub struct TcpBase {
    socket: Socket,
    state: IoState,
    peer_addr: Option<SocketAddr>,
    last_error: Option<String>,
}

impl TcpBase {
    /// Begin a non-blocking connect. The handle starts in `Connecting`
    /// state; a `Write` readiness notification on the base layer means
    /// the connect attempt has resolved (success or failure -- check
    /// `take_socket_error`).
    pub fn connect(addr: SocketAddr) -> IoResult<Self> {
        let domain = Domain::for_address(addr);
        let socket = Socket::new(domain, Type::STREAM.nonblocking(), Some(Protocol::TCP))?;
        match socket.connect(&addr.into()) {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(e) => return Err(IoError::from(e)),
        }
        Ok(TcpBase {
            socket,
            state: IoState::Connecting,
            peer_addr: Some(addr),
            last_error: None,
        })
    }

    /// Wrap an already-connected socket (e.g. one handed back by
    /// `TcpListenerBase::accept`).
    pub fn from_connected(socket: Socket, peer_addr: Option<SocketAddr>) -> Self {
        TcpBase {
            socket,
            state: IoState::Connected,
            peer_addr,
            last_error: None,
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Resolve a pending non-blocking connect: promotes `Connecting` to
    /// `Connected` on success, `Error` on failure. Should be called once
    /// on the first writable notification.
    pub fn finish_connect(&mut self) -> IoResult<()> {
        match self.socket.take_error()? {
            Some(e) => {
                self.state = IoState::Error;
                self.last_error = Some(e.to_string());
                Err(IoError::from(e))
            }
            None => {
                self.state = IoState::Connected;
                Ok(())
            }
        }
    }

    pub fn shutdown(&mut self) -> IoResult<()> {
        self.state = IoState::Disconnecting;
        self.socket.shutdown(std::net::Shutdown::Both)?;
        Ok(())
    }
}

impl Layer for TcpBase {
    fn read(&mut self, _ctx: &mut LayerContext<'_>, buf: &mut [u8]) -> IoResult<usize> {
        match self.socket.read(buf) {
            Ok(0) => {
                self.state = IoState::Disconnected;
                Err(IoError::disconnect())
            }
            Ok(n) => Ok(n),
            Err(e) => Err(IoError::from(e)),
        }
    }

    fn write(&mut self, _ctx: &mut LayerContext<'_>, buf: &[u8]) -> IoResult<usize> {
        self.socket.write(buf).map_err(IoError::from)
    }

    fn process_event(&mut self, ctx: &mut LayerContext<'_>, event_type: &mut EventType) -> bool {
        if *event_type == EventType::Write && self.state == IoState::Connecting {
            if self.finish_connect().is_ok() {
                ctx.softevent_add(true, EventType::Connected, None);
                return false;
            }
            ctx.softevent_add(true, EventType::Error, self.last_error.clone().map(IoError::invalid));
            return false;
        }
        true
    }

    fn reset(&mut self, _ctx: &mut LayerContext<'_>) -> IoResult<()> {
        self.last_error = None;
        Ok(())
    }

    fn state(&self) -> Option<IoState> {
        Some(self.state)
    }

    fn error_message(&self) -> Option<String> {
        self.last_error.clone()
    }

    fn as_pollable(&mut self) -> Option<&mut dyn Pollable> {
        Some(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl Pollable for TcpBase {
    fn register(&mut self, selector: &Selector, token: Token, interest: Interest) -> IoResult<()> {
        selector.register(self.socket.as_raw_fd(), token, interest)
    }

    fn reregister(&mut self, selector: &Selector, token: Token, interest: Interest) -> IoResult<()> {
        selector.reregister(self.socket.as_raw_fd(), token, interest)
    }

    fn deregister(&mut self, selector: &Selector) -> IoResult<()> {
        selector.deregister(self.socket.as_raw_fd())
    }
}

impl AsRawFd for TcpBase {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

/// The base transport layer for a listening TCP socket. `process_event`
/// turns `Read` readiness into an `Accept` soft-event; the caller is
/// expected to call [`TcpListenerBase::accept`] in response and build a
/// new [`crate::io_handle::Io`] from the returned socket.
pub struct TcpListenerBase {
    socket: Socket,
}

impl TcpListenerBase {
    pub fn bind(addr: SocketAddr) -> IoResult<Self> {
        let domain = Domain::for_address(addr);
        let socket = Socket::new(domain, Type::STREAM.nonblocking(), Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(1024)?;
        Ok(TcpListenerBase { socket })
    }

    pub fn accept(&self) -> IoResult<(Socket, SocketAddr)> {
        let (socket, addr) = self.socket.accept()?;
        socket.set_nonblocking(true)?;
        let addr = addr
            .as_socket()
            .ok_or_else(|| IoError::invalid("accepted socket has no standard address"))?;
        Ok((socket, addr))
    }

    pub fn local_addr(&self) -> IoResult<SocketAddr> {
        self.socket
            .local_addr()?
            .as_socket()
            .ok_or_else(|| IoError::invalid("listener has no standard address"))
    }
}

impl Layer for TcpListenerBase {
    fn read(&mut self, _ctx: &mut LayerContext<'_>, _buf: &mut [u8]) -> IoResult<usize> {
        Err(IoError::invalid("cannot read from a listening handle"))
    }

    fn write(&mut self, _ctx: &mut LayerContext<'_>, _buf: &[u8]) -> IoResult<usize> {
        Err(IoError::invalid("cannot write to a listening handle"))
    }

    fn process_event(&mut self, ctx: &mut LayerContext<'_>, event_type: &mut EventType) -> bool {
        if *event_type == EventType::Read {
            ctx.softevent_add(true, EventType::Accept, None);
            return false;
        }
        true
    }

    fn state(&self) -> Option<IoState> {
        Some(IoState::Listening)
    }

    fn as_pollable(&mut self) -> Option<&mut dyn Pollable> {
        Some(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl Pollable for TcpListenerBase {
    fn register(&mut self, selector: &Selector, token: Token, interest: Interest) -> IoResult<()> {
        selector.register(self.socket.as_raw_fd(), token, interest)
    }

    fn reregister(&mut self, selector: &Selector, token: Token, interest: Interest) -> IoResult<()> {
        selector.reregister(self.socket.as_raw_fd(), token, interest)
    }

    fn deregister(&mut self, selector: &Selector) -> IoResult<()> {
        selector.deregister(self.socket.as_raw_fd())
    }
}
