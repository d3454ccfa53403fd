//! `relayio`: a composable, layered, event-driven I/O runtime.
//!
//! An [`io_handle::Io`] handle is a stack of [`layer::Layer`]s wrapping a
//! single base transport; an [`event_loop::EventLoop`] polls an OS selector
//! and dispatches readiness into registered handles, each of which bubbles
//! events up through its layer stack. A standalone, reusable
//! [`state_machine::Sm`] runtime backs protocol parsers that need to
//! suspend mid-parse and resume on the next read -- the PROXY protocol
//! layer in [`proxy_protocol`] is the one shipped with this crate.
//!
//! Grounded throughout on the teacher codebase's module layout: a `sys`
//! backend seam for the OS selector, a `net` module for concrete
//! transports, and ordinary `log`/`thiserror` for the ambient logging and
//! error-handling stack.

pub mod error;
pub mod event_type;
pub mod io_state;
pub mod layer;
pub mod soft_event;
pub mod state_machine;
pub mod sys;

mod io_handle;

pub use error::{IoError, IoErrorKind, IoResult};
pub use event_type::EventType;
pub use io_handle::Io;
pub use io_state::IoState;
pub use layer::{Layer, LayerContext};
pub use soft_event::SoftEvent;
pub use state_machine::{CleanupReason, CleanupSm, Sm, StateId, Status};

#[cfg(feature = "os-poll")]
pub mod event_loop;

#[cfg(feature = "net")]
pub mod net;

#[cfg(feature = "net")]
pub mod proxy_protocol;

#[cfg(feature = "os-poll")]
pub use event_loop::{EventLoop, EventLoopFlags, EventPool, TimerId, TimerMode, TriggerId};

#[cfg(feature = "net")]
pub use proxy_protocol::{add_inbound, add_outbound, NetType, ProxyProtocolVersion};
