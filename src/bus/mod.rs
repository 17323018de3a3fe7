//! Message bus adapter.
//!
//! The dispatcher only sees whole frames: a `Subscriber` yields inbound
//! frames, a `Publisher` accepts outbound ones. Framing, addressing and
//! fan-out belong to the concrete transport.

/// In-process bus over bounded channels.
pub mod channel;
/// Length-prefixed frames over TCP.
pub mod tcp;

use crate::error::TransportError;

pub use channel::{in_process, BusHandle, ChannelPublisher, ChannelSubscriber};
pub use tcp::{TcpPublisher, TcpSubscriber};

/// Source of inbound frames.
pub trait Subscriber: Send {
    /// Blocks until the next frame arrives. `Ok(None)` means the bus closed.
    fn recv(&mut self) -> Result<Option<Vec<u8>>, TransportError>;
}

/// Sink for outbound frames.
pub trait Publisher: Send + Sync {
    /// Hands one frame to the bus for fan-out.
    fn publish(&self, frame: &[u8]) -> Result<(), TransportError>;
}

impl<P: Publisher + ?Sized> Publisher for std::sync::Arc<P> {
    fn publish(&self, frame: &[u8]) -> Result<(), TransportError> {
        (**self).publish(frame)
    }
}
