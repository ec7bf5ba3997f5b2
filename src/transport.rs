//! Transport channel contract.
//!
//! The engine never performs I/O itself. A [`Channel`] is an established
//! transport flow (one UDP socket pairing, one TCP/TLS connection) owned by
//! the embedding application. The engine calls [`Channel::send`] to emit
//! messages and drains [`Channel::poll_incoming`] when the application marks
//! the channel's loop source ready.

use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::message::Message;

/// Transport protocol of a channel. Reliability drives the retransmission
/// and absorption timer policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Udp,
    Tcp,
    Tls,
}

impl TransportKind {
    /// UDP is the only unreliable transport; reliable transports disable
    /// request/response retransmission and zero the absorption timers.
    pub fn is_reliable(&self) -> bool {
        !matches!(self, TransportKind::Udp)
    }

    pub fn as_str(&self) -> &str {
        match self {
            TransportKind::Udp => "UDP",
            TransportKind::Tcp => "TCP",
            TransportKind::Tls => "TLS",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An established transport flow.
///
/// Implementations must be cheap to share (`Arc<dyn Channel>`) and callable
/// from the loop thread. `send` is synchronous from the engine's point of
/// view; an implementation may queue internally.
pub trait Channel: Send + Sync + fmt::Debug {
    /// Serializes and transmits a message on this flow.
    fn send(&self, message: &Message) -> Result<()>;

    /// Transport kind of this flow.
    fn kind(&self) -> TransportKind;

    /// Next fully parsed inbound message, if one is queued. The engine
    /// drains this in a loop when the channel's source reports readiness.
    fn poll_incoming(&self) -> Option<Message>;

    /// Remote endpoint, for logging.
    fn peer(&self) -> String {
        String::new()
    }

    fn is_reliable(&self) -> bool {
        self.kind().is_reliable()
    }
}

/// Shared channel handle as stored by transactions and the provider.
pub type ChannelRef = Arc<dyn Channel>;
