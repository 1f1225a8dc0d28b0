//! Transport contract between the router and the media layer
//!
//! A [`Transport`] is one bidirectional media endpoint: RTP in both
//! directions plus a one-shot stream of parsed RTCP compound packets coming
//! back from the peer. The router never touches sockets, ICE, or SRTP; it
//! only drives this trait. The crate ships one implementation,
//! [`mem::MemTransport`], an in-process loopback used by the tests and
//! demos; production transports live with the session layer.

pub mod mem;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

pub use mem::{MemHandle, MemTransport};

/// A parsed RTCP packet, dispatched by concrete type via `as_any()`
pub type RtcpPacket = Box<dyn rtcp::packet::Packet + Send + Sync>;

/// One media endpoint attached to a router, as publisher or subscriber
///
/// Implementations are shared (`Arc`) between the router and the session
/// layer; every method takes `&self`.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Stable identifier for the lifetime of the transport
    fn id(&self) -> &str;

    /// Read the next inbound RTP packet
    ///
    /// Blocks until a packet arrives. Returns [`crate::Error::TransportClosed`]
    /// once the underlying session has ended; any other error is transient
    /// and the caller may keep reading.
    async fn read_rtp(&self) -> Result<rtp::packet::Packet>;

    /// Write one RTP packet toward the peer
    ///
    /// Transient failures increment the write-error counter and return an
    /// error; they do not tear the transport down.
    async fn write_rtp(&self, pkt: &rtp::packet::Packet) -> Result<()>;

    /// Write one RTCP packet toward the peer
    async fn write_rtcp(&self, pkt: RtcpPacket) -> Result<()>;

    /// Hand out the inbound RTCP stream
    ///
    /// The stream is finite and not restartable: the first caller receives
    /// it, later callers get `None`. It ends when the transport closes.
    fn take_rtcp_stream(&self) -> Option<mpsc::UnboundedReceiver<RtcpPacket>>;

    /// Running count of transient RTP write failures since the last reset
    fn write_err_total(&self) -> u64;

    /// Clear the write-error counter
    fn write_err_reset(&self);

    /// Register the close callback
    ///
    /// At most one callback is held; it is invoked exactly once, when the
    /// transport terminates for any reason.
    fn on_close(&self, cb: Box<dyn FnOnce() + Send>);

    /// Begin teardown; idempotent
    async fn close(&self);
}
