//! Routing core of a selective forwarding unit
//!
//! One [`Router`] per media session: it reads RTP from a single publishing
//! transport, runs it through an optional plugin chain, and fans it out to
//! any number of subscribing transports. RTCP feedback from subscribers is
//! inverted back toward the publisher with SFU-appropriate transformations:
//! key-frame requests are forwarded verbatim, NACKs are answered from the
//! local jitter buffer when possible, and subscriber bandwidth estimates
//! are aggregated into one conservative REMB.
//!
//! # Architecture
//!
//! ```text
//!                         Arc<Router>
//!              ┌────────────────────────────────┐
//!              │ publisher: Arc<dyn Transport>  │
//!              │ chain: JitterBuffer ─ Forwarder│
//!              │ subs: HashMap<id, Sub {        │
//!              │   transport, egress queue      │
//!              │ }>                             │
//!              └───────────────┬────────────────┘
//!                              │ fan-out (non-blocking, drop on full)
//!              ┌───────────────┼───────────────┐
//!              ▼               ▼               ▼
//!         [Subscriber]    [Subscriber]    [Subscriber]
//!          writer task     writer task     writer task
//!          feedback ───────── RTCP ─────────► publisher
//! ```
//!
//! # Overload policy
//!
//! A slow subscriber never stalls the publisher or its peers: egress
//! enqueue is strictly non-blocking and a full queue drops the packet for
//! that subscriber only. Sustained write failures remove the subscriber.
//!
//! # Example
//!
//! ```no_run
//! use sfu_router::{MemTransport, Router, RouterConfig};
//!
//! # async fn run() -> sfu_router::Result<()> {
//! let router = Router::new("session-1", RouterConfig::default());
//!
//! let (publisher, _pub_handle) = MemTransport::new("pub");
//! router.add_pub(publisher).await?;
//!
//! let (subscriber, _sub_handle) = MemTransport::new("sub");
//! router.add_sub("viewer-1", subscriber).await;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod plugins;
pub mod router;
pub mod stats;
pub mod transport;

pub use error::{Error, Result};
pub use plugins::{
    JitterBuffer, JitterBufferConfig, Plugin, PluginChain, PluginConfig, PluginKind,
    RtpForwarder, RtpForwarderConfig,
};
pub use router::{Router, RouterConfig, EGRESS_QUEUE_CAPACITY, MAX_WRITE_ERR};
pub use stats::{RouterStats, StatsSnapshot};
pub use transport::{MemHandle, MemTransport, RtcpPacket, Transport};
