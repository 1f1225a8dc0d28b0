//! Per-session RTP router
//!
//! One router owns one publishing transport, an optional plugin chain, and
//! a dynamic set of subscribing transports. RTP flows one way:
//!
//! ```text
//!                                        +---> sub
//!                                        |
//! pub ---> plugin chain ---> fan-out ----+---> sub
//!                                        |
//!                                        +---> sub
//! ```
//!
//! RTCP feedback flows the other way: key-frame requests are forwarded to
//! the publisher verbatim, NACKs are served from the jitter buffer when
//! possible and escalated upstream otherwise, and subscriber REMB reports
//! are aggregated into a single conservative estimate.
//!
//! Each subscriber gets a bounded egress queue and two tasks (writer,
//! feedback). The fan-out never blocks on a subscriber: when a queue is
//! full the packet is dropped for that subscriber only.

pub mod config;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rtcp::payload_feedbacks::full_intra_request::FullIntraRequest;
use rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use rtcp::payload_feedbacks::receiver_estimated_maximum_bitrate::ReceiverEstimatedMaximumBitrate;
use rtcp::transport_feedbacks::transport_layer_nack::{NackPair, TransportLayerNack};
use tokio::sync::{mpsc, watch, RwLock};

use crate::error::{Error, Result};
use crate::plugins::{JitterBuffer, PluginChain, PluginConfig, PluginKind};
use crate::stats::RouterStats;
use crate::transport::{RtcpPacket, Transport};

pub use config::RouterConfig;

/// Capacity of each subscriber's egress queue, in packets
pub const EGRESS_QUEUE_CAPACITY: usize = 1000;

/// Consecutive RTP write failures tolerated before a subscriber is removed
pub const MAX_WRITE_ERR: u64 = 100;

/// Minimum spacing between aggregated REMB emissions
const REMB_WINDOW: Duration = Duration::from_millis(200);

type CloseCallback = Box<dyn FnOnce() + Send>;

/// One subscriber: its transport and the producer side of its egress queue
///
/// Keeping both in one entry ties their lifetimes together: an id is in the
/// map iff its queue is open, and dropping the entry closes the queue
/// exactly once.
struct Sub {
    transport: Arc<dyn Transport>,
    rtp_tx: mpsc::Sender<rtp::packet::Packet>,
}

/// Routes one publisher's RTP to any number of subscribers
pub struct Router {
    id: String,
    config: RouterConfig,
    publisher: RwLock<Option<Arc<dyn Transport>>>,
    subs: RwLock<HashMap<String, Sub>>,
    chain: PluginChain,
    stop: AtomicBool,
    closed: watch::Sender<bool>,
    remb_tx: Mutex<Option<mpsc::UnboundedSender<ReceiverEstimatedMaximumBitrate>>>,
    remb_rx: Mutex<Option<mpsc::UnboundedReceiver<ReceiverEstimatedMaximumBitrate>>>,
    on_close: Mutex<Option<CloseCallback>>,
    stats: Arc<RouterStats>,
}

impl Router {
    /// Create a router for one session
    pub fn new(id: impl Into<String>, config: RouterConfig) -> Arc<Self> {
        let id = id.into();
        tracing::info!(router = %id, "new router");
        let (remb_tx, remb_rx) = mpsc::unbounded_channel();
        let (closed_tx, _) = watch::channel(false);
        let chain = PluginChain::new(id.clone());
        Arc::new(Self {
            id,
            config,
            publisher: RwLock::new(None),
            subs: RwLock::new(HashMap::new()),
            chain,
            stop: AtomicBool::new(false),
            closed: closed_tx,
            remb_tx: Mutex::new(Some(remb_tx)),
            remb_rx: Mutex::new(Some(remb_rx)),
            on_close: Mutex::new(None),
            stats: Arc::new(RouterStats::new()),
        })
    }

    /// Session identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Forwarding counters for this router
    pub fn stats(&self) -> Arc<RouterStats> {
        Arc::clone(&self.stats)
    }

    /// Initialize the plugin chain; must precede [`Router::add_pub`]
    pub async fn init_plugins(&self, config: PluginConfig) -> Result<()> {
        tracing::info!(router = %self.id, "initializing plugins");
        self.chain.init(config).await
    }

    /// Attach the publishing transport and start routing
    ///
    /// Registers a close callback that collapses the whole session when the
    /// publisher goes away. A second publisher is rejected with
    /// [`Error::PublisherExists`].
    pub async fn add_pub(
        self: &Arc<Self>,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<dyn Transport>> {
        {
            let mut slot = self.publisher.write().await;
            if slot.is_some() {
                return Err(Error::PublisherExists);
            }
            *slot = Some(Arc::clone(&transport));
        }
        tracing::info!(router = %self.id, publisher = %transport.id(), "publisher attached");

        self.chain.attach_pub(Arc::clone(&transport));
        self.start();

        let weak = Arc::downgrade(self);
        transport.on_close(Box::new(move || {
            if let Some(router) = weak.upgrade() {
                tokio::spawn(async move { router.close().await });
            }
        }));

        Ok(transport)
    }

    /// Current publisher, if attached
    pub async fn publisher(&self) -> Option<Arc<dyn Transport>> {
        self.publisher.read().await.clone()
    }

    /// Attach a subscribing transport
    ///
    /// Returns `None` once the router has stopped. The subscriber gets a
    /// bounded egress queue plus a writer task and a feedback task; its
    /// transport closing removes it from the router.
    pub async fn add_sub(
        self: &Arc<Self>,
        id: impl Into<String>,
        transport: Arc<dyn Transport>,
    ) -> Option<Arc<dyn Transport>> {
        let id = id.into();
        let rx = {
            let mut subs = self.subs.write().await;
            if self.stopped() {
                return None;
            }
            let (tx, rx) = mpsc::channel(EGRESS_QUEUE_CAPACITY);
            let replaced = subs.insert(
                id.clone(),
                Sub {
                    transport: Arc::clone(&transport),
                    rtp_tx: tx,
                },
            );
            if replaced.is_some() {
                tracing::warn!(router = %self.id, sub = %id, "replaced existing subscriber");
            }
            rx
        };
        tracing::info!(router = %self.id, sub = %id, "subscriber added");

        let weak = Arc::downgrade(self);
        let close_id = id.clone();
        transport.on_close(Box::new(move || {
            if let Some(router) = weak.upgrade() {
                tokio::spawn(async move { router.del_sub(&close_id).await });
            }
        }));

        tokio::spawn(Arc::clone(self).sub_write_loop(
            id.clone(),
            Arc::clone(&transport),
            rx,
        ));
        tokio::spawn(Arc::clone(self).sub_feedback_loop(id, Arc::clone(&transport)));

        Some(transport)
    }

    /// Look up a subscriber by id
    pub async fn subscriber(&self, id: &str) -> Option<Arc<dyn Transport>> {
        self.subs
            .read()
            .await
            .get(id)
            .map(|sub| Arc::clone(&sub.transport))
    }

    /// Ids of all current subscribers
    pub async fn subscriber_ids(&self) -> Vec<String> {
        self.subs.read().await.keys().cloned().collect()
    }

    /// All current subscribers with their transports
    pub async fn subscribers(&self) -> Vec<(String, Arc<dyn Transport>)> {
        self.subs
            .read()
            .await
            .iter()
            .map(|(id, sub)| (id.clone(), Arc::clone(&sub.transport)))
            .collect()
    }

    /// Register the close handler, invoked once at the start of teardown
    pub fn on_close(&self, f: impl FnOnce() + Send + 'static) {
        *self.on_close.lock().unwrap() = Some(Box::new(f));
    }

    /// Tear the session down; idempotent
    ///
    /// Runs the close handler, detaches the publisher and plugin chain,
    /// then removes every subscriber. Subscriber ids are collected under a
    /// shared guard that is released before each removal takes the
    /// exclusive guard, since closing a transport may reenter the router.
    pub async fn close(&self) {
        if self.stop.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(router = %self.id, "closing router");

        let cb = self.on_close.lock().unwrap().take();
        if let Some(cb) = cb {
            cb();
        }

        self.del_pub().await;
        let _ = self.closed.send(true);
        self.remb_tx.lock().unwrap().take();

        let ids: Vec<String> = self.subs.read().await.keys().cloned().collect();
        for id in ids {
            self.del_sub(&id).await;
        }
    }

    /// Whether the router has stopped; monotone
    pub fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn start(self: &Arc<Self>) {
        if self.config.remb_feedback {
            tokio::spawn(Arc::clone(self).remb_loop());
        }
        tokio::spawn(Arc::clone(self).fan_out_loop());
    }

    async fn del_pub(&self) {
        let publisher = self.publisher.write().await.take();
        if let Some(transport) = publisher {
            tracing::info!(router = %self.id, publisher = %transport.id(), "detaching publisher");
            transport.close().await;
        }
        self.chain.close();
    }

    /// Remove one subscriber; unknown ids are a no-op
    ///
    /// Dropping the map entry drops the egress sender, which closes the
    /// queue and ends the writer task after it drains.
    pub(crate) async fn del_sub(&self, id: &str) {
        let removed = self.subs.write().await.remove(id);
        let Some(sub) = removed else {
            return;
        };
        tracing::info!(router = %self.id, sub = %id, "removing subscriber");
        sub.transport.close().await;
    }

    /// Hot path: move packets from the source to every subscriber queue
    async fn fan_out_loop(self: Arc<Self>) {
        let use_chain = self.chain.on();
        let publisher = self.publisher().await;
        loop {
            if self.stopped() {
                break;
            }

            let pkt = if use_chain {
                match self.chain.read_rtp().await {
                    Some(pkt) => pkt,
                    None => break,
                }
            } else {
                let Some(transport) = publisher.as_ref() else {
                    break;
                };
                match transport.read_rtp().await {
                    Ok(pkt) => pkt,
                    Err(Error::TransportClosed) => break,
                    Err(e) => {
                        tracing::warn!(router = %self.id, error = %e, "publisher read failed");
                        continue;
                    }
                }
            };

            let subs = self.subs.read().await;
            for (sub_id, sub) in subs.iter() {
                match sub.rtp_tx.try_send(pkt.clone()) {
                    Ok(()) => self.stats.add_forwarded(),
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        self.stats.add_dropped();
                        tracing::warn!(
                            router = %self.id,
                            sub = %sub_id,
                            "subscriber backed up, dropping packet"
                        );
                    }
                    // Entry is being removed; nothing to do.
                    Err(mpsc::error::TrySendError::Closed(_)) => {}
                }
            }
        }
        tracing::debug!(router = %self.id, "fan-out loop stopped");
    }

    /// Writer task: drain one subscriber's egress queue into its transport
    async fn sub_write_loop(
        self: Arc<Self>,
        id: String,
        transport: Arc<dyn Transport>,
        mut rx: mpsc::Receiver<rtp::packet::Packet>,
    ) {
        while let Some(pkt) = rx.recv().await {
            match transport.write_rtp(&pkt).await {
                Ok(()) => transport.write_err_reset(),
                Err(_) => {
                    // Errors accumulate until a successful write; the budget
                    // check runs before any reset.
                    if transport.write_err_total() > MAX_WRITE_ERR {
                        tracing::warn!(
                            router = %self.id,
                            sub = %id,
                            "write-error budget exhausted, removing subscriber"
                        );
                        self.del_sub(&id).await;
                        break;
                    }
                }
            }
        }
        tracing::debug!(router = %self.id, sub = %id, "closing sub writer");
    }

    /// Feedback task: dispatch one subscriber's inbound RTCP
    async fn sub_feedback_loop(self: Arc<Self>, id: String, transport: Arc<dyn Transport>) {
        let Some(mut rx) = transport.take_rtcp_stream() else {
            tracing::warn!(router = %self.id, sub = %id, "rtcp stream unavailable");
            return;
        };
        let mut closed = self.closed.subscribe();
        loop {
            if self.stopped() {
                break;
            }
            let pkt = tokio::select! {
                _ = closed.changed() => break,
                pkt = rx.recv() => match pkt {
                    Some(pkt) => pkt,
                    None => break,
                },
            };
            self.handle_feedback(&id, pkt).await;
        }
        tracing::debug!(router = %self.id, sub = %id, "closing sub feedback");
    }

    async fn handle_feedback(&self, sub_id: &str, pkt: RtcpPacket) {
        if pkt.as_any().downcast_ref::<PictureLossIndication>().is_some()
            || pkt.as_any().downcast_ref::<FullIntraRequest>().is_some()
        {
            // Any subscriber needing a key frame needs the publisher to emit
            // one; the original packet keeps its SSRC targeting.
            if let Some(publisher) = self.publisher().await {
                tracing::debug!(router = %self.id, sub = %sub_id, "forwarding key frame request");
                if let Err(e) = publisher.write_rtcp(pkt).await {
                    tracing::warn!(router = %self.id, error = %e, "key frame request write failed");
                }
            }
            return;
        }

        if let Some(remb) = pkt
            .as_any()
            .downcast_ref::<ReceiverEstimatedMaximumBitrate>()
        {
            if self.config.remb_feedback {
                let tx = self.remb_tx.lock().unwrap().clone();
                if let Some(tx) = tx {
                    let _ = tx.send(remb.clone());
                }
            }
            return;
        }

        if let Some(nack) = pkt.as_any().downcast_ref::<TransportLayerNack>() {
            for pair in &nack.nacks {
                for seq in pair.packet_list() {
                    if self.resend_rtp(sub_id, nack.media_ssrc, seq).await {
                        self.stats.add_nack_served();
                    } else {
                        let upstream = TransportLayerNack {
                            sender_ssrc: nack.sender_ssrc,
                            media_ssrc: nack.media_ssrc,
                            nacks: vec![NackPair {
                                packet_id: seq,
                                lost_packets: 0,
                            }],
                        };
                        if let Some(publisher) = self.publisher().await {
                            if let Err(e) = publisher.write_rtcp(Box::new(upstream)).await {
                                tracing::warn!(
                                    router = %self.id,
                                    error = %e,
                                    "upstream nack write failed"
                                );
                            }
                        }
                        self.stats.add_nack_upstream();
                    }
                }
            }
        }
        // All other RTCP kinds are ignored.
    }

    /// Serve a NACKed packet from the jitter buffer to one subscriber
    ///
    /// Returns false when the packet is no longer available locally, in
    /// which case the caller escalates upstream.
    async fn resend_rtp(&self, sub_id: &str, ssrc: u32, seq: u16) -> bool {
        if self.publisher().await.is_none() {
            return false;
        }
        let Some(plugin) = self.chain.get_plugin(PluginKind::JitterBuffer) else {
            return false;
        };
        let Some(jb) = plugin.as_any().downcast_ref::<JitterBuffer>() else {
            return false;
        };
        let Some(pkt) = jb.get_packet(ssrc, seq) else {
            return false;
        };
        let Some(sub) = self.subscriber(sub_id).await else {
            return false;
        };
        tracing::debug!(router = %self.id, sub = %sub_id, ssrc, seq, "retransmitting from buffer");
        if let Err(e) = sub.write_rtp(&pkt).await {
            tracing::warn!(router = %self.id, sub = %sub_id, error = %e, "retransmit write failed");
        }
        true
    }

    /// Aggregate subscriber REMB reports and relay the lowest estimate
    ///
    /// The publisher is capped at the pace of the slowest subscriber: over
    /// each window the minimum observed bitrate, clamped into configured
    /// bounds, is emitted upstream.
    async fn remb_loop(self: Arc<Self>) {
        let Some(mut rx) = self.remb_rx.lock().unwrap().take() else {
            return;
        };

        let remb_min = self.config.min_bandwidth.max(10_000);
        let remb_max = if self.config.max_bandwidth > 0 {
            self.config.max_bandwidth
        } else {
            100_000_000
        };
        let (remb_min, remb_max) = (remb_min as f32, remb_max as f32);

        let mut last_emit = Instant::now();
        let mut lowest = f32::INFINITY;

        while let Some(report) = rx.recv().await {
            if report.bitrate < lowest {
                lowest = report.bitrate;
            }

            if last_emit.elapsed() >= REMB_WINDOW {
                let target = lowest.clamp(remb_min, remb_max);
                let remb = ReceiverEstimatedMaximumBitrate {
                    sender_ssrc: 1,
                    bitrate: target,
                    ssrcs: report.ssrcs.clone(),
                };
                if let Some(publisher) = self.publisher().await {
                    tracing::debug!(router = %self.id, bitrate = target, "emitting aggregated remb");
                    if let Err(e) = publisher.write_rtcp(Box::new(remb)).await {
                        tracing::warn!(router = %self.id, error = %e, "aggregated remb write failed");
                    }
                    self.stats.add_remb_emitted();
                }
                last_emit = Instant::now();
                lowest = f32::INFINITY;
            }
        }
        tracing::debug!(router = %self.id, "remb loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use super::*;
    use crate::transport::MemTransport;

    #[tokio::test]
    async fn test_new_router_is_empty() {
        let router = Router::new("r1", RouterConfig::default());
        assert_eq!(router.id(), "r1");
        assert!(router.publisher().await.is_none());
        assert!(router.subscriber_ids().await.is_empty());
        assert!(!router.stopped());
    }

    #[tokio::test]
    async fn test_second_publisher_rejected() {
        let router = Router::new("r1", RouterConfig::default());
        let (pub_a, _ha) = MemTransport::new("pub-a");
        let (pub_b, _hb) = MemTransport::new("pub-b");

        router.add_pub(pub_a).await.unwrap();
        assert!(matches!(
            router.add_pub(pub_b).await,
            Err(Error::PublisherExists)
        ));
    }

    #[tokio::test]
    async fn test_subscriber_lookup_and_removal() {
        let router = Router::new("r1", RouterConfig::default());
        let (sub, _handle) = MemTransport::new("sub-a");

        router.add_sub("a", sub).await.unwrap();
        assert!(router.subscriber("a").await.is_some());
        assert_eq!(router.subscriber_ids().await, vec!["a".to_string()]);

        router.del_sub("a").await;
        assert!(router.subscriber("a").await.is_none());
        assert!(router.subscriber_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_del_sub_unknown_is_noop() {
        let router = Router::new("r1", RouterConfig::default());
        router.del_sub("ghost").await;
        router.del_sub("ghost").await;
        assert!(router.subscriber_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let router = Router::new("r1", RouterConfig::default());
        let fired = Arc::new(AtomicU32::new(0));
        {
            let fired = Arc::clone(&fired);
            router.on_close(move || {
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }

        router.close().await;
        router.close().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(router.stopped());
    }

    #[tokio::test]
    async fn test_close_without_handler_is_fine() {
        let router = Router::new("r1", RouterConfig::default());
        router.close().await;
        assert!(router.stopped());
    }

    #[tokio::test]
    async fn test_add_sub_after_close_returns_none() {
        let router = Router::new("r1", RouterConfig::default());
        router.close().await;

        let (sub, _handle) = MemTransport::new("sub-a");
        assert!(router.add_sub("a", sub).await.is_none());
        assert!(router.subscriber_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_close_closes_attached_transports() {
        let router = Router::new("r1", RouterConfig::default());
        let (pub_t, _ph) = MemTransport::new("pub");
        let (sub_t, _sh) = MemTransport::new("sub");

        router.add_pub(Arc::clone(&pub_t) as Arc<dyn Transport>).await.unwrap();
        router.add_sub("a", Arc::clone(&sub_t) as Arc<dyn Transport>).await.unwrap();

        router.close().await;
        assert!(pub_t.is_closed());
        assert!(sub_t.is_closed());
        assert!(router.subscriber_ids().await.is_empty());
    }
}
