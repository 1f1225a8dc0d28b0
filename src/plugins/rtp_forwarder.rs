//! RTP forwarder plugin
//!
//! Terminal side-copy: every packet flowing through the chain is
//! wire-encoded and sent to a configured UDP endpoint, then passed through
//! unchanged. Useful for feeding a raw copy of the publisher's stream to an
//! external service. Send failures never disturb the chain; they are logged
//! and counted.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use webrtc_util::Marshal;

use super::{Plugin, PluginKind};
use crate::error::Result;

/// Capacity of the forwarder's pass-through queue
const OUT_QUEUE_CAPACITY: usize = 1024;

/// RTP forwarder configuration
#[derive(Debug, Clone, Default)]
pub struct RtpForwarderConfig {
    /// Enable the plugin
    pub on: bool,
    /// UDP endpoint receiving the copied stream, e.g. `"127.0.0.1:6000"`
    pub addr: String,
    /// KCP pre-shared key; KCP framing belongs to an external transport and
    /// is rejected by chain validation when set
    pub kcp_key: String,
    /// KCP salt, same handling as `kcp_key`
    pub kcp_salt: String,
}

impl RtpForwarderConfig {
    /// Enable forwarding to `addr`
    pub fn enabled(mut self, addr: impl Into<String>) -> Self {
        self.on = true;
        self.addr = addr.into();
        self
    }
}

/// Copies chain traffic to an external UDP endpoint
pub struct RtpForwarder {
    id: String,
    socket: UdpSocket,
    out_tx: Mutex<Option<mpsc::Sender<rtp::packet::Packet>>>,
    out_rx: AsyncMutex<mpsc::Receiver<rtp::packet::Packet>>,
    stopped: AtomicBool,
    send_errs: AtomicU64,
}

impl RtpForwarder {
    /// Bind a local socket and connect it to the configured endpoint
    pub async fn new(id: impl Into<String>, config: &RtpForwarderConfig) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(&config.addr).await?;
        let id = id.into();
        tracing::info!(plugin = %id, addr = %config.addr, "rtp forwarder connected");

        let (out_tx, out_rx) = mpsc::channel(OUT_QUEUE_CAPACITY);
        Ok(Arc::new(Self {
            id,
            socket,
            out_tx: Mutex::new(Some(out_tx)),
            out_rx: AsyncMutex::new(out_rx),
            stopped: AtomicBool::new(false),
            send_errs: AtomicU64::new(0),
        }))
    }

    /// Number of UDP send failures since construction
    pub fn send_err_total(&self) -> u64 {
        self.send_errs.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Plugin for RtpForwarder {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> PluginKind {
        PluginKind::RtpForwarder
    }

    async fn write_rtp(&self, pkt: rtp::packet::Packet) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Ok(());
        }

        match pkt.marshal() {
            Ok(wire) => {
                if let Err(e) = self.socket.send(&wire).await {
                    self.send_errs.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(plugin = %self.id, error = %e, "udp forward failed");
                }
            }
            Err(e) => {
                self.send_errs.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(plugin = %self.id, error = %e, "rtp marshal failed");
            }
        }

        let tx = self.out_tx.lock().unwrap().clone();
        if let Some(tx) = tx {
            let _ = tx.send(pkt).await;
        }
        Ok(())
    }

    async fn read_rtp(&self) -> Option<rtp::packet::Packet> {
        self.out_rx.lock().await.recv().await
    }

    fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(plugin = %self.id, "rtp forwarder stopped");
        self.out_tx.lock().unwrap().take();
    }

    fn as_any(&self) -> &(dyn std::any::Any + Send + Sync) {
        self
    }
}
