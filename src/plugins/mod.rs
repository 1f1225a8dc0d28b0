//! Plugin stages between the publisher and the fan-out
//!
//! A plugin is a uniform chain stage: RTP is written into it, processed, and
//! read back out. The [`PluginChain`] wires enabled plugins head-to-tail in
//! a fixed order (jitter buffer first, terminal forwarders after) and
//! presents the whole chain to the router as a single stage.
//!
//! ```text
//! publisher ──► [JitterBuffer] ──► [RtpForwarder] ──► router fan-out
//!                    │
//!                    └──► REMB / PLI upstream
//! ```

pub mod jitter_buffer;
pub mod rtp_forwarder;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::transport::Transport;

pub use jitter_buffer::{JitterBuffer, JitterBufferConfig};
pub use rtp_forwarder::{RtpForwarder, RtpForwarderConfig};

/// Identifies a concrete plugin type for targeted lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginKind {
    JitterBuffer,
    RtpForwarder,
}

/// One processing stage in the chain
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Plugin instance identifier
    fn id(&self) -> &str;

    /// Concrete plugin type
    fn kind(&self) -> PluginKind;

    /// Ingest one RTP packet
    async fn write_rtp(&self, pkt: rtp::packet::Packet) -> Result<()>;

    /// Emit the next processed packet; `None` once stopped and drained
    async fn read_rtp(&self) -> Option<rtp::packet::Packet>;

    /// Stop the plugin; ingestion becomes a no-op, buffered output drains
    fn stop(&self);

    /// Concrete-type access for kind-specific operations
    fn as_any(&self) -> &(dyn std::any::Any + Send + Sync);
}

/// Chain-level configuration
#[derive(Debug, Clone, Default)]
pub struct PluginConfig {
    /// Master switch; when false no plugins are instantiated
    pub on: bool,
    pub jitter_buffer: JitterBufferConfig,
    pub rtp_forwarder: RtpForwarderConfig,
}

impl PluginConfig {
    /// Enable the chain
    pub fn enabled(mut self) -> Self {
        self.on = true;
        self
    }

    /// Replace the jitter buffer options
    pub fn jitter_buffer(mut self, config: JitterBufferConfig) -> Self {
        self.jitter_buffer = config;
        self
    }

    /// Replace the forwarder options
    pub fn rtp_forwarder(mut self, config: RtpForwarderConfig) -> Self {
        self.rtp_forwarder = config;
        self
    }

    /// Reject option combinations that cannot produce a working chain
    fn validate(&self) -> Result<()> {
        if !self.on {
            return Ok(());
        }
        let fwd = &self.rtp_forwarder;
        if fwd.on {
            if fwd.addr.is_empty() {
                return Err(Error::InvalidConfig(
                    "rtpforwarder enabled without addr".into(),
                ));
            }
            if fwd.kcp_key.is_empty() != fwd.kcp_salt.is_empty() {
                return Err(Error::InvalidConfig(
                    "kcp forwarding needs both kcpkey and kcpsalt".into(),
                ));
            }
            if !fwd.kcp_key.is_empty() {
                return Err(Error::InvalidConfig(
                    "kcp forwarding requires an external kcp transport".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Ordered plugin pipeline presented to the router as one stage
pub struct PluginChain {
    id: String,
    plugins: RwLock<Vec<Arc<dyn Plugin>>>,
    jitter: RwLock<Option<Arc<JitterBuffer>>>,
    initialized: AtomicBool,
    stopped: Arc<AtomicBool>,
}

impl PluginChain {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            plugins: RwLock::new(Vec::new()),
            jitter: RwLock::new(None),
            initialized: AtomicBool::new(false),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Instantiate enabled plugins in fixed order and wire them together
    ///
    /// Each link between consecutive plugins gets one pump task moving
    /// packets from the upstream plugin's output to the downstream plugin's
    /// input. Fails with [`Error::InvalidConfig`] on contradictory options.
    pub async fn init(&self, config: PluginConfig) -> Result<()> {
        config.validate()?;
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Err(Error::InvalidConfig(
                "plugin chain already initialized".into(),
            ));
        }
        if !config.on {
            return Ok(());
        }

        let mut plugins: Vec<Arc<dyn Plugin>> = Vec::new();

        if config.jitter_buffer.on {
            let jb = JitterBuffer::new(
                format!("{}-jitterbuffer", self.id),
                config.jitter_buffer.clone(),
            );
            *self.jitter.write().unwrap() = Some(Arc::clone(&jb));
            plugins.push(jb);
        }

        if config.rtp_forwarder.on {
            let fwd = RtpForwarder::new(
                format!("{}-rtpforwarder", self.id),
                &config.rtp_forwarder,
            )
            .await?;
            plugins.push(fwd);
        }

        if plugins.is_empty() {
            tracing::info!(chain = %self.id, "no plugins enabled");
            return Ok(());
        }
        tracing::info!(chain = %self.id, plugins = plugins.len(), "plugin chain initialized");

        for pair in plugins.windows(2) {
            let prev = Arc::clone(&pair[0]);
            let next = Arc::clone(&pair[1]);
            tokio::spawn(async move {
                while let Some(pkt) = prev.read_rtp().await {
                    if next.write_rtp(pkt).await.is_err() {
                        break;
                    }
                }
            });
        }

        *self.plugins.write().unwrap() = plugins;
        Ok(())
    }

    /// True iff at least one plugin is running
    pub fn on(&self) -> bool {
        !self.stopped.load(Ordering::SeqCst) && !self.plugins.read().unwrap().is_empty()
    }

    /// Bind the chain to the publisher
    ///
    /// Hands the transport to the jitter buffer for upstream feedback and,
    /// when the chain is on, starts the ingest pump reading the publisher
    /// into the chain head.
    pub fn attach_pub(&self, transport: Arc<dyn Transport>) {
        if let Some(jb) = self.jitter.read().unwrap().clone() {
            jb.attach_upstream(Arc::clone(&transport));
        }
        if !self.on() {
            return;
        }
        let Some(head) = self.plugins.read().unwrap().first().cloned() else {
            return;
        };

        let stopped = Arc::clone(&self.stopped);
        let chain_id = self.id.clone();
        tokio::spawn(async move {
            loop {
                if stopped.load(Ordering::SeqCst) {
                    break;
                }
                match transport.read_rtp().await {
                    Ok(pkt) => {
                        let _ = head.write_rtp(pkt).await;
                    }
                    Err(Error::TransportClosed) => break,
                    Err(e) => {
                        tracing::warn!(chain = %chain_id, error = %e, "publisher read failed");
                    }
                }
            }
            tracing::debug!(chain = %chain_id, "ingest pump stopped");
        });
    }

    /// Write into the chain head
    pub async fn write_rtp(&self, pkt: rtp::packet::Packet) -> Result<()> {
        let head = self.plugins.read().unwrap().first().cloned();
        match head {
            Some(head) => head.write_rtp(pkt).await,
            None => Ok(()),
        }
    }

    /// Read from the chain tail; `None` once the chain has stopped and
    /// drained
    pub async fn read_rtp(&self) -> Option<rtp::packet::Packet> {
        let tail = self.plugins.read().unwrap().last().cloned();
        match tail {
            Some(tail) => tail.read_rtp().await,
            None => None,
        }
    }

    /// First plugin of the requested kind, if any
    pub fn get_plugin(&self, kind: PluginKind) -> Option<Arc<dyn Plugin>> {
        self.plugins
            .read()
            .unwrap()
            .iter()
            .find(|p| p.kind() == kind)
            .cloned()
    }

    /// Stop every plugin in insertion order; idempotent
    pub fn close(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(chain = %self.id, "closing plugin chain");
        for plugin in self.plugins.read().unwrap().iter() {
            plugin.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_packet(seq: u16) -> rtp::packet::Packet {
        rtp::packet::Packet {
            header: rtp::header::Header {
                sequence_number: seq,
                ssrc: 9,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_disabled_chain_is_off() {
        let chain = PluginChain::new("c1");
        chain.init(PluginConfig::default()).await.unwrap();
        assert!(!chain.on());
        assert!(chain.read_rtp().await.is_none());
    }

    #[tokio::test]
    async fn test_enabled_without_plugins_is_off() {
        let chain = PluginChain::new("c1");
        chain.init(PluginConfig::default().enabled()).await.unwrap();
        assert!(!chain.on());
    }

    #[tokio::test]
    async fn test_jitter_buffer_chain_passes_packets() {
        let chain = PluginChain::new("c1");
        let config = PluginConfig::default()
            .enabled()
            .jitter_buffer(JitterBufferConfig::default().enabled());
        chain.init(config).await.unwrap();
        assert!(chain.on());

        chain.write_rtp(make_packet(1)).await.unwrap();
        chain.write_rtp(make_packet(2)).await.unwrap();
        assert_eq!(chain.read_rtp().await.unwrap().header.sequence_number, 1);
        assert_eq!(chain.read_rtp().await.unwrap().header.sequence_number, 2);
    }

    #[tokio::test]
    async fn test_get_plugin_by_kind() {
        let chain = PluginChain::new("c1");
        let config = PluginConfig::default()
            .enabled()
            .jitter_buffer(JitterBufferConfig::default().enabled());
        chain.init(config).await.unwrap();

        let plugin = chain.get_plugin(PluginKind::JitterBuffer).unwrap();
        assert!(plugin.as_any().downcast_ref::<JitterBuffer>().is_some());
        assert!(chain.get_plugin(PluginKind::RtpForwarder).is_none());
    }

    #[tokio::test]
    async fn test_two_stage_chain_links_plugins() {
        let receiver = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = receiver.local_addr().unwrap();

        let chain = PluginChain::new("c1");
        let config = PluginConfig::default()
            .enabled()
            .jitter_buffer(JitterBufferConfig::default().enabled())
            .rtp_forwarder(RtpForwarderConfig::default().enabled(addr.to_string()));
        chain.init(config).await.unwrap();

        chain.write_rtp(make_packet(5)).await.unwrap();

        // The packet traverses jitter buffer -> forwarder and exits the tail.
        let out = tokio::time::timeout(std::time::Duration::from_secs(1), chain.read_rtp())
            .await
            .expect("chain tail produced nothing")
            .unwrap();
        assert_eq!(out.header.sequence_number, 5);
    }

    #[tokio::test]
    async fn test_init_rejects_forwarder_without_addr() {
        let chain = PluginChain::new("c1");
        let mut fwd = RtpForwarderConfig::default();
        fwd.on = true;
        let config = PluginConfig::default().enabled().rtp_forwarder(fwd);
        assert!(matches!(
            chain.init(config).await,
            Err(Error::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_init_rejects_partial_kcp_material() {
        let chain = PluginChain::new("c1");
        let mut fwd = RtpForwarderConfig::default().enabled("127.0.0.1:6000");
        fwd.kcp_key = "key".into();
        let config = PluginConfig::default().enabled().rtp_forwarder(fwd);
        assert!(matches!(
            chain.init(config).await,
            Err(Error::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_init_rejects_kcp_forwarding() {
        let chain = PluginChain::new("c1");
        let mut fwd = RtpForwarderConfig::default().enabled("127.0.0.1:6000");
        fwd.kcp_key = "key".into();
        fwd.kcp_salt = "salt".into();
        let config = PluginConfig::default().enabled().rtp_forwarder(fwd);
        assert!(matches!(
            chain.init(config).await,
            Err(Error::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_init_twice_fails() {
        let chain = PluginChain::new("c1");
        chain.init(PluginConfig::default()).await.unwrap();
        assert!(matches!(
            chain.init(PluginConfig::default()).await,
            Err(Error::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let chain = PluginChain::new("c1");
        let config = PluginConfig::default()
            .enabled()
            .jitter_buffer(JitterBufferConfig::default().enabled());
        chain.init(config).await.unwrap();

        chain.write_rtp(make_packet(1)).await.unwrap();
        chain.close();
        chain.close();
        assert!(!chain.on());

        assert_eq!(chain.read_rtp().await.unwrap().header.sequence_number, 1);
        assert!(chain.read_rtp().await.is_none());
    }
}
