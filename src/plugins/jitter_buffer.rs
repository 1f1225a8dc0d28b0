//! Jitter buffer plugin
//!
//! Retains recent RTP per SSRC for NACK-driven retransmission, passes
//! packets through to the next chain stage, and emits upstream feedback on
//! its own: periodic REMB computed from the measured receive rate, and PLI
//! when media is flowing or when a sequence gap is too wide to repair from
//! the buffer. Upstream RTCP goes directly through the attached publisher
//! transport; the router never writes feedback on the buffer's behalf.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use rtcp::payload_feedbacks::receiver_estimated_maximum_bitrate::ReceiverEstimatedMaximumBitrate;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use super::{Plugin, PluginKind};
use crate::error::Result;
use crate::transport::Transport;

/// Capacity of the buffer's output queue toward the next chain stage
const OUT_QUEUE_CAPACITY: usize = 1024;

/// Hard cap on retained packets per SSRC, independent of the time window
const MAX_RETAINED_PACKETS: usize = 4096;

/// Forward sequence jumps wider than this are treated as unrecoverable loss
/// and answered with a PLI instead of buffering for retransmission
const MAX_REORDER_GAP: u16 = 64;

/// Sequence distance beyond which a jump is considered a restart rather
/// than loss
const MAX_DROPOUT: u16 = 3000;

/// Jitter buffer configuration
#[derive(Debug, Clone)]
pub struct JitterBufferConfig {
    /// Enable the plugin
    pub on: bool,
    /// Accept transport-wide congestion control bookkeeping
    ///
    /// TWCC feedback generation needs the transport-wide sequence header
    /// extension, which the transport contract does not surface; the flag
    /// is accepted for configuration parity but emits nothing.
    pub tcc_on: bool,
    /// Cadence of upstream REMB emissions, seconds (0 disables)
    pub remb_cycle: u64,
    /// Minimum interval between upstream PLIs, seconds (0 disables)
    pub pli_cycle: u64,
    /// Ceiling for the computed REMB, bits per second (0 = no ceiling)
    pub max_bandwidth: u64,
    /// Retention window for retransmission, milliseconds
    pub max_buffer_time: u64,
}

impl Default for JitterBufferConfig {
    fn default() -> Self {
        Self {
            on: false,
            tcc_on: false,
            remb_cycle: 2,
            pli_cycle: 1,
            max_bandwidth: 100_000_000,
            max_buffer_time: 1000,
        }
    }
}

impl JitterBufferConfig {
    /// Enable the plugin
    pub fn enabled(mut self) -> Self {
        self.on = true;
        self
    }

    /// Set the REMB emission cadence in seconds
    pub fn remb_cycle(mut self, secs: u64) -> Self {
        self.remb_cycle = secs;
        self
    }

    /// Set the minimum PLI interval in seconds
    pub fn pli_cycle(mut self, secs: u64) -> Self {
        self.pli_cycle = secs;
        self
    }

    /// Set the REMB ceiling in bits per second
    pub fn max_bandwidth(mut self, bps: u64) -> Self {
        self.max_bandwidth = bps;
        self
    }

    /// Set the retention window in milliseconds
    pub fn max_buffer_time(mut self, ms: u64) -> Self {
        self.max_buffer_time = ms;
        self
    }
}

/// Retained packets and receive accounting for one SSRC
#[derive(Debug, Default)]
struct SsrcBuffer {
    /// Packets in arrival order; evicted by window and hard cap
    packets: VecDeque<(Instant, rtp::packet::Packet)>,
    /// Bytes received since the last REMB cycle
    bytes_since_cycle: u64,
    /// Highest-sequence tracking for gap detection
    last_seq: Option<u16>,
}

impl SsrcBuffer {
    /// Insert a packet, evict expired entries, and report whether a gap too
    /// wide to repair from the buffer was observed.
    fn push(&mut self, now: Instant, pkt: rtp::packet::Packet, window: Duration) -> bool {
        while let Some((arrived, _)) = self.packets.front() {
            if now.duration_since(*arrived) > window {
                self.packets.pop_front();
            } else {
                break;
            }
        }
        while self.packets.len() >= MAX_RETAINED_PACKETS {
            self.packets.pop_front();
        }

        let seq = pkt.header.sequence_number;
        let mut wide_gap = false;
        if let Some(last) = self.last_seq {
            let expected = last.wrapping_add(1);
            let advance = seq.wrapping_sub(expected);
            if advance > 0 && advance < MAX_DROPOUT {
                wide_gap = advance > MAX_REORDER_GAP;
            }
        }
        if self
            .last_seq
            .map_or(true, |last| seq.wrapping_sub(last) < MAX_DROPOUT)
        {
            self.last_seq = Some(seq);
        }

        self.bytes_since_cycle += pkt.payload.len() as u64;
        self.packets.push_back((now, pkt));
        wide_gap
    }

    fn get(&self, seq: u16, now: Instant, window: Duration) -> Option<rtp::packet::Packet> {
        self.packets
            .iter()
            .rev()
            .find(|(arrived, pkt)| {
                pkt.header.sequence_number == seq && now.duration_since(*arrived) <= window
            })
            .map(|(_, pkt)| pkt.clone())
    }
}

/// Reorder/retention buffer with upstream REMB and PLI emission
pub struct JitterBuffer {
    id: String,
    config: JitterBufferConfig,
    buffers: Mutex<HashMap<u32, SsrcBuffer>>,
    out_tx: Mutex<Option<mpsc::Sender<rtp::packet::Packet>>>,
    out_rx: AsyncMutex<mpsc::Receiver<rtp::packet::Packet>>,
    upstream: Mutex<Option<Arc<dyn Transport>>>,
    stopped: AtomicBool,
    media_seen: AtomicBool,
    last_pli: Mutex<Option<Instant>>,
}

impl JitterBuffer {
    pub fn new(id: impl Into<String>, config: JitterBufferConfig) -> Arc<Self> {
        let (out_tx, out_rx) = mpsc::channel(OUT_QUEUE_CAPACITY);
        Arc::new(Self {
            id: id.into(),
            config,
            buffers: Mutex::new(HashMap::new()),
            out_tx: Mutex::new(Some(out_tx)),
            out_rx: AsyncMutex::new(out_rx),
            upstream: Mutex::new(None),
            stopped: AtomicBool::new(false),
            media_seen: AtomicBool::new(false),
            last_pli: Mutex::new(None),
        })
    }

    /// Bind the publisher transport and start the feedback tickers
    pub fn attach_upstream(self: &Arc<Self>, transport: Arc<dyn Transport>) {
        *self.upstream.lock().unwrap() = Some(transport);
        tracing::debug!(plugin = %self.id, "jitter buffer attached to publisher");

        if self.config.remb_cycle > 0 {
            let jb = Arc::clone(self);
            let cycle = Duration::from_secs(self.config.remb_cycle);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(cycle);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if jb.stopped.load(Ordering::SeqCst) {
                        break;
                    }
                    jb.emit_remb().await;
                }
            });
        }

        if self.config.pli_cycle > 0 {
            let jb = Arc::clone(self);
            let cycle = Duration::from_secs(self.config.pli_cycle);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(cycle);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if jb.stopped.load(Ordering::SeqCst) {
                        break;
                    }
                    if jb.media_seen.swap(false, Ordering::SeqCst) {
                        jb.emit_pli().await;
                    }
                }
            });
        }
    }

    /// Point lookup for NACK retransmission
    ///
    /// Returns the packet only while it is still inside the retention
    /// window.
    pub fn get_packet(&self, ssrc: u32, seq: u16) -> Option<rtp::packet::Packet> {
        let window = Duration::from_millis(self.config.max_buffer_time);
        let buffers = self.buffers.lock().unwrap();
        buffers.get(&ssrc)?.get(seq, Instant::now(), window)
    }

    fn upstream(&self) -> Option<Arc<dyn Transport>> {
        self.upstream.lock().unwrap().clone()
    }

    /// Compute the receive bitrate over the last cycle and send one REMB
    async fn emit_remb(&self) {
        let Some(upstream) = self.upstream() else {
            return;
        };

        let (ssrcs, bits) = {
            let mut buffers = self.buffers.lock().unwrap();
            let mut ssrcs = Vec::with_capacity(buffers.len());
            let mut bits = 0u64;
            for (ssrc, buf) in buffers.iter_mut() {
                ssrcs.push(*ssrc);
                bits += buf.bytes_since_cycle * 8;
                buf.bytes_since_cycle = 0;
            }
            (ssrcs, bits)
        };
        if bits == 0 {
            return;
        }

        let mut bps = bits / self.config.remb_cycle.max(1);
        if self.config.max_bandwidth > 0 {
            bps = bps.min(self.config.max_bandwidth);
        }

        let remb = ReceiverEstimatedMaximumBitrate {
            sender_ssrc: 1,
            bitrate: bps as f32,
            ssrcs,
        };
        tracing::debug!(plugin = %self.id, bitrate = bps, "emitting remb");
        if let Err(e) = upstream.write_rtcp(Box::new(remb)).await {
            tracing::warn!(plugin = %self.id, error = %e, "remb write failed");
        }
    }

    /// Send one PLI per known SSRC, respecting the minimum interval
    async fn emit_pli(&self) {
        if self.config.pli_cycle == 0 {
            return;
        }
        let Some(upstream) = self.upstream() else {
            return;
        };

        let interval = Duration::from_secs(self.config.pli_cycle);
        let now = Instant::now();
        {
            let mut last = self.last_pli.lock().unwrap();
            if let Some(at) = *last {
                if now.duration_since(at) < interval {
                    return;
                }
            }
            *last = Some(now);
        }

        let ssrcs: Vec<u32> = self.buffers.lock().unwrap().keys().copied().collect();
        for ssrc in ssrcs {
            let pli = PictureLossIndication {
                sender_ssrc: 1,
                media_ssrc: ssrc,
            };
            if let Err(e) = upstream.write_rtcp(Box::new(pli)).await {
                tracing::warn!(plugin = %self.id, error = %e, "pli write failed");
            }
        }
    }
}

#[async_trait]
impl Plugin for JitterBuffer {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> PluginKind {
        PluginKind::JitterBuffer
    }

    async fn write_rtp(&self, pkt: rtp::packet::Packet) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Ok(());
        }

        let window = Duration::from_millis(self.config.max_buffer_time);
        let wide_gap = {
            let mut buffers = self.buffers.lock().unwrap();
            let buf = buffers.entry(pkt.header.ssrc).or_default();
            buf.push(Instant::now(), pkt.clone(), window)
        };
        self.media_seen.store(true, Ordering::SeqCst);

        if wide_gap {
            tracing::debug!(
                plugin = %self.id,
                ssrc = pkt.header.ssrc,
                seq = pkt.header.sequence_number,
                "sequence gap beyond repair, requesting key frame"
            );
            self.emit_pli().await;
        }

        let tx = self.out_tx.lock().unwrap().clone();
        if let Some(tx) = tx {
            // Receiver side only disappears at shutdown; a failed send is a
            // drop, not an error.
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
        tracing::debug!(plugin = %self.id, "jitter buffer stopped");
        self.out_tx.lock().unwrap().take();
    }

    fn as_any(&self) -> &(dyn std::any::Any + Send + Sync) {
        self
    }
}
