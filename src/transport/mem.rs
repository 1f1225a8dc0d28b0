//! In-process transport over tokio channels
//!
//! `MemTransport` implements the full [`Transport`] contract without any
//! network underneath. The paired [`MemHandle`] plays the remote peer: it
//! feeds inbound RTP/RTCP and observes everything the router writes. The
//! write path can be switched into failing or blocking mode to exercise the
//! router's write-error budget and queue-overflow behavior.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};

use super::{RtcpPacket, Transport};
use crate::error::{Error, Result};

type CloseCallback = Box<dyn FnOnce() + Send>;

/// Channel-backed transport for tests and local loopback wiring
pub struct MemTransport {
    id: String,
    rtp_in: AsyncMutex<mpsc::UnboundedReceiver<rtp::packet::Packet>>,
    rtp_out: mpsc::UnboundedSender<rtp::packet::Packet>,
    rtcp_out: mpsc::UnboundedSender<RtcpPacket>,
    rtcp_stream: Mutex<Option<mpsc::UnboundedReceiver<RtcpPacket>>>,
    write_errs: AtomicU64,
    fail_rtp_writes: AtomicBool,
    write_gate: watch::Sender<bool>,
    closed: watch::Sender<bool>,
    on_close_cb: Mutex<Option<CloseCallback>>,
}

/// Remote-peer handle paired with a [`MemTransport`]
///
/// Everything the transport reads comes from `push_rtp`/`push_rtcp`;
/// everything written to the transport shows up on the `written_*`
/// receivers.
pub struct MemHandle {
    rtp_tx: mpsc::UnboundedSender<rtp::packet::Packet>,
    rtcp_tx: mpsc::UnboundedSender<RtcpPacket>,
    /// RTP packets written by the router toward this peer
    pub written_rtp: mpsc::UnboundedReceiver<rtp::packet::Packet>,
    /// RTCP packets written by the router toward this peer
    pub written_rtcp: mpsc::UnboundedReceiver<RtcpPacket>,
}

impl MemTransport {
    /// Create a transport and its peer handle
    ///
    /// Must be called within a tokio runtime: the transport spawns one task
    /// that ends the RTCP stream when the transport closes.
    pub fn new(id: impl Into<String>) -> (Arc<Self>, MemHandle) {
        let (rtp_in_tx, rtp_in_rx) = mpsc::unbounded_channel();
        let (rtp_out_tx, rtp_out_rx) = mpsc::unbounded_channel();
        let (rtcp_out_tx, rtcp_out_rx) = mpsc::unbounded_channel();
        let (rtcp_in_tx, mut rtcp_in_rx) = mpsc::unbounded_channel::<RtcpPacket>();
        let (stream_tx, stream_rx) = mpsc::unbounded_channel();
        let (closed_tx, _) = watch::channel(false);
        let (gate_tx, _) = watch::channel(false);

        // Pump inbound RTCP into the stream handed to the router, dropping
        // the stream sender when the transport closes so consumers see the
        // stream end.
        let mut closed_rx = closed_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = closed_rx.changed() => break,
                    pkt = rtcp_in_rx.recv() => match pkt {
                        Some(pkt) => {
                            if stream_tx.send(pkt).is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });

        let transport = Arc::new(Self {
            id: id.into(),
            rtp_in: AsyncMutex::new(rtp_in_rx),
            rtp_out: rtp_out_tx,
            rtcp_out: rtcp_out_tx,
            rtcp_stream: Mutex::new(Some(stream_rx)),
            write_errs: AtomicU64::new(0),
            fail_rtp_writes: AtomicBool::new(false),
            write_gate: gate_tx,
            closed: closed_tx,
            on_close_cb: Mutex::new(None),
        });

        let handle = MemHandle {
            rtp_tx: rtp_in_tx,
            rtcp_tx: rtcp_in_tx,
            written_rtp: rtp_out_rx,
            written_rtcp: rtcp_out_rx,
        };

        (transport, handle)
    }

    /// When set, every `write_rtp` fails and counts against the error budget
    pub fn set_write_rtp_failing(&self, failing: bool) {
        self.fail_rtp_writes.store(failing, Ordering::SeqCst);
    }

    /// When set, `write_rtp` parks until unblocked (or the transport closes)
    pub fn set_write_rtp_blocked(&self, blocked: bool) {
        let _ = self.write_gate.send_replace(blocked);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

#[async_trait]
impl Transport for MemTransport {
    fn id(&self) -> &str {
        &self.id
    }

    async fn read_rtp(&self) -> Result<rtp::packet::Packet> {
        let mut rtp_in = self.rtp_in.lock().await;
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(Error::TransportClosed);
        }
        tokio::select! {
            _ = closed.changed() => Err(Error::TransportClosed),
            pkt = rtp_in.recv() => pkt.ok_or(Error::TransportClosed),
        }
    }

    async fn write_rtp(&self, pkt: &rtp::packet::Packet) -> Result<()> {
        let mut gate = self.write_gate.subscribe();
        let mut closed = self.closed.subscribe();
        loop {
            if *closed.borrow() {
                return Err(Error::TransportClosed);
            }
            if !*gate.borrow() {
                break;
            }
            tokio::select! {
                _ = gate.changed() => {}
                _ = closed.changed() => {}
            }
        }
        if self.fail_rtp_writes.load(Ordering::SeqCst) {
            self.write_errs.fetch_add(1, Ordering::SeqCst);
            return Err(Error::WriteRtp("simulated write failure".into()));
        }
        self.rtp_out
            .send(pkt.clone())
            .map_err(|_| Error::TransportClosed)
    }

    async fn write_rtcp(&self, pkt: RtcpPacket) -> Result<()> {
        if self.is_closed() {
            return Err(Error::TransportClosed);
        }
        self.rtcp_out.send(pkt).map_err(|_| Error::TransportClosed)
    }

    fn take_rtcp_stream(&self) -> Option<mpsc::UnboundedReceiver<RtcpPacket>> {
        self.rtcp_stream.lock().unwrap().take()
    }

    fn write_err_total(&self) -> u64 {
        self.write_errs.load(Ordering::SeqCst)
    }

    fn write_err_reset(&self) {
        self.write_errs.store(0, Ordering::SeqCst);
    }

    fn on_close(&self, cb: Box<dyn FnOnce() + Send>) {
        if self.is_closed() {
            // Late registration on a dead transport still fires once.
            cb();
            return;
        }
        *self.on_close_cb.lock().unwrap() = Some(cb);
    }

    async fn close(&self) {
        let was_closed = self.closed.send_replace(true);
        if was_closed {
            return;
        }
        tracing::debug!(transport = %self.id, "mem transport closed");
        let cb = self.on_close_cb.lock().unwrap().take();
        if let Some(cb) = cb {
            cb();
        }
    }
}

impl MemHandle {
    /// Feed one RTP packet into the transport's read side
    pub fn push_rtp(&self, pkt: rtp::packet::Packet) -> bool {
        self.rtp_tx.send(pkt).is_ok()
    }

    /// Feed one RTCP packet into the transport's feedback stream
    pub fn push_rtcp(&self, pkt: RtcpPacket) -> bool {
        self.rtcp_tx.send(pkt).is_ok()
    }

    /// Drain every RTP packet written so far without waiting
    pub fn drain_written_rtp(&mut self) -> Vec<rtp::packet::Packet> {
        let mut out = Vec::new();
        while let Ok(pkt) = self.written_rtp.try_recv() {
            out.push(pkt);
        }
        out
    }

    /// Drain every RTCP packet written so far without waiting
    pub fn drain_written_rtcp(&mut self) -> Vec<RtcpPacket> {
        let mut out = Vec::new();
        while let Ok(pkt) = self.written_rtcp.try_recv() {
            out.push(pkt);
        }
        out
    }
}
