//! Local fan-out demo over in-memory transports
//!
//! Run with: cargo run --example local_fanout
//!
//! One publisher feeds 500 RTP packets through a jitter-buffered chain to
//! two subscribers; one subscriber NACKs a packet and gets it retransmitted
//! from the buffer. Prints the router's forwarding counters at the end.

use std::time::Duration;

use sfu_router::{
    JitterBufferConfig, MemTransport, PluginConfig, Router, RouterConfig, Result,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let router = Router::new("demo-session", RouterConfig::default());
    let plugins = PluginConfig::default().enabled().jitter_buffer(
        JitterBufferConfig::default()
            .enabled()
            .remb_cycle(0)
            .pli_cycle(0),
    );
    router.init_plugins(plugins).await?;

    let (publisher, pub_handle) = MemTransport::new("publisher");
    router.add_pub(publisher).await?;

    let (sub_a, mut handle_a) = MemTransport::new("viewer-a");
    let (sub_b, mut handle_b) = MemTransport::new("viewer-b");
    router.add_sub("a", sub_a).await;
    router.add_sub("b", sub_b).await;

    for seq in 1..=500u16 {
        let pkt = rtp::packet::Packet {
            header: rtp::header::Header {
                ssrc: 7,
                sequence_number: seq,
                ..Default::default()
            },
            payload: vec![0u8; 1200].into(),
        };
        pub_handle.push_rtp(pkt);
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    let got_a = handle_a.drain_written_rtp().len();
    let got_b = handle_b.drain_written_rtp().len();
    println!("viewer-a received {got_a} packets, viewer-b received {got_b}");

    // Viewer B pretends it lost packet 123; the buffer serves it locally.
    use rtcp::transport_feedbacks::transport_layer_nack::{NackPair, TransportLayerNack};
    handle_b.push_rtcp(Box::new(TransportLayerNack {
        sender_ssrc: 2,
        media_ssrc: 7,
        nacks: vec![NackPair {
            packet_id: 123,
            lost_packets: 0,
        }],
    }));
    tokio::time::sleep(Duration::from_millis(100)).await;
    let retransmits = handle_b.drain_written_rtp();
    println!(
        "viewer-b nacked seq 123, got {} retransmit(s)",
        retransmits.len()
    );

    let stats = router.stats().snapshot();
    println!(
        "stats: forwarded={} dropped={} nacks_served={} nacks_upstream={}",
        stats.packets_forwarded, stats.packets_dropped, stats.nacks_served, stats.nacks_upstream
    );

    router.close().await;
    Ok(())
}
