//! Per-connection statistics snapshots, taken from quinn during `poll`.

use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub lost_packets: u64,
    pub rtt: Duration,
    pub congestion_window: u64,
    /// Total congestion events observed on the path.
    pub congestion_events: u64,
}

pub(crate) fn from_quinn(stats: &quinn::ConnectionStats) -> SessionStats {
    SessionStats {
        rx_packets: stats.udp_rx.datagrams,
        tx_packets: stats.udp_tx.datagrams,
        rx_bytes: stats.udp_rx.bytes,
        tx_bytes: stats.udp_tx.bytes,
        lost_packets: stats.path.lost_packets,
        rtt: stats.path.rtt,
        congestion_window: stats.path.cwnd,
        congestion_events: stats.path.congestion_events,
    }
}
