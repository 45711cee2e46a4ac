use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::error::TrackerError;
use crate::metainfo::TorrentMeta;

pub mod http;

pub use http::{build_announce_url, parse_announce_response, TrackerClient};

/// Announce event type. Periodic re-announces carry no event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    Started,
    Stopped,
    Completed,
}

impl AnnounceEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnnounceEvent::Started => "started",
            AnnounceEvent::Stopped => "stopped",
            AnnounceEvent::Completed => "completed",
        }
    }
}

/// Transfer counters reported with every announce.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnnounceStats {
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
}

/// Request parameters for tracker announce
#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: Option<AnnounceEvent>,
    /// tracker-provided id to be echoed back in subsequent announces
    pub tracker_id: Option<String>,
}

impl AnnounceRequest {
    pub fn new(meta: &TorrentMeta, peer_id: [u8; 20], port: u16, stats: AnnounceStats, event: Option<AnnounceEvent>) -> Self {
        Self {
            info_hash: meta.info_hash,
            peer_id,
            port,
            uploaded: stats.uploaded,
            downloaded: stats.downloaded,
            left: stats.left,
            event,
            tracker_id: None,
        }
    }

    pub fn with_tracker_id(mut self, tracker_id: Option<String>) -> Self {
        self.tracker_id = tracker_id;
        self
    }
}

/// Response from tracker announce
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerResponse {
    pub interval: u32,
    pub min_interval: Option<u32>,
    pub tracker_id: Option<String>,
    pub peers: Vec<SocketAddr>,
    pub complete: Option<u32>,
    pub incomplete: Option<u32>,
    pub warning_message: Option<String>,
}

/// Parse compact peers string into a list of socket addresses
pub fn parse_compact_peers(peers: &[u8]) -> Result<Vec<SocketAddr>, TrackerError> {
    if peers.len() % 6 != 0 {
        return Err(TrackerError::Protocol(format!("compact peers length {} is not a multiple of 6", peers.len())));
    }
    Ok(peers
        .chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::new(IpAddr::V4(ip), port)
        })
        .collect())
}

/// Parse compact IPv6 peers ("peers6" style) into a list of socket addresses
pub fn parse_compact_peers_v6(peers: &[u8]) -> Result<Vec<SocketAddr>, TrackerError> {
    if peers.len() % 18 != 0 {
        return Err(TrackerError::Protocol(format!("compact peers6 length {} is not a multiple of 18", peers.len())));
    }
    Ok(peers
        .chunks_exact(18)
        .map(|chunk| {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&chunk[..16]);
            let port = u16::from_be_bytes([chunk[16], chunk[17]]);
            SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)
        })
        .collect())
}
