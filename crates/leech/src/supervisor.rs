use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use leech_proto::{Handshake, PEER_ID_LEN};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::disk::DiskManager;
use crate::error::LeechError;
use crate::metainfo::TorrentMeta;
use crate::peer::{CloseReason, PeerSession};
use crate::pieces::PieceManager;
use crate::tracker::{AnnounceEvent, AnnounceRequest, AnnounceStats, TrackerClient, TrackerResponse};

/// What a finished download reports back.
#[derive(Debug, Clone)]
pub struct DownloadSummary {
    pub name: String,
    pub info_hash: [u8; 20],
    pub pieces: usize,
    pub bytes: u64,
    pub files: Vec<PathBuf>,
    pub peers_tried: usize,
    pub elapsed: Duration,
}

enum Finish {
    Complete,
    Cancelled,
    Failed(LeechError),
}

/// Peers waiting to be dialed and peers with a live session.
struct Swarm {
    candidates: VecDeque<SocketAddr>,
    active: HashSet<SocketAddr>,
    tried: usize,
    tracker_id: Option<String>,
    interval: Duration,
    next_announce: Instant,
}

impl Swarm {
    fn new() -> Self {
        Self {
            candidates: VecDeque::new(),
            active: HashSet::new(),
            tried: 0,
            tracker_id: None,
            interval: Duration::from_secs(60),
            next_announce: Instant::now(),
        }
    }

    /// Queue peers that are neither connected nor already waiting.
    fn enqueue(&mut self, peers: impl IntoIterator<Item = SocketAddr>) -> usize {
        let mut added = 0;
        for addr in peers {
            if !self.active.contains(&addr) && !self.candidates.contains(&addr) {
                self.candidates.push_back(addr);
                added += 1;
            }
        }
        added
    }

    fn apply(&mut self, resp: &TrackerResponse) -> usize {
        if resp.tracker_id.is_some() {
            self.tracker_id = resp.tracker_id.clone();
        }
        let wait = resp.interval.max(resp.min_interval.unwrap_or(0)).max(1);
        self.interval = Duration::from_secs(wait as u64);
        self.next_announce = Instant::now() + self.interval;
        self.enqueue(resp.peers.iter().copied())
    }
}

/// Drives one torrent from the first announce to the last verified piece.
pub struct DownloadSupervisor {
    meta: Arc<TorrentMeta>,
    config: Arc<EngineConfig>,
    peer_id: [u8; PEER_ID_LEN],
    tracker: TrackerClient,
    cancel: CancellationToken,
}

impl DownloadSupervisor {
    pub fn new(meta: TorrentMeta, config: EngineConfig) -> Result<Self, LeechError> {
        let tracker = TrackerClient::new(&config)?;
        let peer_id = Handshake::random_peer_id(config.peer_id_prefix.as_bytes());
        Ok(Self { meta: Arc::new(meta), config: Arc::new(config), peer_id, tracker, cancel: CancellationToken::new() })
    }

    pub fn peer_id(&self) -> [u8; PEER_ID_LEN] {
        self.peer_id
    }

    /// Cancelling this token stops the download; safe to trigger repeatedly.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn run(self) -> Result<DownloadSummary, LeechError> {
        let started = Instant::now();
        let meta = self.meta.clone();
        info!(
            infohash = %meta.info_hash_hex(),
            name = %meta.name,
            pieces = meta.num_pieces(),
            size = meta.total_length,
            "starting download"
        );

        let disk = DiskManager::new(&self.config.download_dir, &meta).await?;
        let files: Vec<PathBuf> = disk.paths().map(|p| p.to_path_buf()).collect();
        let (manager, verified_rx) = PieceManager::new(&meta, self.config.block_size, self.config.request_timeout);
        let expected = meta.num_pieces();
        let mut writer = Some(tokio::spawn(async move { disk.drain(verified_rx, expected).await }));

        let sweep_cancel = self.cancel.child_token();
        let sweeper = manager.spawn_sweeper(self.config.sweep_interval, sweep_cancel.clone());
        let session_cancel = self.cancel.child_token();
        let mut sessions: JoinSet<(SocketAddr, CloseReason)> = JoinSet::new();
        let mut swarm = Swarm::new();

        let finish = self.drive(&manager, &mut writer, &mut sessions, &session_cancel, &mut swarm).await;

        // teardown
        session_cancel.cancel();
        while let Some(joined) = sessions.join_next().await {
            if let Ok((addr, reason)) = joined {
                debug!(peer = %addr, ?reason, "session finished during shutdown");
            }
        }
        sweep_cancel.cancel();
        let _ = sweeper.await;
        let stats = self.stats(&manager);
        drop(manager);
        let written = match writer.take() {
            Some(handle) => join_writer(handle).await,
            None => Ok(expected),
        };

        match finish {
            Finish::Complete => {
                let written = written?;
                self.announce_once(AnnounceEvent::Completed, stats, swarm.tracker_id.clone()).await;
                let summary = DownloadSummary {
                    name: meta.name.clone(),
                    info_hash: meta.info_hash,
                    pieces: written,
                    bytes: meta.total_length,
                    files,
                    peers_tried: swarm.tried,
                    elapsed: started.elapsed(),
                };
                info!(pieces = summary.pieces, elapsed = ?summary.elapsed, peers = summary.peers_tried, "download complete");
                Ok(summary)
            }
            Finish::Cancelled => {
                if let Err(e) = written {
                    warn!(error = %e, "disk writer failed during shutdown");
                }
                self.announce_once(AnnounceEvent::Stopped, stats, swarm.tracker_id.clone()).await;
                info!("download cancelled");
                Err(LeechError::Cancelled)
            }
            Finish::Failed(e) => {
                if let LeechError::Io(_) = e {
                    self.announce_once(AnnounceEvent::Stopped, stats, swarm.tracker_id.clone()).await;
                }
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        manager: &PieceManager,
        writer: &mut Option<JoinHandle<std::io::Result<usize>>>,
        sessions: &mut JoinSet<(SocketAddr, CloseReason)>,
        session_cancel: &CancellationToken,
        swarm: &mut Swarm,
    ) -> Finish {
        // no peers were ever obtained if this fails, so it ends the download
        let started = self.request(manager, Some(AnnounceEvent::Started), None);
        let first = tokio::select! {
            _ = self.cancel.cancelled() => return Finish::Cancelled,
            res = self.tracker.announce_with_retry(&self.meta, &started) => res,
        };
        match first {
            Ok(resp) => {
                let added = swarm.apply(&resp);
                info!(interval = resp.interval, peers = added, seeders = ?resp.complete, leechers = ?resp.incomplete, "tracker announce ok");
            }
            Err(e) => {
                warn!(error = %e, "initial announce failed");
                return Finish::Failed(e.into());
            }
        }

        let mut completion = manager.completion();
        loop {
            if *completion.borrow_and_update() {
                return Finish::Complete;
            }
            self.fill_sessions(manager, sessions, session_cancel, swarm);
            let exhausted = swarm.candidates.is_empty();

            tokio::select! {
                _ = self.cancel.cancelled() => return Finish::Cancelled,
                changed = completion.changed() => {
                    if changed.is_err() {
                        return Finish::Cancelled;
                    }
                }
                res = poll_writer(writer), if writer.is_some() => {
                    *writer = None;
                    match res {
                        Ok(Ok(written)) => debug!(written, "disk writer finished"),
                        Ok(Err(e)) => return Finish::Failed(e.into()),
                        Err(e) => return Finish::Failed(std::io::Error::new(std::io::ErrorKind::Other, e).into()),
                    }
                }
                Some(joined) = sessions.join_next() => {
                    match joined {
                        Ok((addr, reason)) => {
                            swarm.active.remove(&addr);
                            debug!(peer = %addr, ?reason, active = swarm.active.len(), "session ended");
                        }
                        Err(e) => warn!(error = %e, "session task failed"),
                    }
                }
                _ = tokio::time::sleep_until(swarm.next_announce), if exhausted => {
                    self.reannounce(manager, swarm).await;
                }
            }
        }
    }

    fn fill_sessions(
        &self,
        manager: &PieceManager,
        sessions: &mut JoinSet<(SocketAddr, CloseReason)>,
        session_cancel: &CancellationToken,
        swarm: &mut Swarm,
    ) {
        while swarm.active.len() < self.config.max_peers {
            let Some(addr) = swarm.candidates.pop_front() else { break };
            swarm.active.insert(addr);
            swarm.tried += 1;
            let mut session = PeerSession::new(
                addr,
                self.meta.info_hash,
                self.peer_id,
                manager.clone(),
                self.config.clone(),
                session_cancel.child_token(),
            );
            debug!(peer = %addr, "dialing");
            sessions.spawn(async move {
                let reason = session.connect().await;
                (addr, reason)
            });
        }
    }

    async fn reannounce(&self, manager: &PieceManager, swarm: &mut Swarm) {
        let req = self.request(manager, None, swarm.tracker_id.clone());
        let res = tokio::select! {
            _ = self.cancel.cancelled() => return,
            res = self.tracker.announce_with_retry(&self.meta, &req) => res,
        };
        match res {
            Ok(resp) => {
                let added = swarm.apply(&resp);
                info!(interval = resp.interval, new_peers = added, "tracker re-announce ok");
            }
            Err(e) => {
                swarm.next_announce = Instant::now() + swarm.interval;
                warn!(error = %e, retry_in = ?swarm.interval, "tracker re-announce failed");
            }
        }
    }

    async fn announce_once(&self, event: AnnounceEvent, stats: AnnounceStats, tracker_id: Option<String>) {
        let req = AnnounceRequest::new(&self.meta, self.peer_id, self.config.listen_port, stats, Some(event))
            .with_tracker_id(tracker_id);
        match self.tracker.announce(&self.meta, &req).await {
            Ok(_) => debug!(event = event.as_str(), "final announce sent"),
            Err(e) => debug!(event = event.as_str(), error = %e, "final announce failed"),
        }
    }

    fn stats(&self, manager: &PieceManager) -> AnnounceStats {
        AnnounceStats { uploaded: 0, downloaded: manager.downloaded(), left: manager.bytes_left() }
    }

    fn request(&self, manager: &PieceManager, event: Option<AnnounceEvent>, tracker_id: Option<String>) -> AnnounceRequest {
        AnnounceRequest::new(&self.meta, self.peer_id, self.config.listen_port, self.stats(manager), event)
            .with_tracker_id(tracker_id)
    }
}

async fn poll_writer(writer: &mut Option<JoinHandle<std::io::Result<usize>>>) -> Result<std::io::Result<usize>, tokio::task::JoinError> {
    match writer.as_mut() {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

async fn join_writer(handle: JoinHandle<std::io::Result<usize>>) -> std::io::Result<usize> {
    handle.await.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?
}
