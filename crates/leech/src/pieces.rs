//! Piece and block scheduling.
//!
//! [`PieceManager`] is the only owner of piece/block state. Every operation
//! takes one `parking_lot` lock, never held across an `.await`, so sessions
//! can also release their claims from `Drop`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use leech_proto::Bitfield;
use parking_lot::Mutex;
use sha1::{Digest, Sha1};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::PieceError;
use crate::metainfo::TorrentMeta;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceStatus {
    Missing,
    InProgress,
    Verified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    Missing,
    Requested,
    Received,
}

/// A block handed out to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRequest {
    pub piece: u32,
    pub offset: u32,
    pub length: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    /// Stored, or a duplicate of something already held.
    Accepted,
    PieceVerified,
    /// Hash check failed; the whole piece went back to Missing.
    PieceCorrupt,
}

/// Sent once per piece to the disk writer.
#[derive(Debug, Clone)]
pub struct VerifiedPiece {
    pub index: u32,
    pub data: Bytes,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PieceCounts {
    pub missing: usize,
    pub in_progress: usize,
    pub verified: usize,
}

#[derive(Debug)]
struct BlockState {
    offset: u32,
    length: u32,
    status: BlockStatus,
    requested_at: Option<Instant>,
    owner: Option<SocketAddr>,
}

impl BlockState {
    fn reset(&mut self) {
        self.status = BlockStatus::Missing;
        self.requested_at = None;
        self.owner = None;
    }

    fn selectable(&self, now: Instant, timeout: Duration) -> bool {
        match self.status {
            BlockStatus::Missing => true,
            BlockStatus::Requested => self.expired(now, timeout),
            BlockStatus::Received => false,
        }
    }

    fn expired(&self, now: Instant, timeout: Duration) -> bool {
        self.status == BlockStatus::Requested
            && self.requested_at.map_or(true, |at| now.saturating_duration_since(at) >= timeout)
    }
}

#[derive(Debug)]
struct PieceState {
    hash: [u8; 20],
    length: u32,
    status: PieceStatus,
    blocks: Vec<BlockState>,
    /// Allocated on the first received block, released on verification.
    data: Vec<u8>,
}

impl PieceState {
    fn new(hash: [u8; 20], length: u32, block_size: u32) -> Self {
        let mut blocks = Vec::new();
        let mut offset = 0;
        while offset < length {
            let len = block_size.min(length - offset);
            blocks.push(BlockState { offset, length: len, status: BlockStatus::Missing, requested_at: None, owner: None });
            offset += len;
        }
        Self { hash, length, status: PieceStatus::Missing, blocks, data: Vec::new() }
    }

    fn block_index(&self, offset: u32) -> Option<usize> {
        self.blocks.binary_search_by_key(&offset, |b| b.offset).ok()
    }

    fn refresh_status(&mut self) {
        if self.status == PieceStatus::Verified {
            return;
        }
        self.status = if self.blocks.iter().all(|b| b.status == BlockStatus::Missing) {
            PieceStatus::Missing
        } else {
            PieceStatus::InProgress
        };
    }

    fn reset(&mut self) {
        for block in &mut self.blocks {
            block.reset();
        }
        self.status = PieceStatus::Missing;
    }
}

/// Tracks which peers have which pieces
#[derive(Debug)]
struct PieceAvailability {
    /// Number of connected peers that have each piece
    availability: Vec<u32>,
}

impl PieceAvailability {
    fn new(num_pieces: usize) -> Self {
        Self { availability: vec![0; num_pieces] }
    }

    fn add_peer(&mut self, bitfield: &Bitfield) {
        for idx in bitfield.iter_set() {
            if let Some(count) = self.availability.get_mut(idx) {
                *count += 1;
            }
        }
    }

    fn remove_peer(&mut self, bitfield: &Bitfield) {
        for idx in bitfield.iter_set() {
            if let Some(count) = self.availability.get_mut(idx) {
                *count = count.saturating_sub(1);
            }
        }
    }

    fn add_piece(&mut self, index: usize) {
        if let Some(count) = self.availability.get_mut(index) {
            *count += 1;
        }
    }

    fn get_rarity(&self, index: usize) -> u32 {
        self.availability.get(index).copied().unwrap_or(0)
    }
}

#[derive(Debug)]
struct State {
    pieces: Vec<PieceState>,
    availability: PieceAvailability,
    verified: usize,
    verified_bytes: u64,
    total_length: u64,
    request_timeout: Duration,
}

impl State {
    fn select(&self, have: &Bitfield, now: Instant) -> Option<BlockRequest> {
        let timeout = self.request_timeout;
        // rarest first, ties to the lowest index
        let (_, index, block) = self
            .pieces
            .iter()
            .enumerate()
            .filter(|(idx, piece)| piece.status != PieceStatus::Verified && have.has(*idx))
            .filter_map(|(idx, piece)| {
                piece
                    .blocks
                    .iter()
                    .position(|b| b.selectable(now, timeout))
                    .map(|block| (self.availability.get_rarity(idx), idx, block))
            })
            .min_by_key(|&(rarity, idx, _)| (rarity, idx))?;

        let b = &self.pieces[index].blocks[block];
        Some(BlockRequest { piece: index as u32, offset: b.offset, length: b.length })
    }

    fn block_mut(&mut self, piece: u32, offset: u32) -> Result<(&mut PieceState, usize), PieceError> {
        let state = self.pieces.get_mut(piece as usize).ok_or(PieceError::UnknownBlock { piece, offset })?;
        let idx = state.block_index(offset).ok_or(PieceError::UnknownBlock { piece, offset })?;
        Ok((state, idx))
    }

    fn mark_requested(&mut self, piece: u32, offset: u32, peer: SocketAddr, now: Instant) -> Result<(), PieceError> {
        let (state, idx) = self.block_mut(piece, offset)?;
        if state.status == PieceStatus::Verified || state.blocks[idx].status == BlockStatus::Received {
            return Ok(());
        }
        let block = &mut state.blocks[idx];
        block.status = BlockStatus::Requested;
        block.requested_at = Some(now);
        block.owner = Some(peer);
        state.refresh_status();
        Ok(())
    }

    fn mark_received(&mut self, piece: u32, offset: u32, data: &[u8]) -> Result<Received, PieceError> {
        let (state, idx) = self.block_mut(piece, offset)?;
        let expected = state.blocks[idx].length;
        if data.len() != expected as usize {
            return Err(PieceError::LengthMismatch { piece, offset, expected, got: data.len() });
        }
        if state.status == PieceStatus::Verified || state.blocks[idx].status == BlockStatus::Received {
            return Ok(Received::Duplicate);
        }

        if state.data.is_empty() {
            state.data = vec![0u8; state.length as usize];
        }
        let start = offset as usize;
        state.data[start..start + data.len()].copy_from_slice(data);
        let block = &mut state.blocks[idx];
        block.status = BlockStatus::Received;
        block.requested_at = None;
        block.owner = None;
        state.status = PieceStatus::InProgress;

        if !state.blocks.iter().all(|b| b.status == BlockStatus::Received) {
            return Ok(Received::Stored);
        }

        let digest = Sha1::digest(&state.data);
        if digest.as_slice() != &state.hash[..] {
            state.reset();
            return Ok(Received::Corrupt);
        }

        state.status = PieceStatus::Verified;
        let data = Bytes::from(std::mem::take(&mut state.data));
        self.verified += 1;
        self.verified_bytes += data.len() as u64;
        Ok(Received::Verified(data))
    }

    fn sweep(&mut self, now: Instant) -> usize {
        let timeout = self.request_timeout;
        self.reset_blocks(|b| b.expired(now, timeout))
    }

    fn release(&mut self, peer: SocketAddr) -> usize {
        self.reset_blocks(|b| b.status == BlockStatus::Requested && b.owner == Some(peer))
    }

    fn reset_blocks(&mut self, mut pred: impl FnMut(&BlockState) -> bool) -> usize {
        let mut reset = 0;
        for piece in self.pieces.iter_mut().filter(|p| p.status == PieceStatus::InProgress) {
            for block in piece.blocks.iter_mut().filter(|b| pred(b)) {
                block.reset();
                reset += 1;
            }
            piece.refresh_status();
        }
        reset
    }

    fn counts(&self) -> PieceCounts {
        let mut counts = PieceCounts::default();
        for piece in &self.pieces {
            match piece.status {
                PieceStatus::Missing => counts.missing += 1,
                PieceStatus::InProgress => counts.in_progress += 1,
                PieceStatus::Verified => counts.verified += 1,
            }
        }
        counts
    }
}

enum Received {
    Stored,
    Duplicate,
    Corrupt,
    Verified(Bytes),
}

#[derive(Debug)]
struct Shared {
    state: Mutex<State>,
    verified_tx: mpsc::UnboundedSender<VerifiedPiece>,
    completion_tx: watch::Sender<bool>,
}

/// Shared, cloneable handle to the piece table.
#[derive(Debug, Clone)]
pub struct PieceManager {
    shared: Arc<Shared>,
}

impl PieceManager {
    /// Build the table with every piece Missing. Verified pieces are delivered
    /// on the returned receiver.
    pub fn new(
        meta: &TorrentMeta,
        block_size: u32,
        request_timeout: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<VerifiedPiece>) {
        let block_size = block_size.max(1);
        let pieces = meta
            .pieces
            .iter()
            .enumerate()
            .map(|(idx, hash)| PieceState::new(*hash, meta.piece_size(idx as u32), block_size))
            .collect::<Vec<_>>();
        let state = State {
            availability: PieceAvailability::new(pieces.len()),
            pieces,
            verified: 0,
            verified_bytes: 0,
            total_length: meta.total_length,
            request_timeout,
        };
        let (verified_tx, verified_rx) = mpsc::unbounded_channel();
        let (completion_tx, _) = watch::channel(false);
        let shared = Shared { state: Mutex::new(state), verified_tx, completion_tx };
        (Self { shared: Arc::new(shared) }, verified_rx)
    }

    pub fn num_pieces(&self) -> usize {
        self.shared.state.lock().pieces.len()
    }

    pub fn select_next_block(&self, have: &Bitfield) -> Option<BlockRequest> {
        self.shared.state.lock().select(have, Instant::now())
    }

    pub fn mark_requested(&self, piece: u32, offset: u32, peer: SocketAddr) -> Result<(), PieceError> {
        self.shared.state.lock().mark_requested(piece, offset, peer, Instant::now())
    }

    /// Select and mark in one step, so two sessions never pick the same block.
    pub fn reserve_block(&self, peer: SocketAddr, have: &Bitfield) -> Option<BlockRequest> {
        let now = Instant::now();
        let mut state = self.shared.state.lock();
        let req = state.select(have, now)?;
        state.mark_requested(req.piece, req.offset, peer, now).ok()?;
        Some(req)
    }

    pub fn mark_received(&self, piece: u32, offset: u32, data: &[u8]) -> Result<BlockOutcome, PieceError> {
        let mut state = self.shared.state.lock();
        match state.mark_received(piece, offset, data)? {
            Received::Stored => Ok(BlockOutcome::Accepted),
            Received::Duplicate => {
                debug!(piece, offset, "duplicate block ignored");
                Ok(BlockOutcome::Accepted)
            }
            Received::Corrupt => {
                warn!(piece, "piece failed hash check, requeued");
                Ok(BlockOutcome::PieceCorrupt)
            }
            Received::Verified(data) => {
                let done = state.verified == state.pieces.len();
                debug!(piece, verified = state.verified, total = state.pieces.len(), "piece verified");
                if self.shared.verified_tx.send(VerifiedPiece { index: piece, data }).is_err() {
                    warn!(piece, "disk writer gone, verified piece dropped");
                }
                if done {
                    info!(pieces = state.pieces.len(), "all pieces verified");
                    self.shared.completion_tx.send_replace(true);
                }
                Ok(BlockOutcome::PieceVerified)
            }
        }
    }

    /// Revert every Requested block older than the request timeout.
    pub fn sweep_expired(&self) -> usize {
        self.shared.state.lock().sweep(Instant::now())
    }

    /// Surrender all blocks requested by `peer`.
    pub fn release_peer(&self, peer: SocketAddr) -> usize {
        self.shared.state.lock().release(peer)
    }

    pub fn add_peer(&self, bitfield: &Bitfield) {
        self.shared.state.lock().availability.add_peer(bitfield);
    }

    pub fn peer_has(&self, piece: u32) {
        self.shared.state.lock().availability.add_piece(piece as usize);
    }

    pub fn remove_peer(&self, bitfield: &Bitfield) {
        self.shared.state.lock().availability.remove_peer(bitfield);
    }

    pub fn needs(&self, piece: u32) -> bool {
        self.shared
            .state
            .lock()
            .pieces
            .get(piece as usize)
            .map_or(false, |p| p.status != PieceStatus::Verified)
    }

    pub fn wants_any(&self, have: &Bitfield) -> bool {
        let state = self.shared.state.lock();
        have.iter_set()
            .any(|idx| state.pieces.get(idx).map_or(false, |p| p.status != PieceStatus::Verified))
    }

    pub fn is_complete(&self) -> bool {
        let state = self.shared.state.lock();
        state.verified == state.pieces.len()
    }

    pub fn progress(&self) -> f64 {
        let state = self.shared.state.lock();
        if state.pieces.is_empty() {
            return 1.0;
        }
        state.verified as f64 / state.pieces.len() as f64
    }

    /// Bytes in verified pieces.
    pub fn downloaded(&self) -> u64 {
        self.shared.state.lock().verified_bytes
    }

    pub fn bytes_left(&self) -> u64 {
        let state = self.shared.state.lock();
        state.total_length.saturating_sub(state.verified_bytes)
    }

    pub fn piece_status(&self, piece: u32) -> Option<PieceStatus> {
        self.shared.state.lock().pieces.get(piece as usize).map(|p| p.status)
    }

    pub fn block_statuses(&self, piece: u32) -> Vec<BlockStatus> {
        self.shared
            .state
            .lock()
            .pieces
            .get(piece as usize)
            .map(|p| p.blocks.iter().map(|b| b.status).collect())
            .unwrap_or_default()
    }

    pub fn counts(&self) -> PieceCounts {
        self.shared.state.lock().counts()
    }

    /// Flips to `true` once, when the last piece verifies.
    pub fn completion(&self) -> watch::Receiver<bool> {
        self.shared.completion_tx.subscribe()
    }

    pub fn spawn_sweeper(&self, period: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let reset = manager.sweep_expired();
                        if reset > 0 {
                            debug!(reset, "expired block requests returned to the pool");
                        }
                    }
                }
            }
        })
    }
}
