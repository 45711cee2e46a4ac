use crate::config::EngineConfig;
use crate::error::PeerError;
use crate::net::transport::{self, Transport};
use crate::pieces::{BlockOutcome, PieceManager};
use futures::{SinkExt, StreamExt};
use leech_proto::{Bitfield, Handshake, Message, MessageCodec, MessageError, HANDSHAKE_LEN, HASH_LEN, PEER_ID_LEN};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const TICK: Duration = Duration::from_millis(250);

type PeerFramed = Framed<Transport, MessageCodec>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason { Complete, PeerClosed, ProtocolError, HandshakeMismatch, Timeout, Cancelled }

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState { Connecting, Handshaking, Active, Closed(CloseReason) }

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerState { pub peer_choking: bool, pub am_interested: bool, pub am_choking: bool, pub peer_interested: bool }
impl Default for PeerState { fn default() -> Self { Self { peer_choking: true, am_interested: false, am_choking: true, peer_interested: false } } }

fn close_reason(err: &PeerError) -> CloseReason {
	match err {
		PeerError::Network(_) | PeerError::Message(MessageError::Io(_)) => CloseReason::PeerClosed,
		PeerError::InfoHashMismatch { .. } => CloseReason::HandshakeMismatch,
		PeerError::Timeout => CloseReason::Timeout,
		PeerError::Handshake(_) | PeerError::Message(_) | PeerError::Protocol(_) => CloseReason::ProtocolError,
	}
}

/// A session's stake in the piece table: the availability it contributed and
/// the blocks it reserved. Released exactly once, at the latest on drop.
#[derive(Debug)]
pub struct PeerLease {
	addr: SocketAddr,
	manager: PieceManager,
	bitfield: Bitfield,
	released: bool,
}

impl PeerLease {
	pub fn new(addr: SocketAddr, manager: PieceManager, num_pieces: usize) -> Self { Self { addr, manager, bitfield: Bitfield::new(num_pieces), released: false } }
	pub fn bitfield(&self) -> &Bitfield { &self.bitfield }

	pub fn set_bitfield(&mut self, bitfield: Bitfield) {
		if self.released { return; }
		self.manager.remove_peer(&self.bitfield);
		self.manager.add_peer(&bitfield);
		self.bitfield = bitfield;
	}

	/// Returns false if the piece was already known.
	pub fn add_piece(&mut self, index: u32) -> bool {
		if self.released || !self.bitfield.set(index as usize) { return false; }
		self.manager.peer_has(index);
		true
	}

	pub fn release(&mut self) {
		if std::mem::replace(&mut self.released, true) { return; }
		self.manager.remove_peer(&self.bitfield);
		let surrendered = self.manager.release_peer(self.addr);
		if surrendered > 0 { debug!(peer = %self.addr, surrendered, "released outstanding blocks"); }
	}
}

impl Drop for PeerLease { fn drop(&mut self) { self.release(); } }

pub struct PeerSession {
	addr: SocketAddr,
	info_hash: [u8; HASH_LEN],
	peer_id: [u8; PEER_ID_LEN],
	remote_peer_id: Option<[u8; PEER_ID_LEN]>,
	num_pieces: usize,
	manager: PieceManager,
	config: Arc<EngineConfig>,
	cancel: CancellationToken,
	state: SessionState,
	peer: PeerState,
	lease: PeerLease,
	got_bitfield: bool,
	outstanding: HashMap<(u32, u32), Instant>,
	last_rx: Instant,
	last_tx: Instant,
}

impl PeerSession {
	pub fn new(addr: SocketAddr, info_hash: [u8; HASH_LEN], peer_id: [u8; PEER_ID_LEN], manager: PieceManager, config: Arc<EngineConfig>, cancel: CancellationToken) -> Self {
		let num_pieces = manager.num_pieces();
		let lease = PeerLease::new(addr, manager.clone(), num_pieces);
		let now = Instant::now();
		Self { addr, info_hash, peer_id, remote_peer_id: None, num_pieces, manager, config, cancel, state: SessionState::Connecting, peer: PeerState::default(), lease, got_bitfield: false, outstanding: HashMap::new(), last_rx: now, last_tx: now }
	}
	pub fn remote_addr(&self) -> SocketAddr { self.addr }
	pub fn remote_peer_id(&self) -> Option<[u8; PEER_ID_LEN]> { self.remote_peer_id }
	pub fn state(&self) -> SessionState { self.state }
	pub fn peer_state(&self) -> &PeerState { &self.peer }

	/// Dial the peer and run the session to completion.
	pub async fn connect(&mut self) -> CloseReason {
		self.state = SessionState::Connecting;
		let cancel = self.cancel.clone();
		let dial = tokio::select! {
			_ = cancel.cancelled() => return self.finish(CloseReason::Cancelled),
			res = transport::connect(self.addr, self.config.connect_timeout) => res,
		};
		match dial {
			Ok(stream) => self.run(stream).await,
			Err(e) if e.kind() == std::io::ErrorKind::TimedOut => { debug!(peer = %self.addr, "connect timed out"); self.finish(CloseReason::Timeout) }
			Err(e) => { debug!(peer = %self.addr, error = %e, "connect failed"); self.finish(CloseReason::PeerClosed) }
		}
	}

	/// Run the handshake and message loop over an established stream.
	pub async fn run(&mut self, stream: Transport) -> CloseReason {
		let cancel = self.cancel.clone();
		let reason = tokio::select! {
			_ = cancel.cancelled() => CloseReason::Cancelled,
			res = self.drive(stream) => match res {
				Ok(reason) => reason,
				Err(e) => {
					let reason = close_reason(&e);
					match reason { CloseReason::ProtocolError | CloseReason::HandshakeMismatch => warn!(peer = %self.addr, error = %e, "closing session"), _ => debug!(peer = %self.addr, error = %e, "closing session") }
					reason
				}
			},
		};
		self.finish(reason)
	}

	fn finish(&mut self, reason: CloseReason) -> CloseReason {
		self.state = SessionState::Closed(reason);
		self.outstanding.clear();
		self.lease.release();
		debug!(peer = %self.addr, ?reason, "session closed");
		reason
	}

	async fn drive(&mut self, stream: Transport) -> Result<CloseReason, PeerError> {
		let stream = self.perform_handshake(stream).await?;
		info!(peer = %self.addr, remote_peer_id = %String::from_utf8_lossy(&self.remote_peer_id.unwrap_or_default()), "handshake completed");
		self.state = SessionState::Active;
		let mut framed = Framed::new(stream, MessageCodec::new(self.config.max_frame_len));
		self.send_interested(&mut framed).await?;
		self.message_loop(&mut framed).await
	}

	async fn perform_handshake(&mut self, mut stream: Transport) -> Result<Transport, PeerError> {
		self.state = SessionState::Handshaking;
		let ours = Handshake::new(self.info_hash, self.peer_id);
		stream.write_all(&ours.encode()).await?;
		let mut buf = [0u8; HANDSHAKE_LEN];
		tokio::time::timeout(self.config.handshake_timeout, stream.read_exact(&mut buf)).await.map_err(|_| PeerError::Timeout)??;
		let incoming = Handshake::decode(&buf)?;
		if !incoming.is_for(&self.info_hash) { return Err(PeerError::info_hash_mismatch(self.info_hash, incoming.info_hash)); }
		self.remote_peer_id = Some(incoming.peer_id);
		self.last_rx = Instant::now();
		Ok(stream)
	}

	async fn message_loop(&mut self, framed: &mut PeerFramed) -> Result<CloseReason, PeerError> {
		let mut completion = self.manager.completion();
		let period = TICK.min(self.config.keepalive_interval).min(self.config.idle_timeout);
		let mut tick = tokio::time::interval(period);
		tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
		loop {
			if *completion.borrow_and_update() { return Ok(CloseReason::Complete); }
			tokio::select! {
				frame = framed.next() => match frame {
					None => return Ok(CloseReason::PeerClosed),
					Some(frame) => { let msg = frame?; self.last_rx = Instant::now(); self.handle_message(framed, msg).await?; }
				},
				changed = completion.changed() => { if changed.is_err() { return Ok(CloseReason::Cancelled); } }
				_ = tick.tick() => { self.on_tick(framed).await?; }
			}
		}
	}

	async fn on_tick(&mut self, framed: &mut PeerFramed) -> Result<(), PeerError> {
		let now = Instant::now();
		if now.duration_since(self.last_rx) >= self.config.idle_timeout { return Err(PeerError::Timeout); }
		if now.duration_since(self.last_tx) >= self.config.keepalive_interval { self.send_message(framed, Message::KeepAlive).await?; }
		// the manager reclaims these on its own; stop counting them against the pipeline
		let timeout = self.config.request_timeout;
		let before = self.outstanding.len();
		self.outstanding.retain(|_, at| now.duration_since(*at) < timeout);
		if self.outstanding.len() < before { debug!(peer = %self.addr, dropped = before - self.outstanding.len(), "stale requests dropped"); }
		self.fill_pipeline(framed).await
	}

	async fn handle_message(&mut self, framed: &mut PeerFramed, msg: Message) -> Result<(), PeerError> {
		match &msg { Message::Piece { index, begin, data } => debug!(peer = %self.addr, piece = index, offset = begin, size = data.len(), "received block"), other => debug!(peer = %self.addr, message = ?other, "received message") }
		match msg {
			Message::KeepAlive => {}
			Message::Choke => { self.peer.peer_choking = true; self.outstanding.clear(); }
			Message::Unchoke => { self.peer.peer_choking = false; self.fill_pipeline(framed).await?; }
			Message::Interested => { self.peer.peer_interested = true; }
			Message::NotInterested => { self.peer.peer_interested = false; }
			Message::Have(index) => {
				if index as usize >= self.num_pieces { return Err(PeerError::Protocol(format!("have for piece {} of {}", index, self.num_pieces))); }
				self.lease.add_piece(index);
				if !self.peer.am_interested && self.manager.needs(index) { self.send_interested(framed).await?; }
				self.fill_pipeline(framed).await?;
			}
			Message::Bitfield(data) => {
				if self.got_bitfield { return Err(PeerError::Protocol("second bitfield".into())); }
				self.got_bitfield = true;
				let mut bitfield = Bitfield::from_payload(&data, self.num_pieces)?;
				// keep pieces announced with `have` before the bitfield
				for idx in self.lease.bitfield().iter_set().collect::<Vec<_>>() { bitfield.set(idx); }
				let wanted = self.manager.wants_any(&bitfield);
				self.lease.set_bitfield(bitfield);
				if wanted && !self.peer.am_interested { self.send_interested(framed).await?; } else if !wanted && self.peer.am_interested { self.send_not_interested(framed).await?; }
				self.fill_pipeline(framed).await?;
			}
			Message::Request { index, begin, length } => { debug!(peer = %self.addr, piece = index, offset = begin, length, "ignoring upload request"); }
			Message::Cancel { .. } => {}
			Message::Piece { index, begin, data } => {
				self.outstanding.remove(&(index, begin));
				match self.manager.mark_received(index, begin, &data)? {
					BlockOutcome::Accepted => {}
					BlockOutcome::PieceVerified => info!(peer = %self.addr, piece = index, "piece verified"),
					BlockOutcome::PieceCorrupt => warn!(peer = %self.addr, piece = index, "piece failed verification"),
				}
				self.fill_pipeline(framed).await?;
			}
			Message::Port(port) => { debug!(peer = %self.addr, port, "peer announced DHT port"); }
		}
		Ok(())
	}

	async fn fill_pipeline(&mut self, framed: &mut PeerFramed) -> Result<(), PeerError> {
		if self.peer.peer_choking { return Ok(()); }
		while self.outstanding.len() < self.config.pipeline_depth {
			let Some(req) = self.manager.reserve_block(self.addr, self.lease.bitfield()) else { break };
			self.outstanding.insert((req.piece, req.offset), Instant::now());
			self.send_message(framed, Message::Request { index: req.piece, begin: req.offset, length: req.length }).await?;
		}
		Ok(())
	}

	async fn send_message(&mut self, framed: &mut PeerFramed, msg: Message) -> Result<(), PeerError> { framed.send(msg).await?; self.last_tx = Instant::now(); Ok(()) }
	async fn send_interested(&mut self, framed: &mut PeerFramed) -> Result<(), PeerError> { self.peer.am_interested = true; self.send_message(framed, Message::Interested).await }
	async fn send_not_interested(&mut self, framed: &mut PeerFramed) -> Result<(), PeerError> { self.peer.am_interested = false; self.send_message(framed, Message::NotInterested).await }
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::pieces::{BlockStatus, PieceCounts, VerifiedPiece};
	use crate::testutil::{sample_meta, serve_seeder};
	use crate::metainfo::TorrentMeta;
	use tokio::io::DuplexStream;
	use tokio::sync::mpsc;

	const PEER_ID: [u8; 20] = *b"-LE0100-testtesttest";

	fn addr() -> SocketAddr { SocketAddr::from(([127, 0, 0, 1], 51413)) }

	fn fixture() -> (TorrentMeta, Arc<Vec<u8>>, PieceManager, mpsc::UnboundedReceiver<VerifiedPiece>) {
		let content: Vec<u8> = (0..54u32).map(|i| (i * 13 % 256) as u8).collect();
		let meta = sample_meta("http://t.example/announce", &content, 16);
		let (manager, rx) = PieceManager::new(&meta, 8, Duration::from_secs(30));
		(meta, Arc::new(content), manager, rx)
	}

	fn session(meta: &TorrentMeta, manager: &PieceManager, config: EngineConfig) -> PeerSession {
		PeerSession::new(addr(), meta.info_hash, PEER_ID, manager.clone(), Arc::new(config), CancellationToken::new())
	}

	/// Remote side that has done its half of the handshake.
	async fn scripted_peer(mut remote: DuplexStream, info_hash: [u8; 20]) -> Framed<DuplexStream, MessageCodec> {
		let mut buf = [0u8; HANDSHAKE_LEN];
		remote.read_exact(&mut buf).await.unwrap();
		assert_eq!(Handshake::decode(&buf).unwrap().peer_id, PEER_ID);
		remote.write_all(&Handshake::new(info_hash, *b"-SC0001-scriptedpeer").encode()).await.unwrap();
		Framed::new(remote, MessageCodec::default())
	}

	async fn next_non_keepalive(framed: &mut Framed<DuplexStream, MessageCodec>) -> Message {
		loop {
			match framed.next().await.unwrap().unwrap() { Message::KeepAlive => continue, msg => return msg }
		}
	}

	#[tokio::test]
	async fn downloads_everything_from_one_seeder() {
		let (meta, content, manager, mut rx) = fixture();
		let (local, remote) = tokio::io::duplex(64 * 1024);
		let seeder = tokio::spawn(serve_seeder(remote, meta.clone(), content.clone()));

		let mut session = session(&meta, &manager, EngineConfig::default());
		assert_eq!(session.run(Box::new(local)).await, CloseReason::Complete);
		assert_eq!(session.state(), SessionState::Closed(CloseReason::Complete));
		assert!(manager.is_complete());

		let seen = seeder.await.unwrap();
		assert_eq!(seen[0], Message::Interested);
		let requests = seen.iter().filter(|m| matches!(m, Message::Request { .. })).count();
		assert_eq!(requests, 7);

		let mut pieces = 0;
		while let Ok(piece) = rx.try_recv() {
			let start = piece.index as usize * 16;
			assert_eq!(&piece.data[..], &content[start..start + piece.data.len()]);
			pieces += 1;
		}
		assert_eq!(pieces, 4);
	}

	#[tokio::test]
	async fn mismatched_info_hash_closes_after_handshake() {
		let (meta, _content, manager, _rx) = fixture();
		let (local, mut remote) = tokio::io::duplex(64 * 1024);
		let peer = tokio::spawn(async move {
			remote.write_all(&Handshake::new([0x99; 20], *b"-XX0001-otherpeer000").encode()).await.unwrap();
			let mut received = Vec::new();
			remote.read_to_end(&mut received).await.unwrap();
			received
		});

		let mut session = session(&meta, &manager, EngineConfig::default());
		assert_eq!(session.run(Box::new(local)).await, CloseReason::HandshakeMismatch);
		drop(session);

		let received = peer.await.unwrap();
		assert_eq!(received.len(), HANDSHAKE_LEN);
		assert_eq!(Handshake::decode(&received).unwrap().info_hash, meta.info_hash);
	}

	#[tokio::test]
	async fn choke_abandons_and_unchoke_refills_pipeline() {
		let (meta, _content, manager, _rx) = fixture();
		let (local, remote) = tokio::io::duplex(64 * 1024);
		let info_hash = meta.info_hash;
		let mut session = session(&meta, &manager, EngineConfig::default());
		let task = tokio::spawn(async move { let reason = session.run(Box::new(local)).await; (reason, session) });

		let mut peer = scripted_peer(remote, info_hash).await;
		assert_eq!(next_non_keepalive(&mut peer).await, Message::Interested);
		peer.send(Message::Bitfield(Bitfield::full(4).to_bytes().into())).await.unwrap();
		peer.send(Message::Unchoke).await.unwrap();

		let mut first = Vec::new();
		for _ in 0..5 {
			match next_non_keepalive(&mut peer).await { Message::Request { index, begin, .. } => first.push((index, begin)), other => panic!("unexpected {:?}", other) }
		}
		peer.send(Message::Choke).await.unwrap();
		peer.send(Message::Unchoke).await.unwrap();

		// the abandoned five stay reserved, so the refill covers the other two blocks
		let mut second = Vec::new();
		for _ in 0..2 {
			match next_non_keepalive(&mut peer).await { Message::Request { index, begin, .. } => second.push((index, begin)), other => panic!("unexpected {:?}", other) }
		}
		assert!(second.iter().all(|r| !first.contains(r)));
		let requested: usize = (0..4).map(|i| manager.block_statuses(i).iter().filter(|s| **s == BlockStatus::Requested).count()).sum();
		assert_eq!(requested, 7);

		drop(peer);
		let (reason, session) = task.await.unwrap();
		assert_eq!(reason, CloseReason::PeerClosed);
		assert!(!session.peer_state().peer_choking);
		// eager release on close
		assert_eq!(manager.counts(), PieceCounts { missing: 4, in_progress: 0, verified: 0 });
	}

	#[tokio::test]
	async fn second_bitfield_is_a_protocol_error() {
		let (meta, _content, manager, _rx) = fixture();
		let (local, remote) = tokio::io::duplex(64 * 1024);
		let info_hash = meta.info_hash;
		let mut session = session(&meta, &manager, EngineConfig::default());
		let task = tokio::spawn(async move { session.run(Box::new(local)).await });

		let mut peer = scripted_peer(remote, info_hash).await;
		peer.send(Message::Bitfield(Bitfield::full(4).to_bytes().into())).await.unwrap();
		peer.send(Message::Bitfield(Bitfield::full(4).to_bytes().into())).await.unwrap();
		assert_eq!(task.await.unwrap(), CloseReason::ProtocolError);
	}

	#[tokio::test]
	async fn out_of_range_have_is_a_protocol_error() {
		let (meta, _content, manager, _rx) = fixture();
		let (local, remote) = tokio::io::duplex(64 * 1024);
		let info_hash = meta.info_hash;
		let mut session = session(&meta, &manager, EngineConfig::default());
		let task = tokio::spawn(async move { session.run(Box::new(local)).await });

		let mut peer = scripted_peer(remote, info_hash).await;
		peer.send(Message::Have(4)).await.unwrap();
		assert_eq!(task.await.unwrap(), CloseReason::ProtocolError);
	}

	#[tokio::test]
	async fn interest_follows_what_the_peer_offers() {
		let (meta, content, manager, _rx) = fixture();
		// piece 0 is already verified
		manager.mark_received(0, 0, &content[0..8]).unwrap();
		manager.mark_received(0, 8, &content[8..16]).unwrap();

		let (local, remote) = tokio::io::duplex(64 * 1024);
		let info_hash = meta.info_hash;
		let mut session = session(&meta, &manager, EngineConfig::default());
		let task = tokio::spawn(async move { session.run(Box::new(local)).await });

		let mut peer = scripted_peer(remote, info_hash).await;
		assert_eq!(next_non_keepalive(&mut peer).await, Message::Interested);
		let mut only_zero = Bitfield::new(4);
		only_zero.set(0);
		peer.send(Message::Bitfield(only_zero.to_bytes().into())).await.unwrap();
		assert_eq!(next_non_keepalive(&mut peer).await, Message::NotInterested);
		peer.send(Message::Have(2)).await.unwrap();
		assert_eq!(next_non_keepalive(&mut peer).await, Message::Interested);

		drop(peer);
		assert_eq!(task.await.unwrap(), CloseReason::PeerClosed);
	}

	#[tokio::test]
	async fn silent_peer_gets_keepalives_then_times_out() {
		let (meta, _content, manager, _rx) = fixture();
		let mut config = EngineConfig::default();
		config.keepalive_interval = Duration::from_millis(50);
		config.idle_timeout = Duration::from_millis(400);
		let (local, remote) = tokio::io::duplex(64 * 1024);
		let info_hash = meta.info_hash;
		let mut session = session(&meta, &manager, config);
		let task = tokio::spawn(async move { session.run(Box::new(local)).await });

		let mut peer = scripted_peer(remote, info_hash).await;
		assert_eq!(peer.next().await.unwrap().unwrap(), Message::Interested);
		assert_eq!(peer.next().await.unwrap().unwrap(), Message::KeepAlive);
		assert_eq!(task.await.unwrap(), CloseReason::Timeout);
	}

	#[tokio::test]
	async fn cancellation_closes_the_session() {
		let (meta, _content, manager, _rx) = fixture();
		let (local, remote) = tokio::io::duplex(64 * 1024);
		let info_hash = meta.info_hash;
		let cancel = CancellationToken::new();
		let mut session = PeerSession::new(addr(), meta.info_hash, PEER_ID, manager.clone(), Arc::new(EngineConfig::default()), cancel.clone());
		let task = tokio::spawn(async move { session.run(Box::new(local)).await });

		let mut peer = scripted_peer(remote, info_hash).await;
		assert_eq!(next_non_keepalive(&mut peer).await, Message::Interested);
		cancel.cancel();
		cancel.cancel();
		assert_eq!(task.await.unwrap(), CloseReason::Cancelled);
	}

	#[test]
	fn lease_release_is_idempotent() {
		let (_meta, _content, manager, _rx) = fixture();
		manager.add_peer(&Bitfield::full(4));
		let mut lease = PeerLease::new(addr(), manager.clone(), 4);
		assert!(lease.add_piece(3));
		assert!(!lease.add_piece(3));
		let req = manager.reserve_block(addr(), &Bitfield::full(4)).unwrap();
		assert_eq!(manager.block_statuses(req.piece)[0], BlockStatus::Requested);

		lease.release();
		lease.release();
		drop(lease);
		assert_eq!(manager.block_statuses(req.piece)[0], BlockStatus::Missing);
		// piece 3 lost exactly one source, so every piece is equally rare again
		assert_eq!(manager.select_next_block(&Bitfield::full(4)).map(|r| r.piece), Some(0));
	}
}
