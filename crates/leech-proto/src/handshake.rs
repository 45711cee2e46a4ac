use bytes::{Buf, BufMut, BytesMut};
use rand::{distributions::Alphanumeric, Rng};
use thiserror::Error;

pub const PROTOCOL_STR: &str = "BitTorrent protocol";
pub const RESERVED_BYTES: usize = 8;
pub const HASH_LEN: usize = 20;
pub const PEER_ID_LEN: usize = 20;

/// Length byte followed by the protocol string; every handshake opens with it.
const HEADER: &[u8; 20] = b"\x13BitTorrent protocol";

/// 68 bytes on the wire.
pub const HANDSHAKE_LEN: usize = HEADER.len() + RESERVED_BYTES + HASH_LEN + PEER_ID_LEN;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
	pub reserved: [u8; RESERVED_BYTES],
	pub info_hash: [u8; HASH_LEN],
	pub peer_id: [u8; PEER_ID_LEN],
}

impl Handshake {
	/// No extension bits are advertised.
	pub fn new(info_hash: [u8; HASH_LEN], peer_id: [u8; PEER_ID_LEN]) -> Self {
		Self { reserved: [0; RESERVED_BYTES], info_hash, peer_id }
	}

	/// Whether the remote side is talking about the torrent we asked for.
	pub fn is_for(&self, info_hash: &[u8; HASH_LEN]) -> bool {
		&self.info_hash == info_hash
	}

	pub fn encode(&self) -> BytesMut {
		let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
		let parts: [&[u8]; 4] = [HEADER, &self.reserved, &self.info_hash, &self.peer_id];
		for part in parts {
			buf.put_slice(part);
		}
		buf
	}

	/// Reads the first [`HANDSHAKE_LEN`] bytes; anything after them is left alone.
	/// Reserved bits are kept verbatim.
	pub fn decode(bytes: &[u8]) -> Result<Self, HandshakeError> {
		if bytes.len() < HANDSHAKE_LEN {
			return Err(HandshakeError::Length(bytes.len()));
		}
		let (header, mut rest) = bytes.split_at(HEADER.len());
		if header != HEADER {
			return Err(HandshakeError::ProtocolString);
		}
		let mut hs = Self::new([0; HASH_LEN], [0; PEER_ID_LEN]);
		rest.copy_to_slice(&mut hs.reserved);
		rest.copy_to_slice(&mut hs.info_hash);
		rest.copy_to_slice(&mut hs.peer_id);
		Ok(hs)
	}

	/// Azureus-style id: `client_prefix` (truncated to 20 bytes) then random alphanumerics.
	pub fn random_peer_id(client_prefix: &[u8]) -> [u8; PEER_ID_LEN] {
		let mut rng = rand::thread_rng();
		let mut peer_id = [0u8; PEER_ID_LEN];
		for (i, byte) in peer_id.iter_mut().enumerate() {
			*byte = match client_prefix.get(i) {
				Some(b) => *b,
				None => rng.sample(Alphanumeric),
			};
		}
		peer_id
	}
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
	#[error("handshake needs 68 bytes, got {0}")]
	Length(usize),
	#[error("peer does not speak the BitTorrent protocol")]
	ProtocolString,
}
