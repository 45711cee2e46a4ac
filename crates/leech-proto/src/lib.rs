pub mod bitfield;
pub mod codec;
pub mod handshake;
pub mod message;

pub use bitfield::{Bitfield, BitfieldLengthError};
pub use codec::MessageCodec;
pub use handshake::{
	Handshake,
	HandshakeError,
	HANDSHAKE_LEN,
	HASH_LEN,
	PEER_ID_LEN,
	PROTOCOL_STR,
	RESERVED_BYTES,
};
pub use message::{Message, MessageError, BLOCK_SIZE, MAX_FRAME_LEN};
