use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Standard block size (16 KB)
pub const BLOCK_SIZE: u32 = 16384;

/// Default ceiling for a single frame: one maximal block plus the piece header,
/// with room for a bitfield of a very large torrent.
pub const MAX_FRAME_LEN: usize = (1 << 20) + 13;

/// BitTorrent peer wire protocol messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Keep-alive message (no payload)
    KeepAlive,
    /// Choke the peer
    Choke,
    /// Unchoke the peer
    Unchoke,
    /// Declare interest in peer's pieces
    Interested,
    /// Declare lack of interest
    NotInterested,
    /// Announce that peer has a piece (piece_index)
    Have(u32),
    /// Send complete bitfield of pieces peer has
    Bitfield(Bytes),
    /// Request a block: (piece_index, block_offset, block_length)
    Request { index: u32, begin: u32, length: u32 },
    /// Send a block: (piece_index, block_offset, data)
    Piece { index: u32, begin: u32, data: Bytes },
    /// Cancel a request: (piece_index, block_offset, block_length)
    Cancel { index: u32, begin: u32, length: u32 },
    /// DHT port announcement
    Port(u16),
}

impl Message {
    pub fn id(&self) -> Option<u8> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(0),
            Message::Unchoke => Some(1),
            Message::Interested => Some(2),
            Message::NotInterested => Some(3),
            Message::Have(_) => Some(4),
            Message::Bitfield(_) => Some(5),
            Message::Request { .. } => Some(6),
            Message::Piece { .. } => Some(7),
            Message::Cancel { .. } => Some(8),
            Message::Port(_) => Some(9),
        }
    }

    /// Encoded size including the 4-byte length prefix.
    pub fn encoded_len(&self) -> usize {
        4 + match self {
            Message::KeepAlive => 0,
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => 1,
            Message::Have(_) => 5,
            Message::Bitfield(bits) => 1 + bits.len(),
            Message::Request { .. } | Message::Cancel { .. } => 13,
            Message::Piece { data, .. } => 9 + data.len(),
            Message::Port(_) => 3,
        }
    }

    /// Encode message to bytes
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());
        buf.put_u32((self.encoded_len() - 4) as u32);
        let id = match self.id() {
            Some(id) => id,
            None => return,
        };
        buf.put_u8(id);
        match self {
            Message::Have(piece_index) => buf.put_u32(*piece_index),
            Message::Bitfield(bits) => buf.put_slice(bits),
            Message::Request { index, begin, length } | Message::Cancel { index, begin, length } => {
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Piece { index, begin, data } => {
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(data);
            }
            Message::Port(port) => buf.put_u16(*port),
            _ => {}
        }
    }

    /// Decode message from bytes
    /// Returns (message, bytes_consumed) or None if more data needed
    pub fn decode(buf: &[u8], max_frame_len: usize) -> Result<Option<(Self, usize)>, MessageError> {
        if buf.len() < 4 {
            return Ok(None); // Need at least length prefix
        }

        let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if length > max_frame_len {
            return Err(MessageError::FrameTooLarge { length, max: max_frame_len });
        }
        let total_len = 4 + length;

        if buf.len() < total_len {
            return Ok(None); // Need more data
        }

        if length == 0 {
            return Ok(Some((Message::KeepAlive, 4)));
        }

        let msg_id = buf[4];
        let payload = &buf[5..total_len];

        let message = match msg_id {
            0..=3 => {
                expect_len(msg_id, payload, 0)?;
                match msg_id {
                    0 => Message::Choke,
                    1 => Message::Unchoke,
                    2 => Message::Interested,
                    _ => Message::NotInterested,
                }
            }
            4 => {
                expect_len(msg_id, payload, 4)?;
                Message::Have(be_u32(payload, 0))
            }
            5 => Message::Bitfield(Bytes::copy_from_slice(payload)),
            6 | 8 => {
                expect_len(msg_id, payload, 12)?;
                let index = be_u32(payload, 0);
                let begin = be_u32(payload, 4);
                let length = be_u32(payload, 8);
                if msg_id == 6 {
                    Message::Request { index, begin, length }
                } else {
                    Message::Cancel { index, begin, length }
                }
            }
            7 => {
                if payload.len() < 8 {
                    return Err(MessageError::Payload { id: msg_id, len: payload.len() });
                }
                Message::Piece {
                    index: be_u32(payload, 0),
                    begin: be_u32(payload, 4),
                    data: Bytes::copy_from_slice(&payload[8..]),
                }
            }
            9 => {
                expect_len(msg_id, payload, 2)?;
                Message::Port(u16::from_be_bytes([payload[0], payload[1]]))
            }
            other => return Err(MessageError::UnknownId(other)),
        };

        Ok(Some((message, total_len)))
    }
}

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("unknown message id: {0}")]
    UnknownId(u8),
    #[error("message id {id} has malformed payload of {len} bytes")]
    Payload { id: u8, len: usize },
    #[error("frame of {length} bytes exceeds limit of {max}")]
    FrameTooLarge { length: usize, max: usize },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn expect_len(id: u8, payload: &[u8], want: usize) -> Result<(), MessageError> {
    if payload.len() == want {
        Ok(())
    } else {
        Err(MessageError::Payload { id, len: payload.len() })
    }
}

fn be_u32(payload: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([payload[at], payload[at + 1], payload[at + 2], payload[at + 3]])
}
