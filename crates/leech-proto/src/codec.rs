use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::message::{Message, MessageError, MAX_FRAME_LEN};

/// Frames a post-handshake byte stream into [`Message`]s.
///
/// Wrapped in `tokio_util::codec::Framed`, a connection becomes a `Stream` of
/// typed messages that ends when the peer closes, and a `Sink` for outgoing ones.
#[derive(Debug, Clone)]
pub struct MessageCodec {
    max_frame_len: usize,
}

impl MessageCodec {
    pub fn new(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME_LEN)
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = MessageError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, MessageError> {
        match Message::decode(&src[..], self.max_frame_len)? {
            Some((msg, consumed)) => {
                src.advance(consumed);
                Ok(Some(msg))
            }
            None => {
                if src.len() >= 4 {
                    let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
                    src.reserve(4 + length - src.len());
                }
                Ok(None)
            }
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = MessageError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), MessageError> {
        msg.encode_into(dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::{SinkExt, StreamExt};
    use tokio::io::AsyncWriteExt;
    use tokio_util::codec::{FramedRead, FramedWrite};

    #[test]
    fn decodes_back_to_back_frames() {
        let mut codec = MessageCodec::default();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&Message::Unchoke.encode());
        buf.extend_from_slice(&Message::KeepAlive.encode());
        buf.extend_from_slice(&Message::Have(3).encode()[..6]);

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Message::Unchoke));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Message::KeepAlive));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), 6);

        buf.extend_from_slice(&[0, 3]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Message::Have(3)));
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn stream_yields_messages_split_across_writes_then_ends() {
        let (reader, mut writer) = tokio::io::duplex(64);
        let piece = Message::Piece { index: 1, begin: 0, data: Bytes::from(vec![9u8; 40]) };
        let encoded = piece.encode();

        let feeder = tokio::spawn(async move {
            writer.write_all(&encoded[..10]).await.unwrap();
            writer.write_all(&encoded[10..]).await.unwrap();
            writer.write_all(&Message::Choke.encode()).await.unwrap();
        });

        let mut frames = FramedRead::new(reader, MessageCodec::default());
        assert_eq!(frames.next().await.unwrap().unwrap(), piece);
        assert_eq!(frames.next().await.unwrap().unwrap(), Message::Choke);
        feeder.await.unwrap();
        assert!(frames.next().await.is_none());
    }

    #[tokio::test]
    async fn sink_writes_wire_bytes() {
        let (writer, mut reader) = tokio::io::duplex(64);
        let mut sink = FramedWrite::new(writer, MessageCodec::default());
        sink.send(Message::Interested).await.unwrap();
        drop(sink);

        let mut out = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut out).await.unwrap();
        assert_eq!(out, vec![0, 0, 0, 1, 2]);
    }
}
