use thiserror::Error;

/// Top-level error for a download.
#[derive(Debug, Error)]
pub enum LeechError {
    #[error("metainfo: {0}")]
    Metainfo(#[from] MetainfoError),
    #[error("tracker: {0}")]
    Tracker(#[from] TrackerError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("download cancelled")]
    Cancelled,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BencodeError {
    #[error("malformed bencode: {0}")]
    Malformed(String),
    #[error("empty input")]
    Empty,
    #[error("trailing data after top-level value")]
    TrailingData,
}

impl From<bendy::decoding::Error> for BencodeError {
    fn from(e: bendy::decoding::Error) -> Self {
        Self::Malformed(e.to_string())
    }
}

/// Parse-time failures. Never retried.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MetainfoError {
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("field `{0}` has the wrong type")]
    TypeMismatch(&'static str),
    #[error("malformed bencode: {0}")]
    MalformedBencode(String),
    #[error("corrupt metadata: {0}")]
    CorruptMetadata(String),
}

impl From<BencodeError> for MetainfoError {
    fn from(e: BencodeError) -> Self {
        Self::MalformedBencode(e.to_string())
    }
}

impl From<bendy::decoding::Error> for MetainfoError {
    fn from(e: bendy::decoding::Error) -> Self {
        Self::MalformedBencode(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum TrackerError {
    /// Transport-level failure; safe to retry with backoff.
    #[error("network error: {0}")]
    Network(String),
    /// The tracker answered with `failure reason`.
    #[error("tracker rejected announce: {0}")]
    Failure(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl TrackerError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, TrackerError::Network(_))
    }
}

impl From<reqwest::Error> for TrackerError {
    fn from(e: reqwest::Error) -> Self {
        Self::Network(e.to_string())
    }
}

impl From<BencodeError> for TrackerError {
    fn from(e: BencodeError) -> Self {
        Self::Protocol(e.to_string())
    }
}

/// Rejections from the piece manager for blocks it never scheduled.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PieceError {
    #[error("no block at piece {piece} offset {offset}")]
    UnknownBlock { piece: u32, offset: u32 },
    #[error("block at piece {piece} offset {offset} is {expected} bytes, got {got}")]
    LengthMismatch { piece: u32, offset: u32, expected: u32, got: usize },
}

/// Failures local to one peer session.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),
    #[error("handshake error: {0}")]
    Handshake(#[from] leech_proto::HandshakeError),
    #[error("info-hash mismatch expected={expected} received={received}")]
    InfoHashMismatch { expected: String, received: String },
    #[error("framing error: {0}")]
    Message(#[from] leech_proto::MessageError),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("timed out")]
    Timeout,
}

impl PeerError {
    pub fn info_hash_mismatch(expected: [u8; 20], received: [u8; 20]) -> Self {
        Self::InfoHashMismatch {
            expected: hex::encode(expected),
            received: hex::encode(received),
        }
    }
}

impl From<leech_proto::BitfieldLengthError> for PeerError {
    fn from(e: leech_proto::BitfieldLengthError) -> Self {
        Self::Protocol(e.to_string())
    }
}

impl From<PieceError> for PeerError {
    fn from(e: PieceError) -> Self {
        Self::Protocol(e.to_string())
    }
}
