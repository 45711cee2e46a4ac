pub mod bencode;
pub mod config;
pub mod disk;
pub mod error;
pub mod metainfo;
pub mod net;
pub mod peer;
pub mod pieces;
pub mod supervisor;
pub mod tracker;

#[cfg(test)]
mod testutil;

pub use config::EngineConfig;
pub use disk::DiskManager;
pub use error::{LeechError, MetainfoError, PeerError, PieceError, TrackerError};
pub use metainfo::{FileEntry, TorrentMeta};
pub use peer::{CloseReason, PeerSession, SessionState};
pub use pieces::{BlockOutcome, PieceManager, PieceStatus, VerifiedPiece};
pub use supervisor::{DownloadSummary, DownloadSupervisor};
pub use tracker::{AnnounceEvent, TrackerClient, TrackerResponse};
