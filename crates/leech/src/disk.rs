use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::debug;

use crate::metainfo::TorrentMeta;
use crate::pieces::VerifiedPiece;

#[derive(Debug, Clone)]
struct DiskFile {
    path: PathBuf,
    length: u64,
    start: u64,
    end: u64,
}

/// Writes verified pieces into the torrent's file layout.
#[derive(Debug)]
pub struct DiskManager {
    files: Vec<DiskFile>,
    piece_length: u32,
    total_size: u64,
}

impl DiskManager {
    /// Create every file (sparse, pre-sized). Single-file torrents land at
    /// `base/name`, multi-file torrents under `base/name/`.
    pub async fn new(base: impl AsRef<Path>, meta: &TorrentMeta) -> std::io::Result<Self> {
        let base = base.as_ref();
        let mut files = Vec::new();
        if meta.is_single_file() {
            files.push(DiskFile { path: base.join(&meta.name), length: meta.total_length, start: 0, end: meta.total_length });
        } else {
            let root = base.join(&meta.name);
            let mut offset = 0u64;
            for f in &meta.files {
                let path = f.path.iter().fold(root.clone(), |p, seg| p.join(seg));
                let start = offset;
                let end = start + f.length;
                files.push(DiskFile { path, length: f.length, start, end });
                offset = end;
            }
        }

        for df in &files {
            if let Some(parent) = df.path.parent() {
                fs::create_dir_all(parent).await?;
            }
            let file = OpenOptions::new().create(true).write(true).truncate(false).open(&df.path).await?;
            file.set_len(df.length).await?;
        }

        Ok(Self { files, piece_length: meta.piece_length, total_size: meta.total_length })
    }

    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.files.iter().map(|f| f.path.as_path())
    }

    fn piece_bounds(&self, piece_index: u32) -> (u64, u64) {
        let start = piece_index as u64 * self.piece_length as u64;
        let end = (start + self.piece_length as u64).min(self.total_size);
        (start, end)
    }

    fn map_offset_to_file(&self, abs_offset: u64) -> Option<usize> {
        // zero-length files never own an offset
        self.files.iter().position(|f| abs_offset < f.end && f.length > 0)
    }

    /// Write a whole piece, splitting it across file boundaries.
    pub async fn write_piece(&self, piece_index: u32, data: &[u8]) -> std::io::Result<()> {
        let (piece_start, piece_end) = self.piece_bounds(piece_index);
        if piece_start >= self.total_size || piece_start + data.len() as u64 != piece_end {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("piece {} of {} bytes does not match the layout", piece_index, data.len()),
            ));
        }

        let mut abs_off = piece_start;
        let mut cursor = 0usize;
        while cursor < data.len() {
            let idx = self
                .map_offset_to_file(abs_off)
                .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "offset beyond files"))?;
            let df = &self.files[idx];
            let in_file_off = abs_off - df.start;
            let to_write = (data.len() - cursor).min((df.length - in_file_off) as usize);
            let mut file = OpenOptions::new().write(true).open(&df.path).await?;
            file.seek(std::io::SeekFrom::Start(in_file_off)).await?;
            file.write_all(&data[cursor..cursor + to_write]).await?;
            file.flush().await?;
            abs_off += to_write as u64;
            cursor += to_write;
        }
        Ok(())
    }

    /// Write pieces as they arrive until `expected` pieces are on disk or the
    /// channel closes. Returns how many were written.
    pub async fn drain(&self, mut rx: mpsc::UnboundedReceiver<VerifiedPiece>, expected: usize) -> std::io::Result<usize> {
        let mut written = 0;
        while written < expected {
            let Some(piece) = rx.recv().await else { break };
            self.write_piece(piece.index, &piece.data).await?;
            debug!(piece = piece.index, bytes = piece.data.len(), "piece written");
            written += 1;
        }
        Ok(written)
    }
}
