use bendy::decoding::Decoder;
use sha1::{Digest, Sha1};

use crate::bencode::{self, Value};
use crate::error::MetainfoError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentMeta {
    pub announce: String,
    pub name: String,
    pub piece_length: u32,
    pub pieces: Vec<[u8; 20]>,
    pub total_length: u64,
    /// Empty for single-file torrents.
    pub files: Vec<FileEntry>,
    pub info_hash: [u8; 20],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub length: u64,
    pub path: Vec<String>,
}

impl TorrentMeta {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MetainfoError> {
        let mut decoder = Decoder::new(bytes);
        let mut dict = decoder
            .next_object()?
            .ok_or_else(|| MetainfoError::MalformedBencode("empty input".into()))?
            .try_into_dictionary()
            .map_err(|_| MetainfoError::CorruptMetadata("top-level value is not a dictionary".into()))?;

        let mut announce = None;
        let mut info_bytes = None;
        while let Some((key, value)) = dict.next_pair()? {
            match key {
                b"announce" => {
                    let raw = value
                        .try_into_bytes()
                        .map_err(|_| MetainfoError::TypeMismatch("announce"))?;
                    let url = std::str::from_utf8(raw).map_err(|_| MetainfoError::TypeMismatch("announce"))?;
                    announce = Some(url.to_string());
                }
                b"info" => {
                    // hash the span exactly as it appeared in the input
                    let info = value
                        .try_into_dictionary()
                        .map_err(|_| MetainfoError::TypeMismatch("info"))?;
                    info_bytes = Some(info.into_raw()?);
                }
                _ => {}
            }
        }

        let announce = announce.ok_or(MetainfoError::MissingField("announce"))?;
        let info_bytes = info_bytes.ok_or(MetainfoError::MissingField("info"))?;
        let mut hasher = Sha1::new();
        hasher.update(info_bytes);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&hasher.finalize());

        let info = bencode::decode(info_bytes)?;
        Self::from_info(announce, &info, info_hash)
    }

    fn from_info(announce: String, info: &Value, info_hash: [u8; 20]) -> Result<Self, MetainfoError> {
        let piece_length = require(info, b"piece length", "piece length")?
            .as_int()
            .ok_or(MetainfoError::TypeMismatch("piece length"))?;
        if piece_length <= 0 || piece_length > u32::MAX as i64 {
            return Err(MetainfoError::CorruptMetadata(format!("piece length {} out of range", piece_length)));
        }
        let piece_length = piece_length as u32;

        let blob = require(info, b"pieces", "pieces")?
            .as_bytes()
            .ok_or(MetainfoError::TypeMismatch("pieces"))?;
        if blob.len() % 20 != 0 {
            return Err(MetainfoError::CorruptMetadata(format!(
                "pieces length {} is not a multiple of 20",
                blob.len()
            )));
        }
        let pieces: Vec<[u8; 20]> = blob
            .chunks_exact(20)
            .map(|chunk| {
                let mut arr = [0u8; 20];
                arr.copy_from_slice(chunk);
                arr
            })
            .collect();

        let name = match info.get(b"name") {
            Some(value) => {
                let raw = value.as_bytes().ok_or(MetainfoError::TypeMismatch("name"))?;
                let name = String::from_utf8_lossy(raw).into_owned();
                if !is_safe_segment(&name) {
                    return Err(MetainfoError::CorruptMetadata(format!("invalid name {:?}", name)));
                }
                name
            }
            None => hex::encode(info_hash),
        };

        let (total_length, files) = match (info.get(b"length"), info.get(b"files")) {
            (Some(_), Some(_)) => {
                return Err(MetainfoError::CorruptMetadata("both `length` and `files` present".into()));
            }
            (Some(length), None) => {
                let length = length.as_int().ok_or(MetainfoError::TypeMismatch("length"))?;
                (non_negative(length, "length")?, Vec::new())
            }
            (None, Some(files)) => {
                let files = decode_files(files)?;
                let total = files
                    .iter()
                    .try_fold(0u64, |acc, f| acc.checked_add(f.length))
                    .ok_or_else(|| MetainfoError::CorruptMetadata("total length overflows".into()))?;
                (total, files)
            }
            (None, None) => return Err(MetainfoError::MissingField("length/files")),
        };

        if total_length == 0 {
            return Err(MetainfoError::CorruptMetadata("torrent has no content".into()));
        }
        let expected = total_length.div_ceil(piece_length as u64);
        if pieces.len() as u64 != expected {
            return Err(MetainfoError::CorruptMetadata(format!(
                "{} piece hashes for {} bytes at piece length {} (expected {})",
                pieces.len(),
                total_length,
                piece_length,
                expected
            )));
        }

        Ok(Self {
            announce,
            name,
            piece_length,
            pieces,
            total_length,
            files,
            info_hash,
        })
    }

    pub fn num_pieces(&self) -> usize {
        self.pieces.len()
    }

    pub fn is_single_file(&self) -> bool {
        self.files.is_empty()
    }

    /// Size of piece `index`; only the last piece may be short.
    pub fn piece_size(&self, index: u32) -> u32 {
        let start = index as u64 * self.piece_length as u64;
        let end = (start + self.piece_length as u64).min(self.total_length);
        end.saturating_sub(start) as u32
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }
}

fn require<'a>(dict: &'a Value, key: &[u8], field: &'static str) -> Result<&'a Value, MetainfoError> {
    dict.get(key).ok_or(MetainfoError::MissingField(field))
}

fn non_negative(n: i64, field: &'static str) -> Result<u64, MetainfoError> {
    u64::try_from(n).map_err(|_| MetainfoError::CorruptMetadata(format!("negative {}: {}", field, n)))
}

/// A single path component that stays inside its parent directory.
fn is_safe_segment(seg: &str) -> bool {
    !seg.is_empty() && seg != "." && seg != ".." && !seg.contains(['/', '\\']) && !std::path::Path::new(seg).is_absolute()
}

fn decode_files(files: &Value) -> Result<Vec<FileEntry>, MetainfoError> {
    let list = files.as_list().ok_or(MetainfoError::TypeMismatch("files"))?;
    if list.is_empty() {
        return Err(MetainfoError::CorruptMetadata("empty `files` list".into()));
    }
    let mut out = Vec::with_capacity(list.len());
    for entry in list {
        if entry.as_dict().is_none() {
            return Err(MetainfoError::TypeMismatch("files"));
        }
        let length = require(entry, b"length", "files.length")?
            .as_int()
            .ok_or(MetainfoError::TypeMismatch("files.length"))?;
        let segments = require(entry, b"path", "files.path")?
            .as_list()
            .ok_or(MetainfoError::TypeMismatch("files.path"))?;
        let path = segments
            .iter()
            .map(|seg| {
                seg.as_bytes()
                    .map(|raw| String::from_utf8_lossy(raw).into_owned())
                    .ok_or(MetainfoError::TypeMismatch("files.path"))
            })
            .collect::<Result<Vec<_>, _>>()?;
        if path.is_empty() || !path.iter().all(|seg| is_safe_segment(seg)) {
            return Err(MetainfoError::CorruptMetadata(format!("invalid file path {:?}", path)));
        }
        out.push(FileEntry { length: non_negative(length, "files.length")?, path });
    }
    Ok(out)
}
