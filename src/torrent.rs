use std::path::{Component, Path, PathBuf};
use std::{fs, io};

use sha1::{Digest, Sha1};

use crate::bencode_parser::parser::{Value, parse_single};
use crate::error::MetadataError;

pub type Sha1Hash = [u8; 20];

/// One file of the torrent, placed in the flat chunk-address space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    /// Path relative to the download directory.
    pub path: PathBuf,
    pub size: u64,
    /// Offset of the file's first byte in the concatenated content.
    pub offset: u64,
}

impl FileDescriptor {
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// Immutable torrent description shared by every component.
#[derive(Debug, Clone)]
pub struct Metadata {
    pub name: String,
    pub trackers: Vec<String>,
    pub files: Vec<FileDescriptor>,
    pub chunk_size: u32,
    pub chunk_hashes: Vec<Sha1Hash>,
    pub total_size: u64,
    pub info_hash: Sha1Hash,
}

impl Metadata {
    /// Builds metadata from its parts, computing cumulative file offsets and
    /// checking that sizes and hash count agree.
    pub fn new(
        name: impl Into<String>,
        trackers: Vec<String>,
        files: Vec<(PathBuf, u64)>,
        chunk_size: u32,
        chunk_hashes: Vec<Sha1Hash>,
        info_hash: Sha1Hash,
    ) -> Result<Self, MetadataError> {
        if chunk_size == 0 {
            return Err(MetadataError::ZeroChunkSize);
        }

        let mut offset = 0u64;
        let mut descriptors = Vec::with_capacity(files.len());
        for (path, size) in files {
            check_relative(&path)?;
            descriptors.push(FileDescriptor { path, size, offset });
            offset += size;
        }
        let total_size = offset;

        let expected = total_size.div_ceil(chunk_size as u64) as usize;
        if chunk_hashes.len() != expected {
            return Err(MetadataError::HashCountMismatch {
                expected,
                found: chunk_hashes.len(),
            });
        }

        Ok(Self {
            name: name.into(),
            trackers,
            files: descriptors,
            chunk_size,
            chunk_hashes,
            total_size,
            info_hash,
        })
    }

    /// Parse metadata from a `.torrent` file on disk.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, MetadataError> {
        let path = path.as_ref();
        let data = fs::read(path).map_err(|source: io::Error| MetadataError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_bytes(&data)
    }

    /// Parse metadata from the bencoded contents of a `.torrent` file.
    pub fn from_bytes(data: &[u8]) -> Result<Self, MetadataError> {
        let root = parse_single(data).map_err(|e| MetadataError::Decode(e.to_string()))?;
        if root.as_dict().is_none() {
            return Err(MetadataError::WrongType("<root>"));
        }

        let trackers = collect_trackers(&root)?;

        let info = root.get(b"info").ok_or(MetadataError::MissingField("info"))?;
        let raw_info = info.raw().ok_or(MetadataError::WrongType("info"))?;
        let info_hash: Sha1Hash = Sha1::digest(raw_info).into();

        let name = get_str(info, b"name", "name")?.to_string();
        let chunk_size = get_int(info, b"piece length", "piece length")?;
        let chunk_size = u32::try_from(chunk_size).map_err(|_| MetadataError::WrongType("piece length"))?;

        let pieces = info
            .get(b"pieces")
            .ok_or(MetadataError::MissingField("pieces"))?
            .as_bytes()
            .ok_or(MetadataError::WrongType("pieces"))?;
        if pieces.len() % 20 != 0 {
            return Err(MetadataError::BadPieces(pieces.len()));
        }
        let chunk_hashes = pieces
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        let files = if let Some(length) = info.get(b"length") {
            let length = length.as_integer().ok_or(MetadataError::WrongType("length"))?;
            let length = u64::try_from(length).map_err(|_| MetadataError::WrongType("length"))?;
            vec![(PathBuf::from(&name), length)]
        } else {
            let entries = info
                .get(b"files")
                .ok_or(MetadataError::MissingField("files"))?
                .as_list()
                .ok_or(MetadataError::WrongType("files"))?;
            entries
                .iter()
                .map(|entry| parse_file_entry(&name, entry))
                .collect::<Result<Vec<_>, _>>()?
        };

        Self::new(name, trackers, files, chunk_size, chunk_hashes, info_hash)
    }

    pub fn chunk_count(&self) -> usize {
        self.chunk_hashes.len()
    }

    /// Length of chunk `index`; only the last chunk can be shorter.
    pub fn chunk_len(&self, index: u32) -> u32 {
        let start = index as u64 * self.chunk_size as u64;
        let remaining = self.total_size.saturating_sub(start);
        remaining.min(self.chunk_size as u64) as u32
    }
}

fn check_relative(path: &Path) -> Result<(), MetadataError> {
    let safe = path.components().count() > 0
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if safe {
        Ok(())
    } else {
        Err(MetadataError::UnsafePath(path.to_path_buf()))
    }
}

fn get_str<'a>(
    dict: &Value<'a>,
    key: &[u8],
    field: &'static str,
) -> Result<&'a str, MetadataError> {
    dict.get(key)
        .ok_or(MetadataError::MissingField(field))?
        .as_str()
        .ok_or(MetadataError::WrongType(field))
}

fn get_int(dict: &Value<'_>, key: &[u8], field: &'static str) -> Result<i64, MetadataError> {
    dict.get(key)
        .ok_or(MetadataError::MissingField(field))?
        .as_integer()
        .ok_or(MetadataError::WrongType(field))
}

/// `announce` first, then every tier of `announce-list`, without duplicates.
fn collect_trackers(root: &Value<'_>) -> Result<Vec<String>, MetadataError> {
    let mut trackers: Vec<String> = Vec::new();
    let mut push = |url: &str| {
        if !trackers.iter().any(|t| t == url) {
            trackers.push(url.to_string());
        }
    };

    if let Some(announce) = root.get(b"announce") {
        push(announce.as_str().ok_or(MetadataError::WrongType("announce"))?);
    }

    if let Some(tiers) = root.get(b"announce-list").and_then(Value::as_list) {
        for tier in tiers {
            for url in tier.as_list().unwrap_or_default() {
                if let Some(url) = url.as_str() {
                    push(url);
                }
            }
        }
    }

    Ok(trackers)
}

fn parse_file_entry(name: &str, entry: &Value<'_>) -> Result<(PathBuf, u64), MetadataError> {
    let length = get_int(entry, b"length", "files.length")?;
    let length = u64::try_from(length).map_err(|_| MetadataError::WrongType("files.length"))?;

    let parts = entry
        .get(b"path")
        .ok_or(MetadataError::MissingField("files.path"))?
        .as_list()
        .ok_or(MetadataError::WrongType("files.path"))?;

    let mut path = PathBuf::from(name);
    for part in parts {
        path.push(part.as_str().ok_or(MetadataError::WrongType("files.path"))?);
    }
    Ok((path, length))
}
