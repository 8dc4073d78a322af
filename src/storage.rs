//! Chunk-addressed access to the torrent's files on disk.
//!
//! The torrent's content is one flat byte range made of its files laid end to
//! end. A read or write at `(chunk, offset)` is mapped onto that range and split
//! at file boundaries; each piece is performed under its own file's lock.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::StorageError;
use crate::torrent::Metadata;

const ZERO_FILL_LEN: usize = 64 * 1024;

/// The part of an operation that falls inside one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSpan {
    pub file_index: usize,
    pub file_offset: u64,
    /// Offset into the caller's buffer.
    pub buf_offset: usize,
    pub length: usize,
}

struct FileSlot {
    path: PathBuf,
    offset: u64,
    size: u64,
    handle: Mutex<Option<File>>,
}

impl FileSlot {
    fn end(&self) -> u64 {
        self.offset + self.size
    }

    /// The slot's handle, opened on first use.
    async fn open<'a>(&self, handle: &'a mut Option<File>) -> Result<&'a mut File, StorageError> {
        let file = match handle.take() {
            Some(file) => file,
            None => OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&self.path)
                .await
                .map_err(|e| StorageError::io(&self.path, e))?,
        };
        Ok(handle.insert(file))
    }
}

pub struct ChunkStore {
    root: PathBuf,
    chunk_size: u64,
    total_size: u64,
    files: Vec<FileSlot>,
}

impl ChunkStore {
    /// File paths are taken relative to `root`. [`Metadata`] has already
    /// rejected absolute paths and `..` components.
    pub fn new(root: impl Into<PathBuf>, metadata: &Metadata) -> Self {
        let root = root.into();
        let files = metadata
            .files
            .iter()
            .map(|f| FileSlot {
                path: root.join(&f.path),
                offset: f.offset,
                size: f.size,
                handle: Mutex::new(None),
            })
            .collect();

        Self {
            root,
            chunk_size: metadata.chunk_size as u64,
            total_size: metadata.total_size,
            files,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn file_path(&self, file_index: usize) -> Option<&Path> {
        self.files.get(file_index).map(|f| f.path.as_path())
    }

    /// Split `length` bytes at `offset` within chunk `index` into per-file
    /// spans, in file order.
    pub fn spans(&self, index: u32, offset: u32, length: usize) -> Result<Vec<FileSpan>, StorageError> {
        let start = self.chunk_size * index as u64 + offset as u64;
        let end = start + length as u64;
        if end > self.total_size {
            return Err(StorageError::OutOfBounds {
                offset: start,
                length: length as u64,
                total: self.total_size,
            });
        }

        let spans = self
            .files
            .iter()
            .enumerate()
            .filter(|(_, f)| f.size > 0 && f.offset < end && f.end() > start)
            .map(|(file_index, f)| {
                let from = start.max(f.offset);
                let to = end.min(f.end());
                FileSpan {
                    file_index,
                    file_offset: from - f.offset,
                    buf_offset: (from - start) as usize,
                    length: (to - from) as usize,
                }
            })
            .collect();
        Ok(spans)
    }

    /// Create every file at its final size, zero-filled, creating parent
    /// directories as needed.
    pub async fn allocate(&self) -> Result<(), StorageError> {
        let zeros = vec![0u8; ZERO_FILL_LEN];

        for slot in &self.files {
            if let Some(parent) = slot.path.parent() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|e| StorageError::io(parent, e))?;
            }

            let mut handle = slot.handle.lock().await;
            handle.take();
            let mut file = File::create(&slot.path)
                .await
                .map_err(|e| StorageError::io(&slot.path, e))?;

            let mut remaining = slot.size;
            while remaining > 0 {
                let n = remaining.min(ZERO_FILL_LEN as u64) as usize;
                file.write_all(&zeros[..n])
                    .await
                    .map_err(|e| StorageError::io(&slot.path, e))?;
                remaining -= n as u64;
            }
            file.flush()
                .await
                .map_err(|e| StorageError::io(&slot.path, e))?;
            debug!("allocated {:?} ({} bytes)", slot.path, slot.size);
        }

        info!("allocated {} files under {:?}", self.files.len(), self.root);
        Ok(())
    }

    pub async fn write_block(&self, index: u32, offset: u32, data: &[u8]) -> Result<(), StorageError> {
        for span in self.spans(index, offset, data.len())? {
            let slot = &self.files[span.file_index];
            let mut handle = slot.handle.lock().await;
            let file = slot.open(&mut handle).await?;

            let bytes = &data[span.buf_offset..span.buf_offset + span.length];
            file.seek(SeekFrom::Start(span.file_offset))
                .await
                .map_err(|e| StorageError::io(&slot.path, e))?;
            file.write_all(bytes)
                .await
                .map_err(|e| StorageError::io(&slot.path, e))?;
            file.flush()
                .await
                .map_err(|e| StorageError::io(&slot.path, e))?;
        }
        Ok(())
    }

    pub async fn read_range(&self, index: u32, offset: u32, length: usize) -> Result<Vec<u8>, StorageError> {
        let mut buf = vec![0u8; length];
        for span in self.spans(index, offset, length)? {
            let slot = &self.files[span.file_index];
            let mut handle = slot.handle.lock().await;
            let file = slot.open(&mut handle).await?;

            file.seek(SeekFrom::Start(span.file_offset))
                .await
                .map_err(|e| StorageError::io(&slot.path, e))?;
            file.read_exact(&mut buf[span.buf_offset..span.buf_offset + span.length])
                .await
                .map_err(|e| StorageError::io(&slot.path, e))?;
        }
        Ok(buf)
    }
}
