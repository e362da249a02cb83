use std::cmp::min;
use std::fmt::{Debug, Formatter};
use std::io::{Cursor, SeekFrom};
use std::path::Path;

use anyhow::{anyhow, Context};
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};
use tracing::trace;

use crate::protocol::FileHeader;

pub const DEFAULT_MIME: &str = "application/octet-stream";

pub trait FileSource: AsyncRead + AsyncSeek + Unpin + Send + Sync + 'static {}
impl<T: AsyncRead + AsyncSeek + Unpin + Send + Sync + 'static> FileSource for T {}

/// A file queued for sending. The content is read lazily from `source` while the file is being
///  transferred.
pub struct OutgoingFile {
    pub name: String,
    pub mime: String,
    pub size: u64,
    pub source: Box<dyn FileSource>,
}
impl Debug for OutgoingFile {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "OutgoingFile{{name:{:?}, mime:{:?}, size:{}}}", self.name, self.mime, self.size)
    }
}
impl OutgoingFile {
    pub async fn from_path(path: impl AsRef<Path>) -> anyhow::Result<OutgoingFile> {
        let path = path.as_ref();
        let name = path.file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| anyhow!("not a file path: {:?}", path))?
            .to_string();

        let file = tokio::fs::File::open(path).await
            .with_context(|| format!("opening {:?}", path))?;
        let size = file.metadata().await?.len();

        Ok(OutgoingFile {
            mime: mime_for_name(&name).to_string(),
            name,
            size,
            source: Box::new(file),
        })
    }

    pub fn from_bytes(name: impl Into<String>, mime: Option<&str>, data: Bytes) -> OutgoingFile {
        OutgoingFile {
            name: name.into(),
            mime: mime.unwrap_or(DEFAULT_MIME).to_string(),
            size: data.len() as u64,
            source: Box::new(Cursor::new(data)),
        }
    }

    pub fn header(&self) -> FileHeader {
        FileHeader {
            name: self.name.clone(),
            mime: self.mime.clone(),
            size: self.size,
        }
    }
}

fn mime_for_name(name: &str) -> &'static str {
    let extension = match name.rsplit_once('.') {
        Some((_, ext)) => ext.to_ascii_lowercase(),
        None => return DEFAULT_MIME,
    };
    match extension.as_str() {
        "txt" => "text/plain",
        "html" | "htm" => "text/html",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "mp3" => "audio/mpeg",
        "mp4" => "video/mp4",
        _ => DEFAULT_MIME,
    }
}


#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChunkerEvent {
    Chunk(Bytes),
    /// All chunks up to `offset` were emitted; the chunker is suspended until the partition is
    ///  acknowledged or repeated.
    PartitionEnd { offset: u64, is_last: bool },
}

/// Splits a file into chunks of at most `chunk_size` bytes, grouped into partitions of at least
///  `max_partition_size` bytes (except for the last one). Callers pull events one at a time, so
///  there is never more than one unacknowledged partition.
pub struct FileChunker {
    source: Box<dyn FileSource>,
    size: u64,
    chunk_size: usize,
    max_partition_size: u64,

    offset: u64,
    partition_start: u64,
    awaiting_ack: bool,
}

impl FileChunker {
    pub fn new(file: OutgoingFile, chunk_size: usize, max_partition_size: u64) -> FileChunker {
        FileChunker {
            source: file.source,
            size: file.size,
            chunk_size: chunk_size.max(1),
            max_partition_size: max_partition_size.max(1),
            offset: 0,
            partition_start: 0,
            awaiting_ack: false,
        }
    }

    /// Returns `None` while a partition is waiting for its acknowledgement, and after the last
    ///  partition was acknowledged.
    pub async fn next_event(&mut self) -> anyhow::Result<Option<ChunkerEvent>> {
        if self.awaiting_ack {
            return Ok(None);
        }

        let bytes_in_partition = self.offset - self.partition_start;
        let is_file_end = self.offset >= self.size;

        if bytes_in_partition >= self.max_partition_size || (is_file_end && bytes_in_partition > 0) {
            trace!(offset = self.offset, "partition end");
            self.awaiting_ack = true;
            return Ok(Some(ChunkerEvent::PartitionEnd { offset: self.offset, is_last: is_file_end }));
        }
        if is_file_end {
            return Ok(None);
        }

        let len = min(self.chunk_size as u64, self.size - self.offset) as usize;
        let mut buf = BytesMut::zeroed(len);
        self.source.read_exact(&mut buf).await
            .with_context(|| format!("reading {} bytes at offset {} of {}", len, self.offset, self.size))?;
        self.offset += len as u64;

        Ok(Some(ChunkerEvent::Chunk(buf.freeze())))
    }

    /// the receiver acknowledged the current partition
    pub fn next_partition(&mut self) {
        self.partition_start = self.offset;
        self.awaiting_ack = false;
    }

    /// Closes the current partition at the current offset, e.g. because a chunk could not be
    ///  sent. The chunker is suspended as after a regular partition end.
    pub fn end_partition(&mut self) -> u64 {
        self.awaiting_ack = true;
        self.offset
    }

    /// rewind to the start of the current (unacknowledged) partition and emit it again
    pub async fn repeat_partition(&mut self) -> anyhow::Result<()> {
        self.source.seek(SeekFrom::Start(self.partition_start)).await?;
        self.offset = self.partition_start;
        self.awaiting_ack = false;
        Ok(())
    }

    pub fn partition_start(&self) -> u64 {
        self.partition_start
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_awaiting_ack(&self) -> bool {
        self.awaiting_ack
    }

    pub fn progress(&self) -> f64 {
        if self.size == 0 {
            1.0
        }
        else {
            self.offset as f64 / self.size as f64
        }
    }
}
