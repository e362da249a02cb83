//! Splitting files into chunks and partitions for sending, and reassembling them on the
//!  receiving side.

mod chunker;
mod digester;

pub use chunker::{ChunkerEvent, FileChunker, FileSource, OutgoingFile, DEFAULT_MIME};
pub use digester::{DigestStep, FileDigester, ReceivedFile};
