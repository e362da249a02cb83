use bytes::{Bytes, BytesMut};

use crate::protocol::FileHeader;
use crate::transfer::chunker::DEFAULT_MIME;

/// A completely received file. It is handed to the consumer as is, and never written to disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceivedFile {
    pub name: String,
    pub mime: String,
    pub size: u64,
    pub data: Bytes,
}

#[derive(Debug, PartialEq)]
pub struct DigestStep {
    pub progress: f64,
    pub completed: Option<ReceivedFile>,
}

/// Reassembles a file from chunks in arrival order.
pub struct FileDigester {
    header: FileHeader,
    buffer: BytesMut,
    is_complete: bool,
}

impl FileDigester {
    pub fn new(header: FileHeader) -> FileDigester {
        let mut header = header;
        if header.mime.is_empty() {
            header.mime = DEFAULT_MIME.to_string();
        }

        FileDigester {
            buffer: BytesMut::with_capacity(header.size.min(16 * 1024 * 1024) as usize),
            header,
            is_complete: false,
        }
    }

    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    pub fn accept(&mut self, chunk: &[u8]) -> DigestStep {
        if !chunk.is_empty() && !self.is_complete {
            self.buffer.extend_from_slice(chunk);
        }

        DigestStep {
            progress: self.progress(),
            completed: self.try_complete(),
        }
    }

    /// Returns the assembled file exactly once, as soon as all bytes were received. A file of
    ///  size 0 is complete right away.
    pub fn try_complete(&mut self) -> Option<ReceivedFile> {
        if self.is_complete || self.bytes_received() < self.header.size {
            return None;
        }
        self.is_complete = true;

        let mut data = self.buffer.split().freeze();
        data.truncate(self.header.size as usize);

        Some(ReceivedFile {
            name: self.header.name.clone(),
            mime: self.header.mime.clone(),
            size: self.header.size,
            data,
        })
    }

    pub fn bytes_received(&self) -> u64 {
        if self.is_complete {
            self.header.size
        }
        else {
            self.buffer.len() as u64
        }
    }

    pub fn progress(&self) -> f64 {
        if self.header.size == 0 {
            return 1.0;
        }
        (self.bytes_received() as f64 / self.header.size as f64).min(1.0)
    }

    pub fn is_complete(&self) -> bool {
        self.is_complete
    }

    /// discard everything after `offset`, i.e. a partition that is going to be sent again
    pub fn truncate_to(&mut self, offset: u64) {
        if !self.is_complete {
            self.buffer.truncate(offset as usize);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn header(size: u64) -> FileHeader {
        FileHeader {
            name: "report.pdf".to_string(),
            mime: "application/pdf".to_string(),
            size,
        }
    }

    #[test]
    fn test_accept_and_complete() {
        let mut digester = FileDigester::new(header(6));

        let step = digester.accept(b"abc");
        assert_eq!(step.progress, 0.5);
        assert!(step.completed.is_none());

        let step = digester.accept(b"");
        assert_eq!(step.progress, 0.5);
        assert!(step.completed.is_none());

        let step = digester.accept(b"def");
        assert_eq!(step.progress, 1.0);
        assert_eq!(step.completed, Some(ReceivedFile {
            name: "report.pdf".to_string(),
            mime: "application/pdf".to_string(),
            size: 6,
            data: Bytes::from_static(b"abcdef"),
        }));

        // completion is reported only once
        let step = digester.accept(b"x");
        assert_eq!(step.progress, 1.0);
        assert!(step.completed.is_none());
    }

    #[test]
    fn test_zero_size() {
        let mut digester = FileDigester::new(header(0));
        assert_eq!(digester.progress(), 1.0);
        let file = digester.try_complete().unwrap();
        assert!(file.data.is_empty());
        assert!(digester.try_complete().is_none());
    }

    #[test]
    fn test_default_mime() {
        let mut h = header(1);
        h.mime = String::new();
        let mut digester = FileDigester::new(h);
        assert_eq!(digester.accept(b"x").completed.unwrap().mime, DEFAULT_MIME);
    }

    #[test]
    fn test_truncate_to() {
        let mut digester = FileDigester::new(header(10));
        digester.accept(b"0123");
        digester.accept(b"456");
        digester.truncate_to(4);
        assert_eq!(digester.bytes_received(), 4);
        let file = digester.accept(b"456789").completed.unwrap();
        assert_eq!(file.data, Bytes::from_static(b"0123456789"));
        assert!(digester.is_complete());
    }
}
