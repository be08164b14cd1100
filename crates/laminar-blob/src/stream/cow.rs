//! Copy-on-first-write view.

use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};

use super::{closed_error, BlobStream};
use crate::config::DEFAULT_MAX_BUFFER_LEN;
use crate::error::BlobError;

/// Reads pass through to the source until the first mutating call, which
/// snapshots the entire source into a private buffer. From then on every read
/// and write uses the private buffer and the source is never touched again.
///
/// The source is owned and closed with the view.
pub struct CopyOnWriteStream<S: BlobStream> {
    source: S,
    copy: Option<Cursor<Vec<u8>>>,
    max_len: u64,
    closed: bool,
}

impl<S: BlobStream> CopyOnWriteStream<S> {
    /// Wraps `source` with the default buffer limit.
    pub fn new(source: S) -> Self {
        Self::with_max_len(source, DEFAULT_MAX_BUFFER_LEN)
    }

    /// Wraps `source`; the private buffer may hold at most `max_len` bytes.
    pub fn with_max_len(source: S, max_len: u64) -> Self {
        Self {
            source,
            copy: None,
            max_len,
            closed: false,
        }
    }

    /// Returns `true` once the source has been snapshotted.
    #[must_use]
    pub fn is_copied(&self) -> bool {
        self.copy.is_some()
    }

    /// Unwraps the view, returning the private buffer if one was taken.
    pub fn into_buffer(self) -> Option<Vec<u8>> {
        self.copy.map(Cursor::into_inner)
    }

    fn check_open(&self) -> io::Result<()> {
        if self.closed {
            Err(closed_error())
        } else {
            Ok(())
        }
    }

    fn check_limit(&self, len: u64) -> io::Result<()> {
        if len > self.max_len {
            return Err(BlobError::CopyOnWriteOverflow {
                len,
                max: self.max_len,
            }
            .into());
        }
        Ok(())
    }

    fn materialize(&mut self) -> io::Result<&mut Cursor<Vec<u8>>> {
        if self.copy.is_none() {
            let position = self.source.stream_position()?;
            let len = self.source.len()?;
            self.check_limit(len)?;

            let mut data = Vec::with_capacity(super::to_usize(len)?);
            self.source.seek(SeekFrom::Start(0))?;
            self.source.read_to_end(&mut data)?;

            let mut copy = Cursor::new(data);
            copy.set_position(position);
            self.copy = Some(copy);
        }
        Ok(self.copy.get_or_insert_with(|| Cursor::new(Vec::new())))
    }
}

impl<S: BlobStream> Read for CopyOnWriteStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.check_open()?;
        match &mut self.copy {
            Some(copy) => copy.read(buf),
            None => self.source.read(buf),
        }
    }
}

impl<S: BlobStream> Write for CopyOnWriteStream<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.check_open()?;
        let max_len = self.max_len;
        let copy = self.materialize()?;
        let end = copy.position().saturating_add(buf.len() as u64);
        if end > max_len && end > copy.get_ref().len() as u64 {
            return Err(BlobError::CopyOnWriteOverflow { len: end, max: max_len }.into());
        }
        copy.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.check_open()?;
        match &mut self.copy {
            Some(_) => Ok(()),
            None => self.source.flush(),
        }
    }
}

impl<S: BlobStream> Seek for CopyOnWriteStream<S> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.check_open()?;
        match &mut self.copy {
            Some(copy) => copy.seek(pos),
            None => self.source.seek(pos),
        }
    }
}

impl<S: BlobStream> BlobStream for CopyOnWriteStream<S> {
    fn len(&self) -> io::Result<u64> {
        match &self.copy {
            Some(copy) => copy.len(),
            None => self.source.len(),
        }
    }

    fn set_len(&mut self, len: u64) -> io::Result<()> {
        self.check_open()?;
        self.check_limit(len)?;
        self.materialize()?.set_len(len)
    }

    fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.source.close()
    }
}
