//! Deferred-write view: buffer writes privately until flush.
//!
//! ## Buffer model
//!
//! While modified, the logical content is split in three ranges:
//!
//! ```text
//! [0, buffered)             private buffer
//! [buffered, source_valid)  still identical to the source at the same offset
//! [source_valid, len)       zeros (the stream was truncated, then grown)
//! ```
//!
//! Reads never enlarge the buffer; writes pull the source prefix in front of
//! them so the buffer stays contiguous. Flush loads the remainder and rewrites
//! the source with truncate-then-copy.

use std::io::{self, Read, Seek, SeekFrom, Write};

use super::{closed_error, read_from_slice, seek_position, to_usize, write_into_vec, BlobStream};
use crate::config::DEFAULT_MAX_BUFFER_LEN;
use crate::error::BlobError;

/// Buffers every write in memory and reconciles it to the source only on
/// [`flush`](Write::flush) or [`close`](BlobStream::close).
///
/// Until the first mutation the view is a passthrough; [`is_modified`]
/// distinguishes that state from pending writes.
///
/// [`is_modified`]: DeferredWriteStream::is_modified
pub struct DeferredWriteStream<S: BlobStream> {
    source: S,
    buffer: Vec<u8>,
    len: u64,
    source_valid: u64,
    pos: u64,
    modified: bool,
    max_len: u64,
    flushes: u64,
    closed: bool,
}

impl<S: BlobStream> DeferredWriteStream<S> {
    /// Wraps `source` with the default buffer limit.
    pub fn new(source: S) -> Self {
        Self::with_max_len(source, DEFAULT_MAX_BUFFER_LEN)
    }

    /// Wraps `source`; the private buffer may hold at most `max_len` bytes.
    pub fn with_max_len(source: S, max_len: u64) -> Self {
        Self {
            source,
            buffer: Vec::new(),
            len: 0,
            source_valid: 0,
            pos: 0,
            modified: false,
            max_len,
            flushes: 0,
            closed: false,
        }
    }

    /// Returns `true` if writes are pending.
    #[must_use]
    pub fn is_modified(&self) -> bool {
        self.modified
    }

    /// Number of times pending writes were reconciled to the source.
    #[must_use]
    pub fn flush_count(&self) -> u64 {
        self.flushes
    }

    /// Bytes currently held in the private buffer.
    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Returns `true` once the view has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Returns the source stream.
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Swaps the source, returning the previous one.
    ///
    /// The new source must present the same bytes as the old one, for example
    /// the same stream reopened in another mode; pending writes are kept and
    /// reconciled to the new source.
    pub fn replace_source(&mut self, source: S) -> S {
        std::mem::replace(&mut self.source, source)
    }

    /// Drops pending writes without touching the source.
    pub fn discard(&mut self) {
        self.buffer = Vec::new();
        self.modified = false;
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

    fn begin_modification(&mut self) -> io::Result<()> {
        if !self.modified {
            self.len = self.source.len()?;
            self.source_valid = self.len;
            self.buffer.clear();
            self.modified = true;
        }
        Ok(())
    }

    /// Grows the buffer to `target` bytes, pulling from the source where it
    /// is still valid and zero-filling past that.
    fn load_to(&mut self, target: u64) -> io::Result<()> {
        let loaded = self.buffer.len() as u64;
        if target <= loaded {
            return Ok(());
        }
        self.check_limit(target)?;

        let from_source = target.min(self.source_valid);
        let start = self.buffer.len();
        self.buffer.resize(to_usize(target)?, 0);
        if from_source > loaded {
            let end = to_usize(from_source)?;
            fill_from(&mut self.source, loaded, &mut self.buffer[start..end])?;
        }
        Ok(())
    }

    fn read_modified(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.len || buf.is_empty() {
            return Ok(0);
        }
        let remaining = to_usize(self.len - self.pos).unwrap_or(usize::MAX);
        let buf_len = buf.len().min(remaining);
        let buf = &mut buf[..buf_len];
        let loaded = self.buffer.len() as u64;

        let n = if self.pos < loaded {
            read_from_slice(&self.buffer, self.pos, buf)
        } else if self.pos < self.source_valid {
            let want = buf_len.min(to_usize(self.source_valid - self.pos).unwrap_or(usize::MAX));
            self.source.seek(SeekFrom::Start(self.pos))?;
            self.source.read(&mut buf[..want])?
        } else {
            buf.fill(0);
            buf_len
        };
        self.pos += n as u64;
        Ok(n)
    }

    /// Writes the buffered content back to the source.
    fn reconcile(&mut self) -> io::Result<()> {
        if !self.modified {
            return Ok(());
        }
        self.load_to(self.len)?;
        self.source.set_len(0)?;
        self.source.seek(SeekFrom::Start(0))?;
        self.source.write_all(&self.buffer)?;
        self.source.flush()?;

        self.flushes += 1;
        self.discard();
        Ok(())
    }
}

/// Fills `dst` from `source` starting at `offset`. Bytes the source no longer
/// has stay zero.
fn fill_from<S: BlobStream>(source: &mut S, offset: u64, dst: &mut [u8]) -> io::Result<()> {
    source.seek(SeekFrom::Start(offset))?;
    let mut filled = 0;
    while filled < dst.len() {
        match source.read(&mut dst[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

impl<S: BlobStream> Read for DeferredWriteStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.check_open()?;
        if self.modified {
            return self.read_modified(buf);
        }
        self.source.seek(SeekFrom::Start(self.pos))?;
        let n = self.source.read(buf)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl<S: BlobStream> Write for DeferredWriteStream<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.check_open()?;
        if buf.is_empty() {
            return Ok(0);
        }
        let end = self.pos.saturating_add(buf.len() as u64);
        self.check_limit(end)?;
        self.begin_modification()?;
        self.load_to(self.pos)?;

        let n = write_into_vec(&mut self.buffer, self.pos, buf)?;
        self.pos = end;
        self.len = self.len.max(end);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.check_open()?;
        if self.modified {
            self.reconcile()
        } else {
            self.source.flush()
        }
    }
}

impl<S: BlobStream> Seek for DeferredWriteStream<S> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.check_open()?;
        let len = match pos {
            SeekFrom::End(_) => self.len()?,
            _ => 0,
        };
        self.pos = seek_position(self.pos, len, pos)?;
        Ok(self.pos)
    }
}

impl<S: BlobStream> BlobStream for DeferredWriteStream<S> {
    fn len(&self) -> io::Result<u64> {
        if self.modified {
            Ok(self.len)
        } else {
            self.source.len()
        }
    }

    fn set_len(&mut self, len: u64) -> io::Result<()> {
        self.check_open()?;
        self.check_limit(len)?;
        self.begin_modification()?;
        if len < self.buffer.len() as u64 {
            self.buffer.truncate(to_usize(len)?);
        }
        self.source_valid = self.source_valid.min(len);
        self.len = len;
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        let reconciled = self.reconcile();
        self.closed = true;
        let closed = self.source.close();
        reconciled.and(closed)
    }
}
