//! A stream shared between several cursors.
//!
//! Raw I/O on an open BLOB never takes the manager-wide lock, yet several
//! handles may read and write the same physical stream. [`SharedStream`] puts
//! the stream behind its own mutex and exposes positioned operations: each
//! `read_at`/`write_at` seeks and transfers under one lock acquisition, so
//! cursors never observe each other's seeks.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{seek_position, BlobStream, BlobStreamExt};

/// A reference-counted, lock-protected stream.
pub struct SharedStream<S = Box<dyn BlobStream>> {
    inner: Arc<Mutex<S>>,
}

impl<S> Clone for SharedStream<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: BlobStream> SharedStream<S> {
    /// Wraps `stream` for sharing.
    pub fn new(stream: S) -> Self {
        Self {
            inner: Arc::new(Mutex::new(stream)),
        }
    }

    /// Reads at `pos` into `buf`.
    ///
    /// # Errors
    ///
    /// Propagates seek and read failures of the inner stream.
    pub fn read_at(&self, pos: u64, buf: &mut [u8]) -> io::Result<usize> {
        let mut stream = self.inner.lock();
        stream.seek(SeekFrom::Start(pos))?;
        stream.read(buf)
    }

    /// Writes `buf` at `pos`.
    ///
    /// # Errors
    ///
    /// Propagates seek and write failures of the inner stream.
    pub fn write_at(&self, pos: u64, buf: &[u8]) -> io::Result<usize> {
        let mut stream = self.inner.lock();
        stream.seek(SeekFrom::Start(pos))?;
        stream.write(buf)
    }

    /// Returns the inner stream's length.
    ///
    /// # Errors
    ///
    /// Propagates failures of the inner stream.
    pub fn len(&self) -> io::Result<u64> {
        self.inner.lock().len()
    }

    /// Returns `true` if the inner stream is empty.
    ///
    /// # Errors
    ///
    /// Propagates failures of the inner stream.
    pub fn is_empty(&self) -> io::Result<bool> {
        self.inner.lock().is_empty()
    }

    /// Sets the inner stream's length.
    ///
    /// # Errors
    ///
    /// Propagates failures of the inner stream.
    pub fn set_len(&self, len: u64) -> io::Result<()> {
        self.inner.lock().set_len(len)
    }

    /// Flushes the inner stream.
    ///
    /// # Errors
    ///
    /// Propagates failures of the inner stream.
    pub fn flush(&self) -> io::Result<()> {
        self.inner.lock().flush()
    }

    /// Closes the inner stream. Other clones observe the closed stream.
    ///
    /// # Errors
    ///
    /// Propagates failures of the inner stream.
    pub fn close(&self) -> io::Result<()> {
        self.inner.lock().close()
    }

    /// Copies the whole inner stream into `dst` while holding the lock, so the
    /// copy never interleaves with writes through other cursors.
    ///
    /// # Errors
    ///
    /// Propagates read and write failures.
    pub fn copy_to<W: Write + ?Sized>(&self, dst: &mut W, chunk_size: usize) -> io::Result<u64> {
        self.inner.lock().copy_to(dst, chunk_size)
    }

    /// Swaps the inner stream, returning the previous one. Every cursor sees
    /// the replacement on its next operation.
    pub fn replace(&self, stream: S) -> S {
        std::mem::replace(&mut *self.inner.lock(), stream)
    }

    /// Runs `f` with exclusive access to the inner stream.
    pub fn with<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        f(&mut self.inner.lock())
    }

    /// Returns `true` if both handles share the same stream.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// An independent cursor over a [`SharedStream`].
///
/// Closing a cursor flushes but never closes the shared stream.
pub struct SharedCursor<S = Box<dyn BlobStream>> {
    shared: SharedStream<S>,
    pos: u64,
}

impl<S: BlobStream> SharedCursor<S> {
    /// Creates a cursor positioned at offset 0.
    pub fn new(shared: SharedStream<S>) -> Self {
        Self { shared, pos: 0 }
    }

    /// Returns the shared stream this cursor reads.
    pub fn shared(&self) -> &SharedStream<S> {
        &self.shared
    }

    /// Returns the cursor position.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.pos
    }
}

impl<S: BlobStream> Read for SharedCursor<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.shared.read_at(self.pos, buf)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl<S: BlobStream> Write for SharedCursor<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.shared.write_at(self.pos, buf)?;
        self.pos += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.shared.flush()
    }
}

impl<S: BlobStream> Seek for SharedCursor<S> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let len = match pos {
            SeekFrom::End(_) => self.shared.len()?,
            _ => 0,
        };
        self.pos = seek_position(self.pos, len, pos)?;
        Ok(self.pos)
    }
}

impl<S: BlobStream> BlobStream for SharedCursor<S> {
    fn len(&self) -> io::Result<u64> {
        self.shared.len()
    }

    fn set_len(&mut self, len: u64) -> io::Result<()> {
        self.shared.set_len(len)
    }

    fn close(&mut self) -> io::Result<()> {
        self.shared.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn shared(data: &[u8]) -> SharedStream<Cursor<Vec<u8>>> {
        SharedStream::new(Cursor::new(data.to_vec()))
    }

    #[test]
    fn test_cursors_are_independent() {
        let stream = shared(b"abcdef");
        let mut a = SharedCursor::new(stream.clone());
        let mut b = SharedCursor::new(stream.clone());

        let mut buf = [0u8; 2];
        a.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ab");

        b.seek(SeekFrom::Start(4)).unwrap();
        b.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ef");

        // `a` continues where it left off.
        a.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"cd");
    }

    #[test]
    fn test_writes_visible_to_other_cursors() {
        let stream = shared(b"");
        let mut writer = SharedCursor::new(stream.clone());
        writer.write_all(b"payload").unwrap();

        let mut reader = SharedCursor::new(stream.clone());
        assert_eq!(reader.read_all().unwrap().as_ref(), b"payload");
        assert_eq!(reader.len().unwrap(), 7);
    }

    #[test]
    fn test_replace_rebinds_every_cursor() {
        let stream = shared(b"old");
        let mut cursor = SharedCursor::new(stream.clone());

        let previous = stream.replace(Cursor::new(b"brand new".to_vec()));
        assert_eq!(previous.into_inner(), b"old");
        assert_eq!(cursor.read_all().unwrap().as_ref(), b"brand new");
    }

    #[test]
    fn test_cursor_close_leaves_stream_usable() {
        let stream = shared(b"keep");
        let mut cursor = SharedCursor::new(stream.clone());
        cursor.close().unwrap();
        assert_eq!(stream.len().unwrap(), 4);
        assert!(stream.ptr_eq(cursor.shared()));
    }

    #[test]
    fn test_seek_from_end() {
        let stream = shared(b"0123456789");
        let mut cursor = SharedCursor::new(stream);
        assert_eq!(cursor.seek(SeekFrom::End(-2)).unwrap(), 8);
        let mut rest = Vec::new();
        cursor.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b"89");
    }
}
