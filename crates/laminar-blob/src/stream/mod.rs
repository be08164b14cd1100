//! # Stream capabilities and view decorators
//!
//! Every byte store in this crate, physical or derived, implements
//! [`BlobStream`]: the `std::io` read/write/seek triple plus `len`,
//! `set_len` and an idempotent `close`. Decorators own their inner stream and
//! implement the same trait, so views compose by nesting rather than by
//! subclassing.
//!
//! ## Views
//!
//! - [`WindowStream`]: `[offset, offset + count)` of an inner stream with its
//!   own cursor.
//! - [`CopyOnWriteStream`]: reads pass through until the first mutation, which
//!   snapshots the source into a private buffer.
//! - [`DeferredWriteStream`]: writes are buffered privately and reconciled to
//!   the source only on flush or close.
//! - [`SharedStream`] / [`SharedCursor`]: one stream shared by several cursors,
//!   each positioned operation performed under a single lock.
//!
//! ```rust
//! use std::io::{Cursor, Read};
//! use laminar_blob::stream::{BlobStream, WindowStream};
//!
//! let source = Cursor::new(b"hello, world".to_vec());
//! let mut window = WindowStream::new(source, 7, Some(5)).unwrap();
//!
//! let mut text = String::new();
//! window.read_to_string(&mut text).unwrap();
//! assert_eq!(text, "world");
//! assert_eq!(window.len().unwrap(), 5);
//! ```

use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};

use bytes::Bytes;

mod cow;
mod deferred;
mod shared;
mod window;

pub use cow::CopyOnWriteStream;
pub use deferred::DeferredWriteStream;
pub use shared::{SharedCursor, SharedStream};
pub use window::WindowStream;

/// Capability set shared by physical streams and view decorators.
pub trait BlobStream: Read + Write + Seek + Send {
    /// Returns the current length in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store cannot be queried.
    fn len(&self) -> io::Result<u64>;

    /// Returns `true` if the stream holds no bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store cannot be queried.
    fn is_empty(&self) -> io::Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Truncates or zero-extends the stream to `len` bytes.
    ///
    /// The cursor is left where it was, even if that is past the new end.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream is read-only or the store fails.
    fn set_len(&mut self, len: u64) -> io::Result<()>;

    /// Releases per-open resources after flushing pending writes.
    ///
    /// Closing twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if pending writes cannot be flushed.
    fn close(&mut self) -> io::Result<()> {
        self.flush()
    }
}

impl<S: BlobStream + ?Sized> BlobStream for Box<S> {
    fn len(&self) -> io::Result<u64> {
        (**self).len()
    }

    fn is_empty(&self) -> io::Result<bool> {
        (**self).is_empty()
    }

    fn set_len(&mut self, len: u64) -> io::Result<()> {
        (**self).set_len(len)
    }

    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }
}

impl BlobStream for Cursor<Vec<u8>> {
    fn len(&self) -> io::Result<u64> {
        Ok(self.get_ref().len() as u64)
    }

    fn set_len(&mut self, len: u64) -> io::Result<()> {
        let len = to_usize(len)?;
        self.get_mut().resize(len, 0);
        Ok(())
    }
}

/// Convenience methods available on every [`BlobStream`].
pub trait BlobStreamExt: BlobStream {
    /// Reads the whole stream from offset 0. Leaves the cursor at the end.
    ///
    /// # Errors
    ///
    /// Returns an error if reading fails.
    fn read_all(&mut self) -> io::Result<Bytes> {
        let mut data = Vec::with_capacity(to_usize(self.len()?).unwrap_or(0));
        self.seek(SeekFrom::Start(0))?;
        self.read_to_end(&mut data)?;
        Ok(Bytes::from(data))
    }

    /// Replaces the whole content with `data`. Leaves the cursor at the end.
    ///
    /// # Errors
    ///
    /// Returns an error if truncation or writing fails.
    fn replace_contents(&mut self, data: &[u8]) -> io::Result<()> {
        self.set_len(0)?;
        self.seek(SeekFrom::Start(0))?;
        self.write_all(data)
    }

    /// Copies the whole stream, from offset 0, into `dst` in `chunk_size`
    /// pieces. Returns the number of bytes copied.
    ///
    /// # Errors
    ///
    /// Returns an error if reading or writing fails.
    fn copy_to<W: Write + ?Sized>(&mut self, dst: &mut W, chunk_size: usize) -> io::Result<u64> {
        self.seek(SeekFrom::Start(0))?;
        let mut chunk = vec![0u8; chunk_size.max(1)];
        let mut copied = 0u64;
        loop {
            let n = match self.read(&mut chunk) {
                Ok(0) => return Ok(copied),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            dst.write_all(&chunk[..n])?;
            copied += n as u64;
        }
    }
}

impl<T: BlobStream + ?Sized> BlobStreamExt for T {}

/// Converts a stream offset to a buffer index.
pub(crate) fn to_usize(value: u64) -> io::Result<usize> {
    usize::try_from(value).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("offset {value} exceeds addressable memory"),
        )
    })
}

/// Error returned by I/O on a closed view.
pub(crate) fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "stream is closed")
}

/// Resolves a seek request against a cursor and a length.
pub(crate) fn seek_position(current: u64, len: u64, pos: SeekFrom) -> io::Result<u64> {
    let target = match pos {
        SeekFrom::Start(offset) => Some(offset),
        SeekFrom::End(delta) => len.checked_add_signed(delta),
        SeekFrom::Current(delta) => current.checked_add_signed(delta),
    };
    target.ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            "invalid seek to a negative or overflowing position",
        )
    })
}

/// Copies bytes at `pos` out of `data`. Returns 0 at or past the end.
pub(crate) fn read_from_slice(data: &[u8], pos: u64, buf: &mut [u8]) -> usize {
    let Ok(start) = usize::try_from(pos) else {
        return 0;
    };
    if start >= data.len() {
        return 0;
    }
    let n = buf.len().min(data.len() - start);
    buf[..n].copy_from_slice(&data[start..start + n]);
    n
}

/// Writes `buf` at `pos`, zero-filling any gap past the current end.
pub(crate) fn write_into_vec(data: &mut Vec<u8>, pos: u64, buf: &[u8]) -> io::Result<usize> {
    let start = to_usize(pos)?;
    let end = start
        .checked_add(buf.len())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "write overflows"))?;
    if end > data.len() {
        data.resize(end, 0);
    }
    data[start..end].copy_from_slice(buf);
    Ok(buf.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_set_len() {
        let mut stream = Cursor::new(b"abcdef".to_vec());
        stream.set_len(3).unwrap();
        assert_eq!(stream.read_all().unwrap().as_ref(), b"abc");

        stream.set_len(5).unwrap();
        assert_eq!(stream.read_all().unwrap().as_ref(), b"abc\0\0");
        assert!(!stream.is_empty().unwrap());
    }

    #[test]
    fn test_replace_and_copy() {
        let mut src = Cursor::new(Vec::new());
        src.replace_contents(b"0123456789").unwrap();

        let mut dst = Vec::new();
        let copied = src.copy_to(&mut dst, 3).unwrap();
        assert_eq!(copied, 10);
        assert_eq!(dst, b"0123456789");
    }

    #[test]
    fn test_boxed_stream_delegates() {
        let mut boxed: Box<dyn BlobStream> = Box::new(Cursor::new(b"xyz".to_vec()));
        assert_eq!(boxed.len().unwrap(), 3);
        boxed.set_len(1).unwrap();
        assert_eq!(boxed.read_all().unwrap().as_ref(), b"x");
        boxed.close().unwrap();
    }

    #[test]
    fn test_seek_position() {
        assert_eq!(seek_position(5, 10, SeekFrom::Start(2)).unwrap(), 2);
        assert_eq!(seek_position(5, 10, SeekFrom::End(-3)).unwrap(), 7);
        assert_eq!(seek_position(5, 10, SeekFrom::Current(4)).unwrap(), 9);
        assert!(seek_position(5, 10, SeekFrom::Current(-6)).is_err());
        assert!(seek_position(0, 10, SeekFrom::End(-11)).is_err());
    }

    #[test]
    fn test_slice_helpers() {
        let mut data = b"abc".to_vec();
        write_into_vec(&mut data, 5, b"z").unwrap();
        assert_eq!(data, b"abc\0\0z");

        let mut buf = [0u8; 4];
        assert_eq!(read_from_slice(&data, 4, &mut buf), 2);
        assert_eq!(&buf[..2], b"\0z");
        assert_eq!(read_from_slice(&data, 6, &mut buf), 0);
    }
}
