//! Windowed view over a byte range of another stream.

use std::io::{self, Read, Seek, SeekFrom, Write};

use super::{closed_error, seek_position, to_usize, BlobStream};
use crate::error::BlobError;

/// Presents `[offset, offset + count)` of an inner stream with its own cursor.
///
/// Every access repositions the inner stream to `offset + position` first, so
/// the inner cursor may be moved by others between calls. An unbounded window
/// (`count == None`) extends to the end of the inner stream and may grow it.
///
/// By default the window owns its inner stream and closing the window closes
/// it; [`WindowStream::with_owns_inner`] turns that off, in which case closing
/// only detaches the window.
pub struct WindowStream<S: BlobStream> {
    inner: S,
    offset: u64,
    count: Option<u64>,
    pos: u64,
    owns_inner: bool,
    read_only: bool,
    closed: bool,
}

impl<S: BlobStream> WindowStream<S> {
    /// Creates a window of `count` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`BlobError::InvalidArgument`] if the window end overflows.
    pub fn new(inner: S, offset: u64, count: Option<u64>) -> Result<Self, BlobError> {
        if let Some(count) = count {
            if offset.checked_add(count).is_none() {
                return Err(BlobError::InvalidArgument(format!(
                    "window {offset}+{count} overflows"
                )));
            }
        }
        Ok(Self {
            inner,
            offset,
            count,
            pos: 0,
            owns_inner: true,
            read_only: false,
            closed: false,
        })
    }

    /// Creates a window over the whole inner stream.
    pub fn unbounded(inner: S) -> Self {
        Self {
            inner,
            offset: 0,
            count: None,
            pos: 0,
            owns_inner: true,
            read_only: false,
            closed: false,
        }
    }

    /// Sets whether closing the window also closes the inner stream.
    #[must_use]
    pub fn with_owns_inner(mut self, owns: bool) -> Self {
        self.owns_inner = owns;
        self
    }

    /// Rejects writes and resizes with `PermissionDenied`.
    #[must_use]
    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Returns the window's start offset in the inner stream.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Returns the window size, `None` if unbounded.
    #[must_use]
    pub fn count(&self) -> Option<u64> {
        self.count
    }

    /// Returns `true` once the window has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Returns the inner stream.
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Unwraps the window, returning the inner stream.
    pub fn into_inner(self) -> S {
        self.inner
    }

    fn check_open(&self) -> io::Result<()> {
        if self.closed {
            Err(closed_error())
        } else {
            Ok(())
        }
    }

    fn check_writable(&self) -> io::Result<()> {
        self.check_open()?;
        if self.read_only {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "window is read-only",
            ));
        }
        Ok(())
    }

    fn reposition(&mut self) -> io::Result<()> {
        self.inner.seek(SeekFrom::Start(self.offset + self.pos))?;
        Ok(())
    }
}

impl<S: BlobStream> Read for WindowStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.check_open()?;
        let len = self.len()?;
        if self.pos >= len || buf.is_empty() {
            return Ok(0);
        }
        let available = to_usize(len - self.pos).unwrap_or(usize::MAX);
        let want = buf.len().min(available);
        self.reposition()?;
        let n = self.inner.read(&mut buf[..want])?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl<S: BlobStream> Write for WindowStream<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.check_writable()?;
        let want = match self.count {
            Some(count) if self.pos >= count && !buf.is_empty() => {
                return Err(BlobError::InvalidArgument(format!(
                    "write at {} past the end of a {count} byte window",
                    self.pos
                ))
                .into());
            }
            Some(count) => buf.len().min(to_usize(count - self.pos).unwrap_or(usize::MAX)),
            None => buf.len(),
        };
        self.reposition()?;
        let n = self.inner.write(&buf[..want])?;
        self.pos += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.check_open()?;
        self.inner.flush()
    }
}

impl<S: BlobStream> Seek for WindowStream<S> {
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

impl<S: BlobStream> BlobStream for WindowStream<S> {
    fn len(&self) -> io::Result<u64> {
        let visible = self.inner.len()?.saturating_sub(self.offset);
        Ok(match self.count {
            Some(count) => visible.min(count),
            None => visible,
        })
    }

    fn set_len(&mut self, len: u64) -> io::Result<()> {
        self.check_writable()?;
        if self.count.is_some() {
            return Err(BlobError::InvalidArgument("cannot resize a bounded window".into()).into());
        }
        let end = self.offset.checked_add(len).ok_or_else(|| {
            io::Error::from(BlobError::InvalidArgument(format!(
                "length {len} overflows the window"
            )))
        })?;
        self.inner.set_len(end)
    }

    fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if self.owns_inner {
            self.inner.close()
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::BlobStreamExt;
    use std::io::Cursor;

    fn source() -> Cursor<Vec<u8>> {
        Cursor::new(b"0123456789".to_vec())
    }

    #[test]
    fn test_bounded_read() {
        let mut window = WindowStream::new(source(), 2, Some(4)).unwrap();
        assert_eq!(window.len().unwrap(), 4);
        assert_eq!(window.read_all().unwrap().as_ref(), b"2345");
    }

    #[test]
    fn test_window_clipped_by_inner_length() {
        let mut window = WindowStream::new(source(), 8, Some(10)).unwrap();
        assert_eq!(window.len().unwrap(), 2);
        assert_eq!(window.read_all().unwrap().as_ref(), b"89");

        let past_end = WindowStream::new(source(), 20, None).unwrap();
        assert_eq!(past_end.len().unwrap(), 0);
    }

    #[test]
    fn test_write_repositions_inner() {
        let mut window = WindowStream::new(source(), 3, Some(3)).unwrap();
        window.write_all(b"abc").unwrap();

        // A fourth byte does not fit.
        let err = window.write(b"d").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

        let mut inner = window.into_inner();
        assert_eq!(inner.read_all().unwrap().as_ref(), b"012abc6789");
    }

    #[test]
    fn test_own_cursor_survives_inner_moves() {
        let mut window = WindowStream::new(source(), 5, None).unwrap();
        let mut buf = [0u8; 2];
        window.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"56");

        window.inner.seek(SeekFrom::Start(0)).unwrap();
        window.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"78");
    }

    #[test]
    fn test_unbounded_grows_inner() {
        let mut window = WindowStream::unbounded(Cursor::new(Vec::new()));
        window.write_all(b"grow").unwrap();
        window.set_len(6).unwrap();
        assert_eq!(window.len().unwrap(), 6);
        assert_eq!(window.read_all().unwrap().as_ref(), b"grow\0\0");
    }

    #[test]
    fn test_bounded_window_cannot_resize() {
        let mut window = WindowStream::new(source(), 0, Some(4)).unwrap();
        assert!(window.set_len(2).is_err());
    }

    #[test]
    fn test_overflowing_window_rejected() {
        assert!(matches!(
            WindowStream::new(source(), u64::MAX, Some(2)),
            Err(BlobError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut window = WindowStream::new(source(), 0, None)
            .unwrap()
            .with_owns_inner(false);
        window.close().unwrap();
        window.close().unwrap();
        assert!(window.is_closed());
        assert!(window.read(&mut [0u8; 1]).is_err());
    }

    #[test]
    fn test_read_only_window() {
        let mut window = WindowStream::unbounded(source()).with_read_only(true);
        assert_eq!(window.read_all().unwrap().as_ref(), b"0123456789");

        let err = window.write(b"x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
        assert!(window.set_len(0).is_err());
        assert_eq!(window.len().unwrap(), 10);
    }
}
