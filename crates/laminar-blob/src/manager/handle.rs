//! Manager-aware stream handle.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::warn;

use super::central::Central;
use super::OpenMode;
use crate::error::BlobError;
use crate::identity::{OwnerTag, StreamId};
use crate::stream::{closed_error, BlobStream, SharedCursor};

/// One open of a stream, returned by the central manager.
///
/// Reads and writes go straight to the stream's binding without the manager
/// lock. The first write while the bytes are shared calls back into the
/// manager to split the stream off; after that writes are plain I/O again.
///
/// Dropping the handle closes it.
pub struct ManagedStream {
    manager: Arc<Central>,
    tag: OwnerTag,
    id: StreamId,
    mode: OpenMode,
    ticket: u64,
    revoked: Arc<AtomicBool>,
    cursor: SharedCursor,
    exclusive: Arc<AtomicBool>,
    closed: bool,
}

impl ManagedStream {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        manager: Arc<Central>,
        tag: OwnerTag,
        id: StreamId,
        mode: OpenMode,
        ticket: u64,
        revoked: Arc<AtomicBool>,
        cursor: SharedCursor,
        exclusive: Arc<AtomicBool>,
    ) -> Self {
        Self {
            manager,
            tag,
            id,
            mode,
            ticket,
            revoked,
            cursor,
            exclusive,
            closed: false,
        }
    }

    /// Returns the stream identity.
    #[must_use]
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Returns the tag this handle was opened for.
    #[must_use]
    pub fn tag(&self) -> OwnerTag {
        self.tag
    }

    /// Returns the open mode.
    #[must_use]
    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    /// Returns `true` once the handle has been closed, or its open was
    /// released through the manager.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed || self.is_revoked()
    }

    /// The manager released this open on the handle's behalf.
    fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::Acquire)
    }

    fn check_open(&self) -> io::Result<()> {
        if self.is_closed() {
            return Err(closed_error());
        }
        self.manager.check_open()?;
        Ok(())
    }

    fn prepare_write(&mut self) -> io::Result<()> {
        self.check_open()?;
        if !self.mode.is_writable() {
            return Err(BlobError::ReadOnly(self.id).into());
        }
        if !self.exclusive.load(Ordering::Acquire) {
            self.manager.change(self.id)?;
        }
        Ok(())
    }
}

impl Read for ManagedStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.check_open()?;
        self.cursor.read(buf)
    }
}

impl Write for ManagedStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.prepare_write()?;
        self.cursor.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.check_open()?;
        self.cursor.flush()
    }
}

impl Seek for ManagedStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.check_open()?;
        self.cursor.seek(pos)
    }
}

impl BlobStream for ManagedStream {
    fn len(&self) -> io::Result<u64> {
        self.cursor.len()
    }

    fn set_len(&mut self, len: u64) -> io::Result<()> {
        self.prepare_write()?;
        self.cursor.set_len(len)
    }

    fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if self.is_revoked() {
            return Ok(());
        }
        let flushed = if self.mode.is_writable() {
            self.cursor.flush()
        } else {
            Ok(())
        };
        let released = self
            .manager
            .close(self.tag, self.id, Some(self.ticket))
            .map_err(io::Error::from);
        flushed.and(released)
    }
}

impl Drop for ManagedStream {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(stream_id = %self.id, owner = %self.tag, error = %e, "Failed to close stream handle");
        }
    }
}
