//! File-backed stream provider.
//!
//! ## Disk Layout
//!
//! ```text
//! {dir}/
//!   1        # bytes of stream 1
//!   2
//!   17       # a promoted alias keeps the renamed file of its former owner
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fxhash::FxHashSet;
use parking_lot::Mutex;
use tracing::debug;

use super::StreamProvider;
use crate::error::BlobError;
use crate::identity::StreamId;
use crate::stream::BlobStream;
use crate::Result;

/// One file per identity in a private directory.
///
/// Each file is opened by at most one stream at a time; a second `open` of
/// the same identity fails with [`BlobError::StreamInUse`] until `close`.
pub struct FileStreamProvider {
    dir: PathBuf,
    sync_on_close: bool,
    open: Mutex<FxHashSet<StreamId>>,
}

impl FileStreamProvider {
    /// Creates a provider rooted at `dir`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns [`BlobError::Storage`] if the directory cannot be created.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        debug!(path = %dir.display(), "Initialized file stream provider");
        Ok(Self {
            dir,
            sync_on_close: false,
            open: Mutex::new(FxHashSet::default()),
        })
    }

    /// Fsync files when their stream is closed.
    #[must_use]
    pub fn with_sync_on_close(mut self, enabled: bool) -> Self {
        self.sync_on_close = enabled;
        self
    }

    /// Returns the storage directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the file path for `id`.
    #[must_use]
    pub fn path(&self, id: StreamId) -> PathBuf {
        self.dir.join(id.to_string())
    }

    fn ensure_closed(&self, open: &FxHashSet<StreamId>, id: StreamId) -> Result<()> {
        if open.contains(&id) {
            return Err(BlobError::StreamInUse { id, open_count: 1 });
        }
        Ok(())
    }
}

impl StreamProvider for FileStreamProvider {
    fn kind(&self) -> &'static str {
        "file"
    }

    fn open(&self, id: StreamId) -> Result<Box<dyn BlobStream>> {
        let mut open = self.open.lock();
        self.ensure_closed(&open, id)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.path(id))?;
        open.insert(id);

        Ok(Box::new(FileStream {
            file,
            sync_on_close: self.sync_on_close,
            closed: false,
        }))
    }

    fn close(&self, id: StreamId) -> Result<()> {
        self.open.lock().remove(&id);
        Ok(())
    }

    fn destroy(&self, id: StreamId) -> Result<()> {
        let open = self.open.lock();
        self.ensure_closed(&open, id)?;
        match fs::remove_file(self.path(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn reassign(&self, old: StreamId, new: StreamId) -> Result<()> {
        if old == new {
            return Ok(());
        }
        let open = self.open.lock();
        self.ensure_closed(&open, old)?;
        self.ensure_closed(&open, new)?;

        match fs::rename(self.path(old), self.path(new)) {
            Ok(()) => {
                debug!(from = %old, to = %new, "Renamed stream file");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Stream over one provider file.
pub struct FileStream {
    file: File,
    sync_on_close: bool,
    closed: bool,
}

impl Read for FileStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Write for FileStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Seek for FileStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

impl BlobStream for FileStream {
    fn len(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn set_len(&mut self, len: u64) -> io::Result<()> {
        self.file.set_len(len)
    }

    fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.file.flush()?;
        if self.sync_on_close {
            self.file.sync_all()?;
        }
        Ok(())
    }
}
