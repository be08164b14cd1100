//! Single-consumer caching manager.
//!
//! A [`LocalStreamManager`] sits in front of a source manager (a central
//! manager or another local manager) and keeps one cache per touched stream:
//! a deferred-write view over a source handle. Opening and closing a cached
//! stream never reaches the source; writes stay in the cache until
//! [`flush`](LocalStreamManager::flush), [`release`](LocalStreamManager::release)
//! or disposal.
//!
//! The manager does no locking of its own. Share a central manager between
//! threads and give each consumer its own local manager.

use std::io::{self, Read, Seek, SeekFrom, Write};

use fxhash::FxHashMap;
use tracing::{debug, trace, warn};

use super::{OpenMode, StreamManager};
use crate::config::{StreamManagerConfig, DEFAULT_COPY_CHUNK_SIZE, DEFAULT_MAX_BUFFER_LEN};
use crate::error::BlobError;
use crate::identity::{OwnerTag, StreamId};
use crate::stream::{
    BlobStream, CopyOnWriteStream, DeferredWriteStream, SharedCursor, SharedStream, WindowStream,
};
use crate::Result;

type CacheStream = DeferredWriteStream<Box<dyn BlobStream>>;

/// Cached state of one stream: the source handle behind a deferred-write
/// buffer.
struct LocalCache {
    tag: OwnerTag,
    mode: OpenMode,
    stream: SharedStream<CacheStream>,
}

impl LocalCache {
    fn is_modified(&self) -> bool {
        self.stream.with(|cache| cache.is_modified())
    }
}

/// Cursor over a local cache. Flushing and closing are left to the manager,
/// so a view never pushes writes upstream on its own.
struct CacheCursor(SharedCursor<CacheStream>);

impl Read for CacheCursor {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl Write for CacheCursor {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for CacheCursor {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.0.seek(pos)
    }
}

impl BlobStream for CacheCursor {
    fn len(&self) -> io::Result<u64> {
        self.0.len()
    }

    fn set_len(&mut self, len: u64) -> io::Result<()> {
        self.0.set_len(len)
    }

    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct LocalEntry {
    cache: Option<LocalCache>,
}

/// Caching facade over a source [`StreamManager`].
///
/// # Example
///
/// ```rust
/// use std::io::Write;
/// use laminar_blob::{
///     BlobStream, CentralStreamManager, LocalStreamManager, OpenMode, OwnerTag,
///     StreamManagerConfig,
/// };
///
/// let central = CentralStreamManager::new(StreamManagerConfig::in_memory()).unwrap();
/// let mut local = LocalStreamManager::new(central.clone());
/// let tag = OwnerTag(1);
///
/// let id = local.allocate().unwrap();
/// let mut stream = local.open(tag, id, OpenMode::Write).unwrap();
/// stream.write_all(b"buffered").unwrap();
/// stream.close().unwrap();
/// assert!(local.is_modified(id));
///
/// local.release(id).unwrap();
/// assert!(!local.is_cached(id));
/// ```
pub struct LocalStreamManager<M: StreamManager> {
    source: M,
    copy_chunk_size: usize,
    max_buffer_len: u64,
    entries: FxHashMap<StreamId, LocalEntry>,
    disposed: bool,
}

impl<M: StreamManager> LocalStreamManager<M> {
    /// Wraps `source` with default buffer settings.
    pub fn new(source: M) -> Self {
        Self {
            source,
            copy_chunk_size: DEFAULT_COPY_CHUNK_SIZE,
            max_buffer_len: DEFAULT_MAX_BUFFER_LEN,
            entries: FxHashMap::default(),
            disposed: false,
        }
    }

    /// Wraps `source`, taking chunk and buffer sizes from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`BlobError::InvalidArgument`] for an invalid configuration.
    pub fn with_config(source: M, config: &StreamManagerConfig) -> Result<Self> {
        config.validate()?;
        let mut manager = Self::new(source);
        manager.copy_chunk_size = config.copy_chunk_size;
        manager.max_buffer_len = config.max_buffer_len;
        Ok(manager)
    }

    /// Returns the source manager.
    pub fn source(&self) -> &M {
        &self.source
    }

    /// Returns the source manager mutably.
    pub fn source_mut(&mut self) -> &mut M {
        &mut self.source
    }

    /// Returns `true` if a cache is resident for `id`.
    #[must_use]
    pub fn is_cached(&self, id: StreamId) -> bool {
        self.cache(id).is_some()
    }

    /// Returns `true` if the cache of `id` holds unflushed writes.
    #[must_use]
    pub fn is_modified(&self, id: StreamId) -> bool {
        self.cache(id).is_some_and(LocalCache::is_modified)
    }

    /// Returns `true` after [`dispose`](Self::dispose).
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    fn cache(&self, id: StreamId) -> Option<&LocalCache> {
        self.entries.get(&id).and_then(|entry| entry.cache.as_ref())
    }

    fn check_open(&self) -> Result<()> {
        if self.disposed {
            return Err(BlobError::ManagerClosed);
        }
        Ok(())
    }

    /// Allocates a stream in the source and tracks it locally.
    ///
    /// # Errors
    ///
    /// Returns [`BlobError::ManagerClosed`] after disposal, or the source's
    /// error.
    pub fn allocate(&mut self) -> Result<StreamId> {
        self.check_open()?;
        let id = self.source.allocate()?;
        self.entries.insert(id, LocalEntry::default());
        Ok(id)
    }

    /// References `id`.
    ///
    /// If the local cache of `id` holds unflushed writes, the source would
    /// alias stale bytes, so a new source stream holding a copy of the local
    /// bytes is allocated instead.
    ///
    /// # Errors
    ///
    /// Returns [`BlobError::ManagerClosed`] after disposal, or the source's
    /// error.
    pub fn reference(&mut self, id: StreamId) -> Result<StreamId> {
        self.check_open()?;
        let dirty = self
            .cache(id)
            .filter(|cache| cache.is_modified())
            .map(|cache| (cache.tag, cache.stream.clone()));

        let Some((tag, cache)) = dirty else {
            let alias = self.source.reference(id)?;
            self.entries.insert(alias, LocalEntry::default());
            return Ok(alias);
        };

        let copy = self.source.allocate()?;
        let mut target = self.source.open(tag, copy, OpenMode::Write)?;
        let copied = cache.copy_to(&mut target, self.copy_chunk_size);
        let closed = target.close();
        drop(target);

        match copied.and_then(|bytes| closed.map(|()| bytes)) {
            Ok(bytes) => {
                self.entries.insert(copy, LocalEntry::default());
                debug!(stream_id = %copy, source = %id, bytes, "Referenced modified stream by copy");
                Ok(copy)
            }
            Err(e) => {
                if let Err(cleanup) = self.source.deallocate(copy) {
                    warn!(stream_id = %copy, error = %cleanup, "Failed to deallocate partial copy");
                }
                Err(e.into())
            }
        }
    }

    /// Drops the local cache of `id`, discarding pending writes, and
    /// deallocates it in the source.
    ///
    /// # Errors
    ///
    /// Returns [`BlobError::ManagerClosed`] after disposal, or the source's
    /// error.
    pub fn deallocate(&mut self, id: StreamId) -> Result<()> {
        self.check_open()?;
        if let Some(cache) = self.entries.remove(&id).and_then(|entry| entry.cache) {
            cache.stream.with(CacheStream::discard);
            cache.stream.close()?;
        }
        self.source.deallocate(id)
    }

    /// Opens `id` through its local cache, creating the cache on first use.
    ///
    /// The returned view has its own cursor. Flushing or closing it leaves
    /// the cache resident and untouched. [`OpenMode::Read`] views reject writes;
    /// [`OpenMode::Private`] views keep their writes to themselves.
    ///
    /// A cache created for reading is reopened in write mode the first time
    /// `id` is opened for writing.
    ///
    /// # Errors
    ///
    /// Returns [`BlobError::ManagerClosed`] after disposal, or the source's
    /// error when the source stream has to be opened.
    pub fn open(&mut self, tag: OwnerTag, id: StreamId, mode: OpenMode) -> Result<Box<dyn BlobStream>> {
        self.check_open()?;
        let writable = mode.is_writable();
        let cache = self.cache_for(tag, id, writable)?;

        let view = WindowStream::unbounded(CacheCursor(SharedCursor::new(cache)))
            .with_owns_inner(false)
            .with_read_only(!writable);
        Ok(match mode {
            OpenMode::Private => Box::new(CopyOnWriteStream::with_max_len(view, self.max_buffer_len)),
            OpenMode::Read | OpenMode::Write => Box::new(view),
        })
    }

    fn cache_for(&mut self, tag: OwnerTag, id: StreamId, writable: bool) -> Result<SharedStream<CacheStream>> {
        if let Some(cache) = self.entries.get_mut(&id).and_then(|entry| entry.cache.as_mut()) {
            if writable && cache.mode == OpenMode::Read {
                let reopened = self.source.open(cache.tag, id, OpenMode::Write)?;
                let mut previous = cache.stream.with(|stream| stream.replace_source(reopened));
                cache.mode = OpenMode::Write;
                previous.close()?;
                debug!(stream_id = %id, "Reopened local cache for writing");
            }
            return Ok(cache.stream.clone());
        }

        let mode = if writable { OpenMode::Write } else { OpenMode::Read };
        let source = self.source.open(tag, id, mode)?;
        let stream = SharedStream::new(DeferredWriteStream::with_max_len(source, self.max_buffer_len));
        self.entries.entry(id).or_default().cache = Some(LocalCache {
            tag,
            mode,
            stream: stream.clone(),
        });
        trace!(stream_id = %id, owner = %tag, ?mode, "Created local cache");
        Ok(stream)
    }

    /// Local close: the cache and its source handle stay resident.
    ///
    /// # Errors
    ///
    /// Never fails; the signature matches [`StreamManager::close`].
    pub fn close(&mut self, tag: OwnerTag, id: StreamId) -> Result<()> {
        trace!(stream_id = %id, owner = %tag, "Local close keeps cache resident");
        Ok(())
    }

    /// Pushes buffered writes of `id` to the source.
    ///
    /// # Errors
    ///
    /// Returns the error of the source write.
    pub fn flush(&mut self, id: StreamId) -> Result<()> {
        let Some(cache) = self.cache(id) else {
            return Ok(());
        };
        let modified = cache.is_modified();
        cache.stream.flush()?;
        if modified {
            debug!(stream_id = %id, "Flushed local cache");
        }
        Ok(())
    }

    /// Flushes every resident cache.
    ///
    /// # Errors
    ///
    /// Returns the first error; every cache is flushed regardless.
    pub fn flush_all(&mut self) -> Result<()> {
        let ids: Vec<StreamId> = self.entries.keys().copied().collect();
        let mut first_error = None;
        for id in ids {
            if let Err(e) = self.flush(id) {
                warn!(stream_id = %id, error = %e, "Failed to flush local cache");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Flushes `id`, closes its source handle and drops the local entry.
    ///
    /// # Errors
    ///
    /// Returns the error of the final flush or close. The entry is dropped
    /// either way.
    pub fn release(&mut self, id: StreamId) -> Result<()> {
        let Some(entry) = self.entries.remove(&id) else {
            return Ok(());
        };
        if let Some(cache) = entry.cache {
            cache.stream.close()?;
            debug!(stream_id = %id, "Released local cache");
        }
        Ok(())
    }

    /// Flushes and closes every resident cache. Later calls are no-ops and
    /// further operations fail with [`BlobError::ManagerClosed`].
    ///
    /// # Errors
    ///
    /// Returns the first error; every cache is closed regardless.
    pub fn dispose(&mut self) -> Result<()> {
        if self.disposed {
            return Ok(());
        }
        self.disposed = true;

        let mut first_error = None;
        let mut closed = 0usize;
        for (id, entry) in self.entries.drain() {
            let Some(cache) = entry.cache else {
                continue;
            };
            closed += 1;
            if let Err(e) = cache.stream.close() {
                warn!(stream_id = %id, error = %e, "Failed to close local cache");
                first_error.get_or_insert(BlobError::from(e));
            }
        }
        debug!(closed, "Disposed local stream manager");
        first_error.map_or(Ok(()), Err)
    }
}

impl<M: StreamManager> Drop for LocalStreamManager<M> {
    fn drop(&mut self) {
        if let Err(e) = self.dispose() {
            warn!(error = %e, "Failed to dispose local stream manager");
        }
    }
}

impl<M: StreamManager> StreamManager for LocalStreamManager<M> {
    fn allocate(&mut self) -> Result<StreamId> {
        LocalStreamManager::allocate(self)
    }

    fn reference(&mut self, id: StreamId) -> Result<StreamId> {
        LocalStreamManager::reference(self, id)
    }

    fn deallocate(&mut self, id: StreamId) -> Result<()> {
        LocalStreamManager::deallocate(self, id)
    }

    fn open(&mut self, tag: OwnerTag, id: StreamId, mode: OpenMode) -> Result<Box<dyn BlobStream>> {
        LocalStreamManager::open(self, tag, id, mode)
    }

    fn close(&mut self, tag: OwnerTag, id: StreamId) -> Result<()> {
        LocalStreamManager::close(self, tag, id)
    }
}
