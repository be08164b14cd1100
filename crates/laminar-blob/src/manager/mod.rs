//! # Stream managers
//!
//! Managers own the lifecycle of stream identities: allocation, aliasing,
//! deallocation and open/close bracketing of I/O.
//!
//! ## Tiers
//!
//! - [`CentralStreamManager`]: process-wide authority over the header table.
//!   References share bytes until one side mutates, at which point the writer
//!   is split off with a private copy.
//! - [`LocalStreamManager`]: a single-consumer cache over any other manager.
//!   Writes are buffered per stream and pushed upstream on flush or release.
//!
//! Both implement [`StreamManager`], so a local manager can wrap another
//! local manager.
//!
//! ## Open handles
//!
//! Every successful `open` must be balanced by exactly one close: either
//! [`BlobStream::close`] on the returned stream (also run when it is dropped)
//! or [`StreamManager::close`] with the same tag and identity.

use serde::{Deserialize, Serialize};

use crate::identity::{OwnerTag, StreamId};
use crate::stream::BlobStream;
use crate::Result;

mod central;
mod handle;
mod local;
mod table;

pub use central::CentralStreamManager;
pub use handle::ManagedStream;
pub use local::LocalStreamManager;
pub use table::{HeaderTable, Moved, Removal, Split};

/// Access requested when opening a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpenMode {
    /// Reads only; writes fail with [`BlobError::ReadOnly`](crate::BlobError::ReadOnly).
    Read,
    /// Reads and writes. The first write to shared bytes splits the stream
    /// off with a private copy.
    Write,
    /// Reads the stored bytes; writes go to a private snapshot that is
    /// discarded on close.
    Private,
}

impl OpenMode {
    /// Returns `true` if writes through this mode reach the stream.
    #[must_use]
    pub fn is_writable(self) -> bool {
        matches!(self, Self::Write)
    }
}

/// Lifecycle contract shared by the manager tiers.
pub trait StreamManager: Send {
    /// Creates a new empty stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the manager is closed or storage fails.
    fn allocate(&mut self) -> Result<StreamId>;

    /// Creates a new identity sharing the bytes of `id`.
    ///
    /// # Errors
    ///
    /// Returns [`BlobError::StreamNotFound`](crate::BlobError::StreamNotFound)
    /// if `id` is not live.
    fn reference(&mut self, id: StreamId) -> Result<StreamId>;

    /// Removes `id`. Aliases of `id` keep reading its bytes.
    ///
    /// # Errors
    ///
    /// Returns [`BlobError::StreamInUse`](crate::BlobError::StreamInUse) if
    /// `id` is open, or a storage error if destroying or moving storage fails.
    fn deallocate(&mut self, id: StreamId) -> Result<()>;

    /// Opens `id` on behalf of `tag`.
    ///
    /// # Errors
    ///
    /// Returns [`BlobError::StreamNotFound`](crate::BlobError::StreamNotFound)
    /// if `id` is not live, or a storage error if it cannot be opened.
    fn open(&mut self, tag: OwnerTag, id: StreamId, mode: OpenMode) -> Result<Box<dyn BlobStream>>;

    /// Releases one open of `id` made by `tag`.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the physical stream fails to close.
    fn close(&mut self, tag: OwnerTag, id: StreamId) -> Result<()>;
}

/// Lets a local manager wrap a boxed source of either tier.
impl<M: StreamManager + ?Sized> StreamManager for Box<M> {
    fn allocate(&mut self) -> Result<StreamId> {
        (**self).allocate()
    }

    fn reference(&mut self, id: StreamId) -> Result<StreamId> {
        (**self).reference(id)
    }

    fn deallocate(&mut self, id: StreamId) -> Result<()> {
        (**self).deallocate(id)
    }

    fn open(&mut self, tag: OwnerTag, id: StreamId, mode: OpenMode) -> Result<Box<dyn BlobStream>> {
        (**self).open(tag, id, mode)
    }

    fn close(&mut self, tag: OwnerTag, id: StreamId) -> Result<()> {
        (**self).close(tag, id)
    }
}
