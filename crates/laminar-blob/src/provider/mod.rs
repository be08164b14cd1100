//! # Physical stream providers
//!
//! A provider owns the bytes behind stream identities. The central manager is
//! its only caller and serializes all operations on any one identity, so a
//! provider only has to cope with concurrent calls on *distinct* identities.
//!
//! ## Backends
//!
//! - **[`MemoryStreamProvider`]**: one growable buffer per identity; `destroy`
//!   drops it.
//! - **[`FileStreamProvider`]**: one file per identity, named by the decimal
//!   identity, in a private directory; `destroy` deletes the file.
//!
//! Storage is materialized lazily: `open` creates empty storage for an
//! identity that has none, while `destroy` and `reassign` of never-opened
//! identities succeed without doing anything.

use crate::identity::StreamId;
use crate::stream::BlobStream;
use crate::Result;

mod file;
mod memory;

pub use file::{FileStream, FileStreamProvider};
pub use memory::{MemoryStream, MemoryStreamProvider};

/// Pluggable backing store keyed by stream identity.
pub trait StreamProvider: Send + Sync {
    /// Short backend name for logs.
    fn kind(&self) -> &'static str;

    /// Opens the storage of `id`, creating it empty if absent.
    ///
    /// # Errors
    ///
    /// Returns [`BlobError::Storage`](crate::BlobError::Storage) if the store
    /// cannot be opened, or [`BlobError::StreamInUse`](crate::BlobError::StreamInUse)
    /// if the backend only allows one open at a time and `id` is already open.
    fn open(&self, id: StreamId) -> Result<Box<dyn BlobStream>>;

    /// Releases per-open resources of `id`. The data is kept.
    ///
    /// # Errors
    ///
    /// Returns [`BlobError::Storage`](crate::BlobError::Storage) on failure.
    fn close(&self, id: StreamId) -> Result<()>;

    /// Permanently removes the storage of `id`.
    ///
    /// # Errors
    ///
    /// Returns [`BlobError::Storage`](crate::BlobError::Storage) on failure.
    fn destroy(&self, id: StreamId) -> Result<()>;

    /// Moves the storage of `old` to key `new` without copying bytes.
    ///
    /// On error nothing has moved.
    ///
    /// # Errors
    ///
    /// Returns [`BlobError::Storage`](crate::BlobError::Storage) on failure.
    fn reassign(&self, old: StreamId, new: StreamId) -> Result<()>;
}
