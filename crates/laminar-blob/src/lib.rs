//! # `LaminarDB` BLOB Streams
//!
//! Large-object storage beneath row storage: values too large to live inline
//! are spilled into independently addressable byte streams.
//!
//! ## Layers
//!
//! - [`StreamProvider`]: physical byte stores keyed by [`StreamId`], in memory
//!   or one file per stream.
//! - [`stream`]: the [`BlobStream`] capability trait and composable views
//!   (window, copy-on-first-write, deferred write).
//! - [`CentralStreamManager`]: identity assignment, reference-counted aliasing
//!   with copy-on-write, open/close bookkeeping.
//! - [`LocalStreamManager`]: a per-consumer cache that buffers writes until
//!   flush or release.
//!
//! The layer only moves bytes; it never interprets them.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

/// Manager configuration - chunk sizes, buffer limits, storage directory
pub mod config;

/// Error types - `BlobError` and its `std::io` conversions
pub mod error;

/// Stream identities - `StreamId` and `OwnerTag`
pub mod identity;

/// Stream managers - central authority and local caching tier
pub mod manager;

/// Physical providers - in-memory and file-backed stores
pub mod provider;

/// Stream capability trait and view decorators
pub mod stream;

// Re-export key types
pub use config::StreamManagerConfig;
pub use error::BlobError;
pub use identity::{OwnerTag, StreamId};
pub use manager::{
    CentralStreamManager, LocalStreamManager, ManagedStream, OpenMode, StreamManager,
};
pub use provider::{FileStreamProvider, MemoryStreamProvider, StreamProvider};
pub use stream::{BlobStream, BlobStreamExt};

/// Result type for BLOB stream operations.
pub type Result<T> = std::result::Result<T, BlobError>;
