//! Configuration for the stream managers.

use std::path::{Path, PathBuf};

use crate::error::BlobError;

/// Default chunk size used when copying stream contents (64 KiB).
pub const DEFAULT_COPY_CHUNK_SIZE: usize = 64 * 1024;

/// Default upper bound for private in-memory buffers.
pub const DEFAULT_MAX_BUFFER_LEN: u64 = i32::MAX as u64;

/// Configuration for a [`CentralStreamManager`](crate::CentralStreamManager)
/// and the views it hands out.
#[derive(Debug, Clone)]
pub struct StreamManagerConfig {
    /// Chunk size for copy-on-write splits, dirty references and flushes.
    pub copy_chunk_size: usize,
    /// Largest private buffer a copy-on-write or deferred-write view may hold.
    pub max_buffer_len: u64,
    /// Directory for file-backed streams (`None` = in-memory provider).
    pub storage_dir: Option<PathBuf>,
    /// Fsync stream files when the file provider closes them.
    pub sync_on_close: bool,
}

impl Default for StreamManagerConfig {
    fn default() -> Self {
        Self {
            copy_chunk_size: DEFAULT_COPY_CHUNK_SIZE,
            max_buffer_len: DEFAULT_MAX_BUFFER_LEN,
            storage_dir: None,
            sync_on_close: false,
        }
    }
}

impl StreamManagerConfig {
    /// Creates a configuration backed by the in-memory provider.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Creates a configuration backed by files under `dir`.
    #[must_use]
    pub fn file_backed(dir: &Path) -> Self {
        Self::default().with_storage_dir(dir)
    }

    /// Sets the copy chunk size.
    #[must_use]
    pub fn with_copy_chunk_size(mut self, size: usize) -> Self {
        self.copy_chunk_size = size;
        self
    }

    /// Sets the maximum private buffer length.
    #[must_use]
    pub fn with_max_buffer_len(mut self, len: u64) -> Self {
        self.max_buffer_len = len;
        self
    }

    /// Sets the storage directory for file-backed streams.
    #[must_use]
    pub fn with_storage_dir(mut self, dir: &Path) -> Self {
        self.storage_dir = Some(dir.to_path_buf());
        self
    }

    /// Enables or disables fsync on close.
    #[must_use]
    pub fn with_sync_on_close(mut self, enabled: bool) -> Self {
        self.sync_on_close = enabled;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`BlobError::InvalidArgument`] if a size is zero.
    pub fn validate(&self) -> Result<(), BlobError> {
        if self.copy_chunk_size == 0 {
            return Err(BlobError::InvalidArgument(
                "copy_chunk_size must be > 0".to_string(),
            ));
        }
        if self.max_buffer_len == 0 {
            return Err(BlobError::InvalidArgument(
                "max_buffer_len must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = StreamManagerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.copy_chunk_size, DEFAULT_COPY_CHUNK_SIZE);
        assert!(config.storage_dir.is_none());
    }

    #[test]
    fn test_builders() {
        let config = StreamManagerConfig::file_backed(Path::new("/tmp/blobs"))
            .with_copy_chunk_size(16)
            .with_max_buffer_len(1024)
            .with_sync_on_close(true);

        assert_eq!(config.storage_dir.as_deref(), Some(Path::new("/tmp/blobs")));
        assert_eq!(config.copy_chunk_size, 16);
        assert_eq!(config.max_buffer_len, 1024);
        assert!(config.sync_on_close);
    }

    #[test]
    fn test_validate_rejects_zero_sizes() {
        let config = StreamManagerConfig::default().with_copy_chunk_size(0);
        assert!(matches!(
            config.validate(),
            Err(BlobError::InvalidArgument(_))
        ));

        let config = StreamManagerConfig::default().with_max_buffer_len(0);
        assert!(config.validate().is_err());
    }
}
