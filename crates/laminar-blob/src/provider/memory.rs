//! In-memory stream provider.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use bytes::Bytes;
use fxhash::FxHashMap;
use parking_lot::Mutex;

use super::StreamProvider;
use crate::identity::StreamId;
use crate::stream::{read_from_slice, seek_position, to_usize, write_into_vec, BlobStream};
use crate::Result;

type Buffer = Arc<Mutex<Vec<u8>>>;

/// Keeps one buffer per identity. Nothing survives the process.
#[derive(Default)]
pub struct MemoryStreamProvider {
    buffers: Mutex<FxHashMap<StreamId, Buffer>>,
}

impl MemoryStreamProvider {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the bytes stored for `id`.
    #[must_use]
    pub fn contents(&self, id: StreamId) -> Option<Bytes> {
        let buffer = self.buffers.lock().get(&id).cloned()?;
        let data = buffer.lock();
        Some(Bytes::copy_from_slice(&data))
    }

    /// Returns `true` if storage exists for `id`.
    #[must_use]
    pub fn contains(&self, id: StreamId) -> bool {
        self.buffers.lock().contains_key(&id)
    }

    /// Number of identities with storage.
    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.buffers.lock().len()
    }
}

impl StreamProvider for MemoryStreamProvider {
    fn kind(&self) -> &'static str {
        "memory"
    }

    fn open(&self, id: StreamId) -> Result<Box<dyn BlobStream>> {
        let data = Arc::clone(self.buffers.lock().entry(id).or_default());
        Ok(Box::new(MemoryStream { data, pos: 0 }))
    }

    fn close(&self, _id: StreamId) -> Result<()> {
        Ok(())
    }

    fn destroy(&self, id: StreamId) -> Result<()> {
        self.buffers.lock().remove(&id);
        Ok(())
    }

    fn reassign(&self, old: StreamId, new: StreamId) -> Result<()> {
        if old == new {
            return Ok(());
        }
        let mut buffers = self.buffers.lock();
        if let Some(buffer) = buffers.remove(&old) {
            buffers.insert(new, buffer);
        }
        Ok(())
    }
}

/// Stream over a provider buffer. Several opens of one identity share bytes.
pub struct MemoryStream {
    data: Buffer,
    pos: u64,
}

impl Read for MemoryStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = read_from_slice(&self.data.lock(), self.pos, buf);
        self.pos += n as u64;
        Ok(n)
    }
}

impl Write for MemoryStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = write_into_vec(&mut self.data.lock(), self.pos, buf)?;
        self.pos += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for MemoryStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let len = self.data.lock().len() as u64;
        self.pos = seek_position(self.pos, len, pos)?;
        Ok(self.pos)
    }
}

impl BlobStream for MemoryStream {
    fn len(&self) -> io::Result<u64> {
        Ok(self.data.lock().len() as u64)
    }

    fn set_len(&mut self, len: u64) -> io::Result<()> {
        let len = to_usize(len)?;
        self.data.lock().resize(len, 0);
        Ok(())
    }
}
