//! Process-wide stream manager.
//!
//! ## Locking
//!
//! All structural operations (identity assignment, alias edits, open/close
//! counting, copy-on-write splits) run under one manager-wide mutex. Raw I/O
//! on an open handle only takes the lock of the stream it touches, plus the
//! manager lock once when its first write hits shared bytes.
//!
//! ## Bindings
//!
//! While an identity is open its header holds a *binding*: a shared stream
//! every handle of that identity reads through. A root's binding wraps the
//! physical stream from its provider. An alias's binding wraps a cursor over
//! its owner's binding, so opening an alias holds every link above it open.
//! Copy-on-write swaps the content of a binding in place, which re-points
//! every open handle at once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use fxhash::FxHashMap;
use parking_lot::{Mutex, MutexGuard};
use smallvec::SmallVec;
use tracing::{debug, info, trace, warn};

use super::handle::ManagedStream;
use super::table::{HeaderTable, Moved, Removal, Split};
use super::{OpenMode, StreamManager};
use crate::config::StreamManagerConfig;
use crate::error::BlobError;
use crate::identity::{OwnerTag, StreamId};
use crate::provider::{FileStreamProvider, MemoryStreamProvider, StreamProvider};
use crate::stream::{BlobStream, CopyOnWriteStream, SharedCursor, SharedStream};
use crate::Result;

/// Per-identity state kept in the header table.
struct Slot {
    provider: Arc<dyn StreamProvider>,
    open_count: u32,
    binding: Option<SharedStream>,
    exclusive: Arc<AtomicBool>,
    /// Storage has never been opened since allocation; whatever the provider
    /// holds under this identity is left over and gets truncated.
    fresh: bool,
}

impl Slot {
    fn new(provider: Arc<dyn StreamProvider>) -> Self {
        Self {
            provider,
            open_count: 0,
            binding: None,
            exclusive: Arc::new(AtomicBool::new(false)),
            fresh: false,
        }
    }

    fn allocated(provider: Arc<dyn StreamProvider>) -> Self {
        Self {
            fresh: true,
            ..Self::new(provider)
        }
    }
}

/// One open held by a session. Revoking it fails further I/O on the handle.
struct Ticket {
    id: u64,
    revoked: Arc<AtomicBool>,
}

impl Ticket {
    fn revoke(&self) {
        self.revoked.store(true, Ordering::Release);
    }
}

type Tickets = SmallVec<[Ticket; 2]>;

struct State {
    table: HeaderTable<Slot>,
    sessions: FxHashMap<OwnerTag, FxHashMap<StreamId, Tickets>>,
    next_ticket: u64,
}

impl State {
    /// Adds one open to `id`, materializing bindings up the alias chain.
    fn acquire(&mut self, id: StreamId) -> Result<SharedStream> {
        let slot = self.table.payload_mut(id)?;
        if let Some(binding) = &slot.binding {
            slot.open_count += 1;
            return Ok(binding.clone());
        }

        let stream: Box<dyn BlobStream> = match self.table.owner_of(id) {
            Some(owner) => Box::new(SharedCursor::new(self.acquire(owner)?)),
            None => {
                let slot = self.table.payload_mut(id)?;
                let mut stream = slot.provider.open(id)?;
                if slot.fresh {
                    if let Err(e) = stream.set_len(0) {
                        drop(stream);
                        if let Err(close) = slot.provider.close(id) {
                            warn!(stream_id = %id, error = %close, "Failed to close stream");
                        }
                        return Err(e.into());
                    }
                    slot.fresh = false;
                }
                stream
            }
        };

        let binding = SharedStream::new(stream);
        let slot = self.table.payload_mut(id)?;
        slot.binding = Some(binding.clone());
        slot.open_count = 1;
        Ok(binding)
    }

    /// Drops one open of `id`. The last one closes the physical stream, or
    /// releases the owner for an alias.
    fn release(&mut self, id: StreamId) -> Result<()> {
        let slot = self.table.payload_mut(id)?;
        slot.open_count = slot.open_count.saturating_sub(1);
        if slot.open_count > 0 {
            return Ok(());
        }
        let Some(binding) = slot.binding.take() else {
            return Ok(());
        };
        let provider = Arc::clone(&slot.provider);

        match self.table.owner_of(id) {
            Some(owner) => {
                drop(binding);
                self.release(owner)
            }
            None => {
                let closed = binding.close().map_err(BlobError::from);
                drop(binding);
                let released = provider.close(id);
                trace!(stream_id = %id, "Closed physical stream");
                closed.and(released)
            }
        }
    }

    fn register(&mut self, tag: OwnerTag, id: StreamId) -> (u64, Arc<AtomicBool>) {
        self.next_ticket += 1;
        let ticket = Ticket {
            id: self.next_ticket,
            revoked: Arc::new(AtomicBool::new(false)),
        };
        let issued = (ticket.id, Arc::clone(&ticket.revoked));
        self.sessions
            .entry(tag)
            .or_default()
            .entry(id)
            .or_default()
            .push(ticket);
        issued
    }

    /// Removes `ticket` (or any ticket when `None`) held by `tag` on `id`.
    fn take_ticket(&mut self, tag: OwnerTag, id: StreamId, ticket: Option<u64>) -> bool {
        let Some(streams) = self.sessions.get_mut(&tag) else {
            return false;
        };
        let Some(tickets) = streams.get_mut(&id) else {
            return false;
        };
        let found = match ticket {
            Some(ticket) => tickets
                .iter()
                .position(|held| held.id == ticket)
                .map(|index| tickets.swap_remove(index)),
            None => tickets.pop(),
        };
        if let Some(ticket) = &found {
            ticket.revoke();
        }
        if tickets.is_empty() {
            streams.remove(&id);
        }
        if streams.is_empty() {
            self.sessions.remove(&tag);
        }
        found.is_some()
    }

    /// Points every open alias in `moved` at `to`, dropping the hold it had
    /// on `from`.
    fn rebind(&mut self, moved: &[StreamId], to: StreamId, from: StreamId) -> Result<()> {
        for &alias in moved {
            let Some(binding) = self.table.payload(alias)?.binding.clone() else {
                continue;
            };
            let upstream = self.acquire(to)?;
            drop(binding.replace(Box::new(SharedCursor::new(upstream))));
            self.release(from)?;
        }
        Ok(())
    }

    fn refresh(&self, ids: impl IntoIterator<Item = StreamId>) {
        for id in ids {
            if let Ok(slot) = self.table.payload(id) {
                slot.exclusive
                    .store(self.table.is_exclusive(id), Ordering::Release);
            }
        }
    }

    fn open_binding(&self, id: StreamId) -> Result<SharedStream> {
        self.table.payload(id)?.binding.clone().ok_or_else(|| {
            BlobError::InvalidArgument(format!("stream {id} is not open"))
        })
    }
}

pub(super) struct Central {
    state: Mutex<State>,
    provider: Arc<dyn StreamProvider>,
    config: StreamManagerConfig,
    shut_down: AtomicBool,
}

impl Central {
    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        let state = self.state.lock();
        self.check_open()?;
        Ok(state)
    }

    pub(super) fn check_open(&self) -> Result<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(BlobError::ManagerClosed);
        }
        Ok(())
    }

    /// Releases one open of `id` by `tag`. Unknown opens are ignored.
    pub(super) fn close(&self, tag: OwnerTag, id: StreamId, ticket: Option<u64>) -> Result<()> {
        let mut state = self.state.lock();
        if !state.take_ticket(tag, id, ticket) {
            trace!(stream_id = %id, owner = %tag, "Close of a stream that is not open");
            return Ok(());
        }
        state.release(id)
    }

    /// Separates `id` from every identity sharing its bytes before a write.
    pub(super) fn change(&self, id: StreamId) -> Result<()> {
        let mut state = self.lock()?;
        if state.table.is_exclusive(id) {
            state.refresh([id]);
            return Ok(());
        }
        match state.table.owner_of(id) {
            Some(owner) => self.split_alias(&mut state, id, owner),
            None => self.split_owner(&mut state, id),
        }
    }

    /// Copies the bytes `binding` currently reads into fresh default storage
    /// under `target`.
    fn copy_into_fresh(
        &self,
        binding: &SharedStream,
        target: StreamId,
    ) -> Result<Box<dyn BlobStream>> {
        let mut fresh = self.provider.open(target)?;
        let copied = fresh
            .set_len(0)
            .and_then(|()| binding.copy_to(&mut fresh, self.config.copy_chunk_size))
            .and_then(|_| fresh.flush());
        if let Err(e) = copied {
            drop(fresh);
            self.discard_storage(target);
            return Err(e.into());
        }
        Ok(fresh)
    }

    fn discard_storage(&self, id: StreamId) {
        let result = self.provider.close(id).and_then(|()| self.provider.destroy(id));
        if let Err(e) = result {
            warn!(stream_id = %id, error = %e, "Failed to discard partial copy");
        }
    }

    /// A writing alias gets a private copy under its own identity; its own
    /// aliases keep reading the former owner.
    fn split_alias(&self, state: &mut State, id: StreamId, owner: StreamId) -> Result<()> {
        let binding = state.open_binding(id)?;
        let fresh = self.copy_into_fresh(&binding, id)?;
        drop(binding.replace(fresh));
        state.table.payload_mut(id)?.provider = Arc::clone(&self.provider);

        let Split::Alias {
            former_owner,
            moved,
        } = state.table.split(id)?
        else {
            return Ok(());
        };
        state.rebind(&moved, former_owner, id)?;
        state.release(former_owner)?;
        state.refresh(moved.iter().copied().chain([id, former_owner]));

        debug!(
            stream_id = %id,
            owner = %owner,
            aliases = moved.len(),
            "Split alias on write"
        );
        Ok(())
    }

    /// A writing owner keeps its storage; the lowest alias becomes the owner
    /// of a copy of the original bytes and adopts the other aliases.
    fn split_owner(&self, state: &mut State, id: StreamId) -> Result<()> {
        let Some(successor) = state.table.promotion_target(id) else {
            return Ok(());
        };
        let binding = state.open_binding(id)?;
        let mut fresh = self.copy_into_fresh(&binding, successor)?;

        let held = state.table.payload(successor)?.binding.clone();
        match &held {
            Some(successor_binding) => drop(successor_binding.replace(fresh)),
            None => {
                let closed = fresh.close().map_err(BlobError::from);
                drop(fresh);
                if let Err(e) = closed.and_then(|()| self.provider.close(successor)) {
                    self.discard_storage(successor);
                    return Err(e);
                }
            }
        }
        state.table.payload_mut(successor)?.provider = Arc::clone(&self.provider);

        let moved = match state.table.split(id)? {
            Split::Owner { moved, .. } => moved,
            Split::Alias { .. } | Split::Exclusive => Moved::new(),
        };
        state.rebind(&moved, successor, id)?;
        if held.is_some() {
            state.release(id)?;
        }
        state.refresh(moved.iter().copied().chain([id, successor]));

        debug!(
            stream_id = %id,
            promoted = %successor,
            aliases = moved.len(),
            "Split owner on write"
        );
        Ok(())
    }
}

/// Process-wide authority over stream identities.
///
/// Cloning is cheap; clones share the same header table.
///
/// # Example
///
/// ```rust
/// use std::io::Write;
/// use laminar_blob::{
///     BlobStream, BlobStreamExt, CentralStreamManager, OpenMode, OwnerTag, StreamManagerConfig,
/// };
///
/// let manager = CentralStreamManager::new(StreamManagerConfig::in_memory()).unwrap();
/// let tag = OwnerTag(1);
///
/// let a = manager.allocate().unwrap();
/// let mut stream = manager.open(tag, a, OpenMode::Write).unwrap();
/// stream.write_all(b"shared").unwrap();
/// stream.close().unwrap();
///
/// // `b` shares the bytes of `a` until one of them writes.
/// let b = manager.reference(a).unwrap();
/// let mut stream = manager.open(tag, b, OpenMode::Read).unwrap();
/// assert_eq!(stream.read_all().unwrap().as_ref(), b"shared");
/// ```
#[derive(Clone)]
pub struct CentralStreamManager {
    inner: Arc<Central>,
}

impl CentralStreamManager {
    /// Creates a manager whose default provider follows `config.storage_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`BlobError::InvalidArgument`] for an invalid configuration or
    /// [`BlobError::Storage`] if the storage directory cannot be created.
    pub fn new(config: StreamManagerConfig) -> Result<Self> {
        config.validate()?;
        let provider: Arc<dyn StreamProvider> = match &config.storage_dir {
            Some(dir) => Arc::new(
                FileStreamProvider::new(dir.clone())?.with_sync_on_close(config.sync_on_close),
            ),
            None => Arc::new(MemoryStreamProvider::new()),
        };
        Self::with_provider(config, provider)
    }

    /// Creates a manager with an explicit default provider.
    ///
    /// # Errors
    ///
    /// Returns [`BlobError::InvalidArgument`] for an invalid configuration.
    pub fn with_provider(
        config: StreamManagerConfig,
        provider: Arc<dyn StreamProvider>,
    ) -> Result<Self> {
        config.validate()?;
        info!(provider = provider.kind(), "Created central stream manager");
        Ok(Self {
            inner: Arc::new(Central {
                state: Mutex::new(State {
                    table: HeaderTable::new(),
                    sessions: FxHashMap::default(),
                    next_ticket: 0,
                }),
                provider,
                config,
                shut_down: AtomicBool::new(false),
            }),
        })
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &StreamManagerConfig {
        &self.inner.config
    }

    /// Returns the default provider.
    #[must_use]
    pub fn provider(&self) -> &Arc<dyn StreamProvider> {
        &self.inner.provider
    }

    /// Allocates a new empty stream in the default provider.
    ///
    /// # Errors
    ///
    /// Returns [`BlobError::ManagerClosed`] after [`shutdown`](Self::shutdown).
    pub fn allocate(&self) -> Result<StreamId> {
        self.allocate_in(Arc::clone(&self.inner.provider))
    }

    /// Allocates a new empty stream whose storage lives in `provider`.
    ///
    /// # Errors
    ///
    /// Returns [`BlobError::ManagerClosed`] after [`shutdown`](Self::shutdown).
    pub fn allocate_in(&self, provider: Arc<dyn StreamProvider>) -> Result<StreamId> {
        let mut state = self.inner.lock()?;
        let kind = provider.kind();
        let id = state.table.insert_owned(Slot::allocated(provider))?;
        state.refresh([id]);
        debug!(stream_id = %id, provider = kind, "Allocated stream");
        Ok(id)
    }

    /// Creates a new identity sharing the bytes of `id`. No bytes are copied.
    ///
    /// # Errors
    ///
    /// Returns [`BlobError::StreamNotFound`] if `id` is not live.
    pub fn reference(&self, id: StreamId) -> Result<StreamId> {
        let mut state = self.inner.lock()?;
        let provider = Arc::clone(&state.table.payload(id)?.provider);
        let alias = state.table.insert_alias(id, Slot::new(provider))?;
        state.refresh([id, alias]);
        debug!(stream_id = %alias, owner = %id, "Referenced stream");
        Ok(alias)
    }

    /// Removes `id`.
    ///
    /// An alias is unlinked from its owner. A root with aliases hands its
    /// storage to the lowest alias; the provider moves the storage before any
    /// table changes, so a failed move leaves everything as it was. A root
    /// without aliases has its storage destroyed.
    ///
    /// # Errors
    ///
    /// Returns [`BlobError::StreamNotFound`] if `id` is not live,
    /// [`BlobError::StreamInUse`] if `id` or an alias reading through it is
    /// open, or a storage error from the provider.
    pub fn deallocate(&self, id: StreamId) -> Result<()> {
        let mut state = self.inner.lock()?;
        let slot = state.table.payload(id)?;
        if slot.open_count > 0 {
            return Err(BlobError::StreamInUse {
                id,
                open_count: slot.open_count,
            });
        }
        let provider = Arc::clone(&slot.provider);

        if state.table.owner_of(id).is_none() {
            match state.table.promotion_target(id) {
                Some(promoted) => provider.reassign(id, promoted)?,
                None => provider.destroy(id)?,
            }
        }

        match state.table.remove(id)? {
            Removal::Alias { owner, moved, .. } => {
                state.refresh(moved.iter().copied().chain([owner]));
                debug!(stream_id = %id, owner = %owner, "Deallocated alias");
            }
            Removal::Promoted {
                payload,
                promoted,
                moved,
            } => {
                let slot = state.table.payload_mut(promoted)?;
                slot.provider = payload.provider;
                slot.fresh = payload.fresh;
                state.refresh(moved.iter().copied().chain([promoted]));
                debug!(
                    stream_id = %id,
                    promoted = %promoted,
                    aliases = moved.len(),
                    "Deallocated owner, promoted alias"
                );
            }
            Removal::Root { .. } => {
                debug!(stream_id = %id, "Deallocated stream");
            }
        }
        Ok(())
    }

    /// Opens `id` for `tag` and returns the handle as a boxed stream.
    ///
    /// [`OpenMode::Private`] wraps a read handle in a copy-on-write view
    /// bounded by `max_buffer_len`.
    ///
    /// # Errors
    ///
    /// Returns [`BlobError::StreamNotFound`] if `id` is not live, or a storage
    /// error if the physical stream cannot be opened.
    pub fn open(&self, tag: OwnerTag, id: StreamId, mode: OpenMode) -> Result<Box<dyn BlobStream>> {
        let handle = self.open_handle(tag, id, mode)?;
        Ok(match mode {
            OpenMode::Private => Box::new(CopyOnWriteStream::with_max_len(
                handle,
                self.inner.config.max_buffer_len,
            )),
            OpenMode::Read | OpenMode::Write => Box::new(handle),
        })
    }

    /// Opens `id` for `tag` and returns the concrete handle.
    ///
    /// A handle opened with [`OpenMode::Private`] is read-only; use
    /// [`open`](Self::open) for the private-copy view.
    ///
    /// # Errors
    ///
    /// Same as [`open`](Self::open).
    pub fn open_handle(&self, tag: OwnerTag, id: StreamId, mode: OpenMode) -> Result<ManagedStream> {
        let mut state = self.inner.lock()?;
        let shared = state.acquire(id)?;
        let exclusive = Arc::clone(&state.table.payload(id)?.exclusive);
        let (ticket, revoked) = state.register(tag, id);
        trace!(stream_id = %id, owner = %tag, ?mode, "Opened stream");
        drop(state);

        Ok(ManagedStream::new(
            Arc::clone(&self.inner),
            tag,
            id,
            mode,
            ticket,
            revoked,
            SharedCursor::new(shared),
            exclusive,
        ))
    }

    /// Releases one open of `id` made by `tag`. The handle of that open fails
    /// further I/O.
    ///
    /// Closing a stream that `tag` does not have open is a no-op.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the physical stream fails to close.
    pub fn close(&self, tag: OwnerTag, id: StreamId) -> Result<()> {
        self.inner.close(tag, id, None)
    }

    /// Releases every open made by `tag`. Their handles fail further I/O.
    ///
    /// # Errors
    ///
    /// Returns the first storage error; every open is released regardless.
    pub fn close_owner(&self, tag: OwnerTag) -> Result<()> {
        let mut state = self.inner.state.lock();
        let Some(streams) = state.sessions.remove(&tag) else {
            return Ok(());
        };

        let mut first_error = None;
        let mut released = 0usize;
        for (id, tickets) in streams {
            for ticket in &tickets {
                ticket.revoke();
                released += 1;
                if let Err(e) = state.release(id) {
                    warn!(stream_id = %id, owner = %tag, error = %e, "Failed to release stream");
                    first_error.get_or_insert(e);
                }
            }
        }
        debug!(owner = %tag, released, "Closed owner streams");
        first_error.map_or(Ok(()), Err)
    }

    /// Closes every physical stream and rejects further structural calls.
    /// Calling it again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the first storage error; every stream is closed regardless.
    pub fn shutdown(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let sessions = std::mem::take(&mut state.sessions);
        for ticket in sessions.into_values().flat_map(FxHashMap::into_values).flatten() {
            ticket.revoke();
        }

        let open: Vec<(StreamId, bool)> = state
            .table
            .iter()
            .filter(|(_, slot)| slot.binding.is_some())
            .map(|(id, _)| (id, state.table.owner_of(id).is_none()))
            .collect();

        let mut first_error = None;
        for (id, is_root) in open {
            let slot = state.table.payload_mut(id)?;
            slot.open_count = 0;
            let binding = slot.binding.take();
            let provider = Arc::clone(&slot.provider);
            let Some(binding) = binding.filter(|_| is_root) else {
                continue;
            };
            let closed = binding.close().map_err(BlobError::from);
            let result = closed.and(provider.close(id));
            if let Err(e) = result {
                warn!(stream_id = %id, error = %e, "Failed to close stream during shutdown");
                first_error.get_or_insert(e);
            }
        }

        info!(streams = state.table.len(), "Central stream manager shut down");
        first_error.map_or(Ok(()), Err)
    }

    /// Returns `true` after [`shutdown`](Self::shutdown).
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }

    /// Returns `true` if `id` is live.
    #[must_use]
    pub fn contains(&self, id: StreamId) -> bool {
        self.inner.state.lock().table.contains(id)
    }

    /// Number of opens holding `id`, including aliases reading through it.
    ///
    /// # Errors
    ///
    /// Returns [`BlobError::StreamNotFound`] if `id` is not live.
    pub fn open_count(&self, id: StreamId) -> Result<u32> {
        Ok(self.inner.state.lock().table.payload(id)?.open_count)
    }

    /// Returns the identity `id` aliases, if any.
    #[must_use]
    pub fn owner_of(&self, id: StreamId) -> Option<StreamId> {
        self.inner.state.lock().table.owner_of(id)
    }

    /// Returns the identities aliasing `id`, in ascending order.
    #[must_use]
    pub fn references(&self, id: StreamId) -> Vec<StreamId> {
        self.inner.state.lock().table.references(id)
    }

    /// Number of live identities.
    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.inner.state.lock().table.len()
    }
}

impl StreamManager for CentralStreamManager {
    fn allocate(&mut self) -> Result<StreamId> {
        CentralStreamManager::allocate(self)
    }

    fn reference(&mut self, id: StreamId) -> Result<StreamId> {
        CentralStreamManager::reference(self, id)
    }

    fn deallocate(&mut self, id: StreamId) -> Result<()> {
        CentralStreamManager::deallocate(self, id)
    }

    fn open(&mut self, tag: OwnerTag, id: StreamId, mode: OpenMode) -> Result<Box<dyn BlobStream>> {
        CentralStreamManager::open(self, tag, id, mode)
    }

    fn close(&mut self, tag: OwnerTag, id: StreamId) -> Result<()> {
        CentralStreamManager::close(self, tag, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::BlobStreamExt;
    use std::io::{Read, Seek, SeekFrom, Write};

    const TAG: OwnerTag = OwnerTag(1);

    fn manager() -> (CentralStreamManager, Arc<MemoryStreamProvider>) {
        let provider = Arc::new(MemoryStreamProvider::new());
        let manager =
            CentralStreamManager::with_provider(StreamManagerConfig::default(), provider.clone())
                .unwrap();
        (manager, provider)
    }

    fn write(manager: &CentralStreamManager, id: StreamId, data: &[u8]) {
        let mut stream = manager.open(TAG, id, OpenMode::Write).unwrap();
        stream.replace_contents(data).unwrap();
        stream.close().unwrap();
    }

    fn read(manager: &CentralStreamManager, id: StreamId) -> Vec<u8> {
        let mut stream = manager.open(TAG, id, OpenMode::Read).unwrap();
        stream.read_all().unwrap().to_vec()
    }

    #[test]
    fn test_allocate_is_monotonic() {
        let (manager, _) = manager();
        let a = manager.allocate().unwrap();
        let b = manager.reference(a).unwrap();
        let c = manager.allocate().unwrap();
        assert!(!a.is_null());
        assert!(a < b && b < c);
        assert_eq!(manager.stream_count(), 3);
    }

    #[test]
    fn test_storage_is_lazy() {
        let (manager, provider) = manager();
        let a = manager.allocate().unwrap();
        assert!(!provider.contains(a));

        write(&manager, a, b"x");
        assert!(provider.contains(a));
    }

    #[test]
    fn test_reference_reads_owner_bytes() {
        let (manager, provider) = manager();
        let a = manager.allocate().unwrap();
        write(&manager, a, b"original");

        let b = manager.reference(a).unwrap();
        assert_eq!(manager.owner_of(b), Some(a));
        assert_eq!(manager.references(a), vec![b]);
        assert_eq!(read(&manager, b), b"original");
        // Reading an alias never materializes storage for it.
        assert!(!provider.contains(b));
    }

    #[test]
    fn test_alias_write_is_private() {
        let (manager, provider) = manager();
        let a = manager.allocate().unwrap();
        write(&manager, a, b"original");
        let b = manager.reference(a).unwrap();

        write(&manager, b, b"changed");
        assert_eq!(read(&manager, a), b"original");
        assert_eq!(read(&manager, b), b"changed");
        assert_eq!(manager.owner_of(b), None);
        assert_eq!(provider.contents(b).unwrap().as_ref(), b"changed");
    }

    #[test]
    fn test_owner_write_hands_bytes_to_lowest_alias() {
        let (manager, _) = manager();
        let a = manager.allocate().unwrap();
        write(&manager, a, b"v1");
        let b = manager.reference(a).unwrap();
        let c = manager.reference(a).unwrap();

        write(&manager, a, b"v2");
        assert_eq!(read(&manager, a), b"v2");
        assert_eq!(read(&manager, b), b"v1");
        assert_eq!(read(&manager, c), b"v1");
        assert_eq!(manager.owner_of(c), Some(b));
        assert!(manager.references(a).is_empty());
    }

    #[test]
    fn test_split_rebinds_open_aliases() {
        let (manager, _) = manager();
        let a = manager.allocate().unwrap();
        write(&manager, a, b"before");
        let b = manager.reference(a).unwrap();

        let mut reader = manager.open(TAG, b, OpenMode::Read).unwrap();
        let mut writer = manager.open(TAG, a, OpenMode::Write).unwrap();
        writer.replace_contents(b"after").unwrap();

        // The open alias keeps the bytes it had.
        assert_eq!(reader.read_all().unwrap().as_ref(), b"before");
        assert_eq!(writer.read_all().unwrap().as_ref(), b"after");

        reader.close().unwrap();
        writer.close().unwrap();
        assert_eq!(manager.open_count(a).unwrap(), 0);
        assert_eq!(manager.open_count(b).unwrap(), 0);
    }

    #[test]
    fn test_alias_chain_split_keeps_child_on_original() {
        let (manager, _) = manager();
        let a = manager.allocate().unwrap();
        write(&manager, a, b"root");
        let b = manager.reference(a).unwrap();
        let c = manager.reference(b).unwrap();

        let mut child = manager.open(TAG, c, OpenMode::Read).unwrap();
        write(&manager, b, b"middle");

        assert_eq!(manager.owner_of(c), Some(a));
        assert_eq!(child.read_all().unwrap().as_ref(), b"root");
        assert_eq!(read(&manager, b), b"middle");
        child.close().unwrap();
    }

    #[test]
    fn test_open_count_reaches_zero_on_last_close() {
        let (manager, _) = manager();
        let a = manager.allocate().unwrap();
        write(&manager, a, b"data");

        let mut first = manager.open(TAG, a, OpenMode::Read).unwrap();
        let mut second = manager.open(OwnerTag(2), a, OpenMode::Read).unwrap();
        assert_eq!(manager.open_count(a).unwrap(), 2);

        first.close().unwrap();
        assert_eq!(second.read_all().unwrap().as_ref(), b"data");
        second.close().unwrap();
        assert_eq!(manager.open_count(a).unwrap(), 0);
    }

    #[test]
    fn test_read_mode_rejects_writes() {
        let (manager, _) = manager();
        let a = manager.allocate().unwrap();
        let mut stream = manager.open(TAG, a, OpenMode::Read).unwrap();
        let err = BlobError::from(stream.write(b"no").unwrap_err());
        assert!(matches!(err, BlobError::ReadOnly(id) if id == a));
        assert!(stream.set_len(4).is_err());
    }

    #[test]
    fn test_private_mode_discards_changes() {
        let (manager, _) = manager();
        let a = manager.allocate().unwrap();
        write(&manager, a, b"stored");

        let mut private = manager.open(TAG, a, OpenMode::Private).unwrap();
        private.seek(SeekFrom::Start(0)).unwrap();
        private.write_all(b"SC").unwrap();
        assert_eq!(private.read_all().unwrap().as_ref(), b"SCored");
        private.close().unwrap();

        assert_eq!(read(&manager, a), b"stored");
    }

    #[test]
    fn test_deallocate_open_stream_fails() {
        let (manager, _) = manager();
        let a = manager.allocate().unwrap();
        let stream = manager.open(TAG, a, OpenMode::Read).unwrap();
        assert!(matches!(
            manager.deallocate(a),
            Err(BlobError::StreamInUse { open_count: 1, .. })
        ));
        drop(stream);
        manager.deallocate(a).unwrap();
        assert!(!manager.contains(a));
        assert!(matches!(
            manager.deallocate(a),
            Err(BlobError::StreamNotFound(_))
        ));
    }

    #[test]
    fn test_deallocate_promotes_alias() {
        let (manager, provider) = manager();
        let a = manager.allocate().unwrap();
        write(&manager, a, b"keep me");
        let b = manager.reference(a).unwrap();
        let c = manager.reference(a).unwrap();

        manager.deallocate(a).unwrap();
        assert!(!provider.contains(a));
        assert_eq!(provider.contents(b).unwrap().as_ref(), b"keep me");
        assert_eq!(manager.owner_of(b), None);
        assert_eq!(manager.owner_of(c), Some(b));
        assert_eq!(read(&manager, c), b"keep me");
    }

    #[test]
    fn test_deallocate_alias_leaves_owner() {
        let (manager, provider) = manager();
        let a = manager.allocate().unwrap();
        write(&manager, a, b"owner");
        let b = manager.reference(a).unwrap();

        manager.deallocate(b).unwrap();
        assert!(manager.references(a).is_empty());
        assert_eq!(provider.contents(a).unwrap().as_ref(), b"owner");
    }

    #[test]
    fn test_deallocate_destroys_storage() {
        let (manager, provider) = manager();
        let a = manager.allocate().unwrap();
        write(&manager, a, b"bye");
        manager.deallocate(a).unwrap();
        assert!(!provider.contains(a));
    }

    #[test]
    fn test_manager_close_releases_one_open() {
        let (manager, _) = manager();
        let a = manager.allocate().unwrap();
        let handle = manager.open_handle(TAG, a, OpenMode::Read).unwrap();

        manager.close(TAG, a).unwrap();
        assert_eq!(manager.open_count(a).unwrap(), 0);
        // The handle's own close is now a no-op.
        drop(handle);
        assert_eq!(manager.open_count(a).unwrap(), 0);
        // Unknown opens are ignored.
        manager.close(OwnerTag(7), a).unwrap();
    }

    #[test]
    fn test_close_owner_releases_session() {
        let (manager, _) = manager();
        let a = manager.allocate().unwrap();
        let b = manager.allocate().unwrap();
        let _h1 = manager.open_handle(TAG, a, OpenMode::Read).unwrap();
        let _h2 = manager.open_handle(TAG, a, OpenMode::Read).unwrap();
        let _h3 = manager.open_handle(TAG, b, OpenMode::Write).unwrap();
        let _other = manager.open_handle(OwnerTag(2), b, OpenMode::Read).unwrap();

        manager.close_owner(TAG).unwrap();
        assert_eq!(manager.open_count(a).unwrap(), 0);
        assert_eq!(manager.open_count(b).unwrap(), 1);
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let (manager, _) = manager();
        let a = manager.allocate().unwrap();
        let mut stream = manager.open(TAG, a, OpenMode::Write).unwrap();

        manager.shutdown().unwrap();
        manager.shutdown().unwrap();
        assert!(manager.is_shut_down());
        assert!(matches!(manager.allocate(), Err(BlobError::ManagerClosed)));
        assert!(stream.write(b"late").is_err());
        // Tearing down after shutdown is still safe.
        stream.close().unwrap();
        manager.close(TAG, a).unwrap();
    }

    #[test]
    fn test_allocate_in_custom_provider() {
        let (manager, default_provider) = manager();
        let custom = Arc::new(MemoryStreamProvider::new());
        let a = manager.allocate_in(custom.clone()).unwrap();
        write(&manager, a, b"custom");

        assert!(custom.contains(a));
        assert!(!default_provider.contains(a));

        // Promotion keeps the provider of the deallocated owner.
        let b = manager.reference(a).unwrap();
        manager.deallocate(a).unwrap();
        assert_eq!(custom.contents(b).unwrap().as_ref(), b"custom");
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = StreamManagerConfig::default().with_copy_chunk_size(0);
        assert!(CentralStreamManager::new(config).is_err());
    }

    #[test]
    fn test_copy_uses_small_chunks() {
        let provider = Arc::new(MemoryStreamProvider::new());
        let config = StreamManagerConfig::default().with_copy_chunk_size(3);
        let manager = CentralStreamManager::with_provider(config, provider).unwrap();

        let a = manager.allocate().unwrap();
        let payload: Vec<u8> = (0..=255u8).collect();
        write(&manager, a, &payload);
        let b = manager.reference(a).unwrap();

        let mut stream = manager.open(TAG, b, OpenMode::Write).unwrap();
        stream.seek(SeekFrom::End(0)).unwrap();
        stream.write_all(b"!").unwrap();
        stream.seek(SeekFrom::Start(0)).unwrap();
        let mut copy = Vec::new();
        stream.read_to_end(&mut copy).unwrap();
        assert_eq!(&copy[..256], payload.as_slice());
        assert_eq!(copy[256], b'!');
    }

    #[test]
    fn test_released_handle_rejects_io() {
        let (manager, provider) = manager();
        let a = manager.allocate().unwrap();
        write(&manager, a, b"kept");
        let mut handle = manager.open_handle(TAG, a, OpenMode::Write).unwrap();

        manager.close_owner(TAG).unwrap();
        assert!(handle.is_closed());
        manager.deallocate(a).unwrap();
        assert!(!provider.contains(a));

        assert!(handle.write(b"lost").is_err());
        assert!(handle.read(&mut [0u8; 4]).is_err());
        assert!(handle.set_len(0).is_err());
        handle.close().unwrap();
        assert!(!provider.contains(a));
    }

    #[test]
    fn test_manager_close_revokes_one_handle() {
        let (manager, _) = manager();
        let a = manager.allocate().unwrap();
        write(&manager, a, b"data");
        let mut handle = manager.open_handle(TAG, a, OpenMode::Read).unwrap();
        let mut other = manager.open_handle(OwnerTag(2), a, OpenMode::Read).unwrap();

        manager.close(TAG, a).unwrap();
        assert!(handle.read_all().is_err());
        assert_eq!(other.read_all().unwrap().as_ref(), b"data");
        assert_eq!(manager.open_count(a).unwrap(), 1);
    }

    #[test]
    fn test_allocate_truncates_leftover_storage() {
        let (manager, provider) = manager();
        let mut leftover = provider.open(StreamId::new(1)).unwrap();
        leftover.write_all(b"from an earlier manager").unwrap();
        drop(leftover);

        let a = manager.allocate().unwrap();
        assert_eq!(a, StreamId::new(1));
        assert!(read(&manager, a).is_empty());
        assert!(provider.contents(a).unwrap().is_empty());
    }

    #[test]
    fn test_promoted_fresh_stream_stays_empty() {
        let (manager, provider) = manager();
        let mut leftover = provider.open(StreamId::new(1)).unwrap();
        leftover.write_all(b"stale").unwrap();
        drop(leftover);

        let a = manager.allocate().unwrap();
        let b = manager.reference(a).unwrap();
        manager.deallocate(a).unwrap();
        assert!(read(&manager, b).is_empty());
    }

    #[test]
    fn test_copy_on_write_replaces_existing_target_bytes() {
        let (manager, provider) = manager();
        let a = manager.allocate().unwrap();
        write(&manager, a, b"original");
        let b = manager.reference(a).unwrap();

        let mut stale = provider.open(b).unwrap();
        stale.write_all(b"stale bytes that run long").unwrap();
        drop(stale);

        let mut stream = manager.open(TAG, b, OpenMode::Write).unwrap();
        stream.write_all(b"O").unwrap();
        stream.close().unwrap();
        assert_eq!(read(&manager, b), b"Original");
        assert_eq!(read(&manager, a), b"original");
    }

    struct NoRenameProvider(MemoryStreamProvider);

    impl StreamProvider for NoRenameProvider {
        fn kind(&self) -> &'static str {
            "no-rename"
        }

        fn open(&self, id: StreamId) -> Result<Box<dyn BlobStream>> {
            self.0.open(id)
        }

        fn close(&self, id: StreamId) -> Result<()> {
            self.0.close(id)
        }

        fn destroy(&self, id: StreamId) -> Result<()> {
            self.0.destroy(id)
        }

        fn reassign(&self, _old: StreamId, _new: StreamId) -> Result<()> {
            Err(BlobError::Storage(std::io::Error::other("rename refused")))
        }
    }

    #[test]
    fn test_failed_promotion_leaves_tables_unchanged() {
        let provider = Arc::new(NoRenameProvider(MemoryStreamProvider::new()));
        let manager =
            CentralStreamManager::with_provider(StreamManagerConfig::default(), provider).unwrap();
        let a = manager.allocate().unwrap();
        write(&manager, a, b"owner bytes");
        let b = manager.reference(a).unwrap();
        let c = manager.reference(a).unwrap();

        assert!(matches!(manager.deallocate(a), Err(BlobError::Storage(_))));
        assert!(manager.contains(a));
        assert_eq!(manager.owner_of(b), Some(a));
        assert_eq!(manager.owner_of(c), Some(a));
        assert_eq!(manager.references(a), vec![b, c]);
        assert_eq!(read(&manager, b), b"owner bytes");
    }
}
