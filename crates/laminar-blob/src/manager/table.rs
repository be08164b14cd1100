//! Header table: the alias graph as two identity-keyed maps.
//!
//! Every live identity has a header holding the set of identities that alias
//! it. A second map records, for every alias, the identity it aliases. The two
//! maps are exact inverses at all times.
//!
//! A *root* is an identity that aliases nothing; its bytes live in physical
//! storage under its own identity. An alias reads the bytes of the root at the
//! top of its chain.
//!
//! The table knows nothing about providers or open streams. Each header
//! carries a payload `P` that the central manager fills with that state; the
//! graph edits below are plain functions over the maps and are tested with
//! `P = ()`.

use std::collections::BTreeSet;

use fxhash::FxHashMap;
use smallvec::SmallVec;

use crate::error::BlobError;
use crate::identity::StreamId;
use crate::Result;

/// Identities whose owner changed during one graph edit.
pub type Moved = SmallVec<[StreamId; 4]>;

struct Header<P> {
    payload: P,
    references: BTreeSet<StreamId>,
}

/// Result of removing an identity from the table.
#[derive(Debug)]
pub enum Removal<P> {
    /// The identity was an alias. Its aliases now alias `owner`.
    Alias {
        /// Payload of the removed header.
        payload: P,
        /// Owner the identity was removed from.
        owner: StreamId,
        /// Aliases re-pointed to `owner`.
        moved: Moved,
    },
    /// The identity was a root with aliases; `promoted` is the new root.
    Promoted {
        /// Payload of the removed header.
        payload: P,
        /// Former alias that now owns the storage.
        promoted: StreamId,
        /// Remaining aliases re-pointed to `promoted`.
        moved: Moved,
    },
    /// The identity was a root nobody aliased.
    Root {
        /// Payload of the removed header.
        payload: P,
    },
}

/// Result of separating an identity from everything sharing its bytes.
#[derive(Debug, PartialEq, Eq)]
pub enum Split {
    /// Nothing shared the identity's bytes.
    Exclusive,
    /// The identity was an alias and is now a root.
    Alias {
        /// The identity it aliased.
        former_owner: StreamId,
        /// Its own aliases, re-pointed to `former_owner`.
        moved: Moved,
    },
    /// The identity was a root with aliases; `successor` is the new root of
    /// the original bytes.
    Owner {
        /// Lowest former alias, now a root.
        successor: StreamId,
        /// Other former aliases, re-pointed to `successor`.
        moved: Moved,
    },
}

/// Arena of stream headers keyed by identity.
pub struct HeaderTable<P> {
    headers: FxHashMap<StreamId, Header<P>>,
    owners: FxHashMap<StreamId, StreamId>,
    last_id: StreamId,
}

impl<P> Default for HeaderTable<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> HeaderTable<P> {
    /// Creates an empty table. The first identity handed out is 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            headers: FxHashMap::default(),
            owners: FxHashMap::default(),
            last_id: StreamId::NULL,
        }
    }

    /// Number of live identities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.headers.len()
    }

    /// Returns `true` if no identity is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    /// Returns `true` if `id` is live.
    #[must_use]
    pub fn contains(&self, id: StreamId) -> bool {
        self.headers.contains_key(&id)
    }

    /// Returns the payload of `id`.
    ///
    /// # Errors
    ///
    /// Returns [`BlobError::StreamNotFound`] if `id` is not live.
    pub fn payload(&self, id: StreamId) -> Result<&P> {
        self.headers
            .get(&id)
            .map(|header| &header.payload)
            .ok_or(BlobError::StreamNotFound(id))
    }

    /// Returns the payload of `id` mutably.
    ///
    /// # Errors
    ///
    /// Returns [`BlobError::StreamNotFound`] if `id` is not live.
    pub fn payload_mut(&mut self, id: StreamId) -> Result<&mut P> {
        self.headers
            .get_mut(&id)
            .map(|header| &mut header.payload)
            .ok_or(BlobError::StreamNotFound(id))
    }

    /// Iterates over every live identity and its payload.
    pub fn iter(&self) -> impl Iterator<Item = (StreamId, &P)> + '_ {
        self.headers.iter().map(|(id, header)| (*id, &header.payload))
    }

    /// Iterates mutably over every live identity and its payload.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (StreamId, &mut P)> + '_ {
        self.headers
            .iter_mut()
            .map(|(id, header)| (*id, &mut header.payload))
    }

    /// Returns the identity `id` aliases, if any.
    #[must_use]
    pub fn owner_of(&self, id: StreamId) -> Option<StreamId> {
        self.owners.get(&id).copied()
    }

    /// Returns the identities aliasing `id`, in ascending order.
    #[must_use]
    pub fn references(&self, id: StreamId) -> Vec<StreamId> {
        self.headers
            .get(&id)
            .map(|header| header.references.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Returns `true` if `id` is live, aliases nothing and is not aliased.
    #[must_use]
    pub fn is_exclusive(&self, id: StreamId) -> bool {
        self.headers.get(&id).is_some_and(|header| {
            header.references.is_empty() && !self.owners.contains_key(&id)
        })
    }

    /// Returns the alias that [`remove`](Self::remove) would promote, if `id`
    /// is a root with aliases.
    #[must_use]
    pub fn promotion_target(&self, id: StreamId) -> Option<StreamId> {
        if self.owners.contains_key(&id) {
            return None;
        }
        self.headers
            .get(&id)
            .and_then(|header| header.references.first().copied())
    }

    fn next_id(&mut self) -> Result<StreamId> {
        self.last_id = self
            .last_id
            .next()
            .ok_or_else(|| BlobError::InvalidArgument("stream identities exhausted".into()))?;
        Ok(self.last_id)
    }

    /// Adds a new root and returns its identity.
    ///
    /// # Errors
    ///
    /// Returns [`BlobError::InvalidArgument`] once every identity has been
    /// handed out.
    pub fn insert_owned(&mut self, payload: P) -> Result<StreamId> {
        let id = self.next_id()?;
        self.headers.insert(
            id,
            Header {
                payload,
                references: BTreeSet::new(),
            },
        );
        Ok(id)
    }

    /// Adds a new alias of `owner` and returns its identity.
    ///
    /// # Errors
    ///
    /// Returns [`BlobError::StreamNotFound`] if `owner` is not live, or
    /// [`BlobError::InvalidArgument`] once every identity has been handed out.
    pub fn insert_alias(&mut self, owner: StreamId, payload: P) -> Result<StreamId> {
        if !self.contains(owner) {
            return Err(BlobError::StreamNotFound(owner));
        }
        let id = self.next_id()?;
        self.headers.insert(
            id,
            Header {
                payload,
                references: BTreeSet::new(),
            },
        );
        self.link(id, owner);
        Ok(id)
    }

    fn link(&mut self, alias: StreamId, owner: StreamId) {
        if let Some(header) = self.headers.get_mut(&owner) {
            header.references.insert(alias);
        }
        self.owners.insert(alias, owner);
    }

    fn unlink(&mut self, alias: StreamId) -> Option<StreamId> {
        let owner = self.owners.remove(&alias)?;
        if let Some(header) = self.headers.get_mut(&owner) {
            header.references.remove(&alias);
        }
        Some(owner)
    }

    /// Re-points every alias of `from` to `to`, returning the moved ones.
    fn move_references(&mut self, from: StreamId, to: StreamId) -> Moved {
        let moved: Moved = match self.headers.get_mut(&from) {
            Some(header) => std::mem::take(&mut header.references).into_iter().collect(),
            None => Moved::new(),
        };
        for alias in &moved {
            self.link(*alias, to);
        }
        moved
    }

    /// Removes `id`, handing its aliases to its owner or promoting the lowest
    /// of them to root.
    ///
    /// # Errors
    ///
    /// Returns [`BlobError::StreamNotFound`] if `id` is not live.
    pub fn remove(&mut self, id: StreamId) -> Result<Removal<P>> {
        if !self.contains(id) {
            return Err(BlobError::StreamNotFound(id));
        }

        if let Some(owner) = self.unlink(id) {
            let moved = self.move_references(id, owner);
            let payload = self.take(id)?;
            return Ok(Removal::Alias {
                payload,
                owner,
                moved,
            });
        }

        match self.promotion_target(id) {
            Some(promoted) => {
                self.unlink(promoted);
                let moved = self.move_references(id, promoted);
                let payload = self.take(id)?;
                Ok(Removal::Promoted {
                    payload,
                    promoted,
                    moved,
                })
            }
            None => Ok(Removal::Root {
                payload: self.take(id)?,
            }),
        }
    }

    fn take(&mut self, id: StreamId) -> Result<P> {
        self.headers
            .remove(&id)
            .map(|header| header.payload)
            .ok_or(BlobError::StreamNotFound(id))
    }

    /// Makes `id` exclusive so it can be mutated without affecting anyone.
    ///
    /// An alias is detached from its owner and its own aliases move to that
    /// owner. A root hands its aliases to the lowest of them, which becomes
    /// the new root of the original bytes.
    ///
    /// # Errors
    ///
    /// Returns [`BlobError::StreamNotFound`] if `id` is not live.
    pub fn split(&mut self, id: StreamId) -> Result<Split> {
        if !self.contains(id) {
            return Err(BlobError::StreamNotFound(id));
        }

        if let Some(former_owner) = self.unlink(id) {
            let moved = self.move_references(id, former_owner);
            return Ok(Split::Alias {
                former_owner,
                moved,
            });
        }

        match self.promotion_target(id) {
            Some(successor) => {
                self.unlink(successor);
                let moved = self.move_references(id, successor);
                Ok(Split::Owner { successor, moved })
            }
            None => Ok(Split::Exclusive),
        }
    }

    /// Panics if the alias sets and the owner map are not exact inverses.
    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        for (alias, owner) in &self.owners {
            let header = self.headers.get(owner).expect("owner is live");
            assert!(header.references.contains(alias), "{alias} missing from {owner}");
            assert!(self.headers.contains_key(alias), "alias {alias} is live");
        }
        for (id, header) in &self.headers {
            for alias in &header.references {
                assert_eq!(self.owners.get(alias), Some(id));
            }
        }
    }
}
