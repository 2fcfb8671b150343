//! Identity-mapped storages
//!
//! A storage hands out one shared record per runtime id together with a
//! sequential internal id. Records are never freed while the storage lives:
//! unlinking only forgets the runtime id, so references taken by other
//! threads stay valid.

use crate::info::{MappedInfo, ThreadInfo};
use rtprof_shared::InternalId;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Threads of the process, shared by the callbacks and the service threads
pub type ThreadRegistry = RwLock<LiveStorage<ThreadInfo>>;

/// Shared access; a panic in another holder does not make the data unusable
pub fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Records by runtime id, plus every record ever created by internal id
pub struct MappedStorage<I: MappedInfo> {
    by_id: HashMap<I::Id, Arc<I>>,
    all: Vec<Arc<I>>,
}

impl<I: MappedInfo> Default for MappedStorage<I> {
    fn default() -> Self {
        Self {
            by_id: HashMap::new(),
            all: Vec::new(),
        }
    }
}

impl<I: MappedInfo> MappedStorage<I> {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_iid(&self) -> InternalId {
        InternalId(self.all.len() as u32)
    }

    /// Record for `id`, created if missing; the flag tells if it was created
    pub fn place(&mut self, id: I::Id) -> (Arc<I>, bool) {
        if let Some(info) = self.by_id.get(&id) {
            return (info.clone(), false);
        }
        let info = Arc::new(I::create(id, self.next_iid()));
        self.all.push(info.clone());
        self.by_id.insert(id, info.clone());
        (info, true)
    }

    /// New record with no runtime id
    pub fn add(&mut self) -> Arc<I> {
        let info = Arc::new(I::create(I::Id::default(), self.next_iid()));
        self.all.push(info.clone());
        info
    }

    pub fn get(&self, id: I::Id) -> Option<Arc<I>> {
        self.by_id.get(&id).cloned()
    }

    /// Forget the runtime id; the record itself stays reachable by iid
    pub fn unlink(&mut self, id: I::Id) -> Option<Arc<I>> {
        self.by_id.remove(&id)
    }

    pub fn by_iid(&self, iid: InternalId) -> Option<&Arc<I>> {
        self.all.get(iid.get() as usize)
    }

    /// Number of records ever created
    pub fn len(&self) -> usize {
        self.all.len()
    }

    pub fn is_empty(&self) -> bool {
        self.all.is_empty()
    }
}

/// A mapped storage that also tracks which records are alive
pub struct LiveStorage<I: MappedInfo> {
    base: MappedStorage<I>,
    live: BTreeMap<InternalId, Arc<I>>,
}

impl<I: MappedInfo> Default for LiveStorage<I> {
    fn default() -> Self {
        Self {
            base: MappedStorage::new(),
            live: BTreeMap::new(),
        }
    }
}

impl<I: MappedInfo> LiveStorage<I> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn place(&mut self, id: I::Id) -> (Arc<I>, bool) {
        let (info, created) = self.base.place(id);
        if created {
            self.live.insert(info.iid(), info.clone());
        }
        (info, created)
    }

    pub fn get(&self, id: I::Id) -> Option<Arc<I>> {
        self.base.get(id)
    }

    pub fn unlink(&mut self, id: I::Id) -> Option<Arc<I>> {
        let info = self.base.unlink(id)?;
        self.live.remove(&info.iid());
        Some(info)
    }

    pub fn by_iid(&self, iid: InternalId) -> Option<&Arc<I>> {
        self.base.by_iid(iid)
    }

    /// Snapshot of the live records, ordered by internal id
    pub fn live(&self) -> Vec<Arc<I>> {
        self.live.values().cloned().collect()
    }

    /// Every record ever created, in internal id order
    pub fn all(&self) -> impl Iterator<Item = &Arc<I>> {
        self.base.all.iter()
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn len(&self) -> usize {
        self.base.len()
    }

    pub fn is_empty(&self) -> bool {
        self.base.is_empty()
    }
}
