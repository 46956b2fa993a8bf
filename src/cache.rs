use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

use hashbrown::HashMap;

use crate::{
    branch::{max_keys, Branch, BranchData, BranchId, BranchRef, NO_BRANCH},
    error::{corruption, validation},
    storage::BlockStorage,
    Error, Key,
};

/// Reference-counted cache of decoded [`Branch`]es over a block storage.
///
/// Trees borrow branches from the cache by id; a [`BranchRef`] pins its
/// branch until dropped. The cache keeps no replacement policy of its own:
/// it only tracks the NUR recency marks an external eviction policy consumes,
/// and holds every loaded branch until [`commit`](Self::commit),
/// [`rollback`](Self::rollback) or [`unlink`](Self::unlink).
///
/// Marking a branch dirty implicitly opens a storage transaction; all
/// mutations of one top-level tree operation commit or roll back together.
pub struct BranchCache<K: Key> {
    storage: RefCell<Box<dyn BlockStorage>>,
    entries: RefCell<HashMap<BranchId, BranchRef<K>>>,
    /// Memory-only ids count down from -1 until the flush assigns real ones.
    next_mem_id: Cell<BranchId>,
    /// Tree-scoped recency counter backing the NUR marks.
    nur_tick: Cell<u64>,
    txn_open: Cell<bool>,
    max_keys: usize,
}

impl<K: Key> std::fmt::Debug for BranchCache<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BranchCache")
            .field("entries", &self.entries.borrow().len())
            .field("txn_open", &self.txn_open.get())
            .field("max_keys", &self.max_keys)
            .finish()
    }
}

impl<K: Key> BranchCache<K> {
    /// Binds a cache for keys of type `K` to a block storage. Fails if the
    /// storage's block size can't fit a branch of at least 2 keys.
    pub fn new(storage: Box<dyn BlockStorage>) -> Result<Self, Error> {
        let max_keys = max_keys::<K>(storage.block_size());
        if max_keys < 2 {
            return Err(validation!(
                "block size {} fits only {max_keys} keys per branch, need at least 2",
                storage.block_size()
            ));
        }
        Ok(Self {
            storage: RefCell::new(storage),
            entries: RefCell::new(HashMap::new()),
            next_mem_id: Cell::new(-1),
            nur_tick: Cell::new(0),
            txn_open: Cell::new(false),
            max_keys,
        })
    }

    /// Branch key capacity (`BTreeSize`) derived from the block size.
    #[inline]
    pub fn max_keys(&self) -> usize {
        self.max_keys
    }

    /// Number of branches currently cached.
    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    /// Consumes the cache, returning the underlying storage.
    pub fn into_storage(self) -> Box<dyn BlockStorage> {
        self.storage.into_inner()
    }

    fn tick(&self, branch: &Branch<K>) {
        let mark = self.nur_tick.get() + 1;
        self.nur_tick.set(mark);
        branch.set_nur_mark(mark);
    }

    /// Allocates a new in-memory leaf branch with a negative id.
    pub fn create(&self) -> Result<BranchRef<K>, Error> {
        let id = self.next_mem_id.get();
        self.next_mem_id.set(id - 1);
        let branch = Branch::new_leaf(id);
        self.tick(&branch);
        self.entries.borrow_mut().insert(id, branch.clone());
        trace!("created in-memory branch {id}");
        Ok(branch)
    }

    /// Pins the branch with the given id, reading and decoding its block on
    /// a cache miss.
    pub fn load(&self, id: BranchId) -> Result<BranchRef<K>, Error> {
        if let Some(branch) = self.entries.borrow().get(&id) {
            self.tick(branch);
            return Ok(branch.clone());
        }
        if id <= NO_BRANCH {
            return Err(corruption!("dangling reference to unflushed branch {id}"));
        }
        let mut buf = Vec::new();
        {
            let storage = self.storage.borrow();
            let len = storage.data_length(id)?;
            if len > storage.block_size() {
                return Err(corruption!("branch {id} block length {len} out of range"));
            }
            storage.read(id, &mut buf)?;
        }
        let branch = Branch::new(id, BranchData::decode(&buf)?);
        branch.set_stored(true);
        self.tick(&branch);
        self.entries.borrow_mut().insert(id, branch.clone());
        trace!("loaded branch {id}");
        Ok(branch)
    }

    /// Marks a branch modified, to be flushed on the next commit. Opens the
    /// storage transaction if none is open yet.
    pub fn mark_dirty(&self, branch: &BranchRef<K>) -> Result<(), Error> {
        if !self.txn_open.get() {
            self.storage.borrow_mut().begin()?;
            self.txn_open.set(true);
        }
        self.tick(branch);
        branch.set_dirty(true);
        Ok(())
    }

    /// Evicts a branch from the cache and frees its disk space.
    pub fn unlink(&self, branch: BranchRef<K>) -> Result<(), Error> {
        let id = branch.id();
        self.entries.borrow_mut().remove(&id);
        if id > NO_BRANCH {
            if !self.txn_open.get() {
                self.storage.borrow_mut().begin()?;
                self.txn_open.set(true);
            }
            self.storage.borrow_mut().free(id)?;
        }
        trace!("unlinked branch {id}");
        Ok(())
    }

    /// Assigns a durable block id to a memory-only branch, rewriting every
    /// cached reference to the old negative id. Needed when the owner must
    /// persist a root pointer before the flush runs.
    pub fn assign_id(&self, branch: &BranchRef<K>) -> Result<BranchId, Error> {
        let old = branch.id();
        if old > NO_BRANCH {
            return Ok(old);
        }
        if !self.txn_open.get() {
            self.storage.borrow_mut().begin()?;
            self.txn_open.set(true);
        }
        let new = self.storage.borrow_mut().reserve()?;
        branch.set_id(new);
        let mut entries = self.entries.borrow_mut();
        entries.remove(&old);
        entries.insert(new, branch.clone());
        // fix references held by cached parents; any branch pointing at a
        // memory-only child is itself dirty and cached
        for entry in entries.values() {
            let mut data = entry.write()?;
            for child in data.children.iter_mut() {
                if *child == old {
                    *child = new;
                }
            }
        }
        trace!("assigned block {new} to in-memory branch {old}");
        Ok(new)
    }

    /// Flushes every dirty branch and commits the storage transaction.
    /// Memory-only branches get durable ids first; clean branches stay
    /// cached and pinned refs stay valid.
    pub fn commit(&self) -> Result<(), Error> {
        let pending: Vec<BranchRef<K>> = self
            .entries
            .borrow()
            .values()
            .filter(|b| b.is_dirty())
            .cloned()
            .collect();
        if pending.is_empty() && !self.txn_open.get() {
            return Ok(());
        }
        for branch in &pending {
            if branch.id() <= NO_BRANCH {
                self.assign_id(branch)?;
            }
        }
        let mut buf = Vec::new();
        for branch in &pending {
            let id = branch.id();
            branch.read()?.encode_into(&mut buf);
            if branch.is_stored() {
                self.storage.borrow_mut().update(id, &buf)?;
            } else {
                self.storage.borrow_mut().write(id, &buf)?;
                branch.set_stored(true);
            }
            branch.set_dirty(false);
            trace!("flushed branch {id} ({} bytes)", buf.len());
        }
        if self.txn_open.get() {
            self.storage.borrow_mut().commit()?;
            self.txn_open.set(false);
        }
        Ok(())
    }

    /// Raw stored bytes of a persisted block, for consistency audits.
    pub(crate) fn raw_block(&self, id: BranchId) -> Result<Vec<u8>, Error> {
        let mut buf = Vec::new();
        self.storage.borrow().read(id, &mut buf)?;
        Ok(buf)
    }

    /// Rolls back the storage transaction and drops every cached branch,
    /// modified or not. Fails if any branch is still pinned: the in-memory
    /// copies are about to become stale and must not stay reachable.
    pub fn rollback(&self) -> Result<(), Error> {
        {
            let entries = self.entries.borrow();
            if let Some(pinned) = entries.values().find(|b| Rc::strong_count(b) > 1) {
                return Err(validation!(
                    "cannot roll back: branch {} is still referenced",
                    pinned.id()
                ));
            }
        }
        self.entries.borrow_mut().clear();
        if self.txn_open.get() {
            self.storage.borrow_mut().rollback()?;
            self.txn_open.set(false);
        }
        Ok(())
    }
}
