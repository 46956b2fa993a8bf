use std::{cell::Cell, ops::Bound};

use crate::{
    branch::{BranchId, BranchRef, NO_BRANCH},
    cache::BranchCache,
    cursor::TreeCursor,
    error::corruption,
    results::ResultIter,
    utils::LoopGuard,
    Error, Key,
};

/// Search operator for [`BTree::select`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchOp {
    Less,
    LessOrEqual,
    Equal,
    GreaterOrEqual,
    Greater,
}

/// Outcome of [`BTree::lookup`]: the exact key, its in-order successor when
/// absent, or nothing at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<K> {
    Found(K),
    Nearest(K),
    None,
}

/// B-tree over branches borrowed from a [`BranchCache`].
///
/// The tree only remembers its root id; all structure lives in cached
/// branches. Mutations take `&mut self` so outstanding iterators (which
/// borrow the tree) cannot survive across them.
///
/// A failed mutation may leave the in-memory structure partially changed.
/// Recovery is transactional: the owner keeps the last committed root id,
/// rolls the cache back and [`renew`](Self::renew)s the tree with it.
pub struct BTree<'c, K: Key> {
    cache: &'c BranchCache<K>,
    root: Cell<BranchId>,
}

impl<K: Key> std::fmt::Debug for BTree<'_, K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BTree")
            .field("root", &self.root.get())
            .finish()
    }
}

impl<'c, K: Key> BTree<'c, K> {
    /// An empty tree. No branch is allocated until the first insert.
    pub fn new(cache: &'c BranchCache<K>) -> Self {
        Self::open(cache, NO_BRANCH)
    }

    /// Binds to an existing tree by its root id (e.g. one the owner stored
    /// in a directory block).
    pub fn open(cache: &'c BranchCache<K>, root: BranchId) -> Self {
        Self {
            cache,
            root: Cell::new(root),
        }
    }

    #[inline]
    pub(crate) fn cache(&self) -> &BranchCache<K> {
        self.cache
    }

    #[inline]
    pub(crate) fn root_id(&self) -> BranchId {
        self.root.get()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.root.get() == NO_BRANCH
    }

    /// The durable id of the root, assigning one if the root only exists in
    /// memory so far. This is what the owner persists to find the tree again.
    pub fn id(&self) -> Result<BranchId, Error> {
        let root = self.root.get();
        if root >= NO_BRANCH {
            return Ok(root);
        }
        let branch = self.cache.load(root)?;
        let id = self.cache.assign_id(&branch)?;
        self.root.set(id);
        Ok(id)
    }

    /// Rebinds the tree to `root`, discarding the current root pointer.
    /// Required after the cache was rolled back underneath it.
    pub fn renew(&mut self, root: BranchId) {
        self.root.set(root);
    }

    /// Flushes through the cache and returns the durable root id. Keeping
    /// the two steps together ensures the returned id survives the flush's
    /// id assignment.
    pub fn commit(&mut self) -> Result<BranchId, Error> {
        let id = self.id()?;
        self.cache.commit()?;
        Ok(id)
    }

    /// Inserts `key`, returning whether it was absent. When `overwrite` is
    /// set an existing equal key is replaced in place, which matters for key
    /// types whose ordering ignores payload fields.
    pub fn insert(&mut self, key: K, overwrite: bool) -> Result<bool, Error> {
        let root_id = self.root.get();
        if root_id == NO_BRANCH {
            let root = self.cache.create()?;
            self.cache.mark_dirty(&root)?;
            {
                let mut data = root.write()?;
                data.keys.insert_at(0, key)?;
                data.children.push(NO_BRANCH);
            }
            self.root.set(root.id());
            trace!("new root branch {}", root.id());
            return Ok(true);
        }
        let mut guard = LoopGuard::default();
        let root = self.cache.load(root_id)?;
        let inserted = self.insert_rec(&root, key, overwrite, &mut guard)?;
        if root.read()?.len() > self.cache.max_keys() {
            self.split_root(&root)?;
        }
        Ok(inserted)
    }

    fn insert_rec(
        &self,
        branch: &BranchRef<K>,
        key: K,
        overwrite: bool,
        guard: &mut LoopGuard,
    ) -> Result<bool, Error> {
        guard.step(branch.id())?;
        let (is_leaf, search) = {
            let data = branch.read()?;
            (data.is_leaf(), data.keys.search(&key))
        };
        match search {
            Ok(i) => {
                if overwrite {
                    self.cache.mark_dirty(branch)?;
                    branch.write()?.keys.replace(i, key);
                }
                Ok(false)
            }
            Err(i) if is_leaf => {
                self.cache.mark_dirty(branch)?;
                let mut data = branch.write()?;
                data.keys.insert_at(i, key)?;
                data.children.push(NO_BRANCH);
                Ok(true)
            }
            Err(i) => {
                let child_id = branch.read()?.children[i];
                let child = self.cache.load(child_id)?;
                let inserted = self.insert_rec(&child, key, overwrite, guard)?;
                // parent-driven split: the recursion leaves overfull branches
                // for the caller, which has the separator slot for them
                if child.read()?.len() > self.cache.max_keys() {
                    self.split_child(branch, i, &child)?;
                }
                Ok(inserted)
            }
        }
    }

    /// Splits the overfull `child` (at `parent.children[i]`) around its
    /// median, which moves up into the parent.
    fn split_child(
        &self,
        parent: &BranchRef<K>,
        i: usize,
        child: &BranchRef<K>,
    ) -> Result<(), Error> {
        let right = self.cache.create()?;
        self.cache.mark_dirty(parent)?;
        self.cache.mark_dirty(child)?;
        self.cache.mark_dirty(&right)?;
        let median = {
            let mut cdata = child.write()?;
            let mut rdata = right.write()?;
            let mid = cdata.len() / 2;
            let mut right_keys = cdata.keys.split_off(mid)?;
            let median = right_keys.remove(0);
            rdata.children = cdata.children.split_off(mid + 1);
            rdata.keys = right_keys;
            median
        };
        let mut pdata = parent.write()?;
        pdata.keys.insert_at(i, median)?;
        pdata.children.insert(i + 1, right.id());
        trace!("split branch {} into itself and {}", child.id(), right.id());
        Ok(())
    }

    /// Splits an overfull root in place: its contents move into two fresh
    /// children and only the median stays, so the root id never changes.
    fn split_root(&mut self, root: &BranchRef<K>) -> Result<(), Error> {
        let left = self.cache.create()?;
        let right = self.cache.create()?;
        self.cache.mark_dirty(root)?;
        self.cache.mark_dirty(&left)?;
        self.cache.mark_dirty(&right)?;
        {
            let mut rdata = root.write()?;
            let mut ldata = left.write()?;
            let mut rt = right.write()?;
            let mid = rdata.len() / 2;
            let mut right_keys = rdata.keys.split_off(mid)?;
            let median = right_keys.remove(0);
            rt.children = rdata.children.split_off(mid + 1);
            rt.keys = right_keys;
            ldata.keys = std::mem::take(&mut rdata.keys);
            ldata.children = std::mem::take(&mut rdata.children);
            rdata.keys.insert_at(0, median)?;
            rdata.children = vec![left.id(), right.id()];
        }
        trace!(
            "split root {} into new children {} and {}",
            root.id(),
            left.id(),
            right.id()
        );
        Ok(())
    }

    /// Removes `key`, returning whether it was present.
    pub fn delete(&mut self, key: &K) -> Result<bool, Error> {
        let root_id = self.root.get();
        if root_id == NO_BRANCH {
            return Ok(false);
        }
        let mut guard = LoopGuard::default();
        let root = self.cache.load(root_id)?;
        let removed = self.delete_rec(&root, key, &mut guard)?;
        if removed {
            self.rebalance_root(root)?;
        }
        Ok(removed)
    }

    fn delete_rec(
        &self,
        branch: &BranchRef<K>,
        key: &K,
        guard: &mut LoopGuard,
    ) -> Result<bool, Error> {
        guard.step(branch.id())?;
        let (is_leaf, search) = {
            let data = branch.read()?;
            (data.is_leaf(), data.keys.search(key))
        };
        match search {
            Ok(i) if is_leaf => {
                self.cache.mark_dirty(branch)?;
                let mut data = branch.write()?;
                data.keys.remove(i);
                data.children.pop();
                Ok(true)
            }
            Ok(i) => {
                // internal hit: swap in the in-order successor, then delete
                // the successor from the right subtree's leaf
                let right_id = branch.read()?.children[i + 1];
                let successor = self.smallest_in(right_id)?;
                self.cache.mark_dirty(branch)?;
                branch.write()?.keys.replace(i, successor.clone());
                let child = self.cache.load(right_id)?;
                let removed = self.delete_rec(&child, &successor, guard)?;
                debug_assert!(removed);
                drop(child);
                self.fix_underflow(branch, i + 1)?;
                Ok(true)
            }
            Err(_) if is_leaf => Ok(false),
            Err(i) => {
                let child_id = branch.read()?.children[i];
                let child = self.cache.load(child_id)?;
                let removed = self.delete_rec(&child, key, guard)?;
                drop(child);
                if removed {
                    self.fix_underflow(branch, i)?;
                }
                Ok(removed)
            }
        }
    }

    /// Leftmost key of the subtree rooted at `id`.
    fn smallest_in(&self, mut id: BranchId) -> Result<K, Error> {
        let mut guard = LoopGuard::default();
        loop {
            guard.step(id)?;
            let branch = self.cache.load(id)?;
            let data = branch.read()?;
            if data.is_leaf() {
                return data
                    .keys
                    .first()
                    .cloned()
                    .ok_or_else(|| corruption!("empty non-root leaf {id}"));
            }
            id = data.children[0];
        }
    }

    /// Restores minimum occupancy of `parent.children[i]` after a delete
    /// below it, by redistributing with an adjacent sibling when their
    /// combined keys still need two branches, or merging otherwise.
    fn fix_underflow(&self, parent: &BranchRef<K>, i: usize) -> Result<(), Error> {
        let max = self.cache.max_keys();
        let min = max / 2;
        let child_id = parent.read()?.children[i];
        let child = self.cache.load(child_id)?;
        if child.read()?.len() >= min {
            return Ok(());
        }
        drop(child);

        let (li, ri) = if i > 0 { (i - 1, i) } else { (i, i + 1) };
        let (left_id, right_id, sep) = {
            let data = parent.read()?;
            debug_assert!(ri <= data.len());
            let sep = data
                .keys
                .get(li)
                .cloned()
                .ok_or_else(|| corruption!("branch {} lacks separator {li}", parent.id()))?;
            (data.children[li], data.children[ri], sep)
        };
        let left = self.cache.load(left_id)?;
        let right = self.cache.load(right_id)?;
        let (l_len, r_len) = (left.read()?.len(), right.read()?.len());
        self.cache.mark_dirty(parent)?;
        self.cache.mark_dirty(&left)?;

        if l_len + r_len < max {
            // both fit in one branch together with the separator
            {
                let mut ldata = left.write()?;
                let mut rdata = right.write()?;
                ldata.keys.insert_at(l_len, sep)?;
                ldata.keys.append(&mut rdata.keys)?;
                ldata.children.append(&mut rdata.children);
            }
            {
                let mut pdata = parent.write()?;
                pdata.keys.remove(li);
                pdata.children.remove(ri);
            }
            trace!("merged branch {} into {}", right.id(), left.id());
            self.cache.unlink(right)?;
        } else {
            // redistribute: pour everything into the left branch and split
            // it evenly again, promoting the new median as separator
            self.cache.mark_dirty(&right)?;
            let new_sep = {
                let mut ldata = left.write()?;
                let mut rdata = right.write()?;
                ldata.keys.insert_at(l_len, sep)?;
                ldata.keys.append(&mut rdata.keys)?;
                ldata.children.append(&mut rdata.children);
                let mid = ldata.len() / 2;
                let mut right_keys = ldata.keys.split_off(mid)?;
                let new_sep = right_keys.remove(0);
                rdata.children = ldata.children.split_off(mid + 1);
                rdata.keys = right_keys;
                new_sep
            };
            parent.write()?.keys.replace(li, new_sep);
            trace!(
                "redistributed branches {} and {}",
                left.id(),
                right.id()
            );
        }
        Ok(())
    }

    /// Collapses a drained root: a zero-key internal root absorbs its sole
    /// child (keeping the root id stable), a zero-key leaf root empties the
    /// tree.
    fn rebalance_root(&mut self, root: BranchRef<K>) -> Result<(), Error> {
        let (len, is_leaf, sole) = {
            let data = root.read()?;
            (data.len(), data.is_leaf(), data.rightmost())
        };
        if len > 0 {
            return Ok(());
        }
        if is_leaf {
            trace!("tree emptied, unlinking root {}", root.id());
            self.cache.unlink(root)?;
            self.root.set(NO_BRANCH);
        } else {
            let child = self.cache.load(sole)?;
            self.cache.mark_dirty(&root)?;
            {
                let mut rdata = root.write()?;
                let mut cdata = child.write()?;
                rdata.keys = std::mem::take(&mut cdata.keys);
                rdata.children = std::mem::take(&mut cdata.children);
            }
            trace!("root {} absorbed sole child {}", root.id(), child.id());
            self.cache.unlink(child)?;
        }
        Ok(())
    }

    /// Removes every key within `bounds`, returning how many were removed.
    /// Re-locates after each delete since removal restructures the tree.
    pub fn delete_range(&mut self, bounds: (Bound<K>, Bound<K>)) -> Result<u64, Error> {
        let (mut lower, upper) = bounds;
        let mut removed = 0;
        loop {
            let next = {
                let mut cursor = TreeCursor::new(self, lower.clone(), upper.clone(), false);
                if cursor.next()? {
                    cursor.get().cloned()
                } else {
                    None
                }
            };
            let Some(key) = next else { break };
            self.delete(&key)?;
            removed += 1;
            lower = Bound::Excluded(key);
        }
        Ok(removed)
    }

    /// Exact key or its in-order successor, returning the stored copies.
    pub fn lookup(&self, key: &K) -> Result<Lookup<K>, Error> {
        let mut cursor = TreeCursor::new(
            self,
            Bound::Included(key.clone()),
            Bound::Unbounded,
            false,
        );
        if !cursor.next()? {
            return Ok(Lookup::None);
        }
        let Some(found) = cursor.get().cloned() else {
            return Ok(Lookup::None);
        };
        if &found == key {
            Ok(Lookup::Found(found))
        } else {
            Ok(Lookup::Nearest(found))
        }
    }

    pub fn first(&self) -> Result<Option<K>, Error> {
        let mut cursor = TreeCursor::new(self, Bound::Unbounded, Bound::Unbounded, false);
        cursor.next()?;
        Ok(cursor.get().cloned())
    }

    pub fn last(&self) -> Result<Option<K>, Error> {
        let mut cursor = TreeCursor::new(self, Bound::Unbounded, Bound::Unbounded, true);
        cursor.prev()?;
        Ok(cursor.get().cloned())
    }

    /// Iterator over the keys related to `key` by `op`. The `Less` and
    /// `LessOrEqual` results start past their end, to be walked backwards.
    pub fn select(&self, op: SearchOp, key: &K) -> ResultIter<'_, K> {
        use Bound::*;
        let (lower, upper, at_end) = match op {
            SearchOp::Less => (Unbounded, Excluded(key.clone()), true),
            SearchOp::LessOrEqual => (Unbounded, Included(key.clone()), true),
            SearchOp::Equal => (Included(key.clone()), Included(key.clone()), false),
            SearchOp::GreaterOrEqual => (Included(key.clone()), Unbounded, false),
            SearchOp::Greater => (Excluded(key.clone()), Unbounded, false),
        };
        ResultIter::over_tree(TreeCursor::new(self, lower, upper, at_end))
    }

    /// Whole-tree ascending iterator.
    pub fn iter(&self) -> ResultIter<'_, K> {
        ResultIter::over_tree(TreeCursor::new(self, Bound::Unbounded, Bound::Unbounded, false))
    }

    /// Whole-tree iterator positioned past the last key, to be walked with
    /// `prev`.
    pub fn iter_back(&self) -> ResultIter<'_, K> {
        ResultIter::over_tree(TreeCursor::new(self, Bound::Unbounded, Bound::Unbounded, true))
    }

    /// Iterator over an arbitrary key range.
    pub fn range(&self, lower: Bound<K>, upper: Bound<K>) -> ResultIter<'_, K> {
        ResultIter::over_tree(TreeCursor::new(self, lower, upper, false))
    }

    /// Unlinks every branch and empties the tree.
    pub fn clear(&mut self) -> Result<(), Error> {
        let root = self.root.get();
        if root != NO_BRANCH {
            let mut guard = LoopGuard::default();
            self.unlink_rec(root, &mut guard)?;
            self.root.set(NO_BRANCH);
            trace!("cleared tree rooted at {root}");
        }
        Ok(())
    }

    fn unlink_rec(&self, id: BranchId, guard: &mut LoopGuard) -> Result<(), Error> {
        guard.step(id)?;
        let branch = self.cache.load(id)?;
        let children = {
            let data = branch.read()?;
            if data.is_leaf() {
                Vec::new()
            } else {
                data.children.clone()
            }
        };
        self.cache.unlink(branch)?;
        for child in children {
            self.unlink_rec(child, guard)?;
        }
        Ok(())
    }

    /// Verifies structural invariants of the whole tree: key order and
    /// subtree ranges, branch occupancy, uniform leaf depth, pointer shape.
    /// With `thorough`, clean persisted branches are additionally
    /// byte-compared against their stored blocks.
    pub fn check_consistency(&self, thorough: bool) -> Result<(), Error> {
        let root = self.root.get();
        if root == NO_BRANCH {
            return Ok(());
        }
        let mut guard = LoopGuard::default();
        self.check_rec(root, None, None, 0, &mut guard, thorough)?;
        Ok(())
    }

    /// Returns the leaf depth of the subtree, which must be uniform.
    fn check_rec(
        &self,
        id: BranchId,
        lower: Option<&K>,
        upper: Option<&K>,
        depth: usize,
        guard: &mut LoopGuard,
        thorough: bool,
    ) -> Result<usize, Error> {
        guard.step(id)?;
        let branch = self.cache.load(id)?;
        let data = branch.read()?;
        let len = data.len();
        let max = self.cache.max_keys();

        if data.children.len() != len + 1 {
            return Err(corruption!(
                "branch {id} has {len} keys but {} pointers",
                data.children.len()
            ));
        }
        if len > max {
            return Err(corruption!("branch {id} overfull: {len} > {max}"));
        }
        if depth > 0 && len < max / 2 {
            return Err(corruption!("branch {id} under-occupied: {len} < {}", max / 2));
        }
        if depth == 0 && len == 0 {
            return Err(corruption!("empty branch {id} as root"));
        }
        for pair in data.keys.as_slice().windows(2) {
            if pair[0] >= pair[1] {
                return Err(corruption!("branch {id} keys out of order"));
            }
        }
        if lower.is_some_and(|lo| data.keys.first().is_some_and(|k| k <= lo))
            || upper.is_some_and(|hi| data.keys.last().is_some_and(|k| k >= hi))
        {
            return Err(corruption!("branch {id} escapes its parent's key range"));
        }
        if !data.is_leaf() && data.children.contains(&NO_BRANCH) {
            return Err(corruption!("branch {id} mixes leaf and child pointers"));
        }
        if thorough && id > NO_BRANCH && !branch.is_dirty() {
            let disk = self.cache.raw_block(id)?;
            let mut mem = Vec::new();
            data.encode_into(&mut mem);
            if mem != disk {
                return Err(corruption!("branch {id} diverges from its stored block"));
            }
        }

        if data.is_leaf() {
            return Ok(depth);
        }
        let mut leaf_depth = None;
        for (i, &child) in data.children.iter().enumerate() {
            let child_lower = if i == 0 { lower } else { data.keys.get(i - 1) };
            let child_upper = if i == len { upper } else { data.keys.get(i) };
            let d = self.check_rec(child, child_lower, child_upper, depth + 1, guard, thorough)?;
            if *leaf_depth.get_or_insert(d) != d {
                return Err(corruption!("leaves at unequal depth under branch {id}"));
            }
        }
        Ok(leaf_depth.unwrap_or(depth))
    }
}
