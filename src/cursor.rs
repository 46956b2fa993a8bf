use std::ops::Bound;

use smallvec::SmallVec;

use crate::{
    branch::{BranchId, BranchRef, NO_BRANCH},
    error::corruption,
    tree::BTree,
    utils::LoopGuard,
    Error, Key,
};

/// Deeper than any healthy tree can nest (minimum branching 2 means 2^64
/// branches). Exceeding it indicates a pointer cycle spanning descents,
/// which the per-descent guard cannot see.
const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CursorState {
    /// Before the first qualifying key.
    Beginning,
    /// On a key.
    Valid,
    /// After the last qualifying key.
    End,
}

/// Stack-based bidirectional walker over a tree's in-order key sequence,
/// optionally restricted to a bound range.
///
/// The stack pins the branch chain from the root to the current position for
/// the cursor's whole lifetime; the structural snapshot it walks must not be
/// mutated underneath it (the borrow on the tree enforces this).
///
/// Stack entries are `(branch, idx, at_key)`: for a leaf, `idx` is the key
/// position (`at_key` always true); for an internal branch, `at_key` says
/// whether the cursor sits on `keys[idx]` or has descended into
/// `children[idx]`.
pub struct TreeCursor<'t, K: Key> {
    tree: &'t BTree<'t, K>,
    stack: SmallVec<(BranchRef<K>, usize, bool), 8>,
    lower: Bound<K>,
    upper: Bound<K>,
    state: CursorState,
    current: Option<K>,
}

impl<K: Key> std::fmt::Debug for TreeCursor<'_, K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeCursor")
            .field("stack len", &self.stack.len())
            .field("state", &self.state)
            .field("current", &self.current)
            .finish()
    }
}

impl<'t, K: Key> TreeCursor<'t, K> {
    pub fn new(tree: &'t BTree<'t, K>, lower: Bound<K>, upper: Bound<K>, at_end: bool) -> Self {
        Self {
            tree,
            stack: Default::default(),
            lower,
            upper,
            state: if at_end {
                CursorState::End
            } else {
                CursorState::Beginning
            },
            current: None,
        }
    }

    /// The key under the cursor; defined only in a valid position.
    #[inline]
    pub fn get(&self) -> Option<&K> {
        match self.state {
            CursorState::Valid => self.current.as_ref(),
            _ => None,
        }
    }

    #[inline]
    pub fn at_beginning(&self) -> bool {
        self.state == CursorState::Beginning
    }

    #[inline]
    pub fn at_end(&self) -> bool {
        self.state == CursorState::End
    }

    pub fn rewind(&mut self) {
        self.stack.clear();
        self.current = None;
        self.state = CursorState::Beginning;
    }

    pub fn wind_to_end(&mut self) {
        self.stack.clear();
        self.current = None;
        self.state = CursorState::End;
    }

    fn push_frame(&mut self, frame: (BranchRef<K>, usize, bool)) -> Result<(), Error> {
        if self.stack.len() >= MAX_DEPTH {
            return Err(corruption!(
                "branch nesting exceeds {MAX_DEPTH} levels, assuming a pointer loop"
            ));
        }
        self.stack.push(frame);
        Ok(())
    }

    fn within_lower(&self, key: &K) -> bool {
        match &self.lower {
            Bound::Unbounded => true,
            Bound::Included(b) => key >= b,
            Bound::Excluded(b) => key > b,
        }
    }

    fn within_upper(&self, key: &K) -> bool {
        match &self.upper {
            Bound::Unbounded => true,
            Bound::Included(b) => key <= b,
            Bound::Excluded(b) => key < b,
        }
    }

    /// Moves to the next qualifying key. `Ok(false)` at the upper limit.
    pub fn next(&mut self) -> Result<bool, Error> {
        let positioned = match self.state {
            CursorState::End => return Ok(false),
            CursorState::Beginning => self.seek_start()?,
            CursorState::Valid => self.step_forward()?,
        };
        if positioned && self.current.as_ref().is_some_and(|k| self.within_upper(k)) {
            self.state = CursorState::Valid;
            Ok(true)
        } else {
            self.wind_to_end();
            Ok(false)
        }
    }

    /// Moves to the previous qualifying key. `Ok(false)` at the lower limit.
    pub fn prev(&mut self) -> Result<bool, Error> {
        let positioned = match self.state {
            CursorState::Beginning => return Ok(false),
            CursorState::End => self.seek_finish()?,
            CursorState::Valid => self.step_back()?,
        };
        if positioned && self.current.as_ref().is_some_and(|k| self.within_lower(k)) {
            self.state = CursorState::Valid;
            Ok(true)
        } else {
            self.rewind();
            Ok(false)
        }
    }

    /// Positions at the first key satisfying the lower bound.
    fn seek_start(&mut self) -> Result<bool, Error> {
        let root = self.tree.root_id();
        if root == NO_BRANCH {
            return Ok(false);
        }
        match self.lower.clone() {
            Bound::Unbounded => self.descend_leftmost(root),
            Bound::Included(k) => self.seek_ge(&k),
            Bound::Excluded(k) => {
                if self.seek_ge(&k)? && self.current.as_ref() == Some(&k) {
                    self.step_forward()
                } else {
                    Ok(self.current.is_some() && !self.stack.is_empty())
                }
            }
        }
    }

    /// Positions at the last key satisfying the upper bound.
    fn seek_finish(&mut self) -> Result<bool, Error> {
        let root = self.tree.root_id();
        if root == NO_BRANCH {
            return Ok(false);
        }
        match self.upper.clone() {
            Bound::Unbounded => self.descend_rightmost(root),
            Bound::Included(k) => self.seek_le(&k),
            Bound::Excluded(k) => {
                if self.seek_le(&k)? && self.current.as_ref() == Some(&k) {
                    self.step_back()
                } else {
                    Ok(self.current.is_some() && !self.stack.is_empty())
                }
            }
        }
    }

    /// Descends to the leftmost key of the subtree at `id`, pushing onto the
    /// existing stack. Returns false on an empty (root) leaf.
    fn descend_leftmost(&mut self, mut id: BranchId) -> Result<bool, Error> {
        let mut guard = LoopGuard::default();
        loop {
            guard.step(id)?;
            let branch = self.tree.cache().load(id)?;
            let (is_leaf, first_key, first_child) = {
                let data = branch.read()?;
                (
                    data.is_leaf(),
                    data.keys.first().cloned(),
                    data.children[0],
                )
            };
            if is_leaf {
                let Some(key) = first_key else {
                    return Ok(false);
                };
                self.push_frame((branch, 0, true))?;
                self.current = Some(key);
                return Ok(true);
            }
            self.push_frame((branch, 0, false))?;
            id = first_child;
        }
    }

    fn descend_rightmost(&mut self, mut id: BranchId) -> Result<bool, Error> {
        let mut guard = LoopGuard::default();
        loop {
            guard.step(id)?;
            let branch = self.tree.cache().load(id)?;
            let (is_leaf, len, last_key, rightmost) = {
                let data = branch.read()?;
                (
                    data.is_leaf(),
                    data.len(),
                    data.keys.last().cloned(),
                    data.rightmost(),
                )
            };
            if is_leaf {
                let Some(key) = last_key else {
                    return Ok(false);
                };
                self.push_frame((branch, len - 1, true))?;
                self.current = Some(key);
                return Ok(true);
            }
            self.push_frame((branch, len, false))?;
            id = rightmost;
        }
    }

    /// Positions at the lowest key `>= k`, or reports exhaustion.
    fn seek_ge(&mut self, k: &K) -> Result<bool, Error> {
        self.stack.clear();
        let mut id = self.tree.root_id();
        let mut guard = LoopGuard::default();
        loop {
            guard.step(id)?;
            let branch = self.tree.cache().load(id)?;
            let (is_leaf, len, search, child) = {
                let data = branch.read()?;
                let search = data.keys.search(k);
                let child = if data.is_leaf() {
                    NO_BRANCH
                } else {
                    data.children[search.unwrap_or_else(|i| i)]
                };
                (data.is_leaf(), data.len(), search, child)
            };
            match search {
                Ok(i) => {
                    // exact hit; yield the stored key, not the probe (they can
                    // differ in payload fields the ordering ignores)
                    let key = branch.read()?.keys.get(i).cloned();
                    self.push_frame((branch, i, true))?;
                    self.current = key;
                    return Ok(true);
                }
                Err(i) if is_leaf => {
                    if i < len {
                        let key = branch.read()?.keys.get(i).cloned();
                        self.push_frame((branch, i, true))?;
                        self.current = key;
                        return Ok(true);
                    }
                    // every key in this leaf is < k, resume at the ancestor
                    drop(branch);
                    return self.ascend_forward();
                }
                Err(i) => {
                    self.push_frame((branch, i, false))?;
                    id = child;
                }
            }
        }
    }

    /// Positions at the highest key `<= k`, or reports exhaustion.
    fn seek_le(&mut self, k: &K) -> Result<bool, Error> {
        if !self.seek_ge(k)? {
            // everything is < k, so the last key qualifies (if any)
            self.stack.clear();
            let root = self.tree.root_id();
            if root == NO_BRANCH {
                return Ok(false);
            }
            return self.descend_rightmost(root);
        }
        if self.current.as_ref() == Some(k) {
            return Ok(true);
        }
        self.step_back()
    }

    /// In-order successor from a valid position.
    fn step_forward(&mut self) -> Result<bool, Error> {
        let Some(&(ref branch, idx, at_key)) = self.stack.last() else {
            return Ok(false);
        };
        let (is_leaf, len, next_child) = {
            let data = branch.read()?;
            let next_child = if data.is_leaf() {
                NO_BRANCH
            } else {
                data.children[idx + 1]
            };
            (data.is_leaf(), data.len(), next_child)
        };
        if is_leaf {
            if idx + 1 < len {
                let key = branch.read()?.keys.get(idx + 1).cloned();
                let top = self.stack.last_mut().unwrap();
                top.1 = idx + 1;
                self.current = key;
                return Ok(true);
            }
            self.stack.pop();
            return self.ascend_forward();
        }
        debug_assert!(at_key);
        // descend into the subtree right of the key we sit on
        let top = self.stack.last_mut().unwrap();
        top.1 = idx + 1;
        top.2 = false;
        self.descend_leftmost(next_child)
    }

    /// Pops exhausted frames until an internal branch still has an in-order
    /// key to yield.
    fn ascend_forward(&mut self) -> Result<bool, Error> {
        while let Some(&(ref branch, idx, at_key)) = self.stack.last() {
            debug_assert!(!at_key);
            let (len, key) = {
                let data = branch.read()?;
                (data.len(), data.keys.get(idx).cloned())
            };
            if idx < len {
                let top = self.stack.last_mut().unwrap();
                top.2 = true;
                self.current = key;
                return Ok(true);
            }
            self.stack.pop();
        }
        Ok(false)
    }

    /// In-order predecessor from a valid position.
    fn step_back(&mut self) -> Result<bool, Error> {
        let Some(&(ref branch, idx, _at_key)) = self.stack.last() else {
            return Ok(false);
        };
        let (is_leaf, left_child) = {
            let data = branch.read()?;
            let left_child = if data.is_leaf() {
                NO_BRANCH
            } else {
                data.children[idx]
            };
            (data.is_leaf(), left_child)
        };
        if is_leaf {
            if idx > 0 {
                let key = branch.read()?.keys.get(idx - 1).cloned();
                let top = self.stack.last_mut().unwrap();
                top.1 = idx - 1;
                self.current = key;
                return Ok(true);
            }
            self.stack.pop();
            return self.ascend_back();
        }
        // predecessor is the rightmost key under children[idx]
        let top = self.stack.last_mut().unwrap();
        top.2 = false;
        self.descend_rightmost(left_child)
    }

    fn ascend_back(&mut self) -> Result<bool, Error> {
        while let Some(&(ref branch, idx, at_key)) = self.stack.last() {
            debug_assert!(!at_key);
            if idx > 0 {
                let key = branch.read()?.keys.get(idx - 1).cloned();
                let top = self.stack.last_mut().unwrap();
                top.1 = idx - 1;
                top.2 = true;
                self.current = key;
                return Ok(true);
            }
            self.stack.pop();
        }
        Ok(false)
    }
}
