use crate::{Error, Key};

/// Capacity grows by doubling up to this many elements, then linearly.
const DOUBLING_LIMIT: usize = 1024;

/// Growable contiguous sorted sequence with set semantics.
///
/// Elements are kept sorted ascending and unique. Every growth point goes
/// through fallible allocation and fails with [`Error::OutOfMemory`] leaving
/// the vector in its prior valid state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortedVec<K: Key> {
    items: Vec<K>,
}

// not derived, a derive would demand K: Default
impl<K: Key> Default for SortedVec<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Key> SortedVec<K> {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.items.capacity()
    }

    #[inline]
    pub fn as_slice(&self) -> &[K] {
        &self.items
    }

    #[inline]
    pub fn get(&self, idx: usize) -> Option<&K> {
        self.items.get(idx)
    }

    #[inline]
    pub fn first(&self) -> Option<&K> {
        self.items.first()
    }

    #[inline]
    pub fn last(&self) -> Option<&K> {
        self.items.last()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, K> {
        self.items.iter()
    }

    /// Grows capacity to at least `required`. Never shrinks.
    pub fn reserve(&mut self, required: usize) -> Result<(), Error> {
        if required <= self.items.capacity() {
            return Ok(());
        }
        let target = if required <= DOUBLING_LIMIT {
            required.next_power_of_two()
        } else {
            required
        };
        self.items
            .try_reserve_exact(target - self.items.len())
            .map_err(Error::from)
    }

    #[inline]
    fn grow_for_one(&mut self) -> Result<(), Error> {
        if self.items.len() == self.items.capacity() {
            let want = if self.items.capacity() < DOUBLING_LIMIT {
                (self.items.capacity() * 2).max(4)
            } else {
                self.items.capacity() + DOUBLING_LIMIT
            };
            self.items.try_reserve_exact(want - self.items.len())?;
        }
        Ok(())
    }

    /// Lowest index `i` such that `self[i] >= item`; `Ok` when `self[i] == item`.
    #[inline]
    pub fn search(&self, item: &K) -> Result<usize, usize> {
        let idx = self.items.partition_point(|x| x < item);
        match self.items.get(idx) {
            Some(x) if x == item => Ok(idx),
            _ => Err(idx),
        }
    }

    /// Set insert: no-op if an equal element already exists.
    /// Returns whether the element was inserted.
    pub fn insert(&mut self, item: K) -> Result<bool, Error> {
        match self.search(&item) {
            Ok(_) => Ok(false),
            Err(idx) => {
                self.insert_at(idx, item)?;
                Ok(true)
            }
        }
    }

    /// Positional insert for callers that already located the slot.
    pub fn insert_at(&mut self, idx: usize, item: K) -> Result<(), Error> {
        debug_assert!(idx == 0 || self.items[idx - 1] < item);
        debug_assert!(idx >= self.items.len() || item < self.items[idx]);
        self.grow_for_one()?;
        self.items.insert(idx, item);
        Ok(())
    }

    /// Replaces the element at `idx`, dropping the old one. The replacement
    /// must still order between its neighbors; it need not compare equal to
    /// the displaced element (a separator swapped for a subtree's successor
    /// doesn't, a key overwritten with a new payload does).
    pub fn replace(&mut self, idx: usize, item: K) {
        debug_assert!(idx == 0 || self.items[idx - 1] < item);
        debug_assert!(idx + 1 >= self.items.len() || item < self.items[idx + 1]);
        self.items[idx] = item;
    }

    /// Transfers the element at `idx` out without destructing it.
    pub fn remove(&mut self, idx: usize) -> K {
        self.items.remove(idx)
    }

    /// Destructs and removes `count` elements starting at `idx`.
    pub fn delete(&mut self, idx: usize, count: usize) {
        self.items.drain(idx..idx + count);
    }

    /// Sorts and deduplicates equal-comparing elements. Unlike the growing
    /// operations this cannot fail: the in-place sort needs no scratch
    /// allocation.
    pub fn sort(&mut self) {
        self.items.sort_unstable();
        self.items.dedup();
    }

    /// Splits off the tail starting at `idx` into a new vector.
    pub fn split_off(&mut self, idx: usize) -> Result<Self, Error> {
        let mut tail = Self::new();
        tail.reserve(self.items.len() - idx)?;
        tail.items.extend(self.items.drain(idx..));
        Ok(tail)
    }

    /// Appends `other`, whose elements must all be greater than `self.last()`.
    pub fn append(&mut self, other: &mut Self) -> Result<(), Error> {
        debug_assert!(match (self.last(), other.first()) {
            (Some(a), Some(b)) => a < b,
            _ => true,
        });
        self.reserve(self.items.len() + other.items.len())?;
        self.items.append(&mut other.items);
        Ok(())
    }

    /// Merges `other` into `self` (sorted union), O(n+m).
    pub fn unite(&mut self, other: &Self) -> Result<(), Error> {
        *self = Self::united(self, other)?;
        Ok(())
    }

    /// Keeps only elements also present in `other`, O(n+m).
    pub fn intersect(&mut self, other: &Self) -> Result<(), Error> {
        let mut keep = 0;
        let mut j = 0;
        for i in 0..self.items.len() {
            while j < other.items.len() && other.items[j] < self.items[i] {
                j += 1;
            }
            if j < other.items.len() && other.items[j] == self.items[i] {
                self.items.swap(keep, i);
                keep += 1;
            }
        }
        self.items.truncate(keep);
        Ok(())
    }

    /// Removes every element present in `other`, O(n+m).
    pub fn differ(&mut self, other: &Self) -> Result<(), Error> {
        let mut keep = 0;
        let mut j = 0;
        for i in 0..self.items.len() {
            while j < other.items.len() && other.items[j] < self.items[i] {
                j += 1;
            }
            if j >= other.items.len() || other.items[j] != self.items[i] {
                self.items.swap(keep, i);
                keep += 1;
            }
        }
        self.items.truncate(keep);
        Ok(())
    }

    /// Sorted union of two vectors, O(n+m).
    pub fn united(a: &Self, b: &Self) -> Result<Self, Error> {
        let mut out = Self::new();
        out.reserve(a.len() + b.len())?;
        let (mut i, mut j) = (0, 0);
        while i < a.items.len() && j < b.items.len() {
            match a.items[i].cmp(&b.items[j]) {
                std::cmp::Ordering::Less => {
                    out.items.push(a.items[i].clone());
                    i += 1;
                }
                std::cmp::Ordering::Greater => {
                    out.items.push(b.items[j].clone());
                    j += 1;
                }
                std::cmp::Ordering::Equal => {
                    out.items.push(a.items[i].clone());
                    i += 1;
                    j += 1;
                }
            }
        }
        out.items.extend(a.items[i..].iter().cloned());
        out.items.extend(b.items[j..].iter().cloned());
        Ok(out)
    }

    /// Sorted intersection of two vectors, O(n+m).
    pub fn intersected(a: &Self, b: &Self) -> Result<Self, Error> {
        let mut out = a.clone();
        out.intersect(b)?;
        Ok(out)
    }

    /// Elements of `a` absent from `b`, O(n+m).
    pub fn differed(a: &Self, b: &Self) -> Result<Self, Error> {
        let mut out = a.clone();
        out.differ(b)?;
        Ok(out)
    }

    /// Drops every element rejected by `pred`. In-place compaction;
    /// maintenance-time only, not a query path.
    pub fn retain(&mut self, pred: impl FnMut(&K) -> bool) {
        self.items.retain(pred);
    }

    /// Estimate of memory held by this vector.
    pub fn mem_estimate(&self) -> usize {
        self.items.capacity() * std::mem::size_of::<K>()
            + self.items.iter().map(|k| k.mem_estimate()).sum::<usize>()
    }
}

impl<K: Key> TryFrom<Vec<K>> for SortedVec<K> {
    type Error = Error;

    /// Takes ownership of an arbitrary vector, sorting and deduplicating it.
    fn try_from(items: Vec<K>) -> Result<Self, Error> {
        let mut v = Self { items };
        v.sort();
        Ok(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_iter(it: impl IntoIterator<Item = u32>) -> SortedVec<u32> {
        let mut v = SortedVec::new();
        for i in it {
            v.insert(i).unwrap();
        }
        v
    }

    #[test]
    fn insert_is_idempotent() {
        let mut v = SortedVec::new();
        assert!(v.insert(5u32).unwrap());
        assert!(v.insert(1).unwrap());
        assert!(!v.insert(5).unwrap());
        assert_eq!(v.as_slice(), &[1, 5]);
    }

    #[test]
    fn search_is_lower_bound() {
        let v = from_iter([10u32, 20, 30]);
        assert_eq!(v.search(&10), Ok(0));
        assert_eq!(v.search(&15), Err(1));
        assert_eq!(v.search(&30), Ok(2));
        assert_eq!(v.search(&31), Err(3));
    }

    #[test]
    fn remove_vs_delete() {
        let mut v = from_iter([1u32, 2, 3, 4, 5]);
        assert_eq!(v.remove(1), 2);
        v.delete(1, 2);
        assert_eq!(v.as_slice(), &[1, 5]);
    }

    #[test]
    fn replace_keeps_neighbor_order() {
        let mut v = from_iter([10u32, 20, 30]);
        // an unequal replacement is fine as long as it still fits the slot
        v.replace(1, 25);
        assert_eq!(v.as_slice(), &[10, 25, 30]);
        v.replace(0, 5);
        v.replace(2, 99);
        assert_eq!(v.as_slice(), &[5, 25, 99]);
    }

    #[test]
    fn default_without_default_keys() {
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
        struct NoDefault(u32);
        impl Key for NoDefault {
            const LEN: usize = 4;
            fn write_bytes(&self, buf: &mut [u8]) {
                buf[..4].copy_from_slice(&self.0.to_le_bytes());
            }
            fn read_bytes(buf: &[u8]) -> Self {
                Self(u32::from_le_bytes(buf[..4].try_into().unwrap()))
            }
        }
        let mut v = SortedVec::<NoDefault>::default();
        v.insert(NoDefault(1)).unwrap();
        assert_eq!(std::mem::take(&mut v).len(), 1);
        assert!(v.is_empty());
    }

    #[test]
    fn sort_dedups() {
        let mut v: SortedVec<u32> = SortedVec::try_from(vec![3u32, 1, 3, 2, 1]).unwrap();
        assert_eq!(v.as_slice(), &[1, 2, 3]);
        v.sort();
        assert_eq!(v.as_slice(), &[1, 2, 3]);
    }

    #[test]
    fn set_operations() {
        let a = from_iter([1u32, 3, 5, 7]);
        let b = from_iter([2u32, 3, 4, 7]);
        assert_eq!(
            SortedVec::united(&a, &b).unwrap().as_slice(),
            &[1, 2, 3, 4, 5, 7]
        );
        assert_eq!(SortedVec::intersected(&a, &b).unwrap().as_slice(), &[3, 7]);
        assert_eq!(SortedVec::differed(&a, &b).unwrap().as_slice(), &[1, 5]);

        let disjoint = from_iter([100u32, 200]);
        assert!(SortedVec::intersected(&a, &disjoint).unwrap().is_empty());
        assert_eq!(SortedVec::differed(&a, &disjoint).unwrap(), a);
    }

    #[test]
    fn retain_filters() {
        let mut v = from_iter(0u32..10);
        v.retain(|k| k % 3 == 0);
        assert_eq!(v.as_slice(), &[0, 3, 6, 9]);
    }

    #[test]
    fn split_and_append() {
        let mut v = from_iter(1u32..=6);
        let mut tail = v.split_off(3).unwrap();
        assert_eq!(v.as_slice(), &[1, 2, 3]);
        assert_eq!(tail.as_slice(), &[4, 5, 6]);
        v.append(&mut tail).unwrap();
        assert_eq!(v.as_slice(), &[1, 2, 3, 4, 5, 6]);
        assert!(tail.is_empty());
    }

    #[test]
    fn reserve_never_shrinks() {
        let mut v = from_iter(1u32..=100);
        let cap = v.capacity();
        v.reserve(1).unwrap();
        assert!(v.capacity() >= cap);
        v.reserve(5000).unwrap();
        assert!(v.capacity() >= 5000);
    }
}
