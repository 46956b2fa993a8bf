use std::{
    cell::{Cell, Ref, RefCell, RefMut},
    rc::Rc,
};

use crate::{
    error::corruption,
    key::{aligned_len, Key},
    Error, SortedVec,
};

/// Block-storage address of a branch. 0 = no child / empty tree, positive =
/// persisted block, negative = allocated in memory only.
pub type BranchId = i32;

/// The id value meaning "no child" / "empty tree".
pub const NO_BRANCH: BranchId = 0;

/// Size of a child pointer in the block layout.
pub(crate) const POINTER_SIZE: usize = 4;

/// One block's decoded in-memory form: an ordered array of keys plus
/// `len + 1` child pointers, where `children[i]` precedes `keys[i]` and the
/// last pointer is the rightmost. The unit of caching and I/O.
///
/// Identity and bookkeeping live in [`Cell`]s so they stay readable while the
/// key/pointer payload is mutably borrowed. Shared via [`BranchRef`]; dropping
/// the last reference releases the cache pin.
#[derive(Debug)]
pub struct Branch<K: Key> {
    id: Cell<BranchId>,
    dirty: Cell<bool>,
    /// Whether the branch's block holds data on disk (first flushes must
    /// write, later ones update).
    stored: Cell<bool>,
    /// Recency hint for the external eviction policy (NUR mark).
    nur: Cell<u64>,
    data: RefCell<BranchData<K>>,
}

/// Reference-counted handle to a cached branch. Cloning pins, dropping
/// releases; the manual acquire/release balance of a hand-rolled cache is
/// not reproducible here by construction.
pub type BranchRef<K> = Rc<Branch<K>>;

#[derive(Debug, Default)]
pub struct BranchData<K: Key> {
    pub keys: SortedVec<K>,
    pub children: Vec<BranchId>,
}

impl<K: Key> Branch<K> {
    pub(crate) fn new(id: BranchId, data: BranchData<K>) -> BranchRef<K> {
        Rc::new(Branch {
            id: Cell::new(id),
            dirty: Cell::new(false),
            stored: Cell::new(false),
            nur: Cell::new(0),
            data: RefCell::new(data),
        })
    }

    /// Empty leaf: no keys, a lone zero rightmost pointer.
    pub(crate) fn new_leaf(id: BranchId) -> BranchRef<K> {
        Self::new(
            id,
            BranchData {
                keys: SortedVec::new(),
                children: vec![NO_BRANCH],
            },
        )
    }

    #[inline]
    pub fn id(&self) -> BranchId {
        self.id.get()
    }

    #[inline]
    pub(crate) fn set_id(&self, id: BranchId) {
        self.id.set(id);
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty.get()
    }

    #[inline]
    pub(crate) fn set_dirty(&self, dirty: bool) {
        self.dirty.set(dirty);
    }

    #[inline]
    pub(crate) fn is_stored(&self) -> bool {
        self.stored.get()
    }

    #[inline]
    pub(crate) fn set_stored(&self, stored: bool) {
        self.stored.set(stored);
    }

    /// Recency mark last assigned by the cache.
    #[inline]
    pub fn nur_mark(&self) -> u64 {
        self.nur.get()
    }

    #[inline]
    pub(crate) fn set_nur_mark(&self, mark: u64) {
        self.nur.set(mark);
    }

    /// Immutable view of the key/pointer payload. A borrow conflict here can
    /// only come from a corrupted pointer aliasing an ancestor, so it reports
    /// as corruption rather than panicking.
    pub(crate) fn read(&self) -> Result<Ref<'_, BranchData<K>>, Error> {
        self.data
            .try_borrow()
            .map_err(|_| corruption!("branch {} aliases a branch in use", self.id.get()))
    }

    pub(crate) fn write(&self) -> Result<RefMut<'_, BranchData<K>>, Error> {
        self.data
            .try_borrow_mut()
            .map_err(|_| corruption!("branch {} aliases a branch in use", self.id.get()))
    }
}

impl<K: Key> BranchData<K> {
    #[inline]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// The child pointer following the last key.
    #[inline]
    pub fn rightmost(&self) -> BranchId {
        *self.children.last().unwrap()
    }

    /// A branch is a leaf iff its pointers are all zero. Mixed zero/non-zero
    /// pointers are rejected at decode time.
    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.children[0] == NO_BRANCH
    }

    /// On-disk size of this branch's payload.
    pub fn encoded_len(&self) -> usize {
        POINTER_SIZE + self.keys.len() * (POINTER_SIZE + aligned_len::<K>())
    }

    /// Encodes the block byte layout: a 4 byte rightmost child pointer
    /// followed by `len` repetitions of (4 byte child pointer, key bytes
    /// rounded to 4 byte alignment). All integers little endian.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        debug_assert_eq!(self.children.len(), self.keys.len() + 1);
        buf.clear();
        buf.reserve(self.encoded_len());
        buf.extend_from_slice(&self.rightmost().to_le_bytes());
        let key_len = aligned_len::<K>();
        for (key, &child) in self.keys.iter().zip(self.children.iter()) {
            buf.extend_from_slice(&child.to_le_bytes());
            let at = buf.len();
            buf.resize(at + key_len, 0);
            key.write_bytes(&mut buf[at..at + K::LEN]);
        }
    }

    /// Decodes a block previously produced by [`Self::encode_into`]. The key
    /// count derives from the data length; anything that doesn't divide
    /// cleanly, or a branch mixing zero and non-zero pointers, is corruption.
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let entry_size = POINTER_SIZE + aligned_len::<K>();
        if bytes.len() < POINTER_SIZE || (bytes.len() - POINTER_SIZE) % entry_size != 0 {
            return Err(corruption!(
                "bad branch block length {} for entry size {entry_size}",
                bytes.len()
            ));
        }
        let len = (bytes.len() - POINTER_SIZE) / entry_size;
        let rightmost = BranchId::from_le_bytes(bytes[..POINTER_SIZE].try_into().unwrap());

        let mut keys = SortedVec::new();
        keys.reserve(len)?;
        let mut children = Vec::new();
        children.try_reserve_exact(len + 1)?;
        let mut prev: Option<K> = None;
        for i in 0..len {
            let at = POINTER_SIZE + i * entry_size;
            let child = BranchId::from_le_bytes(bytes[at..at + POINTER_SIZE].try_into().unwrap());
            let key = K::read_bytes(&bytes[at + POINTER_SIZE..at + POINTER_SIZE + K::LEN]);
            if prev.as_ref().is_some_and(|p| p >= &key) {
                return Err(corruption!("branch keys out of order at entry {i}"));
            }
            children.push(child);
            keys.insert_at(i, key.clone())?;
            prev = Some(key);
        }
        children.push(rightmost);

        let zeros = children.iter().filter(|&&c| c == NO_BRANCH).count();
        if zeros != 0 && zeros != children.len() {
            return Err(corruption!(
                "branch mixes {zeros} leaf and {} child pointers",
                children.len() - zeros
            ));
        }
        Ok(Self { keys, children })
    }
}

/// Branch key capacity (`BTreeSize`) for the given block size: the largest
/// key count whose encoded form still fits in one block.
pub(crate) fn max_keys<K: Key>(block_size: usize) -> usize {
    block_size.saturating_sub(POINTER_SIZE) / (POINTER_SIZE + aligned_len::<K>())
}

/// Block size needed for a branch of `keys` keys of type `K`. Handy for
/// tests that want a specific `BTreeSize`.
pub fn block_size_for<K: Key>(keys: usize) -> usize {
    POINTER_SIZE + keys * (POINTER_SIZE + aligned_len::<K>())
}
