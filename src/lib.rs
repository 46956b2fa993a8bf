//! Embedded B-tree index engine over transactional block storage.
//!
//! A [`BTree`] keeps an ordered set of fixed-size keys in branches of
//! `BTreeSize` keys each, where `BTreeSize` derives from the storage block
//! size. Branches are decoded on demand into a [`BranchCache`] and written
//! back when the cache commits; all mutations between two commits form one
//! storage transaction.
//!
//! Queries return [`ResultIter`]s: lazy bidirectional iterators over the
//! key order that compose into set algebra (union, intersection, difference,
//! filtering) without materializing intermediate results.
//!
//! ```
//! use blocktree::{BTree, BranchCache, MemStorage, SearchOp};
//!
//! # fn main() -> Result<(), blocktree::Error> {
//! let cache = BranchCache::new(Box::new(MemStorage::new(4096)))?;
//! let mut tree = BTree::<u32>::new(&cache);
//! for key in [5, 1, 3, 2, 4] {
//!     tree.insert(key, false)?;
//! }
//! {
//!     let mut ge3 = tree.select(SearchOp::GreaterOrEqual, &3);
//!     assert!(ge3.next()?);
//!     assert_eq!(ge3.get(), Some(&3));
//! }
//! let root = tree.commit()?;
//! # let _ = root;
//! # Ok(())
//! # }
//! ```

#[macro_use]
extern crate derive_more;
#[macro_use]
extern crate log;

mod branch;
mod cache;
mod cursor;
mod error;
mod key;
mod results;
mod storage;
mod tree;
mod utils;
mod vector;

#[cfg(test)]
mod tests;

pub use crate::{
    branch::{block_size_for, Branch, BranchId, BranchRef, NO_BRANCH},
    cache::BranchCache,
    error::Error,
    key::Key,
    results::ResultIter,
    storage::{BlockId, BlockStorage, FileStorage, MemStorage},
    tree::{BTree, Lookup, SearchOp},
    vector::SortedVec,
};
