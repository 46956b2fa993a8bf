use std::{collections::BTreeSet, ops::Bound};

use rand::{rngs::SmallRng, Rng, SeedableRng};

use crate::*;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn get_rng() -> SmallRng {
    let seed = std::env::var("SEED")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(rand::random);
    eprintln!("Using seed {seed}");
    SmallRng::seed_from_u64(seed)
}

fn small_cache(keys_per_branch: usize) -> BranchCache<u32> {
    BranchCache::new(Box::new(MemStorage::new(block_size_for::<u32>(
        keys_per_branch,
    ))))
    .unwrap()
}

fn contents(tree: &BTree<u32>) -> Vec<u32> {
    let mut iter = tree.iter();
    iter.collect_forward().unwrap()
}

#[test]
fn insert_splits_root_in_place() {
    init_logging();
    let cache = small_cache(3);
    let mut tree = BTree::new(&cache);
    for key in [5u32, 1, 3, 2, 4] {
        assert!(tree.insert(key, false).unwrap());
    }
    assert!(!tree.insert(3, false).unwrap());
    assert_eq!(contents(&tree), vec![1, 2, 3, 4, 5]);
    // 5 keys don't fit one branch of 3, so the root must have split
    let root = cache.load(tree.root_id()).unwrap();
    assert!(!root.read().unwrap().is_leaf());
    tree.check_consistency(false).unwrap();
}

#[test]
fn ge_scan_runs_to_the_end() {
    let cache = small_cache(3);
    let mut tree = BTree::new(&cache);
    for key in 1u32..=10 {
        tree.insert(key, false).unwrap();
    }
    let mut iter = tree.select(SearchOp::GreaterOrEqual, &7);
    for expected in 7u32..=10 {
        assert!(iter.next().unwrap());
        assert_eq!(iter.get(), Some(&expected));
    }
    assert!(!iter.next().unwrap());
    assert_eq!(iter.get(), None);
}

#[test]
fn select_operators() {
    let cache = small_cache(3);
    let mut tree = BTree::new(&cache);
    for key in (1u32..=10).map(|k| k * 2) {
        tree.insert(key, false).unwrap();
    }

    let mut lt = tree.select(SearchOp::Less, &8);
    assert!(lt.prev().unwrap());
    assert_eq!(lt.get(), Some(&6));

    let mut le = tree.select(SearchOp::LessOrEqual, &8);
    assert!(le.prev().unwrap());
    assert_eq!(le.get(), Some(&8));

    let mut eq = tree.select(SearchOp::Equal, &8);
    assert!(eq.next().unwrap());
    assert_eq!(eq.get(), Some(&8));
    assert!(!eq.next().unwrap());

    let mut missing = tree.select(SearchOp::Equal, &9);
    assert!(!missing.next().unwrap());

    let mut gt = tree.select(SearchOp::Greater, &8);
    assert!(gt.next().unwrap());
    assert_eq!(gt.get(), Some(&10));

    // a Le iterator starts past its end and is walked backwards
    let mut le = tree.select(SearchOp::LessOrEqual, &7);
    let mut down = Vec::new();
    while le.prev().unwrap() {
        down.push(*le.get().unwrap());
    }
    assert_eq!(down, vec![6, 4, 2]);
}

#[test]
fn lookup_exact_and_nearest() {
    let cache = small_cache(3);
    let mut tree = BTree::new(&cache);
    assert_eq!(tree.lookup(&5).unwrap(), Lookup::None);
    for key in (1u32..=5).map(|k| k * 2) {
        tree.insert(key, false).unwrap();
    }
    assert_eq!(tree.lookup(&4).unwrap(), Lookup::Found(4));
    assert_eq!(tree.lookup(&5).unwrap(), Lookup::Nearest(6));
    assert_eq!(tree.lookup(&11).unwrap(), Lookup::None);
}

#[test]
fn first_last_clear() {
    let cache = small_cache(3);
    let mut tree = BTree::new(&cache);
    assert!(tree.is_empty());
    assert_eq!(tree.first().unwrap(), None);
    assert_eq!(tree.last().unwrap(), None);
    for key in [5u32, 1, 9, 7, 3] {
        tree.insert(key, false).unwrap();
    }
    assert_eq!(tree.first().unwrap(), Some(1));
    assert_eq!(tree.last().unwrap(), Some(9));
    tree.clear().unwrap();
    assert!(tree.is_empty());
    assert!(cache.is_empty());
    assert_eq!(contents(&tree), Vec::<u32>::new());
}

#[test]
fn delete_in_random_orders() {
    init_logging();
    let mut rng = get_rng();
    for _ in 0..10 {
        let cache = small_cache(3);
        let mut tree = BTree::new(&cache);
        let mut keys: Vec<u32> = (1..=50).collect();
        for &key in &keys {
            tree.insert(key, false).unwrap();
        }
        // Fisher-Yates, avoiding a shuffle adapter dependency on rand features
        for i in (1..keys.len()).rev() {
            keys.swap(i, rng.random_range(0..=i));
        }
        for (i, key) in keys.iter().enumerate() {
            assert!(tree.delete(key).unwrap());
            assert!(!tree.delete(key).unwrap());
            if i % 7 == 0 {
                tree.check_consistency(false).unwrap();
            }
        }
        assert!(tree.is_empty());
        assert!(cache.is_empty());
    }
}

#[test]
fn delete_internal_separator() {
    init_logging();
    let cache = small_cache(3);
    let mut tree = BTree::new(&cache);
    for key in 1u32..=20 {
        tree.insert(key, false).unwrap();
    }
    // a separator is replaced by its in-order successor, which then gets
    // deleted from its leaf
    let separator = {
        let root = cache.load(tree.root_id()).unwrap();
        let data = root.read().unwrap();
        assert!(!data.is_leaf());
        *data.keys.first().unwrap()
    };
    assert!(tree.delete(&separator).unwrap());
    tree.check_consistency(false).unwrap();
    let expected: Vec<u32> = (1..=20).filter(|&k| k != separator).collect();
    assert_eq!(contents(&tree), expected);
}

#[test]
fn delete_range_relocates() {
    let cache = small_cache(3);
    let mut tree = BTree::new(&cache);
    for key in 1u32..=20 {
        tree.insert(key, false).unwrap();
    }
    let removed = tree
        .delete_range((Bound::Included(5), Bound::Excluded(15)))
        .unwrap();
    assert_eq!(removed, 10);
    let expected: Vec<u32> = (1..5).chain(15..=20).collect();
    assert_eq!(contents(&tree), expected);
    tree.check_consistency(false).unwrap();

    assert_eq!(
        tree.delete_range((Bound::Unbounded, Bound::Unbounded)).unwrap(),
        10
    );
    assert!(tree.is_empty());
}

/// Key with a payload the ordering ignores, as an index entry would carry.
#[derive(Debug, Clone, Copy)]
struct Rec {
    id: u32,
    payload: u32,
}

impl PartialEq for Rec {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Rec {}

impl PartialOrd for Rec {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Rec {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.id.cmp(&other.id)
    }
}

impl Key for Rec {
    const LEN: usize = 8;

    fn write_bytes(&self, buf: &mut [u8]) {
        buf[..4].copy_from_slice(&self.id.to_le_bytes());
        buf[4..8].copy_from_slice(&self.payload.to_le_bytes());
    }

    fn read_bytes(buf: &[u8]) -> Self {
        Self {
            id: u32::from_le_bytes(buf[..4].try_into().unwrap()),
            payload: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
        }
    }
}

#[test]
fn overwrite_replaces_payload() {
    let cache: BranchCache<Rec> =
        BranchCache::new(Box::new(MemStorage::new(block_size_for::<Rec>(3)))).unwrap();
    let mut tree = BTree::new(&cache);
    for id in 1u32..=9 {
        tree.insert(Rec { id, payload: id * 10 }, false).unwrap();
    }

    let payload_of = |tree: &BTree<Rec>, id: u32| match tree
        .lookup(&Rec { id, payload: 0 })
        .unwrap()
    {
        Lookup::Found(rec) => rec.payload,
        other => panic!("expected to find {id}, got {other:?}"),
    };

    // without overwrite an equal key is left alone
    assert!(!tree.insert(Rec { id: 5, payload: 999 }, false).unwrap());
    assert_eq!(payload_of(&tree, 5), 50);
    // with overwrite the stored payload changes
    assert!(!tree.insert(Rec { id: 5, payload: 999 }, true).unwrap());
    assert_eq!(payload_of(&tree, 5), 999);
}

#[test]
fn persistence_roundtrip_mem() {
    let cache = small_cache(3);
    let mut tree = BTree::new(&cache);
    for key in [5u32, 1, 3, 2, 4, 9, 8, 7, 6] {
        tree.insert(key, false).unwrap();
    }
    let root = tree.commit().unwrap();
    assert!(root > 0);
    drop(tree);

    let cache = BranchCache::new(cache.into_storage()).unwrap();
    let tree = BTree::open(&cache, root);
    assert_eq!(contents(&tree), (1..=9).collect::<Vec<u32>>());
    tree.check_consistency(true).unwrap();
}

#[test]
fn persistence_roundtrip_file() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("index");
    let block_size = block_size_for::<u32>(4);
    let root;
    {
        let cache: BranchCache<u32> =
            BranchCache::new(Box::new(FileStorage::open(&path, block_size).unwrap())).unwrap();
        let mut tree = BTree::new(&cache);
        for key in (1u32..=100).rev() {
            tree.insert(key * 3, false).unwrap();
        }
        tree.delete(&30).unwrap();
        root = tree.commit().unwrap();
    }

    let cache: BranchCache<u32> =
        BranchCache::new(Box::new(FileStorage::open(&path, block_size).unwrap())).unwrap();
    let tree = BTree::open(&cache, root);
    let expected: Vec<u32> = (1..=100).map(|k| k * 3).filter(|&k| k != 30).collect();
    assert_eq!(contents(&tree), expected);
    tree.check_consistency(true).unwrap();
}

#[test]
fn rollback_restores_committed_state() {
    let cache = small_cache(3);
    let mut tree = BTree::new(&cache);
    for key in 1u32..=10 {
        tree.insert(key, false).unwrap();
    }
    let root = tree.commit().unwrap();

    for key in 11u32..=30 {
        tree.insert(key, false).unwrap();
    }
    tree.delete(&1).unwrap();
    assert_ne!(contents(&tree), (1..=10).collect::<Vec<u32>>());

    cache.rollback().unwrap();
    tree.renew(root);
    assert_eq!(contents(&tree), (1..=10).collect::<Vec<u32>>());
    tree.check_consistency(true).unwrap();
}

#[test]
fn pointer_loop_reads_as_corruption() {
    let cache = small_cache(3);
    let mut tree = BTree::new(&cache);
    for key in 1u32..=10 {
        tree.insert(key, false).unwrap();
    }
    let root = tree.commit().unwrap();
    drop(tree);

    // redirect the root's first child pointer back at the root itself
    let mut storage = cache.into_storage();
    let mut block = Vec::new();
    storage.read(root, &mut block).unwrap();
    block[4..8].copy_from_slice(&root.to_le_bytes());
    storage.update(root, &block).unwrap();

    let cache: BranchCache<u32> = BranchCache::new(storage).unwrap();
    let tree = BTree::open(&cache, root);
    let mut iter = tree.iter();
    assert!(matches!(iter.next(), Err(Error::Corruption(_))));
    assert!(matches!(
        tree.check_consistency(false),
        Err(Error::Corruption(_))
    ));
}

#[test]
fn rightmost_loop_cannot_hang_iteration() {
    let cache = small_cache(3);
    let mut tree = BTree::new(&cache);
    for key in 1u32..=10 {
        tree.insert(key, false).unwrap();
    }
    let root = tree.commit().unwrap();
    drop(tree);

    // redirect the root's rightmost pointer back at the root: no single
    // descent revisits a branch, only the walk as a whole does
    let mut storage = cache.into_storage();
    let mut block = Vec::new();
    storage.read(root, &mut block).unwrap();
    block[..4].copy_from_slice(&root.to_le_bytes());
    storage.update(root, &block).unwrap();

    let cache: BranchCache<u32> = BranchCache::new(storage).unwrap();
    let tree = BTree::open(&cache, root);
    let mut iter = tree.iter();
    let mut steps = 0usize;
    let err = loop {
        match iter.next() {
            Ok(true) => steps += 1,
            Ok(false) => panic!("iteration ended cleanly over a looped tree"),
            Err(err) => break err,
        }
        assert!(steps < 100_000, "iteration did not terminate");
    };
    assert!(matches!(err, Error::Corruption(_)));
    assert!(matches!(
        tree.check_consistency(false),
        Err(Error::Corruption(_))
    ));
}

#[test]
fn tree_set_algebra() {
    let even_cache = small_cache(3);
    let mut evens = BTree::new(&even_cache);
    for key in (0u32..50).map(|k| k * 2) {
        evens.insert(key, false).unwrap();
    }
    let third_cache = small_cache(4);
    let mut thirds = BTree::new(&third_cache);
    for key in (0u32..34).map(|k| k * 3) {
        thirds.insert(key, false).unwrap();
    }

    let mut sixths = evens.iter().and(thirds.iter()).unwrap();
    let expected: Vec<u32> = (0..17).map(|k| k * 6).collect();
    assert_eq!(sixths.collect_forward().unwrap(), expected);

    let extras = [7u32, 8, 9];
    let mut combined = evens
        .range(Bound::Included(0), Bound::Excluded(12))
        .or(ResultIter::over_slice(&extras))
        .and_not(thirds.iter())
        .filter(|k| k % 2 == 0)
        .unwrap();
    assert_eq!(combined.collect_forward().unwrap(), vec![2, 4, 8, 10]);
}

#[test]
fn random_model() {
    init_logging();
    let mut rng = get_rng();
    let cache = small_cache(4);
    let mut tree = BTree::new(&cache);
    let mut model = BTreeSet::new();
    for round in 0..100 {
        for _ in 0..25 {
            let key = rng.random_range(0u32..400);
            if rng.random_bool(0.6) {
                assert_eq!(tree.insert(key, false).unwrap(), model.insert(key));
            } else {
                assert_eq!(tree.delete(&key).unwrap(), model.remove(&key));
            }
        }
        if round % 10 == 0 {
            tree.check_consistency(false).unwrap();
            assert_eq!(contents(&tree), model.iter().copied().collect::<Vec<_>>());
            let probe = rng.random_range(0u32..400);
            let expected = match model.range(probe..).next() {
                Some(&found) if found == probe => Lookup::Found(found),
                Some(&next) => Lookup::Nearest(next),
                None => Lookup::None,
            };
            assert_eq!(tree.lookup(&probe).unwrap(), expected);
        }
    }
    tree.check_consistency(false).unwrap();

    let mut back = Vec::new();
    let mut iter = tree.iter_back();
    while iter.prev().unwrap() {
        back.push(*iter.get().unwrap());
    }
    back.reverse();
    assert_eq!(back, model.iter().copied().collect::<Vec<_>>());
}

#[test]
fn random_model_with_commits() {
    init_logging();
    let mut rng = get_rng();
    let cache = small_cache(3);
    let mut tree = BTree::new(&cache);
    let mut model = BTreeSet::new();
    let mut committed = model.clone();
    let mut root = NO_BRANCH;
    for _ in 0..50 {
        for _ in 0..10 {
            let key = rng.random_range(0u32..200);
            if rng.random_bool(0.7) {
                tree.insert(key, false).unwrap();
                model.insert(key);
            } else {
                tree.delete(&key).unwrap();
                model.remove(&key);
            }
        }
        if rng.random_bool(0.5) {
            root = tree.commit().unwrap();
            committed = model.clone();
            tree.check_consistency(true).unwrap();
        } else {
            cache.rollback().unwrap();
            tree.renew(root);
            model = committed.clone();
        }
        assert_eq!(contents(&tree), model.iter().copied().collect::<Vec<_>>());
    }
}

mod sorted_vec_laws {
    use super::*;
    use proptest::prelude::*;

    fn materialize(items: Vec<u32>) -> (SortedVec<u32>, BTreeSet<u32>) {
        let set: BTreeSet<u32> = items.iter().copied().collect();
        (SortedVec::try_from(items).unwrap(), set)
    }

    proptest! {
        #[test]
        fn set_algebra_matches_btreeset(
            a in proptest::collection::vec(0u32..64, 0..48),
            b in proptest::collection::vec(0u32..64, 0..48),
        ) {
            let (va, sa) = materialize(a);
            let (vb, sb) = materialize(b);
            let united = SortedVec::united(&va, &vb).unwrap();
            prop_assert_eq!(
                united.as_slice(),
                &sa.union(&sb).copied().collect::<Vec<_>>()[..]
            );
            let intersected = SortedVec::intersected(&va, &vb).unwrap();
            prop_assert_eq!(
                intersected.as_slice(),
                &sa.intersection(&sb).copied().collect::<Vec<_>>()[..]
            );
            let differed = SortedVec::differed(&va, &vb).unwrap();
            prop_assert_eq!(
                differed.as_slice(),
                &sa.difference(&sb).copied().collect::<Vec<_>>()[..]
            );
        }

        #[test]
        fn in_place_matches_functional(
            a in proptest::collection::vec(0u32..64, 0..48),
            b in proptest::collection::vec(0u32..64, 0..48),
        ) {
            let (va, _) = materialize(a);
            let (vb, _) = materialize(b);
            let mut u = va.clone();
            u.unite(&vb).unwrap();
            prop_assert_eq!(&u, &SortedVec::united(&va, &vb).unwrap());
            let mut i = va.clone();
            i.intersect(&vb).unwrap();
            prop_assert_eq!(&i, &SortedVec::intersected(&va, &vb).unwrap());
            let mut d = va.clone();
            d.differ(&vb).unwrap();
            prop_assert_eq!(&d, &SortedVec::differed(&va, &vb).unwrap());
        }
    }
}

mod iterator_laws {
    use super::*;
    use proptest::prelude::*;

    fn over_sets(
        a: &BTreeSet<u32>,
        b: &BTreeSet<u32>,
    ) -> (Vec<u32>, Vec<u32>) {
        (
            a.iter().copied().collect(),
            b.iter().copied().collect(),
        )
    }

    /// Walks `iter` with a random mix of next/prev and mirrors every move on
    /// a model slice, comparing positions throughout.
    fn walk_both_ways(mut iter: ResultIter<'_, u32>, model: &[u32], seed: u64) {
        let mut rng = SmallRng::seed_from_u64(seed);
        // -1 = beginning, model.len() = end
        let mut at: isize = -1;
        for _ in 0..model.len() * 4 + 16 {
            if rng.random_bool(0.6) {
                let moved = iter.next().unwrap();
                at = (at + 1).min(model.len() as isize);
                assert_eq!(moved, at < model.len() as isize);
                if !moved {
                    at = model.len() as isize;
                }
            } else {
                let moved = iter.prev().unwrap();
                at = (at - 1).max(-1);
                assert_eq!(moved, at >= 0);
                if !moved {
                    at = -1;
                }
            }
            let expected = usize::try_from(at).ok().and_then(|i| model.get(i));
            assert_eq!(iter.get(), expected);
        }
    }

    proptest! {
        #[test]
        fn composites_match_set_algebra(
            a in proptest::collection::btree_set(0u32..48, 0..32),
            b in proptest::collection::btree_set(0u32..48, 0..32),
            seed in any::<u64>(),
        ) {
            let (va, vb) = over_sets(&a, &b);

            let union: Vec<u32> = a.union(&b).copied().collect();
            let or = ResultIter::over_slice(&va).or(ResultIter::over_slice(&vb));
            walk_both_ways(or, &union, seed);

            let inter: Vec<u32> = a.intersection(&b).copied().collect();
            let and = ResultIter::over_slice(&va)
                .and(ResultIter::over_slice(&vb))
                .unwrap();
            walk_both_ways(and, &inter, seed);

            let diff: Vec<u32> = a.difference(&b).copied().collect();
            let and_not = ResultIter::over_slice(&va).and_not(ResultIter::over_slice(&vb));
            walk_both_ways(and_not, &diff, seed);

            let filtered: Vec<u32> = a.iter().copied().filter(|k| k % 3 != 0).collect();
            let filter = ResultIter::over_slice(&va).filter(|k| k % 3 != 0).unwrap();
            walk_both_ways(filter, &filtered, seed);
        }
    }
}
