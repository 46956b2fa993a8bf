use crate::{cursor::TreeCursor, Error, Key};

/// Lazy bidirectional iterator over an ordered key sequence, composable with
/// set algebra without materializing results.
///
/// The position moves through a Beginning → valid → End state machine:
/// [`next`](Self::next)/[`prev`](Self::prev) return `Ok(false)` at the
/// limits and [`get`](Self::get) is defined only in a valid position.
/// Iterating past End and then calling `prev` resumes from the last element
/// (and symmetrically at Beginning).
///
/// Composite variants exclusively own their children and drop them when
/// dropped; sources (trees, slices) are only borrowed. An iterator over a
/// tree pins its branch chain in the cache and assumes the structure doesn't
/// change underneath it for its entire lifetime.
pub enum ResultIter<'a, K: Key> {
    /// Scan of a borrowed sorted, duplicate-free slice.
    Slice(SliceIter<'a, K>),
    /// Scan of a (sub)range of a tree.
    Tree(TreeCursor<'a, K>),
    /// Sorted union of two child iterators.
    Or(OrIter<'a, K>),
    /// Sorted intersection of two child iterators.
    And(AndIter<'a, K>),
    /// Elements of the left child absent from the right.
    AndNot(AndNotIter<'a, K>),
    /// Predicate pass-through.
    Filter(FilterIter<'a, K>),
}

impl<K: Key> std::fmt::Debug for ResultIter<'_, K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Slice(_) => "Slice",
            Self::Tree(_) => "Tree",
            Self::Or(_) => "Or",
            Self::And(_) => "And",
            Self::AndNot(_) => "AndNot",
            Self::Filter(_) => "Filter",
        };
        f.debug_struct("ResultIter")
            .field("kind", &name)
            .field("current", &self.get())
            .finish()
    }
}

#[derive(Debug, Clone)]
enum Pos<K> {
    Beginning,
    At(K),
    End,
}

impl<'a, K: Key> ResultIter<'a, K> {
    /// Iterator over a sorted, duplicate-free slice (e.g. a
    /// [`SortedVec`](crate::SortedVec) via `as_slice`).
    pub fn over_slice(items: &'a [K]) -> Self {
        debug_assert!(items.windows(2).all(|w| w[0] < w[1]));
        Self::Slice(SliceIter {
            items,
            pos: SlicePos::Beginning,
        })
    }

    pub(crate) fn over_tree(cursor: TreeCursor<'a, K>) -> Self {
        Self::Tree(cursor)
    }

    /// Lazy sorted union of `self` and `other`.
    pub fn or(self, other: Self) -> Self {
        Self::Or(OrIter {
            a: Box::new(self),
            b: Box::new(other),
            pos: Pos::Beginning,
        })
    }

    /// Lazy sorted intersection; eagerly advances the children to the first
    /// match so emptiness is known up front.
    pub fn and(self, other: Self) -> Result<Self, Error> {
        let mut it = AndIter {
            a: Box::new(self),
            b: Box::new(other),
            pos: Pos::Beginning,
            primed: None,
        };
        it.a.next()?;
        it.b.next()?;
        it.primed = Some(align_forward(&mut it.a, &mut it.b)?);
        Ok(Self::And(it))
    }

    /// Lazy difference: elements of `self` absent from `other`.
    pub fn and_not(self, other: Self) -> Self {
        Self::AndNot(AndNotIter {
            a: Box::new(self),
            b: Box::new(other),
            pos: Pos::Beginning,
        })
    }

    /// Pass-through of `self` skipping elements rejected by `pred`.
    /// Emptiness is probed at construction, making `count` O(1) for an
    /// empty result.
    pub fn filter(self, pred: impl Fn(&K) -> bool + 'a) -> Result<Self, Error> {
        let mut src = Box::new(self);
        src.rewind();
        let mut empty = true;
        while src.next()? {
            if pred(src.get().unwrap()) {
                empty = false;
                break;
            }
        }
        src.rewind();
        Ok(Self::Filter(FilterIter {
            src,
            pred: Box::new(pred),
            empty,
        }))
    }

    /// The key at the current position, if valid.
    pub fn get(&self) -> Option<&K> {
        match self {
            Self::Slice(it) => match it.pos {
                SlicePos::At(i) => it.items.get(i),
                _ => None,
            },
            Self::Tree(cursor) => cursor.get(),
            Self::Or(it) => it.pos_key(),
            Self::And(it) => match &it.pos {
                Pos::At(k) => Some(k),
                _ => None,
            },
            Self::AndNot(it) => match &it.pos {
                Pos::At(k) => Some(k),
                _ => None,
            },
            Self::Filter(it) => it.src.get(),
        }
    }

    /// Estimated result count; `None` when unknown. Composite counts are
    /// upper bounds computed from the children's reports.
    pub fn count(&self) -> Option<u64> {
        match self {
            Self::Slice(it) => Some(it.items.len() as u64),
            Self::Tree(_) => None,
            Self::Or(it) => Some(it.a.count()? + it.b.count()?),
            Self::And(it) => Some(it.a.count()?.min(it.b.count()?)),
            Self::AndNot(it) => it.a.count(),
            Self::Filter(it) => {
                if it.empty {
                    Some(0)
                } else {
                    it.src.count()
                }
            }
        }
    }

    /// Advances to the next key in order. `Ok(false)` once past the last.
    pub fn next(&mut self) -> Result<bool, Error> {
        match self {
            Self::Slice(it) => Ok(it.next()),
            Self::Tree(cursor) => cursor.next(),
            Self::Or(it) => it.next(),
            Self::And(it) => it.next(),
            Self::AndNot(it) => it.next(),
            Self::Filter(it) => loop {
                if !it.src.next()? {
                    return Ok(false);
                }
                if (it.pred)(it.src.get().unwrap()) {
                    return Ok(true);
                }
            },
        }
    }

    /// Moves back to the previous key in order. `Ok(false)` once before the
    /// first.
    pub fn prev(&mut self) -> Result<bool, Error> {
        match self {
            Self::Slice(it) => Ok(it.prev()),
            Self::Tree(cursor) => cursor.prev(),
            Self::Or(it) => it.prev(),
            Self::And(it) => it.prev(),
            Self::AndNot(it) => it.prev(),
            Self::Filter(it) => loop {
                if !it.src.prev()? {
                    return Ok(false);
                }
                if (it.pred)(it.src.get().unwrap()) {
                    return Ok(true);
                }
            },
        }
    }

    /// Resets to Beginning.
    pub fn rewind(&mut self) {
        match self {
            Self::Slice(it) => it.pos = SlicePos::Beginning,
            Self::Tree(cursor) => cursor.rewind(),
            Self::Or(it) => {
                it.pos = Pos::Beginning;
                it.a.rewind();
                it.b.rewind();
            }
            Self::And(it) => {
                it.pos = Pos::Beginning;
                it.primed = None;
                it.a.rewind();
                it.b.rewind();
            }
            Self::AndNot(it) => {
                it.pos = Pos::Beginning;
                it.a.rewind();
                it.b.rewind();
            }
            Self::Filter(it) => it.src.rewind(),
        }
    }

    /// Jumps past the last key, so that `prev` yields keys in reverse.
    pub fn wind_to_end(&mut self) {
        match self {
            Self::Slice(it) => it.pos = SlicePos::End,
            Self::Tree(cursor) => cursor.wind_to_end(),
            Self::Or(it) => {
                it.pos = Pos::End;
                it.a.wind_to_end();
                it.b.wind_to_end();
            }
            Self::And(it) => {
                it.pos = Pos::End;
                it.primed = None;
                it.a.wind_to_end();
                it.b.wind_to_end();
            }
            Self::AndNot(it) => {
                it.pos = Pos::End;
                it.a.wind_to_end();
                it.b.wind_to_end();
            }
            Self::Filter(it) => it.src.wind_to_end(),
        }
    }

    fn at_beginning(&self) -> bool {
        match self {
            Self::Slice(it) => matches!(it.pos, SlicePos::Beginning),
            Self::Tree(cursor) => cursor.at_beginning(),
            Self::Or(it) => matches!(it.pos, Pos::Beginning),
            Self::And(it) => matches!(it.pos, Pos::Beginning),
            Self::AndNot(it) => matches!(it.pos, Pos::Beginning),
            Self::Filter(it) => it.src.at_beginning(),
        }
    }

    fn at_end(&self) -> bool {
        match self {
            Self::Slice(it) => matches!(it.pos, SlicePos::End),
            Self::Tree(cursor) => cursor.at_end(),
            Self::Or(it) => matches!(it.pos, Pos::End),
            Self::And(it) => matches!(it.pos, Pos::End),
            Self::AndNot(it) => matches!(it.pos, Pos::End),
            Self::Filter(it) => it.src.at_end(),
        }
    }

    /// Drains the remaining keys forward into a vector. Test and maintenance
    /// helper, not a query path.
    pub fn collect_forward(&mut self) -> Result<Vec<K>, Error> {
        let mut out = Vec::new();
        while self.next()? {
            out.push(self.get().unwrap().clone());
        }
        Ok(out)
    }
}

#[derive(Debug)]
enum SlicePos {
    Beginning,
    At(usize),
    End,
}

#[derive(Debug)]
pub struct SliceIter<'a, K> {
    items: &'a [K],
    pos: SlicePos,
}

impl<K> SliceIter<'_, K> {
    fn next(&mut self) -> bool {
        let next = match self.pos {
            SlicePos::Beginning => 0,
            SlicePos::At(i) => i + 1,
            SlicePos::End => return false,
        };
        if next < self.items.len() {
            self.pos = SlicePos::At(next);
            true
        } else {
            self.pos = SlicePos::End;
            false
        }
    }

    fn prev(&mut self) -> bool {
        let prev = match self.pos {
            SlicePos::Beginning => return false,
            SlicePos::At(i) => i.checked_sub(1),
            SlicePos::End => self.items.len().checked_sub(1),
        };
        match prev {
            Some(i) => {
                self.pos = SlicePos::At(i);
                true
            }
            None => {
                self.pos = SlicePos::Beginning;
                false
            }
        }
    }
}

/// Moves `child` forward until its current key is greater than `cur`,
/// initializing it first if it sits at Beginning.
fn advance_past<K: Key>(child: &mut ResultIter<'_, K>, cur: &K) -> Result<(), Error> {
    if child.at_beginning() {
        child.next()?;
    }
    while child.get().is_some_and(|k| k <= cur) {
        child.next()?;
    }
    Ok(())
}

/// Mirror of [`advance_past`] for backward iteration.
fn retreat_before<K: Key>(child: &mut ResultIter<'_, K>, cur: &K) -> Result<(), Error> {
    if child.at_end() {
        child.prev()?;
    }
    while child.get().is_some_and(|k| k >= cur) {
        child.prev()?;
    }
    Ok(())
}

fn align_forward<K: Key>(
    a: &mut ResultIter<'_, K>,
    b: &mut ResultIter<'_, K>,
) -> Result<Option<K>, Error> {
    loop {
        let (Some(x), Some(y)) = (a.get(), b.get()) else {
            return Ok(None);
        };
        match x.cmp(y) {
            std::cmp::Ordering::Equal => return Ok(Some(x.clone())),
            std::cmp::Ordering::Less => {
                a.next()?;
            }
            std::cmp::Ordering::Greater => {
                b.next()?;
            }
        }
    }
}

fn align_backward<K: Key>(
    a: &mut ResultIter<'_, K>,
    b: &mut ResultIter<'_, K>,
) -> Result<Option<K>, Error> {
    loop {
        let (Some(x), Some(y)) = (a.get(), b.get()) else {
            return Ok(None);
        };
        match x.cmp(y) {
            std::cmp::Ordering::Equal => return Ok(Some(x.clone())),
            std::cmp::Ordering::Greater => {
                a.prev()?;
            }
            std::cmp::Ordering::Less => {
                b.prev()?;
            }
        }
    }
}

pub struct OrIter<'a, K: Key> {
    a: Box<ResultIter<'a, K>>,
    b: Box<ResultIter<'a, K>>,
    pos: Pos<K>,
}

impl<K: Key> OrIter<'_, K> {
    fn pos_key(&self) -> Option<&K> {
        match &self.pos {
            Pos::At(k) => Some(k),
            _ => None,
        }
    }

    fn next(&mut self) -> Result<bool, Error> {
        match std::mem::replace(&mut self.pos, Pos::End) {
            Pos::End => return Ok(false),
            Pos::Beginning => {
                self.a.rewind();
                self.b.rewind();
                self.a.next()?;
                self.b.next()?;
            }
            Pos::At(cur) => {
                // the emitted key came from whichever children equal it;
                // advance those (both, on a tie) past it
                advance_past(&mut self.a, &cur)?;
                advance_past(&mut self.b, &cur)?;
            }
        }
        let smaller = match (self.a.get(), self.b.get()) {
            (Some(x), Some(y)) => Some(x.min(y)),
            (Some(x), None) => Some(x),
            (None, Some(y)) => Some(y),
            (None, None) => None,
        };
        match smaller {
            Some(k) => {
                self.pos = Pos::At(k.clone());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn prev(&mut self) -> Result<bool, Error> {
        match std::mem::replace(&mut self.pos, Pos::Beginning) {
            Pos::Beginning => return Ok(false),
            Pos::End => {
                self.a.wind_to_end();
                self.b.wind_to_end();
                self.a.prev()?;
                self.b.prev()?;
            }
            Pos::At(cur) => {
                retreat_before(&mut self.a, &cur)?;
                retreat_before(&mut self.b, &cur)?;
            }
        }
        let larger = match (self.a.get(), self.b.get()) {
            (Some(x), Some(y)) => Some(x.max(y)),
            (Some(x), None) => Some(x),
            (None, Some(y)) => Some(y),
            (None, None) => None,
        };
        match larger {
            Some(k) => {
                self.pos = Pos::At(k.clone());
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

pub struct AndIter<'a, K: Key> {
    a: Box<ResultIter<'a, K>>,
    b: Box<ResultIter<'a, K>>,
    pos: Pos<K>,
    /// First match located at construction; children are already positioned
    /// on it. Dropped once consumed or after any reset.
    primed: Option<Option<K>>,
}

impl<K: Key> AndIter<'_, K> {
    fn next(&mut self) -> Result<bool, Error> {
        match std::mem::replace(&mut self.pos, Pos::End) {
            Pos::End => return Ok(false),
            Pos::Beginning => {
                if let Some(first) = self.primed.take() {
                    match first {
                        Some(k) => {
                            self.pos = Pos::At(k);
                            return Ok(true);
                        }
                        None => return Ok(false),
                    }
                }
                self.a.rewind();
                self.b.rewind();
                self.a.next()?;
                self.b.next()?;
            }
            Pos::At(_) => {
                // both children sit on the match; move one off it
                self.a.next()?;
            }
        }
        match align_forward(&mut self.a, &mut self.b)? {
            Some(k) => {
                self.pos = Pos::At(k);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn prev(&mut self) -> Result<bool, Error> {
        self.primed = None;
        match std::mem::replace(&mut self.pos, Pos::Beginning) {
            Pos::Beginning => return Ok(false),
            Pos::End => {
                self.a.wind_to_end();
                self.b.wind_to_end();
                self.a.prev()?;
                self.b.prev()?;
            }
            Pos::At(_) => {
                self.a.prev()?;
            }
        }
        match align_backward(&mut self.a, &mut self.b)? {
            Some(k) => {
                self.pos = Pos::At(k);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

pub struct AndNotIter<'a, K: Key> {
    a: Box<ResultIter<'a, K>>,
    b: Box<ResultIter<'a, K>>,
    pos: Pos<K>,
}

impl<K: Key> AndNotIter<'_, K> {
    fn next(&mut self) -> Result<bool, Error> {
        match std::mem::replace(&mut self.pos, Pos::End) {
            Pos::End => return Ok(false),
            Pos::Beginning => {
                self.a.rewind();
                self.b.rewind();
                self.a.next()?;
            }
            Pos::At(_) => {
                self.a.next()?;
            }
        }
        loop {
            let Some(candidate) = self.a.get().cloned() else {
                return Ok(false);
            };
            advance_past(&mut self.b, &candidate)?;
            if self.b_passed_over(&candidate)? {
                self.a.next()?;
                continue;
            }
            self.pos = Pos::At(candidate);
            return Ok(true);
        }
    }

    /// Whether `b` contains `candidate`. `b` has just been advanced past it,
    /// so a hit is visible as the key right behind `b`'s position.
    fn b_passed_over(&mut self, candidate: &K) -> Result<bool, Error> {
        if !self.b.prev()? {
            return Ok(false);
        }
        let hit = self.b.get() == Some(candidate);
        self.b.next()?;
        Ok(hit)
    }

    fn prev(&mut self) -> Result<bool, Error> {
        match std::mem::replace(&mut self.pos, Pos::Beginning) {
            Pos::Beginning => return Ok(false),
            Pos::End => {
                self.a.wind_to_end();
                self.a.prev()?;
            }
            Pos::At(_) => {
                self.a.prev()?;
            }
        }
        loop {
            let Some(candidate) = self.a.get().cloned() else {
                return Ok(false);
            };
            retreat_before(&mut self.b, &candidate)?;
            if self.b_passed_under(&candidate)? {
                self.a.prev()?;
                continue;
            }
            self.pos = Pos::At(candidate);
            return Ok(true);
        }
    }

    fn b_passed_under(&mut self, candidate: &K) -> Result<bool, Error> {
        if !self.b.next()? {
            return Ok(false);
        }
        let hit = self.b.get() == Some(candidate);
        self.b.prev()?;
        Ok(hit)
    }
}

pub struct FilterIter<'a, K: Key> {
    src: Box<ResultIter<'a, K>>,
    pred: Box<dyn Fn(&K) -> bool + 'a>,
    /// Cached at construction: whether no element passes the predicate.
    empty: bool,
}
