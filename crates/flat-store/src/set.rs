//! Sorted flat collection with uniqueness.
//!
//! A [`FlatSet`] keeps a [`FlatList`] ordered under its comparator and
//! rejects duplicates on insert. Lookups are binary searches driven by a
//! three-way probe: the probe sees an element and reports whether it sorts
//! before, at, or after the target.

use std::cmp::Ordering;
use std::ops::Deref;
use std::sync::Arc;

use record_codec::{RecordRef, Shape};

use crate::error::FlatResult;
use crate::list::{byte_lexicographic, Compare, FlatList};

/// Three-way probe over one element: `Less` means the element sorts before
/// the target, `Equal` is a match, `Greater` sorts after.
pub type Probe<'p> = &'p dyn Fn(RecordRef<'_>) -> Ordering;

/// A sorted, duplicate-free packed array of fixed-width records.
#[derive(Debug, Clone)]
pub struct FlatSet {
    list: FlatList,
}

impl FlatSet {
    pub fn new(shape: Arc<Shape>) -> FlatResult<FlatSet> {
        Ok(FlatSet {
            list: FlatList::new(shape)?,
        })
    }

    /// Insert in sorted position under the default byte order.
    ///
    /// Returns `Ok(false)` without modifying the set when an equal element
    /// is already present.
    pub fn add(&mut self, record: RecordRef<'_>) -> FlatResult<bool> {
        self.add_by(record, &byte_lexicographic)
    }

    /// Insert in sorted position under `cmp`, rejecting duplicates.
    pub fn add_by(&mut self, record: RecordRef<'_>, cmp: Compare<'_>) -> FlatResult<bool> {
        let mut lo = 0usize;
        let mut hi = self.list.len();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match cmp(self.list.at(mid as isize).expect("mid in range"), record) {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => return Ok(false),
            }
        }
        self.list.insert(lo, record)?;
        Ok(true)
    }

    /// Remove the element at `index`.
    pub fn delete(&mut self, index: usize) -> FlatResult<()> {
        self.list.delete(index)
    }

    /// Binary search for any element matching the probe.
    pub fn find_index(&self, probe: Probe<'_>) -> Option<usize> {
        let mut lo = 0usize;
        let mut hi = self.list.len();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match probe(self.list.at(mid as isize).expect("mid in range")) {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => return Some(mid),
            }
        }
        None
    }

    /// Binary search for any element matching the probe and return it.
    pub fn find(&self, probe: Probe<'_>) -> Option<RecordRef<'_>> {
        self.find_index(probe)
            .map(|i| self.list.at(i as isize).expect("found index in range"))
    }

    /// Smallest index matching the probe. `hint` may name a known match to
    /// start from.
    pub fn lower(&self, probe: Probe<'_>, hint: Option<usize>) -> Option<usize> {
        let seed = self.seed_match(probe, hint)?;
        // The matching run is contiguous; bisect its left edge in [0, seed]
        let mut lo = 0usize;
        let mut hi = seed;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match probe(self.list.at(mid as isize).expect("mid in range")) {
                Ordering::Less => lo = mid + 1,
                _ => hi = mid,
            }
        }
        Some(lo)
    }

    /// Largest index matching the probe. `hint` may name a known match.
    pub fn upper(&self, probe: Probe<'_>, hint: Option<usize>) -> Option<usize> {
        let seed = self.seed_match(probe, hint)?;
        let mut lo = seed;
        let mut hi = self.list.len() - 1;
        while lo < hi {
            let mid = lo + (hi - lo + 1) / 2;
            match probe(self.list.at(mid as isize).expect("mid in range")) {
                Ordering::Greater => hi = mid - 1,
                _ => lo = mid,
            }
        }
        Some(lo)
    }

    /// Inclusive `[lower, upper]` span of elements matching the probe.
    pub fn range(&self, probe: Probe<'_>) -> Option<(usize, usize)> {
        let seed = self.seed_match(probe, None)?;
        Some((
            self.lower(probe, Some(seed)).expect("seed matches"),
            self.upper(probe, Some(seed)).expect("seed matches"),
        ))
    }

    fn seed_match(&self, probe: Probe<'_>, hint: Option<usize>) -> Option<usize> {
        if let Some(i) = hint {
            if i < self.list.len()
                && probe(self.list.at(i as isize).expect("hint in range")) == Ordering::Equal
            {
                return Some(i);
            }
        }
        self.find_index(probe)
    }
}

impl Deref for FlatSet {
    type Target = FlatList;

    /// Read-side access (`len`, `at`, `iter`, `map`, …) passes through to
    /// the underlying list. Mutators are not exposed this way; they would
    /// break the sort order.
    fn deref(&self) -> &FlatList {
        &self.list
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use record_codec::{registry, FieldSpec, Primitive, Record, Value};

    fn shape() -> Arc<Shape> {
        registry::intern(
            Some("set_entry"),
            vec![
                FieldSpec::new("key", Primitive::Uint32),
                FieldSpec::new("group", Primitive::Uint8),
            ],
        )
        .unwrap()
    }

    fn entry(key: u32, group: u8) -> Record {
        Record::with_values(
            shape(),
            [("key", Value::from(key)), ("group", Value::from(group))],
        )
        .unwrap()
    }

    fn by_key(a: RecordRef<'_>, b: RecordRef<'_>) -> Ordering {
        a.get("key").unwrap().as_u64().cmp(&b.get("key").unwrap().as_u64())
    }

    fn keys(set: &FlatSet) -> Vec<u64> {
        set.map(|r| r.get("key").unwrap().as_u64().unwrap())
    }

    #[test]
    fn test_add_keeps_sorted_order() {
        let mut set = FlatSet::new(shape()).unwrap();
        for key in [5u32, 1, 9, 3, 7] {
            assert!(set.add_by(entry(key, 0).as_ref(), &by_key).unwrap());
        }
        assert_eq!(keys(&set), vec![1, 3, 5, 7, 9]);
    }

    #[test]
    fn test_duplicates_rejected() {
        let mut set = FlatSet::new(shape()).unwrap();
        assert!(set.add_by(entry(4, 0).as_ref(), &by_key).unwrap());
        assert!(!set.add_by(entry(4, 1).as_ref(), &by_key).unwrap());
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_sorted_and_unique_after_mixed_ops() {
        let mut set = FlatSet::new(shape()).unwrap();
        for key in [6u32, 2, 8, 2, 4, 6, 10] {
            set.add_by(entry(key, 0).as_ref(), &by_key).unwrap();
        }
        set.delete(1).unwrap(); // removes key 4
        set.add_by(entry(5, 0).as_ref(), &by_key).unwrap();

        let ks = keys(&set);
        assert_eq!(ks, vec![2, 5, 6, 8, 10]);
        for pair in ks.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn test_find_by_probe() {
        let mut set = FlatSet::new(shape()).unwrap();
        for key in [1u32, 3, 5, 7] {
            set.add_by(entry(key, 0).as_ref(), &by_key).unwrap();
        }
        let probe_5: Probe<'_> =
            &|r| r.get("key").unwrap().as_u64().unwrap().cmp(&5);
        assert_eq!(set.find_index(probe_5), Some(2));
        assert_eq!(
            set.find(probe_5).unwrap().get("key").unwrap(),
            Value::U64(5)
        );

        let probe_4: Probe<'_> =
            &|r| r.get("key").unwrap().as_u64().unwrap().cmp(&4);
        assert_eq!(set.find_index(probe_4), None);
    }

    #[test]
    fn test_lower_upper_range_span() {
        // Order by group so several elements match one probe
        let by_group: Compare<'_> = &|a, b| {
            a.get("group")
                .unwrap()
                .as_u64()
                .cmp(&b.get("group").unwrap().as_u64())
                .then_with(|| by_key(a, b))
        };
        let mut set = FlatSet::new(shape()).unwrap();
        for (key, group) in [(1u32, 0u8), (2, 1), (3, 1), (4, 1), (5, 2)] {
            set.add_by(entry(key, group).as_ref(), by_group).unwrap();
        }

        let group_1: Probe<'_> =
            &|r| r.get("group").unwrap().as_u64().unwrap().cmp(&1);
        assert_eq!(set.range(group_1), Some((1, 3)));
        assert_eq!(set.lower(group_1, None), Some(1));
        assert_eq!(set.upper(group_1, Some(2)), Some(3));

        let group_9: Probe<'_> =
            &|r| r.get("group").unwrap().as_u64().unwrap().cmp(&9);
        assert_eq!(set.range(group_9), None);
    }
}
