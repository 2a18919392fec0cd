//! Packed resizable array of fixed-width records.
//!
//! Elements live back to back in one contiguous byte buffer of
//! `len * elem_width` bytes. Reads hand out [`RecordRef`] views into the
//! buffer; [`FlatList::handle`] hands out a [`RecordMut`] that borrows the
//! list for the duration of the edit, so a structural mutation can never
//! invalidate a live view.

use std::cmp::Ordering;
use std::sync::Arc;

use record_codec::{Record, RecordMut, RecordRef, Shape};
use tracing::trace;

use crate::error::{FlatError, FlatResult};

/// Three-way comparator over two elements.
pub type Compare<'c> = &'c dyn Fn(RecordRef<'_>, RecordRef<'_>) -> Ordering;

/// Byte-lexicographic element order, the default comparator.
pub fn byte_lexicographic(a: RecordRef<'_>, b: RecordRef<'_>) -> Ordering {
    a.bytes().cmp(b.bytes())
}

/// A resizable packed array of records sharing one fixed-width shape.
#[derive(Debug, Clone)]
pub struct FlatList {
    shape: Arc<Shape>,
    elem: usize,
    buf: Vec<u8>,
    len: usize,
}

impl FlatList {
    /// Create an empty list of `shape` elements.
    ///
    /// The shape must be fully fixed-width with a positive element size.
    pub fn new(shape: Arc<Shape>) -> FlatResult<FlatList> {
        let elem = match shape.fixed_width() {
            Some(w) if w > 0 => w,
            _ => return Err(FlatError::InvalidElementType(shape.name().to_string())),
        };
        Ok(FlatList {
            shape,
            elem,
            buf: Vec::new(),
            len: 0,
        })
    }

    /// Adopt a packed buffer. Its length must divide evenly into elements.
    pub fn from_vec(shape: Arc<Shape>, buf: Vec<u8>) -> FlatResult<FlatList> {
        let mut list = FlatList::new(shape)?;
        if buf.len() % list.elem != 0 {
            return Err(FlatError::MisalignedBuffer {
                len: buf.len(),
                elem: list.elem,
            });
        }
        list.len = buf.len() / list.elem;
        list.buf = buf;
        Ok(list)
    }

    pub fn shape(&self) -> &Arc<Shape> {
        &self.shape
    }

    /// Element size in bytes.
    pub fn elem_width(&self) -> usize {
        self.elem
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The packed backing bytes, `len * elem_width` long.
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    fn check_shape(&self, record: RecordRef<'_>) -> FlatResult<()> {
        if record.shape().schema_id() != self.shape.schema_id() {
            return Err(FlatError::ShapeMismatch {
                expected: self.shape.name().to_string(),
                got: record.shape().name().to_string(),
            });
        }
        Ok(())
    }

    fn slot_range(&self, index: usize) -> std::ops::Range<usize> {
        index * self.elem..(index + 1) * self.elem
    }

    fn slot(&self, index: usize) -> RecordRef<'_> {
        RecordRef::new(&self.shape, &self.buf[self.slot_range(index)])
            .expect("slot is exactly one element wide")
    }

    /// Read the element at `index`; negative indices count from the end.
    pub fn at(&self, index: isize) -> Option<RecordRef<'_>> {
        let resolved = if index < 0 {
            self.len.checked_sub(index.unsigned_abs())?
        } else {
            index as usize
        };
        (resolved < self.len).then(|| self.slot(resolved))
    }

    /// Mutable view into slot `index`, borrowing the list for its lifetime.
    pub fn handle(&mut self, index: usize) -> FlatResult<RecordMut<'_>> {
        if index >= self.len {
            return Err(FlatError::IndexOutOfBounds {
                index,
                len: self.len,
            });
        }
        let range = self.slot_range(index);
        Ok(RecordMut::new(&self.shape, &mut self.buf[range])
            .expect("slot is exactly one element wide"))
    }

    /// Append an element.
    pub fn push(&mut self, record: RecordRef<'_>) -> FlatResult<()> {
        self.insert(self.len, record)
    }

    /// Remove and return the last element.
    pub fn pop(&mut self) -> Option<Record> {
        if self.len == 0 {
            return None;
        }
        let record = self.slot(self.len - 1).to_record();
        self.len -= 1;
        self.buf.truncate(self.len * self.elem);
        Some(record)
    }

    /// Prepend an element, shifting everything right.
    pub fn unshift(&mut self, record: RecordRef<'_>) -> FlatResult<()> {
        self.insert(0, record)
    }

    /// Remove and return the first element, shifting everything left.
    pub fn shift(&mut self) -> Option<Record> {
        if self.len == 0 {
            return None;
        }
        let record = self.slot(0).to_record();
        self.delete(0).expect("slot 0 exists");
        Some(record)
    }

    /// Insert an element at `index`, shifting later elements right.
    pub fn insert(&mut self, index: usize, record: RecordRef<'_>) -> FlatResult<()> {
        if index > self.len {
            return Err(FlatError::IndexOutOfBounds {
                index,
                len: self.len,
            });
        }
        self.check_shape(record)?;
        let at = index * self.elem;
        let old_end = self.len * self.elem;
        self.buf.resize(old_end + self.elem, 0);
        self.buf.copy_within(at..old_end, at + self.elem);
        self.buf[at..at + self.elem].copy_from_slice(&record.bytes()[..self.elem]);
        self.len += 1;
        trace!(index, len = self.len, "inserted element");
        Ok(())
    }

    /// Remove the element at `index`, shifting later elements left.
    pub fn delete(&mut self, index: usize) -> FlatResult<()> {
        if index >= self.len {
            return Err(FlatError::IndexOutOfBounds {
                index,
                len: self.len,
            });
        }
        let at = index * self.elem;
        let old_end = self.len * self.elem;
        self.buf.copy_within(at + self.elem..old_end, at);
        self.len -= 1;
        self.buf.truncate(self.len * self.elem);
        trace!(index, len = self.len, "deleted element");
        Ok(())
    }

    /// Swap the elements at `i` and `j` in place.
    pub fn swap(&mut self, i: usize, j: usize) -> FlatResult<()> {
        let len = self.len;
        for index in [i, j] {
            if index >= len {
                return Err(FlatError::IndexOutOfBounds { index, len });
            }
        }
        self.swap_slots(i, j);
        Ok(())
    }

    fn swap_slots(&mut self, i: usize, j: usize) {
        if i == j {
            return;
        }
        let (lo, hi) = (i.min(j), i.max(j));
        let (head, tail) = self.buf.split_at_mut(hi * self.elem);
        head[lo * self.elem..(lo + 1) * self.elem].swap_with_slice(&mut tail[..self.elem]);
    }

    /// Set the element count; growth zero-fills, shrinking truncates.
    pub fn resize(&mut self, len: usize) {
        self.len = len;
        self.buf.resize(len * self.elem, 0);
    }

    /// Pre-allocate room for `additional` more elements. `force` requests
    /// exactly that much instead of amortized growth.
    pub fn reserve(&mut self, additional: usize, force: bool) {
        if force {
            self.buf.reserve_exact(additional * self.elem);
        } else {
            self.buf.reserve(additional * self.elem);
        }
    }

    /// Give unused capacity back to the allocator.
    pub fn shrink_to_fit(&mut self) {
        self.buf.shrink_to_fit();
    }

    /// Iterate element views in order.
    pub fn iter(&self) -> impl Iterator<Item = RecordRef<'_>> {
        (0..self.len).map(|i| self.slot(i))
    }

    pub fn find(&self, mut pred: impl FnMut(RecordRef<'_>) -> bool) -> Option<RecordRef<'_>> {
        (0..self.len).map(|i| self.slot(i)).find(|r| pred(*r))
    }

    pub fn find_index(&self, mut pred: impl FnMut(RecordRef<'_>) -> bool) -> Option<usize> {
        (0..self.len).find(|&i| pred(self.slot(i)))
    }

    pub fn some(&self, pred: impl FnMut(RecordRef<'_>) -> bool) -> bool {
        self.find_index(pred).is_some()
    }

    pub fn every(&self, mut pred: impl FnMut(RecordRef<'_>) -> bool) -> bool {
        (0..self.len).all(|i| pred(self.slot(i)))
    }

    pub fn for_each(&self, mut f: impl FnMut(RecordRef<'_>)) {
        for i in 0..self.len {
            f(self.slot(i));
        }
    }

    pub fn reduce<T>(&self, init: T, mut f: impl FnMut(T, RecordRef<'_>) -> T) -> T {
        let mut acc = init;
        for i in 0..self.len {
            acc = f(acc, self.slot(i));
        }
        acc
    }

    pub fn map<T>(&self, mut f: impl FnMut(RecordRef<'_>) -> T) -> Vec<T> {
        (0..self.len).map(|i| f(self.slot(i))).collect()
    }

    /// New list holding copies of the elements the predicate keeps.
    pub fn filter(&self, mut pred: impl FnMut(RecordRef<'_>) -> bool) -> FlatList {
        let mut out = FlatList {
            shape: self.shape.clone(),
            elem: self.elem,
            buf: Vec::new(),
            len: 0,
        };
        for i in 0..self.len {
            let slot = self.slot(i);
            if pred(slot) {
                out.buf.extend_from_slice(slot.bytes());
                out.len += 1;
            }
        }
        out
    }

    /// Reverse element order in place.
    pub fn reverse(&mut self) {
        let len = self.len;
        for i in 0..len / 2 {
            self.swap_slots(i, len - 1 - i);
        }
    }

    /// In-place heap-sort under the default byte-lexicographic order.
    pub fn sort(&mut self) {
        self.sort_by(&byte_lexicographic);
    }

    /// In-place heap-sort under `cmp`. Swaps move whole slots inside the
    /// backing buffer; no per-element allocation.
    pub fn sort_by(&mut self, cmp: Compare<'_>) {
        let len = self.len;
        if len < 2 {
            return;
        }
        for root in (0..len / 2).rev() {
            self.sift_down(root, len, cmp);
        }
        for end in (1..len).rev() {
            self.swap_slots(0, end);
            self.sift_down(0, end, cmp);
        }
    }

    fn sift_down(&mut self, mut root: usize, end: usize, cmp: Compare<'_>) {
        loop {
            let left = 2 * root + 1;
            if left >= end {
                return;
            }
            let mut largest = root;
            if cmp(self.slot(largest), self.slot(left)) == Ordering::Less {
                largest = left;
            }
            let right = left + 1;
            if right < end && cmp(self.slot(largest), self.slot(right)) == Ordering::Less {
                largest = right;
            }
            if largest == root {
                return;
            }
            self.swap_slots(root, largest);
            root = largest;
        }
    }
}
