//! Chunks
//!
//! A [`Chunk`] is the unit of output: an immutable, size-tracked batch of
//! elements. Every value the engine emits travels inside a chunk, and the
//! interpreter never looks at anything richer than a chunk.
//!
//! # Design
//!
//! Chunks are cheap to clone and cheap to slice:
//!
//! - `Dense` is a window (`offset`, `len`) over a shared `Arc<[O]>` backing
//!   slice. Slicing adjusts the window and never copies.
//! - `Concat` holds a list of non-empty sub-chunks plus the cached total size,
//!   so concatenating two chunks nests them instead of copying elements.
//!
//! A backing slice is never mutated after it has been wrapped.
//!
//! # Example
//!
//! ```rust
//! use pullstream::Chunk;
//!
//! let a = Chunk::from(vec![1, 2, 3]);
//! let b = Chunk::singleton(4);
//! let c = a.concat(b);
//! assert_eq!(c.size(), 4);
//! assert_eq!(c.take(2).to_vec(), vec![1, 2]);
//! ```

use std::fmt;
use std::ops::Index;
use std::sync::Arc;

/// An immutable sequence of elements with O(1) size.
pub struct Chunk<O> {
    repr: Repr<O>,
}

enum Repr<O> {
    Empty,
    Singleton(O),
    Dense {
        values: Arc<[O]>,
        offset: usize,
        len: usize,
    },
    Concat {
        // Invariant: no child is empty, and `size` is the sum of child sizes.
        chunks: Arc<Vec<Chunk<O>>>,
        size: usize,
    },
}

impl<O: Clone> Clone for Chunk<O> {
    fn clone(&self) -> Self {
        let repr = match &self.repr {
            Repr::Empty => Repr::Empty,
            Repr::Singleton(value) => Repr::Singleton(value.clone()),
            Repr::Dense {
                values,
                offset,
                len,
            } => Repr::Dense {
                values: Arc::clone(values),
                offset: *offset,
                len: *len,
            },
            Repr::Concat { chunks, size } => Repr::Concat {
                chunks: Arc::clone(chunks),
                size: *size,
            },
        };
        Chunk { repr }
    }
}

impl<O> Default for Chunk<O> {
    fn default() -> Self {
        Chunk { repr: Repr::Empty }
    }
}

impl<O> Chunk<O> {
    /// The empty chunk.
    pub fn empty() -> Self {
        Chunk { repr: Repr::Empty }
    }

    /// A chunk holding exactly one element.
    pub fn singleton(value: O) -> Self {
        Chunk {
            repr: Repr::Singleton(value),
        }
    }

    /// Number of elements in the chunk.
    pub fn size(&self) -> usize {
        match &self.repr {
            Repr::Empty => 0,
            Repr::Singleton(_) => 1,
            Repr::Dense { len, .. } => *len,
            Repr::Concat { size, .. } => *size,
        }
    }

    /// Returns `true` if the chunk has no elements.
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Returns the element at `index`, or `None` when out of range.
    pub fn get(&self, index: usize) -> Option<&O> {
        let mut current = self;
        let mut index = index;
        loop {
            match &current.repr {
                Repr::Empty => return None,
                Repr::Singleton(value) => return (index == 0).then_some(value),
                Repr::Dense {
                    values,
                    offset,
                    len,
                } => {
                    return if index < *len {
                        values.get(offset + index)
                    } else {
                        None
                    };
                }
                Repr::Concat { chunks, size } => {
                    if index >= *size {
                        return None;
                    }
                    // Walk the children, accumulating the offset.
                    let mut next = None;
                    for chunk in chunks.iter() {
                        let n = chunk.size();
                        if index < n {
                            next = Some(chunk);
                            break;
                        }
                        index -= n;
                    }
                    current = next?;
                }
            }
        }
    }

    /// Returns the element at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index >= self.size()`.
    #[track_caller]
    pub fn elem_at(&self, index: usize) -> &O {
        match self.get(index) {
            Some(value) => value,
            None => panic!(
                "chunk index {} out of bounds for chunk of size {}",
                index,
                self.size()
            ),
        }
    }

    /// The first element, if any.
    pub fn head(&self) -> Option<&O> {
        self.get(0)
    }

    /// The last element, if any.
    pub fn last(&self) -> Option<&O> {
        self.size().checked_sub(1).and_then(|i| self.get(i))
    }

    /// Borrowing iterator over the elements, in order.
    pub fn iter(&self) -> Iter<'_, O> {
        let inner: Box<dyn Iterator<Item = &O> + '_> = match &self.repr {
            Repr::Empty => Box::new(std::iter::empty()),
            Repr::Singleton(value) => Box::new(std::iter::once(value)),
            Repr::Dense {
                values,
                offset,
                len,
            } => Box::new(values[*offset..*offset + *len].iter()),
            Repr::Concat { chunks, .. } => Box::new(chunks.iter().flat_map(|c| c.iter())),
        };
        Iter {
            inner,
            remaining: self.size(),
        }
    }

    /// Left fold over the elements.
    pub fn fold_left<B, F>(&self, init: B, mut f: F) -> B
    where
        F: FnMut(B, &O) -> B,
    {
        let mut acc = init;
        for value in self.iter() {
            acc = f(acc, value);
        }
        acc
    }

    /// Maps every element, producing a dense chunk.
    pub fn map<P, F>(&self, f: F) -> Chunk<P>
    where
        P: Clone,
        F: FnMut(&O) -> P,
    {
        self.iter().map(f).collect()
    }

    /// Pairs up elements of two chunks; the result has the shorter length.
    pub fn zip_with<P, Q, F>(&self, other: &Chunk<P>, mut f: F) -> Chunk<Q>
    where
        Q: Clone,
        F: FnMut(&O, &P) -> Q,
    {
        self.iter()
            .zip(other.iter())
            .map(|(a, b)| f(a, b))
            .collect()
    }
}

impl<O: Clone> Chunk<O> {
    /// Wraps a vector without copying its elements.
    pub fn from_vec(values: Vec<O>) -> Self {
        match values.len() {
            0 => Chunk::empty(),
            1 => values
                .into_iter()
                .next()
                .map_or_else(Chunk::empty, Chunk::singleton),
            len => Chunk {
                repr: Repr::Dense {
                    values: Arc::from(values),
                    offset: 0,
                    len,
                },
            },
        }
    }

    /// Copies a slice into a fresh chunk.
    pub fn from_slice(values: &[O]) -> Self {
        Chunk::from_vec(values.to_vec())
    }

    /// Concatenates two chunks without copying either one's storage.
    pub fn concat(self, other: Chunk<O>) -> Chunk<O> {
        if self.is_empty() {
            return other;
        }
        if other.is_empty() {
            return self;
        }
        let total = self.size() + other.size();
        let chunks = match (self.repr, other.repr) {
            (Repr::Concat { chunks: left, .. }, Repr::Concat { chunks: right, .. }) => {
                let mut list = Arc::unwrap_or_clone(left);
                list.extend(right.iter().cloned());
                list
            }
            (Repr::Concat { chunks: left, .. }, right) => {
                let mut list = Arc::unwrap_or_clone(left);
                list.push(Chunk { repr: right });
                list
            }
            (left, Repr::Concat { chunks: right, .. }) => {
                let mut list = Vec::with_capacity(right.len() + 1);
                list.push(Chunk { repr: left });
                list.extend(right.iter().cloned());
                list
            }
            (left, right) => vec![Chunk { repr: left }, Chunk { repr: right }],
        };
        Chunk {
            repr: Repr::Concat {
                chunks: Arc::new(chunks),
                size: total,
            },
        }
    }

    /// Concatenates every chunk of the iterator, in order.
    pub fn concat_all<I>(chunks: I) -> Chunk<O>
    where
        I: IntoIterator<Item = Chunk<O>>,
    {
        Self::from_parts(chunks.into_iter().collect())
    }

    /// Builds a chunk from sub-chunks, dropping empty ones.
    fn from_parts(parts: Vec<Chunk<O>>) -> Chunk<O> {
        let mut parts: Vec<Chunk<O>> = parts.into_iter().filter(|c| !c.is_empty()).collect();
        match parts.len() {
            0 => Chunk::empty(),
            1 => parts.pop().unwrap_or_default(),
            _ => {
                let mut flat = Vec::with_capacity(parts.len());
                for part in parts {
                    match part.repr {
                        Repr::Concat { chunks, .. } => flat.extend(chunks.iter().cloned()),
                        other => flat.push(Chunk { repr: other }),
                    }
                }
                let size = flat.iter().map(Chunk::size).sum();
                Chunk {
                    repr: Repr::Concat {
                        chunks: Arc::new(flat),
                        size,
                    },
                }
            }
        }
    }

    /// The first `n` elements (all of them if `n >= size`).
    pub fn take(&self, n: usize) -> Chunk<O> {
        if n == 0 {
            return Chunk::empty();
        }
        if n >= self.size() {
            return self.clone();
        }
        match &self.repr {
            // Both cases are covered by the size checks above.
            Repr::Empty | Repr::Singleton(_) => self.clone(),
            Repr::Dense { values, offset, .. } => Chunk {
                repr: Repr::Dense {
                    values: Arc::clone(values),
                    offset: *offset,
                    len: n,
                },
            },
            Repr::Concat { chunks, .. } => {
                let mut parts = Vec::new();
                let mut remaining = n;
                for chunk in chunks.iter() {
                    if remaining == 0 {
                        break;
                    }
                    let size = chunk.size();
                    if size <= remaining {
                        parts.push(chunk.clone());
                        remaining -= size;
                    } else {
                        parts.push(chunk.take(remaining));
                        remaining = 0;
                    }
                }
                Self::from_parts(parts)
            }
        }
    }

    /// Everything but the first `n` elements.
    pub fn drop(&self, n: usize) -> Chunk<O> {
        if n == 0 {
            return self.clone();
        }
        if n >= self.size() {
            return Chunk::empty();
        }
        match &self.repr {
            Repr::Empty | Repr::Singleton(_) => Chunk::empty(),
            Repr::Dense {
                values,
                offset,
                len,
            } => Chunk {
                repr: Repr::Dense {
                    values: Arc::clone(values),
                    offset: offset + n,
                    len: len - n,
                },
            },
            Repr::Concat { chunks, .. } => {
                let mut parts = Vec::new();
                let mut skip = n;
                for chunk in chunks.iter() {
                    let size = chunk.size();
                    if skip >= size {
                        skip -= size;
                    } else {
                        parts.push(chunk.drop(skip));
                        skip = 0;
                    }
                }
                Self::from_parts(parts)
            }
        }
    }

    /// The last `n` elements.
    pub fn take_right(&self, n: usize) -> Chunk<O> {
        self.drop(self.size().saturating_sub(n))
    }

    /// Everything but the last `n` elements.
    pub fn drop_right(&self, n: usize) -> Chunk<O> {
        self.take(self.size().saturating_sub(n))
    }

    /// Splits into the first `n` elements and the rest.
    pub fn split_at(&self, n: usize) -> (Chunk<O>, Chunk<O>) {
        (self.take(n), self.drop(n))
    }

    /// Keeps the elements matching `predicate`.
    pub fn filter<F>(&self, mut predicate: F) -> Chunk<O>
    where
        F: FnMut(&O) -> bool,
    {
        self.iter().filter(|v| predicate(v)).cloned().collect()
    }

    /// Copies the elements into a vector.
    pub fn to_vec(&self) -> Vec<O> {
        self.iter().cloned().collect()
    }
}

impl<O: Clone> From<Vec<O>> for Chunk<O> {
    fn from(values: Vec<O>) -> Self {
        Chunk::from_vec(values)
    }
}

impl<O: Clone> FromIterator<O> for Chunk<O> {
    fn from_iter<I: IntoIterator<Item = O>>(iter: I) -> Self {
        Chunk::from_vec(iter.into_iter().collect())
    }
}

impl<O: Clone> IntoIterator for Chunk<O> {
    type Item = O;
    type IntoIter = std::vec::IntoIter<O>;

    fn into_iter(self) -> Self::IntoIter {
        self.to_vec().into_iter()
    }
}

impl<'a, O> IntoIterator for &'a Chunk<O> {
    type Item = &'a O;
    type IntoIter = Iter<'a, O>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<O> Index<usize> for Chunk<O> {
    type Output = O;

    #[track_caller]
    fn index(&self, index: usize) -> &O {
        self.elem_at(index)
    }
}

impl<O: PartialEq> PartialEq for Chunk<O> {
    fn eq(&self, other: &Self) -> bool {
        self.size() == other.size() && self.iter().eq(other.iter())
    }
}

impl<O: Eq> Eq for Chunk<O> {}

impl<O: fmt::Debug> fmt::Debug for Chunk<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Chunk")?;
        f.debug_list().entries(self.iter()).finish()
    }
}

/// Borrowing iterator returned by [`Chunk::iter`].
pub struct Iter<'a, O> {
    inner: Box<dyn Iterator<Item = &'a O> + 'a>,
    remaining: usize,
}

impl<'a, O> Iterator for Iter<'a, O> {
    type Item = &'a O;

    fn next(&mut self) -> Option<&'a O> {
        let next = self.inner.next();
        if next.is_some() {
            self.remaining -= 1;
        }
        next
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<O> ExactSizeIterator for Iter<'_, O> {}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn dense(range: std::ops::Range<i32>) -> Chunk<i32> {
        Chunk::from(range.collect::<Vec<_>>())
    }

    #[test]
    fn test_from_vec_picks_smallest_representation() {
        assert!(matches!(Chunk::<i32>::from(vec![]).repr, Repr::Empty));
        assert!(matches!(Chunk::from(vec![7]).repr, Repr::Singleton(7)));
        assert!(matches!(dense(0..3).repr, Repr::Dense { len: 3, .. }));
    }

    #[test]
    fn test_concat_nests_instead_of_copying() {
        let left = dense(0..3);
        let right = Chunk::singleton(3);
        let joined = left.concat(right);
        match &joined.repr {
            Repr::Concat { chunks, size } => {
                assert_eq!(chunks.len(), 2);
                assert_eq!(*size, 4);
            }
            _ => panic!("expected a concat chunk"),
        }
        assert_eq!(joined.to_vec(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_concat_appends_and_prepends_into_existing_list() {
        let base = dense(0..2).concat(dense(2..4));
        let appended = base.clone().concat(dense(4..6));
        let prepended = Chunk::singleton(-1).concat(base);
        match (&appended.repr, &prepended.repr) {
            (Repr::Concat { chunks: a, .. }, Repr::Concat { chunks: p, .. }) => {
                assert_eq!(a.len(), 3);
                assert_eq!(p.len(), 3);
            }
            _ => panic!("expected concat chunks"),
        }
        assert_eq!(appended.to_vec(), (0..6).collect::<Vec<_>>());
        assert_eq!(prepended.to_vec(), vec![-1, 0, 1, 2, 3]);
    }

    #[test]
    fn test_concat_with_empty_is_identity() {
        let c = dense(0..5);
        assert_eq!(Chunk::empty().concat(c.clone()), c);
        assert_eq!(c.clone().concat(Chunk::empty()), c);
    }

    #[test]
    fn test_elem_at_walks_concat_offsets() {
        let c = Chunk::concat_all(vec![dense(0..3), Chunk::singleton(3), dense(4..10)]);
        for i in 0..10 {
            assert_eq!(*c.elem_at(i), i as i32);
        }
        assert_eq!(c.get(10), None);
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn test_elem_at_out_of_range_panics() {
        let c = dense(0..3);
        let _ = c[3];
    }

    #[test]
    fn test_take_and_drop_on_concat() {
        let c = dense(0..3).concat(dense(3..6)).concat(dense(6..9));
        assert_eq!(c.take(4).to_vec(), vec![0, 1, 2, 3]);
        assert_eq!(c.drop(4).to_vec(), vec![4, 5, 6, 7, 8]);
        assert_eq!(c.take_right(2).to_vec(), vec![7, 8]);
        assert_eq!(c.drop_right(7).to_vec(), vec![0, 1]);
        assert_eq!(c.take(100).size(), 9);
        assert!(c.drop(100).is_empty());
    }

    #[test]
    fn test_dense_slicing_shares_backing_storage() {
        let c = dense(0..10);
        let (front, back) = c.split_at(4);
        match (&front.repr, &back.repr, &c.repr) {
            (Repr::Dense { values: a, .. }, Repr::Dense { values: b, offset, .. }, Repr::Dense { values: orig, .. }) => {
                assert!(Arc::ptr_eq(a, orig));
                assert!(Arc::ptr_eq(b, orig));
                assert_eq!(*offset, 4);
            }
            _ => panic!("expected dense slices"),
        }
    }

    #[test]
    fn test_map_fold_zip() {
        let c = dense(1..5);
        assert_eq!(c.map(|x| x * 10).to_vec(), vec![10, 20, 30, 40]);
        assert_eq!(c.fold_left(0, |acc, x| acc + x), 10);
        let other = Chunk::from(vec!["a", "b"]);
        let zipped = c.zip_with(&other, |n, s| format!("{}{}", s, n));
        assert_eq!(zipped.to_vec(), vec!["a1".to_string(), "b2".to_string()]);
    }

    #[test]
    fn test_filter_head_last() {
        let c = dense(0..5).concat(dense(5..8));
        assert_eq!(c.filter(|x| x % 2 == 0).to_vec(), vec![0, 2, 4, 6]);
        assert_eq!(c.head(), Some(&0));
        assert_eq!(c.last(), Some(&7));
        assert_eq!(Chunk::<i32>::empty().last(), None);
    }

    #[test]
    fn test_debug_format() {
        let c = Chunk::from(vec![1, 2]);
        assert_eq!(format!("{:?}", c), "Chunk[1, 2]");
    }

    #[test]
    fn test_iter_is_exact_size() {
        let c = dense(0..4).concat(Chunk::singleton(4));
        let mut it = c.iter();
        assert_eq!(it.len(), 5);
        it.next();
        assert_eq!(it.len(), 4);
    }
}
