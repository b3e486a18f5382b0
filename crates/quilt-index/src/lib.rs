//! Typed indices for quilt's arena-allocated data.
//!
//! Graphs store tensors and operations in flat vectors and refer to them
//! through small integer handles. This crate provides the [`Idx`] trait
//! for those handles, the [`define_index!`] macro that declares them, and
//! [`IndexVec`], a vector addressed by one specific handle type so that a
//! `TensorId` can never be used to index the operation table.

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::fmt;
use std::marker::PhantomData;
use std::ops::{Index, IndexMut};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A handle that can be converted to and from a `usize` position.
pub trait Idx: Copy + Eq + std::hash::Hash + fmt::Debug + 'static {
    /// Create a handle from a raw position.
    fn new(idx: usize) -> Self;

    /// The raw position of this handle.
    fn index(self) -> usize;
}

/// Declare one or more `u32`-backed index newtypes implementing [`Idx`].
///
/// ```
/// quilt_index::define_index! {
///     /// Index into a node table.
///     pub struct NodeId;
/// }
/// use quilt_index::Idx;
/// assert_eq!(NodeId::new(3).index(), 3);
/// ```
#[macro_export]
macro_rules! define_index {
    ($($(#[$attr:meta])* $vis:vis struct $name:ident;)*) => {
        $(
            $(#[$attr])*
            #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
            #[derive(::serde::Serialize, ::serde::Deserialize)]
            #[serde(transparent)]
            $vis struct $name(u32);

            impl $crate::Idx for $name {
                #[inline]
                fn new(idx: usize) -> Self {
                    assert!(idx <= u32::MAX as usize, "index overflow");
                    Self(idx as u32)
                }

                #[inline]
                fn index(self) -> usize {
                    self.0 as usize
                }
            }

            impl ::std::fmt::Debug for $name {
                fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                    write!(f, "{}({})", stringify!($name), self.0)
                }
            }

            impl ::std::fmt::Display for $name {
                fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                    write!(f, "%{}", self.0)
                }
            }
        )*
    };
}

/// A vector whose elements are addressed by a typed index.
#[derive(Clone, PartialEq)]
pub struct IndexVec<I: Idx, T> {
    raw: Vec<T>,
    _marker: PhantomData<fn(&I)>,
}

impl<I: Idx, T> IndexVec<I, T> {
    /// Create an empty vector.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            raw: Vec::new(),
            _marker: PhantomData,
        }
    }

    /// Create an empty vector with room for `capacity` elements.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            raw: Vec::with_capacity(capacity),
            _marker: PhantomData,
        }
    }

    /// Append an element and return its index.
    pub fn push(&mut self, value: T) -> I {
        let idx = I::new(self.raw.len());
        self.raw.push(value);
        idx
    }

    /// The number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    /// Whether the vector is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Get an element, or `None` if the index is out of range.
    #[must_use]
    pub fn get(&self, idx: I) -> Option<&T> {
        self.raw.get(idx.index())
    }

    /// Get an element mutably, or `None` if the index is out of range.
    pub fn get_mut(&mut self, idx: I) -> Option<&mut T> {
        self.raw.get_mut(idx.index())
    }

    /// Whether `idx` addresses an element of this vector.
    #[must_use]
    pub fn contains(&self, idx: I) -> bool {
        idx.index() < self.raw.len()
    }

    /// Iterate over the elements in index order.
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.raw.iter()
    }

    /// Iterate over `(index, element)` pairs in index order.
    pub fn iter_enumerated(&self) -> impl DoubleEndedIterator<Item = (I, &T)> + ExactSizeIterator {
        self.raw.iter().enumerate().map(|(i, t)| (I::new(i), t))
    }

    /// Iterate over all valid indices.
    pub fn indices(&self) -> impl DoubleEndedIterator<Item = I> + ExactSizeIterator {
        (0..self.raw.len()).map(I::new)
    }

    /// The next index [`push`](Self::push) will return.
    #[must_use]
    pub fn next_index(&self) -> I {
        I::new(self.raw.len())
    }

    /// The underlying storage.
    #[must_use]
    pub fn raw(&self) -> &[T] {
        &self.raw
    }
}

impl<I: Idx, T> Default for IndexVec<I, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: Idx, T> From<Vec<T>> for IndexVec<I, T> {
    fn from(raw: Vec<T>) -> Self {
        Self {
            raw,
            _marker: PhantomData,
        }
    }
}

impl<I: Idx, T> FromIterator<T> for IndexVec<I, T> {
    fn from_iter<It: IntoIterator<Item = T>>(iter: It) -> Self {
        Self::from(iter.into_iter().collect::<Vec<_>>())
    }
}

impl<I: Idx, T> Index<I> for IndexVec<I, T> {
    type Output = T;

    #[inline]
    fn index(&self, idx: I) -> &T {
        &self.raw[idx.index()]
    }
}

impl<I: Idx, T> IndexMut<I> for IndexVec<I, T> {
    #[inline]
    fn index_mut(&mut self, idx: I) -> &mut T {
        &mut self.raw[idx.index()]
    }
}

impl<'a, I: Idx, T> IntoIterator for &'a IndexVec<I, T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.raw.iter()
    }
}

impl<I: Idx, T: fmt::Debug> fmt::Debug for IndexVec<I, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter_enumerated()).finish()
    }
}

impl<I: Idx, T: Serialize> Serialize for IndexVec<I, T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.raw.serialize(serializer)
    }
}

impl<'de, I: Idx, T: Deserialize<'de>> Deserialize<'de> for IndexVec<I, T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Vec::deserialize(deserializer).map(Self::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    define_index! {
        /// Test handle.
        pub struct ThingId;
    }

    #[test]
    fn test_push_returns_sequential_indices() {
        let mut v: IndexVec<ThingId, &str> = IndexVec::new();
        let a = v.push("a");
        let b = v.push("b");
        assert_eq!(a.index(), 0);
        assert_eq!(b.index(), 1);
        assert_eq!(v[b], "b");
        assert_eq!(v.next_index(), ThingId::new(2));
    }

    #[test]
    fn test_iter_enumerated() {
        let v: IndexVec<ThingId, u8> = vec![7, 8, 9].into();
        let pairs: Vec<_> = v.iter_enumerated().map(|(i, x)| (i.index(), *x)).collect();
        assert_eq!(pairs, vec![(0, 7), (1, 8), (2, 9)]);
        assert!(v.contains(ThingId::new(2)));
        assert!(!v.contains(ThingId::new(3)));
    }

    #[test]
    fn test_handle_formatting() {
        let id = ThingId::new(4);
        assert_eq!(format!("{id:?}"), "ThingId(4)");
        assert_eq!(format!("{id}"), "%4");
    }

    #[test]
    fn test_serde_is_transparent() {
        let v: IndexVec<ThingId, u32> = vec![1, 2].into();
        let json = serde_json::to_string(&v).unwrap();
        assert_eq!(json, "[1,2]");
        let back: IndexVec<ThingId, u32> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v);
        assert_eq!(serde_json::to_string(&ThingId::new(5)).unwrap(), "5");
    }
}
