//! Copy-on-write vector used for the locals of analysis states.
//!
//! Locals rarely change between adjacent instructions, so every state derived
//! from another shares the same backing storage. Cloning is a reference count
//! bump; the first write through [`CowVector::replace`] detaches the writer with a
//! private copy when, and only when, the storage is shared.
//!
//! The storage is an [`Arc`] so that analysis states stay `Send` and whole
//! analyzers can be moved onto worker threads.
//!
//! # Example
//!
//! ```rust
//! use jitscope::utils::CowVector;
//!
//! let original = CowVector::from_elem(0u32, 4);
//! let mut fork = original.clone();
//! assert!(fork.ptr_eq(&original));
//!
//! fork.replace(2, 7);
//! assert!(!fork.ptr_eq(&original));
//! assert_eq!(original[2], 0);
//! assert_eq!(fork[2], 7);
//! ```

use std::{ops::Index, sync::Arc};

/// A fixed-length vector with O(1) clone and copy-on-first-write mutation.
pub struct CowVector<T> {
    data: Arc<Vec<T>>,
}

impl<T: Clone> CowVector<T> {
    /// Creates a vector of `len` copies of `value`.
    #[must_use]
    pub fn from_elem(value: T, len: usize) -> Self {
        Self {
            data: Arc::new(vec![value; len]),
        }
    }

    /// Replaces the element at `index`.
    ///
    /// If the backing storage is referenced by any other vector it is copied
    /// first, so no other holder observes the write.
    ///
    /// # Panics
    ///
    /// Panics if `index >= self.len()`.
    pub fn replace(&mut self, index: usize, value: T) {
        Arc::make_mut(&mut self.data)[index] = value;
    }
}

impl<T> CowVector<T> {
    /// Returns the number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the vector holds no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns the element at `index`, or `None` when out of range.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&T> {
        self.data.get(index)
    }

    /// Returns an iterator over the elements.
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.data.iter()
    }

    /// Returns `true` if both vectors share the same backing storage.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    /// Returns `true` if another vector shares this backing storage.
    #[must_use]
    pub fn is_shared(&self) -> bool {
        Arc::strong_count(&self.data) > 1
    }
}

impl<T> From<Vec<T>> for CowVector<T> {
    fn from(values: Vec<T>) -> Self {
        Self {
            data: Arc::new(values),
        }
    }
}

impl<T> Clone for CowVector<T> {
    fn clone(&self) -> Self {
        Self {
            data: Arc::clone(&self.data),
        }
    }
}

impl<T> Index<usize> for CowVector<T> {
    type Output = T;

    fn index(&self, index: usize) -> &T {
        &self.data[index]
    }
}

impl<T: PartialEq> PartialEq for CowVector<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other) || self.data == other.data
    }
}

impl<T: Eq> Eq for CowVector<T> {}

impl<T: std::fmt::Debug> std::fmt::Debug for CowVector<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.data.iter()).finish()
    }
}

impl<'a, T> IntoIterator for &'a CowVector<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
