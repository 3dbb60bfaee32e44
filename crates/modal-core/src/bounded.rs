//! Fixed-capacity vector
//!
//! Neighbor lists, peer tables and mode banks have hard upper bounds set by
//! the wire format. Inserting past the bound is an explicit error, never a
//! silent truncation.

use std::ops::Deref;

use crate::{ModalError, ModalResult};

/// Vector that refuses to grow past `N` elements
#[derive(Clone, Debug, PartialEq)]
pub struct BoundedVec<T, const N: usize> {
    items: Vec<T>,
}

impl<T, const N: usize> BoundedVec<T, N> {
    pub const CAPACITY: usize = N;

    pub fn new() -> Self {
        BoundedVec {
            items: Vec::with_capacity(N),
        }
    }

    /// Append an element, failing once the vector is full
    pub fn try_push(&mut self, item: T) -> ModalResult<()> {
        if self.items.len() >= N {
            return Err(ModalError::CapacityExceeded {
                what: "bounded vector",
                capacity: N,
            });
        }
        self.items.push(item);
        Ok(())
    }

    /// Build from an iterator, failing if it yields more than `N` items
    pub fn try_from_iter<I: IntoIterator<Item = T>>(iter: I) -> ModalResult<Self> {
        let mut out = Self::new();
        for item in iter {
            out.try_push(item)?;
        }
        Ok(out)
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.items.len() >= N
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn retain<F: FnMut(&T) -> bool>(&mut self, f: F) {
        self.items.retain(f);
    }

    pub fn as_slice(&self) -> &[T] {
        &self.items
    }
}

impl<T: PartialEq, const N: usize> BoundedVec<T, N> {
    /// Push unless an equal element is already present
    pub fn try_insert_unique(&mut self, item: T) -> ModalResult<bool> {
        if self.items.contains(&item) {
            return Ok(false);
        }
        self.try_push(item)?;
        Ok(true)
    }
}

impl<T, const N: usize> Default for BoundedVec<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize> Deref for BoundedVec<T, N> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &self.items
    }
}

impl<'a, T, const N: usize> IntoIterator for &'a BoundedVec<T, N> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_past_capacity() {
        let mut v: BoundedVec<u8, 2> = BoundedVec::new();
        v.try_push(1).unwrap();
        v.try_push(2).unwrap();
        assert!(v.is_full());

        let err = v.try_push(3).unwrap_err();
        assert!(matches!(err, ModalError::CapacityExceeded { capacity: 2, .. }));
        assert_eq!(v.as_slice(), &[1, 2]);
    }

    #[test]
    fn test_insert_unique() {
        let mut v: BoundedVec<u8, 3> = BoundedVec::new();
        assert!(v.try_insert_unique(7).unwrap());
        assert!(!v.try_insert_unique(7).unwrap());
        assert_eq!(v.len(), 1);
    }

    #[test]
    fn test_from_iter_overflow() {
        let ok: ModalResult<BoundedVec<u8, 4>> = BoundedVec::try_from_iter(0..4);
        assert_eq!(ok.unwrap().len(), 4);

        let too_many: ModalResult<BoundedVec<u8, 4>> = BoundedVec::try_from_iter(0..5);
        assert!(too_many.is_err());
    }
}
