//! Chunk arrival bitmap

/// Highest chunk count a bitmap can track
pub const MAX_TRACKED_CHUNKS: usize = 32;

/// Set of chunk indices received so far in one transfer
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChunkBitmap {
    bits: u32,
}

impl ChunkBitmap {
    pub fn new() -> Self {
        ChunkBitmap { bits: 0 }
    }

    /// Check whether `index` has been marked
    #[inline]
    pub fn contains(&self, index: u8) -> bool {
        (index as usize) < MAX_TRACKED_CHUNKS && self.bits & (1 << index) != 0
    }

    /// Mark `index` as received
    /// Returns true if newly marked, false if already present or out of range
    pub fn mark(&mut self, index: u8) -> bool {
        if index as usize >= MAX_TRACKED_CHUNKS || self.contains(index) {
            return false;
        }
        self.bits |= 1 << index;
        true
    }

    pub fn count(&self) -> usize {
        self.bits.count_ones() as usize
    }

    /// All of `0..expected` have arrived
    pub fn is_complete(&self, expected: u8) -> bool {
        (0..expected).all(|i| self.contains(i))
    }

    /// Indices in `0..expected` still outstanding
    pub fn missing(&self, expected: u8) -> impl Iterator<Item = u8> + '_ {
        (0..expected).filter(move |&i| !self.contains(i))
    }

    pub fn clear(&mut self) {
        self.bits = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_once() {
        let mut bitmap = ChunkBitmap::new();
        assert!(bitmap.mark(0));
        assert!(!bitmap.mark(0));
        assert!(bitmap.mark(1));
        assert_eq!(bitmap.count(), 2);
    }

    #[test]
    fn test_out_of_order() {
        let mut bitmap = ChunkBitmap::new();
        assert!(bitmap.mark(5));
        assert!(bitmap.mark(3));
        assert!(bitmap.mark(1));

        assert!(!bitmap.is_complete(6));
        assert_eq!(bitmap.missing(6).collect::<Vec<_>>(), vec![0, 2, 4]);

        for i in [0, 2, 4] {
            bitmap.mark(i);
        }
        assert!(bitmap.is_complete(6));
        assert!(!bitmap.is_complete(7));
    }

    #[test]
    fn test_out_of_range() {
        let mut bitmap = ChunkBitmap::new();
        assert!(bitmap.mark(31));
        assert!(!bitmap.mark(32));
        assert!(!bitmap.contains(200));
        assert_eq!(bitmap.count(), 1);
    }

    #[test]
    fn test_clear() {
        let mut bitmap = ChunkBitmap::new();
        bitmap.mark(2);
        bitmap.clear();
        assert_eq!(bitmap, ChunkBitmap::default());
        assert!(bitmap.is_complete(0));
    }
}
