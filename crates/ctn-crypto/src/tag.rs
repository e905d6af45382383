//! 128-bit authentication tag stored as two words, no heap allocation.

use crate::TAG_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Tag128 {
    lo: u64,
    hi: u64,
}

impl Tag128 {
    pub const fn new(lo: u64, hi: u64) -> Self {
        Self { lo, hi }
    }

    pub const fn lo(&self) -> u64 {
        self.lo
    }

    pub const fn hi(&self) -> u64 {
        self.hi
    }

    /// Read a tag from a 16-byte little-endian span.
    pub fn from_bytes(bytes: &[u8; TAG_SIZE]) -> Self {
        let mut lo = [0u8; 8];
        let mut hi = [0u8; 8];
        lo.copy_from_slice(&bytes[..8]);
        hi.copy_from_slice(&bytes[8..]);
        Self {
            lo: u64::from_le_bytes(lo),
            hi: u64::from_le_bytes(hi),
        }
    }

    pub fn to_bytes(&self) -> [u8; TAG_SIZE] {
        let mut out = [0u8; TAG_SIZE];
        out[..8].copy_from_slice(&self.lo.to_le_bytes());
        out[8..].copy_from_slice(&self.hi.to_le_bytes());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_byte_layout_is_little_endian() {
        let tag = Tag128::new(0x0807_0605_0403_0201, 0x100f_0e0d_0c0b_0a09);
        let bytes = tag.to_bytes();
        assert_eq!(
            bytes,
            [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16]
        );
    }

    proptest! {
        #[test]
        fn bytes_roundtrip(bytes in any::<[u8; 16]>()) {
            let tag = Tag128::from_bytes(&bytes);
            prop_assert_eq!(tag.to_bytes(), bytes);
        }
    }
}
