//! A fixed-size mutable bitset with the wire bit layout.
//!
//! Bits are stored least-significant-bit first within each byte: bit `i`
//! lives in byte `i / 8` at position `i % 8`. This is the layout of the
//! columns-set and nulls bitsets in the row-operations wire format, so the
//! packed bytes can be appended to an encoded row verbatim.

/// A fixed-size bitset backed by a byte vector.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BitSet {
    buffer: Vec<u8>,
    len: usize,
}

impl BitSet {
    /// Creates a bitset with `len` unset bits.
    pub fn with_size(len: usize) -> Self {
        Self {
            buffer: vec![0; len.div_ceil(8)],
            len,
        }
    }

    /// Sets bit `idx`.
    ///
    /// # Panics
    ///
    /// Panics if `idx` is out of bounds.
    pub fn set(&mut self, idx: usize) {
        assert!(idx < self.len);
        self.buffer[idx / 8] |= 1 << (idx % 8);
    }

    /// Clears bit `idx`.
    ///
    /// # Panics
    ///
    /// Panics if `idx` is out of bounds.
    pub fn unset(&mut self, idx: usize) {
        assert!(idx < self.len);
        self.buffer[idx / 8] &= !(1 << (idx % 8));
    }

    /// Returns whether bit `idx` is set.
    ///
    /// # Panics
    ///
    /// Panics if `idx` is out of bounds.
    pub fn get(&self, idx: usize) -> bool {
        assert!(idx < self.len);
        (self.buffer[idx / 8] >> (idx % 8)) & 1 != 0
    }

    /// The number of bits in this bitset.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the bitset stores zero bits.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The number of bytes backing this bitset.
    pub fn byte_len(&self) -> usize {
        self.buffer.len()
    }

    /// The packed bytes, LSB-first per byte, trailing bits zero.
    pub fn bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// The number of set bits.
    pub fn count_ones(&self) -> usize {
        // Invariant: bits outside of [0, len) are always 0.
        self.buffer.iter().map(|v| v.count_ones() as usize).sum()
    }

    /// Overwrite this bitset from packed bytes with the same layout.
    ///
    /// # Panics
    ///
    /// Panics if `bytes` is shorter than [`Self::byte_len`]. Extra trailing
    /// bits in the final byte are masked off.
    pub fn load(&mut self, bytes: &[u8]) {
        let n = self.buffer.len();
        self.buffer.copy_from_slice(&bytes[..n]);
        let rem = self.len % 8;
        if rem != 0 {
            if let Some(last) = self.buffer.last_mut() {
                *last &= (1 << rem) - 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::prelude::*;
    use rand::rngs::OsRng;
    use rand::RngCore;

    /// Computes a compacted representation of a given bool array
    fn compact_bools(bools: &[bool]) -> Vec<u8> {
        bools
            .chunks(8)
            .map(|x| {
                let mut collect = 0_u8;
                for (idx, set) in x.iter().enumerate() {
                    if *set {
                        collect |= 1 << idx
                    }
                }
                collect
            })
            .collect()
    }

    #[test]
    fn test_bit_layout() {
        let mut mask = BitSet::with_size(10);
        for idx in [2, 3, 6, 8] {
            mask.set(idx);
        }
        assert_eq!(mask.bytes(), &[0b01001100, 0b00000001]);
        assert_eq!(mask.count_ones(), 4);

        mask.unset(3);
        assert_eq!(mask.bytes(), &[0b01000100, 0b00000001]);
        assert!(!mask.get(3));
        assert!(mask.get(2));
    }

    #[test]
    fn test_sizes() {
        for (bits, bytes) in [(0, 0), (1, 1), (8, 1), (9, 2), (64, 8), (65, 9)] {
            let b = BitSet::with_size(bits);
            assert_eq!(b.len(), bits);
            assert_eq!(b.byte_len(), bytes);
        }
        assert!(BitSet::with_size(0).is_empty());
    }

    #[test]
    fn test_set_get_fuzz() {
        let seed = OsRng.next_u64();
        println!("Seed: {seed}");
        let mut rng = StdRng::seed_from_u64(seed);

        for _ in 0..100 {
            let len = (rng.next_u32() % 50) as usize;
            let bools: Vec<bool> = std::iter::from_fn(|| Some(rng.next_u32() & 1 == 0))
                .take(len)
                .collect();

            let mut mask = BitSet::with_size(len);
            for (idx, set) in bools.iter().enumerate() {
                if *set {
                    mask.set(idx);
                }
            }

            assert_eq!(mask.bytes(), compact_bools(&bools));
            for (idx, set) in bools.iter().enumerate() {
                assert_eq!(mask.get(idx), *set);
            }
            assert_eq!(mask.count_ones(), bools.iter().filter(|b| **b).count());
        }
    }

    #[test]
    #[should_panic = "idx < self.len"]
    fn test_out_of_bounds() {
        let mut v = BitSet::with_size(4);
        v.set(5);
    }

    proptest! {
        #[test]
        fn prop_load_round_trip(
            values in prop::collection::vec(any::<bool>(), 0..40),
        ) {
            let mut b = BitSet::with_size(values.len());
            for (idx, set) in values.iter().enumerate() {
                if *set {
                    b.set(idx);
                }
            }

            let mut reloaded = BitSet::with_size(values.len());
            reloaded.load(b.bytes());
            prop_assert_eq!(&reloaded, &b);

            // Loading from a buffer with garbage trailing bits masks them off.
            let mut dirty = b.bytes().to_vec();
            if let Some(last) = dirty.last_mut() {
                *last |= 0xF0;
            }
            let mut masked = BitSet::with_size(values.len());
            masked.load(&dirty);
            prop_assert_eq!(masked.count_ones() >= b.count_ones(), true);
            for (idx, set) in values.iter().enumerate() {
                if *set {
                    prop_assert!(masked.get(idx));
                }
            }
        }
    }
}
