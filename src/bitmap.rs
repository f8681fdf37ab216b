use core::{
    alloc::{Layout, LayoutError},
    ptr::NonNull,
};

/// A packed array of bits backed by borrowed `u64` words.
pub struct Bitmap {
    num_bits: usize,
    map: NonNull<u64>,
}

impl Bitmap {
    /// Returns the layout of the words backing a bitmap of `num_bits` bits.
    pub fn map_layout(num_bits: usize) -> Result<Layout, LayoutError> {
        Layout::array::<u64>(Self::num_blocks(num_bits))
    }

    /// Constructs a new bitmap of `num_bits` bits, backed by `map`.
    ///
    /// All bits are cleared.
    ///
    /// # Safety
    ///
    /// Behavior is undefined if any of the following conditions are violated:
    /// - `map` must be valid for reads and writes of
    ///   `Self::num_blocks(num_bits)` words, and it must be properly aligned.
    /// - No other reference to that memory may exist for the lifetime of the
    ///   bitmap.
    pub unsafe fn new(num_bits: usize, map: NonNull<u64>) -> Bitmap {
        for i in 0..Self::num_blocks(num_bits) {
            unsafe { map.as_ptr().add(i).write(0) };
        }

        Bitmap { num_bits, map }
    }

    /// Returns the number of `u64` words needed for `num_bits` bits.
    #[inline]
    pub const fn num_blocks(num_bits: usize) -> usize {
        num_bits.div_ceil(u64::BITS as usize)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.num_bits
    }

    /// Returns a tuple of the index of the `u64` containing `bit` and a mask
    /// which extracts it.
    #[inline]
    const fn index_and_mask(bit: usize) -> (usize, u64) {
        (
            bit / u64::BITS as usize,
            1 << (bit as u64 % u64::BITS as u64),
        )
    }

    #[inline]
    fn words(&self) -> &[u64] {
        // SAFETY: `map` holds `num_blocks(num_bits)` initialized words that
        // only this bitmap refers to.
        unsafe { core::slice::from_raw_parts(self.map.as_ptr(), Self::num_blocks(self.num_bits)) }
    }

    #[inline]
    fn words_mut(&mut self) -> &mut [u64] {
        // SAFETY: as in `words`, and `&mut self` guarantees exclusivity.
        unsafe {
            core::slice::from_raw_parts_mut(self.map.as_ptr(), Self::num_blocks(self.num_bits))
        }
    }

    /// Gets the value of the indexed bit.
    #[inline]
    pub fn get(&self, index: usize) -> bool {
        assert!(index < self.num_bits);

        let (block_idx, mask) = Self::index_and_mask(index);
        self.words()[block_idx] & mask != 0
    }

    /// Toggles the value of the indexed bit and returns its new value.
    #[inline]
    pub fn toggle(&mut self, index: usize) -> bool {
        assert!(index < self.num_bits);

        let (block_idx, mask) = Self::index_and_mask(index);
        let block = &mut self.words_mut()[block_idx];
        *block ^= mask;
        *block & mask != 0
    }

    /// Returns `true` if no bit is set.
    pub fn is_clear(&self) -> bool {
        self.words().iter().all(|&w| w == 0)
    }

    #[cfg(test)]
    pub fn to_vec(&self) -> alloc::vec::Vec<u64> {
        self.words().to_vec()
    }
}
