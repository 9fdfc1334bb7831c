//! Key position search over sentinel-padded node key arrays.
//!
//! Nodes keep their unused key slots filled with the key type's
//! maximum value, so a search never has to mask a partial vector
//! register. The scalar walk is the portable baseline; the vectorized
//! kernels compare a whole 256-bit tile per step and are selected at
//! runtime per tree.

use crate::Key;

/// Strategy a tree uses to locate key positions inside a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySearch {
    /// Branchy per-slot walk. Works everywhere.
    Scalar,
    /// 256-bit comparisons over aligned key tiles. Requires a CPU with
    /// avx2, and key arrays whose byte size divides evenly into
    /// 32-byte tiles. Trees silently fall back to [`KeySearch::Scalar`]
    /// when either condition fails.
    Avx2,
}

impl KeySearch {
    /// Returns the widest strategy the running CPU supports.
    pub fn detect() -> KeySearch {
        #[cfg(target_arch = "x86_64")]
        {
            if is_x86_feature_detected!("avx2") {
                return KeySearch::Avx2;
            }
        }
        KeySearch::Scalar
    }
}

/// Position of the first slot at or above `query`, or `len` when every
/// live key is below it. Slots past `len` are never inspected.
pub(crate) fn find_index_scalar<K: Key>(keys: &[K], len: usize, query: K) -> usize {
    let mut i = 0;
    while i < len && query > keys[i] {
        i += 1;
    }
    i
}

/// True when `keys` can be walked in whole aligned 256-bit tiles.
#[cfg(target_arch = "x86_64")]
fn tile_aligned<K>(keys: &[K], lanes: usize) -> bool {
    keys.len() % lanes == 0 && keys.as_ptr().align_offset(32) == 0
}

/// Vectorized search over an `i8` key array. Falls back to the scalar
/// walk when the CPU or the array layout cannot take the fast path.
pub(crate) fn find_index_i8(keys: &[i8], len: usize, query: i8) -> usize {
    debug_assert!(len <= keys.len());
    #[cfg(target_arch = "x86_64")]
    {
        if tile_aligned(keys, 32) && is_x86_feature_detected!("avx2") {
            // SAFETY: avx2 is present and the key array is 32-byte
            // aligned with a whole number of tiles, checked just above.
            return unsafe { avx2::find_index_i8(keys, len, query) };
        }
    }
    find_index_scalar(keys, len, query)
}

/// Vectorized search over an `i16` key array. The 16-bit kernel also
/// needs bmi2 to compact its double-pumped movemask.
pub(crate) fn find_index_i16(keys: &[i16], len: usize, query: i16) -> usize {
    debug_assert!(len <= keys.len());
    #[cfg(target_arch = "x86_64")]
    {
        if tile_aligned(keys, 16)
            && is_x86_feature_detected!("avx2")
            && is_x86_feature_detected!("bmi2")
        {
            // SAFETY: avx2 and bmi2 are present and the key array is
            // 32-byte aligned with a whole number of tiles.
            return unsafe { avx2::find_index_i16(keys, len, query) };
        }
    }
    find_index_scalar(keys, len, query)
}

/// Vectorized search over an `i32` key array.
pub(crate) fn find_index_i32(keys: &[i32], len: usize, query: i32) -> usize {
    debug_assert!(len <= keys.len());
    #[cfg(target_arch = "x86_64")]
    {
        if tile_aligned(keys, 8) && is_x86_feature_detected!("avx2") {
            // SAFETY: avx2 is present and the key array is 32-byte
            // aligned with a whole number of tiles.
            return unsafe { avx2::find_index_i32(keys, len, query) };
        }
    }
    find_index_scalar(keys, len, query)
}

/// Vectorized search over an `i64` key array.
pub(crate) fn find_index_i64(keys: &[i64], len: usize, query: i64) -> usize {
    debug_assert!(len <= keys.len());
    #[cfg(target_arch = "x86_64")]
    {
        if tile_aligned(keys, 4) && is_x86_feature_detected!("avx2") {
            // SAFETY: avx2 is present and the key array is 32-byte
            // aligned with a whole number of tiles.
            return unsafe { avx2::find_index_i64(keys, len, query) };
        }
    }
    find_index_scalar(keys, len, query)
}

#[cfg(target_arch = "x86_64")]
mod avx2 {
    //! One kernel per key width. Each broadcasts the query, compares a
    //! full register of keys at a time, and reads the position of the
    //! first key at or above the query straight out of the movemask.
    //! Sentinel padding guarantees the answer is found before the walk
    //! can run past the live prefix.

    use std::arch::x86_64::{
        _mm256_castsi256_pd, _mm256_castsi256_ps, _mm256_cmpgt_epi16, _mm256_cmpgt_epi32,
        _mm256_cmpgt_epi64, _mm256_cmpgt_epi8, _mm256_load_si256, _mm256_movemask_epi8,
        _mm256_movemask_pd, _mm256_movemask_ps, _mm256_set1_epi16, _mm256_set1_epi32,
        _mm256_set1_epi64x, _mm256_set1_epi8, _pext_u32,
    };

    /// # Safety
    ///
    /// Requires avx2. `keys` must be 32-byte aligned, hold a whole
    /// number of 32-lane tiles, and have `len <= keys.len()`.
    #[target_feature(enable = "avx2")]
    pub(super) unsafe fn find_index_i8(keys: &[i8], len: usize, query: i8) -> usize {
        const LANES: usize = 32;
        const EVERY_LANE_BELOW: u32 = u32::MAX;

        let needle = _mm256_set1_epi8(query);
        let mut base = 0;
        while base < len {
            // SAFETY: base is tile-aligned and in bounds per the
            // function contract.
            let tile = unsafe { _mm256_load_si256(keys.as_ptr().add(base).cast()) };
            let below = _mm256_movemask_epi8(_mm256_cmpgt_epi8(needle, tile)) as u32;
            if below != EVERY_LANE_BELOW {
                return base + (!below).trailing_zeros() as usize;
            }
            base += LANES;
        }
        len
    }

    /// # Safety
    ///
    /// Requires avx2 and bmi2. `keys` must be 32-byte aligned, hold a
    /// whole number of 16-lane tiles, and have `len <= keys.len()`.
    #[target_feature(enable = "avx2")]
    #[target_feature(enable = "bmi2")]
    pub(super) unsafe fn find_index_i16(keys: &[i16], len: usize, query: i16) -> usize {
        const LANES: usize = 16;
        const EVERY_LANE_BELOW: u32 = 0xffff;

        let needle = _mm256_set1_epi16(query);
        let mut base = 0;
        while base < len {
            // SAFETY: base is tile-aligned and in bounds per the
            // function contract.
            let tile = unsafe { _mm256_load_si256(keys.as_ptr().add(base).cast()) };
            // The byte movemask doubles every 16-bit lane; pext keeps
            // one bit per lane.
            let wide = _mm256_movemask_epi8(_mm256_cmpgt_epi16(needle, tile)) as u32;
            let below = _pext_u32(wide, 0xaaaa_aaaa);
            if below != EVERY_LANE_BELOW {
                return base + (!below).trailing_zeros() as usize;
            }
            base += LANES;
        }
        len
    }

    /// # Safety
    ///
    /// Requires avx2. `keys` must be 32-byte aligned, hold a whole
    /// number of 8-lane tiles, and have `len <= keys.len()`.
    #[target_feature(enable = "avx2")]
    pub(super) unsafe fn find_index_i32(keys: &[i32], len: usize, query: i32) -> usize {
        const LANES: usize = 8;
        const EVERY_LANE_BELOW: u32 = 0xff;

        let needle = _mm256_set1_epi32(query);
        let mut base = 0;
        while base < len {
            // SAFETY: base is tile-aligned and in bounds per the
            // function contract.
            let tile = unsafe { _mm256_load_si256(keys.as_ptr().add(base).cast()) };
            let mask = _mm256_cmpgt_epi32(needle, tile);
            let below = _mm256_movemask_ps(_mm256_castsi256_ps(mask)) as u32;
            if below != EVERY_LANE_BELOW {
                return base + (!below).trailing_zeros() as usize;
            }
            base += LANES;
        }
        len
    }

    /// # Safety
    ///
    /// Requires avx2. `keys` must be 32-byte aligned, hold a whole
    /// number of 4-lane tiles, and have `len <= keys.len()`.
    #[target_feature(enable = "avx2")]
    pub(super) unsafe fn find_index_i64(keys: &[i64], len: usize, query: i64) -> usize {
        const LANES: usize = 4;
        const EVERY_LANE_BELOW: u32 = 0xf;

        let needle = _mm256_set1_epi64x(query);
        let mut base = 0;
        while base < len {
            // SAFETY: base is tile-aligned and in bounds per the
            // function contract.
            let tile = unsafe { _mm256_load_si256(keys.as_ptr().add(base).cast()) };
            let mask = _mm256_cmpgt_epi64(needle, tile);
            let below = _mm256_movemask_pd(_mm256_castsi256_pd(mask)) as u32;
            if below != EVERY_LANE_BELOW {
                return base + (!below).trailing_zeros() as usize;
            }
            base += LANES;
        }
        len
    }
}
