//! [`Router`] maps keys onto shard positions.

use std::hash::{BuildHasher, Hasher};

/// Mask clearing the sign bit of a 64-bit hash value.
const SIGN_MASK: u64 = (1_u64 << 63) - 1;

/// [`Router`] reduces the 64-bit hash of a key into a shard position.
///
/// The raw key bytes are fed to the hasher without the `str` terminator that [`std::hash::Hash`]
/// appends, so with [`fnv::FnvBuildHasher`] the hash value is plain FNV-1a 64 of the key.
pub(crate) struct Router<H: BuildHasher> {
    build_hasher: H,
    num_shards: usize,
}

impl<H: BuildHasher> Router<H> {
    /// Creates a new [`Router`].
    ///
    /// `num_shards` must be greater than zero; the caller checks it.
    #[inline]
    pub(crate) fn new(num_shards: usize, build_hasher: H) -> Self {
        debug_assert_ne!(num_shards, 0);
        Self {
            build_hasher,
            num_shards,
        }
    }

    /// Returns the number of shard positions.
    #[inline]
    pub(crate) fn num_shards(&self) -> usize {
        self.num_shards
    }

    /// Returns the hash value of the key with the sign bit cleared.
    #[inline]
    pub(crate) fn hash(&self, key: &str) -> u64 {
        let mut hasher = self.build_hasher.build_hasher();
        hasher.write(key.as_bytes());
        hasher.finish() & SIGN_MASK
    }

    /// Returns the shard position of the key.
    ///
    /// Every position in `0..num_shards` is reachable.
    #[inline]
    pub(crate) fn index(&self, key: &str) -> usize {
        if self.num_shards == 1 {
            return 0;
        }
        // The remainder is less than `num_shards`, so it fits in `usize`.
        #[allow(clippy::cast_possible_truncation)]
        let index = (self.hash(key) % self.num_shards as u64) as usize;
        index
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use fnv::FnvBuildHasher;
    use proptest::prelude::*;

    fn router(num_shards: usize) -> Router<FnvBuildHasher> {
        Router::new(num_shards, FnvBuildHasher::default())
    }

    #[test]
    fn fnv1a_reference_values() {
        let router = router(1);
        assert_eq!(router.hash(""), 0xcbf2_9ce4_8422_2325 & SIGN_MASK);
        assert_eq!(router.hash("a"), 0xaf63_dc4c_8601_ec8c & SIGN_MASK);
        assert_eq!(router.hash("foobar"), 0x8594_4171_f739_67e8 & SIGN_MASK);
    }

    #[test]
    fn single_shard() {
        let router = router(1);
        for key in ["", "a", "b", "foobar", "\u{1f980}"] {
            assert_eq!(router.index(key), 0);
        }
    }

    #[test]
    fn deterministic() {
        let first = router(13);
        let second = router(13);
        for i in 0..1024 {
            let key = format!("key-{i}");
            assert_eq!(first.index(&key), second.index(&key));
        }
    }

    proptest! {
        #[cfg_attr(miri, ignore)]
        #[test]
        fn covers_every_shard(num_shards in 1_usize..=64) {
            let router = router(num_shards);
            let mut hits = vec![0_usize; num_shards];
            for i in 0..(num_shards * 256) {
                let index = router.index(&format!("k{i}"));
                prop_assert!(index < num_shards);
                hits[index] += 1;
            }
            prop_assert!(hits.iter().all(|h| *h > 0), "{hits:?}");
        }
    }
}
