//! [`LockFreeMap`] is a fixed-capacity sharded lock-free map.

use std::fmt::{self, Debug};
use std::hash::BuildHasher;
use std::sync::atomic::AtomicIsize;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed};

use fnv::FnvBuildHasher;
use sdd::{AtomicShared, Guard, Ptr, Shared, Tag};

use crate::chain::{Entry, DELETED};
use crate::router::Router;

/// The number of shards of a [`LockFreeMap`] created by [`Default::default`].
pub const DEFAULT_NUM_SHARDS: usize = 64;

/// Sharded lock-free map.
///
/// [`LockFreeMap`] maps string keys to values of a single type `V`. It owns a fixed number of
/// shards, and each shard anchors a singly linked chain of entries that is modified solely
/// through compare-and-swap operations.
///
/// ## The key features of [`LockFreeMap`]
///
/// * Lock-free: no operation blocks another; insertion retries when it loses a race.
/// * Fixed capacity: the number of shards is set at construction and never changes.
/// * Whole-value replacement: updating a value swaps an atomic reference, so readers never
///   observe a partially written value.
/// * Deferred reclamation: deleted entries and replaced values are reclaimed by [`sdd`] once no
///   reader can reach them.
///
/// ## Consistency
///
/// Operations on different shards are independent, and operations on the same shard serialize
/// at each compare-and-swap. [`LockFreeMap::range`] does not provide a snapshot, and
/// [`LockFreeMap::len`] is an approximation under concurrent modification.
///
/// ## Deletion
///
/// [`LockFreeMap::delete`] makes a single attempt and gives up when a concurrent structural
/// change on the same chain got in first. Callers that need the key to be gone retry at the
/// call site.
pub struct LockFreeMap<V, H = FnvBuildHasher>
where
    H: BuildHasher,
{
    shards: Box<[AtomicShared<Entry<V>>]>,
    len: AtomicIsize,
    router: Router<H>,
}

impl<V> LockFreeMap<V, FnvBuildHasher> {
    /// Creates an empty [`LockFreeMap`] with the specified number of shards.
    ///
    /// Keys are routed by FNV-1a.
    ///
    /// # Panics
    ///
    /// Panics if `num_shards` is zero.
    ///
    /// # Examples
    ///
    /// ```
    /// use lfm::LockFreeMap;
    ///
    /// let map: LockFreeMap<u64> = LockFreeMap::new(16);
    /// assert_eq!(map.num_shards(), 16);
    /// ```
    #[inline]
    #[must_use]
    pub fn new(num_shards: usize) -> Self {
        Self::with_hasher(num_shards, FnvBuildHasher::default())
    }
}

impl<V, H> LockFreeMap<V, H>
where
    H: BuildHasher,
{
    /// Creates an empty [`LockFreeMap`] with the specified number of shards and
    /// [`BuildHasher`].
    ///
    /// # Panics
    ///
    /// Panics if `num_shards` is zero.
    ///
    /// # Examples
    ///
    /// ```
    /// use lfm::LockFreeMap;
    /// use std::collections::hash_map::RandomState;
    ///
    /// let map: LockFreeMap<u64, RandomState> = LockFreeMap::with_hasher(8, RandomState::new());
    /// assert!(map.is_empty());
    /// ```
    #[inline]
    pub fn with_hasher(num_shards: usize, build_hasher: H) -> Self {
        assert!(num_shards > 0, "a LockFreeMap needs at least one shard");
        trace_event!(debug, num_shards, "creating a lock-free map");
        Self {
            shards: (0..num_shards).map(|_| AtomicShared::null()).collect(),
            len: AtomicIsize::new(0),
            router: Router::new(num_shards, build_hasher),
        }
    }

    /// Returns the number of shards.
    #[inline]
    pub fn num_shards(&self) -> usize {
        self.router.num_shards()
    }

    /// Returns a reference to the value associated with the key.
    ///
    /// The returned reference stays valid as long as the [`Guard`] is alive, even if the entry is
    /// deleted or its value is replaced in the meantime.
    ///
    /// # Examples
    ///
    /// ```
    /// use lfm::{Guard, LockFreeMap};
    ///
    /// let map: LockFreeMap<u64> = LockFreeMap::new(4);
    /// map.store("a", 1);
    ///
    /// let guard = Guard::new();
    /// assert_eq!(map.peek("a", &guard), Some(&1));
    /// assert!(map.peek("b", &guard).is_none());
    /// ```
    #[inline]
    pub fn peek<'g>(&'g self, key: &str, guard: &'g Guard) -> Option<&'g V> {
        self.find(key, guard).and_then(|entry| entry.value(guard))
    }

    /// Reads the entry associated with the key through the supplied closure.
    ///
    /// Returns `None` if the key does not exist.
    ///
    /// # Examples
    ///
    /// ```
    /// use lfm::LockFreeMap;
    ///
    /// let map: LockFreeMap<String> = LockFreeMap::new(4);
    /// map.store("a", "apple".to_owned());
    ///
    /// assert_eq!(map.peek_with("a", |_, v| v.len()), Some(5));
    /// assert!(map.peek_with("b", |_, v| v.len()).is_none());
    /// ```
    #[inline]
    pub fn peek_with<R, F: FnOnce(&str, &V) -> R>(&self, key: &str, reader: F) -> Option<R> {
        let guard = Guard::new();
        let entry = self.find(key, &guard)?;
        entry.value(&guard).map(|value| reader(entry.key(), value))
    }

    /// Returns a clone of the value associated with the key.
    ///
    /// Returns `None` if the key does not exist.
    ///
    /// # Examples
    ///
    /// ```
    /// use lfm::LockFreeMap;
    ///
    /// let map: LockFreeMap<u64> = LockFreeMap::new(4);
    /// assert!(map.load("a").is_none());
    ///
    /// map.store("a", 1);
    /// assert_eq!(map.load("a"), Some(1));
    /// ```
    #[inline]
    pub fn load(&self, key: &str) -> Option<V>
    where
        V: Clone,
    {
        self.peek_with(key, |_, v| v.clone())
    }

    /// Returns `true` if the key exists.
    ///
    /// # Examples
    ///
    /// ```
    /// use lfm::LockFreeMap;
    ///
    /// let map: LockFreeMap<u64> = LockFreeMap::new(4);
    /// map.store("a", 1);
    ///
    /// assert!(map.contains("a"));
    /// assert!(!map.contains("b"));
    /// ```
    #[inline]
    pub fn contains(&self, key: &str) -> bool {
        self.peek_with(key, |_, _| ()).is_some()
    }

    /// Deletes the key.
    ///
    /// Returns `true` if the key was found and deleted. The method makes exactly one
    /// compare-and-swap attempt to delete the entry, and returns `false` without retrying if a
    /// concurrent modification of the same chain got in first; callers that require the key to
    /// be gone retry at the call site.
    ///
    /// # Examples
    ///
    /// ```
    /// use lfm::LockFreeMap;
    ///
    /// let map: LockFreeMap<u64> = LockFreeMap::new(4);
    /// assert!(!map.delete("a"));
    ///
    /// map.store("a", 1);
    /// assert!(map.delete("a"));
    /// assert!(map.load("a").is_none());
    /// ```
    #[inline]
    pub fn delete(&self, key: &str) -> bool {
        let guard = Guard::new();
        let shard = &self.shards[self.router.index(key)];
        let mut link = shard;
        let mut current = link.load(Acquire, &guard);
        while let Some(entry) = current.as_ref() {
            let next = entry.next_ptr(Acquire, &guard);
            if next.tag() == DELETED {
                if !Self::unlink(link, current, next, &guard) {
                    link = entry.link();
                }
                current = next.without_tag();
                continue;
            }
            if entry.key() == key {
                if !entry.delete_self(next, &guard) {
                    trace_event!(trace, key, "delete lost a race");
                    return false;
                }
                self.len.fetch_sub(1, Relaxed);
                if !Self::unlink(link, current, next, &guard) {
                    trace_event!(trace, key, "unlink failed, cleaning up the shard");
                    Self::cleanup(shard, &guard);
                }
                return true;
            }
            link = entry.link();
            current = next;
        }
        false
    }

    /// Visits every entry until the visitor returns `false`.
    ///
    /// Shards are visited in ascending order, and entries within a shard in chain order. Entries
    /// inserted or deleted during the scan may or may not be visited.
    ///
    /// # Examples
    ///
    /// ```
    /// use lfm::LockFreeMap;
    ///
    /// let map: LockFreeMap<u64> = LockFreeMap::new(4);
    /// map.store("a", 1);
    /// map.store("b", 2);
    /// map.store("c", 3);
    ///
    /// let mut sum = 0;
    /// map.range(|_, v| {
    ///     sum += *v;
    ///     true
    /// });
    /// assert_eq!(sum, 6);
    ///
    /// let mut visited = 0;
    /// map.range(|_, _| {
    ///     visited += 1;
    ///     false
    /// });
    /// assert_eq!(visited, 1);
    /// ```
    #[inline]
    pub fn range<F: FnMut(&str, &V) -> bool>(&self, mut visitor: F) {
        let guard = Guard::new();
        for shard in self.shards.iter() {
            let mut current = shard.load(Acquire, &guard);
            while let Some(entry) = current.as_ref() {
                let next = entry.next_ptr(Acquire, &guard);
                if next.tag() != DELETED {
                    if let Some(value) = entry.value(&guard) {
                        if !visitor(entry.key(), value) {
                            return;
                        }
                    }
                }
                current = next.without_tag();
            }
        }
    }

    /// Returns the number of entries.
    ///
    /// The counter is updated next to each insertion and deletion, but not atomically with them,
    /// so the result is an approximation while the map is being modified.
    ///
    /// # Examples
    ///
    /// ```
    /// use lfm::LockFreeMap;
    ///
    /// let map: LockFreeMap<u64> = LockFreeMap::new(4);
    /// map.store("a", 1);
    /// map.store("b", 2);
    /// map.store("a", 3);
    /// assert_eq!(map.len(), 2);
    /// ```
    #[inline]
    pub fn len(&self) -> usize {
        usize::try_from(self.len.load(Relaxed)).unwrap_or(0)
    }

    /// Returns `true` if the map is empty.
    ///
    /// # Examples
    ///
    /// ```
    /// use lfm::LockFreeMap;
    ///
    /// let map: LockFreeMap<u64> = LockFreeMap::new(4);
    /// assert!(map.is_empty());
    ///
    /// map.store("a", 1);
    /// assert!(!map.is_empty());
    /// ```
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Finds the live entry associated with the key.
    fn find<'g>(&self, key: &str, guard: &'g Guard) -> Option<&'g Entry<V>> {
        let mut current = self.shards[self.router.index(key)].load(Acquire, guard);
        while let Some(entry) = current.as_ref() {
            let next = entry.next_ptr(Acquire, guard);
            if next.tag() != DELETED && entry.key() == key {
                return Some(entry);
            }
            current = next.without_tag();
        }
        None
    }

    /// Unlinks every deleted entry in the chain, starting over from the head whenever an unlink
    /// fails.
    ///
    /// Every entry deleted before the call is unreachable from `shard` when this returns.
    fn cleanup<'g>(shard: &'g AtomicShared<Entry<V>>, guard: &'g Guard) {
        'restart: loop {
            let mut link = shard;
            let mut current = link.load(Acquire, guard);
            while let Some(entry) = current.as_ref() {
                let next = entry.next_ptr(Acquire, guard);
                if next.tag() == DELETED {
                    if !Self::unlink(link, current, next, guard) {
                        continue 'restart;
                    }
                } else {
                    link = entry.link();
                }
                current = next.without_tag();
            }
            return;
        }
    }

    /// Unlinks the deleted entry that `current` points to by making a single compare-and-swap
    /// attempt on `link`.
    ///
    /// `next` is the forward link of the deleted entry.
    fn unlink<'g>(
        link: &AtomicShared<Entry<V>>,
        current: Ptr<'g, Entry<V>>,
        next: Ptr<'g, Entry<V>>,
        guard: &'g Guard,
    ) -> bool {
        let Some(next_shared) = Entry::owned_next(next.without_tag()) else {
            return false;
        };
        link.compare_exchange(current, (next_shared, Tag::None), AcqRel, Acquire, guard)
            .is_ok()
    }
}

impl<V: 'static, H> LockFreeMap<V, H>
where
    H: BuildHasher,
{
    /// Stores the key-value pair, replacing the value if the key exists.
    ///
    /// # Examples
    ///
    /// ```
    /// use lfm::LockFreeMap;
    ///
    /// let map: LockFreeMap<u64> = LockFreeMap::new(4);
    /// map.store("a", 1);
    /// map.store("a", 2);
    /// assert_eq!(map.load("a"), Some(2));
    /// ```
    #[inline]
    pub fn store(&self, key: &str, value: V) {
        let guard = Guard::new();
        let value = Shared::new(value);
        if let Some(entry) = self.insert_entry(key, &value, &guard) {
            entry.replace_value(value);
        }
    }

    /// Returns the value associated with the key, or stores the supplied value if the key does
    /// not exist.
    ///
    /// The returned flag is `true` if the supplied value was stored.
    ///
    /// # Examples
    ///
    /// ```
    /// use lfm::LockFreeMap;
    ///
    /// let map: LockFreeMap<u64> = LockFreeMap::new(4);
    /// assert_eq!(map.load_or_store("a", 1), (1, true));
    /// assert_eq!(map.load_or_store("a", 2), (1, false));
    /// ```
    #[inline]
    pub fn load_or_store(&self, key: &str, value: V) -> (V, bool)
    where
        V: Clone,
    {
        let guard = Guard::new();
        let value = Shared::new(value);
        match self.insert_entry(key, &value, &guard) {
            Some(entry) => (entry.value(&guard).unwrap_or(&*value).clone(), false),
            None => ((*value).clone(), true),
        }
    }

    /// Stores the key-value pair, and returns the previous value if the key existed.
    ///
    /// # Examples
    ///
    /// ```
    /// use lfm::LockFreeMap;
    ///
    /// let map: LockFreeMap<u64> = LockFreeMap::new(4);
    /// assert!(map.load_and_store("a", 1).is_none());
    /// assert_eq!(map.load_and_store("a", 2), Some(1));
    /// assert_eq!(map.load("a"), Some(2));
    /// ```
    #[inline]
    pub fn load_and_store(&self, key: &str, value: V) -> Option<V>
    where
        V: Clone,
    {
        let guard = Guard::new();
        let value = Shared::new(value);
        let entry = self.insert_entry(key, &value, &guard)?;
        entry
            .replace_value(value)
            .map(|previous| (*previous).clone())
    }

    /// Stores the key-value pair if the key does not exist.
    ///
    /// Returns `false` and leaves the map untouched if the key exists.
    ///
    /// # Examples
    ///
    /// ```
    /// use lfm::LockFreeMap;
    ///
    /// let map: LockFreeMap<u64> = LockFreeMap::new(4);
    /// assert!(map.store_not_exists("a", 1));
    /// assert!(!map.store_not_exists("a", 2));
    /// assert_eq!(map.load("a"), Some(1));
    /// ```
    #[inline]
    pub fn store_not_exists(&self, key: &str, value: V) -> bool {
        let guard = Guard::new();
        let value = Shared::new(value);
        self.insert_entry(key, &value, &guard).is_none()
    }

    /// Appends a new entry holding `value` to the chain unless a live entry with the key exists.
    ///
    /// Returns the existing entry, or `None` if a new entry was appended.
    fn insert_entry<'g>(
        &self,
        key: &str,
        value: &Shared<V>,
        guard: &'g Guard,
    ) -> Option<&'g Entry<V>> {
        let shard = &self.shards[self.router.index(key)];
        let mut candidate: Option<Shared<Entry<V>>> = None;
        'restart: loop {
            let mut link = shard;
            let mut current = link.load(Acquire, guard);
            loop {
                if let Some(entry) = current.as_ref() {
                    let next = entry.next_ptr(Acquire, guard);
                    if next.tag() == DELETED {
                        if Self::unlink(link, current, next, guard) {
                            current = next.without_tag();
                            continue;
                        }
                        continue 'restart;
                    }
                    if entry.key() == key {
                        return Some(entry);
                    }
                    link = entry.link();
                    current = next;
                    continue;
                }

                let new_entry = candidate
                    .take()
                    .unwrap_or_else(|| Shared::new(Entry::new(key.to_owned(), value.clone())));
                match link.compare_exchange(
                    current,
                    (Some(new_entry), Tag::None),
                    AcqRel,
                    Acquire,
                    guard,
                ) {
                    Ok(_) => {
                        self.len.fetch_add(1, Relaxed);
                        return None;
                    }
                    Err((passed, actual)) => {
                        candidate = passed;
                        if actual.tag() == DELETED {
                            // The owner of `link` has been deleted.
                            trace_event!(trace, key, "append raced with a delete, restarting");
                            continue 'restart;
                        }
                        current = actual;
                    }
                }
            }
        }
    }
}

impl<V, H> Debug for LockFreeMap<V, H>
where
    V: Debug,
    H: BuildHasher,
{
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_map();
        self.range(|k, v| {
            d.entry(&k, v);
            true
        });
        d.finish()
    }
}

impl<V, H> Default for LockFreeMap<V, H>
where
    H: BuildHasher + Default,
{
    /// Creates an empty [`LockFreeMap`] with [`DEFAULT_NUM_SHARDS`] shards.
    ///
    /// # Examples
    ///
    /// ```
    /// use lfm::{LockFreeMap, DEFAULT_NUM_SHARDS};
    ///
    /// let map: LockFreeMap<u64> = LockFreeMap::default();
    /// assert_eq!(map.num_shards(), DEFAULT_NUM_SHARDS);
    /// ```
    #[inline]
    fn default() -> Self {
        Self::with_hasher(DEFAULT_NUM_SHARDS, H::default())
    }
}

impl<V: 'static, H> Extend<(String, V)> for LockFreeMap<V, H>
where
    H: BuildHasher,
{
    #[inline]
    fn extend<T: IntoIterator<Item = (String, V)>>(&mut self, iter: T) {
        iter.into_iter().for_each(|(k, v)| self.store(&k, v));
    }
}

impl<V: 'static, H> FromIterator<(String, V)> for LockFreeMap<V, H>
where
    H: BuildHasher + Default,
{
    #[inline]
    fn from_iter<T: IntoIterator<Item = (String, V)>>(iter: T) -> Self {
        let mut map = Self::default();
        map.extend(iter);
        map
    }
}

impl<V, H> PartialEq for LockFreeMap<V, H>
where
    V: PartialEq,
    H: BuildHasher,
{
    /// Compares two [`LockFreeMap`] instances.
    ///
    /// The result is only reliable if neither map is being modified, since the comparison
    /// starts by checking [`LockFreeMap::len`], which is approximate under concurrent
    /// modification.
    ///
    /// # Examples
    ///
    /// ```
    /// use lfm::LockFreeMap;
    ///
    /// let map1: LockFreeMap<u64> = LockFreeMap::new(2);
    /// map1.store("a", 1);
    ///
    /// let map2: LockFreeMap<u64> = LockFreeMap::new(8);
    /// map2.store("a", 1);
    /// assert_eq!(map1, map2);
    ///
    /// map2.store("a", 2);
    /// assert_ne!(map1, map2);
    /// ```
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        if self.len() != other.len() {
            return false;
        }
        let mut equal = true;
        self.range(|k, v| {
            equal = other.peek_with(k, |_, o| o == v).unwrap_or(false);
            equal
        });
        equal
    }
}

#[cfg(all(test, not(feature = "loom")))]
impl<V, H> LockFreeMap<V, H>
where
    H: BuildHasher,
{
    /// Returns the number of entries reachable from the shards, including deleted ones.
    pub(crate) fn num_linked_entries(&self) -> usize {
        let guard = Guard::new();
        let mut num_entries = 0;
        for shard in self.shards.iter() {
            let mut current = shard.load(Acquire, &guard);
            while let Some(entry) = current.as_ref() {
                num_entries += 1;
                current = entry.next_ptr(Acquire, &guard).without_tag();
            }
        }
        num_entries
    }
}
