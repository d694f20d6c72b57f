//! [`Entry`] is a node of a shard chain.

use std::sync::atomic::Ordering::{self, AcqRel, Acquire};

use sdd::{AtomicShared, Guard, Ptr, Shared, Tag};

/// The [`Tag`] of a `next` link denoting that the owner of the link has been deleted.
pub(crate) const DELETED: Tag = Tag::First;

/// [`Entry`] holds a single key-value pair in a shard chain.
///
/// The key never changes. The value is replaced as a whole by swapping the reference, and the
/// `next` link is frozen once it is tagged with [`DELETED`].
pub(crate) struct Entry<V> {
    key: String,
    value: AtomicShared<V>,
    next: AtomicShared<Entry<V>>,
}

impl<V> Entry<V> {
    /// Creates a new unlinked [`Entry`].
    #[inline]
    pub(crate) fn new(key: String, value: Shared<V>) -> Self {
        Self {
            key,
            value: AtomicShared::from(value),
            next: AtomicShared::null(),
        }
    }

    /// Returns a reference to the key.
    #[inline]
    pub(crate) fn key(&self) -> &str {
        &self.key
    }

    /// Returns a reference to the value that lives as long as the supplied [`Guard`].
    #[inline]
    pub(crate) fn value<'g>(&self, guard: &'g Guard) -> Option<&'g V> {
        self.value.load(Acquire, guard).as_ref()
    }

    /// Replaces the value and returns the previous one.
    #[inline]
    pub(crate) fn replace_value(&self, value: Shared<V>) -> Option<Shared<V>> {
        self.value.swap((Some(value), Tag::None), AcqRel).0
    }

    /// Returns a reference to the forward link.
    #[inline]
    pub(crate) fn link(&self) -> &AtomicShared<Entry<V>> {
        &self.next
    }

    /// Loads the forward link.
    ///
    /// The returned [`Ptr`] carries [`DELETED`] if `self` has been deleted.
    #[inline]
    pub(crate) fn next_ptr<'g>(&self, order: Ordering, guard: &'g Guard) -> Ptr<'g, Entry<V>> {
        self.next.load(order, guard)
    }

    /// Returns an owned reference to the entry that `next` points to, for installing it in a
    /// link with a compare-and-swap.
    ///
    /// Returns `None` if the link `next` was read from has changed since then.
    #[inline]
    pub(crate) fn owned_next(next: Ptr<'_, Entry<V>>) -> Option<Option<Shared<Entry<V>>>> {
        let next_shared = next.get_shared();
        if next_shared.is_none() && !next.is_null() {
            // The entry is being dropped, so no link can point to it anymore.
            return None;
        }
        Some(next_shared)
    }

    /// Tags the forward link with [`DELETED`] if it still points to `next`.
    ///
    /// Makes exactly one compare-and-swap attempt, and returns `false` if the link has been
    /// modified since `next` was read.
    #[inline]
    pub(crate) fn delete_self<'g>(&self, next: Ptr<'g, Entry<V>>, guard: &'g Guard) -> bool {
        if next.tag() == DELETED {
            return false;
        }
        let Some(next_shared) = Self::owned_next(next) else {
            return false;
        };
        self.next
            .compare_exchange(next, (next_shared, DELETED), AcqRel, Acquire, guard)
            .is_ok()
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod test {
    use super::*;

    impl<V> Entry<V> {
        fn is_deleted(&self) -> bool {
            self.next.tag(Acquire) == DELETED
        }
    }

    #[test]
    fn replace_value() {
        let guard = Guard::new();
        let entry = Entry::new("k".to_owned(), Shared::new(1));
        assert_eq!(entry.key(), "k");
        assert_eq!(entry.value(&guard), Some(&1));
        assert_eq!(entry.replace_value(Shared::new(2)).map(|v| *v), Some(1));
        assert_eq!(entry.value(&guard), Some(&2));
    }

    #[test]
    fn owned_next() {
        let guard = Guard::new();
        let entry = Entry::new("a".to_owned(), Shared::new(1));
        let next_ptr = entry.next_ptr(Acquire, &guard);
        assert!(Entry::owned_next(next_ptr).is_some_and(|n| n.is_none()));

        let appended = Shared::new(Entry::new("b".to_owned(), Shared::new(2)));
        assert!(entry
            .link()
            .compare_exchange(next_ptr, (Some(appended), Tag::None), AcqRel, Acquire, &guard)
            .is_ok());
        let next_ptr = entry.next_ptr(Acquire, &guard);
        let owned = Entry::owned_next(next_ptr).flatten();
        assert!(owned.is_some_and(|n| n.key() == "b"));
    }

    #[test]
    fn delete_self() {
        let guard = Guard::new();
        let entry = Entry::new("a".to_owned(), Shared::new(1));
        let next_ptr = entry.next_ptr(Acquire, &guard);
        assert!(!entry.is_deleted());
        assert!(entry.delete_self(next_ptr, &guard));
        assert!(entry.is_deleted());

        // A deleted entry cannot be deleted again.
        let next_ptr = entry.next_ptr(Acquire, &guard);
        assert!(!entry.delete_self(next_ptr, &guard));
    }

    #[test]
    fn delete_self_stale_link() {
        let guard = Guard::new();
        let entry = Entry::new("a".to_owned(), Shared::new(1));
        let stale = entry.next_ptr(Acquire, &guard);
        let appended = Shared::new(Entry::new("b".to_owned(), Shared::new(2)));
        assert!(entry
            .link()
            .compare_exchange(stale, (Some(appended), Tag::None), AcqRel, Acquire, &guard)
            .is_ok());

        // The link now points to the appended entry.
        assert!(!entry.delete_self(stale, &guard));
        assert!(!entry.is_deleted());

        // A tagged link rejects appending.
        let next_ptr = entry.next_ptr(Acquire, &guard);
        assert!(entry.delete_self(next_ptr, &guard));
        let tail = next_ptr.as_ref().map(|e| e.next_ptr(Acquire, &guard));
        assert!(tail.is_some_and(|p| p.is_null()));
        assert!(entry
            .link()
            .compare_exchange(
                next_ptr,
                (Some(Shared::new(Entry::new("c".to_owned(), Shared::new(3)))), Tag::None),
                AcqRel,
                Acquire,
                &guard
            )
            .is_err());
    }
}
