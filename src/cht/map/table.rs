use std::{borrow::Borrow, mem, sync::atomic::Ordering};

use crossbeam_epoch::{Atomic, CompareExchangeError, Guard, Owned, Pointer, Shared};

use super::bin::{destroy_bin_with_values, BinEntry};
use crate::common::error::TableError;

/// A fixed-length array of bins. Tables are never resized in place; growing
/// the map means building a larger table and forwarding every bin to it.
pub(crate) struct Table<K, V> {
    bins: Box<[Atomic<BinEntry<K, V>>]>,
    /// The forwarding entry shared by every migrated bin of this table.
    moved: Atomic<BinEntry<K, V>>,
}

impl<K, V> Table<K, V> {
    /// Allocates a table of `len` empty bins, reporting an allocation failure
    /// instead of aborting.
    pub(crate) fn try_new(len: usize) -> Result<Self, TableError> {
        assert!(len.is_power_of_two());

        let mut bins = Vec::new();
        bins.try_reserve_exact(len)
            .map_err(|_| TableError::ResourceExhausted {
                requested_bins: len,
            })?;
        bins.resize_with(len, Atomic::null);

        Ok(Self {
            bins: bins.into_boxed_slice(),
            moved: Atomic::null(),
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.bins.len()
    }

    pub(crate) fn bini(&self, hash: u64) -> usize {
        hash as usize & (self.bins.len() - 1)
    }

    pub(crate) fn bin<'g>(&self, i: usize, guard: &'g Guard) -> Shared<'g, BinEntry<K, V>> {
        self.bins[i].load(Ordering::Acquire, guard)
    }

    pub(crate) fn cas_bin<'g, P>(
        &self,
        i: usize,
        current: Shared<'_, BinEntry<K, V>>,
        new: P,
        guard: &'g Guard,
    ) -> Result<Shared<'g, BinEntry<K, V>>, CompareExchangeError<'g, BinEntry<K, V>, P>>
    where
        P: Pointer<BinEntry<K, V>>,
    {
        self.bins[i].compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire, guard)
    }

    pub(crate) fn store_bin(&self, i: usize, new: Shared<'_, BinEntry<K, V>>) {
        self.bins[i].store(new, Ordering::Release);
    }

    /// Returns the forwarding entry pointing to `next`, creating it on first
    /// use. A table only ever forwards to a single next table.
    pub(crate) fn forwarding_entry<'g>(
        &'g self,
        next: Shared<'g, Table<K, V>>,
        guard: &'g Guard,
    ) -> Shared<'g, BinEntry<K, V>> {
        let current = self.moved.load(Ordering::Acquire, guard);
        if !current.is_null() {
            return current;
        }

        let fresh = Owned::new(BinEntry::Moved(next.as_raw()));
        match self.moved.compare_exchange(
            Shared::null(),
            fresh,
            Ordering::AcqRel,
            Ordering::Acquire,
            guard,
        ) {
            Ok(installed) => installed,
            Err(CompareExchangeError { current, .. }) => current,
        }
    }

    /// Looks up `key`, following forwarding entries into newer tables.
    /// Returns the stored key and the value slot if found, and the number of
    /// forwarding entries that were followed.
    pub(crate) fn find<'g, Q>(
        &'g self,
        hash: u64,
        key: &Q,
        guard: &'g Guard,
    ) -> (Option<(&'g K, &'g Atomic<V>)>, usize)
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let mut table = self;
        let mut redirects = 0;
        loop {
            let bin = table.bin(table.bini(hash), guard);
            // SAFETY: Bins, and the tables they forward to, are destroyed
            // through the epoch, so they outlive `guard`.
            let found = match unsafe { bin.as_ref() } {
                None | Some(BinEntry::Reserved(_)) => None,
                Some(BinEntry::Node(head)) => head
                    .chain(guard)
                    .find(|node| node.matches(hash, key))
                    .map(|node| (&*node.key, &node.value)),
                Some(BinEntry::Tree(tree)) => tree
                    .find(hash, key)
                    .map(|node| (&*node.key, &node.value)),
                Some(BinEntry::Moved(next)) => {
                    table = unsafe { &**next };
                    redirects += 1;
                    continue;
                }
            };
            return (found, redirects);
        }
    }

    /// Frees every bin of this table together with the values they hold.
    ///
    /// # Safety
    ///
    /// No other thread may access the table, and no entry may be reachable
    /// from another live table.
    pub(crate) unsafe fn drop_bins(&mut self) {
        let guard = crossbeam_epoch::unprotected();
        for bin in self.bins.iter() {
            let entry = bin.swap(Shared::null(), Ordering::Relaxed, guard);
            destroy_bin_with_values(guard, entry);
        }
    }
}

impl<K, V> Drop for Table<K, V> {
    fn drop(&mut self) {
        // SAFETY: A table is dropped once no thread can reach it, and the
        // forwarding entry is owned by this table alone.
        let guard = unsafe { crossbeam_epoch::unprotected() };
        let moved = self.moved.load(Ordering::Relaxed, guard);
        if !moved.is_null() {
            mem::drop(unsafe { moved.into_owned() });
        }
    }
}
