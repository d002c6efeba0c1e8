//! A concurrent hash map with per-bin locks, whose table is grown by the
//! threads that use it.

pub(crate) mod bin;
pub(crate) mod resize;
pub(crate) mod table;
pub(crate) mod tree_bin;

use std::{
    borrow::Borrow,
    collections::hash_map::RandomState,
    fmt,
    hash::{BuildHasher, Hash},
    panic::{self, AssertUnwindSafe},
    sync::atomic::Ordering,
};

use crossbeam_epoch::{Atomic, Guard, Owned, Shared};
use triomphe::Arc as TrioArc;

use self::{
    bin::{
        bin_from_entries, defer_acquire_destroy, defer_destroy_bin_with_values,
        defer_destroy_nodes, BinEntry, BinLock, Node,
    },
    resize::{ResizeCoordinator, ResizeStats},
    table::Table,
    tree_bin::TreeBin,
};
use super::iter::{Iter, Keys};
use crate::{
    builder::HashMapBuilder,
    common::{
        builder_utils::table_len_for_capacity,
        constants::{LOAD_FACTOR, MIN_TREEIFY_CAPACITY, TREEIFY_THRESHOLD},
        error::TableError,
    },
};

/// Default hasher for `HashMap`.
pub type DefaultHashBuilder = RandomState;

/// A concurrent hash map whose table grows without a global lock.
///
/// Reads never block. Writes lock the single bin they touch. When the map
/// gets too full, the thread whose insertion crossed the threshold starts
/// moving bins to a table twice as large, and any thread that runs into the
/// resize joins it by moving a range of bins itself. No thread waits for a
/// whole resize, and there is no background thread.
///
/// Bins whose chain grows long are turned into balanced trees, so a map
/// suffering from many hash collisions still performs lookups in logarithmic
/// time.
///
/// Values are returned as clones. If cloning `V` is expensive, wrap it in an
/// `std::sync::Arc`.
///
/// By default, `HashMap` uses a hashing algorithm selected to provide
/// resistance against HashDoS attacks. It can be replaced on a per-`HashMap`
/// basis using the [`with_hasher`] and [`with_capacity_and_hasher`] methods,
/// or with the [`builder`]. Many alternative algorithms are available on
/// crates.io, such as the [`aHash`] crate.
///
/// It is a logic error for a key to be modified in such a way that the key's
/// hash, as determined by the [`Hash`] trait, or its equality, as determined by
/// the [`Eq`] trait, changes while it is in the map.
///
/// [`aHash`]: https://crates.io/crates/ahash
/// [`with_hasher`]: #method.with_hasher
/// [`with_capacity_and_hasher`]: #method.with_capacity_and_hasher
/// [`builder`]: #method.builder
/// [`Eq`]: https://doc.rust-lang.org/std/cmp/trait.Eq.html
/// [`Hash`]: https://doc.rust-lang.org/std/hash/trait.Hash.html
pub struct HashMap<K, V, S = DefaultHashBuilder> {
    tables: ResizeCoordinator<K, V>,
    build_hasher: S,
}

/// The result of an operation that took effect, along with the result of the
/// table growth it triggered or helped with.
pub(crate) struct Applied<T> {
    pub(crate) output: T,
    pub(crate) growth: Result<(), TableError>,
}

enum PutOutcome<V> {
    Inserted,
    Replaced(V),
    Kept(V),
}

impl<K, V> HashMap<K, V, DefaultHashBuilder> {
    /// Creates an empty `HashMap`.
    ///
    /// The map does not allocate its table until it is first inserted into.
    pub fn new() -> Self {
        Self::with_capacity_and_hasher(0, DefaultHashBuilder::default())
    }

    /// Creates an empty `HashMap` able to hold at least `capacity` entries
    /// before it grows.
    ///
    /// The table is still allocated on the first insertion.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_capacity_and_hasher(capacity, DefaultHashBuilder::default())
    }

    /// Returns a [`HashMapBuilder`][builder-struct], which can build a
    /// `HashMap` with various configurations.
    ///
    /// [builder-struct]: ./struct.HashMapBuilder.html
    pub fn builder() -> HashMapBuilder<K, V> {
        HashMapBuilder::default()
    }
}

impl<K, V, S> HashMap<K, V, S> {
    /// Creates an empty `HashMap` that uses `build_hasher` to hash the keys.
    pub fn with_hasher(build_hasher: S) -> Self {
        Self::with_capacity_and_hasher(0, build_hasher)
    }

    /// Creates an empty `HashMap` able to hold at least `capacity` entries
    /// before it grows, using `build_hasher` to hash the keys.
    pub fn with_capacity_and_hasher(capacity: usize, build_hasher: S) -> Self {
        Self::with_everything(None, table_len_for_capacity(capacity, LOAD_FACTOR), build_hasher)
    }

    pub(crate) fn with_everything(
        name: Option<String>,
        initial_table_len: usize,
        build_hasher: S,
    ) -> Self {
        Self {
            tables: ResizeCoordinator::new(name, initial_table_len),
            build_hasher,
        }
    }

    /// Returns the number of entries in the map.
    ///
    /// The count is updated after each insertion and removal takes effect, so
    /// it can be briefly off while other threads are writing.
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    /// Returns `true` if the map contains no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of bins of the current table, or 0 if the table has
    /// not been allocated yet.
    ///
    /// The map grows once it holds three quarters as many entries as it has
    /// bins.
    pub fn capacity(&self) -> usize {
        let guard = &crossbeam_epoch::pin();
        unsafe { self.tables.current(guard).as_ref() }.map_or(0, Table::len)
    }

    /// Returns the counts of the resize work done since the map was created.
    pub fn resize_stats(&self) -> ResizeStats {
        self.tables.stats()
    }

    /// Returns a reference to the map's `BuildHasher`.
    pub fn hasher(&self) -> &S {
        &self.build_hasher
    }

    /// Visits the bins of the current table whose index is congruent to
    /// `index` modulo `stride`, following forwarding entries. `stride` must
    /// be a power of two no larger than any table the map ever had.
    ///
    /// Since tables only ever double, every entry is found under exactly one
    /// `index` in `0..stride`, whatever resizes happen between calls.
    pub(crate) fn scan_bins<T>(
        &self,
        stride: usize,
        index: usize,
        with_entry: &mut impl FnMut(&K, &V) -> T,
        out: &mut Vec<T>,
    ) {
        let guard = &crossbeam_epoch::pin();
        let Some(table) = (unsafe { self.tables.current(guard).as_ref() }) else {
            return;
        };
        let mut i = index;
        while i < table.len() {
            Self::scan_bin(table, i, with_entry, out, guard);
            i += stride;
        }
    }

    fn scan_bin<T>(
        table: &Table<K, V>,
        i: usize,
        with_entry: &mut impl FnMut(&K, &V) -> T,
        out: &mut Vec<T>,
        guard: &Guard,
    ) {
        let bin = table.bin(i, guard);
        let value_of = |value: &Atomic<V>| unsafe { value.load(Ordering::Acquire, guard).deref() };
        match unsafe { bin.as_ref() } {
            None | Some(BinEntry::Reserved(_)) => (),
            Some(BinEntry::Node(first)) => {
                for node in first.chain(guard) {
                    out.push(with_entry(&*node.key, value_of(&node.value)));
                }
            }
            Some(BinEntry::Tree(tree)) => {
                for node in tree.iter() {
                    out.push(with_entry(&*node.key, value_of(&node.value)));
                }
            }
            Some(BinEntry::Moved(next)) => {
                // The entries of bin `i` went to bins `i` and `i + n` of a
                // table of length `2 * n`.
                let next = unsafe { &**next };
                Self::scan_bin(next, i, with_entry, out, guard);
                Self::scan_bin(next, i + table.len(), with_entry, out, guard);
            }
        }
    }

    /// Returns an iterator visiting clones of all key-value pairs.
    ///
    /// The iterator is weakly consistent: it yields every entry that is in
    /// the map for the whole iteration exactly once, and may or may not yield
    /// entries inserted or removed meanwhile. It never fails because of a
    /// concurrent resize.
    pub fn iter(&self) -> Iter<'_, K, V, S>
    where
        K: Clone,
        V: Clone,
    {
        Iter::new(self, self.capacity())
    }

    /// Returns an iterator visiting clones of all keys, with the same
    /// consistency as [`iter`](#method.iter).
    pub fn keys(&self) -> Keys<'_, K, V, S>
    where
        K: Clone,
    {
        Keys::new(self, self.capacity())
    }

    /// Returns the output of an operation that took effect, logging the
    /// error of the table growth it may have run into.
    fn settle<T>(&self, applied: Applied<T>) -> T {
        if let Err(_e) = applied.growth {
            #[cfg(feature = "logging")]
            log::error!("{}{_e}", self.tables.log_prefix());
        }
        applied.output
    }
}

impl<K: Hash + Eq, V, S: BuildHasher> HashMap<K, V, S> {
    /// Returns a clone of the value corresponding to the key.
    ///
    /// The key may be any borrowed form of the map's key type, but
    /// [`Hash`] and [`Eq`] on the borrowed form *must* match those for
    /// the key type.
    ///
    /// [`Hash`]: https://doc.rust-lang.org/std/hash/trait.Hash.html
    /// [`Eq`]: https://doc.rust-lang.org/std/cmp/trait.Eq.html
    #[inline]
    pub fn get<Q: Hash + Eq + ?Sized>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        V: Clone,
    {
        self.get_key_value_and(key, |_, v| v.clone())
    }

    /// Returns the result of invoking a function with a reference to the
    /// value corresponding to the key.
    #[inline]
    pub fn get_and<Q: Hash + Eq + ?Sized, F: FnOnce(&V) -> T, T>(
        &self,
        key: &Q,
        with_value: F,
    ) -> Option<T>
    where
        K: Borrow<Q>,
    {
        self.get_key_value_and(key, move |_, v| with_value(v))
    }

    /// Returns the result of invoking a function with a reference to the
    /// key-value pair corresponding to the supplied key.
    ///
    /// A lookup that lands on a bin already moved by a resize in flight
    /// continues in the next table without waiting.
    pub fn get_key_value_and<Q: Hash + Eq + ?Sized, F: FnOnce(&K, &V) -> T, T>(
        &self,
        key: &Q,
        with_entry: F,
    ) -> Option<T>
    where
        K: Borrow<Q>,
    {
        let hash = bin::hash(&self.build_hasher, key);
        let guard = &crossbeam_epoch::pin();

        let table = unsafe { self.tables.current(guard).as_ref() }?;
        let (found, _redirects) = table.find(hash, key, guard);
        let (key, value) = found?;
        let value = unsafe { value.load(Ordering::Acquire, guard).deref() };
        Some(with_entry(key, value))
    }

    /// Returns `true` if the map contains a value for the key.
    #[inline]
    pub fn contains_key<Q: Hash + Eq + ?Sized>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
    {
        self.get_key_value_and(key, |_, _| ()).is_some()
    }

    /// Inserts a key-value pair into the map, returning a clone of the value
    /// previously corresponding to the key.
    ///
    /// An insertion can make the table grow, in which case this thread takes
    /// part in moving the bins. If the larger table cannot be allocated, the
    /// insertion still takes effect, the error is logged, and the map stops
    /// growing. Use [`try_insert`](#method.try_insert) to get the error back.
    ///
    /// # Panics
    ///
    /// Panics if called from within the closure of a
    /// [`compute_if_absent`](#method.compute_if_absent) call on this map for
    /// a key of the same bin, or if the first table cannot be allocated.
    pub fn insert(&self, key: K, value: V) -> Option<V>
    where
        V: Clone,
    {
        match self.put(key, value, false) {
            Ok(applied) => self.settle(applied),
            Err(e) => panic!("{e}"),
        }
    }

    /// Inserts a key-value pair into the map, returning a clone of the value
    /// previously corresponding to the key, or the error met on the way.
    ///
    /// On `Err(TableError::ResourceExhausted { .. })` the pair has been
    /// inserted, but the table could not grow. On
    /// `Err(TableError::ReservedBin { .. })` the pair may or may not have been
    /// inserted, depending on whether the reserved bin was the one of the key.
    pub fn try_insert(&self, key: K, value: V) -> Result<Option<V>, TableError>
    where
        V: Clone,
    {
        let Applied { output, growth } = self.put(key, value, false)?;
        growth.map(|()| output)
    }

    /// Inserts a key-value pair into the map unless the key is already
    /// present. Returns `None` if the pair was inserted, or a clone of the
    /// current value otherwise.
    ///
    /// # Panics
    ///
    /// Panics under the same conditions as [`insert`](#method.insert).
    pub fn insert_if_absent(&self, key: K, value: V) -> Option<V>
    where
        V: Clone,
    {
        match self.put(key, value, true) {
            Ok(applied) => self.settle(applied),
            Err(e) => panic!("{e}"),
        }
    }

    /// Returns a clone of the value corresponding to the key, first inserting
    /// the value returned by `init` if the key is absent.
    ///
    /// `init` is called at most once, and only if the key is absent. Other
    /// writers to the same bin wait while it runs, so it should be short. It
    /// should not update the key's bin: such updates from `init` are refused
    /// with [`TableError::ReservedBin`], and a resize started from `init`
    /// completes once this call returns.
    ///
    /// If `init` panics, the key stays absent and the panic is propagated.
    ///
    /// # Panics
    ///
    /// Panics if the key's bin is reserved by an outer `compute_if_absent`
    /// call of the current thread, or if the first table cannot be allocated.
    pub fn compute_if_absent(&self, key: K, init: impl FnOnce() -> V) -> V
    where
        V: Clone,
    {
        match self.compute(key, init) {
            Ok(applied) => self.settle(applied),
            Err(e) => panic!("{e}"),
        }
    }

    /// Like [`compute_if_absent`](#method.compute_if_absent), but returns
    /// the errors met on the way instead of logging them or panicking.
    pub fn try_compute_if_absent(&self, key: K, init: impl FnOnce() -> V) -> Result<V, TableError>
    where
        V: Clone,
    {
        let Applied { output, growth } = self.compute(key, init)?;
        growth.map(|()| output)
    }

    /// Removes a key from the map, returning a clone of the value previously
    /// corresponding to the key.
    ///
    /// The key may be any borrowed form of the map's key type, but
    /// [`Hash`] and [`Eq`] on the borrowed form *must* match those for
    /// the key type.
    ///
    /// [`Hash`]: https://doc.rust-lang.org/std/hash/trait.Hash.html
    /// [`Eq`]: https://doc.rust-lang.org/std/cmp/trait.Eq.html
    #[inline]
    pub fn remove<Q: Hash + Eq + ?Sized>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        V: Clone,
    {
        self.remove_entry_if_and(key, |_, _| true, |_, v| v.clone())
    }

    /// Removes a key from the map if a condition is met, returning a clone of
    /// the value previously corresponding to the key.
    ///
    /// `condition` is invoked under the bin lock, at most once.
    #[inline]
    pub fn remove_if<Q: Hash + Eq + ?Sized, F: FnMut(&K, &V) -> bool>(
        &self,
        key: &Q,
        condition: F,
    ) -> Option<V>
    where
        K: Borrow<Q>,
        V: Clone,
    {
        self.remove_entry_if_and(key, condition, |_, v| v.clone())
    }

    /// Removes a key from the map if a condition is met, returning the result
    /// of invoking a function with a reference to the key-value pair
    /// previously corresponding to the key.
    ///
    /// # Panics
    ///
    /// Panics if called from within the closure of a
    /// [`compute_if_absent`](#method.compute_if_absent) call on this map for
    /// a key of the same bin.
    pub fn remove_entry_if_and<
        Q: Hash + Eq + ?Sized,
        F: FnMut(&K, &V) -> bool,
        G: FnOnce(&K, &V) -> T,
        T,
    >(
        &self,
        key: &Q,
        condition: F,
        with_previous_entry: G,
    ) -> Option<T>
    where
        K: Borrow<Q>,
    {
        let hash = bin::hash(&self.build_hasher, key);
        let guard = &crossbeam_epoch::pin();

        match self.delete(hash, key, condition, with_previous_entry, guard) {
            Ok(applied) => self.settle(applied),
            Err(e) => panic!("{e}"),
        }
    }

    /// Grows the table ahead of time so that it can hold at least
    /// `additional` more entries before it grows again. Errors are logged.
    pub fn reserve(&self, additional: usize) {
        if let Err(_e) = self.try_reserve(additional) {
            #[cfg(feature = "logging")]
            log::error!("{}{_e}", self.tables.log_prefix());
        }
    }

    /// Grows the table ahead of time so that it can hold at least
    /// `additional` more entries before it grows again.
    ///
    /// The growth goes through the regular resize protocol, so concurrent
    /// readers and writers keep going while it runs and may help with it.
    /// If it meets a resize that is being completed by another thread and
    /// can no longer be joined, it returns without waiting, and the table
    /// may be smaller than requested.
    pub fn try_reserve(&self, additional: usize) -> Result<(), TableError> {
        let wanted = table_len_for_capacity(self.len().saturating_add(additional), LOAD_FACTOR);
        if wanted == 0 {
            return Ok(());
        }
        let guard = &crossbeam_epoch::pin();
        self.tables.try_presize(wanted, guard)
    }

    /// Removes every entry from the map.
    ///
    /// Bins are emptied one at a time under their locks, so entries inserted
    /// concurrently may survive the call.
    pub fn clear(&self) {
        let guard = &crossbeam_epoch::pin();

        let mut removed = 0;
        let mut table = self.tables.current(guard);
        let mut i = 0;
        while let Some(t) = unsafe { table.as_ref() } {
            if i >= t.len() {
                break;
            }
            let head = t.bin(i, guard);
            let Some(entry) = (unsafe { head.as_ref() }) else {
                i += 1;
                continue;
            };

            let lock = match entry {
                BinEntry::Moved(next) => {
                    table = self.help_transfer(table, *next, guard);
                    i = 0;
                    continue;
                }
                BinEntry::Reserved(lock) => {
                    if lock.wait(i).is_err() {
                        i += 1;
                    }
                    continue;
                }
                BinEntry::Node(node) => &node.lock,
                BinEntry::Tree(tree) => &tree.lock,
            };

            // Bins held by a computation of this thread are left as is.
            let Ok(_bin_lock) = lock.lock(i) else {
                i += 1;
                continue;
            };
            if t.bin(i, guard) != head {
                continue;
            }
            removed += match entry {
                BinEntry::Node(first) => first.chain(guard).count(),
                BinEntry::Tree(tree) => tree.len(),
                _ => unreachable!(),
            };
            t.store_bin(i, Shared::null());
            unsafe { defer_destroy_bin_with_values(guard, head) };
            i += 1;
        }

        self.tables.sub_count(removed);
    }

    /// Helps with the resize in flight, logging any error met while moving
    /// bins, and returns the table to continue with.
    fn help_transfer<'g>(
        &'g self,
        table: Shared<'g, Table<K, V>>,
        next: *const Table<K, V>,
        guard: &'g Guard,
    ) -> Shared<'g, Table<K, V>> {
        match self.tables.help_transfer(table, next, guard) {
            Ok(next) => next,
            Err(e) => {
                self.settle(Applied {
                    output: (),
                    growth: Err(e),
                });
                Shared::from(next)
            }
        }
    }

    fn put(&self, key: K, value: V, only_if_absent: bool) -> Result<Applied<Option<V>>, TableError>
    where
        V: Clone,
    {
        let hash = bin::hash(&self.build_hasher, &key);
        let guard = &crossbeam_epoch::pin();
        let value = Owned::new(value).into_shared(guard);

        match self.put_value(hash, TrioArc::new(key), value, only_if_absent, guard) {
            Ok(Applied { output, growth }) => {
                let output = match output {
                    PutOutcome::Inserted => None,
                    PutOutcome::Replaced(previous) => Some(previous),
                    PutOutcome::Kept(current) => {
                        // SAFETY: The value was never published.
                        drop(unsafe { value.into_owned() });
                        Some(current)
                    }
                };
                Ok(Applied { output, growth })
            }
            Err(e) => {
                drop(unsafe { value.into_owned() });
                Err(e)
            }
        }
    }

    fn put_value<'g>(
        &'g self,
        hash: u64,
        key: TrioArc<K>,
        value: Shared<'g, V>,
        only_if_absent: bool,
        guard: &'g Guard,
    ) -> Result<Applied<PutOutcome<V>>, TableError>
    where
        V: Clone,
    {
        let mut growth = Ok(());
        let mut table = self.tables.init_table(guard)?;

        loop {
            let t = unsafe { table.deref() };
            let i = t.bini(hash);
            let head = t.bin(i, guard);

            let Some(entry) = (unsafe { head.as_ref() }) else {
                let node = Owned::new(BinEntry::Node(Node::new(
                    hash,
                    TrioArc::clone(&key),
                    value,
                    Shared::null(),
                )));
                if t.cas_bin(i, Shared::null(), node, guard).is_ok() {
                    break;
                }
                continue;
            };

            let lock = match entry {
                BinEntry::Moved(next) => {
                    table = match self.tables.help_transfer(table, *next, guard) {
                        Ok(next) => next,
                        Err(e) => {
                            growth = growth.and(Err(e));
                            Shared::from(*next)
                        }
                    };
                    continue;
                }
                BinEntry::Reserved(lock) => {
                    lock.wait(i)?;
                    continue;
                }
                BinEntry::Node(node) => &node.lock,
                BinEntry::Tree(tree) => &tree.lock,
            };

            let bin_lock = lock.lock(i)?;
            if t.bin(i, guard) != head {
                continue;
            }

            match entry {
                BinEntry::Node(first) => {
                    let mut last = first;
                    let mut chain_len = 0;
                    for node in first.chain(guard) {
                        if node.hash == hash && *node.key == *key {
                            let output =
                                Self::update_value(&node.value, value, only_if_absent, guard);
                            return Ok(Applied { output, growth });
                        }
                        chain_len += 1;
                        last = node;
                    }

                    let node = Node::new(hash, key, value, Shared::null());
                    last.next.store(Owned::new(BinEntry::Node(node)), Ordering::Release);
                    drop(bin_lock);

                    if chain_len + 1 >= TREEIFY_THRESHOLD {
                        growth = growth.and(self.treeify_bin(t, i, guard));
                    }
                }
                BinEntry::Tree(tree) => {
                    if let Some(node) = tree.find(hash, &*key) {
                        let output = Self::update_value(&node.value, value, only_if_absent, guard);
                        return Ok(Applied { output, growth });
                    }

                    let grown = tree.with_entry((hash, key, value), guard);
                    t.store_bin(i, Owned::new(BinEntry::Tree(grown)).into_shared(guard));
                    drop(bin_lock);
                    // The values now belong to the new tree.
                    unsafe { defer_acquire_destroy(guard, head) };
                }
                BinEntry::Moved(_) | BinEntry::Reserved(_) => unreachable!(),
            }
            break;
        }

        let growth = growth.and(self.tables.add_count(1, guard));
        Ok(Applied {
            output: PutOutcome::Inserted,
            growth,
        })
    }

    fn update_value<'g>(
        slot: &'g Atomic<V>,
        value: Shared<'g, V>,
        only_if_absent: bool,
        guard: &'g Guard,
    ) -> PutOutcome<V>
    where
        V: Clone,
    {
        if only_if_absent {
            let current = unsafe { slot.load(Ordering::Acquire, guard).deref() };
            return PutOutcome::Kept(current.clone());
        }

        let previous = slot.swap(value, Ordering::AcqRel, guard);
        let output = unsafe { previous.deref() }.clone();
        unsafe { defer_acquire_destroy(guard, previous) };
        PutOutcome::Replaced(output)
    }

    fn compute(&self, key: K, init: impl FnOnce() -> V) -> Result<Applied<V>, TableError>
    where
        V: Clone,
    {
        let hash = bin::hash(&self.build_hasher, &key);
        let guard = &crossbeam_epoch::pin();

        let mut growth = Ok(());
        let mut table = self.tables.init_table(guard)?;

        loop {
            let t = unsafe { table.deref() };
            let i = t.bini(hash);
            let head = t.bin(i, guard);

            let Some(entry) = (unsafe { head.as_ref() }) else {
                let reservation = Owned::new(BinEntry::Reserved(BinLock::new()));
                let reservation = reservation.into_shared(guard);
                let Some(lock) = (unsafe { reservation.deref() }).lock() else {
                    unreachable!();
                };
                let reserved = match lock.lock(i) {
                    Ok(reserved) => reserved,
                    Err(e) => {
                        drop(unsafe { reservation.into_owned() });
                        return Err(e);
                    }
                };
                if t.cas_bin(i, Shared::null(), reservation, guard).is_err() {
                    drop(reserved);
                    drop(unsafe { reservation.into_owned() });
                    continue;
                }

                let value = match lock.compute(init) {
                    Ok(value) => value,
                    Err(payload) => {
                        t.store_bin(i, Shared::null());
                        drop(reserved);
                        unsafe { defer_acquire_destroy(guard, reservation) };
                        let _ = self.tables.resume_stalled_transfer(guard);
                        panic::resume_unwind(payload);
                    }
                };

                let output = value.clone();
                let value = Owned::new(value).into_shared(guard);
                let node = Node::new(hash, TrioArc::new(key), value, Shared::null());
                t.store_bin(i, Owned::new(BinEntry::Node(node)).into_shared(guard));
                drop(reserved);
                unsafe { defer_acquire_destroy(guard, reservation) };

                let growth = growth
                    .and(self.tables.resume_stalled_transfer(guard))
                    .and(self.tables.add_count(1, guard));
                return Ok(Applied { output, growth });
            };

            let lock = match entry {
                BinEntry::Moved(next) => {
                    table = match self.tables.help_transfer(table, *next, guard) {
                        Ok(next) => next,
                        Err(e) => {
                            growth = growth.and(Err(e));
                            Shared::from(*next)
                        }
                    };
                    continue;
                }
                BinEntry::Reserved(lock) => {
                    lock.wait(i)?;
                    continue;
                }
                BinEntry::Node(node) => &node.lock,
                BinEntry::Tree(tree) => &tree.lock,
            };

            let bin_lock = lock.lock(i)?;
            if t.bin(i, guard) != head {
                continue;
            }

            let (present, chain_len) = match entry {
                BinEntry::Node(first) => {
                    let present = first.chain(guard).find(|node| node.matches(hash, &key));
                    (present.map(|node| &node.value), first.chain(guard).count())
                }
                BinEntry::Tree(tree) => {
                    let present = tree.find(hash, &key);
                    (present.map(|node| &node.value), tree.len())
                }
                BinEntry::Moved(_) | BinEntry::Reserved(_) => unreachable!(),
            };
            if let Some(slot) = present {
                let output = unsafe { slot.load(Ordering::Acquire, guard).deref() }.clone();
                return Ok(Applied { output, growth });
            }

            // The bin stays locked while `init` runs. Resizes that `init`
            // takes part in skip it, and stall if they cannot finish without
            // it.
            let value = match lock.compute(init) {
                Ok(value) => value,
                Err(payload) => {
                    drop(bin_lock);
                    let _ = self.tables.resume_stalled_transfer(guard);
                    panic::resume_unwind(payload);
                }
            };
            let output = value.clone();
            let value = Owned::new(value).into_shared(guard);

            match entry {
                BinEntry::Node(first) => {
                    let node = Node::new(hash, TrioArc::new(key), value, Shared::null());
                    let last = first.chain(guard).last().unwrap_or(first);
                    last.next.store(Owned::new(BinEntry::Node(node)), Ordering::Release);
                    drop(bin_lock);

                    growth = growth.and(self.tables.resume_stalled_transfer(guard));
                    if chain_len + 1 >= TREEIFY_THRESHOLD {
                        growth = growth.and(self.treeify_bin(t, i, guard));
                    }
                }
                BinEntry::Tree(tree) => {
                    let grown = tree.with_entry((hash, TrioArc::new(key), value), guard);
                    t.store_bin(i, Owned::new(BinEntry::Tree(grown)).into_shared(guard));
                    drop(bin_lock);
                    // The values now belong to the new tree.
                    unsafe { defer_acquire_destroy(guard, head) };

                    growth = growth.and(self.tables.resume_stalled_transfer(guard));
                }
                BinEntry::Moved(_) | BinEntry::Reserved(_) => unreachable!(),
            }

            let growth = growth.and(self.tables.add_count(1, guard));
            return Ok(Applied { output, growth });
        }
    }

    fn delete<'g, Q, F, G, T>(
        &'g self,
        hash: u64,
        key: &Q,
        mut condition: F,
        with_previous_entry: G,
        guard: &'g Guard,
    ) -> Result<Applied<Option<T>>, TableError>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
        F: FnMut(&K, &V) -> bool,
        G: FnOnce(&K, &V) -> T,
    {
        let mut growth = Ok(());
        let mut table = self.tables.current(guard);

        loop {
            let Some(t) = (unsafe { table.as_ref() }) else {
                return Ok(Applied { output: None, growth });
            };
            let i = t.bini(hash);
            let head = t.bin(i, guard);
            let Some(entry) = (unsafe { head.as_ref() }) else {
                return Ok(Applied { output: None, growth });
            };

            let lock = match entry {
                BinEntry::Moved(next) => {
                    table = match self.tables.help_transfer(table, *next, guard) {
                        Ok(next) => next,
                        Err(e) => {
                            growth = growth.and(Err(e));
                            Shared::from(*next)
                        }
                    };
                    continue;
                }
                BinEntry::Reserved(lock) => {
                    lock.wait(i)?;
                    continue;
                }
                BinEntry::Node(node) => &node.lock,
                BinEntry::Tree(tree) => &tree.lock,
            };

            let _bin_lock = lock.lock(i)?;
            if t.bin(i, guard) != head {
                continue;
            }

            let output = match entry {
                BinEntry::Node(_) => {
                    let mut pred: Option<&Node<K, V>> = None;
                    let mut cur = head;
                    let mut output = None;
                    while let Some(BinEntry::Node(node)) = unsafe { cur.as_ref() } {
                        let next = node.next.load(Ordering::Acquire, guard);
                        if node.matches(hash, key) {
                            let value = node.value.load(Ordering::Acquire, guard);
                            if condition(&*node.key, unsafe { value.deref() }) {
                                match pred {
                                    Some(pred) => pred.next.store(next, Ordering::Release),
                                    None => t.store_bin(i, next),
                                }
                                let previous = unsafe { value.deref() };
                                output = Some(with_previous_entry(&*node.key, previous));
                                unsafe {
                                    defer_acquire_destroy(guard, cur);
                                    defer_acquire_destroy(guard, value);
                                }
                            }
                            break;
                        }
                        pred = Some(node);
                        cur = next;
                    }
                    output
                }
                BinEntry::Tree(tree) => match tree.entries_without(hash, key, guard) {
                    Some((rest, node)) => {
                        let value = node.value.load(Ordering::Acquire, guard);
                        if condition(&*node.key, unsafe { value.deref() }) {
                            let output = with_previous_entry(&*node.key, unsafe { value.deref() });
                            t.store_bin(i, bin_from_entries(rest, guard));
                            unsafe {
                                defer_acquire_destroy(guard, head);
                                defer_acquire_destroy(guard, value);
                            }
                            Some(output)
                        } else {
                            // The copied key handles are released with `rest`.
                            None
                        }
                    }
                    None => None,
                },
                BinEntry::Moved(_) | BinEntry::Reserved(_) => unreachable!(),
            };

            if output.is_some() {
                self.tables.sub_count(1);
            }
            return Ok(Applied { output, growth });
        }
    }

    /// Turns the chain of bin `i` into a tree, or grows the table instead if
    /// it is still small.
    fn treeify_bin<'g>(
        &'g self,
        table: &'g Table<K, V>,
        i: usize,
        guard: &'g Guard,
    ) -> Result<(), TableError> {
        let n = table.len();
        if n < MIN_TREEIFY_CAPACITY {
            return self.tables.try_presize(n << 1, guard);
        }

        let head = table.bin(i, guard);
        let Some(BinEntry::Node(first)) = (unsafe { head.as_ref() }) else {
            return Ok(());
        };
        let _bin_lock = first.lock.lock(i)?;
        if table.bin(i, guard) != head {
            return Ok(());
        }

        let tree = TreeBin::new(first.chain(guard).map(|node| node.parts(guard)));
        table.store_bin(i, Owned::new(BinEntry::Tree(tree)).into_shared(guard));
        // The values now belong to the tree.
        unsafe { defer_destroy_nodes(guard, head, Shared::null()) };
        Ok(())
    }
}

impl<K, V, S: Default> Default for HashMap<K, V, S> {
    fn default() -> Self {
        Self::with_hasher(S::default())
    }
}

impl<K, V, S> fmt::Debug for HashMap<K, V, S>
where
    K: fmt::Debug + Clone,
    V: fmt::Debug + Clone,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{atomic::Ordering, Arc, Barrier};

    use crate::{
        cht::{
            map::bin::BinEntry,
            test_util::{run_deferred, DropNotifier, IdentityHasher, NoisyDropper},
        },
        common::error::TableError,
    };

    use super::{HashMap, Table};

    write_test_cases_for_me!(HashMap);

    fn identity_map<V>(capacity: usize) -> HashMap<u64, V, IdentityHasher> {
        HashMap::with_capacity_and_hasher(capacity, IdentityHasher::default())
    }

    /// Returns the keys of bin `i` of the current table, in chain or traversal
    /// order, and whether the bin is a tree.
    fn bin_keys<V>(map: &HashMap<u64, V, IdentityHasher>, i: usize) -> (Vec<u64>, bool) {
        let guard = &crossbeam_epoch::pin();
        let table = unsafe { map.tables.current(guard).deref() };
        match unsafe { table.bin(i, guard).as_ref() } {
            None => (vec![], false),
            Some(BinEntry::Node(first)) => (first.chain(guard).map(|n| *n.key).collect(), false),
            Some(BinEntry::Tree(tree)) => (tree.iter().map(|n| *n.key).collect(), true),
            Some(BinEntry::Moved(_)) => panic!("bin {i} of the current table is moved"),
            Some(BinEntry::Reserved(_)) => panic!("bin {i} is reserved"),
        }
    }

    #[test]
    fn split_keeps_entries_in_place() {
        let map = identity_map(0);
        for key in [5, 21, 37] {
            assert_eq!(map.insert(key, key * 10), None);
        }
        assert_eq!(map.capacity(), 16);
        assert_eq!(bin_keys(&map, 5), (vec![5, 21, 37], false));

        let guard = &crossbeam_epoch::pin();
        let old = map.tables.current(guard);

        map.reserve(10);
        assert_eq!(map.capacity(), 32);
        assert_eq!(bin_keys(&map, 5), (vec![5, 37], false));
        assert_eq!(bin_keys(&map, 21), (vec![21], false));

        // Every bin of the old table forwards to the new one.
        let old: &Table<u64, u64> = unsafe { old.deref() };
        for i in 0..16 {
            assert!(matches!(
                unsafe { old.bin(i, guard).deref() },
                BinEntry::Moved(_)
            ));
        }

        // A lookup through the old table follows a single forwarding entry.
        for key in [5, 21, 37] {
            let (found, redirects) = old.find(key, &key, guard);
            assert!(found.is_some());
            assert_eq!(redirects, 1);
        }

        for key in [5, 21, 37] {
            assert_eq!(map.get(&key), Some(key * 10));
        }
        assert_eq!(map.resize_stats().bins_forwarded(), 16);
        assert_eq!(map.resize_stats().bins_split(), 1);
    }

    #[test]
    fn chains_keep_their_order_when_split() {
        let map = identity_map(0);
        let keys = [3, 19, 35, 51, 67, 83];
        for key in keys {
            map.insert(key, ());
        }
        map.reserve(30);
        assert_eq!(map.capacity(), 64);

        assert_eq!(bin_keys(&map, 3), (vec![3, 67], false));
        assert_eq!(bin_keys(&map, 19), (vec![19, 83], false));
        assert_eq!(bin_keys(&map, 35), (vec![35], false));
        assert_eq!(bin_keys(&map, 51), (vec![51], false));
    }

    #[test]
    fn treeify_and_untreeify() {
        let map = identity_map(40);
        let keys = (0..8).map(|k| 5 + 64 * k).collect::<Vec<_>>();
        for (n, key) in keys.iter().enumerate() {
            map.insert(*key, *key);
            assert_eq!(map.capacity(), 64);
            assert_eq!(bin_keys(&map, 5).1, n + 1 >= 8, "after {} keys", n + 1);
        }
        assert_eq!(bin_keys(&map, 5), (keys.clone(), true));

        // The tree splits 4/4 and both halves become chains.
        map.reserve(100);
        assert_eq!(map.capacity(), 256);
        let low = bin_keys(&map, 5);
        let high = bin_keys(&map, 69);
        assert!(!low.1 && !high.1);
        let others = bin_keys(&map, 133).0.len() + bin_keys(&map, 197).0.len();
        assert_eq!(low.0.len() + high.0.len() + others, 8);

        for key in keys {
            assert_eq!(map.get(&key), Some(key));
        }
    }

    #[test]
    fn large_tree_halves_stay_trees() {
        let map = identity_map(40);
        let keys = (0..16).map(|k| 7 + 64 * k).collect::<Vec<_>>();
        for key in &keys {
            map.insert(*key, ());
        }
        assert!(bin_keys(&map, 7).1);

        let guard = &crossbeam_epoch::pin();
        map.tables.try_presize(map.capacity() << 1, guard).unwrap();
        assert_eq!(map.capacity(), 128);

        let low = bin_keys(&map, 7);
        let high = bin_keys(&map, 71);
        assert_eq!(low, ((0..8).map(|k| 7 + 128 * k).collect(), true));
        assert_eq!(high, ((0..8).map(|k| 71 + 128 * k).collect(), true));
    }

    #[test]
    fn small_table_grows_instead_of_treeifying() {
        let map = identity_map(0);
        for k in 0..8 {
            map.insert(1 + 16 * k, k);
        }
        // 8 keys in one bin of a 16-bin table double the table.
        assert_eq!(map.capacity(), 32);
        assert!(!bin_keys(&map, 1).1);
        for k in 0..8 {
            assert_eq!(map.get(&(1 + 16 * k)), Some(k));
        }
    }

    #[test]
    fn tree_updates_and_removals() {
        let map = identity_map(40);
        for k in 0..10 {
            map.insert(9 + 64 * k, k);
        }
        assert!(bin_keys(&map, 9).1);

        assert_eq!(map.insert(9 + 64 * 3, 33), Some(3));
        assert_eq!(map.insert_if_absent(9 + 64 * 4, 44), Some(4));
        assert_eq!(map.get(&(9 + 64 * 3)), Some(33));
        assert_eq!(map.compute_if_absent(9 + 64 * 5, || unreachable!()), 5);
        assert_eq!(map.compute_if_absent(9 + 64 * 10, || 10), 10);
        assert_eq!(map.len(), 11);

        assert_eq!(map.remove_if(&(9 + 64 * 10), |_, v| *v == 0), None);
        for k in (0..11).rev() {
            let expected = if k == 3 { 33 } else { k };
            assert_eq!(map.remove(&(9 + 64 * k)), Some(expected));
            let (keys, is_tree) = bin_keys(&map, 9);
            assert_eq!(keys.len(), k as usize);
            assert_eq!(is_tree, k > 6, "with {k} keys left");
        }
        assert!(map.is_empty());
    }

    #[test]
    fn recursive_update_is_refused() {
        let map = identity_map::<i32>(0);
        let value = map.compute_if_absent(3, || {
            assert_eq!(
                map.try_insert(3, 1),
                Err(TableError::ReservedBin { index: 3 })
            );
            assert_eq!(
                map.try_insert(19, 1),
                Err(TableError::ReservedBin { index: 3 })
            );
            assert_eq!(map.get(&3), None);
            // Another bin is fine.
            assert_eq!(map.try_insert(4, 4), Ok(None));
            7
        });
        assert_eq!(value, 7);
        assert_eq!(map.get(&3), Some(7));
        assert_eq!(map.get(&19), None);
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn resize_from_inside_compute_if_absent() {
        let map = identity_map::<u64>(0);
        let value = map.compute_if_absent(0, || {
            // Enough keys to grow the table while bin 0 is reserved.
            let mut refused = 0;
            for key in 1..16 {
                if let Err(e) = map.try_insert(key, key) {
                    assert_eq!(e, TableError::ReservedBin { index: 0 });
                    refused += 1;
                }
            }
            assert!(refused > 0);
            // The resize cannot commit before bin 0 is released.
            assert_eq!(map.capacity(), 16);
            100
        });
        assert_eq!(value, 100);

        assert_eq!(map.capacity(), 32);
        assert_eq!(map.resize_stats().resizes(), 1);
        assert_eq!(map.resize_stats().bins_forwarded(), 16);
        assert_eq!(map.len(), 16);
        for key in 1..16 {
            assert_eq!(map.get(&key), Some(key));
        }
        assert_eq!(map.get(&0), Some(100));
    }

    #[test]
    fn resize_from_inside_compute_if_absent_on_an_occupied_bin() {
        let map = Arc::new(identity_map::<u64>(0));
        map.insert(0, 0);

        let (tx, rx) = std::sync::mpsc::channel();
        let worker = {
            let map = Arc::clone(&map);
            std::thread::spawn(move || {
                let value = map.compute_if_absent(16, || {
                    // Bin 0 stays locked by this call.
                    assert_eq!(
                        map.try_insert(32, 32),
                        Err(TableError::ReservedBin { index: 0 })
                    );
                    // Crosses the threshold. The resize skips bin 0 and
                    // waits for it.
                    for key in 1..14 {
                        let _ = map.try_insert(key, key);
                    }
                    assert_eq!(map.capacity(), 16);
                    7
                });
                tx.send(value).unwrap();
            })
        };

        let value = rx
            .recv_timeout(std::time::Duration::from_secs(10))
            .expect("compute_if_absent did not return");
        worker.join().unwrap();
        assert_eq!(value, 7);

        assert_eq!(map.capacity(), 32);
        assert_eq!(map.resize_stats().resizes(), 1);
        assert_eq!(map.resize_stats().bins_forwarded(), 16);
        assert_eq!(map.len(), 15);
        assert_eq!(bin_keys(&map, 0), (vec![0], false));
        assert_eq!(bin_keys(&map, 16), (vec![16], false));
        for key in 1..14 {
            assert_eq!(map.get(&key), Some(key));
        }
        assert_eq!(map.get(&16), Some(7));
        assert_eq!(map.get(&32), None);
    }

    #[test]
    fn resize_from_inside_compute_if_absent_on_a_tree_bin() {
        let map = identity_map::<u64>(64);
        assert_eq!(map.capacity(), 128);
        // Eight keys in bin 0 of a table of 128 make a tree.
        for key in (0..8).map(|k| k * 128) {
            map.insert(key, key);
        }
        assert!(bin_keys(&map, 0).1);

        let value = map.compute_if_absent(8 * 128, || {
            for key in 1..96 {
                let _ = map.try_insert(key, key);
            }
            assert_eq!(map.capacity(), 128);
            1
        });
        assert_eq!(value, 1);

        assert_eq!(map.capacity(), 256);
        assert_eq!(map.resize_stats().resizes(), 1);
        assert_eq!(map.len(), 8 + 1 + 95);
        // The keys of the tree split by the 128 bit.
        assert_eq!(bin_keys(&map, 0), (vec![0, 256, 512, 768, 1024], false));
        assert_eq!(bin_keys(&map, 128), (vec![128, 384, 640, 896], false));
        for key in 1..96 {
            assert_eq!(map.get(&key), Some(key));
        }
    }

    #[test]
    fn failed_growth_keeps_the_entry_and_stops_growing() {
        let map = identity_map::<u64>(0);
        map.tables.fail_allocations_above(16);

        for key in 0..11 {
            assert_eq!(map.try_insert(key, key), Ok(None));
        }
        // The twelfth entry reaches the threshold of the 16-bin table.
        assert_eq!(
            map.try_insert(11, 11),
            Err(TableError::ResourceExhausted { requested_bins: 32 })
        );
        assert_eq!(map.get(&11), Some(11));
        assert_eq!(map.capacity(), 16);

        for key in 12..100 {
            assert_eq!(map.try_insert(key, key), Ok(None));
        }
        assert_eq!(map.try_compute_if_absent(100, || 100), Ok(100));
        assert_eq!(map.try_reserve(1_000), Ok(()));

        assert_eq!(map.capacity(), 16);
        assert_eq!(map.len(), 101);
        assert_eq!(map.resize_stats().resizes(), 0);
        for key in 0..=100 {
            assert_eq!(map.get(&key), Some(key));
        }
    }

    #[test]
    fn panicking_init_leaves_the_key_absent() {
        let map = identity_map::<u64>(0);

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            map.compute_if_absent(5, || panic!("init failed"))
        }));
        assert!(result.is_err());

        assert_eq!(map.get(&5), None);
        assert_eq!(map.compute_if_absent(5, || 50), 50);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn compute_if_absent_runs_init_once() {
        const NUM_THREADS: usize = 16;

        let map = Arc::new(HashMap::<u64, usize>::new());
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(NUM_THREADS));

        let handles = (0..NUM_THREADS)
            .map(|i| {
                let map = Arc::clone(&map);
                let calls = Arc::clone(&calls);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    map.compute_if_absent(42, || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        i
                    })
                })
            })
            .collect::<Vec<_>>();

        let values = handles
            .into_iter()
            .map(|h| h.join().expect("thread panicked"))
            .collect::<Vec<_>>();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(values.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(map.get(&42), Some(values[0]));
    }

    #[test]
    fn clear_drops_values() {
        let map = HashMap::new();
        let notifiers = (0..100).map(|_| Arc::new(DropNotifier::new())).collect::<Vec<_>>();
        for (i, notifier) in notifiers.iter().enumerate() {
            map.insert(i, NoisyDropper::new(Arc::clone(notifier), i));
        }
        assert_eq!(map.len(), 100);

        map.clear();
        assert!(map.is_empty());
        assert_eq!(map.get_and(&0, |_| ()), None);
        run_deferred();
        assert!(notifiers.iter().all(|n| n.was_dropped()));
    }

    #[test]
    fn iteration_sees_every_entry_once() {
        let map = identity_map(0);
        for key in 0..20 {
            map.insert(key, key * 2);
        }
        let capacity = map.capacity();

        let mut iter = map.iter();
        let first = iter.next().unwrap();
        // Grow in the middle of the iteration.
        map.reserve(1000);
        assert!(map.capacity() > capacity);

        let mut seen = std::iter::once(first).chain(iter).collect::<Vec<_>>();
        seen.sort_unstable();
        assert_eq!(seen, (0..20).map(|k| (k, k * 2)).collect::<Vec<_>>());

        let mut keys = map.keys().collect::<Vec<_>>();
        keys.sort_unstable();
        assert_eq!(keys, (0..20).collect::<Vec<_>>());
    }
}
