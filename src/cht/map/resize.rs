use std::{
    ptr,
    sync::atomic::{AtomicBool, AtomicIsize, AtomicU64, Ordering},
    thread,
};

use crossbeam_epoch::{Atomic, Guard, Owned, Shared};

use super::{
    bin::{bin_from_entries, defer_acquire_destroy, defer_destroy_nodes, link_chain, BinEntry, Node},
    table::Table,
    tree_bin::{Entries, TreeBin},
};
use crate::{
    cht::counter::StripedCounter,
    common::{
        available_parallelism,
        constants::{DEFAULT_CAPACITY, MAXIMUM_CAPACITY, MIN_TRANSFER_STRIDE},
        error::TableError,
    },
};

/// The number of bits of `size_ctl` holding the resize stamp.
const RESIZE_STAMP_BITS: u32 = 16;

/// The shift putting the resize stamp in the upper bits of `size_ctl`, which
/// makes every resizing value negative.
const RESIZE_STAMP_SHIFT: u32 = isize::BITS - RESIZE_STAMP_BITS;

/// The largest number of threads that can help with a single resize.
const MAX_RESIZERS: isize = (1 << RESIZE_STAMP_SHIFT) - 1;

/// `size_ctl` while the first table is being allocated.
const INITIALIZING: isize = -1;

/// `size_ctl` once the table can no longer grow. Being the largest positive
/// value, no entry count ever reaches it as a threshold.
const CANNOT_GROW: isize = isize::MAX;

/// Returns the stamp identifying a resize of a table of length `n`. Shifted
/// left by `RESIZE_STAMP_SHIFT` it is always negative.
fn resize_stamp(n: usize) -> isize {
    n.leading_zeros() as isize | (1 << (RESIZE_STAMP_BITS - 1))
}

/// Returns the entry count from which a table of length `n` should grow.
fn threshold(n: usize) -> isize {
    (n - (n >> 2)) as isize
}

/// The counts of the resize work a map has done since it was created.
///
/// The counters are updated with relaxed atomics while resizes run, so a
/// snapshot taken during a resize may be partially updated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResizeStats {
    resizes: u64,
    bins_forwarded: u64,
    bins_split: u64,
}

impl ResizeStats {
    /// Returns the number of completed resizes. Each doubles the table.
    pub fn resizes(&self) -> u64 {
        self.resizes
    }

    /// Returns the number of bins of old tables that have been replaced by a
    /// forwarding marker. Every bin is forwarded exactly once, so after
    /// resizes from `n` bins up to `m` bins this is `m - n`.
    pub fn bins_forwarded(&self) -> u64 {
        self.bins_forwarded
    }

    /// Returns the number of non-empty bins whose entries have been
    /// partitioned into the next table.
    pub fn bins_split(&self) -> u64 {
        self.bins_split
    }
}

#[derive(Default)]
struct ResizeCounters {
    resizes: AtomicU64,
    bins_forwarded: AtomicU64,
    bins_split: AtomicU64,
}

impl ResizeCounters {
    fn snapshot(&self) -> ResizeStats {
        ResizeStats {
            resizes: self.resizes.load(Ordering::Relaxed),
            bins_forwarded: self.bins_forwarded.load(Ordering::Relaxed),
            bins_split: self.bins_split.load(Ordering::Relaxed),
        }
    }
}

/// Owns the tables of a map and coordinates their growth.
///
/// `size_ctl` is the control word of the resize protocol:
///
/// - `0` or a positive value with no table: the length of the first table,
///   `0` meaning the default.
/// - A positive value with a table: the entry count at which to grow.
/// - `INITIALIZING` while the first table is being allocated.
/// - `(resize_stamp(n) << RESIZE_STAMP_SHIFT) + 1 + k` while `k` threads are
///   moving the bins of the table of length `n` to the next table.
/// - `CANNOT_GROW` once the table reached its largest length or the next
///   table could not be allocated.
pub(crate) struct ResizeCoordinator<K, V> {
    table: Atomic<Table<K, V>>,
    next_table: Atomic<Table<K, V>>,
    size_ctl: AtomicIsize,
    /// The claim cursor over the bins of `table`. Resizers take ranges of
    /// bins below it, from the top of the table down to zero.
    transfer_index: AtomicIsize,
    /// Set when the last resizer had to leave a bin reserved by itself, and
    /// has yet to commit the resize.
    stalled: AtomicBool,
    count: StripedCounter,
    counters: ResizeCounters,
    #[cfg(feature = "logging")]
    name: Option<String>,
    /// Tables longer than this fail to allocate.
    #[cfg(test)]
    allocation_limit: std::sync::atomic::AtomicUsize,
}

impl<K, V> ResizeCoordinator<K, V> {
    /// Creates a coordinator whose first table will have `initial_len` bins,
    /// or the default length if `initial_len` is 0.
    pub(crate) fn new(_name: Option<String>, initial_len: usize) -> Self {
        debug_assert!(initial_len == 0 || initial_len.is_power_of_two());

        Self {
            table: Atomic::null(),
            next_table: Atomic::null(),
            size_ctl: AtomicIsize::new(initial_len.min(MAXIMUM_CAPACITY) as isize),
            transfer_index: AtomicIsize::new(0),
            stalled: AtomicBool::new(false),
            count: StripedCounter::default(),
            counters: ResizeCounters::default(),
            #[cfg(feature = "logging")]
            name: _name,
            #[cfg(test)]
            allocation_limit: std::sync::atomic::AtomicUsize::new(usize::MAX),
        }
    }

    pub(crate) fn current<'g>(&self, guard: &'g Guard) -> Shared<'g, Table<K, V>> {
        self.table.load(Ordering::SeqCst, guard)
    }

    /// Returns the number of entries, which may be off while writes are in
    /// flight.
    pub(crate) fn len(&self) -> usize {
        self.count.sum().max(0) as usize
    }

    pub(crate) fn stats(&self) -> ResizeStats {
        self.counters.snapshot()
    }

    /// Returns the current table, allocating the first one if needed.
    pub(crate) fn init_table<'g>(
        &'g self,
        guard: &'g Guard,
    ) -> Result<Shared<'g, Table<K, V>>, TableError> {
        loop {
            let table = self.table.load(Ordering::SeqCst, guard);
            if !table.is_null() {
                return Ok(table);
            }

            let sc = self.size_ctl.load(Ordering::SeqCst);
            if sc < 0 {
                // Another thread is allocating it.
                thread::yield_now();
                continue;
            }
            if self
                .size_ctl
                .compare_exchange(sc, INITIALIZING, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                continue;
            }

            let table = self.table.load(Ordering::SeqCst, guard);
            if !table.is_null() {
                self.size_ctl.store(sc, Ordering::SeqCst);
                return Ok(table);
            }

            let n = if sc > 0 { sc as usize } else { DEFAULT_CAPACITY };
            let table = match self.allocate(n) {
                Ok(table) => Owned::new(table).into_shared(guard),
                Err(e) => {
                    self.size_ctl.store(sc, Ordering::SeqCst);
                    return Err(e);
                }
            };
            self.table.store(table, Ordering::SeqCst);
            self.size_ctl.store(threshold(n), Ordering::SeqCst);
            return Ok(table);
        }
    }

    /// Adds `n` inserted entries to the count, then grows the table if the
    /// count reached the threshold, or helps with a resize in flight.
    pub(crate) fn add_count<'g>(&'g self, n: usize, guard: &'g Guard) -> Result<(), TableError> {
        self.count.add(n as isize);
        self.maybe_resize(self.count.sum(), guard)
    }

    /// Subtracts `n` removed entries from the count. Removals never grow the
    /// table.
    pub(crate) fn sub_count(&self, n: usize) {
        self.count.add(-(n as isize));
    }

    /// Starts or joins resizes for as long as `count` is over the threshold.
    /// Returns once this thread has no more resize work to do.
    pub(crate) fn maybe_resize<'g>(
        &'g self,
        mut count: isize,
        guard: &'g Guard,
    ) -> Result<(), TableError> {
        loop {
            let sc = self.size_ctl.load(Ordering::SeqCst);
            if count < sc {
                return Ok(());
            }
            let table = self.table.load(Ordering::SeqCst, guard);
            if table.is_null() {
                return Ok(());
            }
            let n = unsafe { table.deref() }.len();
            if n >= MAXIMUM_CAPACITY {
                return Ok(());
            }

            let rs = resize_stamp(n) << RESIZE_STAMP_SHIFT;
            if sc < 0 {
                let next = self.next_table.load(Ordering::SeqCst, guard);
                if !self.may_join(sc, rs, next) {
                    return Ok(());
                }
                if self
                    .size_ctl
                    .compare_exchange(sc, sc + 1, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    self.transfer(table, next, guard)?;
                }
            } else if self
                .size_ctl
                .compare_exchange(sc, rs + 2, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                self.transfer(table, Shared::null(), guard)?;
            }
            count = self.count.sum();
        }
    }

    /// Helps with the resize that forwarded a bin of `table` to `next`, then
    /// returns `next` for the caller to retry against.
    pub(crate) fn help_transfer<'g>(
        &'g self,
        table: Shared<'g, Table<K, V>>,
        next: *const Table<K, V>,
        guard: &'g Guard,
    ) -> Result<Shared<'g, Table<K, V>>, TableError> {
        let next = Shared::from(next);
        let rs = resize_stamp(unsafe { table.deref() }.len()) << RESIZE_STAMP_SHIFT;

        while next == self.next_table.load(Ordering::SeqCst, guard)
            && table == self.table.load(Ordering::SeqCst, guard)
        {
            let sc = self.size_ctl.load(Ordering::SeqCst);
            if sc >= 0 || !self.may_join(sc, rs, next) {
                break;
            }
            if self
                .size_ctl
                .compare_exchange(sc, sc + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                self.transfer(table, next, guard)?;
                break;
            }
        }
        Ok(next)
    }

    /// Grows the table until it has at least `len` bins, joining any resize
    /// already in flight. Allocates the first table when there is none.
    pub(crate) fn try_presize<'g>(
        &'g self,
        len: usize,
        guard: &'g Guard,
    ) -> Result<(), TableError> {
        let len = len.min(MAXIMUM_CAPACITY);
        loop {
            let sc = self.size_ctl.load(Ordering::SeqCst);
            if sc == CANNOT_GROW || sc == INITIALIZING {
                return Ok(());
            }

            let table = self.table.load(Ordering::SeqCst, guard);
            if table.is_null() {
                let wanted = (sc as usize).max(len);
                if wanted != sc as usize
                    && self
                        .size_ctl
                        .compare_exchange(sc, wanted as isize, Ordering::SeqCst, Ordering::SeqCst)
                        .is_err()
                {
                    continue;
                }
                self.init_table(guard)?;
                continue;
            }

            let n = unsafe { table.deref() }.len();
            if n >= len {
                return Ok(());
            }

            let rs = resize_stamp(n) << RESIZE_STAMP_SHIFT;
            if sc < 0 {
                let next = self.next_table.load(Ordering::SeqCst, guard);
                if !self.may_join(sc, rs, next) {
                    return Ok(());
                }
                if self
                    .size_ctl
                    .compare_exchange(sc, sc + 1, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    self.transfer(table, next, guard)?;
                }
            } else if self
                .size_ctl
                .compare_exchange(sc, rs + 2, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                self.transfer(table, Shared::null(), guard)?;
            }
        }
    }

    /// Commits a resize that was left uncommitted because its last resizer
    /// met a bin it had reserved itself. To be called once that thread has
    /// released its reservation.
    pub(crate) fn resume_stalled_transfer<'g>(
        &'g self,
        guard: &'g Guard,
    ) -> Result<(), TableError> {
        if !self.stalled.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let table = self.table.load(Ordering::SeqCst, guard);
        let next = self.next_table.load(Ordering::SeqCst, guard);
        #[cfg(feature = "logging")]
        log::debug!("{}Resuming a stalled resize", self.log_prefix());
        self.run_transfer(table, next, true, guard)
    }

    fn allocate(&self, len: usize) -> Result<Table<K, V>, TableError> {
        #[cfg(test)]
        if len > self.allocation_limit.load(Ordering::Relaxed) {
            return Err(TableError::ResourceExhausted {
                requested_bins: len,
            });
        }
        Table::try_new(len)
    }

    #[cfg(test)]
    pub(crate) fn fail_allocations_above(&self, len: usize) {
        self.allocation_limit.store(len, Ordering::Relaxed);
    }

    /// Whether a thread that read `sc` for a table whose shifted stamp is
    /// `rs` may join the resize in flight.
    fn may_join(&self, sc: isize, rs: isize, next: Shared<'_, Table<K, V>>) -> bool {
        (sc >> RESIZE_STAMP_SHIFT) == (rs >> RESIZE_STAMP_SHIFT)
            && sc != rs + 1
            && sc != rs + MAX_RESIZERS
            && !next.is_null()
            && self.transfer_index.load(Ordering::SeqCst) > 0
    }

    /// Moves bins of `table` to `next`, allocating `next` first when null.
    /// The caller must have registered as a resizer in `size_ctl`.
    fn transfer<'g>(
        &'g self,
        table: Shared<'g, Table<K, V>>,
        mut next: Shared<'g, Table<K, V>>,
        guard: &'g Guard,
    ) -> Result<(), TableError> {
        if next.is_null() {
            let n = unsafe { table.deref() }.len();
            match self.allocate(n << 1) {
                Ok(new_table) => next = Owned::new(new_table).into_shared(guard),
                Err(e) => {
                    // Nobody can have joined as there is no next table yet.
                    self.transfer_index.store(0, Ordering::SeqCst);
                    self.size_ctl.store(CANNOT_GROW, Ordering::SeqCst);
                    return Err(e);
                }
            }
            #[cfg(feature = "logging")]
            log::debug!(
                "{}Resizing the table from {n} to {} bins",
                self.log_prefix(),
                n << 1
            );
            self.next_table.store(next, Ordering::SeqCst);
            self.transfer_index.store(n as isize, Ordering::SeqCst);
        }
        self.run_transfer(table, next, false, guard)
    }

    fn run_transfer<'g>(
        &'g self,
        table: Shared<'g, Table<K, V>>,
        next: Shared<'g, Table<K, V>>,
        mut finishing: bool,
        guard: &'g Guard,
    ) -> Result<(), TableError> {
        let old = unsafe { table.deref() };
        let new = unsafe { next.deref() };
        let n = old.len();
        let stride = (n >> 3) / available_parallelism();
        let stride = stride.max(MIN_TRANSFER_STRIDE) as isize;
        let forward = old.forwarding_entry(next, guard);

        // The index of a bin locked by a computation of this thread, which
        // cannot be moved until that computation returns.
        let mut skipped = None;

        let mut i: isize = if finishing { n as isize } else { 0 };
        let mut bound: isize = 0;
        let mut advance = true;

        loop {
            while advance {
                i -= 1;
                if i >= bound || finishing {
                    advance = false;
                    break;
                }
                let next_index = self.transfer_index.load(Ordering::SeqCst);
                if next_index <= 0 {
                    i = -1;
                    advance = false;
                    break;
                }
                let next_bound = (next_index - stride).max(0);
                if self
                    .transfer_index
                    .compare_exchange(next_index, next_bound, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    #[cfg(feature = "logging")]
                    log::trace!(
                        "{}Claimed bins {next_bound}..{next_index} of {n}",
                        self.log_prefix()
                    );
                    bound = next_bound;
                    i = next_index - 1;
                    advance = false;
                }
            }

            if i < 0 || i as usize >= n {
                if finishing {
                    if let Some(index) = skipped {
                        self.stalled.store(true, Ordering::SeqCst);
                        return Err(TableError::ReservedBin { index });
                    }
                    self.commit(table, next, guard);
                    return Ok(());
                }

                let sc = self.size_ctl.load(Ordering::SeqCst);
                if self
                    .size_ctl
                    .compare_exchange(sc, sc - 1, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    if sc - 2 != resize_stamp(n) << RESIZE_STAMP_SHIFT {
                        // Other resizers are still at work. The last one
                        // commits.
                        return match skipped {
                            Some(index) => Err(TableError::ReservedBin { index }),
                            None => Ok(()),
                        };
                    }
                    // Check every bin again before committing.
                    finishing = true;
                    advance = true;
                    skipped = None;
                    i = n as isize;
                }
                continue;
            }

            let index = i as usize;
            let head = old.bin(index, guard);
            if head.is_null() {
                advance = old.cas_bin(index, Shared::null(), forward, guard).is_ok();
                if advance {
                    self.counters.bins_forwarded.fetch_add(1, Ordering::Relaxed);
                }
                continue;
            }

            let entry = unsafe { head.deref() };
            let Some(lock) = entry.lock() else {
                // Already moved.
                advance = true;
                continue;
            };
            let Ok(_bin_lock) = lock.lock(index) else {
                // Held by a computation of this thread, which cannot return
                // before the transfer does.
                skipped = Some(index);
                advance = true;
                continue;
            };
            if old.bin(index, guard) != head {
                continue;
            }

            match entry {
                BinEntry::Node(node) => self.split_chain(new, index, n, head, node, guard),
                BinEntry::Tree(tree) => self.split_tree(new, index, n, head, tree, guard),
                BinEntry::Reserved(_) => {
                    #[cfg(feature = "logging")]
                    log::error!(
                        "{}Bin {index} was still reserved after its reservation was released",
                        self.log_prefix()
                    );
                    return Err(TableError::ReservedBin { index });
                }
                BinEntry::Moved(_) => unreachable!("forwarding entries have no lock"),
            }
            old.store_bin(index, forward);
            self.counters.bins_forwarded.fetch_add(1, Ordering::Relaxed);
            self.counters.bins_split.fetch_add(1, Ordering::Relaxed);
            advance = true;
        }
    }

    /// Moves the chain at `head` into bins `i` and `i + n` of `new`. Nodes
    /// keep their relative order. The trailing run of nodes going to the same
    /// bin is moved as is, and the nodes before it are copied.
    fn split_chain<'g>(
        &self,
        new: &Table<K, V>,
        i: usize,
        n: usize,
        head: Shared<'g, BinEntry<K, V>>,
        first: &'g Node<K, V>,
        guard: &'g Guard,
    ) {
        let bit = n as u64;

        let mut run_bit = first.hash & bit;
        let mut last_run = head;
        let mut last_run_node = first;
        let mut p = first.next.load(Ordering::Acquire, guard);
        while let Some(BinEntry::Node(node)) = unsafe { p.as_ref() } {
            let b = node.hash & bit;
            if b != run_bit {
                run_bit = b;
                last_run = p;
                last_run_node = node;
            }
            p = node.next.load(Ordering::Acquire, guard);
        }

        let (low_tail, high_tail) = if run_bit == 0 {
            (last_run, Shared::null())
        } else {
            (Shared::null(), last_run)
        };

        let mut low = Entries::new();
        let mut high = Entries::new();
        for node in first
            .chain(guard)
            .take_while(|node| !ptr::eq(*node, last_run_node))
        {
            if node.hash & bit == 0 {
                low.push(node.parts(guard));
            } else {
                high.push(node.parts(guard));
            }
        }

        new.store_bin(i, link_chain(low, low_tail, guard));
        new.store_bin(i + n, link_chain(high, high_tail, guard));

        // The copied nodes are retired. Their values now belong to the copies.
        unsafe { defer_destroy_nodes(guard, head, last_run) };
    }

    /// Moves the tree at `head` into bins `i` and `i + n` of `new`. A tree
    /// whose entries all go to the same bin is moved as is.
    fn split_tree<'g>(
        &self,
        new: &Table<K, V>,
        i: usize,
        n: usize,
        head: Shared<'g, BinEntry<K, V>>,
        tree: &'g TreeBin<K, V>,
        guard: &'g Guard,
    ) {
        let (low, high) = tree.split(n as u64, guard);

        if high.is_empty() {
            new.store_bin(i, head);
            new.store_bin(i + n, Shared::null());
        } else if low.is_empty() {
            new.store_bin(i, Shared::null());
            new.store_bin(i + n, head);
        } else {
            new.store_bin(i, bin_from_entries(low, guard));
            new.store_bin(i + n, bin_from_entries(high, guard));
            // The values now belong to the new bins.
            unsafe { defer_acquire_destroy(guard, head) };
        }
    }

    fn commit<'g>(
        &'g self,
        table: Shared<'g, Table<K, V>>,
        next: Shared<'g, Table<K, V>>,
        guard: &'g Guard,
    ) {
        let n = unsafe { table.deref() }.len();
        let next_len = n << 1;

        self.next_table.store(Shared::null(), Ordering::SeqCst);
        self.table.store(next, Ordering::SeqCst);

        let sc = if next_len >= MAXIMUM_CAPACITY {
            CANNOT_GROW
        } else {
            threshold(next_len)
        };
        let committed = self.size_ctl.compare_exchange(
            (resize_stamp(n) << RESIZE_STAMP_SHIFT) + 1,
            sc,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        debug_assert!(committed.is_ok(), "size_ctl changed while committing");

        self.counters.resizes.fetch_add(1, Ordering::Relaxed);
        // SAFETY: The old table is unreachable from now on except for threads
        // that loaded it before, and those are pinned.
        unsafe { defer_acquire_destroy(guard, table) };

        #[cfg(feature = "logging")]
        log::debug!("{}Resized the table to {next_len} bins", self.log_prefix());
    }

    #[cfg(feature = "logging")]
    pub(crate) fn log_prefix(&self) -> String {
        self.name
            .as_ref()
            .map(|name| format!("[{name}] "))
            .unwrap_or_default()
    }
}

impl<K, V> Drop for ResizeCoordinator<K, V> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` means no thread is using the tables. Entries
        // moved to the next table are forwarding entries in the current one,
        // so nothing is freed twice.
        let guard = unsafe { crossbeam_epoch::unprotected() };
        for table in [&self.next_table, &self.table] {
            let table = table.swap(Shared::null(), Ordering::Relaxed, guard);
            if !table.is_null() {
                let mut table = unsafe { table.into_owned() };
                unsafe { table.drop_bins() };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use crossbeam_epoch::{Owned, Shared};

    use super::{
        resize_stamp, threshold, ResizeCoordinator, Table, CANNOT_GROW, MAX_RESIZERS,
        RESIZE_STAMP_SHIFT,
    };
    use crate::common::{constants::MAXIMUM_CAPACITY, error::TableError};

    #[test]
    fn stamps() {
        let mut seen = std::collections::HashSet::new();
        let mut n = 1;
        while n <= MAXIMUM_CAPACITY {
            let rs = resize_stamp(n) << RESIZE_STAMP_SHIFT;
            assert!(rs < 0, "resizing value for {n} must be negative");
            assert_eq!((rs + MAX_RESIZERS) >> RESIZE_STAMP_SHIFT, rs >> RESIZE_STAMP_SHIFT);
            assert!(seen.insert(rs), "duplicate stamp for {n}");
            n <<= 1;
        }
        assert_eq!(threshold(16), 12);
        assert_eq!(threshold(64), 48);
    }

    #[test]
    fn first_table() {
        let guard = &crossbeam_epoch::pin();

        let tables = ResizeCoordinator::<u64, u64>::new(None, 0);
        assert!(tables.current(guard).is_null());
        let table = tables.init_table(guard).unwrap();
        assert_eq!(unsafe { table.deref() }.len(), 16);
        assert_eq!(tables.size_ctl.load(Ordering::SeqCst), 12);
        assert_eq!(tables.init_table(guard).unwrap(), table);

        let tables = ResizeCoordinator::<u64, u64>::new(Some("sized".into()), 128);
        let table = tables.init_table(guard).unwrap();
        assert_eq!(unsafe { table.deref() }.len(), 128);
        assert_eq!(tables.size_ctl.load(Ordering::SeqCst), 96);
    }

    #[test]
    fn presize_doubles_until_large_enough() {
        let guard = &crossbeam_epoch::pin();

        let tables = ResizeCoordinator::<u64, u64>::new(None, 0);
        tables.try_presize(16, guard).unwrap();
        assert_eq!(unsafe { tables.current(guard).deref() }.len(), 16);

        tables.try_presize(128, guard).unwrap();
        assert_eq!(unsafe { tables.current(guard).deref() }.len(), 128);
        assert_eq!(tables.size_ctl.load(Ordering::SeqCst), 96);

        let stats = tables.stats();
        assert_eq!(stats.resizes(), 3);
        assert_eq!(stats.bins_forwarded(), 16 + 32 + 64);
        assert_eq!(stats.bins_split(), 0);
        assert!(tables.next_table.load(Ordering::SeqCst, guard).is_null());
        assert_eq!(tables.transfer_index.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn presize_on_an_empty_coordinator_allocates_directly() {
        let guard = &crossbeam_epoch::pin();

        let tables = ResizeCoordinator::<u64, u64>::new(None, 0);
        tables.try_presize(256, guard).unwrap();
        assert_eq!(unsafe { tables.current(guard).deref() }.len(), 256);
        assert_eq!(tables.stats().resizes(), 0);
    }

    #[test]
    fn no_growth_once_cannot_grow() {
        let guard = &crossbeam_epoch::pin();

        let tables = ResizeCoordinator::<u64, u64>::new(None, 0);
        tables.init_table(guard).unwrap();
        tables.size_ctl.store(CANNOT_GROW, Ordering::SeqCst);

        tables.maybe_resize(isize::MAX - 1, guard).unwrap();
        tables.try_presize(1 << 20, guard).unwrap();
        assert_eq!(unsafe { tables.current(guard).deref() }.len(), 16);
        assert_eq!(tables.stats().resizes(), 0);
    }

    #[test]
    fn joins_are_refused_when_finishing() {
        let guard = &crossbeam_epoch::pin();

        let tables = ResizeCoordinator::<u64, u64>::new(None, 0);
        let table = tables.init_table(guard).unwrap();
        let next = Owned::new(Table::try_new(32).unwrap()).into_shared(guard);
        tables.transfer_index.store(16, Ordering::SeqCst);

        let rs = resize_stamp(16) << RESIZE_STAMP_SHIFT;
        assert!(tables.may_join(rs + 2, rs, next));
        assert!(!tables.may_join(rs + 1, rs, next));
        assert!(!tables.may_join(rs + MAX_RESIZERS, rs, next));
        assert!(!tables.may_join(rs + 2, rs, Shared::null()));
        let other = resize_stamp(32) << RESIZE_STAMP_SHIFT;
        assert!(!tables.may_join(other + 2, rs, next));
        tables.transfer_index.store(0, Ordering::SeqCst);
        assert!(!tables.may_join(rs + 2, rs, next));

        assert!(!table.is_null());
        drop(unsafe { next.into_owned() });
    }

    #[test]
    fn helper_without_work_can_finish_the_resize() {
        let guard = &crossbeam_epoch::pin();

        let tables = ResizeCoordinator::<u64, u64>::new(None, 0);
        let table = tables.init_table(guard).unwrap();
        let next = Owned::new(Table::try_new(32).unwrap()).into_shared(guard);
        tables.next_table.store(next, Ordering::SeqCst);
        tables.transfer_index.store(16, Ordering::SeqCst);

        // The thread that started the resize, plus a helper that joined
        // without claiming anything yet.
        let rs = resize_stamp(16) << RESIZE_STAMP_SHIFT;
        tables.size_ctl.store(rs + 3, Ordering::SeqCst);

        // A single stride covers the whole table, so the starter moves every
        // bin but is not the last to leave.
        tables.run_transfer(table, next, false, guard).unwrap();
        assert_eq!(tables.transfer_index.load(Ordering::SeqCst), 0);
        assert_eq!(tables.size_ctl.load(Ordering::SeqCst), rs + 2);
        assert_eq!(tables.current(guard), table);
        assert_eq!(tables.stats().resizes(), 0);
        assert_eq!(tables.stats().bins_forwarded(), 16);
        assert!(!tables.may_join(rs + 2, rs, next));

        // The helper finds nothing to claim, leaves last and commits.
        tables.run_transfer(table, next, false, guard).unwrap();
        assert_eq!(tables.size_ctl.load(Ordering::SeqCst), threshold(32));
        assert_eq!(tables.current(guard), next);
        assert!(tables.next_table.load(Ordering::SeqCst, guard).is_null());
        assert_eq!(tables.stats().resizes(), 1);
        assert_eq!(tables.stats().bins_forwarded(), 16);
    }

    #[test]
    fn allocation_failure_stops_growth() {
        let guard = &crossbeam_epoch::pin();

        let tables = ResizeCoordinator::<u64, u64>::new(None, 0);
        tables.fail_allocations_above(16);
        tables.init_table(guard).unwrap();

        assert_eq!(
            tables.maybe_resize(12, guard),
            Err(TableError::ResourceExhausted { requested_bins: 32 })
        );
        assert_eq!(tables.size_ctl.load(Ordering::SeqCst), CANNOT_GROW);
        assert_eq!(tables.transfer_index.load(Ordering::SeqCst), 0);
        assert!(tables.next_table.load(Ordering::SeqCst, guard).is_null());

        // Later attempts neither grow the table nor fail.
        assert_eq!(tables.maybe_resize(1_000, guard), Ok(()));
        assert_eq!(tables.try_presize(1 << 10, guard), Ok(()));
        assert_eq!(unsafe { tables.current(guard).deref() }.len(), 16);
        assert_eq!(tables.stats().resizes(), 0);
    }

    #[test]
    fn first_table_allocation_can_be_retried() {
        let guard = &crossbeam_epoch::pin();

        let tables = ResizeCoordinator::<u64, u64>::new(None, 64);
        tables.fail_allocations_above(32);
        assert_eq!(
            tables.init_table(guard),
            Err(TableError::ResourceExhausted { requested_bins: 64 })
        );
        assert!(tables.current(guard).is_null());
        assert_eq!(tables.size_ctl.load(Ordering::SeqCst), 64);

        tables.fail_allocations_above(usize::MAX);
        let table = tables.init_table(guard).unwrap();
        assert_eq!(unsafe { table.deref() }.len(), 64);
        assert_eq!(tables.size_ctl.load(Ordering::SeqCst), threshold(64));
    }
}
