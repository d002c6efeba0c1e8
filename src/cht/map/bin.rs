use std::{
    borrow::Borrow,
    hash::{BuildHasher, Hash, Hasher},
    mem,
    panic::{self, AssertUnwindSafe},
    sync::atomic::{self, AtomicUsize, Ordering},
    thread,
};

use crossbeam_epoch::{Atomic, Guard, Owned, Shared};
use parking_lot::{Mutex, MutexGuard};
use triomphe::Arc as TrioArc;

use super::{table::Table, tree_bin::TreeBin};
use crate::common::{constants::UNTREEIFY_THRESHOLD, error::TableError};

/// The parts of an entry that are carried over when a node is rebuilt: the
/// hash, a shared handle to the key and the value pointer. Rebuilt nodes own
/// the value from the moment they are published.
pub(crate) type EntryParts<'g, K, V> = (u64, TrioArc<K>, Shared<'g, V>);

/// The content of a non-empty bin.
pub(crate) enum BinEntry<K, V> {
    /// The head of a chain of nodes.
    Node(Node<K, V>),
    /// A balanced tree, used once a chain got too long.
    Tree(TreeBin<K, V>),
    /// The bin has been migrated to the pointed table.
    Moved(*const Table<K, V>),
    /// A placeholder locked while `compute_if_absent` computes the value of
    /// a key whose bin was empty.
    Reserved(BinLock),
}

// The raw pointer in `Moved` always points to a table that outlives every
// guard that can observe the entry.
unsafe impl<K: Send + Sync, V: Send + Sync> Send for BinEntry<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for BinEntry<K, V> {}

impl<K, V> BinEntry<K, V> {
    /// Returns the lock guarding this bin, or `None` for a forwarding entry.
    pub(crate) fn lock(&self) -> Option<&BinLock> {
        match self {
            Self::Node(node) => Some(&node.lock),
            Self::Tree(tree) => Some(&tree.lock),
            Self::Reserved(lock) => Some(lock),
            Self::Moved(_) => None,
        }
    }

    pub(crate) fn as_node(&self) -> Option<&Node<K, V>> {
        match self {
            Self::Node(node) => Some(node),
            _ => None,
        }
    }
}

pub(crate) struct Node<K, V> {
    pub(crate) hash: u64,
    pub(crate) key: TrioArc<K>,
    pub(crate) value: Atomic<V>,
    pub(crate) next: Atomic<BinEntry<K, V>>,
    /// The bin lock, used only while this node is the head of its bin.
    pub(crate) lock: BinLock,
}

impl<K, V> Node<K, V> {
    pub(crate) fn new(
        hash: u64,
        key: TrioArc<K>,
        value: Shared<'_, V>,
        next: Shared<'_, BinEntry<K, V>>,
    ) -> Self {
        Self {
            hash,
            key,
            value: Atomic::from(value),
            next: Atomic::from(next),
            lock: BinLock::new(),
        }
    }

    /// Iterates this node and its successors.
    pub(crate) fn chain<'g>(&'g self, guard: &'g Guard) -> Chain<'g, K, V> {
        Chain {
            next: Some(self),
            guard,
        }
    }

    pub(crate) fn parts<'g>(&'g self, guard: &'g Guard) -> EntryParts<'g, K, V> {
        (
            self.hash,
            TrioArc::clone(&self.key),
            self.value.load(Ordering::Acquire, guard),
        )
    }

    pub(crate) fn matches<Q>(&self, hash: u64, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        self.hash == hash && (*self.key).borrow() == key
    }
}

pub(crate) struct Chain<'g, K, V> {
    next: Option<&'g Node<K, V>>,
    guard: &'g Guard,
}

impl<'g, K, V> Iterator for Chain<'g, K, V> {
    type Item = &'g Node<K, V>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.next?;
        let next = node.next.load(Ordering::Acquire, self.guard);
        // SAFETY: Unlinked nodes are destroyed through the epoch, so a node
        // reachable while `guard` is pinned stays alive for `'g`. Chains only
        // ever link nodes.
        self.next = unsafe { next.as_ref() }.and_then(BinEntry::as_node);
        Some(node)
    }
}

static NEXT_THREAD_TOKEN: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    static THREAD_TOKEN: usize = NEXT_THREAD_TOKEN.fetch_add(1, Ordering::Relaxed);
}

/// Returns a non-zero number identifying the current thread.
fn thread_token() -> usize {
    THREAD_TOKEN.try_with(|token| *token).unwrap_or(usize::MAX)
}

/// The lock of a bin.
///
/// While a `compute_if_absent` closure runs with the lock held, the lock
/// remembers the thread running it. That thread is refused the lock instead
/// of deadlocking on it, and resizes it runs skip the bin.
pub(crate) struct BinLock {
    mutex: Mutex<()>,
    /// The token of the computing thread, or 0.
    computing: AtomicUsize,
}

impl BinLock {
    pub(crate) fn new() -> Self {
        Self {
            mutex: Mutex::new(()),
            computing: AtomicUsize::new(0),
        }
    }

    /// Locks the bin at `index`, blocking while another thread holds it.
    /// Fails if the current thread holds it for a computation.
    pub(crate) fn lock(&self, index: usize) -> Result<MutexGuard<'_, ()>, TableError> {
        if self.is_held_by_current_thread() {
            return Err(TableError::ReservedBin { index });
        }
        Ok(self.mutex.lock())
    }

    /// Blocks until the lock is released, without keeping it.
    pub(crate) fn wait(&self, index: usize) -> Result<(), TableError> {
        self.lock(index).map(mem::drop)
    }

    pub(crate) fn is_held_by_current_thread(&self) -> bool {
        // Only the current thread ever stores its own token.
        self.computing.load(Ordering::Relaxed) == thread_token()
    }

    /// Runs `init` on behalf of the current thread, which must hold the lock.
    pub(crate) fn compute<V>(&self, init: impl FnOnce() -> V) -> thread::Result<V> {
        self.computing.store(thread_token(), Ordering::Relaxed);
        let value = panic::catch_unwind(AssertUnwindSafe(init));
        self.computing.store(0, Ordering::Relaxed);
        value
    }
}

pub(crate) fn hash<K, H>(build_hasher: &H, key: &K) -> u64
where
    K: ?Sized + Hash,
    H: BuildHasher,
{
    let mut hasher = build_hasher.build_hasher();
    key.hash(&mut hasher);

    hasher.finish()
}

/// Links fresh nodes for `entries`, in order, in front of `tail` and returns
/// the new head.
pub(crate) fn link_chain<'g, K, V, I>(
    entries: I,
    tail: Shared<'g, BinEntry<K, V>>,
    guard: &'g Guard,
) -> Shared<'g, BinEntry<K, V>>
where
    I: IntoIterator<Item = EntryParts<'g, K, V>>,
    I::IntoIter: DoubleEndedIterator,
{
    entries
        .into_iter()
        .rev()
        .fold(tail, |next, (hash, key, value)| {
            Owned::new(BinEntry::Node(Node::new(hash, key, value, next))).into_shared(guard)
        })
}

/// Builds the bin holding `entries`: nothing when empty, a chain when small,
/// and a tree otherwise.
pub(crate) fn bin_from_entries<'g, K, V, I>(
    entries: I,
    guard: &'g Guard,
) -> Shared<'g, BinEntry<K, V>>
where
    I: IntoIterator<Item = EntryParts<'g, K, V>>,
    I::IntoIter: DoubleEndedIterator + ExactSizeIterator,
{
    let entries = entries.into_iter();
    match entries.len() {
        0 => Shared::null(),
        n if n <= UNTREEIFY_THRESHOLD => link_chain(entries, Shared::null(), guard),
        _ => Owned::new(BinEntry::Tree(TreeBin::new(entries))).into_shared(guard),
    }
}

pub(crate) unsafe fn defer_acquire_destroy<'g, T>(guard: &'g Guard, ptr: Shared<'g, T>) {
    assert!(!ptr.is_null());

    guard.defer_unchecked(move || {
        atomic::fence(Ordering::Acquire);
        mem::drop(ptr.into_owned());
    });
}

/// Retires the chain nodes from `head` up to, but not including, `stop`. Only
/// the nodes are freed; their values and the nodes from `stop` on stay alive.
pub(crate) unsafe fn defer_destroy_nodes<'g, K, V>(
    guard: &'g Guard,
    mut head: Shared<'g, BinEntry<K, V>>,
    stop: Shared<'g, BinEntry<K, V>>,
) {
    while !head.is_null() && head != stop {
        let next = match head.deref() {
            BinEntry::Node(node) => node.next.load(Ordering::Acquire, guard),
            _ => Shared::null(),
        };
        defer_acquire_destroy(guard, head);
        head = next;
    }
}

/// Retires a bin that has been unlinked from its table, along with every
/// value it owns.
pub(crate) unsafe fn defer_destroy_bin_with_values<'g, K, V>(
    guard: &'g Guard,
    bin: Shared<'g, BinEntry<K, V>>,
) {
    assert!(!bin.is_null());

    guard.defer_unchecked(move || {
        atomic::fence(Ordering::Acquire);
        destroy_bin_with_values(crossbeam_epoch::unprotected(), bin);
    });
}

/// Frees a bin along with every value it owns. The bin must be unreachable.
pub(crate) unsafe fn destroy_bin_with_values<K, V>(guard: &Guard, bin: Shared<'_, BinEntry<K, V>>) {
    let mut next = bin;
    while let Some(entry) = next.as_ref() {
        let following = match entry {
            BinEntry::Node(node) => {
                let value = node.value.load(Ordering::Relaxed, guard);
                if !value.is_null() {
                    mem::drop(value.into_owned());
                }
                node.next.load(Ordering::Relaxed, guard)
            }
            BinEntry::Tree(tree) => {
                for tree_node in tree.iter() {
                    let value = tree_node.value.load(Ordering::Relaxed, guard);
                    if !value.is_null() {
                        mem::drop(value.into_owned());
                    }
                }
                Shared::null()
            }
            // Forwarding entries belong to their table.
            BinEntry::Moved(_) => return,
            BinEntry::Reserved(_) => Shared::null(),
        };
        mem::drop(next.into_owned());
        next = following;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crossbeam_epoch::{Owned, Shared};
    use triomphe::Arc as TrioArc;

    use super::{bin_from_entries, destroy_bin_with_values, link_chain, BinEntry, BinLock};
    use crate::{
        cht::test_util::{DropNotifier, NoisyDropper},
        common::error::TableError,
    };

    #[test]
    fn link_chain_keeps_order() {
        let guard = unsafe { crossbeam_epoch::unprotected() };

        let entries = (0..4u64)
            .map(|i| {
                (
                    i,
                    TrioArc::new(i as i32),
                    Owned::new(i as i32 * 10).into_shared(guard),
                )
            })
            .collect::<Vec<_>>();
        let head = link_chain(entries, Shared::null(), guard);

        let node = unsafe { head.deref() }.as_node().unwrap();
        let keys = node.chain(guard).map(|n| *n.key).collect::<Vec<_>>();
        assert_eq!(keys, vec![0, 1, 2, 3]);
        assert!(node.chain(guard).all(|n| n.hash == *n.key as u64));

        unsafe { destroy_bin_with_values(guard, head) };
    }

    #[test]
    fn small_bins_become_chains() {
        let guard = unsafe { crossbeam_epoch::unprotected() };

        let empty = bin_from_entries(Vec::<(u64, TrioArc<i32>, Shared<'_, i32>)>::new(), guard);
        assert!(empty.is_null());

        for (len, expect_tree) in [(6, false), (7, true)] {
            let entries = (0..len)
                .map(|i| (i, TrioArc::new(i), Owned::new(i).into_shared(guard)))
                .collect::<Vec<_>>();
            let bin = bin_from_entries(entries, guard);
            assert_eq!(
                matches!(unsafe { bin.deref() }, BinEntry::Tree(_)),
                expect_tree,
                "bin of {len} entries"
            );
            unsafe { destroy_bin_with_values(guard, bin) };
        }
    }

    #[test]
    fn destroy_bin_drops_values() {
        let guard = unsafe { crossbeam_epoch::unprotected() };
        let notifiers = (0..3).map(|_| Arc::new(DropNotifier::new())).collect::<Vec<_>>();

        let entries = notifiers
            .iter()
            .enumerate()
            .map(|(i, notifier)| {
                let value = NoisyDropper::new(Arc::clone(notifier), i);
                (i as u64, TrioArc::new(i), Owned::new(value).into_shared(guard))
            })
            .collect::<Vec<_>>();
        let head = link_chain(entries, Shared::null(), guard);
        assert!(notifiers.iter().all(|n| !n.was_dropped()));

        unsafe { destroy_bin_with_values(guard, head) };
        assert!(notifiers.iter().all(|n| n.was_dropped()));
    }

    #[test]
    fn computing_thread_is_refused_its_own_lock() {
        let lock = BinLock::new();
        assert!(!lock.is_held_by_current_thread());

        let held = lock.lock(5).unwrap();
        let (refused, seen_by_other) = lock
            .compute(|| {
                let refused = lock.lock(5).map(drop);
                let seen_by_other = std::thread::scope(|s| {
                    s.spawn(|| lock.is_held_by_current_thread())
                        .join()
                        .unwrap()
                });
                (refused, seen_by_other)
            })
            .unwrap();
        assert_eq!(refused, Err(TableError::ReservedBin { index: 5 }));
        assert!(!seen_by_other);
        drop(held);

        // The mark is cleared once the computation returns.
        assert!(!lock.is_held_by_current_thread());
        assert_eq!(lock.wait(5), Ok(()));
    }

    #[test]
    fn panicking_computation_clears_the_mark() {
        let lock = BinLock::new();
        let _held = lock.lock(0).unwrap();

        let result = lock.compute(|| -> i32 { panic!("init failed") });
        assert!(result.is_err());
        assert!(!lock.is_held_by_current_thread());
    }
}
