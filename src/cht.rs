//! A lock-free-read hash table whose table is grown cooperatively.
//!
//! A map owns a table of bins. A bin is either empty, the head of a chain of
//! nodes, a balanced tree of nodes, a forwarding entry or a reservation.
//!
//! Readers never lock. Writers lock the head of the single bin they update
//! and recheck that it is still the head before changing anything.
//!
//! Once the entry count reaches three quarters of the table length, the
//! writer that noticed allocates a table twice as long and starts moving
//! bins, from the top of the old table down. Moving a bin locks it, splits
//! its entries between bins `i` and `i + n` of the next table, then replaces
//! it with a forwarding entry. Any thread that finds a forwarding entry, or
//! notices the resize while counting, claims a range of the remaining bins
//! and moves them too. Entries are copied rather than moved in place, so a
//! reader holding a bin of the old table keeps a consistent view of it.
//!
//! The last thread to leave the resize checks every bin once more and then
//! publishes the next table. All of this is tracked in a single control word,
//! `size_ctl`, described on `ResizeCoordinator`.
//!
//! Memory is reclaimed with `crossbeam-epoch`: unlinked bins, replaced
//! values and outgrown tables are freed once no pinned thread can observe
//! them.

pub(crate) mod counter;
pub(crate) mod iter;

#[cfg(test)]
#[macro_use]
pub(crate) mod test_util;

pub(crate) mod map;
