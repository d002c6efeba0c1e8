use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;
use once_cell::sync::Lazy;

use crate::common::available_parallelism;

static NUM_CELLS: Lazy<usize> = Lazy::new(|| available_parallelism().next_power_of_two());

/// Counts the entries of a map.
///
/// An add first tries the shared base. If another thread updated the base in
/// the meantime, the delta goes to the cell assigned to the current thread
/// instead, so contended threads stop fighting over a single cache line.
pub(crate) struct StripedCounter {
    base: AtomicIsize,
    cells: Box<[CachePadded<AtomicIsize>]>,
}

impl Default for StripedCounter {
    fn default() -> Self {
        let cells = std::iter::repeat_with(Default::default)
            .take(*NUM_CELLS)
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            base: AtomicIsize::default(),
            cells,
        }
    }
}

impl StripedCounter {
    pub(crate) fn add(&self, delta: isize) {
        let base = self.base.load(Ordering::Relaxed);
        if self
            .base
            .compare_exchange(base, base + delta, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            self.cell().fetch_add(delta, Ordering::AcqRel);
        }
    }

    /// Returns the sum of the base and every cell. Concurrent adds may or may
    /// not be included.
    pub(crate) fn sum(&self) -> isize {
        self.cells
            .iter()
            .fold(self.base.load(Ordering::Acquire), |sum, cell| {
                sum + cell.load(Ordering::Acquire)
            })
    }

    fn cell(&self) -> &AtomicIsize {
        thread_local! { static MY_INDEX: usize = next_index() };
        MY_INDEX.with(|i| &*self.cells[*i])
    }
}

fn next_index() -> usize {
    static INDEX: AtomicUsize = AtomicUsize::new(0);
    INDEX.fetch_add(1, Ordering::Relaxed) % *NUM_CELLS
}
