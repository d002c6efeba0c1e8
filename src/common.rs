use std::{num::NonZeroUsize, thread};

use once_cell::sync::Lazy;

pub(crate) mod builder_utils;
pub(crate) mod constants;
pub(crate) mod error;

static NUM_CPUS: Lazy<usize> = Lazy::new(|| {
    thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
});

/// Returns the number of processors, or 1 if it cannot be queried.
pub(crate) fn available_parallelism() -> usize {
    *NUM_CPUS
}
