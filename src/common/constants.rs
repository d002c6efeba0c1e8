/// The largest possible table length. Must be a power of two, and small enough
/// that the resize stamp of every table length fits in `RESIZE_STAMP_BITS`.
pub(crate) const MAXIMUM_CAPACITY: usize = 1 << 30;

/// The table length used when a map is created without a capacity. Must be a
/// power of two.
pub(crate) const DEFAULT_CAPACITY: usize = 16;

/// The load factor used to size tables from a requested capacity. Resizing
/// thresholds are computed as `n - (n >> 2)` rather than from this value.
pub(crate) const LOAD_FACTOR: f64 = 0.75;

/// A chain reaching this many nodes is converted to a tree bin.
pub(crate) const TREEIFY_THRESHOLD: usize = 8;

/// A tree half holding at most this many entries after a split is stored as a
/// chain. Must be less than `TREEIFY_THRESHOLD`.
pub(crate) const UNTREEIFY_THRESHOLD: usize = 6;

/// The smallest table length for which bins are treeified. Smaller tables
/// grow instead.
pub(crate) const MIN_TREEIFY_CAPACITY: usize = 64;

/// The lower bound of the number of bins a resizer claims at a time.
pub(crate) const MIN_TRANSFER_STRIDE: usize = 16;

// Catch an untreeify threshold that would let a bin flip between a chain and a
// tree on every split.
const _: () = assert!(UNTREEIFY_THRESHOLD < TREEIFY_THRESHOLD);
