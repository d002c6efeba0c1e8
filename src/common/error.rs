/// The error type of the fallible map operations such as
/// [`HashMap::try_insert`][try-insert].
///
/// [try-insert]: ./struct.HashMap.html#method.try_insert
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TableError {
    /// The map tried to grow its table but could not allocate the next one.
    ///
    /// The operation that triggered the growth has already been applied. The
    /// map stays correct at its current size but will not try to grow again,
    /// so it may run above its ideal load factor from now on.
    #[error(
        "Could not allocate a table of {requested_bins} bins. \
    The map will keep working at its current size but will not grow any further"
    )]
    ResourceExhausted {
        /// The length of the table that could not be allocated.
        requested_bins: usize,
    },

    /// A bin was found locked by a pending `compute_if_absent` call of the
    /// current thread. This happens when the closure given to
    /// `compute_if_absent` updates the same map.
    ///
    /// An update aimed at that bin is not applied. If the bin was met while
    /// helping with a resize, the resize is left to be completed when the
    /// `compute_if_absent` call returns, and the map stays consistent
    /// meanwhile.
    #[error(
        "Bin {index} is locked by a compute_if_absent call of this thread. \
    The closure passed to compute_if_absent must not update the map"
    )]
    ReservedBin {
        /// The index of the reserved bin in the table that was being accessed.
        index: usize,
    },
}
