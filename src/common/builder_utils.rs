use super::constants::MAXIMUM_CAPACITY;

pub(crate) fn ensure_sizing_or_panic(load_factor: f64, concurrency_level: usize) {
    assert!(
        load_factor.is_finite() && load_factor > 0.0,
        "load_factor must be a positive number, got {load_factor}"
    );
    assert!(concurrency_level > 0, "concurrency_level must be at least 1");
}

/// Returns the table length that holds `capacity` entries at `load_factor`,
/// or 0 (use the default length) when `capacity` is 0.
pub(crate) fn table_len_for_capacity(capacity: usize, load_factor: f64) -> usize {
    if capacity == 0 {
        return 0;
    }

    // Float to int casts saturate, so a huge capacity lands on the maximum.
    let size = (1.0 + capacity as f64 / load_factor) as usize;
    size.checked_next_power_of_two()
        .map_or(MAXIMUM_CAPACITY, |len| len.min(MAXIMUM_CAPACITY))
}
