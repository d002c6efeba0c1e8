use crate::{
    cht::map::{DefaultHashBuilder, HashMap},
    common::{
        builder_utils::{ensure_sizing_or_panic, table_len_for_capacity},
        constants::LOAD_FACTOR,
    },
};

use std::{hash::BuildHasher, marker::PhantomData};

/// Builds a [`HashMap`][map-struct] with various configuration knobs.
///
/// [map-struct]: ./struct.HashMap.html
///
/// # Examples
///
/// ```rust
/// use cohash::HashMap;
///
/// let map = HashMap::builder()
///     // Room for 1,000 entries before the first resize.
///     .initial_capacity(1_000)
///     // Shown in the log messages of this map.
///     .name("sessions")
///     .build();
///
/// map.insert(0, "zero");
/// assert_eq!(map.get(&0), Some("zero"));
/// assert_eq!(map.capacity(), 2048);
/// ```
///
pub struct HashMapBuilder<K, V> {
    initial_capacity: Option<usize>,
    load_factor: f64,
    concurrency_level: usize,
    name: Option<String>,
    map_type: PhantomData<(K, V)>,
}

impl<K, V> Default for HashMapBuilder<K, V> {
    fn default() -> Self {
        Self {
            initial_capacity: None,
            load_factor: LOAD_FACTOR,
            concurrency_level: 1,
            name: None,
            map_type: PhantomData::default(),
        }
    }
}

impl<K, V> HashMapBuilder<K, V> {
    /// Builds a `HashMap<K, V>`.
    ///
    /// # Panics
    ///
    /// Panics if the load factor is not a positive number, or if the
    /// concurrency level is 0.
    pub fn build(self) -> HashMap<K, V, DefaultHashBuilder> {
        self.build_with_hasher(DefaultHashBuilder::default())
    }

    /// Builds a `HashMap<K, V, S>`, with the given `hasher`.
    ///
    /// # Panics
    ///
    /// Panics under the same conditions as [`build`](#method.build).
    pub fn build_with_hasher<S>(self, hasher: S) -> HashMap<K, V, S>
    where
        S: BuildHasher,
    {
        ensure_sizing_or_panic(self.load_factor, self.concurrency_level);

        let capacity = match self.initial_capacity {
            Some(capacity) => capacity.max(self.concurrency_level),
            None if self.concurrency_level > 1 => self.concurrency_level,
            // The default length.
            None => 0,
        };

        HashMap::with_everything(
            self.name,
            table_len_for_capacity(capacity, self.load_factor),
            hasher,
        )
    }

    /// Sets the number of entries the map can hold before it first grows.
    pub fn initial_capacity(self, capacity: usize) -> Self {
        Self {
            initial_capacity: Some(capacity),
            ..self
        }
    }

    /// Sets the load factor used to size the first table.
    ///
    /// It only affects the initial sizing. Once allocated, a table grows when
    /// it is three quarters full, whatever the load factor.
    pub fn load_factor(self, load_factor: f64) -> Self {
        Self { load_factor, ..self }
    }

    /// Sets the estimated number of threads updating the map at once. The
    /// first table gets at least as many bins as this.
    pub fn concurrency_level(self, concurrency_level: usize) -> Self {
        Self {
            concurrency_level,
            ..self
        }
    }

    /// Sets the name of the map. It prefixes the log messages of the map.
    pub fn name(self, name: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            ..self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::HashMapBuilder;
    use crate::cht::test_util::IdentityHasher;

    #[test]
    fn build_map() {
        let map = HashMapBuilder::default().build();
        assert_eq!(map.capacity(), 0);

        map.insert('a', "Alice");
        assert_eq!(map.get(&'a'), Some("Alice"));
        assert_eq!(map.capacity(), 16);

        let map = HashMapBuilder::default()
            .initial_capacity(100)
            .name("sized")
            .build();
        map.insert('b', "Bob");
        assert_eq!(map.capacity(), 256);

        let map = HashMapBuilder::default()
            .initial_capacity(100)
            .load_factor(1.0)
            .build();
        map.insert('c', "Charlie");
        assert_eq!(map.capacity(), 128);
    }

    #[test]
    fn concurrency_level_sizes_the_first_table() {
        let map = HashMapBuilder::default()
            .concurrency_level(200)
            .build_with_hasher(IdentityHasher::default());
        map.insert(1u64, ());
        assert_eq!(map.capacity(), 512);

        let map = HashMapBuilder::default()
            .initial_capacity(4)
            .concurrency_level(1)
            .build_with_hasher(IdentityHasher::default());
        map.insert(1u64, ());
        assert_eq!(map.capacity(), 8);
    }

    #[test]
    #[should_panic(expected = "load_factor must be a positive number")]
    fn negative_load_factor() {
        let _map = HashMapBuilder::<u32, u32>::default()
            .load_factor(-0.5)
            .build();
    }
}
