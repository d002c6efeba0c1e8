use std::vec;

use super::map::HashMap;

/// Walks a map one group of bins at a time, buffering clones of the entries
/// of each group.
///
/// Group `i` holds the bins whose index is congruent to `i` modulo the table
/// length seen when the walk started. As tables only ever double, an entry
/// stays in the same group across resizes, so the walk neither misses nor
/// repeats entries that are present throughout.
struct Scan<'a, K, V, S, T> {
    map: &'a HashMap<K, V, S>,
    num_groups: usize,
    group: usize,
    buffer: vec::IntoIter<T>,
    with_entry: fn(&K, &V) -> T,
}

impl<'a, K, V, S, T> Scan<'a, K, V, S, T> {
    fn new(map: &'a HashMap<K, V, S>, num_groups: usize, with_entry: fn(&K, &V) -> T) -> Self {
        Self {
            map,
            num_groups,
            group: 0,
            buffer: Vec::new().into_iter(),
            with_entry,
        }
    }
}

impl<'a, K, V, S, T> Iterator for Scan<'a, K, V, S, T> {
    type Item = T;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let item @ Some(_) = self.buffer.next() {
                return item;
            }
            if self.group >= self.num_groups {
                return None;
            }

            let mut entries = Vec::new();
            self.map
                .scan_bins(self.num_groups, self.group, &mut self.with_entry, &mut entries);
            self.group += 1;
            self.buffer = entries.into_iter();
        }
    }
}

/// An iterator over clones of the entries of a `HashMap`.
///
/// Created by [`HashMap::iter`](./struct.HashMap.html#method.iter).
pub struct Iter<'a, K, V, S> {
    scan: Scan<'a, K, V, S, (K, V)>,
}

impl<'a, K: Clone, V: Clone, S> Iter<'a, K, V, S> {
    pub(crate) fn new(map: &'a HashMap<K, V, S>, table_len: usize) -> Self {
        Self {
            scan: Scan::new(map, table_len, |k, v| (k.clone(), v.clone())),
        }
    }
}

impl<'a, K, V, S> Iterator for Iter<'a, K, V, S> {
    type Item = (K, V);

    fn next(&mut self) -> Option<Self::Item> {
        self.scan.next()
    }
}

/// An iterator over clones of the keys of a `HashMap`.
///
/// Created by [`HashMap::keys`](./struct.HashMap.html#method.keys).
pub struct Keys<'a, K, V, S> {
    scan: Scan<'a, K, V, S, K>,
}

impl<'a, K: Clone, V, S> Keys<'a, K, V, S> {
    pub(crate) fn new(map: &'a HashMap<K, V, S>, table_len: usize) -> Self {
        Self {
            scan: Scan::new(map, table_len, |k, _| k.clone()),
        }
    }
}

impl<'a, K, V, S> Iterator for Keys<'a, K, V, S> {
    type Item = K;

    fn next(&mut self) -> Option<Self::Item> {
        self.scan.next()
    }
}
