#![warn(clippy::all)]
#![warn(rust_2018_idioms)]

//! Cohash is a concurrent hash map for Rust whose table grows without ever
//! blocking the whole map.
//!
//! Reads take no lock. Writes lock only the bin they touch. When the map
//! gets too full, the threads that use it move the bins to a table twice as
//! large, each taking a range of bins, while reads and writes to the other
//! bins carry on.
//!
//! # Example
//!
//! ```rust
//! use cohash::HashMap;
//! use std::{sync::Arc, thread};
//!
//! let map = Arc::new(HashMap::new());
//!
//! let handles = (0..4)
//!     .map(|t| {
//!         let map = Arc::clone(&map);
//!         thread::spawn(move || {
//!             for i in 0..1_000 {
//!                 map.insert(t * 1_000 + i, i);
//!             }
//!         })
//!     })
//!     .collect::<Vec<_>>();
//! handles.into_iter().for_each(|h| h.join().unwrap());
//!
//! assert_eq!(map.len(), 4_000);
//! assert_eq!(map.get(&3_999), Some(999));
//!
//! // The value is computed only if the key is absent.
//! assert_eq!(map.compute_if_absent(5_000, || 42), 42);
//! assert_eq!(map.compute_if_absent(5_000, || unreachable!()), 42);
//! ```
//!
//! # Logging
//!
//! With the `logging` feature, enabled by default, the map logs the start
//! and the end of each resize at the debug level, the claims of resizers at
//! the trace level, and growth failures at the error level, through the
//! [`log`](https://docs.rs/log) crate.

mod builder;
mod cht;
mod common;

pub use builder::HashMapBuilder;
pub use cht::{
    iter::{Iter, Keys},
    map::{resize::ResizeStats, DefaultHashBuilder, HashMap},
};
pub use common::error::TableError;
