//! Domain value objects shared across the queue.

pub mod value_objects;

pub use value_objects::{Priority, RetryPolicy};
