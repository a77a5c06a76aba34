//! Durable store ports for user operations and bundles.
//!
//! The relational store is the source of truth for the whole lifecycle;
//! the KV cache on top of it is only an index. Rows are never deleted.

#[cfg(any(test, feature = "test-utils"))]
pub mod memory;
pub mod postgres;
pub mod traits;

#[cfg(any(test, feature = "test-utils"))]
pub use memory::MemoryDatastore;
pub use postgres::PostgresDatastore;
pub use traits::{BundleStore, StoreError, UserOpStore};
