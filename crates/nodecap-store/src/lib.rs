//! nodecap-store: persistence for per-node resource state.
//!
//! Resource plugins only need three operations on opaque JSON blobs, expressed
//! by the [`ResourceStore`] trait. [`RedbStore`] implements it on top of
//! [redb](https://docs.rs/redb), on disk or in memory.
//!
//! The store does no locking beyond what redb provides: write transactions
//! are serialized, so each `put`/`delete` is atomic for its key.

pub mod error;
pub mod store;
pub mod tables;

pub use error::{StoreError, StoreResult};
pub use store::{RedbStore, ResourceStore, StoreFuture};
