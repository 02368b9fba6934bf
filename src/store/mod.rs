//! Client record storage.
//!
//! A client store keeps one record per key (usually a client IP) for
//! brute-force protection middleware: how many requests were seen, when the
//! first and latest arrived, and when the record stops counting.
//!
//! Two implementations are provided:
//! - [`DieselClientStore`]: a relational table via diesel-async (SQLite, or
//!   PostgreSQL with the `postgres` feature)
//! - [`MemoryClientStore`]: process-local, for single instances and tests

mod backend;
mod database;
mod memory;
mod sweeper;

pub use backend::{
    expires_at, validate_key, BoxedClientStore, ClientRecord, ClientStore, ClientValue,
    StoreError, StoreResult, MAX_TIMESTAMP_YEAR,
};
pub use database::DieselClientStore;
pub use memory::MemoryClientStore;
pub use sweeper::{spawn_sweeper, SweeperHandle};
