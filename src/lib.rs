//! brute-store - relational client store for brute-force protection.
//!
//! Persists per-client request counters (count, first and last request
//! time, expiry) so rate limiting middleware can share state across
//! processes through a database table.

pub mod config;
pub mod repository;
pub mod store;

pub use config::{ConfigFile, StoreConfig, UpsertStrategy};
pub use store::{
    spawn_sweeper, BoxedClientStore, ClientRecord, ClientStore, ClientValue, DieselClientStore,
    MemoryClientStore, StoreError, StoreResult, SweeperHandle,
};
