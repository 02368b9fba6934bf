//! Repository layer for database persistence.
//!
//! Statements are generated with sea-query (identifier quoting and
//! placeholder syntax per backend) and executed through diesel-async.
//! Supports both SQLite and PostgreSQL backends.

pub mod models;
pub mod pool;
pub mod tables;
pub mod util;

pub use models::{ClientRecordRow, NewClientRecord};
pub use pool::DbPool;
pub use tables::{ClientColumn, ClientTable};
