//! Client store trait and the record types it exchanges.
//!
//! Implementations persist one record per client key: an attempt counter,
//! the first and last request times, and an optional expiry. The throttling
//! decision itself belongs to the middleware calling the store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::repository::util::is_unique_violation;

/// Last year a stored timestamp can carry.
pub const MAX_TIMESTAMP_YEAR: i32 = 9999;

/// Result type for client store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors from client store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Query error: {0}")]
    Query(#[from] diesel::result::Error),
    #[error("Mapping error: {0}")]
    Mapping(String),
    #[error("Client key must not be empty")]
    InvalidKey,
    #[error("Configuration error: {0}")]
    Config(String),
}

impl StoreError {
    /// True when a write lost a race on the primary key.
    ///
    /// Only the update-then-insert strategy can produce this; callers may retry.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Query(e) if is_unique_violation(e))
    }
}

/// The state a caller writes for a client key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientValue {
    pub count: u64,
    pub first_request: DateTime<Utc>,
    pub last_request: DateTime<Utc>,
}

impl ClientValue {
    /// State for the first request seen from a client.
    pub fn first(at: DateTime<Utc>) -> Self {
        Self {
            count: 1,
            first_request: at,
            last_request: at,
        }
    }
}

/// A stored client record, as returned by reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientRecord {
    pub id: String,
    pub count: u64,
    pub first_request: DateTime<Utc>,
    pub last_request: DateTime<Utc>,
    pub expires: Option<DateTime<Utc>>,
}

impl ClientRecord {
    /// Build a record from a written value.
    pub fn from_value(id: &str, value: &ClientValue, expires: Option<DateTime<Utc>>) -> Self {
        Self {
            id: id.to_string(),
            count: value.count,
            first_request: value.first_request,
            last_request: value.last_request,
            expires,
        }
    }

    /// The caller-supplied part of the record.
    pub fn value(&self) -> ClientValue {
        ClientValue {
            count: self.count,
            first_request: self.first_request,
            last_request: self.last_request,
        }
    }

    /// A record is live only while `now` is strictly before its expiry.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_some_and(|expires| expires <= now)
    }
}

/// Absolute expiry for a write at `now`.
///
/// `None` and zero lifetimes never expire. A lifetime that lands past year
/// 9999 is treated the same way, since stored timestamps have four-digit years.
pub fn expires_at(now: DateTime<Utc>, lifetime: Option<Duration>) -> Option<DateTime<Utc>> {
    let lifetime = lifetime.filter(|l| !l.is_zero())?;
    let delta = TimeDelta::from_std(lifetime).ok()?;
    now.checked_add_signed(delta)
        .filter(|expires| expires.year() <= MAX_TIMESTAMP_YEAR)
}

/// Reject keys the store cannot address.
pub fn validate_key(key: &str) -> StoreResult<()> {
    if key.is_empty() {
        return Err(StoreError::InvalidKey);
    }
    Ok(())
}

/// Shared, type-erased client store.
pub type BoxedClientStore = Arc<dyn ClientStore>;

/// Trait for client record storage backends.
///
/// Implementations must be thread-safe and handle concurrent access.
/// Absence is reported as `Ok(None)`, never as a zero-count record.
#[async_trait]
pub trait ClientStore: Send + Sync {
    /// Write the state for a key, creating the record or updating it in place.
    ///
    /// Updates overwrite `count`, `last_request` and `expires`; the stored
    /// `first_request` is kept from the original insert.
    async fn set(
        &self,
        key: &str,
        value: &ClientValue,
        lifetime: Option<Duration>,
    ) -> StoreResult<()>;

    /// Read the record for a key. Expired records are deleted and reported absent.
    async fn get(&self, key: &str) -> StoreResult<Option<ClientRecord>>;

    /// Delete the record for a key, returning it as it was before deletion.
    async fn reset(&self, key: &str) -> StoreResult<Option<ClientRecord>>;

    /// Delete every expired record. Returns the number removed.
    async fn purge_expired(&self) -> StoreResult<u64>;

    /// Record one more request for a key and return the previous record.
    ///
    /// Composed from `get` and `set`, so it is not atomic across concurrent
    /// callers for the same key.
    async fn increment(
        &self,
        key: &str,
        lifetime: Option<Duration>,
    ) -> StoreResult<Option<ClientRecord>> {
        let previous = self.get(key).await?;
        let now = Utc::now();

        let value = match &previous {
            Some(prev) => ClientValue {
                count: prev.count.saturating_add(1),
                first_request: prev.first_request,
                last_request: now,
            },
            None => ClientValue::first(now),
        };

        self.set(key, &value, lifetime).await?;
        Ok(previous)
    }
}
