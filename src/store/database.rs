//! Diesel-backed client store (SQLite/PostgreSQL).
//!
//! One row per client key in a configurable table. The store keeps no state
//! of its own beyond the connection pool; the table is the source of truth.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use diesel::sql_types::{BigInt, Nullable, Text};
use diesel_async::RunQueryDsl;
use sea_query::{ColumnDef, Expr, Index, InsertStatement, OnConflict, Query, Table};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::backend::{
    expires_at, validate_key, ClientRecord, ClientStore, ClientValue, StoreError, StoreResult,
};
use crate::config::{StoreConfig, UpsertStrategy};
use crate::repository::models::{format_timestamp, ClientRecordRow, NewClientRecord};
use crate::repository::pool::{build_schema_sql, build_sql, DbPool};
use crate::repository::tables::{ClientColumn as Col, ClientTable};
use crate::repository::util::redact_url_password;
use crate::with_conn;

/// Diesel-backed client store.
///
/// The pool is either injected with [`DieselClientStore::with_pool`] or built
/// from the config on first use. Clones share the same pool.
///
/// Timestamps are stored as RFC 3339 `TEXT` (see [`Self::init_schema`]). A
/// pre-existing table with native `TIMESTAMP` columns will not load into
/// [`ClientRecordRow`]; create it with `init_schema` or with text columns.
#[derive(Clone)]
pub struct DieselClientStore {
    pool: Arc<OnceCell<DbPool>>,
    config: StoreConfig,
    table: ClientTable,
}

impl DieselClientStore {
    /// Create a store that connects lazily using `config`.
    pub fn new(config: StoreConfig) -> StoreResult<Self> {
        config.validate()?;
        Ok(Self {
            pool: Arc::new(OnceCell::new()),
            table: config.table()?,
            config,
        })
    }

    /// Create a store over an existing pool. The pool takes precedence over
    /// any connection settings in `config`.
    pub fn with_pool(pool: DbPool, config: StoreConfig) -> StoreResult<Self> {
        config.validate()?;
        Ok(Self {
            pool: Arc::new(OnceCell::new_with(Some(pool))),
            table: config.table()?,
            config,
        })
    }

    /// Create from a SQLite file path with the default table.
    pub fn from_sqlite_path(path: &Path) -> Self {
        Self {
            pool: Arc::new(OnceCell::new_with(Some(DbPool::sqlite_from_path(path)))),
            config: StoreConfig::sqlite(path),
            table: ClientTable::default(),
        }
    }

    /// Use a different upsert strategy.
    pub fn with_upsert(mut self, upsert: UpsertStrategy) -> Self {
        self.config.upsert = upsert;
        self
    }

    /// Table this store reads and writes.
    pub fn table(&self) -> &ClientTable {
        &self.table
    }

    /// Get the pool, creating it on first use.
    pub async fn pool(&self) -> StoreResult<&DbPool> {
        self.pool
            .get_or_try_init(|| async {
                let url = self.config.connection_url();
                let pool = DbPool::from_url(&url, self.config.max_connections)?;
                info!(
                    "Opened {} client store at {} (table {})",
                    pool.backend_name(),
                    redact_url_password(&url),
                    self.table.qualified_name()
                );
                Ok::<_, StoreError>(pool)
            })
            .await
    }

    /// Create the schema (PostgreSQL), table and expiry index if missing.
    pub async fn init_schema(&self) -> StoreResult<()> {
        let pool = self.pool().await?;
        let statements = self.schema_sql(pool);

        with_conn!(pool, conn, {
            for stmt in &statements {
                diesel::sql_query(stmt).execute(&mut conn).await?;
            }
            Ok::<_, StoreError>(())
        })?;

        info!("Initialized client table {}", self.table.qualified_name());
        Ok(())
    }

    /// DDL for the schema (PostgreSQL), table and expiry index.
    fn schema_sql(&self, pool: &DbPool) -> Vec<String> {
        let table_ref = self.table.table_ref(pool);
        let create_table = Table::create()
            .table(table_ref.clone())
            .if_not_exists()
            .col(ColumnDef::new(Col::Id).text().not_null().primary_key())
            .col(ColumnDef::new(Col::Count).big_integer().not_null().default(0))
            .col(ColumnDef::new(Col::FirstRequest).text().not_null())
            .col(ColumnDef::new(Col::LastRequest).text().not_null())
            .col(ColumnDef::new(Col::Expires).text().null())
            .to_owned();
        let create_index = Index::create()
            .if_not_exists()
            .name(self.table.expires_index())
            .table(table_ref)
            .col(Col::Expires)
            .to_owned();

        let mut statements = Vec::with_capacity(3);
        if let Some(schema) = self.table.effective_schema(pool) {
            // Identifier validated by ClientTable
            statements.push(format!("CREATE SCHEMA IF NOT EXISTS \"{}\"", schema));
        }
        statements.push(build_schema_sql(pool, &create_table));
        statements.push(build_schema_sql(pool, &create_index));
        statements
    }

    /// Read the stored row for a key without checking or purging expiry.
    pub async fn peek(&self, key: &str) -> StoreResult<Option<ClientRecord>> {
        let pool = self.pool().await?;
        let sql = self.select_sql(pool, key);

        let rows: Vec<ClientRecordRow> = with_conn!(pool, conn, {
            diesel::sql_query(&sql)
                .bind::<Text, _>(key)
                .load::<ClientRecordRow>(&mut conn)
                .await?
        });

        rows.into_iter().next().map(ClientRecord::try_from).transpose()
    }

    fn select_sql(&self, pool: &DbPool, key: &str) -> String {
        let select = Query::select()
            .columns(Col::ALL)
            .from(self.table.table_ref(pool))
            .and_where(Expr::col(Col::Id).eq(key))
            .to_owned();
        build_sql(pool, &select)
    }

    fn insert_stmt(&self, pool: &DbPool, row: &NewClientRecord<'_>) -> InsertStatement {
        Query::insert()
            .into_table(self.table.table_ref(pool))
            .columns(Col::ALL)
            .values_panic([
                row.id.into(),
                row.count.into(),
                row.first_request.clone().into(),
                row.last_request.clone().into(),
                row.expires.clone().into(),
            ])
            .to_owned()
    }

    /// Insert or update in one statement. `first_request` is only written on insert.
    async fn upsert_atomic(&self, pool: &DbPool, row: &NewClientRecord<'_>) -> StoreResult<()> {
        let sql = {
            let stmt = self
                .insert_stmt(pool, row)
                .on_conflict(
                    OnConflict::column(Col::Id)
                        .update_columns([Col::Count, Col::LastRequest, Col::Expires])
                        .to_owned(),
                )
                .to_owned();
            build_sql(pool, &stmt)
        };

        with_conn!(pool, conn, {
            diesel::sql_query(&sql)
                .bind::<Text, _>(row.id)
                .bind::<BigInt, _>(row.count)
                .bind::<Text, _>(&row.first_request)
                .bind::<Text, _>(&row.last_request)
                .bind::<Nullable<Text>, _>(row.expires.as_deref())
                .execute(&mut conn)
                .await?;
            Ok(())
        })
    }

    /// Update the existing row, inserting when no row matched.
    ///
    /// Two first writers for the same key can both miss the update; the
    /// second insert then fails on the primary key and the error is returned.
    async fn update_then_insert(
        &self,
        pool: &DbPool,
        row: &NewClientRecord<'_>,
    ) -> StoreResult<()> {
        let update_sql = {
            let update = Query::update()
                .table(self.table.table_ref(pool))
                .value(Col::Count, row.count)
                .value(Col::LastRequest, row.last_request.clone())
                .value(Col::Expires, row.expires.clone())
                .and_where(Expr::col(Col::Id).eq(row.id))
                .to_owned();
            build_sql(pool, &update)
        };
        let insert_sql = build_sql(pool, &self.insert_stmt(pool, row));

        with_conn!(pool, conn, {
            let updated = diesel::sql_query(&update_sql)
                .bind::<BigInt, _>(row.count)
                .bind::<Text, _>(&row.last_request)
                .bind::<Nullable<Text>, _>(row.expires.as_deref())
                .bind::<Text, _>(row.id)
                .execute(&mut conn)
                .await?;

            if updated == 0 {
                diesel::sql_query(&insert_sql)
                    .bind::<Text, _>(row.id)
                    .bind::<BigInt, _>(row.count)
                    .bind::<Text, _>(&row.first_request)
                    .bind::<Text, _>(&row.last_request)
                    .bind::<Nullable<Text>, _>(row.expires.as_deref())
                    .execute(&mut conn)
                    .await
                    .map_err(|e| {
                        let err = StoreError::from(e);
                        if err.is_conflict() {
                            debug!(key = row.id, "Lost insert race for client record");
                        }
                        err
                    })?;
            }
            Ok(())
        })
    }
}

#[async_trait]
impl ClientStore for DieselClientStore {
    async fn set(
        &self,
        key: &str,
        value: &ClientValue,
        lifetime: Option<Duration>,
    ) -> StoreResult<()> {
        validate_key(key)?;
        let pool = self.pool().await?;
        let row = NewClientRecord::new(key, value, expires_at(Utc::now(), lifetime))?;

        match self.config.upsert {
            UpsertStrategy::Atomic => self.upsert_atomic(pool, &row).await,
            UpsertStrategy::UpdateThenInsert => self.update_then_insert(pool, &row).await,
        }
    }

    async fn get(&self, key: &str) -> StoreResult<Option<ClientRecord>> {
        let pool = self.pool().await?;
        let select_sql = self.select_sql(pool, key);
        let now = Utc::now();
        let now_str = format_timestamp(now);

        // Only delete while still expired, so a concurrent refresh survives
        let delete_sql = {
            let delete = Query::delete()
                .from_table(self.table.table_ref(pool))
                .and_where(Expr::col(Col::Id).eq(key))
                .and_where(Expr::col(Col::Expires).lte(now_str.as_str()))
                .to_owned();
            build_sql(pool, &delete)
        };

        with_conn!(pool, conn, {
            let rows: Vec<ClientRecordRow> = diesel::sql_query(&select_sql)
                .bind::<Text, _>(key)
                .load::<ClientRecordRow>(&mut conn)
                .await?;

            let Some(row) = rows.into_iter().next() else {
                return Ok(None);
            };
            let record = ClientRecord::try_from(row)?;

            if record.is_expired_at(now) {
                diesel::sql_query(&delete_sql)
                    .bind::<Text, _>(key)
                    .bind::<Text, _>(&now_str)
                    .execute(&mut conn)
                    .await?;
                debug!(key, "Purged expired client record");
                return Ok(None);
            }

            Ok(Some(record))
        })
    }

    async fn reset(&self, key: &str) -> StoreResult<Option<ClientRecord>> {
        let pool = self.pool().await?;
        let sql = {
            let delete = Query::delete()
                .from_table(self.table.table_ref(pool))
                .and_where(Expr::col(Col::Id).eq(key))
                .returning(Query::returning().columns(Col::ALL))
                .to_owned();
            build_sql(pool, &delete)
        };

        let rows: Vec<ClientRecordRow> = with_conn!(pool, conn, {
            diesel::sql_query(&sql)
                .bind::<Text, _>(key)
                .load::<ClientRecordRow>(&mut conn)
                .await?
        });

        rows.into_iter().next().map(ClientRecord::try_from).transpose()
    }

    async fn purge_expired(&self) -> StoreResult<u64> {
        let pool = self.pool().await?;
        let now = format_timestamp(Utc::now());
        let sql = {
            let delete = Query::delete()
                .from_table(self.table.table_ref(pool))
                .and_where(Expr::col(Col::Expires).is_not_null())
                .and_where(Expr::col(Col::Expires).lte(now.as_str()))
                .to_owned();
            build_sql(pool, &delete)
        };

        let removed = with_conn!(pool, conn, {
            diesel::sql_query(&sql)
                .bind::<Text, _>(&now)
                .execute(&mut conn)
                .await?
        });

        Ok(removed as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use tempfile::tempdir;

    async fn setup_test_db() -> (tempfile::TempDir, DieselClientStore) {
        let dir = tempdir().unwrap();
        let store = DieselClientStore::from_sqlite_path(&dir.path().join("test.db"));
        store.init_schema().await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_init_schema_is_idempotent() {
        let (_dir, store) = setup_test_db().await;
        store.init_schema().await.unwrap();
        assert!(store.get("1.2.3.4").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lazy_pool_from_config() {
        let dir = tempdir().unwrap();
        let config = StoreConfig {
            table_name: "attempts".into(),
            ..StoreConfig::sqlite(&dir.path().join("lazy.db"))
        };
        let store = DieselClientStore::new(config).unwrap();
        store.init_schema().await.unwrap();

        store
            .set("10.0.0.1", &ClientValue::first(Utc::now()), None)
            .await
            .unwrap();
        assert_eq!(store.get("10.0.0.1").await.unwrap().unwrap().count, 1);
        assert_eq!(store.table().name(), "attempts");
    }

    #[tokio::test]
    async fn test_set_preserves_first_request() {
        let (_dir, store) = setup_test_db().await;
        let t0 = Utc::now() - TimeDelta::seconds(30);
        let t1 = Utc::now();

        store.set("1.2.3.4", &ClientValue::first(t0), None).await.unwrap();
        let second = ClientValue {
            count: 2,
            first_request: t1,
            last_request: t1,
        };
        store.set("1.2.3.4", &second, None).await.unwrap();

        let record = store.get("1.2.3.4").await.unwrap().unwrap();
        assert_eq!(record.count, 2);
        assert_eq!(format_timestamp(record.first_request), format_timestamp(t0));
        assert_eq!(format_timestamp(record.last_request), format_timestamp(t1));
        assert!(record.expires.is_none());
    }

    #[tokio::test]
    async fn test_expired_row_is_deleted_on_get() {
        let (_dir, store) = setup_test_db().await;
        let now = Utc::now();

        // Write an already expired row directly.
        let row = NewClientRecord::new(
            "1.2.3.4",
            &ClientValue::first(now),
            Some(now - TimeDelta::seconds(5)),
        )
        .unwrap();
        let pool = store.pool().await.unwrap();
        store.update_then_insert(pool, &row).await.unwrap();

        assert!(store.peek("1.2.3.4").await.unwrap().is_some());
        assert!(store.get("1.2.3.4").await.unwrap().is_none());
        assert!(store.peek("1.2.3.4").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_insert_is_conflict() {
        let (_dir, store) = setup_test_db().await;
        let pool = store.pool().await.unwrap();
        let row = NewClientRecord::new("1.2.3.4", &ClientValue::first(Utc::now()), None).unwrap();

        // Simulate the losing writer: its update missed, then its insert collides.
        store.update_then_insert(pool, &row).await.unwrap();
        let insert_sql = build_sql(pool, &store.insert_stmt(pool, &row));
        let result: StoreResult<()> = async {
            with_conn!(pool, conn, {
                diesel::sql_query(&insert_sql)
                    .bind::<Text, _>(row.id)
                    .bind::<BigInt, _>(row.count)
                    .bind::<Text, _>(&row.first_request)
                    .bind::<Text, _>(&row.last_request)
                    .bind::<Nullable<Text>, _>(row.expires.as_deref())
                    .execute(&mut conn)
                    .await?;
                Ok::<(), StoreError>(())
            })
        }
        .await;

        let err = result.unwrap_err();
        assert!(err.is_conflict(), "expected conflict, got {err}");
    }

    #[tokio::test]
    async fn test_update_then_insert_strategy() {
        let (_dir, store) = setup_test_db().await;
        let store = store.with_upsert(UpsertStrategy::UpdateThenInsert);
        let t0 = Utc::now() - TimeDelta::seconds(10);

        store.set("1.2.3.4", &ClientValue::first(t0), Some(Duration::from_secs(60))).await.unwrap();
        store.increment("1.2.3.4", Some(Duration::from_secs(60))).await.unwrap();

        let record = store.get("1.2.3.4").await.unwrap().unwrap();
        assert_eq!(record.count, 2);
        assert_eq!(format_timestamp(record.first_request), format_timestamp(t0));
        assert!(record.expires.is_some());
    }

    #[tokio::test]
    async fn test_purge_expired_only_removes_expired() {
        let (_dir, store) = setup_test_db().await;
        let pool = store.pool().await.unwrap();
        let now = Utc::now();

        let stale = NewClientRecord::new(
            "stale",
            &ClientValue::first(now),
            Some(now - TimeDelta::seconds(1)),
        )
        .unwrap();
        store.upsert_atomic(pool, &stale).await.unwrap();
        store
            .set("live", &ClientValue::first(now), Some(Duration::from_secs(60)))
            .await
            .unwrap();
        store.set("forever", &ClientValue::first(now), None).await.unwrap();

        assert_eq!(store.purge_expired().await.unwrap(), 1);
        assert!(store.peek("stale").await.unwrap().is_none());
        assert!(store.peek("live").await.unwrap().is_some());
        assert!(store.peek("forever").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_reset_ignores_expiry() {
        let (_dir, store) = setup_test_db().await;
        let pool = store.pool().await.unwrap();
        let now = Utc::now();
        let row = NewClientRecord::new(
            "1.2.3.4",
            &ClientValue::first(now),
            Some(now - TimeDelta::seconds(1)),
        )
        .unwrap();
        store.upsert_atomic(pool, &row).await.unwrap();

        let reset = store.reset("1.2.3.4").await.unwrap().unwrap();
        assert_eq!(reset.count, 1);
        assert!(reset.expires.is_some());
        assert!(store.reset("1.2.3.4").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_far_future_lifetime_never_expires() {
        let (_dir, store) = setup_test_db().await;
        let lifetime = Some(Duration::from_secs(300_000_000_000));

        store
            .set("1.2.3.4", &ClientValue::first(Utc::now()), lifetime)
            .await
            .unwrap();

        let record = store.get("1.2.3.4").await.unwrap().unwrap();
        assert!(record.expires.is_none());
        assert_eq!(store.purge_expired().await.unwrap(), 0);
        assert!(store.peek("1.2.3.4").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_empty_key_rejected() {
        let (_dir, store) = setup_test_db().await;
        let err = store
            .set("", &ClientValue::first(Utc::now()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidKey));
    }

    #[tokio::test]
    async fn test_connection_error_on_unopenable_path() {
        let dir = tempdir().unwrap();
        let store =
            DieselClientStore::from_sqlite_path(&dir.path().join("missing").join("test.db"));
        let err = store.get("1.2.3.4").await.unwrap_err();
        assert!(matches!(err, StoreError::Connection(_)), "got {err}");
    }
}
