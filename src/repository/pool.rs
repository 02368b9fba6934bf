//! Database connection pool supporting SQLite and PostgreSQL.
//!
//! The backend is picked at runtime from the database URL. Connections are
//! checked out per operation and released when the guard drops, so every
//! store call leaves the pool quiesced whether it succeeded or not.

use std::path::Path;

use diesel::sqlite::SqliteConnection;
use diesel_async::sync_connection_wrapper::SyncConnectionWrapper;
use diesel_async::{AsyncConnection, SimpleAsyncConnection};
use sea_query::{QueryStatementWriter, SchemaStatementBuilder, SqliteQueryBuilder};

#[cfg(feature = "postgres")]
use diesel_async::pooled_connection::deadpool::Pool as DeadPool;
#[cfg(feature = "postgres")]
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
#[cfg(feature = "postgres")]
use diesel_async::AsyncPgConnection;
#[cfg(feature = "postgres")]
use sea_query::PostgresQueryBuilder;

use super::util::{is_postgres_url, sqlite_path};
use crate::store::{StoreError, StoreResult};

/// Pragmas applied to every SQLite connection.
///
/// `busy_timeout` must come first: switching to WAL takes a lock, and
/// connections opened concurrently would otherwise fail immediately.
/// The busy timeout is the only timeout layer; the store adds none of its own.
const SQLITE_PRAGMAS: &str = r#"
    PRAGMA busy_timeout = 30000;
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;
"#;

/// Async SQLite connection type.
pub type SqliteConn = SyncConnectionWrapper<SqliteConnection>;

/// Async PostgreSQL connection type.
#[cfg(feature = "postgres")]
pub type PgConn = deadpool::managed::Object<AsyncDieselConnectionManager<AsyncPgConnection>>;

/// SQLite connection factory.
///
/// SQLite connections are cheap and file-based, so a fresh connection is
/// opened for each checkout instead of keeping a pool.
#[derive(Clone, Debug)]
pub struct SqlitePool {
    database_url: String,
}

impl SqlitePool {
    /// Create a new SQLite pool. `_max_size` is accepted for signature parity.
    pub fn new(database_url: &str, _max_size: usize) -> Self {
        Self {
            database_url: sqlite_path(database_url).to_string(),
        }
    }

    /// Create pool from a file path.
    pub fn from_path(path: &Path) -> Self {
        Self::new(&path.display().to_string(), 1)
    }

    /// Open a connection.
    pub async fn get(&self) -> StoreResult<SqliteConn> {
        let mut conn = SqliteConn::establish(&self.database_url)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        conn.batch_execute(SQLITE_PRAGMAS)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(conn)
    }
}

/// PostgreSQL connection pool.
#[cfg(feature = "postgres")]
#[derive(Clone)]
pub struct PgPool {
    pool: DeadPool<AsyncPgConnection>,
}

#[cfg(feature = "postgres")]
impl PgPool {
    /// Create a new PostgreSQL pool. Connections are established lazily.
    pub fn new(database_url: &str, max_size: usize) -> StoreResult<Self> {
        let config = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
        let pool = DeadPool::builder(config)
            .max_size(max_size)
            .build()
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(Self { pool })
    }

    /// Check out a connection.
    pub async fn get(&self) -> StoreResult<PgConn> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))
    }
}

/// Database pool shared between stores.
///
/// Cloning is cheap; clones share the underlying PostgreSQL pool.
#[derive(Clone)]
pub enum DbPool {
    Sqlite(SqlitePool),
    #[cfg(feature = "postgres")]
    Postgres(PgPool),
}

impl DbPool {
    /// Create a pool from a database URL.
    ///
    /// - `postgres://` or `postgresql://` → PostgreSQL (requires the `postgres` feature)
    /// - Everything else → SQLite file path, with an optional `sqlite:` prefix
    pub fn from_url(url: &str, max_size: usize) -> StoreResult<Self> {
        if is_postgres_url(url) {
            #[cfg(feature = "postgres")]
            return Ok(DbPool::Postgres(PgPool::new(url, max_size)?));
            #[cfg(not(feature = "postgres"))]
            return Err(StoreError::Config(
                "PostgreSQL support not compiled. Use --features postgres".into(),
            ));
        }

        Ok(DbPool::Sqlite(SqlitePool::new(url, max_size)))
    }

    /// Create a SQLite pool from a file path.
    pub fn sqlite_from_path(path: &Path) -> Self {
        DbPool::Sqlite(SqlitePool::from_path(path))
    }

    /// Check if this is a SQLite backend.
    pub fn is_sqlite(&self) -> bool {
        matches!(self, DbPool::Sqlite(_))
    }

    /// Check if this is a PostgreSQL backend.
    #[cfg(feature = "postgres")]
    pub fn is_postgres(&self) -> bool {
        matches!(self, DbPool::Postgres(_))
    }

    /// Short backend name for logs.
    pub fn backend_name(&self) -> &'static str {
        match self {
            DbPool::Sqlite(_) => "sqlite",
            #[cfg(feature = "postgres")]
            DbPool::Postgres(_) => "postgres",
        }
    }
}

impl std::fmt::Debug for DbPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("DbPool").field(&self.backend_name()).finish()
    }
}

/// Render a sea-query statement with the placeholder syntax of the pool's backend.
///
/// Values are bound separately with `diesel::sql_query(..).bind()`, in the order
/// the statement lists them.
pub fn build_sql<S: QueryStatementWriter>(pool: &DbPool, stmt: &S) -> String {
    match pool {
        DbPool::Sqlite(_) => stmt.build(SqliteQueryBuilder).0,
        #[cfg(feature = "postgres")]
        DbPool::Postgres(_) => stmt.build(PostgresQueryBuilder).0,
    }
}

/// Render a sea-query schema statement (CREATE TABLE / INDEX) for the pool's backend.
pub fn build_schema_sql<S: SchemaStatementBuilder>(pool: &DbPool, stmt: &S) -> String {
    match pool {
        DbPool::Sqlite(_) => stmt.build(SqliteQueryBuilder),
        #[cfg(feature = "postgres")]
        DbPool::Postgres(_) => stmt.build(PostgresQueryBuilder),
    }
}

/// Run a database operation on whichever backend the pool holds.
///
/// The connection is checked out for the duration of `$body` and released
/// when it goes out of scope.
///
/// # Example
/// ```ignore
/// with_conn!(self.pool, conn, {
///     diesel::sql_query(&sql).execute(&mut conn).await?;
///     Ok(())
/// })
/// ```
#[macro_export]
macro_rules! with_conn {
    ($pool:expr, $conn:ident, $body:block) => {{
        match &$pool {
            $crate::repository::pool::DbPool::Sqlite(pool) => {
                #[allow(unused_mut)]
                let mut $conn = pool.get().await?;
                $body
            }
            #[cfg(feature = "postgres")]
            $crate::repository::pool::DbPool::Postgres(pool) => {
                #[allow(unused_mut)]
                let mut $conn = pool.get().await?;
                $body
            }
        }
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_detection() {
        assert!(DbPool::from_url("/path/to/brute.db", 4).unwrap().is_sqlite());
        assert!(DbPool::from_url("sqlite:/path/to/brute.db", 4)
            .unwrap()
            .is_sqlite());

        #[cfg(feature = "postgres")]
        assert!(DbPool::from_url("postgres://localhost/brutedb", 4)
            .unwrap()
            .is_postgres());

        #[cfg(not(feature = "postgres"))]
        assert!(matches!(
            DbPool::from_url("postgres://localhost/brutedb", 4),
            Err(StoreError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_sqlite_checkout() {
        let dir = tempfile::tempdir().unwrap();
        let pool = DbPool::sqlite_from_path(&dir.path().join("pool.db"));
        let result: StoreResult<()> = async {
            with_conn!(pool, conn, {
                conn.batch_execute("CREATE TABLE t (id TEXT PRIMARY KEY)")
                    .await?;
                Ok::<(), StoreError>(())
            })
        }
        .await;
        assert!(result.is_ok());
        assert_eq!(pool.backend_name(), "sqlite");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_sqlite_checkouts() {
        let dir = tempfile::tempdir().unwrap();
        let pool = SqlitePool::from_path(&dir.path().join("busy.db"));

        // Fresh file: every connection races to switch the journal to WAL
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                tokio::spawn(async move { pool.get().await.map(|_| ()) })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap().unwrap();
        }
    }
}
