//! SQLite-backed store.
//!
//! One table holds every item. Key and index attributes are copied into
//! columns; the full item is kept as JSON in `body`. Secondary indexes are
//! plain SQLite indexes over `(hash, range, pk, sk)`, which gives the same
//! byte-wise ordering as the in-memory backend (default BINARY collation).

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, Transaction};
use std::path::Path;
use tracing::{debug, info, warn};

use crate::error::{Result, StoreError};
use crate::schema::{
    validate_table_name, Index, ATTR_SI_KEY1, ATTR_SI_KEY2, ATTR_SI_KEY3, ATTR_TYPE,
};
use crate::store::KvStore;
use crate::types::{
    validate_limit, validate_transaction, Attributes, BatchSelect,
    CancellationReason, IndexQuery, ItemKey, Page, QueryRequest, StartKey, WriteOp,
};

/// SQLite extended result codes that mean another connection holds the lock.
const BUSY_CODES: &[&str] = &["5", "6", "261", "262", "517"];

/// SQLite store
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    table: String,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("table", &self.table)
            .finish()
    }
}

impl SqliteStore {
    /// Open or create a store at the given path.
    ///
    /// Creates the table and indexes if they don't exist.
    pub async fn open(path: impl AsRef<Path>, table: &str) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let url = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;

        sqlx::query("PRAGMA journal_mode=WAL").execute(&pool).await?;
        sqlx::query("PRAGMA synchronous=NORMAL").execute(&pool).await?;

        let store = Self::from_pool(pool, table).await?;
        info!(path = %path.display(), table = %store.table, "Store opened");
        Ok(store)
    }

    /// Open a private in-memory database (for testing).
    ///
    /// Limited to one connection that never expires: every connection to
    /// `sqlite::memory:` gets its own empty database.
    pub async fn open_memory(table: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Self::from_pool(pool, table).await
    }

    /// Wrap an existing pool, creating the table if needed.
    pub async fn from_pool(pool: SqlitePool, table: &str) -> Result<Self> {
        validate_table_name(table).map_err(StoreError::InvalidTable)?;
        let store = Self {
            pool,
            table: table.to_string(),
        };
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Close the pool.
    pub async fn close(self) {
        self.pool.close().await;
    }

    async fn ensure_schema(&self) -> Result<()> {
        let t = &self.table;
        sqlx::query(&format!(
            r#"CREATE TABLE IF NOT EXISTS "{t}" (
                pk TEXT NOT NULL,
                sk TEXT NOT NULL,
                item_type TEXT,
                si_key1 TEXT,
                si_key2 TEXT,
                si_key3 TEXT,
                body TEXT NOT NULL,
                PRIMARY KEY (pk, sk)
            ) WITHOUT ROWID"#
        ))
        .execute(&self.pool)
        .await?;

        for index in [Index::TagValue, Index::TypeSort, Index::ParentOrder] {
            let (hash, range) = index_columns(index);
            sqlx::query(&format!(
                r#"CREATE INDEX IF NOT EXISTS "{t}_{hash}_{range}" ON "{t}" ({hash}, {range}, pk, sk)"#
            ))
            .execute(&self.pool)
            .await?;
        }

        debug!(table = %t, "Store schema verified");
        Ok(())
    }
}

/// Column pair backing a secondary index.
fn index_columns(index: Index) -> (&'static str, &'static str) {
    match index {
        Index::TagValue => ("si_key1", "pk"),
        Index::TypeSort => ("item_type", "sk"),
        Index::ParentOrder => ("si_key2", "si_key3"),
    }
}

/// Index attributes must be strings when present.
fn index_column(item: &Attributes, attr: &str) -> Result<Option<String>> {
    match item.get(attr) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(StoreError::validation(format!(
            "index attribute '{}' must be a string, got {}",
            attr, other
        ))),
    }
}

fn decode_body(row: &SqliteRow) -> Result<Attributes> {
    let body: String = row.try_get("body")?;
    Ok(serde_json::from_str(&body)?)
}

/// SQL for `LIMIT`: one extra row tells whether another page exists.
fn fetch_limit(limit: Option<usize>) -> i64 {
    limit.map(|l| l as i64 + 1).unwrap_or(-1)
}

/// Split an over-fetched result into a page.
fn into_page<K>(rows: Vec<SqliteRow>, limit: Option<usize>, start_key_of: K) -> Result<Page>
where
    K: Fn(&SqliteRow) -> Result<StartKey>,
{
    let has_more = limit.is_some_and(|l| rows.len() > l);
    let take = limit.unwrap_or(rows.len()).min(rows.len());
    let last_evaluated = if has_more && take > 0 {
        Some(start_key_of(&rows[take - 1])?)
    } else {
        None
    };
    let items = rows[..take]
        .iter()
        .map(decode_body)
        .collect::<Result<Vec<_>>>()?;
    Ok(Page {
        items,
        last_evaluated,
    })
}

/// Map lock contention onto the structured cancellation callers retry on.
fn conflict_or(err: sqlx::Error, keys: &[ItemKey]) -> StoreError {
    let busy = match &err {
        sqlx::Error::Database(db_err) => db_err
            .code()
            .map(|code| BUSY_CODES.iter().any(|busy| code == *busy))
            .unwrap_or(false),
        _ => false,
    };
    if busy {
        warn!(error = %err, "SQLite write contention, cancelling transaction");
        StoreError::TransactionCanceled {
            reasons: keys
                .iter()
                .map(|k| CancellationReason::conflict(k.clone(), err.to_string()))
                .collect(),
        }
    } else {
        StoreError::Sqlx(err)
    }
}

impl SqliteStore {
    async fn fetch_existing(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        key: &ItemKey,
    ) -> std::result::Result<Option<Attributes>, sqlx::Error> {
        let row = sqlx::query(&format!(
            r#"SELECT body FROM "{}" WHERE pk = ? AND sk = ?"#,
            self.table
        ))
        .bind(&key.pk)
        .bind(&key.sk)
        .fetch_optional(&mut **tx)
        .await?;
        match row {
            Some(row) => {
                let body: String = row.try_get("body")?;
                serde_json::from_str(&body)
                    .map(Some)
                    .map_err(|e| sqlx::Error::Decode(Box::new(e)))
            }
            None => Ok(None),
        }
    }

    async fn apply(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        op: &WriteOp,
        key: &ItemKey,
    ) -> Result<()> {
        match op {
            WriteOp::Put { item, .. } => {
                let body = serde_json::to_string(item)?;
                sqlx::query(&format!(
                    r#"INSERT OR REPLACE INTO "{}"
                        (pk, sk, item_type, si_key1, si_key2, si_key3, body)
                        VALUES (?, ?, ?, ?, ?, ?, ?)"#,
                    self.table
                ))
                .bind(&key.pk)
                .bind(&key.sk)
                .bind(index_column(item, ATTR_TYPE)?)
                .bind(index_column(item, ATTR_SI_KEY1)?)
                .bind(index_column(item, ATTR_SI_KEY2)?)
                .bind(index_column(item, ATTR_SI_KEY3)?)
                .bind(body)
                .execute(&mut **tx)
                .await?;
            }
            WriteOp::Delete { .. } => {
                sqlx::query(&format!(
                    r#"DELETE FROM "{}" WHERE pk = ? AND sk = ?"#,
                    self.table
                ))
                .bind(&key.pk)
                .bind(&key.sk)
                .execute(&mut **tx)
                .await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl KvStore for SqliteStore {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    async fn get_item(&self, key: &ItemKey) -> Result<Option<Attributes>> {
        let row = sqlx::query(&format!(
            r#"SELECT body FROM "{}" WHERE pk = ? AND sk = ?"#,
            self.table
        ))
        .bind(&key.pk)
        .bind(&key.sk)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(decode_body).transpose()
    }

    async fn query(&self, request: &QueryRequest) -> Result<Page> {
        validate_limit(request.limit)?;
        let (cmp, order) = if request.ascending {
            (">", "ASC")
        } else {
            ("<", "DESC")
        };
        let start_clause = if request.exclusive_start.is_some() {
            format!("AND sk {cmp} ?")
        } else {
            String::new()
        };
        let sql = format!(
            r#"SELECT pk, sk, body FROM "{}"
               WHERE pk = ? AND substr(sk, 1, length(?)) = ? {start_clause}
               ORDER BY sk {order}
               LIMIT ?"#,
            self.table
        );
        let prefix = request.sort_prefix.clone().unwrap_or_default();
        let mut query = sqlx::query(&sql)
            .bind(&request.partition)
            .bind(prefix.clone())
            .bind(prefix);
        if let Some(start) = &request.exclusive_start {
            query = query.bind(&start.sk);
        }
        let rows = query
            .bind(fetch_limit(request.limit))
            .fetch_all(&self.pool)
            .await?;

        debug!(partition = %request.partition, rows = rows.len(), "sqlite query");
        into_page(rows, request.limit, |row| {
            Ok(StartKey::table(
                row.try_get::<String, _>("pk")?,
                row.try_get::<String, _>("sk")?,
            ))
        })
    }

    async fn query_index(&self, request: &IndexQuery) -> Result<Page> {
        validate_limit(request.limit)?;
        let (hash_col, range_col) = index_columns(request.index);
        let (cmp, order) = if request.ascending {
            (">", "ASC")
        } else {
            ("<", "DESC")
        };
        let start = request.exclusive_start.as_ref().and_then(|s| s.index_order());
        let start_clause = if start.is_some() {
            format!("AND ({range_col}, pk, sk) {cmp} (?, ?, ?)")
        } else {
            String::new()
        };
        let sql = format!(
            r#"SELECT pk, sk, {range_col} AS range_value, body FROM "{}"
               WHERE {hash_col} = ? AND substr({range_col}, 1, length(?)) = ? {start_clause}
               ORDER BY {range_col} {order}, pk {order}, sk {order}
               LIMIT ?"#,
            self.table
        );
        let prefix = request.range_prefix.clone().unwrap_or_default();
        let mut query = sqlx::query(&sql)
            .bind(&request.hash)
            .bind(prefix.clone())
            .bind(prefix);
        if let Some((range, pk, sk)) = start {
            query = query.bind(range).bind(pk).bind(sk);
        }
        let rows = query
            .bind(fetch_limit(request.limit))
            .fetch_all(&self.pool)
            .await?;

        debug!(
            index = %request.index,
            hash = %request.hash,
            rows = rows.len(),
            "sqlite index query"
        );
        into_page(rows, request.limit, |row| {
            Ok(StartKey::indexed(
                row.try_get::<String, _>("pk")?,
                row.try_get::<String, _>("sk")?,
                request.hash.clone(),
                row.try_get::<String, _>("range_value")?,
            ))
        })
    }

    async fn batch_select(&self, request: &BatchSelect) -> Result<Page> {
        validate_limit(request.limit)?;
        if request.partitions.is_empty() {
            return Ok(Page::default());
        }
        let placeholders = vec!["?"; request.partitions.len()].join(", ");
        let start_clause = if request.exclusive_start.is_some() {
            "AND (pk, sk) > (?, ?)"
        } else {
            ""
        };
        let sql = format!(
            r#"SELECT pk, sk, body FROM "{}"
               WHERE pk IN ({placeholders}) {start_clause}
               ORDER BY pk ASC, sk ASC
               LIMIT ?"#,
            self.table
        );
        let mut query = sqlx::query(&sql);
        for pk in &request.partitions {
            query = query.bind(pk);
        }
        if let Some(start) = &request.exclusive_start {
            query = query.bind(&start.pk).bind(&start.sk);
        }
        let rows = query
            .bind(fetch_limit(request.limit))
            .fetch_all(&self.pool)
            .await?;

        into_page(rows, request.limit, |row| {
            Ok(StartKey::table(
                row.try_get::<String, _>("pk")?,
                row.try_get::<String, _>("sk")?,
            ))
        })
    }

    async fn transact_write(&self, ops: &[WriteOp]) -> Result<()> {
        let keys = validate_transaction(ops)?;

        let mut tx = self.pool.begin().await.map_err(|e| conflict_or(e, &keys))?;

        let mut reasons = Vec::with_capacity(ops.len());
        for (op, key) in ops.iter().zip(&keys) {
            let failed = match op.condition() {
                Some(condition) => {
                    let existing = self
                        .fetch_existing(&mut tx, key)
                        .await
                        .map_err(|e| conflict_or(e, &keys))?;
                    !condition.evaluate(existing.as_ref())
                }
                None => false,
            };
            reasons.push(if failed {
                CancellationReason::condition_failed(key.clone())
            } else {
                CancellationReason::none(key.clone())
            });
        }

        if reasons.iter().any(CancellationReason::is_failure) {
            tx.rollback().await?;
            return Err(StoreError::TransactionCanceled { reasons });
        }

        for (op, key) in ops.iter().zip(&keys) {
            match self.apply(&mut tx, op, key).await {
                Ok(()) => {}
                Err(StoreError::Sqlx(e)) => return Err(conflict_or(e, &keys)),
                Err(other) => return Err(other),
            }
        }
        tx.commit().await.map_err(|e| conflict_or(e, &keys))?;

        debug!(table = %self.table, operations = ops.len(), "sqlite transaction committed");
        Ok(())
    }
}
