//! Postgres-backed document store.
//!
//! One table per collection. Live queries use `LISTEN/NOTIFY`: a statement
//! trigger (see `migrations/`) publishes the table name on
//! [`CHANGE_CHANNEL`] and every open query re-runs itself when its table is
//! named. Row-level security or missing grants surface as SQLSTATE `42501`,
//! which is classified as [`StoreError::PermissionDenied`].

use async_trait::async_trait;
use futures::StreamExt;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use sqlx::postgres::PgListener;
use sqlx::types::Json;
use sqlx::PgPool;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::{
    check_writable, document_path, Document, DocumentStore, LiveQuery, Operation, SnapshotStream,
    StoreError,
};

/// Notification channel the change trigger publishes on.
pub const CHANGE_CHANNEL: &str = "classhub_documents";

/// SQLSTATE for `insufficient_privilege`.
const INSUFFICIENT_PRIVILEGE: &str = "42501";

static IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z_][a-z0-9_]{0,62}$").expect("identifier regex is valid"));

/// Collection and field names are interpolated into SQL, so they must be
/// plain lowercase identifiers.
fn identifier(name: &str) -> Result<&str, StoreError> {
    if IDENTIFIER.is_match(name) {
        Ok(name)
    } else {
        Err(StoreError::Invalid(format!("'{}' is not a valid identifier", name)))
    }
}

/// Map a driver error onto the store taxonomy.
fn classify(err: sqlx::Error, path: &str, operation: Operation) -> StoreError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.code().as_deref() == Some(INSUFFICIENT_PRIVILEGE) {
            return StoreError::PermissionDenied {
                path: path.to_string(),
                operation,
            };
        }
    }
    StoreError::Database(err)
}

fn select_sql(query: &LiveQuery) -> Result<String, StoreError> {
    let table = identifier(&query.collection)?;
    let order = identifier(&query.order_by)?;
    let direction = if query.descending { "DESC" } else { "ASC" };
    Ok(format!(
        "SELECT d.id::text AS id, to_jsonb(d) - 'id' AS data FROM {table} d \
         ORDER BY d.{order} {direction}, d.id ASC LIMIT $1"
    ))
}

fn update_sql(collection: &str, patch: &Map<String, Value>) -> Result<String, StoreError> {
    let table = identifier(collection)?;
    if patch.is_empty() {
        return Err(StoreError::Invalid("empty update".into()));
    }
    let columns = patch
        .keys()
        .map(|k| identifier(k))
        .collect::<Result<Vec<_>, _>>()?
        .join(", ");
    Ok(format!(
        "UPDATE {table} AS d SET ({columns}) = \
         (SELECT {columns} FROM jsonb_populate_record(NULL::{table}, $2)) \
         WHERE d.id::text = $1"
    ))
}

fn insert_sql(collection: &str, data: &Map<String, Value>) -> Result<String, StoreError> {
    let table = identifier(collection)?;
    if data.is_empty() {
        return Err(StoreError::Invalid("empty document".into()));
    }
    let columns = data
        .keys()
        .map(|k| identifier(k))
        .collect::<Result<Vec<_>, _>>()?
        .join(", ");
    Ok(format!(
        "INSERT INTO {table} AS d ({columns}) \
         SELECT {columns} FROM jsonb_populate_record(NULL::{table}, $1) \
         RETURNING d.id::text AS id, to_jsonb(d) - 'id' AS data"
    ))
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run pending migrations from the migrations/ directory.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn fetch(pool: &PgPool, sql: &str, query: &LiveQuery) -> Result<Vec<Document>, StoreError> {
        let rows = sqlx::query_as::<_, (String, Json<Map<String, Value>>)>(sql)
            .bind(query.limit as i64)
            .fetch_all(pool)
            .await
            .map_err(|e| classify(e, &query.collection, Operation::List))?;

        Ok(rows
            .into_iter()
            .map(|(id, Json(data))| Document { id, data })
            .collect())
    }
}

#[async_trait]
impl DocumentStore for PgStore {
    async fn watch(&self, query: LiveQuery) -> Result<SnapshotStream, StoreError> {
        let sql = select_sql(&query)?;

        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|e| classify(e, &query.collection, Operation::List))?;
        listener
            .listen(CHANGE_CHANNEL)
            .await
            .map_err(|e| classify(e, &query.collection, Operation::List))?;

        let (tx, rx) = mpsc::channel(16);
        let pool = self.pool.clone();

        tokio::spawn(async move {
            loop {
                let snapshot = Self::fetch(&pool, &sql, &query).await;
                let failed = snapshot.is_err();
                if tx.send(snapshot).await.is_err() || failed {
                    break;
                }

                // Wait until this collection changes or the consumer goes away.
                loop {
                    tokio::select! {
                        _ = tx.closed() => {
                            tracing::debug!(collection = %query.collection, "pg live query dropped by consumer");
                            return;
                        }
                        notification = listener.recv() => match notification {
                            Ok(n) if n.payload() == query.collection => break,
                            Ok(_) => continue,
                            Err(e) => {
                                tracing::warn!(collection = %query.collection, error = %e, "pg listener failed");
                                let _ = tx.send(Err(StoreError::Closed(e.to_string()))).await;
                                return;
                            }
                        }
                    }
                }
            }
        });

        Ok(ReceiverStream::new(rx).boxed())
    }

    async fn update(&self, collection: &str, id: &str, patch: Map<String, Value>) -> Result<(), StoreError> {
        let path = document_path(collection, id);
        check_writable(&patch)?;
        let sql = update_sql(collection, &patch)?;

        let result = sqlx::query(&sql)
            .bind(id)
            .bind(Json(Value::Object(patch)))
            .execute(&self.pool)
            .await
            .map_err(|e| classify(e, &path, Operation::Update))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(path));
        }
        Ok(())
    }

    async fn insert(&self, collection: &str, data: Map<String, Value>) -> Result<Document, StoreError> {
        check_writable(&data)?;
        let sql = insert_sql(collection, &data)?;

        let (id, Json(data)) = sqlx::query_as::<_, (String, Json<Map<String, Value>>)>(&sql)
            .bind(Json(Value::Object(data)))
            .fetch_one(&self.pool)
            .await
            .map_err(|e| classify(e, collection, Operation::Create))?;

        Ok(Document { id, data })
    }
}
