//! PostgreSQL document store
//!
//! Documents live in a single table of JSONB bodies keyed by a `BIGSERIAL` id.
//! Diesel is synchronous, so every statement runs on the blocking pool with a
//! connection checked out of r2d2.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::r2d2::ConnectionManager;
use r2d2::Pool as R2d2Pool;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::sql_types::{BigInt, Text, Timestamptz};
use serde_json::{Map, Value};
use std::time::Duration;

use super::{validate_collection, DocumentStore, Result, StoreError};
use crate::config::StoreConfig;
use crate::message::{Document, DocumentId, StoredDocument};

pub type Pool = R2d2Pool<ConnectionManager<PgConnection>>;

#[derive(QueryableByName)]
struct IdRow {
    #[diesel(sql_type = BigInt)]
    id: i64,
}

#[derive(QueryableByName)]
struct DocumentRow {
    #[diesel(sql_type = BigInt)]
    id: i64,
    #[diesel(sql_type = Text)]
    body: String,
    #[diesel(sql_type = Timestamptz)]
    stored_at: DateTime<Utc>,
}

fn classify(e: DieselError) -> StoreError {
    match e {
        DieselError::DatabaseError(DatabaseErrorKind::ClosedConnection, _) => {
            StoreError::Unavailable(e.to_string())
        }
        _ => StoreError::Query(e.to_string()),
    }
}

#[derive(Clone)]
pub struct PostgresStore {
    pool: Pool,
    collection: String,
}

impl PostgresStore {
    /// Build the connection pool and make sure the collection table exists.
    ///
    /// # Example
    /// ```ignore
    /// let config = RelayConfig::from_env()?;
    /// let store = PostgresStore::connect(&config.store).await?;
    /// ```
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        validate_collection(&config.collection)?;

        let url = config.connection_url();
        let collection = config.collection.clone();
        let config = config.clone();

        // Building the pool opens `min_idle` connections
        let pool = tokio::task::spawn_blocking(move || {
            let manager = ConnectionManager::<PgConnection>::new(url);
            R2d2Pool::builder()
                .max_size(config.max_connections)
                .min_idle(Some(config.min_idle))
                .connection_timeout(Duration::from_secs(config.connection_timeout_secs))
                .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
                .max_lifetime(Some(Duration::from_secs(config.max_lifetime_secs)))
                .build(manager)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("pool setup task failed: {}", e)))?
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let store = Self { pool, collection };
        store.ensure_collection().await?;

        tracing::info!(collection = %store.collection, "Connected to PostgreSQL document store");
        Ok(store)
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    async fn ensure_collection(&self) -> Result<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id BIGSERIAL PRIMARY KEY,
                body JSONB NOT NULL,
                stored_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )",
            self.collection
        );

        self.run(move |conn| {
            diesel::sql_query(sql).execute(conn).map_err(classify)?;
            Ok(())
        })
        .await
    }

    /// Run a Diesel closure on the blocking pool with a pooled connection.
    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut PgConnection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("store task failed: {}", e)))?
    }
}

#[async_trait]
impl DocumentStore for PostgresStore {
    async fn insert_one(&self, document: Document) -> Result<DocumentId> {
        let body = serde_json::to_string(&Value::Object(document.into_body()))
            .map_err(|e| StoreError::Query(format!("serialize document: {}", e)))?;
        let sql = format!(
            "INSERT INTO {} (body) VALUES ($1::jsonb) RETURNING id",
            self.collection
        );

        self.run(move |conn| {
            let row: IdRow = diesel::sql_query(sql)
                .bind::<Text, _>(body)
                .get_result(conn)
                .map_err(classify)?;
            Ok(row.id)
        })
        .await
    }

    async fn find_latest(&self) -> Result<Option<StoredDocument>> {
        let sql = format!(
            "SELECT id, body::text AS body, stored_at FROM {} ORDER BY id DESC LIMIT 1",
            self.collection
        );

        let row: Option<DocumentRow> = self
            .run(move |conn| {
                diesel::sql_query(sql)
                    .get_result(conn)
                    .optional()
                    .map_err(classify)
            })
            .await?;

        row.map(|row| {
            let body: Map<String, Value> = serde_json::from_str(&row.body)
                .map_err(|e| StoreError::Query(format!("document {} is not an object: {}", row.id, e)))?;
            Ok(StoredDocument {
                id: row.id,
                body,
                stored_at: row.stored_at,
            })
        })
        .transpose()
    }

    async fn ping(&self) -> Result<()> {
        self.run(|conn| {
            diesel::sql_query("SELECT 1").execute(conn).map_err(classify)?;
            Ok(())
        })
        .await
    }
}
