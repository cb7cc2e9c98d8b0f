//! # Interactions
//!
//! The destination side of a sync: one `interactions` row per imported call, keyed by the call's
//! record key, and a `sync_cursors` row per source remembering where the last run started.
use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};

use cdr_common::store::{StoreError, StoreResult};

use crate::directory::PersonRef;

#[derive(Debug, Clone, PartialEq)]
pub struct NewInteraction {
    pub component: String,
    pub person: PersonRef,
    pub related_person: Option<PersonRef>,
    pub operation: String,
    pub data: Value,
    pub foreign_key: String,
    pub interaction_time: DateTime<Utc>,
}

#[async_trait]
pub trait InteractionStore: Send + Sync {
    /// Foreign keys of the interactions of `component` that happened at or after `since`.
    async fn imported_keys(
        &self,
        component: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<HashSet<String>>;

    async fn create_interaction(&self, interaction: &NewInteraction) -> StoreResult<()>;

    async fn read_cursor(&self, name: &str) -> StoreResult<Option<DateTime<Utc>>>;

    async fn write_cursor(&self, name: &str, synced_at: DateTime<Utc>) -> StoreResult<()>;
}

#[derive(Clone)]
pub struct PgInteractionStore {
    pool: PgPool,
}

impl PgInteractionStore {
    pub async fn new(url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|error| StoreError::ConnectionError { error })?;

        Ok(Self { pool })
    }

    pub fn new_from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl InteractionStore for PgInteractionStore {
    async fn imported_keys(
        &self,
        component: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<HashSet<String>> {
        let base_query = r#"
SELECT foreign_key
FROM interactions
WHERE component = $1
  AND interaction_time >= $2
        "#;

        let keys: Vec<String> = sqlx::query_scalar(base_query)
            .bind(component)
            .bind(since)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "SELECT interactions".to_owned(),
                error,
            })?;

        Ok(keys.into_iter().collect())
    }

    async fn create_interaction(&self, interaction: &NewInteraction) -> StoreResult<()> {
        let base_query = r#"
INSERT INTO interactions
    (component, person_id, related_person_id, operation, data, foreign_key, interaction_time)
VALUES
    ($1, $2, $3, $4, $5, $6, $7)
        "#;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| StoreError::ConnectionError { error })?;

        sqlx::query(base_query)
            .bind(&interaction.component)
            .bind(interaction.person)
            .bind(interaction.related_person)
            .bind(&interaction.operation)
            .bind(&interaction.data)
            .bind(&interaction.foreign_key)
            .bind(interaction.interaction_time)
            .execute(&mut *tx)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "INSERT".to_owned(),
                error,
            })?;

        tx.commit().await.map_err(|error| StoreError::QueryError {
            command: "COMMIT".to_owned(),
            error,
        })
    }

    async fn read_cursor(&self, name: &str) -> StoreResult<Option<DateTime<Utc>>> {
        sqlx::query_scalar("SELECT synced_at FROM sync_cursors WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "SELECT sync_cursors".to_owned(),
                error,
            })
    }

    async fn write_cursor(&self, name: &str, synced_at: DateTime<Utc>) -> StoreResult<()> {
        let base_query = r#"
INSERT INTO sync_cursors (name, synced_at)
VALUES ($1, $2)
ON CONFLICT (name) DO UPDATE SET synced_at = EXCLUDED.synced_at
        "#;

        sqlx::query(base_query)
            .bind(name)
            .bind(synced_at)
            .execute(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "UPSERT sync_cursors".to_owned(),
                error,
            })?;

        Ok(())
    }
}
