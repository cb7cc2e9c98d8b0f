//! # Store
//!
//! Read access to the Asterisk `cel` table. The reconciler never queries the log itself: it is
//! handed one page of closing events plus the history rows that page needs, fetched here.
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use thiserror::Error;

use crate::event::{ChannelExclusions, EventType, RawEvent};

/// Enumeration of errors for operations against a store.
/// Errors can originate from sqlx and are wrapped by us to provide additional context.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Closing events (BRIDGE_END/BRIDGE_EXIT) at or after `since`, with a non-empty peer and
    /// neither channel excluded, ordered by event time.
    async fn terminating_events(
        &self,
        since: DateTime<Utc>,
        exclusions: &ChannelExclusions,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Vec<RawEvent>>;

    /// Opening events (BRIDGE_START/BRIDGE_ENTER) on any of `unique_ids` with an id below
    /// `before_id`.
    async fn starting_events(
        &self,
        unique_ids: &[String],
        before_id: i64,
    ) -> StoreResult<Vec<RawEvent>>;

    /// Rows on any of `channels` with a caller id number, with `from <= eventtime <= to`.
    async fn peer_events(
        &self,
        channels: &[String],
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<RawEvent>>;
}

const CEL_COLUMNS: &str =
    "id, eventtype, uniqueid, eventtime, channame, peer, cid_num, cid_name, context";

/// An `EventStore` over the `cel` table of a PostgreSQL database.
#[derive(Clone)]
pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
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
}

fn event_from_row(row: &PgRow) -> Result<RawEvent, sqlx::Error> {
    let event_type: String = row.try_get("eventtype")?;
    Ok(RawEvent {
        id: row.try_get("id")?,
        event_type: EventType::from(event_type.as_str()),
        unique_id: row.try_get("uniqueid")?,
        event_time: row.try_get("eventtime")?,
        channel_name: row.try_get("channame")?,
        peer_channel_name: row.try_get("peer")?,
        caller_id_number: row.try_get("cid_num")?,
        caller_id_name: row.try_get("cid_name")?,
        context: row.try_get("context")?,
    })
}

fn collect_events(command: &str, rows: Vec<PgRow>) -> StoreResult<Vec<RawEvent>> {
    rows.iter()
        .map(event_from_row)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|error| StoreError::QueryError {
            command: command.to_owned(),
            error,
        })
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn terminating_events(
        &self,
        since: DateTime<Utc>,
        exclusions: &ChannelExclusions,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Vec<RawEvent>> {
        let query = format!(
            r#"
SELECT {CEL_COLUMNS}
FROM cel
WHERE eventtype IN ('BRIDGE_END', 'BRIDGE_EXIT')
  AND eventtime >= $1
  AND peer <> ''
  AND NOT (channame LIKE ANY($2))
  AND NOT (peer LIKE ANY($2))
ORDER BY eventtime, id
LIMIT $3 OFFSET $4
            "#
        );

        let rows = sqlx::query(&query)
            .bind(since)
            .bind(exclusions.like_patterns())
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "SELECT terminating".to_owned(),
                error,
            })?;

        collect_events("SELECT terminating", rows)
    }

    async fn starting_events(
        &self,
        unique_ids: &[String],
        before_id: i64,
    ) -> StoreResult<Vec<RawEvent>> {
        if unique_ids.is_empty() {
            return Ok(Vec::new());
        }

        let query = format!(
            r#"
SELECT {CEL_COLUMNS}
FROM cel
WHERE uniqueid = ANY($1)
  AND id < $2
  AND eventtype IN ('BRIDGE_START', 'BRIDGE_ENTER')
ORDER BY id
            "#
        );

        let rows = sqlx::query(&query)
            .bind(unique_ids)
            .bind(before_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "SELECT starting".to_owned(),
                error,
            })?;

        collect_events("SELECT starting", rows)
    }

    async fn peer_events(
        &self,
        channels: &[String],
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<RawEvent>> {
        if channels.is_empty() {
            return Ok(Vec::new());
        }

        let query = format!(
            r#"
SELECT {CEL_COLUMNS}
FROM cel
WHERE channame = ANY($1)
  AND eventtime BETWEEN $2 AND $3
  AND cid_num <> ''
ORDER BY eventtime, id
            "#
        );

        let rows = sqlx::query(&query)
            .bind(channels)
            .bind(from)
            .bind(to)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "SELECT peers".to_owned(),
                error,
            })?;

        collect_events("SELECT peers", rows)
    }
}

/// An `EventStore` over rows held in memory. Used for tests and for replaying exported logs.
#[derive(Default)]
pub struct MemoryEventStore {
    events: RwLock<Vec<RawEvent>>,
}

impl MemoryEventStore {
    pub fn new(events: Vec<RawEvent>) -> Self {
        Self {
            events: RwLock::new(events),
        }
    }

    pub fn push(&self, event: RawEvent) {
        self.events
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event);
    }

    fn select<F>(&self, predicate: F) -> Vec<RawEvent>
    where
        F: Fn(&RawEvent) -> bool,
    {
        let events = self
            .events
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut selected: Vec<RawEvent> = events.iter().filter(|e| predicate(e)).cloned().collect();
        selected.sort_by(|a, b| (a.event_time, a.id).cmp(&(b.event_time, b.id)));
        selected
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn terminating_events(
        &self,
        since: DateTime<Utc>,
        exclusions: &ChannelExclusions,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Vec<RawEvent>> {
        let limit = usize::try_from(limit)
            .map_err(|_| StoreError::InvalidArgument("negative limit".to_owned()))?;
        let offset = usize::try_from(offset)
            .map_err(|_| StoreError::InvalidArgument("negative offset".to_owned()))?;

        Ok(self
            .select(|e| e.event_time >= since && exclusions.admits_boundary(e))
            .into_iter()
            .skip(offset)
            .take(limit)
            .collect())
    }

    async fn starting_events(
        &self,
        unique_ids: &[String],
        before_id: i64,
    ) -> StoreResult<Vec<RawEvent>> {
        Ok(self.select(|e| {
            e.event_type.is_starting() && e.id < before_id && unique_ids.contains(&e.unique_id)
        }))
    }

    async fn peer_events(
        &self,
        channels: &[String],
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<RawEvent>> {
        Ok(self.select(|e| {
            !e.caller_id_number.is_empty()
                && e.event_time >= from
                && e.event_time <= to
                && channels.contains(&e.channel_name)
        }))
    }
}
