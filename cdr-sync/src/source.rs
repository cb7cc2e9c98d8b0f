use async_trait::async_trait;
use chrono::{DateTime, Utc};

use cdr_common::call::CallRecord;
use cdr_common::cel::CelService;

use crate::error::SyncError;

/// One page of calls from a source.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallPage {
    pub calls: Vec<CallRecord>,
    /// The source had nothing left to read. A page can be empty without being exhausted when
    /// none of the closing events it read could be turned into a call.
    pub exhausted: bool,
}

impl CallPage {
    pub fn new(calls: Vec<CallRecord>, exhausted: bool) -> Self {
        Self { calls, exhausted }
    }

    pub fn exhausted() -> Self {
        Self::new(Vec::new(), true)
    }
}

#[async_trait]
pub trait CallSource: Send + Sync {
    /// Page `page` (1-based) of the calls that ended at or after `since`, windowed over at most
    /// `limit` closing events.
    async fn fetch_page(
        &self,
        since: DateTime<Utc>,
        page: i64,
        limit: i64,
    ) -> Result<CallPage, SyncError>;
}

/// Reads straight from the CEL database and reconciles calls in-process, for deployments where
/// the sync worker can reach the PBX database directly.
pub struct LocalCelSource {
    service: CelService,
}

impl LocalCelSource {
    pub fn new(service: CelService) -> Self {
        Self { service }
    }
}

#[async_trait]
impl CallSource for LocalCelSource {
    async fn fetch_page(
        &self,
        since: DateTime<Utc>,
        page: i64,
        limit: i64,
    ) -> Result<CallPage, SyncError> {
        let reconciliation = self
            .service
            .get_cel_data(since, page, limit)
            .await
            .map_err(|e| SyncError::TransportFailure(format!("failed to read CEL data: {}", e)))?;

        let exhausted = reconciliation.is_exhausted();
        Ok(CallPage::new(reconciliation.records, exhausted))
    }
}
