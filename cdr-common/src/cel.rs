use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::reconcile::{CallReconciler, EventIndex, Reconciliation};
use crate::store::{EventStore, StoreResult};

pub const DEFAULT_PAGE_LIMIT: i64 = 100;
pub const MAX_PAGE_LIMIT: i64 = 1000;

/// Response header carrying `Reconciliation::closing_events` alongside a `getCelData` page.
pub const CLOSING_EVENTS_HEADER: &str = "x-cel-closing-events";

/// Serves pages of reconstructed calls out of an `EventStore`.
/// This is what sits behind `getCelData`, and what the sync worker runs in-process when it
/// reads the CEL database directly.
pub struct CelService {
    store: Arc<dyn EventStore>,
    reconciler: CallReconciler,
}

impl CelService {
    pub fn new(store: Arc<dyn EventStore>, reconciler: CallReconciler) -> Self {
        Self { store, reconciler }
    }

    /// Reconstruct the calls closed by the `page`th (1-based) window of `limit` closing events
    /// at or after `since`. `limit` is clamped to `1..=MAX_PAGE_LIMIT`.
    pub async fn get_cel_data(
        &self,
        since: DateTime<Utc>,
        page: i64,
        limit: i64,
    ) -> StoreResult<Reconciliation> {
        let limit = limit.clamp(1, MAX_PAGE_LIMIT);
        let offset = (page.max(1) - 1).saturating_mul(limit);

        let terminating = self
            .store
            .terminating_events(since, self.reconciler.exclusions(), limit, offset)
            .await?;

        let (Some(max_id), Some(earliest_end), Some(latest_end)) = (
            terminating.iter().map(|e| e.id).max(),
            terminating.iter().map(|e| e.event_time).min(),
            terminating.iter().map(|e| e.event_time).max(),
        ) else {
            return Ok(Reconciliation::default());
        };

        let unique_ids: Vec<String> = terminating
            .iter()
            .map(|e| e.unique_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let starts = self.store.starting_events(&unique_ids, max_id).await?;

        // Every channel a peer lookup could ask for: both sides of each opening row, plus the
        // closing rows' peers for bridges whose opening row carries none.
        let channels: Vec<String> = starts
            .iter()
            .flat_map(|e| [&e.channel_name, &e.peer_channel_name])
            .chain(terminating.iter().map(|e| &e.peer_channel_name))
            .filter(|c| !c.is_empty())
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let peers = self
            .store
            .peer_events(&channels, earliest_end - self.reconciler.lookback(), latest_end)
            .await?;

        debug!(
            terminating = terminating.len(),
            starts = starts.len(),
            peers = peers.len(),
            page,
            "loaded CEL page"
        );

        let index = EventIndex::new(starts.into_iter().chain(peers));
        Ok(self.reconciler.reconcile(&terminating, &index))
    }
}
