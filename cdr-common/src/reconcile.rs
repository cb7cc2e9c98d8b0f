//! # Reconcile
//!
//! Rebuilds completed calls out of CEL rows. Asterisk does not log a "call" anywhere: a call is
//! a bridge that was opened (BRIDGE_START/BRIDGE_ENTER) and later closed (BRIDGE_END/BRIDGE_EXIT)
//! on the same `uniqueid`, and the two parties are found by looking up the first CEL row carrying
//! a caller id on each bridged channel.
//!
//! All lookups go through an `EventIndex` built once per page, so a page of N closing events
//! costs O(N log M) against M history rows instead of a scan per event.
use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::call::{CallRecord, PeerInfo};
use crate::direction::DirectionClassifier;
use crate::event::{ChannelExclusions, RawEvent};

/// How far back from the end of a bridge we look for the rows describing its peers.
pub const PEER_LOOKBACK_HOURS: i64 = 8;

/// Why a closing event did not produce a call. Gaps are counted, never raised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GapReason {
    MissingStart,
    MissingPeer { channel: String },
}

impl GapReason {
    pub fn label(&self) -> &'static str {
        match self {
            GapReason::MissingStart => "missing_start",
            GapReason::MissingPeer { .. } => "missing_peer",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationGap {
    pub record_key: String,
    pub reason: GapReason,
}

#[derive(Debug, Default)]
pub struct Reconciliation {
    pub records: Vec<CallRecord>,
    pub gaps: Vec<ReconciliationGap>,
    /// Closing events read for this page, including the ones that became gaps or were skipped.
    pub closing_events: usize,
}

impl Reconciliation {
    /// No closing events were left to read. A page with no records but some closing events
    /// is not the end: every one of its events was a gap.
    pub fn is_exhausted(&self) -> bool {
        self.closing_events == 0
    }
}

/// History rows for one page, indexed for the two lookups the reconciler performs.
#[derive(Debug, Default)]
pub struct EventIndex {
    // Sorted by id.
    starts_by_unique_id: HashMap<String, Vec<RawEvent>>,
    // Sorted by (event_time, id), only rows with a caller id number.
    peers_by_channel: HashMap<String, Vec<RawEvent>>,
}

impl EventIndex {
    pub fn new<I>(events: I) -> Self
    where
        I: IntoIterator<Item = RawEvent>,
    {
        let mut index = EventIndex::default();

        for event in events {
            if event.event_type.is_starting() {
                index
                    .starts_by_unique_id
                    .entry(event.unique_id.clone())
                    .or_default()
                    .push(event.clone());
            }
            if !event.caller_id_number.is_empty() {
                index
                    .peers_by_channel
                    .entry(event.channel_name.clone())
                    .or_default()
                    .push(event);
            }
        }

        // The same row can reach us through more than one history query.
        for starts in index.starts_by_unique_id.values_mut() {
            starts.sort_by_key(|e| e.id);
            starts.dedup_by_key(|e| e.id);
        }
        for peers in index.peers_by_channel.values_mut() {
            peers.sort_by(|a, b| (a.event_time, a.id).cmp(&(b.event_time, b.id)));
            peers.dedup_by_key(|e| e.id);
        }

        index
    }

    /// The latest bridge opening event on `end`'s uniqueid that precedes it.
    pub fn starting_event(&self, end: &RawEvent) -> Option<&RawEvent> {
        let starts = self.starts_by_unique_id.get(&end.unique_id)?;
        let before = starts.partition_point(|e| e.id < end.id);
        before.checked_sub(1).map(|i| &starts[i])
    }

    /// The earliest row on `channel` with a caller id, within `[from, to]`.
    pub fn earliest_peer(
        &self,
        channel: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Option<PeerInfo> {
        let rows = self.peers_by_channel.get(channel)?;
        let first = rows.partition_point(|e| e.event_time < from);
        rows.get(first)
            .filter(|e| e.event_time <= to)
            .map(|e| PeerInfo {
                id: e.id,
                caller_id_number: e.caller_id_number.clone(),
                caller_id_name: e.caller_id_name.clone(),
                context: e.context.clone(),
            })
    }
}

pub struct CallReconciler {
    classifier: DirectionClassifier,
    exclusions: ChannelExclusions,
    lookback: Duration,
}

impl CallReconciler {
    pub fn new(classifier: DirectionClassifier, exclusions: ChannelExclusions) -> Self {
        Self {
            classifier,
            exclusions,
            lookback: Duration::hours(PEER_LOOKBACK_HOURS),
        }
    }

    pub fn exclusions(&self) -> &ChannelExclusions {
        &self.exclusions
    }

    pub fn lookback(&self) -> Duration {
        self.lookback
    }

    /// Pair every admissible closing event in `terminating` with its opening event and peers.
    /// Events that can't close a call (wrong type, no peer, excluded channel) are skipped
    /// without being reported as gaps.
    pub fn reconcile(&self, terminating: &[RawEvent], index: &EventIndex) -> Reconciliation {
        let mut result = Reconciliation {
            closing_events: terminating.len(),
            ..Reconciliation::default()
        };

        for end in terminating {
            if !self.exclusions.admits_boundary(end) {
                debug!(id = end.id, channel = %end.channel_name, "not a call boundary, skipping");
                continue;
            }

            match self.reconcile_one(end, index) {
                Ok(record) => result.records.push(record),
                Err(reason) => {
                    debug!(id = end.id, reason = reason.label(), "incomplete call, skipping");
                    metrics::counter!("cel_reconciliation_gaps_total", "reason" => reason.label())
                        .increment(1);
                    result.gaps.push(ReconciliationGap {
                        record_key: end.id.to_string(),
                        reason,
                    });
                }
            }
        }

        result
    }

    fn reconcile_one(&self, end: &RawEvent, index: &EventIndex) -> Result<CallRecord, GapReason> {
        let start = index.starting_event(end).ok_or(GapReason::MissingStart)?;

        // Parking and transfers rewrite the peer on the closing row, the opening row still
        // names the channel that was actually bridged.
        let peer_channel = if start.peer_channel_name.is_empty() {
            &end.peer_channel_name
        } else {
            &start.peer_channel_name
        };

        let window_start = end.event_time - self.lookback;
        let lookup = |channel: &str| {
            index
                .earliest_peer(channel, window_start, end.event_time)
                .ok_or_else(|| GapReason::MissingPeer {
                    channel: channel.to_owned(),
                })
        };
        let peer = lookup(peer_channel.as_str())?;
        let own = lookup(start.channel_name.as_str())?;

        // The peer seen first is taken to be the one that placed the call.
        let (source, destination) = if peer.id < own.id {
            (peer, own)
        } else {
            (own, peer)
        };

        Ok(CallRecord {
            record_key: end.id.to_string(),
            start_time: start.event_time,
            end_time: end.event_time,
            duration_seconds: (end.event_time - start.event_time).num_seconds(),
            direction: self.classifier.classify(&source.context),
            source_number: source.caller_id_number,
            source_name: source.caller_id_name,
            destination_number: destination.caller_id_number,
            destination_name: destination.caller_id_name,
        })
    }
}
