//! # Driver
//!
//! One sync run: page through the call source from the stored cursor, drop what was already
//! imported or is too short, resolve both ends of each call to people, and store an interaction
//! per surviving call. A run only moves the cursor once the source reports it is exhausted; an
//! empty page that is not exhausted (every closing event in it was a gap) is stepped over.
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use cdr_common::call::{CallRecord, Direction};

use crate::directory::PersonDirectory;
use crate::error::{SyncError, SyncFailure};
use crate::interactions::{InteractionStore, NewInteraction};
use crate::numbers::NumberRule;
use crate::resolver::{EndpointResolver, ExtensionMapEntry};
use crate::source::CallSource;

/// A call as stored alongside its interaction, numbers already normalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CdrRecord {
    pub record_key: String,
    pub source: String,
    pub destination: String,
    pub caller_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_seconds: i64,
    pub direction: Direction,
}

impl CdrRecord {
    pub fn from_call(call: CallRecord, phone_number_rule: &NumberRule) -> Self {
        Self {
            source: phone_number_rule.apply(&call.source_number),
            destination: phone_number_rule.apply(&call.destination_number),
            caller_id: call.source_name,
            record_key: call.record_key,
            start_time: call.start_time,
            end_time: call.end_time,
            duration_seconds: call.duration_seconds,
            direction: call.direction,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub page_size: i64,
    pub minimum_duration_secs: i64,
    pub skip_internal_calls: bool,
    pub internal_phone_type: Option<String>,
    pub phone_number_rule: NumberRule,
    pub extension_rule: NumberRule,
    pub interaction_component: String,
    pub cursor_name: String,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            page_size: 1000,
            minimum_duration_secs: 10,
            skip_internal_calls: false,
            internal_phone_type: None,
            phone_number_rule: NumberRule::Right(10),
            extension_rule: NumberRule::Right(4),
            interaction_component: "pbx".to_owned(),
            cursor_name: "default".to_owned(),
        }
    }
}

/// What happened to a single call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Imported,
    Duplicate,
    TooShort,
    SkippedInternal,
    Unresolved,
    PersistFailed,
}

impl CallOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            CallOutcome::Imported => "imported",
            CallOutcome::Duplicate => "duplicate",
            CallOutcome::TooShort => "too_short",
            CallOutcome::SkippedInternal => "skipped_internal",
            CallOutcome::Unresolved => "unresolved",
            CallOutcome::PersistFailed => "persist_failed",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub pages: u64,
    pub imported: u64,
    pub duplicates: u64,
    pub too_short: u64,
    pub skipped_internal: u64,
    pub unresolved: u64,
    pub persist_failures: u64,
}

impl SyncSummary {
    fn record(&mut self, outcome: CallOutcome) {
        let counter = match outcome {
            CallOutcome::Imported => &mut self.imported,
            CallOutcome::Duplicate => &mut self.duplicates,
            CallOutcome::TooShort => &mut self.too_short,
            CallOutcome::SkippedInternal => &mut self.skipped_internal,
            CallOutcome::Unresolved => &mut self.unresolved,
            CallOutcome::PersistFailed => &mut self.persist_failures,
        };
        *counter += 1;
    }
}

impl fmt::Display for SyncSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Imported {} records.", self.imported)
    }
}

/// The cursor used when a source has never been synced.
pub fn default_cursor() -> DateTime<Utc> {
    NaiveDate::from_ymd_opt(2000, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn start_of_day(time: DateTime<Utc>) -> DateTime<Utc> {
    time.date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|naive| naive.and_utc())
        .unwrap_or(time)
}

pub struct SyncDriver {
    source: Arc<dyn CallSource>,
    directory: Arc<dyn PersonDirectory>,
    interactions: Arc<dyn InteractionStore>,
    settings: SyncSettings,
}

/// State owned by a single run.
struct SyncRun {
    since: DateTime<Utc>,
    imported_keys: HashSet<String>,
    resolver: EndpointResolver,
    summary: SyncSummary,
}

impl SyncDriver {
    pub fn new(
        source: Arc<dyn CallSource>,
        directory: Arc<dyn PersonDirectory>,
        interactions: Arc<dyn InteractionStore>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            source,
            directory,
            interactions,
            settings,
        }
    }

    /// Import every call that ended since the last successful run.
    pub async fn run(&self) -> Result<SyncSummary, SyncFailure> {
        let started_at = Utc::now();
        let timer = Instant::now();

        let mut run = match self.prepare().await {
            Ok(run) => run,
            Err(error) => return Err(SyncFailure { error, imported: 0 }),
        };

        let result = self.import(&mut run, started_at).await;
        metrics::histogram!("cdr_sync_run_duration_seconds").record(timer.elapsed().as_secs_f64());

        match result {
            Ok(()) => {
                info!(
                    pages = run.summary.pages,
                    imported = run.summary.imported,
                    duplicates = run.summary.duplicates,
                    too_short = run.summary.too_short,
                    skipped_internal = run.summary.skipped_internal,
                    unresolved = run.summary.unresolved,
                    persist_failures = run.summary.persist_failures,
                    "sync run finished"
                );
                Ok(run.summary)
            }
            Err(error) => {
                error!(imported = run.summary.imported, "sync run failed: {}", error);
                metrics::counter!("cdr_sync_run_failures_total").increment(1);
                Err(SyncFailure {
                    error,
                    imported: run.summary.imported,
                })
            }
        }
    }

    async fn prepare(&self) -> Result<SyncRun, SyncError> {
        let phone_type = self
            .settings
            .internal_phone_type
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .ok_or(SyncError::ConfigurationMissing("the internal phone type"))?;

        let since = self
            .interactions
            .read_cursor(&self.settings.cursor_name)
            .await?
            .unwrap_or_else(default_cursor);
        let imported_keys = self
            .interactions
            .imported_keys(&self.settings.interaction_component, start_of_day(since))
            .await?;

        let extensions: Vec<ExtensionMapEntry> = self
            .directory
            .numbers_of_type(phone_type)
            .await?
            .into_iter()
            .map(|n| ExtensionMapEntry::from_directory(n, &self.settings.extension_rule))
            .collect();

        debug!(
            %since,
            imported_keys = imported_keys.len(),
            extensions = extensions.len(),
            "prepared sync run"
        );

        Ok(SyncRun {
            since,
            imported_keys,
            resolver: EndpointResolver::new(self.directory.clone(), extensions),
            summary: SyncSummary::default(),
        })
    }

    async fn import(&self, run: &mut SyncRun, started_at: DateTime<Utc>) -> Result<(), SyncError> {
        for page in 1.. {
            let page = self
                .source
                .fetch_page(run.since, page, self.settings.page_size)
                .await?;
            if page.exhausted {
                break;
            }
            run.summary.pages += 1;

            for call in page.calls {
                let outcome = self.process(run, call).await;
                metrics::counter!("cdr_sync_calls_total", "outcome" => outcome.label())
                    .increment(1);
                run.summary.record(outcome);
            }
        }

        self.interactions
            .write_cursor(&self.settings.cursor_name, started_at)
            .await?;

        Ok(())
    }

    async fn process(&self, run: &mut SyncRun, call: CallRecord) -> CallOutcome {
        if run.imported_keys.contains(&call.record_key) {
            return CallOutcome::Duplicate;
        }
        if call.duration_seconds < self.settings.minimum_duration_secs {
            return CallOutcome::TooShort;
        }

        let record = CdrRecord::from_call(call, &self.settings.phone_number_rule);

        let (source, destination) = match (
            run.resolver.resolve(&record.source).await,
            run.resolver.resolve(&record.destination).await,
        ) {
            (Ok(source), Ok(destination)) => (source, destination),
            (Err(e), _) | (_, Err(e)) => {
                warn!(record_key = %record.record_key, "failed to resolve call parties: {}", e);
                return CallOutcome::PersistFailed;
            }
        };

        if self.settings.skip_internal_calls
            && source.is_internal_or_unknown()
            && destination.is_internal_or_unknown()
        {
            return CallOutcome::SkippedInternal;
        }

        // The subject is the outside party whenever we can tell which one that is.
        let (subject, related) = if record.direction == Direction::Incoming {
            (source.person, destination.person)
        } else {
            (destination.person, source.person)
        };
        let Some(subject) = subject else {
            return CallOutcome::Unresolved;
        };

        let data = match serde_json::to_value(&record) {
            Ok(data) => data,
            Err(e) => {
                warn!(record_key = %record.record_key, "failed to serialize call: {}", e);
                return CallOutcome::PersistFailed;
            }
        };

        let interaction = NewInteraction {
            component: self.settings.interaction_component.clone(),
            person: subject,
            related_person: related,
            operation: record.direction.to_string(),
            data,
            foreign_key: record.record_key.clone(),
            interaction_time: record.start_time,
        };

        match self.interactions.create_interaction(&interaction).await {
            Ok(()) => {
                run.imported_keys.insert(record.record_key);
                CallOutcome::Imported
            }
            Err(e) => {
                warn!(
                    record_key = %record.record_key,
                    "{}",
                    SyncError::PersistenceFailure(e)
                );
                CallOutcome::PersistFailed
            }
        }
    }
}
