use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};

use cdr_common::call::{CallRecord, Direction};
use cdr_common::cel::CelService;
use cdr_common::direction::DirectionClassifier;
use cdr_common::event::{ChannelExclusions, EventType, RawEvent};
use cdr_common::reconcile::CallReconciler;
use cdr_common::store::{MemoryEventStore, StoreError, StoreResult};
use cdr_sync::directory::{DirectoryNumber, PersonDirectory, PersonRef};
use cdr_sync::driver::{SyncDriver, SyncSettings, SyncSummary};
use cdr_sync::error::SyncError;
use cdr_sync::interactions::{InteractionStore, NewInteraction};
use cdr_sync::source::{CallPage, CallSource, LocalCelSource};

/// Serves `pages` in order. An empty page stands for a window where every closing event was a
/// gap; a page whose calls all ended before `since` stands for the end of the log.
struct FakeSource {
    pages: Vec<Vec<CallRecord>>,
    fail_on_page: Mutex<Option<i64>>,
    requested: Mutex<Vec<i64>>,
}

impl FakeSource {
    fn new(pages: Vec<Vec<CallRecord>>) -> Self {
        Self {
            pages,
            fail_on_page: Mutex::new(None),
            requested: Mutex::new(Vec::new()),
        }
    }

    fn requested(&self) -> Vec<i64> {
        self.requested.lock().unwrap().clone()
    }
}

#[async_trait]
impl CallSource for FakeSource {
    async fn fetch_page(
        &self,
        since: DateTime<Utc>,
        page: i64,
        _limit: i64,
    ) -> Result<CallPage, SyncError> {
        self.requested.lock().unwrap().push(page);
        if *self.fail_on_page.lock().unwrap() == Some(page) {
            return Err(SyncError::AuthenticationFailure);
        }

        let index = usize::try_from(page - 1).unwrap();
        let Some(calls) = self.pages.get(index) else {
            return Ok(CallPage::exhausted());
        };

        let recent: Vec<CallRecord> = calls
            .iter()
            .filter(|c| c.end_time >= since)
            .cloned()
            .collect();
        let exhausted = recent.is_empty() && !calls.is_empty();
        Ok(CallPage::new(recent, exhausted))
    }
}

#[derive(Default)]
struct FakeDirectory {
    internal: Vec<DirectoryNumber>,
    people: HashMap<String, PersonRef>,
    partial_lookups: AtomicUsize,
}

#[async_trait]
impl PersonDirectory for FakeDirectory {
    async fn numbers_of_type(&self, phone_type: &str) -> StoreResult<Vec<DirectoryNumber>> {
        assert_eq!(phone_type, "internal");
        Ok(self.internal.clone())
    }

    async fn find_by_partial_number(&self, partial: &str) -> StoreResult<Option<PersonRef>> {
        self.partial_lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.people.get(partial).copied())
    }

    async fn number_of_person(
        &self,
        person: PersonRef,
        phone_type: &str,
    ) -> StoreResult<Option<String>> {
        assert_eq!(phone_type, "internal");
        Ok(self
            .internal
            .iter()
            .find(|n| n.person == person)
            .map(|n| n.number.clone()))
    }
}

#[derive(Default)]
struct MemoryInteractions {
    rows: Mutex<Vec<NewInteraction>>,
    cursor: Mutex<Option<DateTime<Utc>>>,
    rejected_keys: HashSet<String>,
    cursor_writes: AtomicUsize,
    unavailable: AtomicBool,
}

impl MemoryInteractions {
    fn rows(&self) -> Vec<NewInteraction> {
        self.rows.lock().unwrap().clone()
    }

    fn keys(&self) -> Vec<String> {
        self.rows().into_iter().map(|r| r.foreign_key).collect()
    }
}

#[async_trait]
impl InteractionStore for MemoryInteractions {
    async fn imported_keys(
        &self,
        component: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<HashSet<String>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.component == component && r.interaction_time >= since)
            .map(|r| r.foreign_key.clone())
            .collect())
    }

    async fn create_interaction(&self, interaction: &NewInteraction) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst)
            || self.rejected_keys.contains(&interaction.foreign_key)
        {
            return Err(StoreError::InvalidArgument(format!(
                "cannot store {}",
                interaction.foreign_key
            )));
        }
        self.rows.lock().unwrap().push(interaction.clone());
        Ok(())
    }

    async fn read_cursor(&self, _name: &str) -> StoreResult<Option<DateTime<Utc>>> {
        Ok(*self.cursor.lock().unwrap())
    }

    async fn write_cursor(&self, _name: &str, synced_at: DateTime<Utc>) -> StoreResult<()> {
        self.cursor_writes.fetch_add(1, Ordering::SeqCst);
        *self.cursor.lock().unwrap() = Some(synced_at);
        Ok(())
    }
}

const CALLER: &str = "6025550100";
const CALLER_PERSON: PersonRef = 42;
const DESK_PERSON: PersonRef = 7;
const OTHER_DESK_PERSON: PersonRef = 8;

fn at(seconds: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap() + Duration::seconds(seconds)
}

fn call(key: &str, src: &str, dst: &str, duration: i64, direction: Direction) -> CallRecord {
    CallRecord {
        record_key: key.to_owned(),
        start_time: at(0),
        end_time: at(duration),
        duration_seconds: duration,
        source_number: src.to_owned(),
        source_name: "Caller".to_owned(),
        destination_number: dst.to_owned(),
        destination_name: "Desk".to_owned(),
        direction,
    }
}

fn incoming(key: &str, duration: i64) -> CallRecord {
    call(key, "+1 (602) 555-0100", "2345", duration, Direction::Incoming)
}

fn directory() -> FakeDirectory {
    FakeDirectory {
        internal: vec![
            DirectoryNumber {
                number: "6025552345".to_owned(),
                person: DESK_PERSON,
            },
            DirectoryNumber {
                number: "6025552346".to_owned(),
                person: OTHER_DESK_PERSON,
            },
        ],
        people: HashMap::from([(CALLER.to_owned(), CALLER_PERSON)]),
        partial_lookups: AtomicUsize::new(0),
    }
}

fn settings() -> SyncSettings {
    SyncSettings {
        internal_phone_type: Some("internal".to_owned()),
        ..SyncSettings::default()
    }
}

struct Harness {
    source: Arc<FakeSource>,
    directory: Arc<FakeDirectory>,
    interactions: Arc<MemoryInteractions>,
    driver: SyncDriver,
}

fn harness(
    pages: Vec<Vec<CallRecord>>,
    interactions: MemoryInteractions,
    settings: SyncSettings,
) -> Harness {
    let source = Arc::new(FakeSource::new(pages));
    let directory = Arc::new(directory());
    let interactions = Arc::new(interactions);
    let driver = SyncDriver::new(
        source.clone(),
        directory.clone(),
        interactions.clone(),
        settings,
    );

    Harness {
        source,
        directory,
        interactions,
        driver,
    }
}

#[tokio::test]
async fn test_incoming_call_is_imported_for_the_caller() {
    let h = harness(
        vec![vec![incoming("4711", 30)]],
        MemoryInteractions::default(),
        settings(),
    );

    let summary = h.driver.run().await.unwrap();

    assert_eq!(
        summary,
        SyncSummary {
            pages: 1,
            imported: 1,
            ..SyncSummary::default()
        }
    );
    assert_eq!(summary.to_string(), "Imported 1 records.");

    let rows = h.interactions.rows();
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row.person, CALLER_PERSON);
    assert_eq!(row.related_person, Some(DESK_PERSON));
    assert_eq!(row.operation, "Incoming");
    assert_eq!(row.component, "pbx");
    assert_eq!(row.foreign_key, "4711");
    assert_eq!(row.interaction_time, at(0));
    assert_eq!(row.data["source"], CALLER);
    assert_eq!(row.data["destination"], "2345");
    assert_eq!(row.data["duration_seconds"], 30);
    assert_eq!(row.data["direction"], "incoming");

    assert!(h.interactions.cursor.lock().unwrap().is_some());
}

#[tokio::test]
async fn test_outgoing_call_is_imported_for_the_callee() {
    let h = harness(
        vec![vec![call("5", "2345", CALLER, 45, Direction::Outgoing)]],
        MemoryInteractions::default(),
        settings(),
    );

    h.driver.run().await.unwrap();

    let rows = h.interactions.rows();
    assert_eq!(rows[0].person, CALLER_PERSON);
    assert_eq!(rows[0].related_person, Some(DESK_PERSON));
    assert_eq!(rows[0].operation, "Outgoing");
}

#[tokio::test]
async fn test_calls_without_a_subject_are_not_imported() {
    let h = harness(
        vec![vec![call("6", "6025559999", "2345", 45, Direction::Incoming)]],
        MemoryInteractions::default(),
        settings(),
    );

    let summary = h.driver.run().await.unwrap();

    assert_eq!(summary.unresolved, 1);
    assert_eq!(summary.imported, 0);
    assert!(h.interactions.rows().is_empty());
}

#[tokio::test]
async fn test_minimum_duration_is_inclusive() {
    let h = harness(
        vec![vec![incoming("kept", 10), incoming("dropped", 9)]],
        MemoryInteractions::default(),
        settings(),
    );

    let summary = h.driver.run().await.unwrap();

    assert_eq!(summary.imported, 1);
    assert_eq!(summary.too_short, 1);
    assert_eq!(h.interactions.keys(), vec!["kept".to_owned()]);
}

#[tokio::test]
async fn test_paging_stops_at_first_empty_page() {
    let page = |offset: usize| -> Vec<CallRecord> {
        (0..1000)
            .map(|i| incoming(&format!("call-{}", offset + i), 60))
            .collect()
    };
    let h = harness(
        vec![page(0), page(1000)],
        MemoryInteractions::default(),
        settings(),
    );

    let summary = h.driver.run().await.unwrap();

    assert_eq!(summary.pages, 2);
    assert_eq!(summary.imported, 2000);
    assert_eq!(h.source.requested(), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_page_of_gaps_does_not_end_the_run() {
    let h = harness(
        vec![vec![incoming("a", 60)], Vec::new(), vec![incoming("b", 60)]],
        MemoryInteractions::default(),
        settings(),
    );

    let summary = h.driver.run().await.unwrap();

    assert_eq!(summary.pages, 3);
    assert_eq!(summary.imported, 2);
    assert_eq!(h.source.requested(), vec![1, 2, 3, 4]);
    assert_eq!(h.interactions.keys(), vec!["a".to_owned(), "b".to_owned()]);
}

const TRUNK: &str = "SIP/trunk-1";
const DESK: &str = "SIP/2345-1";

/// A closing event whose opening half was never logged, then one complete 60 second call from
/// `CALLER` to the 2345 desk phone.
fn cel_log_with_leading_gap() -> Vec<RawEvent> {
    let other = || EventType::Other("CHAN_START".to_owned());
    vec![
        RawEvent::new(1, EventType::BridgeEnd, "orphan", "SIP/trunk-9", at(0))
            .with_peer("SIP/2346-9")
            .with_caller("6025550199", "", "from-pstn"),
        RawEvent::new(2, other(), "c1", TRUNK, at(1)).with_caller(CALLER, "", "from-pstn"),
        RawEvent::new(3, other(), "c2", DESK, at(2)).with_caller("2345", "", "from-internal"),
        RawEvent::new(4, EventType::BridgeEnter, "c1", TRUNK, at(5))
            .with_peer(DESK)
            .with_caller(CALLER, "", "from-pstn"),
        RawEvent::new(5, EventType::BridgeExit, "c1", TRUNK, at(65))
            .with_peer(DESK)
            .with_caller(CALLER, "", "from-pstn"),
    ]
}

#[tokio::test]
async fn test_local_source_steps_over_leading_gap() {
    let service = CelService::new(
        Arc::new(MemoryEventStore::new(cel_log_with_leading_gap())),
        CallReconciler::new(DirectionClassifier::default(), ChannelExclusions::default()),
    );
    let interactions = Arc::new(MemoryInteractions::default());
    let driver = SyncDriver::new(
        Arc::new(LocalCelSource::new(service)),
        Arc::new(directory()),
        interactions.clone(),
        SyncSettings {
            page_size: 1,
            ..settings()
        },
    );

    let summary = driver.run().await.unwrap();

    assert_eq!(summary.pages, 2);
    assert_eq!(summary.imported, 1);
    let rows = interactions.rows();
    assert_eq!(rows[0].foreign_key, "5");
    assert_eq!(rows[0].person, CALLER_PERSON);
    assert_eq!(rows[0].related_person, Some(DESK_PERSON));
    assert_eq!(rows[0].data["duration_seconds"], 60);

    let summary = driver.run().await.unwrap();
    assert_eq!(summary.imported, 0);
    assert_eq!(interactions.rows().len(), 1);
}

#[tokio::test]
async fn test_each_number_is_looked_up_once_per_run() {
    let calls = (0..5).map(|i| incoming(&format!("k{i}"), 60)).collect();
    let h = harness(vec![calls], MemoryInteractions::default(), settings());

    let summary = h.driver.run().await.unwrap();

    assert_eq!(summary.imported, 5);
    // The desk extension resolves from the extension table, the caller from the directory once.
    assert_eq!(h.directory.partial_lookups.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_internal_calls_are_skipped_when_configured() {
    let pages = vec![vec![
        call("ext-to-ext", "2345", "2346", 60, Direction::Outgoing),
        call("ext-to-unknown", "2345", "6025559999", 60, Direction::Outgoing),
        call("ext-to-caller", "2345", CALLER, 60, Direction::Outgoing),
    ]];
    let h = harness(
        pages,
        MemoryInteractions::default(),
        SyncSettings {
            skip_internal_calls: true,
            ..settings()
        },
    );

    let summary = h.driver.run().await.unwrap();

    assert_eq!(summary.skipped_internal, 2);
    assert_eq!(h.interactions.keys(), vec!["ext-to-caller".to_owned()]);
}

#[tokio::test]
async fn test_internal_calls_are_kept_by_default() {
    let h = harness(
        vec![vec![call("ext-to-ext", "2345", "2346", 60, Direction::Outgoing)]],
        MemoryInteractions::default(),
        settings(),
    );

    let summary = h.driver.run().await.unwrap();

    assert_eq!(summary.imported, 1);
    let rows = h.interactions.rows();
    assert_eq!(rows[0].person, OTHER_DESK_PERSON);
    assert_eq!(rows[0].related_person, Some(DESK_PERSON));
}

#[tokio::test]
async fn test_persistence_failure_skips_only_that_call() {
    let interactions = MemoryInteractions {
        rejected_keys: HashSet::from(["b".to_owned()]),
        ..MemoryInteractions::default()
    };
    let h = harness(
        vec![vec![incoming("a", 60), incoming("b", 60), incoming("c", 60)]],
        interactions,
        settings(),
    );

    let summary = h.driver.run().await.unwrap();

    assert_eq!(summary.imported, 2);
    assert_eq!(summary.persist_failures, 1);
    assert_eq!(h.interactions.keys(), vec!["a".to_owned(), "c".to_owned()]);
    assert_eq!(h.interactions.cursor_writes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_key_repeated_across_pages_is_imported_once() {
    let h = harness(
        vec![
            vec![incoming("a", 60), incoming("b", 60)],
            vec![incoming("b", 60), incoming("c", 60)],
        ],
        MemoryInteractions::default(),
        settings(),
    );

    let summary = h.driver.run().await.unwrap();

    assert_eq!(summary.imported, 3);
    assert_eq!(summary.duplicates, 1);
}

#[tokio::test]
async fn test_failed_run_keeps_cursor_and_rerun_skips_imported_calls() {
    let h = harness(
        vec![
            vec![incoming("a", 60), incoming("b", 60)],
            vec![incoming("c", 60)],
        ],
        MemoryInteractions::default(),
        settings(),
    );
    *h.source.fail_on_page.lock().unwrap() = Some(2);

    let failure = h.driver.run().await.unwrap_err();

    assert!(matches!(failure.error, SyncError::AuthenticationFailure));
    assert_eq!(failure.imported, 2);
    assert!(failure.to_string().starts_with("Experienced an error: "));
    assert!(h.interactions.cursor.lock().unwrap().is_none());

    *h.source.fail_on_page.lock().unwrap() = None;
    let summary = h.driver.run().await.unwrap();

    assert_eq!(summary.imported, 1);
    assert_eq!(summary.duplicates, 2);
    assert_eq!(
        h.interactions.keys(),
        vec!["a".to_owned(), "b".to_owned(), "c".to_owned()]
    );

    // The cursor has moved past every call, so a third run finds nothing new.
    let summary = h.driver.run().await.unwrap();
    assert_eq!(summary.imported, 0);
    assert_eq!(h.interactions.rows().len(), 3);
}

#[tokio::test]
async fn test_missing_internal_phone_type_fails_before_fetching() {
    let h = harness(
        vec![vec![incoming("a", 60)]],
        MemoryInteractions::default(),
        SyncSettings::default(),
    );

    let failure = h.driver.run().await.unwrap_err();

    assert!(matches!(failure.error, SyncError::ConfigurationMissing(_)));
    assert_eq!(failure.imported, 0);
    assert!(h.source.requested().is_empty());
    assert!(h.interactions.rows().is_empty());
}

#[tokio::test]
async fn test_unavailable_store_counts_failures_and_still_finishes() {
    let h = harness(
        vec![vec![incoming("a", 60), incoming("b", 60)]],
        MemoryInteractions::default(),
        settings(),
    );
    h.interactions.unavailable.store(true, Ordering::SeqCst);

    let summary = h.driver.run().await.unwrap();

    assert_eq!(summary.persist_failures, 2);
    assert_eq!(summary.imported, 0);
}
