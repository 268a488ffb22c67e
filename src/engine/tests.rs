use std::fs;

use parking_lot::Mutex;
use tempfile::TempDir;

use super::*;
use crate::error::FileSystemError;
use crate::testing::{TranscriptBuilder, append, bump_mtime};

fn may() -> MonthKey {
    MonthKey::new(2024, 5).unwrap()
}

fn config() -> Config {
    let mut config = Config::default();
    // Fixtures sit on UTC day boundaries.
    config.calendar.zone = DayZone::Utc;
    config.timing.filter_debounce_ms = 5;
    config.timing.coverage_debounce_ms = 30;
    config.enrichment.batch_size = 2;
    config.enrichment.max_threads = 2;
    config
}

/// Three sessions created on 05-01 under `root/2024-05-01/`, last updated on 05-01, 05-02 and 05-03.
fn three_sessions(root: &Path) -> Vec<PathBuf> {
    let s1 = TranscriptBuilder::new("s1", "2024-05-01T08:00:00Z")
        .cwd("/w/app")
        .user("2024-05-01T08:00:01Z", "one")
        .assistant("2024-05-01T08:05:00Z", "done")
        .write_to(&root.join("2024-05-01/s1.jsonl"));
    let s2 = TranscriptBuilder::new("s2", "2024-05-01T23:59:00Z")
        .cwd("/w/app")
        .user("2024-05-02T00:10:00Z", "two")
        .assistant("2024-05-02T00:20:00Z", "done")
        .write_to(&root.join("2024-05-01/s2.jsonl"));
    let s3 = TranscriptBuilder::new("s3", "2024-05-01T10:00:00Z")
        .cwd("/w/lib")
        .user("2024-05-01T10:00:01Z", "three")
        .tool_call("2024-05-01T10:00:02Z", "shell")
        .assistant("2024-05-02T10:00:00Z", "still going")
        .assistant("2024-05-03T10:00:00Z", "done")
        .write_to(&root.join("2024-05-01/s3.jsonl"));
    vec![s1, s2, s3]
}

struct Fixture {
    dir: TempDir,
    engine: Engine,
    paths: Vec<PathBuf>,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("sessions");
        let paths = three_sessions(&root);
        let engine = Engine::with_cache(
            &config(),
            root,
            Arc::new(RecordCache::in_memory()),
            dir.path().join("notes"),
        )
        .unwrap();
        Self { dir, engine, paths }
    }

    fn record(&self, id: &str) -> SessionRecord {
        self.engine
            .records()
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .unwrap()
    }
}

fn ids(output: &FilterOutput) -> Vec<String> {
    output.records().map(|r| r.id.clone()).collect()
}

fn query(text: &str) -> FilterState {
    FilterState {
        query: text.to_string(),
        ..Default::default()
    }
}

#[test]
fn test_calendar_counts_end_to_end() {
    let fx = Fixture::new();
    assert_eq!(fx.engine.zone(), DayZone::Utc);
    let scan = fx.engine.refresh(Scope::Month(may()));
    assert_eq!(scan.records.len(), 3);

    assert_eq!(
        fx.engine.calendar_counts(may(), DateDimension::Created),
        BTreeMap::from([(1, 3)])
    );
    // Provisional until coverage loads.
    assert_eq!(
        fx.engine.calendar_counts(may(), DateDimension::Updated),
        BTreeMap::from([(1, 1), (2, 1), (3, 1)])
    );

    fx.engine.load_coverage(may()).unwrap();
    assert!(fx.engine.coverage_loaded(may()));
    // s3 shows on every day it touched; s2 only on the day it had events.
    assert_eq!(
        fx.engine.calendar_counts(may(), DateDimension::Updated),
        BTreeMap::from([(1, 2), (2, 2), (3, 1)])
    );
    assert_eq!(
        fx.engine.calendar_counts(may(), DateDimension::Created),
        BTreeMap::from([(1, 3)])
    );
    assert!(fx.engine.request_coverage(may()).is_none());
}

#[test]
fn test_request_coverage_newer_month_cancels_pending() {
    let fx = Fixture::new();
    fx.engine.refresh(Scope::All);
    let april = MonthKey::new(2024, 4).unwrap();

    let first = fx.engine.request_coverage(april).unwrap();
    let second = fx.engine.request_coverage(may()).unwrap();
    // In flight: a duplicate request is refused.
    assert!(fx.engine.request_coverage(may()).is_none());
    first.join();
    second.join();

    assert!(fx.engine.coverage_loaded(may()));
    assert!(!fx.engine.coverage_loaded(april));
    assert_eq!(fx.engine.calendar_counts(may(), DateDimension::Updated)[&2], 2);

    // The cancelled claim was released.
    let retry = fx.engine.request_coverage(april).unwrap();
    retry.join();
    assert!(fx.engine.coverage_loaded(april));
}

#[test]
fn test_unchanged_files_are_not_reparsed() {
    let fx = Fixture::new();
    let first = fx.engine.refresh(Scope::Month(may()));
    assert_eq!(first.stats.parsed, 3);

    let second = fx.engine.refresh(Scope::Month(may()));
    assert_eq!(second.stats.parsed, 0);
    assert_eq!(second.stats.cache_hits, 3);
    assert_eq!(first.records, second.records);
    assert_eq!(fx.engine.cache().stats().entries, 3);
}

#[test]
fn test_touching_one_file_reparses_only_that_file() {
    let fx = Fixture::new();
    fx.engine.refresh(Scope::Month(may()));

    append(
        &fx.paths[0],
        "{\"timestamp\":\"2024-05-01T09:00:00Z\",\"type\":\"event_msg\",\"payload\":{}}\n",
    );
    bump_mtime(&fx.paths[0], 5);

    let rescan = fx.engine.rescan().unwrap();
    assert_eq!(rescan.stats.parsed, 1);
    assert_eq!(rescan.stats.cache_hits, 2);
    assert_eq!(
        fx.record("s1").last_updated_at.to_rfc3339(),
        "2024-05-01T09:00:00+00:00"
    );
}

#[test]
fn test_enrich_one_replaces_record_and_is_stable() {
    let fx = Fixture::new();
    fx.engine.refresh(Scope::Month(may()));
    let fast = fx.record("s3");
    assert!(!fast.is_enriched());

    let enriched = fx.engine.enrich_one(&fx.paths[2]).unwrap();
    assert!(enriched.is_enriched());
    assert!(enriched.role_counts.dominates(&fast.role_counts));
    assert!(enriched.tool_invocations >= fast.tool_invocations);
    assert!(enriched.total_events >= fast.total_events);
    assert_eq!(fx.record("s3"), enriched);

    assert_eq!(fx.engine.enrich_one(&fx.paths[2]).unwrap(), enriched);

    // The enriched record survives a rescan of the unchanged file.
    fx.engine.rescan();
    assert!(fx.record("s3").is_enriched());
}

#[test]
fn test_enrich_one_failure_keeps_fast_record() {
    let fx = Fixture::new();
    fx.engine.refresh(Scope::Month(may()));
    let before = fx.record("s1");

    fs::write(&fx.paths[0], "").unwrap();
    assert!(fx.engine.enrich_one(&fx.paths[0]).is_err());
    assert_eq!(fx.record("s1"), before);
}

#[test]
fn test_background_enrichment_updates_record_set() {
    let fx = Fixture::new();
    fx.engine.refresh(Scope::Month(may()));
    let batches = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&batches);
    fx.engine
        .start_enrichment(move |batch| sink.lock().push(batch.records.len()))
        .join();

    assert!(fx.engine.records().iter().all(|r| r.is_enriched()));
    let batches = batches.lock();
    assert_eq!(batches.iter().sum::<usize>(), 3);
    assert!(batches.iter().all(|len| *len <= 2));
}

#[test]
fn test_calendar_follows_record_set_under_concurrent_updates() {
    let fx = Fixture::new();
    fx.engine.refresh(Scope::Month(may()));

    std::thread::scope(|s| {
        s.spawn(|| {
            for _ in 0..20 {
                fx.engine.refresh(Scope::Month(may()));
            }
        });
        s.spawn(|| {
            for _ in 0..20 {
                for path in &fx.paths {
                    let _ = fx.engine.enrich_one(path);
                }
            }
        });
        s.spawn(|| {
            for _ in 0..5 {
                fx.engine.start_enrichment(|_| {}).join();
            }
        });
    });

    // Whichever writer went last, the calendar holds exactly the published set.
    assert!(Arc::ptr_eq(
        &fx.engine.shared.calendar.records(),
        &fx.engine.records()
    ));
    assert_eq!(
        fx.engine.calendar_counts(may(), DateDimension::Created),
        BTreeMap::from([(1, 3)])
    );
}

#[test]
fn test_refresh_waits_for_a_batch_being_applied() {
    let fx = Fixture::new();
    fx.engine.refresh(Scope::Month(may()));

    let (entered_tx, entered_rx) = std::sync::mpsc::channel::<()>();
    let applied = Arc::new(Mutex::new(false));
    let flag = Arc::clone(&applied);
    let spawned = fx.engine.start_enrichment(move |_| {
        let _ = entered_tx.send(());
        std::thread::sleep(std::time::Duration::from_millis(50));
        *flag.lock() = true;
    });

    entered_rx.recv().unwrap();
    fx.engine.refresh(Scope::Month(may()));
    // The batch finished before the refresh published its own set.
    assert!(*applied.lock());
    spawned.join();
    assert!(Arc::ptr_eq(
        &fx.engine.shared.calendar.records(),
        &fx.engine.records()
    ));
}

#[test]
fn test_filter_a_then_b_publishes_only_b() {
    let fx = Fixture::new();
    fx.engine.refresh(Scope::Month(may()));
    let mut rx = fx.engine.filtered();

    let a = fx.engine.set_filter(query("two"));
    let b = fx.engine.set_filter(query("three"));
    let b_generation = b.ticket.generation();
    a.join();
    b.join();

    let output = rx.borrow_and_update().clone();
    assert_eq!(output.state, query("three"));
    assert_eq!(output.generation, b_generation);
    assert_eq!(ids(&output), vec!["s3"]);
}

#[test]
fn test_full_text_hits_join_the_text_stage() {
    let fx = Fixture::new();
    fx.engine.refresh(Scope::Month(may()));

    let before = fx.engine.filter_now(query("Still Going")).unwrap();
    assert_eq!(before.total, 0);

    let hits = fx.engine.search("still going").unwrap();
    assert_eq!(hits.ids, HashSet::from(["s3".to_string()]));

    let after = fx.engine.filter_now(query("Still Going")).unwrap();
    assert_eq!(ids(&after), vec!["s3"]);

    fx.engine.cancel_search();
    assert!(fx.engine.search_hits().is_none());
}

#[test]
fn test_background_search_refilters() {
    let fx = Fixture::new();
    fx.engine.refresh(Scope::Month(may()));
    fx.engine.filter_now(query("still going")).unwrap();

    fx.engine.start_search("still going").join();
    assert_eq!(fx.engine.search_hits().unwrap().ids.len(), 1);

    // The re-run filter pass lands shortly after.
    let mut landed = false;
    for _ in 0..200 {
        if fx.engine.latest_filtered().total == 1 {
            landed = true;
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(5));
    }
    assert!(landed);
}

#[test]
fn test_directory_counts_track_new_sessions() {
    let fx = Fixture::new();
    let tree = fx.engine.directory_counts();
    assert_eq!(tree.total(), 3);
    assert_eq!(tree.count_under("/w/app"), 2);
    assert_eq!(tree.count_under("/w/lib"), 1);

    TranscriptBuilder::new("s4", "2024-05-04T09:00:00Z")
        .cwd("/w/app/api")
        .write_to(&fx.engine.root().join("2024-05-04/s4.jsonl"));
    let tree = fx.engine.directory_counts();
    assert_eq!(tree.count_under("/w/app"), 3);
    assert_eq!(tree.count_under("/w/app/api"), 1);
    assert_eq!(tree.root(), PathTree::from_flat(tree.flat().clone()).root());

    fs::remove_file(&fx.paths[2]).unwrap();
    let tree = fx.engine.directory_counts();
    assert_eq!(tree.count_under("/w/lib"), 0);
    assert_eq!(tree.total(), 3);
}

#[test]
fn test_removed_file_leaves_record_set_and_cache() {
    let fx = Fixture::new();
    fx.engine.refresh(Scope::Month(may()));
    fs::remove_file(&fx.paths[1]).unwrap();

    let rescan = fx.engine.rescan().unwrap();
    assert_eq!(rescan.records.len(), 2);
    assert!(fx.engine.records().iter().all(|r| r.id != "s2"));
    assert_eq!(fx.engine.cache().len(), 2);
}

#[test]
fn test_missing_root_is_an_empty_result_with_condition() {
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("nope");
    let engine = Engine::with_cache(
        &config(),
        missing.clone(),
        Arc::new(RecordCache::in_memory()),
        dir.path().join("notes"),
    )
    .unwrap();

    let output = engine.refresh(Scope::All);
    assert!(output.records.is_empty());
    assert_eq!(output.condition, Some(FileSystemError::RootMissing(missing)));
    assert!(engine.records().is_empty());
}

#[test]
fn test_notes_feed_quick_text_match() {
    let fx = Fixture::new();
    fx.engine.refresh(Scope::Month(may()));

    let notes = fx.dir.path().join("notes");
    fs::create_dir_all(&notes).unwrap();
    fs::write(notes.join("s2.json"), r#"{"title":"Parser rewrite"}"#).unwrap();
    fx.engine.reload_notes();

    assert_eq!(
        fx.engine.note("s2").unwrap().title.as_deref(),
        Some("Parser rewrite")
    );
    let output = fx.engine.filter_now(query("parser")).unwrap();
    assert_eq!(ids(&output), vec!["s2"]);
}

#[test]
fn test_poll_activity_is_rate_limited() {
    let fx = Fixture::new();
    fx.engine.refresh(Scope::Month(may()));
    let visible = fx.engine.records();

    assert!(fx.engine.poll_activity(&visible).unwrap().is_empty());
    assert!(fx.engine.poll_activity(&visible).is_none());
}
