use std::fs;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use super::*;
use crate::parser::{ParseMode, ParseOptions, parse};
use crate::testing::TranscriptBuilder;
use crate::types::Completeness;

fn fixture(dir: &Path, name: &str) -> (PathBuf, SessionRecord) {
    let path = TranscriptBuilder::new(name, "2024-05-01T09:00:00Z")
        .cwd("/work/app")
        .user("2024-05-01T09:00:01Z", "hello")
        .write_to(&dir.join(format!("{name}.jsonl")));
    let record = parse(&path, ParseMode::Fast, &ParseOptions::default()).unwrap();
    (path, record)
}

fn mtime_of(path: &Path) -> i64 {
    file_stamp(path).unwrap().1
}

#[test]
fn test_hit_requires_matching_mtime() {
    let dir = TempDir::new().unwrap();
    let (path, record) = fixture(dir.path(), "a");
    let cache = RecordCache::in_memory();

    assert!(cache.get(&path).is_none());
    cache.put(&path, mtime_of(&path), record.clone());
    assert_eq!(cache.get(&path), Some(record.clone()));
    assert!(cache.get_with_mtime(&path, mtime_of(&path) + 1).is_none());

    let stats = cache.stats();
    assert_eq!(stats.entries, 1);
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 2);
}

#[test]
fn test_mtime_change_invalidates_only_that_entry() {
    let dir = TempDir::new().unwrap();
    let (a, record_a) = fixture(dir.path(), "a");
    let (b, record_b) = fixture(dir.path(), "b");
    let cache = RecordCache::in_memory();
    cache.put(&a, mtime_of(&a), record_a);
    cache.put(&b, mtime_of(&b), record_b.clone());

    crate::testing::bump_mtime(&a, 10);

    assert!(cache.get(&a).is_none());
    assert_eq!(cache.get(&b), Some(record_b));
}

#[test]
fn test_fast_record_does_not_replace_enriched() {
    let dir = TempDir::new().unwrap();
    let (path, fast) = fixture(dir.path(), "a");
    let full = parse(&path, ParseMode::Full, &ParseOptions::default()).unwrap();
    let mtime = mtime_of(&path);
    let cache = RecordCache::in_memory();

    assert!(cache.put(&path, mtime, full.clone()));
    assert!(!cache.put(&path, mtime, fast.clone()));
    assert_eq!(cache.peek(&path).unwrap().record.completeness, Completeness::Enriched);

    // A newer modification time always wins.
    assert!(cache.put(&path, mtime + 1, fast));
    assert_eq!(cache.peek(&path).unwrap().record.completeness, Completeness::Fast);
}

#[test]
fn test_invalidate_and_invalidate_all() {
    let dir = TempDir::new().unwrap();
    let (a, record_a) = fixture(dir.path(), "a");
    let (b, record_b) = fixture(dir.path(), "b");
    let cache = RecordCache::in_memory();
    cache.put(&a, mtime_of(&a), record_a);
    cache.put(&b, mtime_of(&b), record_b);

    assert!(cache.invalidate(&a));
    assert!(!cache.invalidate(&a));
    assert_eq!(cache.len(), 1);

    cache.invalidate_all();
    assert!(cache.is_empty());
}

#[test]
fn test_prune_missing_drops_deleted_files() {
    let dir = TempDir::new().unwrap();
    let (a, record_a) = fixture(dir.path(), "a");
    let (b, record_b) = fixture(dir.path(), "b");
    let cache = RecordCache::in_memory();
    cache.put(&a, mtime_of(&a), record_a);
    cache.put(&b, mtime_of(&b), record_b);

    fs::remove_file(&a).unwrap();

    assert_eq!(cache.prune_missing(), vec![a.clone()]);
    assert!(cache.peek(&a).is_none());
    assert!(cache.peek(&b).is_some());
}

#[test]
fn test_persist_and_reopen() {
    let data = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();
    let (path, record) = fixture(data.path(), "a");

    {
        let cache = RecordCache::open(cache_dir.path(), Duration::from_secs(60));
        cache.put(&path, mtime_of(&path), record.clone());
        cache.persist().unwrap();
        assert!(cache_dir.path().join(cache_file_name()).exists());
    }

    let reopened = RecordCache::open(cache_dir.path(), Duration::from_secs(60));
    assert_eq!(reopened.len(), 1);
    assert_eq!(reopened.get(&path), Some(record));
}

#[test]
fn test_drop_flushes_pending_writes() {
    let data = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();
    let (path, record) = fixture(data.path(), "a");

    {
        let cache = RecordCache::open(cache_dir.path(), Duration::from_secs(60));
        cache.put(&path, mtime_of(&path), record);
    }

    let reopened = RecordCache::open(cache_dir.path(), Duration::from_secs(60));
    assert!(reopened.peek(&path).is_some());
}

#[test]
fn test_flusher_writes_after_burst_settles() {
    let data = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();
    let (path, record) = fixture(data.path(), "a");
    let file = cache_dir.path().join(cache_file_name());

    let cache = RecordCache::open(cache_dir.path(), Duration::from_millis(20));
    for _ in 0..5 {
        cache.put(&path, mtime_of(&path), record.clone());
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    while !file.exists() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(file.exists());
}

#[test]
fn test_corrupt_cache_starts_empty() {
    let cache_dir = TempDir::new().unwrap();
    fs::write(cache_dir.path().join(cache_file_name()), b"{ not json").unwrap();

    let cache = RecordCache::open(cache_dir.path(), Duration::from_secs(60));
    assert!(cache.is_empty());
}

#[test]
fn test_version_mismatch_starts_empty() {
    let cache_dir = TempDir::new().unwrap();
    fs::write(
        cache_dir.path().join(cache_file_name()),
        br#"{"version":1,"entries":{}}"#,
    )
    .unwrap();

    assert!(matches!(
        load_entries(&cache_dir.path().join(cache_file_name())),
        Err(CacheError::Corrupt(_))
    ));
    let cache = RecordCache::open(cache_dir.path(), Duration::from_secs(60));
    assert!(cache.is_empty());
}
