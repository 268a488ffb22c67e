use super::*;
use chrono::{TimeZone, Utc};

#[test]
fn test_format_bytes() {
    assert_eq!(format_bytes(500), "500 bytes");
    assert_eq!(format_bytes(1024), "1.00 KB");
    assert_eq!(format_bytes(1536), "1.50 KB");
    assert_eq!(format_bytes(1048576), "1.00 MB");
    assert_eq!(format_bytes(1073741824), "1.00 GB");
}

#[test]
fn test_parse_rfc3339_normalizes_to_utc() {
    let parsed = parse_rfc3339("2024-05-01T10:00:00+02:00").unwrap();
    assert_eq!(parsed, Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap());
    assert!(parse_rfc3339("yesterday").is_none());
}

#[test]
fn test_unix_ms_roundtrip() {
    let ts = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
    let ms = ts.timestamp_millis();
    assert_eq!(unix_ms_to_utc(ms), ts);
}

#[test]
fn test_is_path_prefix_respects_segments() {
    assert!(is_path_prefix("/home/u/proj", "/home/u/proj"));
    assert!(is_path_prefix("/home/u/proj", "/home/u/proj/sub"));
    assert!(is_path_prefix("/home/u/proj/", "/home/u/proj/sub"));
    assert!(!is_path_prefix("/home/u/proj", "/home/u/project"));
    assert!(!is_path_prefix("/home/u/proj/sub", "/home/u/proj"));
    assert!(is_path_prefix("", "/anything"));
}

#[test]
fn test_truncate_title() {
    assert_eq!(truncate_title("  fix   the\nbuild ", 40).as_deref(), Some("fix the build"));
    assert_eq!(truncate_title("abcdefgh", 5).as_deref(), Some("abcd…"));
    assert_eq!(truncate_title("   ", 5), None);
}

#[test]
fn test_contains_ignore_case() {
    assert!(contains_ignore_case("Refactor Parser", "parser"));
    assert!(!contains_ignore_case("Refactor Parser", "lexer"));
    assert!(contains_ignore_case("anything", ""));
    assert!(contains_ignore_case("refactor parser", "PARSER"));
    assert!(!contains_ignore_case("ab", "abc"));
}

#[test]
fn test_contains_ignore_case_folds_ascii_only() {
    assert!(contains_ignore_case("Café au lait", "CAFé"));
    assert!(!contains_ignore_case("CAFÉ", "café"));
    assert!(contains_ignore_case("ÉCOLE", "École"));
}

#[test]
fn test_file_stamp_reports_size() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("f.jsonl");
    std::fs::write(&path, b"hello").unwrap();
    let (size, mtime) = file_stamp(&path).unwrap();
    assert_eq!(size, 5);
    assert!(mtime > 0);
    assert!(file_stamp(&dir.path().join("missing")).is_none());
}
