//! Transcript parsing.
//!
//! A transcript is a line-delimited JSON file whose first line is a
//! `session_meta` header. Two modes are offered:
//!
//! - [`ParseMode::Fast`] decodes a bounded number of head lines and then reads
//!   only the last few KiB to find the latest timestamp. Latency does not grow
//!   with file size; counts are whatever the head window saw.
//! - [`ParseMode::Full`] decodes every line and produces authoritative counts.
//!
//! Both modes tolerate a trailing partial line from a file that is still
//! being written.

use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::ops::ControlFlow;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use simd_json::prelude::*;

use crate::error::ParseError;
use crate::types::{Completeness, RoleCounts, SessionRecord};
use crate::utils::{parse_rfc3339, system_time_to_unix_ms, truncate_title, unix_ms_to_utc};

const TITLE_MAX_CHARS: usize = 80;
const READ_BUFFER_BYTES: usize = 64 * 1024;

/// `response_item` payload types that represent one tool invocation each.
const TOOL_ITEM_TYPES: &[&str] = &[
    "function_call",
    "custom_tool_call",
    "local_shell_call",
    "web_search_call",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseMode {
    Fast,
    Full,
}

#[derive(Debug, Clone)]
pub struct ParseOptions {
    /// Lines decoded from the head in fast mode, header included.
    pub head_lines: usize,
    /// Bytes read from the end of the file in fast mode.
    pub tail_bytes: u64,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            head_lines: 64,
            tail_bytes: 64 * 1024,
        }
    }
}

// TRANSCRIPT LINE SCHEMA

#[derive(Debug, Deserialize)]
struct TranscriptLine {
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    payload: Option<simd_json::OwnedValue>,
}

#[derive(Debug, Deserialize)]
struct TimestampProbe {
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(rename = "type", default)]
    kind: Option<String>,
}

#[derive(Debug)]
struct SessionHeader {
    id: String,
    created_at: Option<DateTime<Utc>>,
    cwd: Option<String>,
    cli_version: Option<String>,
    instructions: Option<String>,
    source: Option<String>,
}

fn str_field(value: &simd_json::OwnedValue, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn read_header(line: &TranscriptLine, path: &Path) -> Result<SessionHeader, ParseError> {
    let malformed = |reason: &str| ParseError::MalformedHeader {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };

    if line.kind.as_deref() != Some("session_meta") {
        return Err(malformed("first line is not session_meta"));
    }
    let payload = line
        .payload
        .as_ref()
        .ok_or_else(|| malformed("session_meta has no payload"))?;
    let id = str_field(payload, "id").ok_or_else(|| malformed("session_meta has no id"))?;

    let created_at = str_field(payload, "timestamp")
        .as_deref()
        .and_then(parse_rfc3339)
        .or_else(|| line.timestamp.as_deref().and_then(parse_rfc3339));

    Ok(SessionHeader {
        id,
        created_at,
        cwd: str_field(payload, "cwd"),
        cli_version: str_field(payload, "cli_version"),
        instructions: str_field(payload, "instructions"),
        source: str_field(payload, "source").or_else(|| str_field(payload, "originator")),
    })
}

fn message_text(payload: &simd_json::OwnedValue) -> Option<String> {
    let content = payload.get("content")?;
    if let Some(text) = content.as_str() {
        return Some(text.to_string());
    }
    content.as_array()?.iter().find_map(|item| {
        item.get("text")
            .and_then(|t| t.as_str())
            .map(str::to_string)
    })
}

/// Environment/context preambles are injected as user messages; they make poor titles.
fn is_context_preamble(text: &str) -> bool {
    text.trim_start().starts_with('<')
}

/// Counters accumulated while walking transcript lines.
#[derive(Debug, Default)]
struct Tally {
    model: Option<String>,
    cwd: Option<String>,
    title: Option<String>,
    role_counts: RoleCounts,
    tool_invocations: u32,
    total_events: u64,
    total_lines: u64,
    first_timestamp: Option<DateTime<Utc>>,
    last_timestamp: Option<DateTime<Utc>>,
}

impl Tally {
    fn note_timestamp(&mut self, ts: DateTime<Utc>) {
        if self.first_timestamp.is_none_or(|first| ts < first) {
            self.first_timestamp = Some(ts);
        }
        if self.last_timestamp.is_none_or(|last| ts > last) {
            self.last_timestamp = Some(ts);
        }
    }

    fn observe(&mut self, line: &TranscriptLine) {
        self.total_events += 1;
        if let Some(ts) = line.timestamp.as_deref().and_then(parse_rfc3339) {
            self.note_timestamp(ts);
        }

        let Some(payload) = &line.payload else {
            return;
        };

        match line.kind.as_deref() {
            Some("turn_context") => {
                if let Some(model) = str_field(payload, "model") {
                    self.model = Some(model);
                }
                if self.cwd.is_none() {
                    self.cwd = str_field(payload, "cwd");
                }
            }
            Some("response_item") => match payload.get("type").and_then(|v| v.as_str()) {
                Some("message") => {
                    let role = payload
                        .get("role")
                        .and_then(|v| v.as_str())
                        .unwrap_or("other");
                    self.role_counts.record(role);
                    if role == "user"
                        && self.title.is_none()
                        && let Some(text) = message_text(payload)
                        && !is_context_preamble(&text)
                    {
                        self.title = truncate_title(&text, TITLE_MAX_CHARS);
                    }
                }
                Some(kind) if TOOL_ITEM_TYPES.contains(&kind) => {
                    self.tool_invocations += 1;
                }
                _ => {}
            },
            _ => {}
        }
    }
}

fn decode_line<T: for<'de> Deserialize<'de>>(raw: &[u8], scratch: &mut Vec<u8>) -> Option<T> {
    let trimmed = raw.trim_ascii();
    if trimmed.is_empty() {
        return None;
    }
    scratch.clear();
    scratch.extend_from_slice(trimmed);
    simd_json::from_slice(scratch.as_mut_slice()).ok()
}

struct LineScan {
    header: SessionHeader,
    tally: Tally,
    /// Bytes consumed by complete lines.
    consumed: u64,
    reached_eof: bool,
}

/// Walk lines from the start of the file, decoding the header and tallying up to `limit` lines.
fn scan_lines<R: BufRead>(
    reader: &mut R,
    path: &Path,
    limit: Option<usize>,
) -> Result<LineScan, ParseError> {
    let mut raw = Vec::with_capacity(4096);
    let mut scratch = Vec::with_capacity(4096);
    let mut header: Option<SessionHeader> = None;
    let mut tally = Tally::default();
    let mut consumed = 0u64;
    let mut lines_read = 0usize;
    let mut reached_eof = false;

    loop {
        if let Some(limit) = limit
            && lines_read >= limit
        {
            break;
        }

        raw.clear();
        let n = reader
            .read_until(b'\n', &mut raw)
            .map_err(|source| ParseError::Unreadable {
                path: path.to_path_buf(),
                source,
            })?;
        if n == 0 {
            reached_eof = true;
            break;
        }
        let terminated = raw.last() == Some(&b'\n');

        if raw.trim_ascii().is_empty() {
            if terminated {
                consumed += n as u64;
            }
            continue;
        }

        let decoded: Option<TranscriptLine> = decode_line(&raw, &mut scratch);
        if header.is_none() {
            let Some(line) = decoded else {
                return Err(if terminated {
                    ParseError::MalformedHeader {
                        path: path.to_path_buf(),
                        reason: "first line is not valid JSON".to_string(),
                    }
                } else {
                    ParseError::Truncated {
                        path: path.to_path_buf(),
                    }
                });
            };
            header = Some(read_header(&line, path)?);
            tally.total_lines += 1;
            tally.observe(&line);
        } else if let Some(line) = decoded {
            tally.total_lines += 1;
            tally.observe(&line);
        } else if terminated {
            // Corrupt line in the middle of the file: counted, not decoded.
            tally.total_lines += 1;
        }

        lines_read += 1;
        if terminated {
            consumed += n as u64;
        } else {
            reached_eof = true;
            break;
        }
    }

    let header = header.ok_or_else(|| ParseError::Empty {
        path: path.to_path_buf(),
    })?;

    Ok(LineScan {
        header,
        tally,
        consumed,
        reached_eof,
    })
}

/// Latest timestamp among the lines in the last `tail_bytes` of the file, never before `floor`.
fn read_tail_timestamp(
    file: &mut File,
    floor: u64,
    size: u64,
    tail_bytes: u64,
) -> std::io::Result<Option<DateTime<Utc>>> {
    let from = size.saturating_sub(tail_bytes).max(floor);
    if from >= size {
        return Ok(None);
    }

    // Start one byte early so a window that begins exactly on a line boundary keeps that line.
    let mid_line = from > floor;
    let seek_to = if mid_line { from - 1 } else { from };
    file.seek(SeekFrom::Start(seek_to))?;
    let mut buf = Vec::with_capacity((size - seek_to) as usize);
    file.by_ref().take(size - seek_to).read_to_end(&mut buf)?;

    let mut window = &buf[..];
    if mid_line {
        match memchr::memchr(b'\n', window) {
            Some(pos) => window = &window[pos + 1..],
            None => return Ok(None),
        }
    }

    // Transcripts are append-only, so the last stamped line is the newest.
    let mut scratch = Vec::new();
    for line in window.rsplit(|b| *b == b'\n') {
        let Some(probe) = decode_line::<TimestampProbe>(line, &mut scratch) else {
            continue;
        };
        if let Some(ts) = probe.timestamp.as_deref().and_then(parse_rfc3339) {
            return Ok(Some(ts));
        }
    }
    Ok(None)
}

/// Parse one transcript into a record.
pub fn parse(path: &Path, mode: ParseMode, options: &ParseOptions) -> Result<SessionRecord, ParseError> {
    let unreadable = |source| ParseError::Unreadable {
        path: path.to_path_buf(),
        source,
    };

    let file = File::open(path).map_err(unreadable)?;
    let meta = file.metadata().map_err(unreadable)?;
    let size = meta.len();
    let mtime = meta
        .modified()
        .ok()
        .and_then(system_time_to_unix_ms)
        .map(unix_ms_to_utc);

    let mut reader = BufReader::with_capacity(READ_BUFFER_BYTES, file);

    let (scan, ended_at, completeness) = match mode {
        ParseMode::Full => {
            let scan = scan_lines(&mut reader, path, None)?;
            let ended_at = scan.tally.last_timestamp;
            (scan, ended_at, Completeness::Enriched)
        }
        ParseMode::Fast => {
            let scan = scan_lines(&mut reader, path, Some(options.head_lines.max(1)))?;
            let mut ended_at = scan.tally.last_timestamp;
            if !scan.reached_eof {
                let mut file = reader.into_inner();
                let tail = read_tail_timestamp(&mut file, scan.consumed, size, options.tail_bytes)
                    .map_err(unreadable)?;
                if let Some(tail) = tail {
                    ended_at = Some(ended_at.map_or(tail, |head| head.max(tail)));
                }
            }
            (scan, ended_at, Completeness::Fast)
        }
    };

    Ok(build_record(path, size, mtime, scan, ended_at, completeness))
}

fn build_record(
    path: &Path,
    size: u64,
    mtime: Option<DateTime<Utc>>,
    scan: LineScan,
    ended_at: Option<DateTime<Utc>>,
    completeness: Completeness,
) -> SessionRecord {
    let LineScan { header, tally, .. } = scan;

    let created_at = header
        .created_at
        .or(tally.first_timestamp)
        .or(mtime)
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
    let last_updated_at = ended_at.or(mtime).unwrap_or(created_at).max(created_at);

    SessionRecord {
        id: header.id,
        path: path.to_path_buf(),
        file_size: size,
        created_at,
        ended_at,
        last_updated_at,
        cwd: header.cwd.or(tally.cwd),
        cli_version: header.cli_version,
        instructions: header.instructions,
        model: tally.model,
        title: tally.title,
        role_counts: tally.role_counts,
        tool_invocations: tally.tool_invocations,
        total_events: tally.total_events,
        total_lines: tally.total_lines,
        source: header.source,
        completeness,
    }
}

/// Visit the timestamp of every decodable event line in file order.
///
/// The `session_meta` header is bookkeeping, not activity, and is skipped.
/// Used by the calendar's deep coverage scan; only `timestamp` and `type` are decoded.
pub fn for_each_event_timestamp(
    path: &Path,
    mut visit: impl FnMut(DateTime<Utc>) -> ControlFlow<()>,
) -> Result<(), ParseError> {
    let file = File::open(path).map_err(|source| ParseError::Unreadable {
        path: path.to_path_buf(),
        source,
    })?;
    let mut reader = BufReader::with_capacity(READ_BUFFER_BYTES, file);
    let mut raw = Vec::with_capacity(4096);
    let mut scratch = Vec::with_capacity(4096);

    loop {
        raw.clear();
        let n = reader
            .read_until(b'\n', &mut raw)
            .map_err(|source| ParseError::Unreadable {
                path: path.to_path_buf(),
                source,
            })?;
        if n == 0 {
            return Ok(());
        }
        let Some(probe) = decode_line::<TimestampProbe>(&raw, &mut scratch) else {
            continue;
        };
        if probe.kind.as_deref() == Some("session_meta") {
            continue;
        }
        if let Some(ts) = probe.timestamp.as_deref().and_then(parse_rfc3339)
            && visit(ts).is_break()
        {
            return Ok(());
        }
    }
}
