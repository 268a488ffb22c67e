//! Transcript fixtures shared by unit tests.

use std::fs;
use std::path::{Path, PathBuf};

fn json_str(text: &str) -> String {
    simd_json::to_string(&text).expect("string encodes")
}

/// Builds a transcript in the on-disk line format, header first.
#[derive(Debug, Clone)]
pub struct TranscriptBuilder {
    id: String,
    created: String,
    cwd: Option<String>,
    source: Option<String>,
    instructions: Option<String>,
    lines: Vec<String>,
}

impl TranscriptBuilder {
    pub fn new(id: &str, created: &str) -> Self {
        Self {
            id: id.to_string(),
            created: created.to_string(),
            cwd: None,
            source: None,
            instructions: None,
            lines: Vec::new(),
        }
    }

    pub fn cwd(mut self, cwd: &str) -> Self {
        self.cwd = Some(cwd.to_string());
        self
    }

    pub fn source(mut self, source: &str) -> Self {
        self.source = Some(source.to_string());
        self
    }

    pub fn instructions(mut self, text: &str) -> Self {
        self.instructions = Some(text.to_string());
        self
    }

    pub fn model(mut self, ts: &str, model: &str) -> Self {
        self.lines.push(format!(
            r#"{{"timestamp":"{ts}","type":"turn_context","payload":{{"model":{}}}}}"#,
            json_str(model)
        ));
        self
    }

    pub fn message(mut self, ts: &str, role: &str, text: &str) -> Self {
        self.lines.push(format!(
            r#"{{"timestamp":"{ts}","type":"response_item","payload":{{"type":"message","role":"{role}","content":[{{"type":"input_text","text":{}}}]}}}}"#,
            json_str(text)
        ));
        self
    }

    pub fn user(self, ts: &str, text: &str) -> Self {
        self.message(ts, "user", text)
    }

    pub fn assistant(self, ts: &str, text: &str) -> Self {
        self.message(ts, "assistant", text)
    }

    pub fn tool_call(mut self, ts: &str, name: &str) -> Self {
        self.lines.push(format!(
            r#"{{"timestamp":"{ts}","type":"response_item","payload":{{"type":"function_call","name":{},"arguments":"{{}}"}}}}"#,
            json_str(name)
        ));
        self
    }

    pub fn event(mut self, ts: &str) -> Self {
        self.lines.push(format!(
            r#"{{"timestamp":"{ts}","type":"event_msg","payload":{{"type":"token_count"}}}}"#
        ));
        self
    }

    pub fn raw(mut self, line: &str) -> Self {
        self.lines.push(line.to_string());
        self
    }

    pub fn header_line(&self) -> String {
        let mut fields = vec![
            format!(r#""id":{}"#, json_str(&self.id)),
            format!(r#""timestamp":"{}""#, self.created),
            r#""cli_version":"0.42.0""#.to_string(),
        ];
        if let Some(cwd) = &self.cwd {
            fields.push(format!(r#""cwd":{}"#, json_str(cwd)));
        }
        if let Some(source) = &self.source {
            fields.push(format!(r#""source":{}"#, json_str(source)));
        }
        if let Some(instructions) = &self.instructions {
            fields.push(format!(r#""instructions":{}"#, json_str(instructions)));
        }
        format!(
            r#"{{"timestamp":"{}","type":"session_meta","payload":{{{}}}}}"#,
            self.created,
            fields.join(",")
        )
    }

    pub fn render(&self) -> String {
        let mut out = self.header_line();
        out.push('\n');
        for line in &self.lines {
            out.push_str(line);
            out.push('\n');
        }
        out
    }

    pub fn write_to(&self, path: &Path) -> PathBuf {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create fixture dir");
        }
        fs::write(path, self.render()).expect("write fixture");
        path.to_path_buf()
    }
}

/// Append raw text to an existing fixture, simulating a live writer.
pub fn append(path: &Path, text: &str) {
    use std::io::Write;
    let mut file = fs::OpenOptions::new()
        .append(true)
        .open(path)
        .expect("open fixture for append");
    file.write_all(text.as_bytes()).expect("append fixture");
}

/// Move a file's modification time by whole seconds.
pub fn bump_mtime(path: &Path, seconds: i64) {
    let meta = fs::metadata(path).expect("stat fixture");
    let current = filetime::FileTime::from_last_modification_time(&meta);
    let next = filetime::FileTime::from_unix_time(current.unix_seconds() + seconds, 0);
    filetime::set_file_mtime(path, next).expect("set mtime");
}
