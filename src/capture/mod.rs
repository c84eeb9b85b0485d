//! Capture store: an append-only JSONL record stream plus a summary side-file.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

mod reader;
mod summary;
mod writer;

pub use reader::{read_all, read_all_from_reader};
pub use summary::{
    read_summary, summary_path_for, write_summary, SourceMode, SourceInfo, Summary,
    LINE_FORMAT_JSONL, SUMMARY_SUFFIX, SUMMARY_VERSION,
};
pub use writer::CaptureWriter;

pub const PIPE_PREFIX: &str = "ot-";
pub const EXEC_PREFIX: &str = "ot-exec-";
pub const CAPTURE_SUFFIX: &str = ".jsonl";

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to create capture file in {dir}: {source}")]
    Create { dir: PathBuf, source: std::io::Error },
    #[error("corrupt record on line {line}: {source}")]
    Corrupt { line: usize, source: serde_json::Error },
}

/// One captured output line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub n: u64,
    pub text: String,
    pub m: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stream: String,
}

impl Record {
    pub fn new(n: u64, text: impl Into<String>, matched: bool, stream: &str) -> Self {
        Self { n, text: text.into(), m: matched, stream: stream.to_string() }
    }
}

/// Trims a raw line read with `read_until(b'\n')`: the newline, then one carriage return.
pub fn trim_line_ending(mut bytes: &[u8]) -> &[u8] {
    if bytes.ends_with(b"\n") {
        bytes = &bytes[..bytes.len() - 1];
    }
    if bytes.ends_with(b"\r") {
        bytes = &bytes[..bytes.len() - 1];
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_tag_is_omitted_when_empty() {
        let json = serde_json::to_string(&Record::new(3, "hello", false, "")).expect("encode");
        assert_eq!(json, r#"{"n":3,"text":"hello","m":false}"#);
    }

    #[test]
    fn stream_tag_is_written_for_exec_records() {
        let json = serde_json::to_string(&Record::new(1, "a", true, "out")).expect("encode");
        assert_eq!(json, r#"{"n":1,"text":"a","m":true,"stream":"out"}"#);
    }

    #[test]
    fn trims_newline_then_single_carriage_return() {
        assert_eq!(trim_line_ending(b"abc\r\n"), b"abc");
        assert_eq!(trim_line_ending(b"abc\n"), b"abc");
        assert_eq!(trim_line_ending(b"abc"), b"abc");
        assert_eq!(trim_line_ending(b"abc\r\r\n"), b"abc\r");
    }
}
