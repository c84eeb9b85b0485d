use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::CaptureError;

pub const SUMMARY_VERSION: u32 = 1;
pub const LINE_FORMAT_JSONL: &str = "jsonl";
pub const SUMMARY_SUFFIX: &str = ".meta.json";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceMode {
    #[default]
    Pipe,
    File,
    Exec,
}

impl SourceMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceMode::Pipe => "pipe",
            SourceMode::File => "file",
            SourceMode::Exec => "exec",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceInfo {
    pub mode: SourceMode,
    #[serde(default)]
    pub arg: String,
}

/// Run statistics written next to a completed capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Summary {
    pub version: u32,
    pub source: SourceInfo,
    pub capture_path: PathBuf,
    pub filtered: bool,
    pub line_format: String,
    pub lines_total: u64,
    pub match_lines: u64,
    pub matches_total: u64,
    pub rules: Vec<String>,
    pub created_unix: i64,
    pub temp: bool,
    pub owner_pid: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl Default for Summary {
    fn default() -> Self {
        Self {
            version: SUMMARY_VERSION,
            source: SourceInfo::default(),
            capture_path: PathBuf::new(),
            filtered: false,
            line_format: LINE_FORMAT_JSONL.to_string(),
            lines_total: 0,
            match_lines: 0,
            matches_total: 0,
            rules: Vec::new(),
            created_unix: 0,
            temp: false,
            owner_pid: 0,
            exit_code: None,
        }
    }
}

impl Summary {
    pub fn new(mode: SourceMode, arg: impl Into<String>, capture_path: impl Into<PathBuf>) -> Self {
        Self {
            source: SourceInfo { mode, arg: arg.into() },
            capture_path: capture_path.into(),
            created_unix: chrono::Utc::now().timestamp(),
            owner_pid: std::process::id(),
            ..Self::default()
        }
    }
}

/// `<capture>.meta.json`
pub fn summary_path_for(capture: &Path) -> PathBuf {
    let mut name = OsString::from(capture.as_os_str());
    name.push(SUMMARY_SUFFIX);
    PathBuf::from(name)
}

/// Writes the summary to a `.tmp` sibling and renames it into place, so readers see either
/// the old document or the complete new one.
pub fn write_summary(path: &Path, summary: &Summary) -> Result<(), CaptureError> {
    let mut tmp_name = OsString::from(path.as_os_str());
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);

    let result = (|| {
        let mut writer = BufWriter::new(File::create(&tmp)?);
        serde_json::to_writer_pretty(&mut writer, summary)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok::<(), CaptureError>(())
    })();
    if let Err(err) = result {
        let _ = fs::remove_file(&tmp);
        return Err(err);
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

pub fn read_summary(path: &Path) -> Result<Summary, CaptureError> {
    let contents = fs::read(path)?;
    Ok(serde_json::from_slice(&contents)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn summary_path_appends_suffix() {
        let path = summary_path_for(Path::new("/tmp/ot-exec-abc.jsonl"));
        assert_eq!(path, PathBuf::from("/tmp/ot-exec-abc.jsonl.meta.json"));
    }

    #[test]
    fn write_then_read_returns_same_summary() {
        let dir = TempDir::new().expect("tempdir");
        let capture = dir.path().join("ot-1.jsonl");
        let mut summary = Summary::new(SourceMode::Exec, "make 'all targets'", &capture);
        summary.lines_total = 10;
        summary.match_lines = 2;
        summary.matches_total = 3;
        summary.rules = vec!["path:line:col".to_string()];
        summary.exit_code = Some(2);

        let path = summary_path_for(&capture);
        write_summary(&path, &summary).expect("write");
        assert!(!dir.path().join("ot-1.jsonl.meta.json.tmp").exists());

        let loaded = read_summary(&path).expect("read");
        assert_eq!(loaded, summary);
    }

    #[test]
    fn document_is_indented_and_unescaped() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("s.meta.json");
        let summary = Summary::new(SourceMode::Exec, "a<b && c>d", "/tmp/x.jsonl");
        write_summary(&path, &summary).expect("write");

        let raw = fs::read_to_string(&path).expect("read");
        assert!(raw.contains("\n  \"version\": 1,"));
        assert!(raw.contains("a<b && c>d"));
        assert!(raw.contains("\"mode\": \"exec\""));
        assert!(raw.contains("\"line_format\": \"jsonl\""));
    }

    #[test]
    fn exit_code_is_omitted_for_non_exec_sources() {
        let summary = Summary::new(SourceMode::Pipe, "", "/tmp/x.jsonl");
        let json = serde_json::to_string(&summary).expect("encode");
        assert!(!json.contains("exit_code"));
    }

    #[test]
    fn rewrite_replaces_previous_document() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("s.meta.json");
        let mut summary = Summary::new(SourceMode::File, "in.log", "/tmp/x.jsonl");
        write_summary(&path, &summary).expect("first");
        summary.lines_total = 99;
        write_summary(&path, &summary).expect("second");
        assert_eq!(read_summary(&path).expect("read").lines_total, 99);
    }

    #[test]
    fn unreadable_summary_surfaces_error() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("bad.meta.json");
        fs::write(&path, "{ nope").expect("write");
        assert!(matches!(read_summary(&path), Err(CaptureError::Json(_))));
    }
}
