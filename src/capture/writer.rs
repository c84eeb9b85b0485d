use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use super::{CaptureError, Record, CAPTURE_SUFFIX};

const WRITE_BUFFER_BYTES: usize = 64 * 1024;

/// Exclusive writer for one capture artifact. Not shared between tasks; callers funnel
/// records through a single owner.
#[derive(Debug)]
pub struct CaptureWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    records: u64,
}

impl CaptureWriter {
    /// Creates `<dir>/<prefix>XXXXXX.jsonl` with a unique name that outlives the writer.
    pub fn create_temp(dir: &Path, prefix: &str) -> Result<Self, CaptureError> {
        let file = tempfile::Builder::new()
            .prefix(prefix)
            .suffix(CAPTURE_SUFFIX)
            .tempfile_in(dir)
            .map_err(|source| CaptureError::Create { dir: dir.to_path_buf(), source })?;
        let (file, path) = file
            .keep()
            .map_err(|err| CaptureError::Create { dir: dir.to_path_buf(), source: err.error })?;
        Ok(Self::from_file(path, file))
    }

    pub fn create(path: &Path) -> Result<Self, CaptureError> {
        let file = File::create(path)?;
        Ok(Self::from_file(path.to_path_buf(), file))
    }

    fn from_file(path: PathBuf, file: File) -> Self {
        Self { path, writer: BufWriter::with_capacity(WRITE_BUFFER_BYTES, file), records: 0 }
    }

    pub fn encode(&mut self, record: &Record) -> Result<(), CaptureError> {
        serde_json::to_writer(&mut self.writer, record)?;
        self.writer.write_all(b"\n")?;
        self.records += 1;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records_written(&self) -> u64 {
        self.records
    }

    /// Flushes buffered records and syncs the file. Returns the artifact path.
    pub fn close(mut self) -> Result<PathBuf, CaptureError> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(self.path)
    }
}
