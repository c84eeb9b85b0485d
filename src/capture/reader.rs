use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use super::{trim_line_ending, CaptureError, Record};

pub fn read_all(path: &Path) -> Result<Vec<Record>, CaptureError> {
    let file = File::open(path)?;
    read_all_from_reader(file)
}

/// Decodes every record until end of input. A corrupt line aborts the read.
pub fn read_all_from_reader<R: Read>(reader: R) -> Result<Vec<Record>, CaptureError> {
    let mut reader = BufReader::new(reader);
    let mut records = Vec::new();
    let mut buf = Vec::new();
    let mut line_no = 0usize;
    loop {
        buf.clear();
        let bytes = reader.read_until(b'\n', &mut buf)?;
        if bytes == 0 {
            break;
        }
        line_no += 1;
        let line = trim_line_ending(&buf);
        if line.is_empty() {
            continue;
        }
        let record = serde_json::from_slice::<Record>(line)
            .map_err(|source| CaptureError::Corrupt { line: line_no, source })?;
        records.push(record);
    }
    Ok(records)
}
