//! Runs a command (or drains a reader), tees every output line to its passthrough sink in
//! real time, classifies it, and persists it as a capture record.
//!
//! Each stream gets its own worker task. Records from all workers funnel into a single
//! writer task through a bounded queue, so the capture file is only ever written by one
//! owner. Run-wide counters are atomics shared by the workers.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::capture::{
    trim_line_ending, CaptureError, CaptureWriter, Record, SourceMode, Summary, EXEC_PREFIX,
    PIPE_PREFIX,
};
use crate::rules::RuleSet;

pub const STREAM_OUT: &str = "out";
pub const STREAM_ERR: &str = "err";

const RECORD_QUEUE_CAPACITY: usize = 1024;

pub type Sink = Box<dyn AsyncWrite + Send + Unpin>;
/// A sink several workers write to. Each line is written whole while the lock is held.
pub type SharedSink = Arc<tokio::sync::Mutex<Sink>>;

pub fn shared_sink<W>(writer: W) -> SharedSink
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    Arc::new(tokio::sync::Mutex::new(Box::new(writer)))
}

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("no command given")]
    EmptyCommand,
    #[error("failed to start {program}: {source}")]
    Spawn { program: String, source: std::io::Error },
    #[error("child {0} was not piped")]
    MissingPipe(&'static str),
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("capture task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Whether matched stdout lines are echoed as `<n>: <line>` on the mirror sink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MirrorMode {
    None,
    #[default]
    Line,
}

impl FromStr for MirrorMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "none" | "off" | "" => Ok(MirrorMode::None),
            "line" => Ok(MirrorMode::Line),
            other => Err(format!("unknown mirror mode {other:?} (expected none or line)")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecOptions {
    pub capture_dir: PathBuf,
    pub only_matches: bool,
    pub mirror: MirrorMode,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self { capture_dir: std::env::temp_dir(), only_matches: false, mirror: MirrorMode::Line }
    }
}

/// Destinations for the real-time copy of captured output.
pub struct Passthrough {
    pub out: SharedSink,
    pub err: SharedSink,
    pub mirror: SharedSink,
}

impl Passthrough {
    /// The mirror shares the stderr sink so echoed lines never split a passthrough line.
    pub fn stdio() -> Self {
        let stderr = shared_sink(tokio::io::stderr());
        Self { out: shared_sink(tokio::io::stdout()), err: stderr.clone(), mirror: stderr }
    }
}

#[derive(Debug, Default)]
pub struct RunCounters {
    seq: AtomicU64,
    lines_total: AtomicU64,
    match_lines: AtomicU64,
    matches_total: AtomicU64,
    any_match: AtomicBool,
}

impl RunCounters {
    /// Claims the next 1-based sequence number.
    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn record_line(&self, matched: bool, matches: usize) {
        self.lines_total.fetch_add(1, Ordering::Relaxed);
        if matched {
            self.match_lines.fetch_add(1, Ordering::Relaxed);
            self.matches_total.fetch_add(matches as u64, Ordering::Relaxed);
            self.any_match.store(true, Ordering::Relaxed);
        }
    }

    fn fill(&self, summary: &mut Summary) {
        summary.lines_total = self.lines_total.load(Ordering::SeqCst);
        summary.match_lines = self.match_lines.load(Ordering::SeqCst);
        summary.matches_total = self.matches_total.load(Ordering::SeqCst);
    }

    pub fn any_match(&self) -> bool {
        self.any_match.load(Ordering::SeqCst)
    }
}

/// A finished capture. The record file is closed and complete.
#[derive(Debug, Clone)]
pub struct CaptureOutcome {
    pub capture_path: PathBuf,
    pub any_match: bool,
    pub summary: Summary,
}

impl CaptureOutcome {
    pub fn exit_code(&self) -> Option<i32> {
        self.summary.exit_code
    }
}

struct StreamJob {
    tag: &'static str,
    rules: Arc<RuleSet>,
    counters: Arc<RunCounters>,
    only_matches: bool,
    passthrough: Option<SharedSink>,
    mirror: Option<SharedSink>,
    records: mpsc::Sender<Record>,
}

/// Spawns `cmd`, captures both output streams until they close, then waits for the child.
pub async fn run(
    cmd: &[String],
    rules: Arc<RuleSet>,
    options: &ExecOptions,
    passthrough: Passthrough,
) -> Result<CaptureOutcome, ExecError> {
    let (program, args) = cmd.split_first().ok_or(ExecError::EmptyCommand)?;
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ExecError::Spawn { program: program.clone(), source })?;

    let stdout = child.stdout.take().ok_or(ExecError::MissingPipe("stdout"))?;
    let stderr = child.stderr.take().ok_or(ExecError::MissingPipe("stderr"))?;

    let writer = match CaptureWriter::create_temp(&options.capture_dir, EXEC_PREFIX) {
        Ok(writer) => writer,
        Err(err) => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(err.into());
        }
    };
    info!(path = %writer.path().display(), program = %program, "capturing command output");

    let counters = Arc::new(RunCounters::default());
    let (tx, rx) = mpsc::channel(RECORD_QUEUE_CAPACITY);
    let writer_task = spawn_record_writer(writer, rx);

    let Passthrough { out, err, mirror } = passthrough;
    let mirror = (options.mirror == MirrorMode::Line).then_some(mirror);
    let out_task = tokio::spawn(pump_stream(
        stdout,
        StreamJob {
            tag: STREAM_OUT,
            rules: rules.clone(),
            counters: counters.clone(),
            only_matches: options.only_matches,
            passthrough: Some(out),
            mirror,
            records: tx.clone(),
        },
    ));
    let err_task = tokio::spawn(pump_stream(
        stderr,
        StreamJob {
            tag: STREAM_ERR,
            rules: rules.clone(),
            counters: counters.clone(),
            only_matches: options.only_matches,
            passthrough: Some(err),
            mirror: None,
            records: tx,
        },
    ));

    out_task.await?;
    err_task.await?;
    let capture_path = writer_task.await??.close()?;

    let exit_code = match child.wait().await {
        Ok(status) => exit_code_of(status),
        Err(err) => {
            warn!(?err, "failed to wait for child");
            1
        }
    };

    let arg = shlex::try_join(cmd.iter().map(String::as_str)).unwrap_or_else(|_| cmd.join(" "));
    let mut summary = Summary::new(SourceMode::Exec, arg, &capture_path);
    counters.fill(&mut summary);
    summary.filtered = options.only_matches;
    summary.rules = rules.ids();
    summary.temp = false;
    summary.exit_code = Some(exit_code);
    debug!(
        lines = summary.lines_total,
        match_lines = summary.match_lines,
        exit_code,
        "command finished"
    );

    Ok(CaptureOutcome { capture_path, any_match: counters.any_match(), summary })
}

/// Captures a single untagged stream (stdin in pipe mode, a file in file mode).
pub async fn capture_reader<R>(
    reader: R,
    mode: SourceMode,
    arg: &str,
    rules: Arc<RuleSet>,
    options: &ExecOptions,
    passthrough: Option<SharedSink>,
    mirror: Option<SharedSink>,
) -> Result<CaptureOutcome, ExecError>
where
    R: AsyncRead + Unpin,
{
    let writer = CaptureWriter::create_temp(&options.capture_dir, PIPE_PREFIX)?;
    info!(path = %writer.path().display(), mode = mode.as_str(), "capturing stream");

    let counters = Arc::new(RunCounters::default());
    let (tx, rx) = mpsc::channel(RECORD_QUEUE_CAPACITY);
    let writer_task = spawn_record_writer(writer, rx);
    let mirror = if options.mirror == MirrorMode::Line { mirror } else { None };

    pump_stream(
        reader,
        StreamJob {
            tag: "",
            rules: rules.clone(),
            counters: counters.clone(),
            only_matches: options.only_matches,
            passthrough,
            mirror,
            records: tx,
        },
    )
    .await;
    let capture_path = writer_task.await??.close()?;

    let mut summary = Summary::new(mode, arg, &capture_path);
    counters.fill(&mut summary);
    summary.filtered = options.only_matches;
    summary.rules = rules.ids();
    summary.temp = mode == SourceMode::Pipe;

    Ok(CaptureOutcome { capture_path, any_match: counters.any_match(), summary })
}

fn spawn_record_writer(
    mut writer: CaptureWriter,
    mut rx: mpsc::Receiver<Record>,
) -> tokio::task::JoinHandle<Result<CaptureWriter, CaptureError>> {
    tokio::task::spawn_blocking(move || {
        while let Some(record) = rx.blocking_recv() {
            writer.encode(&record)?;
        }
        Ok(writer)
    })
}

async fn pump_stream<R>(reader: R, job: StreamJob)
where
    R: AsyncRead + Unpin,
{
    let StreamJob { tag, rules, counters, only_matches, mut passthrough, mut mirror, records } =
        job;
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut echo = Vec::new();
    let mut writer_open = true;

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) => {
                warn!(?err, stream = tag, "read failed, stopping stream");
                break;
            }
        }
        let line = trim_line_ending(&buf);

        if let Some(sink) = passthrough.as_ref() {
            echo.clear();
            echo.extend_from_slice(line);
            echo.push(b'\n');
            if let Err(err) = write_line(sink, &echo).await {
                debug!(?err, stream = tag, "passthrough closed");
                passthrough = None;
            }
        }

        let n = counters.next_seq();
        let text = String::from_utf8_lossy(line).into_owned();
        let (matched, matches) = rules.any_match(&text);
        counters.record_line(matched, matches);

        if matched {
            if let Some(sink) = mirror.as_ref() {
                let mirrored = format!("{n}: {text}\n");
                if let Err(err) = write_line(sink, mirrored.as_bytes()).await {
                    debug!(?err, stream = tag, "mirror closed");
                    mirror = None;
                }
            }
        }

        if writer_open && (matched || !only_matches) {
            let record = Record::new(n, text, matched, tag);
            if records.send(record).await.is_err() {
                warn!(stream = tag, "capture writer stopped, records are no longer persisted");
                writer_open = false;
            }
        }
    }
    debug!(stream = tag, "stream closed");
}

async fn write_line(sink: &SharedSink, line: &[u8]) -> std::io::Result<()> {
    let mut sink = sink.lock().await;
    sink.write_all(line).await?;
    sink.flush().await
}

fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}
