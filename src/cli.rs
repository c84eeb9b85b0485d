use std::{
    collections::BTreeMap,
    env,
    path::{Path, PathBuf},
    process::ExitCode,
};

use clap::{CommandFactory, Parser};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::capture::{read_summary, summary_path_for, write_summary, SourceMode, Summary};
use crate::cleanup::{remove_artifacts, sweep_orphans, TempArtifacts};
use crate::config::{locate_config, resolve_config, write_config_file, Config, PartialConfig};
use crate::editor::EditorLauncher;
use crate::execcap::{self, shared_sink, CaptureOutcome, MirrorMode, Passthrough};
use crate::launcher::{explain_target, spawn_viewer, tmux_version, ViewRequest};
use crate::terminal::{restore_terminal, TerminalScreen};
use crate::viewer::{run_viewer, Viewer, ViewerError};

const LOG_ENV: &str = "OT_LOG";
const DEFAULT_LOG_FILTER: &str = "warn";
const USAGE_EXIT: u8 = 2;

pub type DynError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser, Debug, Default)]
#[command(
    name = "output-tool",
    version,
    about = "Capture command output, flag file:line:col references and review them in a pager"
)]
pub struct Cli {
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Capture stdin and open the viewer in a new terminal window.
    #[arg(long)]
    pipe: bool,
    /// Capture a file and view it inline.
    #[arg(long, value_name = "PATH")]
    file: Option<PathBuf>,
    #[arg(long, hide = true)]
    view: bool,
    #[arg(long, hide = true, value_name = "PATH")]
    capture: Option<PathBuf>,
    #[arg(long, hide = true, value_name = "PATH")]
    meta: Option<PathBuf>,
    /// Persist only lines that match a rule.
    #[arg(long, visible_alias = "only-view-matches")]
    only_matches: bool,
    /// Skip the viewer when nothing matched.
    #[arg(long)]
    only_on_matches: bool,
    #[arg(long, value_name = "none|line")]
    match_stderr: Option<MirrorMode>,
    #[arg(long, visible_alias = "viewer-title")]
    title: Option<String>,
    #[arg(long)]
    gutter_width: Option<usize>,
    #[arg(long)]
    no_top_bar: bool,
    #[arg(long)]
    no_bottom_bar: bool,
    #[arg(long, overrides_with = "no_mouse")]
    mouse: bool,
    #[arg(long, overrides_with = "mouse")]
    no_mouse: bool,
    /// Stay on the main screen instead of the alternate one.
    #[arg(long)]
    no_alt: bool,
    #[arg(long, value_name = "N")]
    log_lines: Option<usize>,
    /// Editor command, e.g. "nvim" or "code --wait".
    #[arg(long)]
    editor: Option<String>,
    /// Terminal prefix used to open the viewer, e.g. "kitty -e".
    #[arg(long)]
    launcher: Option<String>,
    #[arg(long, conflicts_with = "no_tmux")]
    tmux: bool,
    #[arg(long)]
    no_tmux: bool,
    /// Print the launch command instead of running it.
    #[arg(long)]
    dry_launch: bool,
    /// Print the tmux/terminal decision inputs to stderr. Implies --dry-launch.
    #[arg(long)]
    debug_launch: bool,
    #[arg(long)]
    keep_capture: bool,
    #[arg(long, value_name = "MINUTES")]
    cleanup_ttl_minutes: Option<u64>,
    /// Refuse to treat trailing arguments as a command.
    #[arg(long)]
    no_exec: bool,
    #[arg(long)]
    print_config: bool,
    /// Print the config path that would be used and where it came from.
    #[arg(long)]
    which_config: bool,
    /// Write defaults plus the given flags to the config path, then exit.
    #[arg(long)]
    write_new_config: bool,
    /// Allow --write-new-config to replace an existing file.
    #[arg(long, requires = "write_new_config")]
    force: bool,
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "CMD")]
    cmd: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Mode {
    Exec(Vec<String>),
    Pipe,
    File(PathBuf),
    View { capture: PathBuf, meta: Option<PathBuf> },
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
enum UsageError {
    #[error("nothing to do: give a command, --pipe, --file PATH or --view")]
    NoMode,
    #[error("{0} cannot be combined with {1}")]
    Conflict(&'static str, &'static str),
    #[error("--no-exec is set but a command was given")]
    ExecDisabled,
    #[error("--view requires --capture PATH")]
    MissingCapture,
}

fn select_mode(cli: &Cli) -> Result<Mode, UsageError> {
    let mut selected = Vec::new();
    if cli.pipe {
        selected.push("--pipe");
    }
    if cli.file.is_some() {
        selected.push("--file");
    }
    if cli.view {
        selected.push("--view");
    }
    if !cli.cmd.is_empty() {
        if cli.no_exec {
            return Err(UsageError::ExecDisabled);
        }
        selected.push("a command");
    }
    match selected.as_slice() {
        [] => Err(UsageError::NoMode),
        [first, second, ..] => Err(UsageError::Conflict(*first, *second)),
        [_] if cli.pipe => Ok(Mode::Pipe),
        [_] if cli.view => {
            let capture = cli.capture.clone().ok_or(UsageError::MissingCapture)?;
            Ok(Mode::View { capture, meta: cli.meta.clone() })
        }
        [_] => match &cli.file {
            Some(path) => Ok(Mode::File(path.clone())),
            None => Ok(Mode::Exec(cli.cmd.clone())),
        },
    }
}

fn cli_overrides(cli: &Cli) -> PartialConfig {
    let mouse = if cli.no_mouse {
        Some(false)
    } else if cli.mouse {
        Some(true)
    } else {
        None
    };
    PartialConfig {
        only_matches: cli.only_matches.then_some(true),
        only_on_matches: cli.only_on_matches.then_some(true),
        mirror: cli.match_stderr,
        title: cli.title.clone(),
        gutter_width: cli.gutter_width,
        top_bar: cli.no_top_bar.then_some(false),
        bottom_bar: cli.no_bottom_bar.then_some(false),
        mouse,
        no_alt: cli.no_alt.then_some(true),
        log_lines: cli.log_lines,
        editor_command: cli.editor.clone(),
        launcher_terminal: cli.launcher.clone(),
        force_tmux: cli.tmux.then_some(true),
        no_tmux: cli.no_tmux.then_some(true),
        dry_launch: (cli.dry_launch || cli.debug_launch).then_some(true),
        keep_capture: cli.keep_capture.then_some(true),
        ttl_minutes: cli.cleanup_ttl_minutes,
        ..PartialConfig::default()
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    // stdout carries the captured output; logs go to stderr.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

pub async fn run() -> Result<ExitCode, DynError> {
    init_tracing();

    let cli = Cli::parse();
    let cwd = env::current_dir()?;
    let env_map: BTreeMap<String, String> = env::vars().collect();

    if cli.which_config {
        println!("{}", locate_config(cli.config.as_deref(), &cwd, &env_map));
        return Ok(ExitCode::SUCCESS);
    }
    if cli.write_new_config {
        let location = locate_config(cli.config.as_deref(), &cwd, &env_map);
        // Defaults plus flags only; the current file and OT_* do not leak into the new one.
        let config = Config::from_partial(cli_overrides(&cli))?;
        let status = write_config_file(&location.path, &config, cli.force)?;
        println!("{}", status.report(&location.path));
        return Ok(ExitCode::SUCCESS);
    }

    let (config, config_path) =
        resolve_config(cli_overrides(&cli), cli.config.as_deref(), &cwd, &env_map)?;

    match &config_path {
        Some(path) => info!(path = %path.display(), "loaded config file"),
        None => debug!("no output-tool.json found, using defaults and env/cli overrides"),
    }

    if cli.print_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(ExitCode::SUCCESS);
    }

    let mode = match select_mode(&cli) {
        Ok(mode) => mode,
        Err(err) => {
            eprintln!("output-tool: {err}");
            eprintln!("{}", Cli::command().render_usage());
            return Ok(ExitCode::from(USAGE_EXIT));
        }
    };
    debug!(?mode, rules = ?config.rule_set.ids(), "resolved config");

    match mode {
        Mode::Exec(cmd) => run_exec(&config, &cmd).await,
        Mode::Pipe => run_pipe(&config, config_path.as_deref(), &env_map, cli.debug_launch).await,
        Mode::File(path) => run_file(&config, &path).await,
        Mode::View { capture, meta } => run_view(&config, capture, meta).await,
    }
}

async fn run_exec(config: &Config, cmd: &[String]) -> Result<ExitCode, DynError> {
    let outcome =
        execcap::run(cmd, config.rule_set.clone(), &config.exec_options(), Passthrough::stdio())
            .await?;
    let code = exit_code(outcome.exit_code().unwrap_or(1));
    let Some(summary_path) = finish_capture(config, &outcome)? else {
        return Ok(code);
    };
    view_inline(config, outcome.capture_path, Some(summary_path), Some(outcome.summary)).await?;
    Ok(code)
}

async fn run_pipe(
    config: &Config,
    config_path: Option<&Path>,
    env_map: &BTreeMap<String, String>,
    debug_launch: bool,
) -> Result<ExitCode, DynError> {
    let outcome = execcap::capture_reader(
        tokio::io::stdin(),
        SourceMode::Pipe,
        "",
        config.rule_set.clone(),
        &config.exec_options(),
        Some(shared_sink(tokio::io::stdout())),
        Some(shared_sink(tokio::io::stderr())),
    )
    .await?;
    let Some(summary_path) = finish_capture(config, &outcome)? else {
        return Ok(ExitCode::SUCCESS);
    };

    let self_exe = env::current_exe()?;
    let config_path = config_path.map(std::path::absolute).transpose()?;
    let request = ViewRequest {
        self_exe: &self_exe,
        capture: &outcome.capture_path,
        summary: &summary_path,
        config_path: config_path.as_deref(),
        title: &config.viewer.title,
        mouse: config.viewer.mouse,
        keep_capture: config.cleanup.keep_capture,
        ttl_minutes: config.cleanup.ttl_minutes,
    };
    if debug_launch {
        eprintln!("{}", explain_target(&config.launcher, env_map, tmux_version));
    }
    match spawn_viewer(&config.launcher, &request, env_map) {
        Ok(report) if !report.spawned => println!("{}", report.dry_run_line()),
        Ok(_) => {}
        Err(err) => {
            remove_artifacts(&outcome.capture_path, &summary_path);
            return Err(err.into());
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn run_file(config: &Config, path: &Path) -> Result<ExitCode, DynError> {
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|err| format!("failed to open {}: {err}", path.display()))?;
    let outcome = execcap::capture_reader(
        file,
        SourceMode::File,
        &path.display().to_string(),
        config.rule_set.clone(),
        &config.exec_options(),
        None,
        None,
    )
    .await?;
    let Some(summary_path) = finish_capture(config, &outcome)? else {
        return Ok(ExitCode::SUCCESS);
    };
    view_inline(config, outcome.capture_path, Some(summary_path), Some(outcome.summary)).await?;
    Ok(ExitCode::SUCCESS)
}

async fn run_view(
    config: &Config,
    capture: PathBuf,
    meta: Option<PathBuf>,
) -> Result<ExitCode, DynError> {
    sweep_orphans(&config.capture_dir, config.cleanup.ttl_minutes);
    let summary = meta.as_deref().and_then(|path| match read_summary(path) {
        Ok(summary) => Some(summary),
        Err(err) => {
            warn!(%err, path = %path.display(), "ignoring unreadable summary");
            None
        }
    });
    view_inline(config, capture, meta, summary).await?;
    Ok(ExitCode::SUCCESS)
}

/// Writes the summary next to the capture. Returns `None` when `only_on_matches` is set
/// and nothing matched, after removing both files.
fn finish_capture(config: &Config, outcome: &CaptureOutcome) -> Result<Option<PathBuf>, DynError> {
    let summary_path = summary_path_for(&outcome.capture_path);
    write_summary(&summary_path, &outcome.summary)?;
    if config.only_on_matches && !outcome.any_match {
        info!(path = %outcome.capture_path.display(), "no matches, skipping viewer");
        remove_artifacts(&outcome.capture_path, &summary_path);
        return Ok(None);
    }
    Ok(Some(summary_path))
}

async fn view_inline(
    config: &Config,
    capture: PathBuf,
    summary_path: Option<PathBuf>,
    summary: Option<Summary>,
) -> Result<(), DynError> {
    let artifacts = TempArtifacts::new(
        &capture,
        summary_path.as_deref(),
        summary.as_ref(),
        &config.capture_dir,
        config.cleanup.keep_capture,
    );

    let viewer_config = config.viewer.clone();
    let rules = config.rule_set.clone();
    let editor = EditorLauncher::new(rules.clone(), config.editor.clone());
    let mut task = tokio::task::spawn_blocking(move || -> Result<(), ViewerError> {
        let no_alt = viewer_config.no_alt;
        let mut viewer =
            Viewer::from_capture(viewer_config, &capture, summary, rules)?.with_hook(Box::new(editor));
        let mut screen = TerminalScreen::enter(no_alt)?;
        run_viewer(&mut viewer, &mut screen)
    });

    tokio::select! {
        result = &mut task => {
            drop(artifacts);
            result??;
            Ok(())
        }
        signal = shutdown_signal() => {
            warn!(signal, "interrupted, removing temp capture");
            restore_terminal();
            drop(artifacts);
            // The blocking viewer thread cannot be cancelled, so leave without joining it.
            std::process::exit(128 + signal);
        }
    }
}

#[cfg(unix)]
async fn shutdown_signal() -> i32 {
    use tokio::signal::unix::{signal, SignalKind};

    let (Ok(mut term), Ok(mut hangup)) =
        (signal(SignalKind::terminate()), signal(SignalKind::hangup()))
    else {
        return std::future::pending().await;
    };
    tokio::select! {
        _ = term.recv() => 15,
        _ = hangup.recv() => 1,
        _ = tokio::signal::ctrl_c() => 2,
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> i32 {
    match tokio::signal::ctrl_c().await {
        Ok(()) => 2,
        Err(_) => std::future::pending().await,
    }
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn cli_parses_flags() {
        let cli = Cli::parse_from([
            "output-tool",
            "--config",
            "config.json",
            "--only-matches",
            "--match-stderr",
            "none",
            "--title",
            "build",
            "--gutter-width",
            "4",
            "--no-mouse",
            "--editor",
            "nvim",
            "--no-tmux",
            "--cleanup-ttl-minutes",
            "9",
            "--",
            "cargo",
            "build",
            "--release",
        ]);

        assert_eq!(cli.config.as_deref(), Some(Path::new("config.json")));
        assert!(cli.only_matches);
        assert_eq!(cli.match_stderr, Some(MirrorMode::None));
        assert_eq!(cli.title.as_deref(), Some("build"));
        assert_eq!(cli.gutter_width, Some(4));
        assert!(cli.no_mouse);
        assert!(!cli.mouse);
        assert_eq!(cli.editor.as_deref(), Some("nvim"));
        assert!(cli.no_tmux);
        assert_eq!(cli.cleanup_ttl_minutes, Some(9));
        assert_eq!(cli.cmd, vec!["cargo", "build", "--release"]);
    }

    #[test]
    fn command_without_separator_keeps_its_flags() {
        let cli = Cli::parse_from(["output-tool", "--only-on-matches", "ls", "-la", "--color"]);
        assert!(cli.only_on_matches);
        assert_eq!(cli.cmd, vec!["ls", "-la", "--color"]);
        assert_eq!(select_mode(&cli), Ok(Mode::Exec(vec!["ls".into(), "-la".into(), "--color".into()])));
    }

    #[test]
    fn legacy_flag_names_are_accepted() {
        let cli = Cli::parse_from(["output-tool", "--only-view-matches", "--viewer-title", "x", "--pipe"]);
        assert!(cli.only_matches);
        assert_eq!(cli.title.as_deref(), Some("x"));
    }

    #[test]
    fn tmux_flags_conflict() {
        assert!(Cli::try_parse_from(["output-tool", "--tmux", "--no-tmux", "--pipe"]).is_err());
    }

    #[rstest]
    #[case(&["output-tool", "--pipe"], Ok(Mode::Pipe))]
    #[case(&["output-tool", "--file", "build.log"], Ok(Mode::File(PathBuf::from("build.log"))))]
    #[case(
        &["output-tool", "--view", "--capture", "/tmp/ot-1.jsonl"],
        Ok(Mode::View { capture: PathBuf::from("/tmp/ot-1.jsonl"), meta: None })
    )]
    #[case(&["output-tool"], Err(UsageError::NoMode))]
    #[case(&["output-tool", "--view"], Err(UsageError::MissingCapture))]
    #[case(&["output-tool", "--pipe", "--file", "x"], Err(UsageError::Conflict("--pipe", "--file")))]
    #[case(&["output-tool", "--pipe", "make"], Err(UsageError::Conflict("--pipe", "a command")))]
    #[case(&["output-tool", "--no-exec", "make"], Err(UsageError::ExecDisabled))]
    fn selects_exactly_one_mode(#[case] args: &[&str], #[case] expected: Result<Mode, UsageError>) {
        let cli = Cli::parse_from(args);
        assert_eq!(select_mode(&cli), expected);
    }

    #[test]
    fn unset_flags_do_not_override_lower_layers() {
        let partial = cli_overrides(&Cli::default());
        assert!(partial.only_matches.is_none());
        assert!(partial.mouse.is_none());
        assert!(partial.top_bar.is_none());
        assert!(partial.keep_capture.is_none());
        assert!(partial.dry_launch.is_none());
    }

    #[test]
    fn set_flags_become_overrides() {
        let cli = Cli::parse_from([
            "output-tool",
            "--no-top-bar",
            "--mouse",
            "--tmux",
            "--dry-launch",
            "--keep-capture",
            "--launcher",
            "kitty -e",
            "--pipe",
        ]);
        let partial = cli_overrides(&cli);
        assert_eq!(partial.top_bar, Some(false));
        assert_eq!(partial.bottom_bar, None);
        assert_eq!(partial.mouse, Some(true));
        assert_eq!(partial.force_tmux, Some(true));
        assert_eq!(partial.dry_launch, Some(true));
        assert_eq!(partial.keep_capture, Some(true));
        assert_eq!(partial.launcher_terminal.as_deref(), Some("kitty -e"));
    }

    #[test]
    fn debug_launch_implies_dry_launch() {
        let cli = Cli::parse_from(["output-tool", "--debug-launch", "--pipe"]);
        assert_eq!(cli_overrides(&cli).dry_launch, Some(true));
    }

    #[test]
    fn force_only_goes_with_write_new_config() {
        assert!(Cli::try_parse_from(["output-tool", "--force"]).is_err());
        let cli = Cli::parse_from(["output-tool", "--write-new-config", "--force", "--no-mouse"]);
        assert!(cli.write_new_config && cli.force);
        assert_eq!(cli_overrides(&cli).mouse, Some(false));
    }

    #[rstest]
    #[case(0, ExitCode::SUCCESS)]
    #[case(3, ExitCode::from(3))]
    #[case(143, ExitCode::from(143))]
    #[case(-1, ExitCode::from(1))]
    fn exit_codes_fit_a_byte(#[case] code: i32, #[case] expected: ExitCode) {
        assert_eq!(exit_code(code), expected);
    }
}
