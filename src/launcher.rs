//! Opens the viewer for a pipe capture in a separate terminal window or tmux popup.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::process::{Command, Stdio};

use serde::Serialize;
use tracing::info;

pub const DEFAULT_TERMINAL_PREFIX: &str = "x-terminal-emulator -e";
pub const DEFAULT_TMUX_PREFIX: &str = "tmux display-popup -E -w 100% -h 100% --";
const MIN_TMUX_POPUP_VERSION: (u32, u32) = (3, 2);

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("invalid launcher prefix: {0:?}")]
    InvalidPrefix(String),
    #[error("cannot quote viewer argument: {0}")]
    Quote(String),
    #[error("failed to start {program}: {source}")]
    Spawn { program: String, source: std::io::Error },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchConfig {
    pub terminal: String,
    pub tmux: String,
    pub prefer_tmux: bool,
    pub force_tmux: bool,
    pub no_tmux: bool,
    pub dry_run: bool,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            terminal: DEFAULT_TERMINAL_PREFIX.to_string(),
            tmux: DEFAULT_TMUX_PREFIX.to_string(),
            prefer_tmux: true,
            force_tmux: false,
            no_tmux: false,
            dry_run: false,
        }
    }
}

/// Everything the detached viewer process needs to find and present the capture.
#[derive(Debug, Clone)]
pub struct ViewRequest<'a> {
    pub self_exe: &'a Path,
    pub capture: &'a Path,
    pub summary: &'a Path,
    pub config_path: Option<&'a Path>,
    pub title: &'a str,
    pub mouse: bool,
    pub keep_capture: bool,
    pub ttl_minutes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchTarget {
    Tmux,
    Terminal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchReport {
    pub target: LaunchTarget,
    pub argv: Vec<String>,
    pub spawned: bool,
}

impl LaunchReport {
    /// `DRY LAUNCH[ (tmux)]: <argv>`
    pub fn dry_run_line(&self) -> String {
        let label = match self.target {
            LaunchTarget::Tmux => "DRY LAUNCH (tmux)",
            LaunchTarget::Terminal => "DRY LAUNCH",
        };
        format!("{label}: {}", self.argv.join(" "))
    }
}

/// Shell command line that re-enters this binary in view mode.
pub fn inner_command(request: &ViewRequest<'_>) -> Result<String, LaunchError> {
    let mut args = vec![
        request.self_exe.display().to_string(),
        "--view".to_string(),
        "--capture".to_string(),
        request.capture.display().to_string(),
        "--meta".to_string(),
        request.summary.display().to_string(),
        "--title".to_string(),
        request.title.to_string(),
        if request.mouse { "--mouse" } else { "--no-mouse" }.to_string(),
        "--cleanup-ttl-minutes".to_string(),
        request.ttl_minutes.to_string(),
    ];
    if request.keep_capture {
        args.push("--keep-capture".to_string());
    }
    if let Some(path) = request.config_path {
        args.push("--config".to_string());
        args.push(path.display().to_string());
    }
    shlex::try_join(args.iter().map(String::as_str))
        .map_err(|err| LaunchError::Quote(err.to_string()))
}

pub fn in_tmux(env: &BTreeMap<String, String>) -> bool {
    env.contains_key("TMUX") && env.contains_key("TMUX_PANE")
}

pub fn choose_target<F>(
    config: &LaunchConfig,
    env: &BTreeMap<String, String>,
    tmux_version: F,
) -> LaunchTarget
where
    F: FnOnce() -> Option<(u32, u32)>,
{
    if config.no_tmux || config.tmux.trim().is_empty() {
        return LaunchTarget::Terminal;
    }
    if config.force_tmux {
        return LaunchTarget::Tmux;
    }
    if config.prefer_tmux
        && in_tmux(env)
        && tmux_version().is_some_and(|version| version >= MIN_TMUX_POPUP_VERSION)
    {
        return LaunchTarget::Tmux;
    }
    LaunchTarget::Terminal
}

/// Inputs behind a launch target choice, printed by `--debug-launch`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchDecision {
    pub tmux_env: bool,
    pub tmux_pane: bool,
    pub tmux_version: Option<(u32, u32)>,
    pub prefer_tmux: bool,
    pub force_tmux: bool,
    pub no_tmux: bool,
    pub target: LaunchTarget,
}

pub fn explain_target<F>(
    config: &LaunchConfig,
    env: &BTreeMap<String, String>,
    tmux_version: F,
) -> LaunchDecision
where
    F: FnOnce() -> Option<(u32, u32)>,
{
    let version = tmux_version();
    LaunchDecision {
        tmux_env: env.contains_key("TMUX"),
        tmux_pane: env.contains_key("TMUX_PANE"),
        tmux_version: version,
        prefer_tmux: config.prefer_tmux,
        force_tmux: config.force_tmux,
        no_tmux: config.no_tmux,
        target: choose_target(config, env, || version),
    }
}

impl fmt::Display for LaunchDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let set = |present: bool| if present { "set" } else { "unset" };
        let version = match self.tmux_version {
            Some((major, minor)) => format!("{major}.{minor}"),
            None => "unknown".to_string(),
        };
        let target = match self.target {
            LaunchTarget::Tmux => "tmux",
            LaunchTarget::Terminal => "terminal",
        };
        write!(
            f,
            "launch: TMUX={} TMUX_PANE={} tmux_version={version} prefer_tmux={} force_tmux={} no_tmux={} target={target}",
            set(self.tmux_env),
            set(self.tmux_pane),
            self.prefer_tmux,
            self.force_tmux,
            self.no_tmux,
        )
    }
}

/// Splits the prefix and appends the inner command as a single argument.
pub fn build_argv(prefix: &str, inner: &str) -> Result<Vec<String>, LaunchError> {
    let mut argv =
        shlex::split(prefix).ok_or_else(|| LaunchError::InvalidPrefix(prefix.to_string()))?;
    if argv.is_empty() {
        return Err(LaunchError::InvalidPrefix(prefix.to_string()));
    }
    argv.push(inner.to_string());
    Ok(argv)
}

pub fn spawn_viewer(
    config: &LaunchConfig,
    request: &ViewRequest<'_>,
    env: &BTreeMap<String, String>,
) -> Result<LaunchReport, LaunchError> {
    let inner = inner_command(request)?;
    let target = choose_target(config, env, tmux_version);
    let prefix = match target {
        LaunchTarget::Tmux => &config.tmux,
        LaunchTarget::Terminal => &config.terminal,
    };
    let argv = build_argv(prefix, &inner)?;
    if config.dry_run {
        return Ok(LaunchReport { target, argv, spawned: false });
    }

    let (program, args) = argv.split_first().ok_or_else(|| LaunchError::InvalidPrefix(prefix.clone()))?;
    Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|source| LaunchError::Spawn { program: program.clone(), source })?;
    info!(?target, program = %program, "launched viewer");
    Ok(LaunchReport { target, argv, spawned: true })
}

pub fn tmux_version() -> Option<(u32, u32)> {
    let output = Command::new("tmux").arg("-V").stderr(Stdio::null()).output().ok()?;
    parse_tmux_version(&String::from_utf8_lossy(&output.stdout))
}

/// Parses `tmux 3.3a` style output into `(major, minor)`.
pub fn parse_tmux_version(output: &str) -> Option<(u32, u32)> {
    let version = output.split_whitespace().nth(1)?;
    let version = version.trim_end_matches(|ch: char| !ch.is_ascii_digit());
    let mut parts = version.splitn(3, '.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}
