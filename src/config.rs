//! Layered configuration: built-in defaults, then `output-tool.json`, then `OT_*`
//! environment variables, then command line flags.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cleanup::{CleanupConfig, DEFAULT_TTL_MINUTES};
use crate::editor::EditorConfig;
use crate::execcap::{ExecOptions, MirrorMode};
use crate::launcher::{LaunchConfig, DEFAULT_TERMINAL_PREFIX, DEFAULT_TMUX_PREFIX};
use crate::rules::{RuleError, RuleSet, RuleSpec};
use crate::viewer::{
    ViewerConfig, DEFAULT_DOUBLE_CLICK_MS, DEFAULT_GUTTER_WIDTH, DEFAULT_LOG_LINES, DEFAULT_TITLE,
    MIN_GUTTER_WIDTH,
};

pub const CONFIG_FILE_NAME: &str = "output-tool.json";
pub const CONFIG_ENV: &str = "OT_CONFIG";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("failed to parse config file {path}: {source}")]
    ParseFile { path: PathBuf, source: serde_json::Error },
    #[error("config file not found: {path}")]
    MissingConfig { path: PathBuf },
    #[error("failed to write config file {path}: {source}")]
    WriteFile { path: PathBuf, source: std::io::Error },
    #[error("failed to encode config: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("invalid value for {name}: {value}")]
    InvalidEnv { name: String, value: String },
    #[error("invalid value for {name}: {value}")]
    InvalidOption { name: String, value: String },
    #[error(transparent)]
    Rules(#[from] RuleError),
}

#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub rules: Vec<RuleSpec>,
    #[serde(skip)]
    pub rule_set: Arc<RuleSet>,
    pub only_matches: bool,
    pub only_on_matches: bool,
    #[serde(rename = "match_stderr")]
    pub mirror: MirrorMode,
    pub capture_dir: PathBuf,
    pub viewer: ViewerConfig,
    pub editor: EditorConfig,
    pub launcher: LaunchConfig,
    pub cleanup: CleanupConfig,
}

impl Config {
    pub fn from_partial(partial: PartialConfig) -> Result<Self, ConfigError> {
        let rules = partial.rules.unwrap_or_else(|| vec![RuleSpec::default_rule()]);
        let rule_set = Arc::new(RuleSet::compile(&rules)?);
        let capture_dir = partial.capture_dir.unwrap_or_else(std::env::temp_dir);

        let mut editor = partial
            .editor_command
            .as_deref()
            .map(EditorConfig::for_command)
            .unwrap_or_default();
        if partial.editor_file.is_some() {
            editor.file = partial.editor_file;
        }
        if partial.editor_file_line.is_some() {
            editor.file_line = partial.editor_file_line;
        }
        if partial.editor_file_line_col.is_some() {
            editor.file_line_col = partial.editor_file_line_col;
        }
        if let Some(pretty) = partial.editor_pretty_json {
            editor.pretty_json = pretty;
        }
        if let Some(wait) = partial.editor_wait {
            editor.wait = wait;
        }
        editor.scratch_dir = capture_dir.clone();

        Ok(Self {
            rules,
            rule_set,
            only_matches: partial.only_matches.unwrap_or(false),
            only_on_matches: partial.only_on_matches.unwrap_or(false),
            mirror: partial.mirror.unwrap_or_default(),
            capture_dir,
            viewer: ViewerConfig {
                title: partial.title.unwrap_or_else(|| DEFAULT_TITLE.to_string()),
                gutter_width: partial.gutter_width.unwrap_or(DEFAULT_GUTTER_WIDTH).max(MIN_GUTTER_WIDTH),
                top_bar: partial.top_bar.unwrap_or(true),
                bottom_bar: partial.bottom_bar.unwrap_or(true),
                mouse: partial.mouse.unwrap_or(true),
                no_alt: partial.no_alt.unwrap_or(false),
                log_lines_max: partial.log_lines.unwrap_or(DEFAULT_LOG_LINES),
                double_click_ms: partial.double_click_ms.unwrap_or(DEFAULT_DOUBLE_CLICK_MS),
            },
            editor,
            launcher: LaunchConfig {
                terminal: partial
                    .launcher_terminal
                    .unwrap_or_else(|| DEFAULT_TERMINAL_PREFIX.to_string()),
                tmux: partial.launcher_tmux.unwrap_or_else(|| DEFAULT_TMUX_PREFIX.to_string()),
                prefer_tmux: partial.prefer_tmux.unwrap_or(true),
                force_tmux: partial.force_tmux.unwrap_or(false),
                no_tmux: partial.no_tmux.unwrap_or(false),
                dry_run: partial.dry_launch.unwrap_or(false),
            },
            cleanup: CleanupConfig {
                keep_capture: partial.keep_capture.unwrap_or(false),
                ttl_minutes: partial.ttl_minutes.unwrap_or(DEFAULT_TTL_MINUTES),
            },
        })
    }

    pub fn exec_options(&self) -> ExecOptions {
        ExecOptions {
            capture_dir: self.capture_dir.clone(),
            only_matches: self.only_matches,
            mirror: self.mirror,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct PartialConfig {
    pub rules: Option<Vec<RuleSpec>>,
    pub only_matches: Option<bool>,
    pub only_on_matches: Option<bool>,
    pub mirror: Option<MirrorMode>,
    pub capture_dir: Option<PathBuf>,
    pub title: Option<String>,
    pub gutter_width: Option<usize>,
    pub top_bar: Option<bool>,
    pub bottom_bar: Option<bool>,
    pub mouse: Option<bool>,
    pub no_alt: Option<bool>,
    pub log_lines: Option<usize>,
    pub double_click_ms: Option<u64>,
    /// A bare editor command; expands to the default templates for that command.
    pub editor_command: Option<String>,
    pub editor_file: Option<String>,
    pub editor_file_line: Option<String>,
    pub editor_file_line_col: Option<String>,
    pub editor_pretty_json: Option<bool>,
    pub editor_wait: Option<bool>,
    pub launcher_terminal: Option<String>,
    pub launcher_tmux: Option<String>,
    pub prefer_tmux: Option<bool>,
    pub force_tmux: Option<bool>,
    pub no_tmux: Option<bool>,
    pub dry_launch: Option<bool>,
    pub keep_capture: Option<bool>,
    pub ttl_minutes: Option<u64>,
}

macro_rules! take_some {
    ($self:ident, $other:ident, $($field:ident),+ $(,)?) => {
        $(
            if $other.$field.is_some() {
                $self.$field = $other.$field;
            }
        )+
    };
}

impl PartialConfig {
    pub fn merge(&mut self, other: PartialConfig) {
        // A command from a higher layer replaces templates from lower layers.
        if other.editor_command.is_some() {
            self.editor_file = None;
            self.editor_file_line = None;
            self.editor_file_line_col = None;
        }
        take_some!(
            self,
            other,
            rules,
            only_matches,
            only_on_matches,
            mirror,
            capture_dir,
            title,
            gutter_width,
            top_bar,
            bottom_bar,
            mouse,
            no_alt,
            log_lines,
            double_click_ms,
            editor_command,
            editor_file,
            editor_file_line,
            editor_file_line_col,
            editor_pretty_json,
            editor_wait,
            launcher_terminal,
            launcher_tmux,
            prefer_tmux,
            force_tmux,
            no_tmux,
            dry_launch,
            keep_capture,
            ttl_minutes,
        );
    }

    fn has_editor_templates(&self) -> bool {
        self.editor_file.is_some()
            || self.editor_file_line.is_some()
            || self.editor_file_line_col.is_some()
    }
}

/// An editor template written either as one shell-like string or as an argv list.
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum TemplateValue {
    Line(String),
    Argv(Vec<String>),
}

fn template_line(name: &str, value: Option<TemplateValue>) -> Result<Option<String>, ConfigError> {
    match value {
        None => Ok(None),
        Some(TemplateValue::Line(line)) => Ok(Some(line)),
        Some(TemplateValue::Argv(argv)) => shlex::try_join(argv.iter().map(String::as_str))
            .map(Some)
            .map_err(|_| ConfigError::InvalidOption {
                name: name.to_string(),
                value: format!("{argv:?}"),
            }),
    }
}

#[derive(Debug, Serialize, Deserialize, Default)]
#[serde(default)]
struct FileConfig {
    rules: Option<Vec<RuleSpec>>,
    only_matches: Option<bool>,
    only_on_matches: Option<bool>,
    match_stderr: Option<MirrorMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    capture_dir: Option<PathBuf>,
    viewer: FileViewerConfig,
    editor: FileEditorConfig,
    launcher: FileLauncherConfig,
    cleanup: FileCleanupConfig,
}

#[derive(Debug, Serialize, Deserialize, Default)]
#[serde(default)]
struct FileViewerConfig {
    title: Option<String>,
    gutter_width: Option<usize>,
    top_bar: Option<bool>,
    bottom_bar: Option<bool>,
    mouse: Option<bool>,
    no_alt: Option<bool>,
    log_lines: Option<usize>,
    double_click_ms: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
#[serde(default)]
struct FileEditorConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    file: Option<TemplateValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    file_line: Option<TemplateValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    file_line_col: Option<TemplateValue>,
    pretty_json: Option<bool>,
    wait: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
#[serde(default)]
struct FileLauncherConfig {
    terminal: Option<String>,
    tmux: Option<String>,
    prefer_tmux: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
#[serde(default)]
struct FileCleanupConfig {
    keep_capture: Option<bool>,
    ttl_minutes: Option<u64>,
}

impl FileConfig {
    /// The file form of an effective config, as written by `--write-new-config`.
    fn from_config(config: &Config) -> Self {
        let capture_dir =
            (config.capture_dir != std::env::temp_dir()).then(|| config.capture_dir.clone());
        let editor = &config.editor;
        FileConfig {
            rules: Some(config.rules.clone()),
            only_matches: Some(config.only_matches),
            only_on_matches: Some(config.only_on_matches),
            match_stderr: Some(config.mirror),
            capture_dir,
            viewer: FileViewerConfig {
                title: Some(config.viewer.title.clone()),
                gutter_width: Some(config.viewer.gutter_width),
                top_bar: Some(config.viewer.top_bar),
                bottom_bar: Some(config.viewer.bottom_bar),
                mouse: Some(config.viewer.mouse),
                no_alt: Some(config.viewer.no_alt),
                log_lines: Some(config.viewer.log_lines_max),
                double_click_ms: Some(config.viewer.double_click_ms),
            },
            editor: FileEditorConfig {
                command: None,
                file: editor.file.clone().map(TemplateValue::Line),
                file_line: editor.file_line.clone().map(TemplateValue::Line),
                file_line_col: editor.file_line_col.clone().map(TemplateValue::Line),
                pretty_json: Some(editor.pretty_json),
                wait: Some(editor.wait),
            },
            launcher: FileLauncherConfig {
                terminal: Some(config.launcher.terminal.clone()),
                tmux: Some(config.launcher.tmux.clone()),
                prefer_tmux: Some(config.launcher.prefer_tmux),
            },
            cleanup: FileCleanupConfig {
                keep_capture: Some(config.cleanup.keep_capture),
                ttl_minutes: Some(config.cleanup.ttl_minutes),
            },
        }
    }

    fn into_partial(self) -> Result<PartialConfig, ConfigError> {
        let FileConfig { viewer, editor, launcher, cleanup, .. } = self;
        Ok(PartialConfig {
            rules: self.rules,
            only_matches: self.only_matches,
            only_on_matches: self.only_on_matches,
            mirror: self.match_stderr,
            capture_dir: self.capture_dir,
            title: viewer.title,
            gutter_width: viewer.gutter_width,
            top_bar: viewer.top_bar,
            bottom_bar: viewer.bottom_bar,
            mouse: viewer.mouse,
            no_alt: viewer.no_alt,
            log_lines: viewer.log_lines,
            double_click_ms: viewer.double_click_ms,
            editor_command: editor.command,
            editor_file: template_line("editor.file", editor.file)?,
            editor_file_line: template_line("editor.file_line", editor.file_line)?,
            editor_file_line_col: template_line("editor.file_line_col", editor.file_line_col)?,
            editor_pretty_json: editor.pretty_json,
            editor_wait: editor.wait,
            launcher_terminal: launcher.terminal,
            launcher_tmux: launcher.tmux,
            prefer_tmux: launcher.prefer_tmux,
            keep_capture: cleanup.keep_capture,
            ttl_minutes: cleanup.ttl_minutes,
            ..PartialConfig::default()
        })
    }
}

pub fn env_overrides(env: &BTreeMap<String, String>) -> Result<PartialConfig, ConfigError> {
    let mut partial = PartialConfig::default();
    if let Some(value) = env.get("OT_ONLY_MATCHES") {
        partial.only_matches = Some(parse_bool("OT_ONLY_MATCHES", value)?);
    }
    if let Some(value) = env.get("OT_ONLY_ON_MATCHES") {
        partial.only_on_matches = Some(parse_bool("OT_ONLY_ON_MATCHES", value)?);
    }
    if let Some(value) = env.get("OT_MATCH_STDERR") {
        partial.mirror = Some(value.parse().map_err(|_| ConfigError::InvalidEnv {
            name: "OT_MATCH_STDERR".to_string(),
            value: value.clone(),
        })?);
    }
    if let Some(value) = env.get("OT_TITLE") {
        partial.title = Some(value.clone());
    }
    if let Some(value) = env.get("OT_GUTTER_WIDTH") {
        partial.gutter_width = Some(parse_usize("OT_GUTTER_WIDTH", value)?);
    }
    if let Some(value) = env.get("OT_MOUSE") {
        partial.mouse = Some(parse_bool("OT_MOUSE", value)?);
    }
    if let Some(value) = env.get("OT_EDITOR") {
        if !value.trim().is_empty() {
            partial.editor_command = Some(value.clone());
        }
    }
    if let Some(value) = env.get("OT_LAUNCHER") {
        if !value.trim().is_empty() {
            partial.launcher_terminal = Some(value.clone());
        }
    }
    if let Some(value) = env.get("OT_KEEP_CAPTURE") {
        partial.keep_capture = Some(parse_bool("OT_KEEP_CAPTURE", value)?);
    }
    if let Some(value) = env.get("OT_CLEANUP_TTL_MINUTES") {
        partial.ttl_minutes = Some(parse_u64("OT_CLEANUP_TTL_MINUTES", value)?);
    }
    if let Some(value) = env.get("OT_CAPTURE_DIR") {
        if !value.trim().is_empty() {
            partial.capture_dir = Some(PathBuf::from(value));
        }
    }
    Ok(partial)
}

pub fn parse_usize(name: &str, value: &str) -> Result<usize, ConfigError> {
    value
        .trim()
        .parse::<usize>()
        .map_err(|_| ConfigError::InvalidEnv { name: name.to_string(), value: value.to_string() })
}

pub fn parse_u64(name: &str, value: &str) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|_| ConfigError::InvalidEnv { name: name.to_string(), value: value.to_string() })
}

pub fn parse_bool(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnv { name: name.to_string(), value: value.to_string() }),
    }
}

pub fn load_config_file(path: &Path) -> Result<PartialConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;
    let parsed: FileConfig = serde_json::from_str(&contents)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })?;
    parsed.into_partial()
}

/// Where the config path came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigOrigin {
    Flag,
    Env,
    Search,
    /// Nothing found; the path is where a new config would be written.
    Default,
}

impl ConfigOrigin {
    pub fn as_str(self) -> &'static str {
        match self {
            ConfigOrigin::Flag => "flag",
            ConfigOrigin::Env => "env",
            ConfigOrigin::Search => "search",
            ConfigOrigin::Default => "default",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigLocation {
    pub path: PathBuf,
    pub origin: ConfigOrigin,
}

impl fmt::Display for ConfigLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "config: path={} origin={}", self.path.display(), self.origin.as_str())
    }
}

/// `--config`, then `OT_CONFIG`, then the nearest `output-tool.json` above `cwd`.
/// Existence is not checked for the first two.
pub fn locate_config(
    explicit: Option<&Path>,
    cwd: &Path,
    env: &BTreeMap<String, String>,
) -> ConfigLocation {
    if let Some(path) = explicit {
        return ConfigLocation { path: path.to_path_buf(), origin: ConfigOrigin::Flag };
    }
    if let Some(value) = env.get(CONFIG_ENV).filter(|value| !value.trim().is_empty()) {
        return ConfigLocation { path: PathBuf::from(value), origin: ConfigOrigin::Env };
    }
    match find_config_path(cwd) {
        Some(path) => ConfigLocation { path, origin: ConfigOrigin::Search },
        None => ConfigLocation { path: cwd.join(CONFIG_FILE_NAME), origin: ConfigOrigin::Default },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    Written,
    Overwritten,
    Exists,
}

impl WriteStatus {
    pub fn report(self, path: &Path) -> String {
        match self {
            WriteStatus::Written => format!("config: written {}", path.display()),
            WriteStatus::Overwritten => format!("config: overwritten {} (forced)", path.display()),
            WriteStatus::Exists => format!("config: not written (exists) {}", path.display()),
        }
    }
}

/// Writes `config` in file form. An existing file is only replaced when `force` is set.
pub fn write_config_file(
    path: &Path,
    config: &Config,
    force: bool,
) -> Result<WriteStatus, ConfigError> {
    let existed = path.exists();
    if existed && !force {
        return Ok(WriteStatus::Exists);
    }
    let write_err = |source| ConfigError::WriteFile { path: path.to_path_buf(), source };
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(write_err)?;
    }

    let mut body = serde_json::to_vec_pretty(&FileConfig::from_config(config))
        .map_err(ConfigError::Encode)?;
    body.push(b'\n');

    let mut tmp_name = OsString::from(path.as_os_str());
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);
    let result = fs::File::create(&tmp).and_then(|mut file| {
        file.write_all(&body)?;
        file.sync_all()
    });
    if let Err(source) = result {
        let _ = fs::remove_file(&tmp);
        return Err(write_err(source));
    }
    fs::rename(&tmp, path).map_err(write_err)?;
    Ok(if existed { WriteStatus::Overwritten } else { WriteStatus::Written })
}

pub fn find_config_path(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();
    loop {
        let candidate = current.join(CONFIG_FILE_NAME);
        if candidate.is_file() {
            return Some(candidate);
        }
        if !current.pop() {
            break;
        }
    }
    None
}

/// Resolves the effective config. `overrides` are the command line values, `explicit` the
/// `--config` path if one was given.
pub fn resolve_config(
    overrides: PartialConfig,
    explicit: Option<&Path>,
    cwd: &Path,
    env: &BTreeMap<String, String>,
) -> Result<(Config, Option<PathBuf>), ConfigError> {
    let mut partial = PartialConfig::default();

    let location = locate_config(explicit, cwd, env);
    let config_path = match location.origin {
        ConfigOrigin::Default => None,
        ConfigOrigin::Search => Some(location.path),
        ConfigOrigin::Flag | ConfigOrigin::Env => {
            if !location.path.is_file() {
                return Err(ConfigError::MissingConfig { path: location.path });
            }
            Some(location.path)
        }
    };

    if let Some(path) = config_path.as_ref() {
        let file_partial = load_config_file(path)?;
        partial.merge(file_partial);
    }

    let env_partial = env_overrides(env)?;
    partial.merge(env_partial);
    partial.merge(overrides);

    if partial.editor_command.is_none() && !partial.has_editor_templates() {
        partial.editor_command = env
            .get("VISUAL")
            .or_else(|| env.get("EDITOR"))
            .filter(|value| !value.trim().is_empty())
            .cloned();
    }

    let config = Config::from_partial(partial)?;
    Ok((config, config_path))
}
