//! Opens the location referenced by an activated line in the user's editor.
//!
//! Templates are shell-like command strings. After splitting, each argument has `${VAR}` /
//! `$VAR` references expanded from `__FILE__`, `__LINE__`, `__COLUMN__`, `PWD`, then the
//! process environment. The same variables are exported to the editor process.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::rules::RuleSet;
use crate::viewer::{Activation, ActivationHook};

pub const FILE_VAR: &str = "__FILE__";
pub const LINE_VAR: &str = "__LINE__";
pub const COLUMN_VAR: &str = "__COLUMN__";
pub const LINE_FILE_PREFIX: &str = "ot-line-";

#[derive(Debug, thiserror::Error)]
pub enum EditorError {
    #[error("no editor template configured (need editor.file, editor.file_line or editor.file_line_col)")]
    NoTemplate,
    #[error("invalid editor template: {0}")]
    InvalidTemplate(String),
    #[error("editor argv is empty after expansion")]
    EmptyArgv,
    #[error("editor exited with {0}")]
    Failed(std::process::ExitStatus),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EditorConfig {
    pub file: Option<String>,
    pub file_line: Option<String>,
    pub file_line_col: Option<String>,
    pub pretty_json: bool,
    /// Run the editor in the viewer's terminal and wait for it to exit.
    pub wait: bool,
    #[serde(skip)]
    pub scratch_dir: PathBuf,
}

impl Default for EditorConfig {
    fn default() -> Self {
        Self::for_command("vi")
    }
}

impl EditorConfig {
    /// Templates for a terminal editor that understands `+LINE FILE`.
    pub fn for_command(command: &str) -> Self {
        Self {
            file: Some(format!("{command} ${{{FILE_VAR}}}")),
            file_line: Some(format!("{command} +${{{LINE_VAR}}} ${{{FILE_VAR}}}")),
            file_line_col: None,
            pretty_json: true,
            wait: true,
            scratch_dir: std::env::temp_dir(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub argv: Vec<String>,
    pub vars: BTreeMap<String, String>,
}

pub struct EditorLauncher {
    rules: Arc<RuleSet>,
    config: EditorConfig,
    env: BTreeMap<String, String>,
    cwd: PathBuf,
}

impl EditorLauncher {
    pub fn new(rules: Arc<RuleSet>, config: EditorConfig) -> Self {
        let env = std::env::vars().collect();
        let cwd = std::env::current_dir().unwrap_or_default();
        Self::with_env(rules, config, env, cwd)
    }

    pub fn with_env(
        rules: Arc<RuleSet>,
        config: EditorConfig,
        env: BTreeMap<String, String>,
        cwd: PathBuf,
    ) -> Self {
        Self { rules, config, env, cwd }
    }

    /// Resolves the argv for `line`. Lines without a location are written to a scratch
    /// JSON file which is then opened with the plain `file` template.
    pub fn plan(&self, line: &str) -> Result<LaunchPlan, EditorError> {
        let (file, line_no, column) = match self.rules.extract_path_line_col(line) {
            Some(location) => (location.file, location.line, location.column),
            None => (self.write_line_file(line)?.display().to_string(), 0, 0),
        };

        let template = match (&self.config.file_line_col, &self.config.file_line) {
            (Some(template), _) if line_no > 0 && column > 0 => template,
            (_, Some(template)) if line_no > 0 => template,
            _ => self.config.file.as_ref().ok_or(EditorError::NoTemplate)?,
        };

        let mut vars = BTreeMap::new();
        vars.insert("PWD".to_string(), self.cwd.display().to_string());
        vars.insert(FILE_VAR.to_string(), file);
        vars.insert(LINE_VAR.to_string(), line_no.to_string());
        vars.insert(COLUMN_VAR.to_string(), column.to_string());

        let parts = shlex::split(template)
            .ok_or_else(|| EditorError::InvalidTemplate(template.clone()))?;
        let lookup = |name: &str| vars.get(name).or_else(|| self.env.get(name)).cloned();
        let argv: Vec<String> = parts.iter().map(|part| expand_vars(part, &lookup)).collect();
        if argv.first().map_or(true, |program| program.is_empty()) {
            return Err(EditorError::EmptyArgv);
        }
        Ok(LaunchPlan { argv, vars })
    }

    fn write_line_file(&self, line: &str) -> Result<PathBuf, EditorError> {
        #[derive(Serialize)]
        struct LinePayload<'a> {
            line: &'a str,
        }

        let payload = LinePayload { line };
        let bytes = if self.config.pretty_json {
            serde_json::to_vec_pretty(&payload)?
        } else {
            serde_json::to_vec(&payload)?
        };
        let mut file = tempfile::Builder::new()
            .prefix(LINE_FILE_PREFIX)
            .suffix(".json")
            .tempfile_in(&self.config.scratch_dir)?;
        file.write_all(&bytes)?;
        let (_, path) = file.keep().map_err(|err| err.error)?;
        debug!(path = %path.display(), "wrote unlocated line for editor");
        Ok(path)
    }

    fn launch(&self, plan: &LaunchPlan) -> Result<(), EditorError> {
        let (program, args) = plan.argv.split_first().ok_or(EditorError::EmptyArgv)?;
        let mut cmd = Command::new(program);
        cmd.args(args).envs(&plan.vars);
        if self.config.wait {
            let status = cmd.status()?;
            if !status.success() {
                return Err(EditorError::Failed(status));
            }
        } else {
            cmd.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null()).spawn()?;
        }
        Ok(())
    }
}

impl ActivationHook for EditorLauncher {
    fn activate(&mut self, line: &str) -> Activation {
        let plan = match self.plan(line) {
            Ok(plan) => plan,
            Err(err) => return Activation { argv: Vec::new(), error: Some(err.to_string()) },
        };
        info!(argv = ?plan.argv, "launching editor");
        let error = self.launch(&plan).err().map(|err| err.to_string());
        Activation { argv: plan.argv, error }
    }

    fn needs_terminal(&self) -> bool {
        self.config.wait
    }
}

/// Expands `${NAME}` and `$NAME`. Unknown names expand to nothing; a `$` that does not
/// start a reference is kept.
pub fn expand_vars<F>(input: &str, lookup: &F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        if let Some(braced) = after.strip_prefix('{') {
            if let Some(end) = braced.find('}') {
                out.push_str(&lookup(&braced[..end]).unwrap_or_default());
                rest = &braced[end + 1..];
                continue;
            }
        } else {
            let len = after
                .find(|ch: char| !(ch.is_ascii_alphanumeric() || ch == '_'))
                .unwrap_or(after.len());
            if len > 0 {
                out.push_str(&lookup(&after[..len]).unwrap_or_default());
                rest = &after[len..];
                continue;
            }
        }
        out.push('$');
        rest = after;
    }
    out.push_str(rest);
    out
}
