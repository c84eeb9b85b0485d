//! Pattern rules that classify captured lines and locate `file:line:col` references.
//!
//! Rules are evaluated in declaration order. Group indices are 1-based and `0` means the
//! rule does not provide that part of a location.

use std::ops::Range;

use regex::Regex;
use serde::{Deserialize, Serialize};

pub const DEFAULT_RULE_ID: &str = "path:line:col";
pub const DEFAULT_RULE_PATTERN: &str = r"(?:\.?\.?/)?([A-Za-z0-9._/\-]+):(\d+):(\d+)";

#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("rule {id}: invalid pattern: {source}")]
    Pattern { id: String, source: regex::Error },
    #[error("rule {id}: {group} group {index} exceeds the pattern's {available} capture groups")]
    Group { id: String, group: &'static str, index: usize, available: usize },
}

/// Rule as written in the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub id: String,
    #[serde(alias = "pattern")]
    pub regex: String,
    #[serde(default)]
    pub file_group: usize,
    #[serde(default)]
    pub line_group: usize,
    #[serde(default)]
    pub column_group: usize,
}

impl RuleSpec {
    pub fn default_rule() -> Self {
        Self {
            id: DEFAULT_RULE_ID.to_string(),
            regex: DEFAULT_RULE_PATTERN.to_string(),
            file_group: 1,
            line_group: 2,
            column_group: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub id: String,
    regex: Regex,
    file_group: usize,
    line_group: usize,
    column_group: usize,
}

/// A location pulled out of a line by the first rule that could provide a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub file: String,
    pub line: u32,
    pub column: u32,
}

#[derive(Debug, Clone)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl Default for RuleSet {
    fn default() -> Self {
        Self::default_rules()
    }
}

impl RuleSet {
    /// Compiles rule specs; an empty list falls back to the built-in `path:line:col` rule.
    pub fn compile(specs: &[RuleSpec]) -> Result<Self, RuleError> {
        if specs.is_empty() {
            return Ok(Self::default_rules());
        }
        let rules = specs.iter().map(compile_rule).collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    pub fn default_rules() -> Self {
        let spec = RuleSpec::default_rule();
        let regex = Regex::new(&spec.regex).expect("built-in rule pattern compiles");
        Self {
            rules: vec![Rule {
                id: spec.id,
                regex,
                file_group: spec.file_group,
                line_group: spec.line_group,
                column_group: spec.column_group,
            }],
        }
    }

    pub fn ids(&self) -> Vec<String> {
        self.rules.iter().map(|rule| rule.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Returns whether any rule matched and the total number of non-overlapping matches
    /// summed over all rules.
    pub fn any_match(&self, line: &str) -> (bool, usize) {
        let count: usize = self.rules.iter().map(|rule| rule.regex.find_iter(line).count()).sum();
        (count > 0, count)
    }

    pub fn extract_path_line_col(&self, line: &str) -> Option<Location> {
        for rule in &self.rules {
            if rule.file_group == 0 {
                continue;
            }
            let Some(caps) = rule.regex.captures(line) else {
                continue;
            };
            let Some(file) = caps.get(rule.file_group) else {
                continue;
            };
            let number = |index: usize| {
                if index == 0 {
                    return 0;
                }
                caps.get(index).map(|m| parse_digits(m.as_str())).unwrap_or(0)
            };
            return Some(Location {
                file: file.as_str().to_string(),
                line: number(rule.line_group),
                column: number(rule.column_group),
            });
        }
        None
    }

    /// Byte ranges covered by any rule, merged into a sorted set of disjoint spans.
    pub fn all_spans(&self, line: &str) -> Vec<Range<usize>> {
        let spans = self
            .rules
            .iter()
            .flat_map(|rule| rule.regex.find_iter(line).map(|m| m.range()))
            .filter(|span| !span.is_empty())
            .collect();
        coalesce(spans)
    }
}

fn compile_rule(spec: &RuleSpec) -> Result<Rule, RuleError> {
    let regex = Regex::new(&spec.regex)
        .map_err(|source| RuleError::Pattern { id: spec.id.clone(), source })?;
    let available = regex.captures_len().saturating_sub(1);
    for (group, index) in
        [("file", spec.file_group), ("line", spec.line_group), ("column", spec.column_group)]
    {
        if index > available {
            return Err(RuleError::Group { id: spec.id.clone(), group, index, available });
        }
    }
    Ok(Rule {
        id: spec.id.clone(),
        regex,
        file_group: spec.file_group,
        line_group: spec.line_group,
        column_group: spec.column_group,
    })
}

/// Merges spans that overlap or touch. Input order does not matter.
pub fn coalesce(mut spans: Vec<Range<usize>>) -> Vec<Range<usize>> {
    spans.sort_by_key(|span| span.start);
    let mut merged: Vec<Range<usize>> = Vec::with_capacity(spans.len());
    for span in spans {
        match merged.last_mut() {
            Some(last) if span.start <= last.end => {
                last.end = last.end.max(span.end);
            }
            _ => merged.push(span),
        }
    }
    merged
}

/// Strict decimal parse: digits only, `0` on empty input, other characters, or overflow.
pub fn parse_digits(value: &str) -> u32 {
    if value.is_empty() {
        return 0;
    }
    let mut out: u32 = 0;
    for byte in value.bytes() {
        if !byte.is_ascii_digit() {
            return 0;
        }
        out = match out.checked_mul(10).and_then(|v| v.checked_add(u32::from(byte - b'0'))) {
            Some(v) => v,
            None => return 0,
        };
    }
    out
}
