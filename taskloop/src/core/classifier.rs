//! Deterministic classification of raw agent error text.
//!
//! Rules live in data (`rules/error_rules.toml`, optionally replaced by a
//! user file) so the rule set can be tested apart from the matcher. Tables are
//! evaluated Fatal -> Transient -> Critical and the first match wins, which
//! keeps quota and credential failures from being retried when their text also
//! contains a transient-looking substring such as `429`.

use std::time::Duration;

use anyhow::{Context, Result};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::core::types::{ErrorClassification, ErrorKind};

const BUILTIN_RULES: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/rules/error_rules.toml"
));

/// Evaluation order of the rule tables.
pub const PRIORITY: [ErrorKind; 3] = [ErrorKind::Fatal, ErrorKind::Transient, ErrorKind::Critical];

/// One uncompiled rule as written in a rules file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub pattern: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resumable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

/// The three ordered rule tables.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleTables {
    #[serde(default)]
    pub fatal: Vec<RuleSpec>,
    #[serde(default)]
    pub transient: Vec<RuleSpec>,
    #[serde(default)]
    pub critical: Vec<RuleSpec>,
}

impl RuleTables {
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).context("parse error rule tables")
    }

    pub fn builtin() -> Self {
        Self::from_toml_str(BUILTIN_RULES).expect("built-in rule tables should parse")
    }

    fn table(&self, kind: ErrorKind) -> &[RuleSpec] {
        match kind {
            ErrorKind::Fatal => &self.fatal,
            ErrorKind::Transient => &self.transient,
            ErrorKind::Critical => &self.critical,
            ErrorKind::Unknown => &[],
        }
    }
}

#[derive(Debug, Clone)]
struct Rule {
    regex: Regex,
    message: String,
    resumable: bool,
    retry_after: Option<Duration>,
}

/// Compiled rule tables.
#[derive(Debug, Clone)]
pub struct Classifier {
    tables: Vec<(ErrorKind, Vec<Rule>)>,
}

impl Classifier {
    /// Compile rule tables. Invalid patterns are reported here, never at classify time.
    pub fn new(tables: &RuleTables) -> Result<Self> {
        let mut compiled = Vec::with_capacity(PRIORITY.len());
        for kind in PRIORITY {
            let mut rules = Vec::new();
            for (idx, spec) in tables.table(kind).iter().enumerate() {
                let regex = RegexBuilder::new(&spec.pattern)
                    .case_insensitive(true)
                    .build()
                    .with_context(|| format!("compile {kind} rule #{} ({})", idx + 1, spec.pattern))?;
                rules.push(Rule {
                    regex,
                    message: spec.message.clone(),
                    resumable: spec.resumable.unwrap_or(kind != ErrorKind::Fatal),
                    retry_after: match kind {
                        ErrorKind::Transient => spec.retry_after_secs.map(Duration::from_secs),
                        _ => None,
                    },
                });
            }
            compiled.push((kind, rules));
        }
        Ok(Self { tables: compiled })
    }

    pub fn builtin() -> Self {
        Self::new(&RuleTables::builtin()).expect("built-in rule tables should compile")
    }

    /// Classify a raw error string. Total: unmatched input is `Unknown`.
    pub fn classify(&self, raw: &str) -> ErrorClassification {
        for (kind, rules) in &self.tables {
            if let Some(rule) = rules.iter().find(|rule| rule.regex.is_match(raw)) {
                return ErrorClassification {
                    kind: *kind,
                    message: rule.message.clone(),
                    resumable: rule.resumable,
                    retry_after: rule.retry_after,
                    raw: raw.to_string(),
                };
            }
        }
        ErrorClassification::unknown(raw)
    }

    /// Classify `primary` (stderr or a spawn error) first, and `fallback`
    /// (agent output) only when the primary text matches no rule.
    pub fn classify_layered(&self, primary: &str, fallback: &str) -> ErrorClassification {
        let first = self.classify(primary);
        if first.kind != ErrorKind::Unknown || fallback.trim().is_empty() {
            return first;
        }
        let second = self.classify(fallback);
        if second.kind == ErrorKind::Unknown {
            first
        } else {
            second
        }
    }
}

impl Default for Classifier {
    fn default() -> Self {
        Self::builtin()
    }
}
