//! Namespace exclusion per process.
//!
//! Patterns are exact names, prefix wildcards (`kube-*`) or suffix wildcards (`*-system`).
//! Patterns registered for [`Process::Star`] apply to every process.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Object, ObjectError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Process {
    Audit,
    Sync,
    Webhook,
    MutationWebhook,
    #[serde(rename = "*")]
    Star,
}

impl Process {
    pub fn as_str(&self) -> &'static str {
        match self {
            Process::Audit => "audit",
            Process::Sync => "sync",
            Process::Webhook => "webhook",
            Process::MutationWebhook => "mutation-webhook",
            Process::Star => "*",
        }
    }
}

impl fmt::Display for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for Process {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "audit" => Ok(Process::Audit),
            "sync" => Ok(Process::Sync),
            "webhook" => Ok(Process::Webhook),
            "mutation-webhook" => Ok(Process::MutationWebhook),
            "*" => Ok(Process::Star),
            other => Err(format!("unknown process: {}", other)),
        }
    }
}

/// One `match` entry of a config: the processes and the namespaces they skip.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchEntry {
    #[serde(default)]
    pub processes: Vec<Process>,
    #[serde(default)]
    pub excluded_namespaces: Vec<String>,
}

/// Evaluates whether an object's namespace is excluded from a process.
///
/// Equality is by value and ignores the order patterns were added in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Excluder {
    excluded: BTreeMap<Process, BTreeSet<String>>,
}

impl Excluder {
    pub fn new() -> Self { Self::default() }

    pub fn from_matches(matches: impl IntoIterator<Item = MatchEntry>) -> Self {
        let mut me = Self::new();
        for m in matches {
            for p in &m.processes {
                me.add(*p, m.excluded_namespaces.iter().cloned());
            }
        }
        me
    }

    pub fn add(&mut self, process: Process, patterns: impl IntoIterator<Item = String>) {
        let mut patterns = patterns.into_iter().filter(|p| !p.is_empty()).peekable();
        if patterns.peek().is_none() {
            return;
        }
        self.excluded.entry(process).or_default().extend(patterns);
    }

    pub fn is_empty(&self) -> bool { self.excluded.is_empty() }

    /// Namespace objects are matched by their own name; cluster-scoped objects are never excluded.
    pub fn is_namespace_excluded(&self, process: Process, obj: &Object) -> Result<bool, ObjectError> {
        let ns = if obj.gvk().is_namespace() { Some(obj.name()?) } else { obj.namespace()? };
        let Some(ns) = ns else { return Ok(false) };
        Ok(self.patterns_for(process).any(|p| pattern_matches(p, ns)))
    }

    fn patterns_for(&self, process: Process) -> impl Iterator<Item = &String> {
        let own = self.excluded.get(&process).into_iter().flatten();
        let star = if process == Process::Star { None } else { self.excluded.get(&Process::Star) };
        own.chain(star.into_iter().flatten())
    }
}

fn pattern_matches(pattern: &str, ns: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix('*') {
        return ns.starts_with(prefix);
    }
    if let Some(suffix) = pattern.strip_prefix('*') {
        return ns.ends_with(suffix);
    }
    pattern == ns
}
