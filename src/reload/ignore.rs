//! Path filter for the change watcher.

use std::path::{Component, Path};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Pattern {
    /// Whole path component, e.g. `.git`.
    Exact(String),
    /// `*suffix`, e.g. `*.pyc`.
    Suffix(String),
    /// `prefix*`, e.g. `.#*`.
    Prefix(String),
}

impl Pattern {
    fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() || raw == "*" {
            return None;
        }
        Some(if let Some(suffix) = raw.strip_prefix('*') {
            Pattern::Suffix(suffix.to_string())
        } else if let Some(prefix) = raw.strip_suffix('*') {
            Pattern::Prefix(prefix.to_string())
        } else {
            Pattern::Exact(raw.to_string())
        })
    }

    fn matches(&self, component: &str) -> bool {
        match self {
            Pattern::Exact(name) => component == name,
            Pattern::Suffix(suffix) => component.ends_with(suffix.as_str()),
            Pattern::Prefix(prefix) => component.starts_with(prefix.as_str()),
        }
    }
}

/// A path is ignored when any of its components matches any pattern.
#[derive(Debug, Clone, Default)]
pub struct IgnoreRules {
    patterns: Vec<Pattern>,
}

impl IgnoreRules {
    pub fn new(patterns: &[String]) -> Self {
        Self {
            patterns: patterns.iter().filter_map(|p| Pattern::parse(p)).collect(),
        }
    }

    pub fn is_ignored(&self, path: &Path) -> bool {
        path.components().any(|component| match component {
            Component::Normal(name) => {
                let name = name.to_string_lossy();
                self.patterns.iter().any(|p| p.matches(&name))
            }
            _ => false,
        })
    }
}
