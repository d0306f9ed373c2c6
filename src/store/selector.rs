//! Label selectors

use std::collections::{BTreeMap, BTreeSet};

/// Conjunction of label requirements, each satisfied by any of its values
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector {
    requirements: BTreeMap<String, BTreeSet<String>>,
}

impl Selector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `key` to equal one of `values`; an empty value list is ignored
    pub fn with<I, S>(mut self, key: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let values: BTreeSet<String> = values.into_iter().map(Into::into).collect();
        if !values.is_empty() {
            self.requirements
                .entry(key.to_string())
                .or_default()
                .extend(values);
        }
        self
    }

    /// Require `key=value`
    pub fn label(self, key: &str, value: &str) -> Self {
        self.with(key, [value])
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    /// Evaluate against an object's labels
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|(key, values)| {
            labels
                .get(key)
                .map(|value| values.contains(value))
                .unwrap_or(false)
        })
    }
}

impl std::fmt::Display for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self
            .requirements
            .iter()
            .map(|(key, values)| {
                if values.len() == 1 {
                    format!("{}={}", key, values.iter().next().map(String::as_str).unwrap_or(""))
                } else {
                    let joined: Vec<&str> = values.iter().map(String::as_str).collect();
                    format!("{} in ({})", key, joined.join(","))
                }
            })
            .collect();
        write!(f, "{}", parts.join(","))
    }
}
