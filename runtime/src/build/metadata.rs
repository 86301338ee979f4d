//! Image metadata and build-argument scopes.
//!
//! Both are immutable values: every instruction produces a new snapshot
//! that is threaded into the next step, so a stage's metadata at any step
//! is a pure function of the instructions before it.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

/// Accumulated image configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMetadata {
    /// Environment variables, last write wins
    pub env: BTreeMap<String, String>,
    /// Exposed ports as `<port>/<proto>`
    pub exposed_ports: BTreeSet<String>,
    /// Absolute working directory
    pub workdir: String,
    pub entrypoint: Option<Vec<String>>,
    pub cmd: Option<Vec<String>>,
    pub user: Option<String>,
    pub labels: BTreeMap<String, String>,
}

impl Default for ImageMetadata {
    fn default() -> Self {
        Self {
            env: BTreeMap::new(),
            exposed_ports: BTreeSet::new(),
            workdir: "/".to_string(),
            entrypoint: None,
            cmd: None,
            user: None,
            labels: BTreeMap::new(),
        }
    }
}

impl ImageMetadata {
    pub fn with_env(&self, pairs: &[(String, String)]) -> Self {
        let mut next = self.clone();
        for (key, value) in pairs {
            next.env.insert(key.clone(), value.clone());
        }
        next
    }

    pub fn with_labels(&self, pairs: &[(String, String)]) -> Self {
        let mut next = self.clone();
        for (key, value) in pairs {
            next.labels.insert(key.clone(), value.clone());
        }
        next
    }

    pub fn with_ports(&self, ports: &[String]) -> Self {
        let mut next = self.clone();
        next.exposed_ports.extend(ports.iter().cloned());
        next
    }

    pub fn with_workdir(&self, workdir: String) -> Self {
        Self {
            workdir,
            ..self.clone()
        }
    }

    pub fn with_user(&self, user: String) -> Self {
        Self {
            user: Some(user),
            ..self.clone()
        }
    }

    pub fn with_cmd(&self, cmd: Vec<String>) -> Self {
        Self {
            cmd: Some(cmd),
            ..self.clone()
        }
    }

    /// Replace the entrypoint.
    ///
    /// A CMD that was not declared in the current stage (inherited from
    /// the base) is cleared, matching `docker build`.
    pub fn with_entrypoint(&self, entrypoint: Vec<String>, cmd_set_in_stage: bool) -> Self {
        Self {
            entrypoint: Some(entrypoint),
            cmd: if cmd_set_in_stage {
                self.cmd.clone()
            } else {
                None
            },
            ..self.clone()
        }
    }

    /// Resolve a path against the working directory.
    pub fn resolve_path(&self, path: &str) -> String {
        resolve_path(&self.workdir, path)
    }

    /// `KEY=VALUE` strings in key order.
    pub fn env_list(&self) -> Vec<String> {
        self.env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect()
    }
}

/// Resolve a path relative to a working directory and normalize it.
///
/// If `path` is absolute, `workdir` is ignored. `.` and `..` components are
/// folded; the result is always absolute. A trailing `/` is kept.
pub fn resolve_path(workdir: &str, path: &str) -> String {
    let joined = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{}/{}", workdir.trim_end_matches('/'), path)
    };

    let mut parts: Vec<&str> = Vec::new();
    for part in joined.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }

    let mut resolved = format!("/{}", parts.join("/"));
    if (path.ends_with('/') || path.ends_with("/.")) && resolved != "/" {
        resolved.push('/');
    }
    resolved
}

/// Build arguments visible to a stage.
///
/// Only declared names are visible; a `--build-arg` value overrides the
/// declared default.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArgScope {
    declared: BTreeMap<String, Option<String>>,
}

impl ArgScope {
    /// Declare `name`, taking the override if present, else `default`.
    pub fn declare(
        &self,
        name: &str,
        default: Option<String>,
        overrides: &HashMap<String, String>,
    ) -> Self {
        let mut next = self.clone();
        let value = overrides.get(name).cloned().or(default);
        next.declared.insert(name.to_string(), value);
        next
    }

    /// Value of a declared argument, `None` if undeclared or without value.
    pub fn get(&self, name: &str) -> Option<String> {
        self.declared.get(name).cloned().flatten()
    }

    pub fn is_declared(&self, name: &str) -> bool {
        self.declared.contains_key(name)
    }

    /// Declared arguments that have a value, in name order.
    pub fn bindings(&self) -> BTreeMap<String, String> {
        self.declared
            .iter()
            .filter_map(|(k, v)| v.as_ref().map(|v| (k.clone(), v.clone())))
            .collect()
    }
}
