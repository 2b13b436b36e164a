//! Resolved, immutable view of the configured backends
//!
//! The registry is built once from [`Config`] at startup. Its order is the
//! rotation order used by the load balancer; there is no hot reload.

use crate::config::Config;
use std::path::{Path, PathBuf};

/// A fully resolved backend definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backend {
    pub id: String,
    pub working_dir: PathBuf,
    pub port: u16,
    pub credential_dir: PathBuf,
    pub command: String,
    pub args: Vec<String>,
    pub login_args: Vec<String>,
    pub autostart: bool,
}

impl Backend {
    /// Executable to spawn for this backend
    ///
    /// A bare command name that exists as a file inside `working_dir` runs
    /// that file. Anything else (a path, or a name only found on `PATH`) is
    /// passed through as configured.
    pub fn program(&self) -> PathBuf {
        if !self.command.contains(['/', '\\']) {
            if let Some(local) = local_executable(&self.working_dir, &self.command) {
                return local;
            }
        }
        PathBuf::from(&self.command)
    }
}

fn local_executable(dir: &Path, command: &str) -> Option<PathBuf> {
    let mut candidates = vec![dir.join(command)];
    if cfg!(windows) && Path::new(command).extension().is_none() {
        candidates.push(dir.join(format!("{}.exe", command)));
    }

    // Absolute, so the lookup does not depend on how the platform resolves
    // relative programs against the child's working directory
    candidates
        .into_iter()
        .find(|candidate| candidate.is_file())
        .map(|found| found.canonicalize().unwrap_or(found))
}

/// Ordered list of backends, looked up by id
#[derive(Debug, Clone, Default)]
pub struct BackendRegistry {
    backends: Vec<Backend>,
}

impl BackendRegistry {
    pub fn new(backends: Vec<Backend>) -> Self {
        Self { backends }
    }

    /// Resolve every configured backend against the defaults
    pub fn from_config(config: &Config) -> Self {
        let defaults = &config.defaults;
        let backends = config
            .backends
            .iter()
            .map(|b| Backend {
                id: b.id.clone(),
                working_dir: PathBuf::from(&b.working_dir),
                port: b.port,
                credential_dir: expand_home(b.credential_dir(defaults)),
                command: b.command(defaults).to_string(),
                args: b.args(defaults).to_vec(),
                login_args: b.login_args(defaults).to_vec(),
                autostart: b.autostart(defaults),
            })
            .collect();

        Self { backends }
    }

    pub fn get(&self, id: &str) -> Option<&Backend> {
        self.backends.iter().find(|b| b.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Backend> {
        self.backends.iter()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

/// Expand a leading `~` to the current user's home directory
pub fn expand_home(path: &str) -> PathBuf {
    let rest = match path.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') || rest.starts_with('\\') => rest,
        _ => return PathBuf::from(path),
    };

    match dirs_next::home_dir() {
        Some(home) => home.join(rest.trim_start_matches(['/', '\\'])),
        None => PathBuf::from(path),
    }
}
