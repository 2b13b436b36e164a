//! Credential inspection for supervised backends
//!
//! The supervised executable signals a completed login by writing
//! `antigravity-<label>.json` into its credential directory. This module only
//! looks at file names: contents are owned by the executable and never parsed.
//! Every call rescans the directory; nothing is cached.

use crate::registry::BackendRegistry;
use serde::Serialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

const CREDENTIAL_PREFIX: &str = "antigravity-";
const CREDENTIAL_SUFFIX: &str = ".json";

/// Authentication state observed for one backend
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CredentialRecord {
    pub present: bool,
    /// Human-readable account label derived from the file name
    pub label: Option<String>,
    pub file_name: Option<String>,
}

impl CredentialRecord {
    fn absent() -> Self {
        Self::default()
    }
}

/// Reads and revokes credential artifacts for registered backends
pub struct CredentialInspector {
    registry: Arc<BackendRegistry>,
}

impl CredentialInspector {
    pub fn new(registry: Arc<BackendRegistry>) -> Self {
        Self { registry }
    }

    /// Report whether `id` currently has a credential file
    pub fn inspect(&self, id: &str) -> CredentialRecord {
        match self.registry.get(id) {
            Some(backend) => inspect_dir(&backend.credential_dir),
            None => CredentialRecord::absent(),
        }
    }

    /// Delete the credential file for `id`, returning the removed file name
    ///
    /// Missing directories and files are a no-op. I/O errors are logged.
    pub fn revoke(&self, id: &str) -> Option<String> {
        let backend = self.registry.get(id)?;
        let dir = &backend.credential_dir;
        let file_name = find_credential_file(dir)?;
        let path = dir.join(&file_name);

        match std::fs::remove_file(&path) {
            Ok(()) => {
                info!(id, file = %file_name, "Deleted credential file");
                Some(file_name)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(id, file = %file_name, "Credential file already gone");
                None
            }
            Err(e) => {
                warn!(id, path = %path.display(), error = %e, "Failed to delete credential file");
                None
            }
        }
    }
}

/// Inspect a credential directory directly
pub fn inspect_dir(dir: &Path) -> CredentialRecord {
    match find_credential_file(dir) {
        Some(file_name) => {
            let label = credential_label(&file_name);
            CredentialRecord {
                present: true,
                label,
                file_name: Some(file_name),
            }
        }
        None => CredentialRecord::absent(),
    }
}

/// Find the first `antigravity-<label>.json` file in `dir`
///
/// Entries are sorted by name, so when more than one credential file exists
/// the choice is stable across calls.
pub fn find_credential_file(dir: &Path) -> Option<String> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!(dir = %dir.display(), "Credential directory does not exist");
            return None;
        }
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "Failed to read credential directory");
            return None;
        }
    };

    let mut names: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| credential_label(name).is_some())
        .collect();

    names.sort();
    names.into_iter().next()
}

/// Derive the account label from a credential file name
///
/// `antigravity-foo_bar_com.json` becomes `foo.bar.com`. Returns `None` when
/// the name does not follow the credential pattern.
pub fn credential_label(file_name: &str) -> Option<String> {
    let raw = file_name
        .strip_prefix(CREDENTIAL_PREFIX)?
        .strip_suffix(CREDENTIAL_SUFFIX)?;

    if raw.is_empty() {
        return None;
    }

    Some(raw.replace('_', "."))
}

/// Path a credential file for `label` would have inside `dir`
pub fn credential_path(dir: &Path, raw_label: &str) -> PathBuf {
    dir.join(format!("{}{}{}", CREDENTIAL_PREFIX, raw_label, CREDENTIAL_SUFFIX))
}
