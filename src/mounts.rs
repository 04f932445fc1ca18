use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tokio::fs;

use crate::{LaunchError, Result};

/// The only key allowed at the top level of a mount manifest
pub const MOUNTS_KEY: &str = "Mounts";

/// File name of the manifest under the user's home directory
pub const DEFAULT_MOUNTS_FILE_NAME: &str = ".gpu_task_launcher_mounts.json";

/// Returns `~/.gpu_task_launcher_mounts.json`, or the bare file name relative
/// to the working directory if the home directory cannot be determined.
pub fn default_mounts_file() -> PathBuf {
    match dirs::home_dir() {
        Some(home) => home.join(DEFAULT_MOUNTS_FILE_NAME),
        None => PathBuf::from(DEFAULT_MOUNTS_FILE_NAME),
    }
}

/// Expands a leading `~` or `~/` to the home directory. Anything else
/// (including `~user`) is returned unchanged.
pub fn expand_home(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest)
        }
    }
    path.to_owned()
}

/// One `{source, destination}` entry of the manifest. Both fields are
/// guaranteed non-empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountDeclaration {
    source: String,
    destination: String,
}

impl MountDeclaration {
    /// Returns a `ConfigError` if either path is empty. This does not check
    /// that `source` exists, that happens in [MountManifest::resolve].
    pub fn new(source: impl Into<String>, destination: impl Into<String>) -> Result<Self> {
        let source = source.into();
        let destination = destination.into();
        if source.is_empty() || destination.is_empty() {
            return Err(LaunchError::config(format!(
                "mount source and destination must be non-empty, got {source:?} -> \
                 {destination:?}"
            )))
        }
        Ok(Self {
            source,
            destination,
        })
    }

    /// Host path
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Path inside the container
    pub fn destination(&self) -> &str {
        &self.destination
    }
}

/// A mount manifest file on the host, in the format
///
/// ```json
/// { "Mounts": [ { "source": "/host/data", "destination": "/workspace/data" } ] }
/// ```
#[derive(Debug, Clone)]
pub struct MountManifest {
    path: PathBuf,
}

impl MountManifest {
    /// A leading `~` in `path` is expanded
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: expand_home(path),
        }
    }

    /// Reads and validates the manifest, returning the declarations in file
    /// order. A missing manifest file yields an empty list.
    #[tracing::instrument(skip_all, fields(manifest = %self.path.display()))]
    pub async fn resolve(&self) -> Result<Vec<MountDeclaration>> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(
                    "No mount manifest found at {}, running without mounts",
                    self.path.display()
                );
                return Ok(vec![])
            }
            Err(err) => {
                return Err(LaunchError::config(format!(
                    "could not read mount manifest {}: {err}",
                    self.path.display()
                )))
            }
        };
        let mounts = parse_manifest(&contents)?;
        for mount in &mounts {
            let exists = fs::try_exists(mount.source()).await.map_err(|err| {
                LaunchError::not_found(format!(
                    "could not check mount source {}: {err}",
                    mount.source()
                ))
            })?;
            if !exists {
                return Err(LaunchError::not_found(format!(
                    "mount source path does not exist: {}",
                    mount.source()
                )))
            }
        }
        tracing::debug!(count = mounts.len(), "resolved mounts");
        Ok(mounts)
    }
}

/// Structural validation of manifest contents, without touching the
/// filesystem
pub fn parse_manifest(contents: &str) -> Result<Vec<MountDeclaration>> {
    let value: Value = serde_json::from_str(contents)
        .map_err(|err| LaunchError::config(format!("mount manifest is not valid JSON: {err}")))?;
    let Value::Object(top) = value else {
        return Err(LaunchError::config("mount manifest must be a JSON object"))
    };
    if top.len() != 1 || !top.contains_key(MOUNTS_KEY) {
        let keys: Vec<&String> = top.keys().collect();
        return Err(LaunchError::config(format!(
            "mount manifest requires exactly the key \"{MOUNTS_KEY}\", found {keys:?}"
        )))
    }
    let Some(Value::Array(entries)) = top.get(MOUNTS_KEY) else {
        return Err(LaunchError::config(format!("\"{MOUNTS_KEY}\" must be an array")))
    };
    entries
        .iter()
        .enumerate()
        .map(|(i, entry)| {
            let entry = entry.as_object().ok_or_else(|| {
                LaunchError::config(format!("mount entry {i} is not an object"))
            })?;
            MountDeclaration::new(
                required_field(entry, i, "source")?,
                required_field(entry, i, "destination")?,
            )
        })
        .collect()
}

fn required_field<'a>(entry: &'a Map<String, Value>, i: usize, field: &str) -> Result<&'a str> {
    entry
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| {
            LaunchError::config(format!(
                "mount entry {i} is missing the string field \"{field}\""
            ))
        })
}
