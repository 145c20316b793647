//! Per-scenario artifact storage.
//!
//! A [`Workspace`] is a directory of named blobs owned by one scenario. The
//! build step writes into it; once the scenario is persisted the workspace is
//! sealed and only read from. Writes go through a temp file and a rename, so a
//! reader sees either the previous artifact or the complete new one.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

use crate::table::Table;
use crate::{StoreError, StoreResult};

const TMP_DIR: &str = ".tmp";

#[derive(Debug, Clone)]
pub struct Workspace {
    id: String,
    root: PathBuf,
    sealed: Arc<AtomicBool>,
}

impl Workspace {
    /// Open (creating if needed) a writable workspace rooted at `root`.
    pub fn open(id: impl Into<String>, root: PathBuf) -> StoreResult<Self> {
        fs::create_dir_all(&root)?;
        Ok(Self {
            id: id.into(),
            root,
            sealed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Read-only view; the directory is not created.
    pub fn open_sealed(id: impl Into<String>, root: PathBuf) -> Self {
        Self {
            id: id.into(),
            root,
            sealed: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Reject all further writes through this workspace and its clones.
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::SeqCst);
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::SeqCst)
    }

    pub fn write_structured<T: Serialize>(&self, name: &str, value: &T) -> StoreResult<()> {
        let bytes = serde_json::to_vec_pretty(value)?;
        self.write_atomic(name, &bytes)
    }

    pub fn write_table(&self, name: &str, table: &Table) -> StoreResult<()> {
        let bytes = serde_json::to_vec(table)?;
        self.write_atomic(name, &bytes)
    }

    pub fn write_bytes(&self, name: &str, data: &[u8]) -> StoreResult<()> {
        self.write_atomic(name, data)
    }

    pub fn read_structured<T: DeserializeOwned>(&self, name: &str) -> StoreResult<T> {
        let bytes = self.read_bytes(name)?;
        serde_json::from_slice(&bytes).map_err(|e| self.corrupt(name, e.to_string()))
    }

    pub fn read_table(&self, name: &str) -> StoreResult<Table> {
        let bytes = self.read_bytes(name)?;
        serde_json::from_slice(&bytes).map_err(|e| self.corrupt(name, e.to_string()))
    }

    pub fn read_bytes(&self, name: &str) -> StoreResult<Vec<u8>> {
        let path = self.resolve(name)?;
        match fs::read(&path) {
            Ok(bytes) => {
                debug!(workspace = %self.id, artifact = name, bytes = bytes.len(), "read artifact");
                Ok(bytes)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Err(self.not_found(name)),
            // A directory where a file is expected counts as missing.
            Err(_) if path.is_dir() => Err(self.not_found(name)),
            Err(e) => Err(e.into()),
        }
    }

    pub fn exists(&self, name: &str) -> bool {
        self.resolve(name).map(|p| p.is_file()).unwrap_or(false)
    }

    /// Relative names of all artifacts, `/`-separated and sorted.
    pub fn list_names(&self) -> StoreResult<Vec<String>> {
        let mut names = Vec::new();
        if self.root.is_dir() {
            collect_names(&self.root, &self.root, &mut names)?;
        }
        names.sort();
        Ok(names)
    }

    /// Remove one artifact. Returns `false` if it did not exist.
    pub fn remove(&self, name: &str) -> StoreResult<bool> {
        self.ensure_writable()?;
        let path = self.resolve(name)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove every artifact in this workspace and the directory itself.
    ///
    /// Seals the workspace first. Deleting an absent workspace is a no-op.
    pub fn delete(&self) -> StoreResult<()> {
        self.seal();
        match fs::remove_dir_all(&self.root) {
            Ok(()) => {
                debug!(workspace = %self.id, "deleted workspace");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_atomic(&self, name: &str, data: &[u8]) -> StoreResult<()> {
        self.ensure_writable()?;
        let path = self.resolve(name)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp_dir = self.root.join(TMP_DIR);
        fs::create_dir_all(&tmp_dir)?;
        let tmp_path = tmp_dir.join(format!("{}.part", uuid::Uuid::new_v4()));
        fs::write(&tmp_path, data)?;
        if let Err(e) = fs::rename(&tmp_path, &path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }

        // Sealed while we were writing: the scenario was abandoned.
        if self.is_sealed() {
            let _ = fs::remove_file(&path);
            return Err(StoreError::WorkspaceSealed {
                workspace: self.id.clone(),
            });
        }

        debug!(workspace = %self.id, artifact = name, bytes = data.len(), "wrote artifact");
        Ok(())
    }

    fn ensure_writable(&self) -> StoreResult<()> {
        if self.is_sealed() {
            return Err(StoreError::WorkspaceSealed {
                workspace: self.id.clone(),
            });
        }
        Ok(())
    }

    fn resolve(&self, name: &str) -> StoreResult<PathBuf> {
        validate_artifact_name(name)?;
        Ok(self.root.join(name))
    }

    fn not_found(&self, name: &str) -> StoreError {
        StoreError::ArtifactNotFound {
            workspace: self.id.clone(),
            name: name.to_string(),
        }
    }

    fn corrupt(&self, name: &str, reason: String) -> StoreError {
        StoreError::ArtifactCorrupt {
            workspace: self.id.clone(),
            name: name.to_string(),
            reason,
        }
    }
}

/// Artifact names are relative `/`-separated paths. Components may not be
/// empty, `.`/`..`, or start with `.` or `_` (reserved for engine files).
pub fn validate_artifact_name(name: &str) -> StoreResult<()> {
    let invalid = |reason| {
        Err(StoreError::InvalidArtifactName {
            name: name.to_string(),
            reason,
        })
    };

    if name.is_empty() {
        return invalid("must not be empty");
    }
    if name.contains('\\') {
        return invalid("use '/' as the separator");
    }
    if Path::new(name).is_absolute() || name.starts_with('/') {
        return invalid("must be relative");
    }
    for component in name.split('/') {
        if component.is_empty() {
            return invalid("empty path component");
        }
        if component.starts_with('.') || component.starts_with('_') {
            return invalid("components may not start with '.' or '_'");
        }
    }
    if Path::new(name)
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return invalid("must not escape the workspace");
    }
    Ok(())
}

fn collect_names(root: &Path, dir: &Path, out: &mut Vec<String>) -> StoreResult<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_name = entry.file_name();
        let file_name = file_name.to_string_lossy();
        if file_name.starts_with('.') || file_name.starts_with('_') {
            continue;
        }
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_names(root, &path, out)?;
        } else if let Ok(relative) = path.strip_prefix(root) {
            let name: Vec<String> = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            out.push(name.join("/"));
        }
    }
    Ok(())
}
