//! Upload and artifact stores.
//!
//! Staged inputs are resolved through an [`UploadStore`] (read only) and
//! non-inline outputs are handed to an [`ArtifactStore`] (write only). The
//! local implementations keep everything under a directory on disk.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{SandboxError, SandboxResult};

/// An upload found by reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedUpload {
    /// Store identifier.
    pub id: String,
    /// Original file name.
    pub name: String,
    /// Where the bytes live.
    pub path: PathBuf,
}

/// Read-only resolver for uploaded input files.
#[async_trait]
pub trait UploadStore: Send + Sync {
    /// Resolve a reference, trying it as an id first and then as a file name.
    async fn resolve(&self, reference: &str) -> SandboxResult<ResolvedUpload>;
}

/// A registered output file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileReference {
    pub id: String,
    pub original_name: String,
    pub size_bytes: u64,
    pub mime_type: String,
}

/// Write-only sink for produced files.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Copy the file at `path` into the store and return a reference to it.
    async fn register(&self, name: &str, path: &Path, mime_type: &str)
    -> SandboxResult<FileReference>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Local upload store
// ─────────────────────────────────────────────────────────────────────────────

/// Uploads kept on disk as `<root>/<id>/<name>`.
///
/// A reference naming a top-level file (`<root>/<name>`) also resolves, as
/// does, with [`LocalUploadStore::with_direct_paths`], any existing file path.
#[derive(Debug, Clone)]
pub struct LocalUploadStore {
    root: PathBuf,
    direct_paths: bool,
}

impl LocalUploadStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            direct_paths: false,
        }
    }

    /// Also accept references that are plain file paths on the host.
    pub fn with_direct_paths(mut self, allow: bool) -> Self {
        self.direct_paths = allow;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Store a new upload and return its id.
    pub async fn put(&self, name: &str, bytes: &[u8]) -> SandboxResult<String> {
        if !is_plain_name(name) {
            return Err(SandboxError::Store(format!("invalid upload name '{name}'")));
        }
        let id = uuid::Uuid::new_v4().to_string();
        let dir = self.root.join(&id);
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join(name), bytes).await?;
        tracing::debug!(id = %id, name = %name, size = bytes.len(), "Stored upload");
        Ok(id)
    }

    async fn by_id(&self, id: &str) -> SandboxResult<Option<ResolvedUpload>> {
        let dir = self.root.join(id);
        if !tokio::fs::metadata(&dir).await.is_ok_and(|m| m.is_dir()) {
            return Ok(None);
        }
        let mut entries = tokio::fs::read_dir(&dir).await?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                files.push(entry.path());
            }
        }
        match files.as_slice() {
            [path] => Ok(Some(ResolvedUpload {
                id: id.to_string(),
                name: file_name(path),
                path: path.clone(),
            })),
            [] => Err(SandboxError::Store(format!("upload '{id}' is empty"))),
            _ => Err(SandboxError::Store(format!(
                "upload '{id}' holds {} files",
                files.len()
            ))),
        }
    }

    async fn by_name(&self, name: &str) -> SandboxResult<Option<ResolvedUpload>> {
        let top = self.root.join(name);
        if tokio::fs::metadata(&top).await.is_ok_and(|m| m.is_file()) {
            return Ok(Some(ResolvedUpload {
                id: name.to_string(),
                name: name.to_string(),
                path: top,
            }));
        }

        let mut matches: Vec<PathBuf> = walkdir::WalkDir::new(&self.root)
            .min_depth(2)
            .max_depth(2)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file() && e.file_name() == name)
            .map(|e| e.into_path())
            .collect();
        matches.sort();

        if matches.len() > 1 {
            tracing::warn!(name = %name, count = matches.len(), "Ambiguous upload name, using first");
        }
        Ok(matches.into_iter().next().map(|path| {
            let id = path
                .parent()
                .and_then(|p| p.file_name())
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            ResolvedUpload {
                id,
                name: name.to_string(),
                path,
            }
        }))
    }
}

#[async_trait]
impl UploadStore for LocalUploadStore {
    async fn resolve(&self, reference: &str) -> SandboxResult<ResolvedUpload> {
        if is_plain_name(reference) {
            if let Some(found) = self.by_id(reference).await? {
                return Ok(found);
            }
            if let Some(found) = self.by_name(reference).await? {
                return Ok(found);
            }
        }

        if self.direct_paths {
            let path = PathBuf::from(reference);
            if tokio::fs::metadata(&path).await.is_ok_and(|m| m.is_file()) {
                return Ok(ResolvedUpload {
                    id: reference.to_string(),
                    name: file_name(&path),
                    path,
                });
            }
        }

        Err(SandboxError::Store(format!("upload '{reference}' not found")))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Local artifact store
// ─────────────────────────────────────────────────────────────────────────────

/// Artifacts copied to `<root>/<id>/<name>`.
#[derive(Debug)]
pub struct LocalArtifactStore {
    root: PathBuf,
    registered: Mutex<Vec<FileReference>>,
}

impl LocalArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            registered: Mutex::new(Vec::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where a registered artifact was written.
    pub fn path_of(&self, reference: &FileReference) -> PathBuf {
        self.root.join(&reference.id).join(&reference.original_name)
    }

    /// References registered through this handle so far.
    pub fn registered(&self) -> Vec<FileReference> {
        self.registered.lock().clone()
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn register(
        &self,
        name: &str,
        path: &Path,
        mime_type: &str,
    ) -> SandboxResult<FileReference> {
        let original_name = Path::new(name)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .filter(|n| is_plain_name(n))
            .ok_or_else(|| SandboxError::Store(format!("invalid artifact name '{name}'")))?;

        let id = uuid::Uuid::new_v4().to_string();
        let dir = self.root.join(&id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| SandboxError::Store(format!("{}: {e}", dir.display())))?;
        let size_bytes = tokio::fs::copy(path, dir.join(&original_name))
            .await
            .map_err(|e| SandboxError::Store(format!("{}: {e}", path.display())))?;

        let reference = FileReference {
            id,
            original_name,
            size_bytes,
            mime_type: mime_type.to_string(),
        };
        tracing::debug!(id = %reference.id, name = %reference.original_name, "Registered artifact");
        self.registered.lock().push(reference.clone());
        Ok(reference)
    }
}

/// A single normal path component.
fn is_plain_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
