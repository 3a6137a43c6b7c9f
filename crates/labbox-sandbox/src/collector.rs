//! Output collection.
//!
//! The working directory is snapshotted before the guest starts. Afterwards
//! every file that is new or changed is classified, the first raster image
//! small enough is inlined as the primary artifact, and everything else is
//! handed to the [`ArtifactStore`]. Packaged files are deleted right away.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use walkdir::WalkDir;

use crate::sniff::{ArtifactKind, Dimensions, HEADER_LIMIT, dimensions};
use crate::store::{ArtifactStore, FileReference};

/// A file the guest left behind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducedFile {
    /// Path relative to the working directory, `/`-separated.
    pub path: String,
    pub kind: ArtifactKind,
    pub mime_type: String,
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<Dimensions>,
    /// Base64 content, set only on the primary artifact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary_payload: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<FileReference>,
}

impl ProducedFile {
    pub fn is_primary(&self) -> bool {
        self.binary_payload.is_some()
    }

    /// File name without directories.
    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

/// Everything collected from one execution.
#[derive(Debug, Clone, Default)]
pub struct Collection {
    pub files: Vec<ProducedFile>,
    /// Per-file problems, appended to the text output.
    pub notes: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Stamp {
    len: u64,
    modified: Option<SystemTime>,
}

/// State of a working directory before the guest ran.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    files: HashMap<PathBuf, Stamp>,
}

impl Snapshot {
    /// Record size and mtime of every regular file under `root`.
    pub fn capture(root: &Path) -> Self {
        let files = WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| {
                let meta = e.metadata().ok()?;
                let rel = e.path().strip_prefix(root).ok()?.to_path_buf();
                Some((
                    rel,
                    Stamp {
                        len: meta.len(),
                        modified: meta.modified().ok(),
                    },
                ))
            })
            .collect();
        Self { files }
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    fn unchanged(&self, rel: &Path, stamp: Stamp) -> bool {
        self.files.get(rel) == Some(&stamp)
    }
}

/// Finds, classifies and packages produced files.
pub struct OutputCollector {
    artifacts: Arc<dyn ArtifactStore>,
    max_inline_bytes: u64,
}

impl OutputCollector {
    pub fn new(artifacts: Arc<dyn ArtifactStore>, max_inline_bytes: u64) -> Self {
        Self {
            artifacts,
            max_inline_bytes,
        }
    }

    /// Collect files created or changed since `snapshot`.
    ///
    /// `skip` names top-level entries (launcher, script, `tmp`) that are
    /// never reported.
    pub async fn collect(&self, root: &Path, snapshot: &Snapshot, skip: &[String]) -> Collection {
        let mut collection = Collection::default();
        let candidates = candidates(root, snapshot, skip, &mut collection.notes);
        let mut primary_taken = false;

        for rel in candidates {
            let shown = to_display(&rel);
            let path = root.join(&rel);

            let packaged = match self.package(&path, &shown, &mut primary_taken).await {
                Ok(file) => Some(file),
                Err(reason) => {
                    tracing::debug!(path = %shown, reason = %reason, "Skipping produced file");
                    collection
                        .notes
                        .push(format!("[labbox] skipped {shown}: {reason}"));
                    None
                }
            };

            if let Err(e) = tokio::fs::remove_file(&path).await {
                tracing::warn!(path = %path.display(), error = %e, "Failed to delete packaged file");
            }
            collection.files.extend(packaged);
        }

        tracing::debug!(
            files = collection.files.len(),
            notes = collection.notes.len(),
            "Collected outputs"
        );
        collection
    }

    async fn package(
        &self,
        path: &Path,
        display: &str,
        primary_taken: &mut bool,
    ) -> Result<ProducedFile, String> {
        let size_bytes = tokio::fs::metadata(path)
            .await
            .map_err(|e| format!("unreadable ({e})"))?
            .len();
        let header = read_header(path)
            .await
            .map_err(|e| format!("unreadable ({e})"))?;

        let extension = path.extension().and_then(|e| e.to_str());
        let kind = ArtifactKind::sniff(&header, extension);
        let dims = dimensions(kind, &header);
        if kind.is_raster() && dims.is_none() {
            return Err(format!("corrupt {kind} header"));
        }

        let mut file = ProducedFile {
            path: display.to_string(),
            kind,
            mime_type: kind.mime_type().to_string(),
            size_bytes,
            dimensions: dims,
            binary_payload: None,
            reference: None,
        };

        if kind.is_raster() && !*primary_taken && size_bytes <= self.max_inline_bytes {
            let bytes = tokio::fs::read(path)
                .await
                .map_err(|e| format!("unreadable ({e})"))?;
            file.size_bytes = bytes.len() as u64;
            file.binary_payload = Some(BASE64.encode(&bytes));
            *primary_taken = true;
            return Ok(file);
        }

        let reference = self
            .artifacts
            .register(display, path, kind.mime_type())
            .await
            .map_err(|e| format!("could not be stored ({e})"))?;
        file.reference = Some(reference);
        Ok(file)
    }
}

/// New or changed regular files, sorted by path.
fn candidates(root: &Path, snapshot: &Snapshot, skip: &[String], notes: &mut Vec<String>) -> Vec<PathBuf> {
    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            e.depth() != 1 || !skip.iter().any(|s| e.file_name() == s.as_str())
        });

    let mut found = Vec::new();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                notes.push(format!("[labbox] could not scan outputs: {e}"));
                continue;
            }
        };
        let Ok(rel) = entry.path().strip_prefix(root) else {
            continue;
        };
        if entry.path_is_symlink() {
            notes.push(format!("[labbox] skipped {}: symbolic link", to_display(rel)));
            continue;
        }
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(meta) = entry.metadata() else {
            notes.push(format!("[labbox] skipped {}: unreadable", to_display(rel)));
            continue;
        };
        let stamp = Stamp {
            len: meta.len(),
            modified: meta.modified().ok(),
        };
        if !snapshot.unchanged(rel, stamp) {
            found.push(rel.to_path_buf());
        }
    }
    found.sort();
    found
}

async fn read_header(path: &Path) -> std::io::Result<Vec<u8>> {
    let file = tokio::fs::File::open(path).await?;
    let mut header = Vec::with_capacity(4096);
    file.take(HEADER_LIMIT as u64).read_to_end(&mut header).await?;
    Ok(header)
}

fn to_display(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
