//! Attachment store: writes decoded attachment payloads under a configured
//! directory and hands back references to them.

use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{MailcatchError, Result};
use crate::model::attachment::AttachmentRef;

/// Longest sanitized filename we write.
const MAX_FILENAME_LEN: usize = 150;

/// Upper bound on `name_N.ext` candidates tried under [`CollisionPolicy::Rename`].
const MAX_RENAME_ATTEMPTS: usize = 10_000;

/// What to do when an attachment's filename is already taken on disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollisionPolicy {
    /// Keep both files: the newcomer becomes `stem_1.ext`, `stem_2.ext`, ...
    #[default]
    Rename,
    /// Replace the existing file. A path may then be shared by several
    /// records, so files written for a rejected message are not removed.
    Overwrite,
}

/// Name-addressed attachment storage rooted at one directory.
#[derive(Debug, Clone)]
pub struct AttachmentStore {
    root: PathBuf,
    policy: CollisionPolicy,
}

impl AttachmentStore {
    /// The directory is created lazily on the first [`put`](Self::put).
    pub fn new(root: impl Into<PathBuf>, policy: CollisionPolicy) -> Self {
        Self {
            root: root.into(),
            policy,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn policy(&self) -> CollisionPolicy {
        self.policy
    }

    /// Write `data` under `filename` and return where it landed.
    pub fn put(&self, filename: &str, data: &[u8]) -> Result<AttachmentRef> {
        std::fs::create_dir_all(&self.root).map_err(|e| MailcatchError::io(&self.root, e))?;

        let target = self.root.join(sanitize_filename(filename));
        let storage_path = match self.policy {
            CollisionPolicy::Overwrite => {
                std::fs::write(&target, data).map_err(|e| MailcatchError::io(&target, e))?;
                target
            }
            CollisionPolicy::Rename => write_new_file(&target, data)?,
        };

        debug!(
            filename = filename,
            path = %storage_path.display(),
            size = data.len(),
            "Stored attachment"
        );

        Ok(AttachmentRef {
            filename: filename.to_string(),
            storage_path,
        })
    }

    /// Read back the bytes behind a reference.
    pub fn read(&self, attachment: &AttachmentRef) -> Result<Vec<u8>> {
        std::fs::read(&attachment.storage_path)
            .map_err(|e| MailcatchError::io(&attachment.storage_path, e))
    }

    /// Delete a stored attachment. A file that is already gone is not an error.
    pub fn remove(&self, attachment: &AttachmentRef) -> Result<()> {
        match std::fs::remove_file(&attachment.storage_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(MailcatchError::io(&attachment.storage_path, e)),
        }
    }
}

/// Create `path`, or the first free `stem_N.ext` next to it, and write `data`.
///
/// `create_new` makes the claim atomic, so concurrent sessions never share a path.
fn write_new_file(path: &Path, data: &[u8]) -> Result<PathBuf> {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("attachment");
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let parent = path.parent().unwrap_or(Path::new("."));

    for i in 0..MAX_RENAME_ATTEMPTS {
        let candidate = match (i, ext.is_empty()) {
            (0, _) => path.to_path_buf(),
            (_, true) => parent.join(format!("{stem}_{i}")),
            (_, false) => parent.join(format!("{stem}_{i}.{ext}")),
        };

        match OpenOptions::new().write(true).create_new(true).open(&candidate) {
            Ok(mut file) => {
                file.write_all(data)
                    .and_then(|()| file.sync_all())
                    .map_err(|e| MailcatchError::io(&candidate, e))?;
                return Ok(candidate);
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(MailcatchError::io(&candidate, e)),
        }
    }

    Err(MailcatchError::StorageWrite(format!(
        "no free filename for '{}' after {MAX_RENAME_ATTEMPTS} attempts",
        path.display()
    )))
}

/// Reduce a declared filename to a safe single path component.
///
/// Directory parts are dropped, characters outside `[A-Za-z0-9._@-]` become
/// `_`, and dot-only results fall back to `attachment`.
pub fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);

    let sanitized: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_' || c == '@' {
                c
            } else {
                '_'
            }
        })
        .take(MAX_FILENAME_LEN)
        .collect();

    if sanitized.chars().all(|c| c == '.') {
        "attachment".to_string()
    } else {
        sanitized
    }
}
