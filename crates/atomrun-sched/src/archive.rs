//! Job directory archives.
//!
//! An archive is a gzip-compressed JSON manifest of every file in a job
//! directory (contents base64-encoded) together with the subset of paths
//! that were inputs when the job was claimed. The claim marker is never
//! archived. Restoring an archive writes the input files only, which puts a
//! job back into its prepared state.

use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::bid::BID_MARKER;
use crate::error::{SchedError, SchedResult};

/// A single archived file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivedFile {
    /// Path relative to the job directory, `/`-separated.
    pub path: String,

    /// Base64-encoded contents.
    pub contents: String,
}

/// Archive of a job directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobArchive {
    /// Every archived file.
    pub files: Vec<ArchivedFile>,

    /// Relative paths of the files present when the job was claimed.
    pub inputs: Vec<String>,
}

impl JobArchive {
    /// Archive the contents of `job_dir`, tagging `inputs` as input files.
    pub async fn from_directory(job_dir: &Path, inputs: &[String]) -> SchedResult<Self> {
        let mut files = Vec::new();
        for rel in relative_files(job_dir).await? {
            let bytes = tokio::fs::read(job_dir.join(&rel)).await?;
            files.push(ArchivedFile {
                path: rel,
                contents: BASE64.encode(bytes),
            });
        }

        let inputs = inputs
            .iter()
            .filter(|input| files.iter().any(|f| &f.path == *input))
            .cloned()
            .collect();

        Ok(Self { files, inputs })
    }

    /// Serialize and gzip the archive.
    pub fn encode(&self) -> SchedResult<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&json)
            .map_err(|e| SchedError::Archive(format!("gzip compression failed: {e}")))?;
        encoder
            .finish()
            .map_err(|e| SchedError::Archive(format!("gzip finalize failed: {e}")))
    }

    /// Decode an archive produced by [`JobArchive::encode`].
    pub fn decode(bytes: &[u8]) -> SchedResult<Self> {
        let mut json = Vec::new();
        GzDecoder::new(bytes)
            .read_to_end(&mut json)
            .map_err(|e| SchedError::Archive(format!("gzip decompression failed: {e}")))?;
        Ok(serde_json::from_slice(&json)?)
    }

    /// Decoded contents of an archived file.
    pub fn file(&self, path: &str) -> SchedResult<Option<Vec<u8>>> {
        self.files
            .iter()
            .find(|f| f.path == path)
            .map(|f| {
                BASE64
                    .decode(&f.contents)
                    .map_err(|e| SchedError::Archive(format!("invalid base64 in {path}: {e}")))
            })
            .transpose()
    }

    /// Write the input files into `job_dir`, creating it if needed.
    ///
    /// Returns the number of files written.
    pub async fn restore_inputs(&self, job_dir: &Path) -> SchedResult<usize> {
        tokio::fs::create_dir_all(job_dir).await?;

        let mut written = 0;
        for input in &self.inputs {
            let target = job_dir.join(safe_relative(input)?);
            let Some(bytes) = self.file(input)? else {
                continue;
            };
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&target, bytes).await?;
            written += 1;
        }
        Ok(written)
    }
}

/// Relative paths of every file below `job_dir`, excluding the claim marker,
/// in sorted order.
///
/// Symbolic links are followed, so a linked potential file is archived with
/// the contents it points to. Sockets, fifos and dangling links are skipped
/// with a warning. Names that are not valid UTF-8 are an error.
pub async fn relative_files(job_dir: &Path) -> SchedResult<Vec<String>> {
    let mut files = Vec::new();
    let mut pending = vec![PathBuf::new()];
    let mut visited = FxHashSet::default();

    while let Some(rel_dir) = pending.pop() {
        let dir = job_dir.join(&rel_dir);
        // Linked directories can form cycles.
        if !visited.insert(tokio::fs::canonicalize(&dir).await?) {
            continue;
        }

        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let rel = rel_dir.join(entry.file_name());
            let mut file_type = entry.file_type().await?;
            if file_type.is_symlink() {
                match tokio::fs::metadata(entry.path()).await {
                    Ok(meta) => file_type = meta.file_type(),
                    Err(e) => {
                        warn!("Not archiving {}: {}", entry.path().display(), e);
                        continue;
                    }
                }
            }

            if file_type.is_dir() {
                pending.push(rel);
            } else if file_type.is_file() {
                if rel.as_os_str() == BID_MARKER {
                    continue;
                }
                files.push(to_manifest_path(&rel)?);
            } else {
                warn!("Not archiving special file {}", entry.path().display());
            }
        }
    }

    files.sort();
    Ok(files)
}

fn to_manifest_path(rel: &Path) -> SchedResult<String> {
    let parts = rel
        .components()
        .map(|c| {
            c.as_os_str().to_str().ok_or_else(|| {
                SchedError::Archive(format!("file name is not valid UTF-8: {}", rel.display()))
            })
        })
        .collect::<SchedResult<Vec<_>>>()?;
    Ok(parts.join("/"))
}

/// Reject manifest paths that would escape the job directory.
fn safe_relative(path: &str) -> SchedResult<PathBuf> {
    let rel = PathBuf::from(path);
    if rel
        .components()
        .all(|c| matches!(c, Component::Normal(_)))
    {
        Ok(rel)
    } else {
        Err(SchedError::Archive(format!("unsafe path in archive: {path}")))
    }
}
