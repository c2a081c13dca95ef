//! Filesystem helpers shared by the file phases.
//!
//! Every operation is bounded by a per-operation timeout and reports the
//! path it failed on.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::PhaseError;
use crate::saga::RemoveResourceFiles;

use super::template::{Escape, TemplateVars, is_text_file};

/// Run one filesystem operation under `limit`.
pub(crate) async fn timed<T, F>(
    limit: Duration,
    context: impl FnOnce() -> String,
    op: F,
) -> Result<T, PhaseError>
where
    F: Future<Output = io::Result<T>>,
{
    match tokio::time::timeout(limit, op).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(PhaseError::io(context(), e)),
        Err(_) => Err(PhaseError::Timeout {
            operation: context(),
            after: limit,
        }),
    }
}

/// Whether `path` exists, without following a failure into an error.
pub(crate) async fn exists(limit: Duration, path: &Path) -> Result<bool, PhaseError> {
    timed(
        limit,
        || format!("failed to inspect {}", path.display()),
        tokio::fs::try_exists(path),
    )
    .await
}

/// Paths a phase created, in creation order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct WrittenPaths {
    pub files: Vec<PathBuf>,
    pub dirs: Vec<PathBuf>,
}

impl WrittenPaths {
    pub fn len(&self) -> usize {
        self.files.len() + self.dirs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.dirs.is_empty()
    }

    pub fn into_compensation(self) -> RemoveResourceFiles {
        RemoveResourceFiles {
            files: self.files,
            dirs: self.dirs,
        }
    }
}

/// Create `dir` and any missing parents, recording each one created.
pub(crate) async fn create_dirs(
    limit: Duration,
    dir: &Path,
    written: &mut WrittenPaths,
) -> Result<(), PhaseError> {
    let mut missing = Vec::new();
    let mut cursor = Some(dir);
    while let Some(path) = cursor {
        if path.as_os_str().is_empty() || exists(limit, path).await? {
            break;
        }
        missing.push(path.to_path_buf());
        cursor = path.parent();
    }

    for path in missing.into_iter().rev() {
        timed(
            limit,
            || format!("failed to create {}", path.display()),
            tokio::fs::create_dir(&path),
        )
        .await?;
        written.dirs.push(path);
    }
    Ok(())
}

/// Make sure `dir` exists without recording it. Used for shared parents
/// that other tasks may be creating at the same time.
pub(crate) async fn ensure_shared_dir(limit: Duration, dir: &Path) -> Result<(), PhaseError> {
    timed(
        limit,
        || format!("failed to create {}", dir.display()),
        tokio::fs::create_dir_all(dir),
    )
    .await
}

/// Write `contents` to `path`, recording it if it did not exist before.
pub(crate) async fn write_file(
    limit: Duration,
    path: &Path,
    contents: impl AsRef<[u8]>,
    written: &mut WrittenPaths,
) -> Result<(), PhaseError> {
    let existed = exists(limit, path).await?;
    timed(
        limit,
        || format!("failed to write {}", path.display()),
        tokio::fs::write(path, contents),
    )
    .await?;
    if !existed {
        written.files.push(path.to_path_buf());
    }
    Ok(())
}

/// Copy the tree under `src` into `dst`.
///
/// Text files are rendered through `vars` when given; everything else is
/// copied byte-for-byte. Symlinks are followed. Only paths that did not
/// exist before are recorded in `written`.
pub(crate) async fn copy_tree(
    limit: Duration,
    src: &Path,
    dst: &Path,
    vars: Option<&TemplateVars>,
    written: &mut WrittenPaths,
) -> Result<usize, PhaseError> {
    create_dirs(limit, dst, written).await?;

    let mut copied = 0;
    let mut pending = vec![(src.to_path_buf(), dst.to_path_buf())];

    while let Some((from_dir, to_dir)) = pending.pop() {
        let mut names = Vec::new();
        let mut entries = timed(
            limit,
            || format!("failed to read {}", from_dir.display()),
            tokio::fs::read_dir(&from_dir),
        )
        .await?;
        while let Some(entry) = timed(
            limit,
            || format!("failed to read {}", from_dir.display()),
            entries.next_entry(),
        )
        .await?
        {
            names.push(entry.file_name());
        }
        names.sort();

        for name in names {
            let from = from_dir.join(&name);
            let to = to_dir.join(&name);
            let meta = timed(
                limit,
                || format!("failed to read {}", from.display()),
                tokio::fs::metadata(&from),
            )
            .await?;

            if meta.is_dir() {
                create_dirs(limit, &to, written).await?;
                pending.push((from, to));
                continue;
            }

            match vars {
                Some(vars) if is_text_file(&from) => {
                    let text = timed(
                        limit,
                        || format!("failed to read {}", from.display()),
                        tokio::fs::read_to_string(&from),
                    )
                    .await?;
                    let rendered = vars.render(&text, Escape::for_path(&from));
                    write_file(limit, &to, rendered, written).await?;
                }
                _ => {
                    let existed = exists(limit, &to).await?;
                    timed(
                        limit,
                        || format!("failed to copy {} to {}", from.display(), to.display()),
                        tokio::fs::copy(&from, &to),
                    )
                    .await?;
                    if !existed {
                        written.files.push(to);
                    }
                }
            }
            copied += 1;
        }
    }

    Ok(copied)
}
