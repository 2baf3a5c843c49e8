// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Atomic delivery of finished clones.
//!
//! A clone is always made in scratch space first. Only after the VCS tool
//! exits successfully is the result moved over the repository's stable
//! location, so nobody ever observes a half-cloned working copy there.
//!
//! Moving prefers a plain rename. When the rename fails because scratch
//! space lives on another device, or because some file is still held open,
//! the tree is copied file by file instead.

use mkdirp::mkdirp;
use std::{
    fs::{copy, create_dir_all, read_link},
    io::ErrorKind,
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::{fs, task::spawn_blocking, time::sleep};
use tracing::{debug, instrument, warn};
use walkdir::WalkDir;

/// Move finished clone at `source` to `target`.
///
/// Waits `grace` first so the exited VCS process has released its handles,
/// then replaces whatever lives at `target`.
///
/// # Errors
///
/// - Return [`DeliveryError::Remove`] if old `target` cannot be removed.
/// - Return [`DeliveryError::CreateParent`] if parent of `target` cannot be
///   created.
/// - Return [`DeliveryError::Rename`] if rename fails for a reason that a
///   copy cannot work around.
/// - Return [`DeliveryError::Copy`] if fallback copy fails. Partially copied
///   files are removed again.
#[instrument(skip_all, fields(target = %target.display()), level = "debug")]
pub async fn deliver(source: &Path, target: &Path, grace: Duration) -> Result<()> {
    sleep(grace).await;

    remove_path(target).await?;
    if let Some(parent) = target.parent() {
        mkdirp(parent).map_err(|err| DeliveryError::CreateParent {
            source: err,
            path: parent.to_path_buf(),
        })?;
    }

    match fs::rename(source, target).await {
        Ok(()) => Ok(()),
        Err(err) if is_recoverable_rename_error(&err) => {
            warn!("cannot rename into place ({err}), copying instead");
            let (from, to) = (source.to_path_buf(), target.to_path_buf());
            let copied = spawn_blocking(move || copy_tree(&from, &to)).await?;
            match copied {
                Ok(count) => {
                    debug!("copied {count} files into place");
                    Ok(())
                }
                Err(err) => {
                    // INVARIANT: Never leave a half-written working copy behind.
                    if let Err(cleanup) = remove_path(target).await {
                        warn!("failed to remove partial copy: {cleanup}");
                    }
                    Err(err)
                }
            }
        }
        Err(err) => Err(DeliveryError::Rename {
            source: err,
            from: source.to_path_buf(),
            to: target.to_path_buf(),
        }),
    }
}

/// Rename failure that a recursive copy can work around.
///
/// Covers cross-device moves, busy or locked files, and the permission
/// errors some platforms report for locked files.
pub fn is_recoverable_rename_error(err: &std::io::Error) -> bool {
    err.kind() == ErrorKind::PermissionDenied || err.raw_os_error().is_some_and(is_busy_or_cross_device)
}

#[cfg(unix)]
fn is_busy_or_cross_device(code: i32) -> bool {
    use nix::errno::Errno;

    [Errno::EXDEV, Errno::EBUSY, Errno::ETXTBSY]
        .into_iter()
        .any(|errno| errno as i32 == code)
}

#[cfg(windows)]
fn is_busy_or_cross_device(code: i32) -> bool {
    // ERROR_NOT_SAME_DEVICE, ERROR_SHARING_VIOLATION, ERROR_LOCK_VIOLATION
    matches!(code, 17 | 32 | 33)
}

#[cfg(not(any(unix, windows)))]
fn is_busy_or_cross_device(_code: i32) -> bool {
    false
}

/// Copy directory tree at `source` into `target`, returning number of files
/// copied.
///
/// Symbolic links are recreated as links on unix.
pub fn copy_tree(source: &Path, target: &Path) -> Result<u64> {
    let mut count = 0;
    for entry in WalkDir::new(source) {
        let entry = entry?;
        let Ok(relative) = entry.path().strip_prefix(source) else {
            continue;
        };
        let destination = target.join(relative);
        let file_type = entry.file_type();

        let copied = if file_type.is_dir() {
            create_dir_all(&destination)
        } else if file_type.is_symlink() {
            copy_link(entry.path(), &destination)
        } else {
            copy(entry.path(), &destination).map(|_| ())
        };

        copied.map_err(|err| DeliveryError::Copy {
            source: err,
            path: entry.path().to_path_buf(),
        })?;

        if !file_type.is_dir() {
            count += 1;
        }
    }

    Ok(count)
}

#[cfg(unix)]
fn copy_link(link: &Path, destination: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(read_link(link)?, destination)
}

#[cfg(not(unix))]
fn copy_link(link: &Path, destination: &Path) -> std::io::Result<()> {
    let _ = read_link(link)?;
    copy(link, destination).map(|_| ())
}

/// Remove file or directory tree at `path`.
///
/// Returns `false` if nothing was there. Missing paths are not an error.
pub async fn remove_path(path: &Path) -> Result<bool> {
    let metadata = match fs::symlink_metadata(path).await {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(false),
        Err(err) => {
            return Err(DeliveryError::Remove {
                source: err,
                path: path.to_path_buf(),
            })
        }
    };

    let removed = if metadata.is_dir() {
        fs::remove_dir_all(path).await
    } else {
        fs::remove_file(path).await
    };

    match removed {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(DeliveryError::Remove {
            source: err,
            path: path.to_path_buf(),
        }),
    }
}

/// Total size in bytes of every file below `path`.
///
/// Unreadable entries are skipped.
pub fn dir_size(path: &Path) -> u64 {
    WalkDir::new(path)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|metadata| metadata.len())
        .sum()
}

/// Delivery error types.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// Existing path cannot be removed.
    #[error("failed to remove {:?}", path.display())]
    Remove {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Parent directory of target cannot be created.
    #[error("failed to create directory {:?}", path.display())]
    CreateParent {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Rename failed and cannot be worked around.
    #[error("failed to move {:?} to {:?}", from.display(), to.display())]
    Rename {
        #[source]
        source: std::io::Error,
        from: PathBuf,
        to: PathBuf,
    },

    /// Fallback copy failed.
    #[error("failed to copy {:?}", path.display())]
    Copy {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Source tree cannot be walked.
    #[error(transparent)]
    Walk(#[from] walkdir::Error),

    /// Blocking copy task died.
    #[error(transparent)]
    Join(#[from] tokio::task::JoinError),
}

/// Friendly result alias :3
pub type Result<T, E = DeliveryError> = std::result::Result<T, E>;
