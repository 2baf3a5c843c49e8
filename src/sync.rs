// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Allow-list synchronization.
//!
//! After repositories are acquired or updated, the allowed subset of their
//! content is projected into target directories. Each content item belongs
//! to a __target group__ derived from its source collection, and each target
//! group may be mapped to one destination directory in the configuration.
//! Groups without a destination are simply never projected.
//!
//! # Reconciliation
//!
//! Every pass computes the allow-list afresh from content metadata, the ban
//! set, and sync settings, then:
//!
//! 1. Removes files projected by the previous pass that are no longer
//!    allowed.
//! 2. Copies every allowed file into `<target>/<owner>/<file name>`.
//! 3. Writes the new manifest.
//!
//! The manifest is written last, so it always describes the last completed
//! pass. It lists only files actually placed, so files in target directories
//! that the synchronizer never wrote are never touched, even when they share
//! a name with an allowed item whose source is missing.

pub mod ban;
pub mod content;
pub mod manifest;

use crate::{
    config::{Config, ConfigError, ConfigFile, SyncSettings},
    store::{JsonStore, StoreError},
    sync::{
        ban::{BanError, BanService},
        content::{allow_list, MetadataError, MetadataSource},
        manifest::{Manifest, ManifestEntry},
    },
};

use std::{
    collections::{BTreeMap, BTreeSet},
    fs::{copy, create_dir_all, remove_file},
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{debug, info, instrument, warn};

/// Number of missing source files listed in the pass summary.
const MISSING_PREVIEW: usize = 10;

/// Provider of fresh sync settings.
pub trait SettingsSource {
    /// Read-only inputs of allow-list computation.
    fn sync_settings(&self) -> Result<SyncSettings, ConfigError>;

    /// Destination directory per target group.
    fn sync_targets(&self) -> Result<BTreeMap<String, PathBuf>, ConfigError>;
}

impl SettingsSource for Config {
    fn sync_settings(&self) -> Result<SyncSettings, ConfigError> {
        Ok(self.sync.settings())
    }

    fn sync_targets(&self) -> Result<BTreeMap<String, PathBuf>, ConfigError> {
        Ok(self.sync.targets.clone())
    }
}

impl SettingsSource for ConfigFile {
    fn sync_settings(&self) -> Result<SyncSettings, ConfigError> {
        Ok(self.load()?.sync.settings())
    }

    fn sync_targets(&self) -> Result<BTreeMap<String, PathBuf>, ConfigError> {
        Ok(self.load()?.sync.targets)
    }
}

/// Outcome of one synchronization pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    /// Files copied into target directories.
    pub synced: usize,

    /// Previously projected files removed.
    pub removed: usize,

    /// Allowed items whose source file does not exist.
    pub missing: Vec<PathBuf>,

    /// Pass stopped before touching anything.
    pub skipped: bool,
}

impl SyncReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }
}

/// Project allowed content into target directories.
#[derive(Debug)]
pub struct Synchronizer<M, S> {
    metadata: M,
    settings: S,
    repos_root: PathBuf,
    manifest: Manifest,
    bans: BanService,
}

impl<M, S> Synchronizer<M, S>
where
    M: MetadataSource,
    S: SettingsSource,
{
    /// Construct new synchronizer.
    ///
    /// Source files are looked up below `repos_root`, and the manifest and
    /// ban set live in `store`.
    pub fn new(metadata: M, settings: S, repos_root: impl Into<PathBuf>, store: Arc<JsonStore>) -> Self {
        Self {
            metadata,
            settings,
            repos_root: repos_root.into(),
            manifest: Manifest::new(store.clone()),
            bans: BanService::new(store),
        }
    }

    /// Run one synchronization pass.
    ///
    /// An initial pass additionally seeds an empty ban set if none exists.
    /// Missing source files and per-file copy or removal failures are logged
    /// and skipped.
    ///
    /// # Errors
    ///
    /// - Return [`SyncError::Metadata`] if content metadata cannot be loaded.
    /// - Return [`SyncError::Config`] if settings cannot be loaded.
    /// - Return [`SyncError::Store`] if bans or manifest cannot be accessed.
    #[instrument(skip(self), level = "debug")]
    pub fn synchronize(&self, is_initial: bool) -> Result<SyncReport> {
        let items = self.metadata.content_items()?;
        if items.is_empty() {
            warn!("no content metadata available, leaving targets untouched");
            return Ok(SyncReport::skipped());
        }

        let settings = self.settings.sync_settings()?;
        let targets = self.settings.sync_targets()?;
        if targets.is_empty() {
            warn!("no target directory configured, nothing to synchronize");
            return Ok(SyncReport::skipped());
        }

        if is_initial {
            self.bans.seed()?;
        }
        let bans = self.bans.bans()?;

        debug!(
            "enabled = {}, purification level = {}, filter = {:?}",
            settings.enabled, settings.purification_level, settings.filter
        );
        if !settings.enabled {
            info!("synchronization disabled, retracting projected content");
        }

        let allowed = allow_list(&items, &settings, &bans);
        let keep = allowed
            .iter()
            .filter(|item| targets.contains_key(item.target_group()))
            .map(|item| ManifestEntry::from(*item))
            .collect::<BTreeSet<_>>();

        let previous = self.manifest.load()?;
        let mut report = SyncReport {
            removed: self.retract(&previous, &keep, &targets),
            ..SyncReport::default()
        };

        // INVARIANT: Only files this synchronizer placed are ever listed.
        let mut placed = previous
            .into_iter()
            .filter(|entry| keep.contains(entry))
            .collect::<BTreeSet<_>>();

        for item in allowed {
            let Some(target_dir) = targets.get(item.target_group()) else {
                continue;
            };

            let source = item.source(&self.repos_root);
            if !source.is_file() {
                report.missing.push(source);
                continue;
            }

            let destination = item.destination(target_dir);
            match place(&source, &destination) {
                Ok(()) => {
                    placed.insert(ManifestEntry::from(item));
                    report.synced += 1;
                }
                Err(err) => warn!("failed to copy {:?}: {err}", destination.display()),
            }
        }

        summarize_missing(&report.missing);

        // INVARIANT: Manifest describes last completed pass.
        self.manifest.save(placed.into_iter().collect())?;
        info!("synchronized {} files, removed {}", report.synced, report.removed);

        Ok(report)
    }

    fn retract(
        &self,
        previous: &[ManifestEntry],
        keep: &BTreeSet<ManifestEntry>,
        targets: &BTreeMap<String, PathBuf>,
    ) -> usize {
        let mut removed = 0;
        for entry in previous {
            if keep.contains(entry) {
                continue;
            }

            let Some(target_dir) = targets.get(&entry.target_group) else {
                debug!(
                    "target group {:?} no longer configured, leaving {} in place",
                    entry.target_group, entry.relative_path
                );
                continue;
            };

            let destination = entry.destination(target_dir);
            match remove_file(&destination) {
                Ok(()) => {
                    debug!("removed {:?}", destination.display());
                    removed += 1;
                }
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => warn!("failed to remove {:?}: {err}", destination.display()),
            }
        }

        removed
    }
}

fn place(source: &Path, destination: &Path) -> std::io::Result<()> {
    if let Some(parent) = destination.parent() {
        create_dir_all(parent)?;
    }

    copy(source, destination).map(|_| ())
}

fn summarize_missing(missing: &[PathBuf]) {
    if missing.is_empty() {
        return;
    }

    let preview = missing
        .iter()
        .take(MISSING_PREVIEW)
        .map(|path| format!("  {}", path.display()))
        .collect::<Vec<_>>()
        .join("\n");
    let rest = missing.len().saturating_sub(MISSING_PREVIEW);
    if rest > 0 {
        warn!("{} source files missing:\n{preview}\n  ... and {rest} more", missing.len());
    } else {
        warn!("{} source files missing:\n{preview}", missing.len());
    }
}

/// Synchronization error types.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Ban(#[from] BanError),
}

/// Friendly result alias :3
pub type Result<T, E = SyncError> = std::result::Result<T, E>;
