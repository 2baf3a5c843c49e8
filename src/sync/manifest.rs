// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Record of what the last synchronization pass projected.
//!
//! Knowing exactly which files were placed into target directories lets the
//! next pass retract those that fell out of the allow-list, without ever
//! touching files a user put there by hand.

use crate::{
    store::{JsonStore, StoreError},
    sync::content::{file_name, ContentItem},
};

use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

const MANIFEST_KEY: &str = "manifest.entries";

/// One projected file.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
pub struct ManifestEntry {
    pub relative_path: String,
    pub target_group: String,
    pub owner: String,
}

impl ManifestEntry {
    /// Where this entry's file was placed inside `target_dir`.
    pub fn destination(&self, target_dir: &Path) -> PathBuf {
        target_dir
            .join(&self.owner)
            .join(file_name(&self.relative_path))
    }
}

impl From<&ContentItem> for ManifestEntry {
    fn from(item: &ContentItem) -> Self {
        Self {
            relative_path: item.relative_path.clone(),
            target_group: item.target_group().to_string(),
            owner: item.owner.clone(),
        }
    }
}

/// Persisted manifest inside the state store.
#[derive(Debug, Clone)]
pub struct Manifest {
    store: Arc<JsonStore>,
}

impl Manifest {
    pub fn new(store: Arc<JsonStore>) -> Self {
        Self { store }
    }

    /// Entries of the last pass. Empty before the first one.
    pub fn load(&self) -> Result<Vec<ManifestEntry>, StoreError> {
        self.store.get(MANIFEST_KEY, Vec::new())
    }

    /// Replace manifest with `entries`, sorted without duplicates.
    pub fn save(&self, mut entries: Vec<ManifestEntry>) -> Result<(), StoreError> {
        entries.sort();
        entries.dedup();
        self.store.set(MANIFEST_KEY, &entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn entry(relative_path: &str, target_group: &str, owner: &str) -> ManifestEntry {
        ManifestEntry {
            relative_path: relative_path.into(),
            target_group: target_group.into(),
            owner: owner.into(),
        }
    }

    #[test]
    fn manifest_round_trips_sorted() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let manifest = Manifest::new(Arc::new(JsonStore::open(dir.path())?));
        assert!(manifest.load()?.is_empty());

        let second = entry("sr-character/Acheron/acherongu1.webp", "sr", "Acheron");
        let first = entry("gs-character/Furina/furinagu1.webp", "gs", "Furina");
        manifest.save(vec![second.clone(), first.clone(), second.clone()])?;
        assert_eq!(manifest.load()?, vec![first, second]);

        Ok(())
    }

    #[test]
    fn destination_uses_basename() {
        let entry = entry("gs-character/Furina/furinagu1.webp", "gs", "Furina");
        assert_eq!(
            entry.destination(Path::new("/targets/gs")),
            PathBuf::from("/targets/gs/Furina/furinagu1.webp")
        );
    }
}
