// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Content items and their allow predicate.
//!
//! The core repository ships a JSON index, `ImageData.json`, describing every
//! file the gallery repositories carry: where it lives, who it belongs to,
//! which collection it came from, and a set of attribute flags. Each record
//! becomes one [`ContentItem`].
//!
//! An item is __allowed__ when every one of these holds:
//!
//! - Synchronization is enabled at all.
//! - Item is not banned, neither by the user nor by upstream's own flag.
//! - Item is not purified out by the current purification level.
//! - Item is not in a category whose filter toggle is off.

use crate::config::{FilterSettings, PurificationLevel, SyncSettings};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::BTreeSet,
    fmt::{Display, Formatter, Result as FmtResult},
    fs::read_to_string,
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tracing::{debug, warn};

/// File name of the content index inside the core repository.
pub const IMAGE_DATA_FILE: &str = "ImageData.json";

/// Relative paths excluded by hand.
pub type BanSet = BTreeSet<String>;

/// Attribute flags of a content item.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Attributes {
    #[serde(rename = "isAiImage")]
    pub ai_generated: bool,

    /// Tier-1 restricted, purified from level 1.
    #[serde(rename = "isRx18")]
    pub tier1: bool,

    /// Tier-2 restricted, purified from level 2.
    #[serde(rename = "isPx18")]
    pub tier2: bool,

    #[serde(rename = "isEasterEgg")]
    pub easter_egg: bool,

    pub layout: Option<String>,

    #[serde(rename = "secondaryTags")]
    pub secondary_tags: Vec<String>,

    /// Upstream marked the item as banned.
    #[serde(rename = "isBan")]
    pub banned: bool,
}

impl Attributes {
    /// Item uses the fullscreen layout kind.
    pub fn is_fullscreen(&self) -> bool {
        matches!(self.layout.as_deref(), Some("fullscreen" | "landscape"))
    }
}

/// Why an item is excluded from the allow-list by rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ExclusionReason {
    Purified,
    Ai,
    EasterEgg,
    Layout,
}

impl Display for ExclusionReason {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        let reason = match self {
            Self::Purified => "purified",
            Self::Ai => "ai generated",
            Self::EasterEgg => "easter egg",
            Self::Layout => "fullscreen layout",
        };
        fmt.write_str(reason)
    }
}

/// One file known to the content index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentItem {
    /// Path inside its storage box, always with `/` separators.
    pub relative_path: String,

    /// Repository directory holding the file.
    pub storage_box: String,

    /// Owner the file is grouped under in target directories.
    pub owner: String,

    /// Collection the file came from, e.g. `gs-character`.
    pub source_collection: String,

    pub attributes: Attributes,
}

impl ContentItem {
    /// Target group key: source collection up to its first `-`.
    pub fn target_group(&self) -> &str {
        self.source_collection
            .split('-')
            .next()
            .filter(|group| !group.is_empty())
            .unwrap_or("unknown")
    }

    /// Basename of the relative path.
    pub fn file_name(&self) -> &str {
        file_name(&self.relative_path)
    }

    /// Where the file lands inside `target_dir`.
    pub fn destination(&self, target_dir: &Path) -> PathBuf {
        target_dir.join(&self.owner).join(self.file_name())
    }

    /// Where the file lives below the repository root.
    pub fn source(&self, repos_root: &Path) -> PathBuf {
        repos_root.join(&self.storage_box).join(&self.relative_path)
    }

    /// Excluded by current purification level.
    pub fn is_purified(&self, level: PurificationLevel) -> bool {
        (level.get() >= 1 && self.attributes.tier1) || (level.get() >= 2 && self.attributes.tier2)
    }

    /// Excluded by hand or by upstream.
    pub fn is_banned(&self, bans: &BanSet) -> bool {
        self.attributes.banned || bans.contains(&self.relative_path)
    }

    /// Every rule currently excluding this item, bans left out.
    pub fn exclusion_reasons(&self, settings: &SyncSettings) -> Vec<ExclusionReason> {
        let mut reasons = Vec::new();
        if self.is_purified(settings.purification_level) {
            reasons.push(ExclusionReason::Purified);
        }
        reasons.extend(self.filtered_by(&settings.filter));
        reasons
    }

    fn filtered_by(&self, filter: &FilterSettings) -> Vec<ExclusionReason> {
        let mut reasons = Vec::new();
        if !filter.ai && self.attributes.ai_generated {
            reasons.push(ExclusionReason::Ai);
        }
        if !filter.easter_egg && self.attributes.easter_egg {
            reasons.push(ExclusionReason::EasterEgg);
        }
        if !filter.layout && self.attributes.is_fullscreen() {
            reasons.push(ExclusionReason::Layout);
        }
        reasons
    }

    /// Item may be projected into target directories.
    pub fn is_allowed(&self, settings: &SyncSettings, bans: &BanSet) -> bool {
        settings.enabled && !self.is_banned(bans) && self.exclusion_reasons(settings).is_empty()
    }
}

pub(crate) fn file_name(relative_path: &str) -> &str {
    relative_path.rsplit('/').next().unwrap_or(relative_path)
}

/// Compute allow-list of `items`.
pub fn allow_list<'i>(
    items: &'i [ContentItem],
    settings: &SyncSettings,
    bans: &BanSet,
) -> Vec<&'i ContentItem> {
    items
        .iter()
        .filter(|item| item.is_allowed(settings, bans))
        .collect()
}

/// Provider of the current content items.
pub trait MetadataSource {
    /// Load every content item afresh.
    fn content_items(&self) -> Result<Vec<ContentItem>>;
}

/// Content index file inside the core repository.
#[derive(Debug, Clone)]
pub struct ImageDataFile {
    path: PathBuf,
}

impl ImageDataFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Index at its usual place inside working copy `work_tree`.
    pub fn in_repository(work_tree: &Path) -> Self {
        Self::new(work_tree.join(IMAGE_DATA_FILE))
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }
}

#[derive(Deserialize)]
struct Record {
    path: Option<String>,
    storagebox: Option<String>,
    #[serde(rename = "characterName")]
    character_name: Option<String>,
    #[serde(rename = "sourceGallery", default)]
    source_gallery: Option<String>,
    #[serde(default)]
    attributes: Attributes,
}

impl Record {
    fn into_item(self) -> Option<ContentItem> {
        let relative_path = self.path.filter(|path| !path.is_empty())?.replace('\\', "/");
        let storage_box = self.storagebox.filter(|name| !name.is_empty())?;
        let owner = self.character_name.filter(|name| !name.is_empty())?;

        Some(ContentItem {
            relative_path,
            storage_box,
            owner,
            source_collection: self.source_gallery.unwrap_or_default(),
            attributes: self.attributes,
        })
    }
}

impl MetadataSource for ImageDataFile {
    /// Parse the index.
    ///
    /// A missing index yields no items. Incomplete records are skipped.
    fn content_items(&self) -> Result<Vec<ContentItem>> {
        let content = match read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                warn!("content index {:?} not found", self.path.display());
                return Ok(Vec::new());
            }
            Err(err) => {
                return Err(MetadataError::Read {
                    source: err,
                    path: self.path.clone(),
                })
            }
        };

        let records: Vec<Value> = serde_json::from_str(&content).map_err(|err| MetadataError::Parse {
            source: err,
            path: self.path.clone(),
        })?;

        let total = records.len();
        let items = records
            .into_iter()
            .filter_map(|value| {
                let item = serde_json::from_value::<Record>(value.clone())
                    .ok()
                    .and_then(Record::into_item);
                if item.is_none() {
                    warn!("skipping incomplete content record: {value}");
                }
                item
            })
            .collect::<Vec<_>>();

        debug!("loaded {} of {total} content records", items.len());
        Ok(items)
    }
}

/// Metadata loading error types.
#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    /// Content index cannot be read.
    #[error("failed to read content index at {:?}", path.display())]
    Read {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Content index is not a JSON array.
    #[error("content index at {:?} is not a JSON array", path.display())]
    Parse {
        #[source]
        source: serde_json::Error,
        path: PathBuf,
    },
}

/// Friendly result alias :3
pub type Result<T, E = MetadataError> = std::result::Result<T, E>;
