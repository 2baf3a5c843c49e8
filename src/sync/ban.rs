// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Manual ban management.
//!
//! Users may exclude single content items by hand on top of every automatic
//! rule. Bans are stored as relative paths in the `bans` state document.
//!
//! Items already excluded by the current purification level cannot be banned
//! or unbanned. Their visibility is owned by that level, so a manual entry
//! would have no effect until the level is lowered, at which point it would
//! surprise the user.

use crate::{
    config::{PurificationLevel, SyncSettings},
    store::{JsonStore, StoreError},
    sync::content::{BanSet, ContentItem, ExclusionReason},
};

use std::sync::Arc;
use tracing::info;

const BANS_KEY: &str = "bans.paths";

/// Manage manual bans.
#[derive(Debug, Clone)]
pub struct BanService {
    store: Arc<JsonStore>,
}

impl BanService {
    pub fn new(store: Arc<JsonStore>) -> Self {
        Self { store }
    }

    /// Current ban set.
    ///
    /// # Errors
    ///
    /// - Return [`BanError::Store`] if state store cannot be read.
    pub fn bans(&self) -> Result<BanSet> {
        Ok(self.store.get(BANS_KEY, BanSet::new())?)
    }

    /// Write an empty ban set if none was ever stored.
    pub fn seed(&self) -> Result<()> {
        let stored: Option<BanSet> = self.store.get(BANS_KEY, None)?;
        if stored.is_none() {
            self.store.set(BANS_KEY, &BanSet::new())?;
        }

        Ok(())
    }

    /// Ban `item`.
    ///
    /// # Errors
    ///
    /// - Return [`BanError::Purified`] if `item` is purified at `level`.
    /// - Return [`BanError::AlreadyBanned`] if `item` is banned already.
    pub fn add(&self, item: &ContentItem, level: PurificationLevel) -> Result<()> {
        refuse_purified(item, level)?;

        let mut inserted = false;
        self.store.update(BANS_KEY, BanSet::new(), |bans| {
            inserted = bans.insert(item.relative_path.clone());
        })?;

        if !inserted {
            return Err(BanError::AlreadyBanned(item.relative_path.clone()));
        }

        info!("banned {} ({})", item.file_name(), item.owner);
        Ok(())
    }

    /// Lift ban of `item`.
    ///
    /// # Errors
    ///
    /// - Return [`BanError::Purified`] if `item` is purified at `level`.
    /// - Return [`BanError::NotBanned`] if `item` carries no manual ban.
    pub fn remove(&self, item: &ContentItem, level: PurificationLevel) -> Result<()> {
        refuse_purified(item, level)?;

        let mut removed = false;
        self.store.update(BANS_KEY, BanSet::new(), |bans| {
            removed = bans.remove(&item.relative_path);
        })?;

        if !removed {
            return Err(BanError::NotBanned(item.relative_path.clone()));
        }

        info!("unbanned {} ({})", item.file_name(), item.owner);
        Ok(())
    }

    /// Split excluded `items` into manual bans, upstream bans, and rule
    /// exclusions.
    ///
    /// A manual ban wins over an upstream ban, and either wins over rules.
    pub fn categorize(&self, items: &[ContentItem], settings: &SyncSettings) -> Result<BanCategories> {
        let bans = self.bans()?;
        let mut categories = BanCategories::default();

        for item in items {
            if bans.contains(&item.relative_path) {
                categories.user_banned.push(item.clone());
                continue;
            }

            if item.attributes.banned {
                categories.upstream_banned.push(item.clone());
                continue;
            }

            let reasons = item.exclusion_reasons(settings);
            if !reasons.is_empty() {
                categories.rule_excluded.push((item.clone(), reasons));
            }
        }

        Ok(categories)
    }
}

fn refuse_purified(item: &ContentItem, level: PurificationLevel) -> Result<()> {
    if item.is_purified(level) {
        return Err(BanError::Purified {
            file: item.file_name().to_string(),
            level,
        });
    }

    Ok(())
}

/// Excluded items grouped by cause.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BanCategories {
    pub user_banned: Vec<ContentItem>,
    pub upstream_banned: Vec<ContentItem>,
    pub rule_excluded: Vec<(ContentItem, Vec<ExclusionReason>)>,
}

/// Find item named by `identifier`.
///
/// Accepts an exact relative path, or an owner name directly followed by an
/// image number, e.g. `Furina3` for `.../furinagu3.webp`. Names compare
/// case-insensitively.
pub fn find_item<'i>(items: &'i [ContentItem], identifier: &str) -> Option<&'i ContentItem> {
    let identifier = identifier.trim().replace('\\', "/");
    if let Some(item) = items.iter().find(|item| item.relative_path == identifier) {
        return Some(item);
    }

    let split = identifier.find(|ch: char| ch.is_ascii_digit())?;
    let (owner, number) = identifier.split_at(split);
    if owner.is_empty() || !number.chars().all(|ch| ch.is_ascii_digit()) {
        return None;
    }

    let owner = owner.to_lowercase();
    let expect = format!("{owner}gu{number}.webp");
    items.iter().find(|item| {
        item.owner.to_lowercase() == owner && item.file_name().to_lowercase() == expect
    })
}

/// Ban management error types.
#[derive(Debug, thiserror::Error)]
pub enum BanError {
    /// Item visibility is owned by the purification level.
    #[error("{file} is excluded by purification level {level}, manual bans do not apply")]
    Purified {
        file: String,
        level: PurificationLevel,
    },

    #[error("{0} is already banned")]
    AlreadyBanned(String),

    #[error("{0} is not banned")]
    NotBanned(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Friendly result alias :3
pub type Result<T, E = BanError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::FilterSettings, sync::content::Attributes};
    use pretty_assertions::assert_eq;
    use simple_test_case::test_case;

    fn item(path: &str, owner: &str, attributes: Attributes) -> ContentItem {
        ContentItem {
            relative_path: path.into(),
            storage_box: "gallery-core".into(),
            owner: owner.into(),
            source_collection: "gs-character".into(),
            attributes,
        }
    }

    fn level(level: u8) -> PurificationLevel {
        PurificationLevel::try_from(level).unwrap_or_default()
    }

    fn service() -> anyhow::Result<(tempfile::TempDir, BanService)> {
        let dir = tempfile::tempdir()?;
        let service = BanService::new(Arc::new(JsonStore::open(dir.path())?));
        Ok((dir, service))
    }

    #[test]
    fn add_and_remove_ban() -> anyhow::Result<()> {
        let (_dir, service) = service()?;
        let item = item("gs-character/Furina/furinagu1.webp", "Furina", Attributes::default());

        service.add(&item, level(0))?;
        assert!(service.bans()?.contains(&item.relative_path));
        assert!(matches!(service.add(&item, level(0)), Err(BanError::AlreadyBanned(_))));

        service.remove(&item, level(0))?;
        assert!(service.bans()?.is_empty());
        assert!(matches!(service.remove(&item, level(0)), Err(BanError::NotBanned(_))));

        Ok(())
    }

    #[test]
    fn purified_items_refuse_manual_bans() -> anyhow::Result<()> {
        let (_dir, service) = service()?;
        let item = item(
            "gs-character/Furina/furinagu2.webp",
            "Furina",
            Attributes {
                tier1: true,
                ..Attributes::default()
            },
        );

        assert!(matches!(service.add(&item, level(1)), Err(BanError::Purified { .. })));
        assert!(matches!(service.remove(&item, level(2)), Err(BanError::Purified { .. })));
        assert!(service.bans()?.is_empty());
        service.add(&item, level(0))?;

        Ok(())
    }

    #[test]
    fn seed_keeps_existing_bans() -> anyhow::Result<()> {
        let (_dir, service) = service()?;
        service.seed()?;
        assert!(service.bans()?.is_empty());

        let item = item("gs-character/Furina/furinagu1.webp", "Furina", Attributes::default());
        service.add(&item, level(0))?;
        service.seed()?;
        assert_eq!(service.bans()?.len(), 1);

        Ok(())
    }

    #[test]
    fn categorize_splits_bans_from_rules() -> anyhow::Result<()> {
        let (_dir, service) = service()?;
        let banned = item("gs-character/Furina/furinagu1.webp", "Furina", Attributes::default());
        let ai = item(
            "gs-character/Furina/furinagu2.webp",
            "Furina",
            Attributes {
                ai_generated: true,
                tier1: true,
                ..Attributes::default()
            },
        );
        let plain = item("gs-character/Furina/furinagu3.webp", "Furina", Attributes::default());
        let upstream = item(
            "gs-character/Furina/furinagu4.webp",
            "Furina",
            Attributes {
                banned: true,
                ai_generated: true,
                ..Attributes::default()
            },
        );
        service.add(&banned, level(0))?;

        let settings = SyncSettings {
            enabled: true,
            purification_level: level(1),
            filter: FilterSettings {
                ai: false,
                ..FilterSettings::default()
            },
        };
        let result = service.categorize(
            &[banned.clone(), ai.clone(), plain, upstream.clone()],
            &settings,
        )?;
        assert_eq!(result.user_banned, vec![banned]);
        assert_eq!(result.upstream_banned, vec![upstream]);
        assert_eq!(
            result.rule_excluded,
            vec![(ai, vec![ExclusionReason::Purified, ExclusionReason::Ai])]
        );

        Ok(())
    }

    #[test_case("gs-character/Furina/furinagu2.webp", Some("gs-character/Furina/furinagu2.webp"); "exact path")]
    #[test_case("furina2", Some("gs-character/Furina/furinagu2.webp"); "owner and number")]
    #[test_case("Furina9", None; "unknown number")]
    #[test_case("2", None; "number only")]
    #[test_case("Furina", None; "owner only")]
    #[test_case("ÉLISE1", Some("gs-character/Élise/élisegu1.webp"); "non ascii owner")]
    #[test]
    fn find_item_by_identifier(identifier: &str, expect: Option<&str>) {
        let items = vec![
            item("gs-character/Furina/furinagu1.webp", "Furina", Attributes::default()),
            item("gs-character/Furina/furinagu2.webp", "Furina", Attributes::default()),
            item("gs-character/Élise/élisegu1.webp", "Élise", Attributes::default()),
        ];
        let result = find_item(&items, identifier).map(|item| item.relative_path.as_str());
        pretty_assertions::assert_eq!(result, expect);
    }
}
