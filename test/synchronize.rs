// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use crate::{git_available, RepoFixture};

use mirrorkeep::{
    config::{Config, ConfigFile, GitSettings, PurificationLevel, RepositoryEntry},
    mirror::score::NodeScorer,
    repo::{
        acquire::{Acquirer, Mode},
        Gallery,
    },
    store::JsonStore,
    sync::{
        ban::BanService,
        content::{ImageDataFile, MetadataSource, IMAGE_DATA_FILE},
        manifest::Manifest,
        Synchronizer,
    },
};

use anyhow::Result;
use indoc::indoc;
use pretty_assertions::assert_eq;
use std::{
    fs::{create_dir_all, read_to_string, write},
    path::{Path, PathBuf},
    sync::Arc,
};
use tempfile::TempDir;

const IMAGE_DATA: &str = indoc! {r#"
    [
        {
            "path": "gs-character/Furina/furinagu1.webp",
            "storagebox": "gallery-core",
            "characterName": "Furina",
            "sourceGallery": "gs-character",
            "attributes": {}
        },
        {
            "path": "gs-character/Furina/furinagu2.webp",
            "storagebox": "gallery-core",
            "characterName": "Furina",
            "sourceGallery": "gs-character",
            "attributes": { "isPx18": true }
        },
        {
            "path": "sr-character/Acheron/acherongu1.webp",
            "storagebox": "gallery-core",
            "characterName": "Acheron",
            "sourceGallery": "sr-character",
            "attributes": {}
        },
        {
            "path": "gs-character\\Nahida\\nahidagu1.webp",
            "storagebox": "gallery-core",
            "characterName": "Nahida",
            "sourceGallery": "gs-character",
            "attributes": {}
        }
    ]
"#};

const CONTENT_FILES: [&str; 3] = [
    "gs-character/Furina/furinagu1.webp",
    "gs-character/Furina/furinagu2.webp",
    "sr-character/Acheron/acherongu1.webp",
];

/// Repository root, state, and one configured `gs` target.
struct Layout {
    root: TempDir,
    store: Arc<JsonStore>,
    config: ConfigFile,
}

impl Layout {
    fn new() -> Result<Self> {
        let root = tempfile::tempdir()?;
        let store = Arc::new(JsonStore::open(root.path().join("state"))?);
        let config = ConfigFile::new(root.path().join("mirrorkeep.toml"));
        config.set_sync_target("gs", Some(root.path().join("targets/gs")))?;

        Ok(Self { root, store, config })
    }

    fn repos(&self) -> PathBuf {
        self.root.path().join("repos")
    }

    fn core(&self) -> PathBuf {
        self.repos().join("gallery-core")
    }

    fn target(&self) -> PathBuf {
        self.root.path().join("targets/gs")
    }

    /// Lay out core working copy by hand. `Nahida` is listed but missing.
    fn populate(&self) -> Result<()> {
        write_file(&self.core().join(IMAGE_DATA_FILE), IMAGE_DATA)?;
        for file in CONTENT_FILES {
            write_file(&self.core().join(file), file)?;
        }

        Ok(())
    }

    fn synchronizer(&self) -> Synchronizer<ImageDataFile, ConfigFile> {
        Synchronizer::new(
            ImageDataFile::in_repository(&self.core()),
            self.config.clone(),
            self.repos(),
            self.store.clone(),
        )
    }

    fn manifest_paths(&self) -> Result<Vec<String>> {
        Ok(Manifest::new(self.store.clone())
            .load()?
            .into_iter()
            .map(|entry| entry.relative_path)
            .collect())
    }
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir_all(parent)?;
    }
    write(path, contents)?;
    Ok(())
}

#[test]
fn unconfigured_groups_and_missing_sources() -> Result<()> {
    let layout = Layout::new()?;
    layout.populate()?;

    let report = layout.synchronizer().synchronize(true)?;
    assert_eq!(report.synced, 2);
    assert_eq!(report.removed, 0);
    assert_eq!(
        report.missing,
        vec![layout.core().join("gs-character/Nahida/nahidagu1.webp")]
    );
    assert!(layout.target().join("Furina/furinagu1.webp").exists());
    assert!(!layout.target().join("Acheron").exists());
    assert_eq!(
        layout.manifest_paths()?,
        vec![
            "gs-character/Furina/furinagu1.webp".to_string(),
            "gs-character/Furina/furinagu2.webp".to_string(),
        ]
    );

    Ok(())
}

#[test]
fn raising_purification_level_retracts_tier2() -> Result<()> {
    let layout = Layout::new()?;
    layout.populate()?;
    let sync = layout.synchronizer();
    sync.synchronize(true)?;
    assert!(layout.target().join("Furina/furinagu2.webp").exists());

    layout.config.set_purification_level(2)?;
    let report = sync.synchronize(false)?;
    assert_eq!(report.removed, 1);
    assert!(!layout.target().join("Furina/furinagu2.webp").exists());
    assert!(layout.target().join("Furina/furinagu1.webp").exists());

    let again = sync.synchronize(false)?;
    assert_eq!(again.removed, 0);

    Ok(())
}

#[test]
fn ban_then_unban_round_trips() -> Result<()> {
    let layout = Layout::new()?;
    layout.populate()?;
    let sync = layout.synchronizer();
    sync.synchronize(true)?;

    let items = ImageDataFile::in_repository(&layout.core()).content_items()?;
    let furina = items
        .iter()
        .find(|item| item.relative_path == "gs-character/Furina/furinagu1.webp")
        .ok_or_else(|| anyhow::anyhow!("fixture item missing"))?;
    let bans = BanService::new(layout.store.clone());

    bans.add(furina, PurificationLevel::default())?;
    assert_eq!(sync.synchronize(false)?.removed, 1);
    assert!(!layout.target().join("Furina/furinagu1.webp").exists());
    assert!(!layout.manifest_paths()?.contains(&furina.relative_path));

    bans.remove(furina, PurificationLevel::default())?;
    sync.synchronize(false)?;
    assert_eq!(
        read_to_string(layout.target().join("Furina/furinagu1.webp"))?,
        "gs-character/Furina/furinagu1.webp"
    );

    Ok(())
}

#[test]
fn removing_target_leaves_projected_files() -> Result<()> {
    let layout = Layout::new()?;
    layout.populate()?;
    layout
        .config
        .set_sync_target("sr", Some(layout.root.path().join("targets/sr")))?;
    let sync = layout.synchronizer();
    sync.synchronize(true)?;

    layout.config.set_sync_target("sr", None)?;
    let report = sync.synchronize(false)?;
    assert_eq!(report.removed, 0);
    assert!(layout
        .root
        .path()
        .join("targets/sr/Acheron/acherongu1.webp")
        .exists());

    Ok(())
}

#[tokio::test]
async fn download_then_synchronize() -> Result<()> {
    if !git_available() {
        return Ok(());
    }

    let layout = Layout::new()?;
    let upstream = RepoFixture::new(layout.root.path().join("upstream/gallery-core"))?;
    let mut files = vec![(IMAGE_DATA_FILE, IMAGE_DATA)];
    files.extend(CONTENT_FILES.iter().map(|file| (*file, *file)));
    upstream.commit(&files, "feat: add gallery")?;

    let config = Config {
        repositories: vec![RepositoryEntry {
            id: "core".into(),
            url: upstream.url()?,
            branch: "main".into(),
            core: true,
            ..RepositoryEntry::default()
        }],
        ..layout.config.load()?
    };
    let gallery = Gallery::new(layout.repos(), config.repositories.clone());
    let core = gallery
        .core()
        .ok_or_else(|| anyhow::anyhow!("core repository missing"))?;

    let settings = GitSettings {
        delivery_grace_ms: 0,
        ..GitSettings::default()
    };
    let acquirer = Acquirer::new(
        settings,
        layout.root.path().join("temp"),
        NodeScorer::new(layout.store.clone()),
    )?;
    let result = acquirer.acquire(&core, Mode::Clone).await;
    assert!(result.is_success(), "{:?}", result.error);
    assert_eq!(core.local_path(), layout.core().as_path());

    let sync = Synchronizer::new(
        ImageDataFile::in_repository(core.local_path()),
        config,
        gallery.repos_root(),
        layout.store.clone(),
    );
    let first = sync.synchronize(true)?;
    let manifest = layout.manifest_paths()?;
    let second = sync.synchronize(false)?;

    assert_eq!(first.synced, 2);
    assert_eq!(second.removed, 0);
    assert_eq!(layout.manifest_paths()?, manifest);
    assert!(layout.target().join("Furina/furinagu1.webp").exists());

    Ok(())
}
