// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration layout.
//!
//! Specify the layout of the `mirrorkeep.toml` configuration file so that
//! serialization and deserialization stay in one place. Parsing performs
//! shell expansion on every path field. File I/O is handled by
//! [`ConfigFile`].
//!
//! # General Layout
//!
//! ```toml
//! [paths]
//! repos = "$HOME/gallery/repos"
//!
//! [git]
//! clone_depth = 1
//!
//! [[git.mirror]]
//! name = "GitHub"
//! url_template = "{url}"
//! priority = 0
//!
//! [[repository]]
//! id = "core"
//! url = "https://github.com/owner/gallery-core.git"
//! branch = "main"
//! description = "Core gallery"
//! core = true
//!
//! [sync]
//! enabled = true
//! purification_level = 1
//!
//! [sync.filter]
//! ai = false
//!
//! [sync.targets]
//! gs = "$HOME/bot/resources/profile/normal-character"
//!
//! [[optional_content]]
//! folder = "zzz-character"
//! marker = "$HOME/bot/plugins/zzz-plugin"
//! ```

use crate::{
    mirror::MirrorNode,
    path::{default_repos_dir, default_state_dir, default_temp_dir, NoWayHome},
};

use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt::{Display, Error as FmtError, Formatter, Result as FmtResult},
    fs::{create_dir_all, read_to_string, write},
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};
use tracing::{debug, instrument};

/// Top-level configuration document.
#[derive(Default, Debug, PartialEq, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Where repositories, state, and scratch space live.
    #[serde(default)]
    pub paths: PathSettings,

    /// Settings for the driven VCS tool and mirror selection.
    #[serde(default)]
    pub git: GitSettings,

    /// Upstream repositories to acquire.
    #[serde(default, rename = "repository")]
    pub repositories: Vec<RepositoryEntry>,

    /// Allow-list and projection settings.
    #[serde(default)]
    pub sync: SyncConfig,

    /// Folders excluded from working copies unless their consumer exists.
    #[serde(default, rename = "optional_content")]
    pub optional_content: Vec<OptionalContentRule>,
}

impl Config {
    fn expand_paths(&mut self) -> Result<()> {
        for path in [
            &mut self.paths.repos,
            &mut self.paths.state,
            &mut self.paths.temp,
        ]
        .into_iter()
        .flatten()
        {
            *path = expand(path)?;
        }

        for target in self.sync.targets.values_mut() {
            *target = expand(target)?;
        }

        for rule in &mut self.optional_content {
            rule.marker = expand(&rule.marker)?;
        }

        Ok(())
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mut config: Config = toml::de::from_str(data).map_err(ConfigError::Deserialize)?;

        // INVARIANT: Perform shell expansion on every path field.
        config.expand_paths()?;

        Ok(config)
    }
}

impl Display for Config {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            toml::ser::to_string_pretty(self)
                .map_err(ConfigError::Serialize)?
                .as_str(),
        )
    }
}

/// Storage locations.
///
/// Unset fields fall back to the XDG data directory.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct PathSettings {
    /// Root directory holding every repository's working copy.
    pub repos: Option<PathBuf>,

    /// Directory holding persisted JSON state.
    pub state: Option<PathBuf>,

    /// Scratch directory for in-flight clones.
    pub temp: Option<PathBuf>,
}

impl PathSettings {
    /// Resolve repository root.
    pub fn repos_dir(&self) -> Result<PathBuf, NoWayHome> {
        self.repos.clone().map_or_else(default_repos_dir, Ok)
    }

    /// Resolve persisted state directory.
    pub fn state_dir(&self) -> Result<PathBuf, NoWayHome> {
        self.state.clone().map_or_else(default_state_dir, Ok)
    }

    /// Resolve scratch directory.
    pub fn temp_dir(&self) -> Result<PathBuf, NoWayHome> {
        self.temp.clone().map_or_else(default_temp_dir, Ok)
    }
}

/// Settings for driving the external VCS tool.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GitSettings {
    /// Depth of shallow clones.
    pub clone_depth: u32,

    /// Hard limit for a clone when no progress observer is attached.
    pub clone_timeout_secs: u64,

    /// Limit between two progress reports while cloning.
    pub no_progress_timeout_secs: u64,

    /// Limit for each pull, fetch, and reset.
    pub pull_timeout_secs: u64,

    /// Limit for each remote reference listing probe.
    pub ls_remote_timeout_secs: u64,

    /// Limit for each HTTP probe.
    pub probe_timeout_secs: u64,

    /// File fetched through each mirror during HTTP probing.
    pub probe_file: String,

    /// Pause before moving a finished clone into place.
    pub delivery_grace_ms: u64,

    /// Candidate mirror nodes.
    #[serde(rename = "mirror")]
    pub mirrors: Vec<MirrorNode>,
}

impl GitSettings {
    pub fn clone_timeout(&self) -> Duration {
        Duration::from_secs(self.clone_timeout_secs)
    }

    pub fn no_progress_timeout(&self) -> Duration {
        Duration::from_secs(self.no_progress_timeout_secs)
    }

    pub fn pull_timeout(&self) -> Duration {
        Duration::from_secs(self.pull_timeout_secs)
    }

    pub fn ls_remote_timeout(&self) -> Duration {
        Duration::from_secs(self.ls_remote_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn delivery_grace(&self) -> Duration {
        Duration::from_millis(self.delivery_grace_ms)
    }
}

impl Default for GitSettings {
    fn default() -> Self {
        Self {
            clone_depth: 1,
            clone_timeout_secs: 600,
            no_progress_timeout_secs: 30,
            pull_timeout_secs: 120,
            ls_remote_timeout_secs: 15,
            probe_timeout_secs: 5,
            probe_file: "README.md".into(),
            delivery_grace_ms: 500,
            mirrors: MirrorNode::defaults(),
        }
    }
}

/// One upstream repository listing.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct RepositoryEntry {
    /// Unique identifier.
    pub id: String,

    /// Canonical upstream URL.
    pub url: String,

    /// Branch to track.
    #[serde(default = "default_branch")]
    pub branch: String,

    /// Human readable name.
    #[serde(default)]
    pub description: String,

    /// Repository carrying the content metadata index.
    #[serde(default)]
    pub core: bool,

    /// Repository carrying folders subject to [`OptionalContentRule`].
    #[serde(default)]
    pub optional_content: bool,
}

fn default_branch() -> String {
    "main".into()
}

/// Allow-list and projection section.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Master switch. Nothing is projected while disabled.
    pub enabled: bool,

    /// Restricted content exclusion level.
    pub purification_level: PurificationLevel,

    /// Category toggles.
    pub filter: FilterSettings,

    /// Destination directory per target group.
    pub targets: BTreeMap<String, PathBuf>,
}

impl SyncConfig {
    /// Extract the read-only inputs of allow-list computation.
    pub fn settings(&self) -> SyncSettings {
        SyncSettings {
            enabled: self.enabled,
            purification_level: self.purification_level,
            filter: self.filter.clone(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            purification_level: PurificationLevel::default(),
            filter: FilterSettings::default(),
            targets: BTreeMap::new(),
        }
    }
}

/// Read-only input to allow-list computation.
#[derive(Default, Debug, PartialEq, Eq, Clone)]
pub struct SyncSettings {
    pub enabled: bool,
    pub purification_level: PurificationLevel,
    pub filter: FilterSettings,
}

/// Category toggles. A category is excluded when its toggle is off.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FilterSettings {
    /// Allow AI generated content.
    pub ai: bool,

    /// Allow easter egg content.
    pub easter_egg: bool,

    /// Allow fullscreen layout content.
    pub layout: bool,
}

impl Default for FilterSettings {
    fn default() -> Self {
        Self {
            ai: true,
            easter_egg: true,
            layout: true,
        }
    }
}

/// Purification level in `0..=2`.
///
/// Level 1 excludes tier-1 restricted content, level 2 additionally excludes
/// tier-2 restricted content.
#[derive(Default, Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Deserialize, Serialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct PurificationLevel(u8);

impl PurificationLevel {
    pub const MAX: u8 = 2;

    pub fn get(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for PurificationLevel {
    type Error = ConfigError;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        if level > Self::MAX {
            return Err(ConfigError::PurificationLevel(level));
        }

        Ok(Self(level))
    }
}

impl From<PurificationLevel> for u8 {
    fn from(level: PurificationLevel) -> Self {
        level.0
    }
}

impl Display for PurificationLevel {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        write!(fmt, "{}", self.0)
    }
}

/// Exclude `folder` from optional-content repositories unless `marker`
/// exists on disk.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct OptionalContentRule {
    /// Folder inside the working copy.
    pub folder: String,

    /// Path whose existence means the folder's consumer is installed.
    pub marker: PathBuf,
}

/// Configuration file on disk.
///
/// Acts as the keyed settings store: every accessor reads the file again so
/// callers always see the latest saved values.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    path: PathBuf,
}

impl ConfigFile {
    /// Construct new handle for configuration file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of configuration file.
    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// Load configuration.
    ///
    /// A missing file yields [`Config::default`].
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::Read`] if file exists but cannot be read.
    /// - Return [`ConfigError::Deserialize`] if file content is invalid.
    #[instrument(skip(self), level = "debug")]
    pub fn load(&self) -> Result<Config> {
        let mut config = self.load_raw()?;

        // INVARIANT: Perform shell expansion on every path field.
        config.expand_paths()?;

        Ok(config)
    }

    /// Load configuration exactly as written, without shell expansion.
    fn load_raw(&self) -> Result<Config> {
        if !self.path.exists() {
            debug!("no configuration at {:?}, using defaults", self.path.display());
            return Ok(Config::default());
        }

        let data = read_to_string(&self.path).map_err(|err| ConfigError::Read {
            source: err,
            path: self.path.clone(),
        })?;

        Ok(toml::de::from_str(&data)?)
    }

    /// Save configuration, creating parent directories when needed.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::Write`] if file cannot be written.
    pub fn save(&self, config: &Config) -> Result<()> {
        let contents =
            toml::ser::to_string_pretty(config).map_err(ConfigError::Serialize)?;
        if let Some(parent) = self.path.parent() {
            create_dir_all(parent).map_err(|err| ConfigError::Write {
                source: err,
                path: self.path.clone(),
            })?;
        }

        write(&self.path, contents).map_err(|err| ConfigError::Write {
            source: err,
            path: self.path.clone(),
        })
    }

    /// Load, modify, and save configuration in one step.
    ///
    /// Paths the editor leaves alone are written back unexpanded.
    pub fn edit<E>(&self, editor: E) -> Result<()>
    where
        E: FnOnce(&mut Config),
    {
        let mut config = self.load_raw()?;
        editor(&mut config);
        self.save(&config)
    }

    /// Flip synchronization master switch.
    pub fn set_sync_enabled(&self, enabled: bool) -> Result<()> {
        self.edit(|config| config.sync.enabled = enabled)
    }

    /// Set purification level.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::PurificationLevel`] if `level` is out of range.
    pub fn set_purification_level(&self, level: u8) -> Result<()> {
        let level = PurificationLevel::try_from(level)?;
        self.edit(|config| config.sync.purification_level = level)
    }

    /// Map target group `group` to `dir`, or unmap it when `dir` is `None`.
    pub fn set_sync_target(&self, group: &str, dir: Option<PathBuf>) -> Result<()> {
        self.edit(|config| match dir {
            Some(dir) => {
                config.sync.targets.insert(group.to_string(), dir);
            }
            None => {
                config.sync.targets.remove(group);
            }
        })
    }
}

fn expand(path: &Path) -> Result<PathBuf> {
    Ok(PathBuf::from(
        shellexpand::full(path.to_string_lossy().as_ref())
            .map_err(ConfigError::ShellExpansion)?
            .into_owned(),
    ))
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to deserialize configuration.
    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    /// Failed to serialize configuration.
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),

    /// Failed to perform shell expansion on configuration.
    #[error(transparent)]
    ShellExpansion(#[from] shellexpand::LookupError<std::env::VarError>),

    /// Purification level outside of `0..=2`.
    #[error("purification level {0} is out of range 0..=2")]
    PurificationLevel(u8),

    /// Configuration file cannot be read.
    #[error("failed to read configuration at {:?}", path.display())]
    Read {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Configuration file cannot be written.
    #[error("failed to write configuration at {:?}", path.display())]
    Write {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },
}

impl From<ConfigError> for FmtError {
    fn from(_: ConfigError) -> Self {
        FmtError
    }
}

/// Friendly result alias :3
type Result<T, E = ConfigError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use sealed_test::prelude::*;

    #[sealed_test(env = [("GALLERY", "/home/blah/gallery")])]
    fn deserialize_config() -> anyhow::Result<()> {
        let result: Config = r#"
            [paths]
            repos = "$GALLERY/repos"

            [git]
            clone_depth = 3

            [[git.mirror]]
            name = "GitHub"
            url_template = "{url}"
            priority = 0

            [[repository]]
            id = "core"
            url = "https://github.com/owner/gallery-core.git"
            description = "Core gallery"
            core = true

            [sync]
            purification_level = 2

            [sync.filter]
            ai = false

            [sync.targets]
            gs = "$GALLERY/gs"

            [[optional_content]]
            folder = "zzz-character"
            marker = "$GALLERY/plugins/zzz-plugin"
        "#
        .parse()?;

        assert_eq!(result.paths.repos, Some(PathBuf::from("/home/blah/gallery/repos")));
        assert_eq!(result.git.clone_depth, 3);
        assert_eq!(result.git.pull_timeout_secs, 120);
        assert_eq!(result.git.mirrors.len(), 1);
        assert_eq!(
            result.repositories,
            vec![RepositoryEntry {
                id: "core".into(),
                url: "https://github.com/owner/gallery-core.git".into(),
                branch: "main".into(),
                description: "Core gallery".into(),
                core: true,
                optional_content: false,
            }]
        );
        assert!(result.sync.enabled);
        assert_eq!(result.sync.purification_level.get(), 2);
        assert_eq!(
            result.sync.filter,
            FilterSettings {
                ai: false,
                easter_egg: true,
                layout: true,
            }
        );
        assert_eq!(
            result.sync.targets.get("gs"),
            Some(&PathBuf::from("/home/blah/gallery/gs"))
        );
        assert_eq!(
            result.optional_content[0].marker,
            PathBuf::from("/home/blah/gallery/plugins/zzz-plugin")
        );

        Ok(())
    }

    #[test]
    fn reject_out_of_range_purification_level() {
        let result = "[sync]\npurification_level = 3\n".parse::<Config>();
        assert!(result.is_err());
    }

    #[test]
    fn serialized_config_parses_back() -> anyhow::Result<()> {
        let mut config = Config::default();
        config.repositories.push(RepositoryEntry {
            id: "extra".into(),
            url: "https://gitee.com/owner/extra.git".into(),
            branch: "dev".into(),
            description: "Extra".into(),
            core: false,
            optional_content: true,
        });
        config.sync.purification_level = PurificationLevel::try_from(1)?;
        config
            .sync
            .targets
            .insert("sr".into(), PathBuf::from("/srv/sr"));

        let result: Config = config.to_string().parse()?;
        assert_eq!(result, config);

        Ok(())
    }

    #[test]
    fn missing_config_file_yields_defaults() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let file = ConfigFile::new(dir.path().join("absent.toml"));
        assert_eq!(file.load()?, Config::default());

        Ok(())
    }

    #[test]
    fn config_file_edit_persists() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let file = ConfigFile::new(dir.path().join("nested").join("mirrorkeep.toml"));
        file.edit(|config| config.sync.enabled = false)?;
        assert!(!file.load()?.sync.enabled);

        Ok(())
    }

    #[sealed_test(env = [("GALLERY", "/home/blah/gallery")])]
    fn config_file_edit_keeps_unexpanded_paths() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let file = ConfigFile::new(dir.path().join("mirrorkeep.toml"));
        write(
            file.path(),
            indoc! {r#"
                [paths]
                repos = "$GALLERY/repos"

                [sync.targets]
                gs = "$GALLERY/gs"
            "#},
        )?;

        file.set_sync_target("sr", Some(PathBuf::from("$GALLERY/sr")))?;
        let raw = read_to_string(file.path())?;
        assert!(raw.contains("$GALLERY/repos"));
        assert!(raw.contains("$GALLERY/gs"));
        assert!(!raw.contains("/home/blah"));

        let result = file.load()?;
        assert_eq!(result.paths.repos, Some(PathBuf::from("/home/blah/gallery/repos")));
        assert_eq!(
            result.sync.targets,
            BTreeMap::from([
                ("gs".to_string(), PathBuf::from("/home/blah/gallery/gs")),
                ("sr".to_string(), PathBuf::from("/home/blah/gallery/sr")),
            ])
        );

        Ok(())
    }

    #[test]
    fn config_file_sync_setters() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let file = ConfigFile::new(dir.path().join("mirrorkeep.toml"));
        file.set_purification_level(2)?;
        file.set_sync_target("gs", Some(PathBuf::from("/srv/gs")))?;
        file.set_sync_target("sr", Some(PathBuf::from("/srv/sr")))?;
        file.set_sync_target("sr", None)?;
        assert!(file.set_purification_level(7).is_err());

        let result = file.load()?.sync;
        assert_eq!(result.purification_level.get(), 2);
        assert_eq!(
            result.targets,
            BTreeMap::from([("gs".to_string(), PathBuf::from("/srv/gs"))])
        );

        Ok(())
    }
}
