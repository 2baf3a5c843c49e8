// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Path resolution utilities.
//!
//! Determine default locations for the configuration file, the repository
//! root, persisted runtime data, and scratch space used while cloning.
//! Nothing here touches the file system.

use std::path::PathBuf;

/// Determine default absolute path to mirrorkeep's data directory.
///
/// Uses XDG Base Directory path `$XDG_DATA_HOME/mirrorkeep`. Repositories,
/// persisted runtime data, and temporary clones all live below it unless the
/// configuration file says otherwise.
///
/// # Errors
///
/// - Return [`NoWayHome`] if data directory path cannot be determined.
///
/// # See Also
///
/// - [XDG Base Directory](https://wiki.archlinux.org/title/XDG_Base_Directory)
pub fn default_data_dir() -> Result<PathBuf> {
    dirs::data_dir()
        .map(|path| path.join("mirrorkeep"))
        .ok_or(NoWayHome)
}

/// Default directory holding every acquired repository.
pub fn default_repos_dir() -> Result<PathBuf> {
    default_data_dir().map(|path| path.join("repos"))
}

/// Default directory for persisted JSON state.
pub fn default_state_dir() -> Result<PathBuf> {
    default_data_dir().map(|path| path.join("state"))
}

/// Default scratch directory for in-flight clones.
pub fn default_temp_dir() -> Result<PathBuf> {
    default_data_dir().map(|path| path.join("temp"))
}

/// Determine default absolute path to configuration file.
///
/// Uses `$XDG_CONFIG_HOME/mirrorkeep/mirrorkeep.toml`.
///
/// # Errors
///
/// - Return [`NoWayHome`] if configuration directory cannot be determined.
pub fn default_config_file() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|path| path.join("mirrorkeep").join("mirrorkeep.toml"))
        .ok_or(NoWayHome)
}

/// No way to determine user's home directory.
///
/// # See Also
///
/// - [`dirs::home_dir`](https://docs.rs/dirs/latest/dirs/fn.home_dir.html)
#[derive(Clone, Debug, thiserror::Error)]
#[error("cannot determine absolute path to user's home directory")]
pub struct NoWayHome;

/// Friendly result alias :3
pub type Result<T, E = NoWayHome> = std::result::Result<T, E>;

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use sealed_test::prelude::*;

    #[sealed_test(env = [
        ("XDG_DATA_HOME", "/tmp/xdg/data"),
        ("XDG_CONFIG_HOME", "/tmp/xdg/config"),
    ])]
    fn defaults_follow_xdg() -> anyhow::Result<()> {
        assert_eq!(default_repos_dir()?, PathBuf::from("/tmp/xdg/data/mirrorkeep/repos"));
        assert_eq!(default_state_dir()?, PathBuf::from("/tmp/xdg/data/mirrorkeep/state"));
        assert_eq!(default_temp_dir()?, PathBuf::from("/tmp/xdg/data/mirrorkeep/temp"));
        assert_eq!(
            default_config_file()?,
            PathBuf::from("/tmp/xdg/config/mirrorkeep/mirrorkeep.toml")
        );

        Ok(())
    }
}
