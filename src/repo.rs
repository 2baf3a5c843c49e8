// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Repository listing and working copy inspection.
//!
//! Every upstream repository listed in the configuration maps to one
//! [`RepositoryDescriptor`], and the set of them is the [`Gallery`].
//! Descriptors are cheap views recreated from configuration on every listing
//! call. Nothing about them is persisted.
//!
//! A descriptor's working copy always lives at `<repos root>/<local name>`,
//! where the local name is the basename of the repository URL without any
//! `.git` suffix. The same id and URL therefore always map to the same path.

pub mod acquire;
pub mod deliver;
pub mod exclude;

use crate::{
    config::{Config, RepositoryEntry},
    mirror::RepoUrl,
    path::NoWayHome,
};

use chrono::{DateTime, TimeZone, Utc};
use git2::{Oid, Repository};
use std::path::{Path, PathBuf};

/// One logical upstream repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryDescriptor {
    id: String,
    url: RepoUrl,
    branch: String,
    description: String,
    is_core: bool,
    has_optional_content: bool,
    local_name: String,
    local_path: PathBuf,
}

impl RepositoryDescriptor {
    /// Construct new descriptor from configuration entry under `repos_root`.
    pub fn new(entry: &RepositoryEntry, repos_root: impl AsRef<Path>) -> Self {
        let local_name = local_name(&entry.url);
        let local_path = repos_root.as_ref().join(&local_name);

        Self {
            id: entry.id.clone(),
            url: RepoUrl::parse(entry.url.as_str()),
            branch: entry.branch.clone(),
            description: entry.description.clone(),
            is_core: entry.core,
            has_optional_content: entry.optional_content,
            local_name,
            local_path,
        }
    }

    pub fn id(&self) -> &str {
        self.id.as_str()
    }

    pub fn url(&self) -> &RepoUrl {
        &self.url
    }

    pub fn branch(&self) -> &str {
        self.branch.as_str()
    }

    /// Human readable name, falling back to the id.
    pub fn description(&self) -> &str {
        if self.description.is_empty() {
            self.id.as_str()
        } else {
            self.description.as_str()
        }
    }

    pub fn is_core(&self) -> bool {
        self.is_core
    }

    pub fn has_optional_content(&self) -> bool {
        self.has_optional_content
    }

    /// Basename of the URL path without `.git`.
    pub fn local_name(&self) -> &str {
        self.local_name.as_str()
    }

    /// Stable location of the working copy.
    pub fn local_path(&self) -> &Path {
        self.local_path.as_path()
    }

    /// Working copy exists at [`Self::local_path`].
    pub fn is_downloaded(&self) -> bool {
        Repository::open(&self.local_path).is_ok()
    }
}

fn local_name(url: &str) -> String {
    let path = match reqwest::Url::parse(url) {
        Ok(parsed) if parsed.has_host() || parsed.scheme() == "file" => parsed.path().to_string(),
        _ => url.to_string(),
    };

    let basename = path
        .rsplit(['/', ':', '\\'])
        .find(|segment| !segment.is_empty())
        .unwrap_or(path.as_str());

    basename
        .strip_suffix(".git")
        .unwrap_or(basename)
        .to_string()
}

/// Every configured repository.
#[derive(Debug, Clone)]
pub struct Gallery {
    repos_root: PathBuf,
    entries: Vec<RepositoryEntry>,
}

impl Gallery {
    pub fn new(repos_root: impl Into<PathBuf>, entries: Vec<RepositoryEntry>) -> Self {
        Self {
            repos_root: repos_root.into(),
            entries,
        }
    }

    /// Construct gallery from configuration.
    ///
    /// # Errors
    ///
    /// - Return [`NoWayHome`] if repository root cannot be determined.
    pub fn from_config(config: &Config) -> Result<Self, NoWayHome> {
        Ok(Self::new(config.paths.repos_dir()?, config.repositories.clone()))
    }

    pub fn repos_root(&self) -> &Path {
        self.repos_root.as_path()
    }

    /// All repositories in configuration order.
    pub fn all(&self) -> Vec<RepositoryDescriptor> {
        self.entries
            .iter()
            .map(|entry| RepositoryDescriptor::new(entry, &self.repos_root))
            .collect()
    }

    /// The repository carrying the content metadata index.
    pub fn core(&self) -> Option<RepositoryDescriptor> {
        self.all().into_iter().find(RepositoryDescriptor::is_core)
    }

    /// Repository by id.
    pub fn get(&self, id: &str) -> Option<RepositoryDescriptor> {
        self.all().into_iter().find(|repo| repo.id() == id)
    }

    /// Repositories that already have a working copy.
    pub fn downloaded(&self) -> Vec<RepositoryDescriptor> {
        self.all()
            .into_iter()
            .filter(RepositoryDescriptor::is_downloaded)
            .collect()
    }
}

/// Summary of the commit a working copy sits on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadCommit {
    pub short_id: String,
    pub summary: String,
    pub time: DateTime<Utc>,
}

/// Inspect commit at `HEAD` of working copy at `path`.
///
/// # Errors
///
/// - Return [`git2::Error`] if `path` holds no repository or `HEAD` is
///   unborn.
pub fn head_commit(path: &Path) -> Result<HeadCommit, git2::Error> {
    let repository = Repository::open(path)?;
    let commit = repository.head()?.peel_to_commit()?;
    let short_id = commit
        .as_object()
        .short_id()?
        .as_str()
        .unwrap_or_default()
        .to_string();
    let time = Utc
        .timestamp_opt(commit.time().seconds(), 0)
        .single()
        .unwrap_or_default();

    Ok(HeadCommit {
        short_id,
        summary: commit.summary().unwrap_or_default().to_string(),
        time,
    })
}

/// Object id at `HEAD` of working copy at `path`, if there is one.
pub fn head_oid(path: &Path) -> Option<Oid> {
    Repository::open(path)
        .ok()?
        .head()
        .ok()?
        .target()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use simple_test_case::test_case;

    fn entry(id: &str, url: &str, core: bool) -> RepositoryEntry {
        RepositoryEntry {
            id: id.into(),
            url: url.into(),
            branch: "main".into(),
            core,
            ..RepositoryEntry::default()
        }
    }

    #[test_case("https://github.com/owner/gallery-core.git", "gallery-core"; "https with suffix")]
    #[test_case("https://gitee.com/owner/gallery-2/", "gallery-2"; "trailing slash")]
    #[test_case("git@github.com:owner/gallery-3.git", "gallery-3"; "scp like")]
    #[test_case("file:///srv/git/gallery-4.git", "gallery-4"; "local file url")]
    #[test_case("/srv/git/gallery-5", "gallery-5"; "bare path")]
    #[test]
    fn derive_local_name(url: &str, expect: &str) {
        pretty_assertions::assert_eq!(local_name(url), expect);
    }

    #[test]
    fn descriptor_paths_are_stable() {
        let entry = entry("core", "https://github.com/owner/gallery-core.git", true);
        let first = RepositoryDescriptor::new(&entry, "/data/repos");
        let second = RepositoryDescriptor::new(&entry, "/data/repos");
        assert_eq!(first, second);
        assert_eq!(first.local_path(), Path::new("/data/repos/gallery-core"));
    }

    #[test]
    fn gallery_lists_core_and_downloaded() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let gallery = Gallery::new(
            root.path(),
            vec![
                entry("core", "https://github.com/owner/gallery-core.git", true),
                entry("extra", "https://github.com/owner/gallery-2.git", false),
            ],
        );
        assert_eq!(gallery.all().len(), 2);
        assert_eq!(gallery.core().map(|repo| repo.id().to_string()).as_deref(), Some("core"));
        assert!(gallery.downloaded().is_empty());

        Repository::init(root.path().join("gallery-2"))?;
        let downloaded = gallery
            .downloaded()
            .into_iter()
            .map(|repo| repo.id().to_string())
            .collect::<Vec<_>>();
        assert_eq!(downloaded, vec!["extra".to_string()]);
        assert!(gallery.get("extra").is_some_and(|repo| repo.is_downloaded()));

        Ok(())
    }

    #[test]
    fn head_of_empty_repository_is_unborn() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        Repository::init(root.path())?;
        assert!(head_commit(root.path()).is_err());
        assert_eq!(head_oid(root.path()), None);

        Ok(())
    }
}
