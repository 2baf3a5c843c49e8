// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Local exclude rule handling.
//!
//! Some repositories carry folders whose content is only useful when a
//! particular consumer is installed next to mirrorkeep. Rather than deleting
//! those folders, mirrorkeep hides them through the working copy's private
//! exclude file at `.git/info/exclude`. Unlike `.gitignore`, that file is
//! never tracked, so editing it never dirties the working copy or conflicts
//! with upstream during an update.
//!
//! # Exclude File Layout
//!
//! Git reads one gitignore pattern per line. Lines starting with `#` are
//! comments. Fresh clones usually come with a short comment block, which is
//! preserved verbatim at the top of the file. Every other line is treated as
//! a rule, and rules are written back sorted without duplicates.
//!
//! # See Also
//!
//! - [gitignore](https://git-scm.com/docs/gitignore)

use std::{
    collections::BTreeSet,
    fmt::{Display, Formatter, Result as FmtResult},
    fs::{create_dir_all, read_to_string, write},
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tracing::debug;

/// Manage rules in a working copy's exclude file.
#[derive(Clone, Debug)]
pub struct ExcludeDrafter {
    exclude_path: PathBuf,
}

impl ExcludeDrafter {
    /// Construct new exclude rule drafter for working copy at `work_tree`.
    pub fn new(work_tree: impl AsRef<Path>) -> Self {
        let exclude_path = work_tree.as_ref().join(".git").join("info").join("exclude");
        Self { exclude_path }
    }

    /// Path of the exclude file.
    pub fn path(&self) -> &Path {
        self.exclude_path.as_path()
    }

    /// Edit exclude rules.
    ///
    /// Read current rules into [`ExcludeEdit`], let `editor` modify them, and
    /// write the result back only when something changed. A missing exclude
    /// file reads as empty.
    ///
    /// # Errors
    ///
    /// - Return [`ExcludeError::Read`] if exclude file cannot be read.
    /// - Return [`ExcludeError::Write`] if exclude file cannot be written.
    pub fn edit<E>(&self, editor: E) -> Result<()>
    where
        E: FnOnce(&mut ExcludeEdit),
    {
        let mut rules = ExcludeEdit::from(self.read()?.as_str());
        editor(&mut rules);

        if !rules.changed {
            return Ok(());
        }

        if let Some(parent) = self.exclude_path.parent() {
            create_dir_all(parent).map_err(|err| ExcludeError::Write {
                source: err,
                exclude_path: self.exclude_path.clone(),
            })?;
        }

        write(&self.exclude_path, rules.to_string()).map_err(|err| ExcludeError::Write {
            source: err,
            exclude_path: self.exclude_path.clone(),
        })?;
        debug!("updated exclude rules at {:?}", self.exclude_path.display());

        Ok(())
    }

    /// List current exclude rules, comments left out.
    ///
    /// # Errors
    ///
    /// - Return [`ExcludeError::Read`] if exclude file cannot be read.
    pub fn current_rules(&self) -> Result<Vec<String>> {
        let rules = ExcludeEdit::from(self.read()?.as_str());
        Ok(rules.rules.into_iter().collect())
    }

    fn read(&self) -> Result<String> {
        match read_to_string(&self.exclude_path) {
            Ok(content) => Ok(content),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(String::new()),
            Err(err) => Err(ExcludeError::Read {
                source: err,
                exclude_path: self.exclude_path.clone(),
            }),
        }
    }
}

/// Exclude rule editor.
///
/// # Invariant
///
/// - No duplicate rules.
/// - Leading comment block is kept as is.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExcludeEdit {
    comments: Vec<String>,
    rules: BTreeSet<String>,
    changed: bool,
}

impl ExcludeEdit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a rule.
    pub fn insert_rule(&mut self, rule: impl Into<String>) {
        if self.rules.insert(rule.into()) {
            self.changed = true;
        }
    }

    /// Remove a rule.
    pub fn remove_rule(&mut self, rule: impl AsRef<str>) {
        if self.rules.remove(rule.as_ref()) {
            self.changed = true;
        }
    }

    pub fn contains(&self, rule: impl AsRef<str>) -> bool {
        self.rules.contains(rule.as_ref())
    }

    /// Whether any insertion or removal took effect.
    pub fn is_changed(&self) -> bool {
        self.changed
    }
}

impl Display for ExcludeEdit {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        for line in self.comments.iter().chain(self.rules.iter()) {
            writeln!(fmt, "{line}")?;
        }

        Ok(())
    }
}

impl From<&str> for ExcludeEdit {
    fn from(content: &str) -> Self {
        let mut comments = Vec::new();
        let mut rules = BTreeSet::new();
        for line in content.lines().map(str::trim).filter(|line| !line.is_empty()) {
            if line.starts_with('#') {
                comments.push(line.to_owned());
            } else {
                rules.insert(line.to_owned());
            }
        }

        Self {
            comments,
            rules,
            changed: false,
        }
    }
}

/// Exclude rule management error types.
#[derive(Debug, thiserror::Error)]
pub enum ExcludeError {
    /// Exclude file cannot be read from.
    #[error("failed to read exclude file at {:?}", exclude_path.display())]
    Read {
        #[source]
        source: std::io::Error,
        exclude_path: PathBuf,
    },

    /// Exclude file cannot be written to.
    #[error("failed to write exclude file at {:?}", exclude_path.display())]
    Write {
        #[source]
        source: std::io::Error,
        exclude_path: PathBuf,
    },
}

/// Friendly result alias :3
pub type Result<T, E = ExcludeError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    #[test]
    fn exclude_edit_keeps_comments_and_sorts_rules() {
        let content = indoc! {r#"
            # git ls-files --others --exclude-from=.git/info/exclude
            # Lines that start with '#' are comments.
            zzz-character
            sr-character
        "#};
        let mut editor = ExcludeEdit::from(content);

        editor.insert_rule("ww-character");
        editor.insert_rule("sr-character");
        let result = editor.to_string();
        let expect = indoc! {r#"
            # git ls-files --others --exclude-from=.git/info/exclude
            # Lines that start with '#' are comments.
            sr-character
            ww-character
            zzz-character
        "#};
        assert_eq!(result, expect);
        assert!(editor.is_changed());
    }

    #[test]
    fn exclude_edit_tracks_changes() {
        let mut editor = ExcludeEdit::from("zzz-character\n");
        editor.insert_rule("zzz-character");
        editor.remove_rule("missing");
        assert!(!editor.is_changed());

        editor.remove_rule("zzz-character");
        assert!(editor.is_changed());
        assert_eq!(editor.to_string(), "");
    }

    #[test]
    fn drafter_creates_and_edits_exclude_file() -> anyhow::Result<()> {
        let work_tree = tempfile::tempdir()?;
        let drafter = ExcludeDrafter::new(work_tree.path());
        assert!(drafter.current_rules()?.is_empty());

        drafter.edit(|rules| rules.insert_rule("zzz-character"))?;
        assert_eq!(drafter.current_rules()?, vec!["zzz-character".to_string()]);

        drafter.edit(|rules| rules.remove_rule("zzz-character"))?;
        assert!(drafter.current_rules()?.is_empty());
        assert!(drafter.path().exists());

        Ok(())
    }

    #[test]
    fn drafter_skips_write_without_changes() -> anyhow::Result<()> {
        let work_tree = tempfile::tempdir()?;
        let drafter = ExcludeDrafter::new(work_tree.path());
        drafter.edit(|rules| rules.remove_rule("nothing"))?;
        assert!(!drafter.path().exists());

        Ok(())
    }
}
