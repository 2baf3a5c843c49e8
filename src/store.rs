// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Persisted JSON state.
//!
//! Mirrorkeep keeps a small amount of state between runs: per-node
//! performance statistics, the manual ban set, and the manifest of files
//! projected by the last synchronization pass. All of it lives in the
//! __state store__, a directory with one pretty-printed JSON document per
//! domain.
//!
//! # Keys
//!
//! Values are addressed as `domain.path.to.value`. The first segment selects
//! the document, every following segment walks into nested JSON objects. A
//! key without a path addresses the whole document.
//!
//! | Domain     | File            | Holds                            |
//! |------------|-----------------|----------------------------------|
//! | `runtime`  | `runtime.json`  | node statistics                  |
//! | `bans`     | `bans.json`     | manually banned relative paths   |
//! | `manifest` | `manifest.json` | last synchronized projection     |
//!
//! Writes land in `<file>.tmp` first and are renamed into place, so a crash
//! never leaves a half-written document behind.

use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};
use std::{
    collections::{hash_map::Entry, HashMap},
    fs::{create_dir_all, read_to_string, rename, write},
    path::{Path, PathBuf},
    str::FromStr,
    sync::Mutex,
};
use tracing::{debug, warn};

/// Document selected by the first key segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Domain {
    Runtime,
    Bans,
    Manifest,
}

impl Domain {
    fn file_name(self) -> &'static str {
        match self {
            Self::Runtime => "runtime.json",
            Self::Bans => "bans.json",
            Self::Manifest => "manifest.json",
        }
    }
}

impl FromStr for Domain {
    type Err = StoreError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name {
            "runtime" => Ok(Self::Runtime),
            "bans" => Ok(Self::Bans),
            "manifest" => Ok(Self::Manifest),
            other => Err(StoreError::UnknownDomain(other.into())),
        }
    }
}

/// Keyed JSON store backed by one file per [`Domain`].
///
/// Documents are loaded lazily and cached. Every mutation is written through
/// to disk before returning, and a failed write leaves the cache untouched.
#[derive(Debug)]
pub struct JsonStore {
    dir: PathBuf,
    documents: Mutex<HashMap<Domain, Value>>,
}

impl JsonStore {
    /// Open state store at `dir`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::Write`] if directory cannot be created.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        create_dir_all(&dir).map_err(|err| StoreError::Write {
            source: err,
            path: dir.clone(),
        })?;

        Ok(Self {
            dir,
            documents: Mutex::new(HashMap::new()),
        })
    }

    /// Directory holding the documents.
    pub fn dir(&self) -> &Path {
        self.dir.as_path()
    }

    /// Get value at `key`, or `default` if nothing is stored there.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::UnknownDomain`] if key names no domain.
    /// - Return [`StoreError::Read`] if document cannot be read.
    /// - Return [`StoreError::Json`] if stored value has the wrong shape.
    pub fn get<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let (domain, path) = split_key(key)?;
        let mut documents = self.documents.lock().map_err(|_| StoreError::Poisoned)?;
        let document = self.document(&mut documents, domain)?;

        match lookup(document, &path) {
            Some(Value::Null) | None => Ok(default),
            Some(value) => Ok(serde_json::from_value(value.clone())?),
        }
    }

    /// Set value at `key`, creating intermediate objects as needed.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::Write`] if document cannot be persisted.
    pub fn set<T>(&self, key: &str, value: &T) -> Result<()>
    where
        T: Serialize,
    {
        let (domain, path) = split_key(key)?;
        let value = serde_json::to_value(value)?;
        let mut documents = self.documents.lock().map_err(|_| StoreError::Poisoned)?;
        let document = self.document(&mut documents, domain)?;

        // INVARIANT: Cache only ever holds what made it to disk.
        let mut staged = document.clone();
        *slot(&mut staged, &path) = value;
        self.persist(domain, &staged)?;
        *document = staged;

        Ok(())
    }

    /// Read, modify, and write value at `key` while holding the store lock.
    ///
    /// Concurrent updates through the same store never lose writes.
    pub fn update<T, F>(&self, key: &str, default: T, editor: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut T),
    {
        let (domain, path) = split_key(key)?;
        let mut documents = self.documents.lock().map_err(|_| StoreError::Poisoned)?;
        let document = self.document(&mut documents, domain)?;

        let mut current = match lookup(document, &path) {
            Some(Value::Null) | None => default,
            Some(value) => serde_json::from_value(value.clone())?,
        };
        editor(&mut current);

        let mut staged = document.clone();
        *slot(&mut staged, &path) = serde_json::to_value(&current)?;
        self.persist(domain, &staged)?;
        *document = staged;

        Ok(current)
    }

    fn document<'a>(
        &self,
        documents: &'a mut HashMap<Domain, Value>,
        domain: Domain,
    ) -> Result<&'a mut Value> {
        match documents.entry(domain) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => Ok(entry.insert(self.load(domain)?)),
        }
    }

    fn load(&self, domain: Domain) -> Result<Value> {
        let path = self.dir.join(domain.file_name());
        if !path.exists() {
            debug!("state document {:?} does not exist yet", path.display());
            return Ok(Value::Null);
        }

        let contents = read_to_string(&path).map_err(|err| StoreError::Read {
            source: err,
            path: path.clone(),
        })?;

        match serde_json::from_str(&contents) {
            Ok(value) => Ok(value),
            Err(err) => {
                warn!("state document {:?} is corrupt, starting empty: {err}", path.display());
                Ok(Value::Null)
            }
        }
    }

    fn persist(&self, domain: Domain, document: &Value) -> Result<()> {
        let path = self.dir.join(domain.file_name());
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(document)?;

        write(&tmp, json).map_err(|err| StoreError::Write {
            source: err,
            path: tmp.clone(),
        })?;
        rename(&tmp, &path).map_err(|err| StoreError::Write {
            source: err,
            path: path.clone(),
        })
    }
}

fn split_key(key: &str) -> Result<(Domain, Vec<&str>)> {
    let mut segments = key.split('.').filter(|segment| !segment.is_empty());
    let domain = segments
        .next()
        .ok_or_else(|| StoreError::UnknownDomain(key.into()))?
        .parse()?;

    Ok((domain, segments.collect()))
}

fn lookup<'a>(document: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter()
        .try_fold(document, |value, segment| value.as_object()?.get(*segment))
}

fn slot<'a>(document: &'a mut Value, path: &[&str]) -> &'a mut Value {
    let mut current = document;
    for segment in path {
        // INVARIANT: Replace scalars in the way with objects.
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }

        current = match current {
            Value::Object(map) => map.entry(segment.to_string()).or_insert(Value::Null),
            _ => unreachable!("slot was just made an object"),
        };
    }

    current
}

/// State store error types.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Key does not start with a known domain.
    #[error("unknown state domain in key {0:?}")]
    UnknownDomain(String),

    /// State document cannot be read.
    #[error("failed to read state document at {:?}", path.display())]
    Read {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// State document cannot be written.
    #[error("failed to write state document at {:?}", path.display())]
    Write {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Stored value cannot be converted.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Another thread panicked while holding the store.
    #[error("state store lock poisoned")]
    Poisoned,
}

/// Friendly result alias :3
pub type Result<T, E = StoreError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    #[test]
    fn missing_value_yields_default() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = JsonStore::open(dir.path())?;
        let result: Vec<String> = store.get("bans", vec!["fallback".into()])?;
        assert_eq!(result, vec!["fallback".to_string()]);

        Ok(())
    }

    #[test]
    fn nested_values_persist_across_reopen() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        {
            let store = JsonStore::open(dir.path())?;
            store.set("runtime.nodes.alpha", &3u32)?;
            store.set("runtime.nodes.beta", &5u32)?;
        }

        let store = JsonStore::open(dir.path())?;
        let result: BTreeMap<String, u32> = store.get("runtime.nodes", BTreeMap::new())?;
        assert_eq!(
            result,
            BTreeMap::from([("alpha".to_string(), 3), ("beta".to_string(), 5)])
        );
        assert!(!dir.path().join("runtime.json.tmp").exists());

        Ok(())
    }

    #[test]
    fn update_applies_in_place() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = JsonStore::open(dir.path())?;
        store.update("runtime.counter", 0u32, |count| *count += 1)?;
        let result = store.update("runtime.counter", 0u32, |count| *count += 1)?;
        assert_eq!(result, 2);

        Ok(())
    }

    #[test]
    fn failed_write_keeps_previous_value() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = JsonStore::open(dir.path())?;
        store.set("manifest.entries", &vec!["kept"])?;

        // Directory in the way of the temp file makes every write fail.
        create_dir_all(dir.path().join("manifest.json.tmp"))?;
        let result = store.set("manifest.entries", &vec!["lost"]);
        assert!(matches!(result, Err(StoreError::Write { .. })));
        let result = store.update("manifest.entries", Vec::<String>::new(), |entries| {
            entries.push("lost".into())
        });
        assert!(matches!(result, Err(StoreError::Write { .. })));

        let entries: Vec<String> = store.get("manifest.entries", Vec::new())?;
        assert_eq!(entries, vec!["kept".to_string()]);

        Ok(())
    }

    #[test]
    fn unknown_domain_is_rejected() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = JsonStore::open(dir.path())?;
        let result = store.get("nope.key", 0u32);
        assert!(matches!(result, Err(StoreError::UnknownDomain(_))));

        Ok(())
    }

    #[test]
    fn corrupt_document_reads_as_empty() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        write(dir.path().join("bans.json"), "{ not json")?;
        let store = JsonStore::open(dir.path())?;
        let result: Vec<String> = store.get("bans", Vec::new())?;
        assert!(result.is_empty());

        Ok(())
    }
}
