//! Keyed on-disk memoization for pipeline artifacts.
//!
//! Every store assumes a single writer per key: one run owns an output
//! directory at a time. Writes go through a temp file and a rename, so an
//! interrupted run never leaves a truncated artifact that a later run would
//! mistake for a cache hit.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::model::FalseAssertionRecord;
use crate::util::{read_json, write_json_pretty, write_text};

/// Plain-text artifacts stored as `<dir>/<key>.<extension>`.
#[derive(Debug, Clone)]
pub struct TextStore {
    dir: PathBuf,
    extension: &'static str,
}

impl TextStore {
    pub fn new(dir: impl Into<PathBuf>, extension: &'static str) -> Self {
        Self {
            dir: dir.into(),
            extension,
        }
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", encode_key(key), self.extension))
    }

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.path_for(key);
        if !path.is_file() {
            return Ok(None);
        }
        fs::read_to_string(&path)
            .map(Some)
            .with_context(|| format!("failed to read cached artifact {}", path.display()))
    }

    pub fn put(&self, key: &str, text: &str) -> Result<PathBuf> {
        let path = self.path_for(key);
        write_text(&path, text)?;
        Ok(path)
    }

    pub fn len(&self) -> Result<usize> {
        count_with_extension(&self.dir, self.extension)
    }
}

/// JSON artifacts stored as `<dir>/<key>.json`.
#[derive(Debug, Clone)]
pub struct JsonStore {
    dir: PathBuf,
}

impl JsonStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", encode_key(key)))
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let path = self.path_for(key);
        if !path.is_file() {
            return Ok(None);
        }
        read_json(&path).map(Some)
    }

    pub fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<PathBuf> {
        let path = self.path_for(key);
        write_json_pretty(&path, value)?;
        Ok(path)
    }

    pub fn len(&self) -> Result<usize> {
        count_with_extension(&self.dir, "json")
    }
}

/// Append-only collection of injected false assertions, persisted as a single
/// JSON array and indexed by cell id.
#[derive(Debug, Clone)]
pub struct FalseAssertionCache {
    path: PathBuf,
    records: IndexMap<String, FalseAssertionRecord>,
}

impl FalseAssertionCache {
    pub fn load(path: &Path) -> Result<Self> {
        let mut records = IndexMap::new();
        if path.is_file() {
            let stored: Vec<FalseAssertionRecord> = read_json(path)?;
            for record in stored {
                // first record wins if the file holds duplicates
                records.entry(record.cell_id.clone()).or_insert(record);
            }
        }
        Ok(Self {
            path: path.to_path_buf(),
            records,
        })
    }

    pub fn get(&self, cell_id: &str) -> Option<&FalseAssertionRecord> {
        self.records.get(cell_id)
    }

    /// Adds a record unless one already exists for the id. Returns whether it
    /// was added.
    pub fn append(&mut self, record: FalseAssertionRecord) -> bool {
        if self.records.contains_key(&record.cell_id) {
            return false;
        }
        self.records.insert(record.cell_id.clone(), record);
        true
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self) -> Result<()> {
        let records: Vec<&FalseAssertionRecord> = self.records.values().collect();
        write_json_pretty(&self.path, &records)
    }
}

/// Maps a term id onto one file-name component. Bytes outside
/// `[A-Za-z0-9_-]` become `%XX`, so distinct ids never share a path and no id
/// can reach outside its parent directory.
pub fn encode_key(key: &str) -> String {
    let mut encoded = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'_' | b'-') {
            encoded.push(char::from(byte));
        } else {
            let _ = write!(encoded, "%{byte:02X}");
        }
    }
    encoded
}

fn count_with_extension(dir: &Path, extension: &str) -> Result<usize> {
    if !dir.is_dir() {
        return Ok(0);
    }

    let mut count = 0;
    for entry in fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))? {
        let path = entry
            .with_context(|| format!("failed to read entry in {}", dir.display()))?
            .path();
        let hidden = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with('.'));
        let matches = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext == extension);
        if path.is_file() && matches && !hidden {
            count += 1;
        }
    }
    Ok(count)
}
