use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::atomic::write_atomic;
use crate::types::{Location, TemplateEntry, TemplateKey, ThemeInfo};

/// Miscellaneous notes older than this are pruned at request start.
pub const MISC_MAX_AGE_SECS: u64 = 86_400 * 10;

/// Added/removed file names for one location.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

pub type TemplateDiff = BTreeMap<Location, LocationDiff>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LogData {
    Message(String),
    Diff(TemplateDiff),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub time: u64,
    pub data: LogData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MiscNote {
    pub time: u64,
    pub data: String,
}

/// Everything persisted between requests.
///
/// Concurrent requests race on read-modify-write of this document; the last
/// write wins.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Database {
    /// theme → template → file order or `DO-NOT-MINIFY`.
    pub data: BTreeMap<String, BTreeMap<String, TemplateEntry>>,
    /// theme → template → append-only change log.
    pub log: BTreeMap<String, BTreeMap<String, Vec<LogEntry>>>,
    /// theme → templates skipped by operator action or override.
    pub skipped: BTreeMap<String, Vec<String>>,
    pub theme_map: BTreeMap<String, ThemeInfo>,
    /// notice id → payloads shown by the `misc` dump page.
    pub misc: BTreeMap<String, Vec<MiscNote>>,
    /// Operator-visible notices.
    pub notices: Vec<String>,
    /// combined filename → component files, from auto mode.
    pub minify_map: BTreeMap<String, Vec<String>>,
}

impl Database {
    pub fn entry(&self, key: &TemplateKey) -> Option<&TemplateEntry> {
        self.data.get(&key.theme)?.get(&key.template)
    }

    pub fn set_entry(&mut self, key: &TemplateKey, entry: TemplateEntry) {
        self.data
            .entry(key.theme.clone())
            .or_default()
            .insert(key.template.clone(), entry);
    }

    pub fn add_log_entry(&mut self, key: &TemplateKey, data: LogData, now: u64) {
        self.log
            .entry(key.theme.clone())
            .or_default()
            .entry(key.template.clone())
            .or_default()
            .push(LogEntry { time: now, data });
    }

    /// The most recent structural diff logged for `key`.
    pub fn latest_diff(&self, key: &TemplateKey) -> Option<&TemplateDiff> {
        self.log
            .get(&key.theme)?
            .get(&key.template)?
            .iter()
            .rev()
            .find_map(|entry| match &entry.data {
                LogData::Diff(diff) => Some(diff),
                LogData::Message(_) => None,
            })
    }

    /// Append a notice. With `no_duplicate`, an identical notice already in
    /// the list is not added again and `false` is returned.
    pub fn add_notice(&mut self, notice: impl Into<String>, no_duplicate: bool) -> bool {
        let notice = notice.into();
        if no_duplicate && self.notices.contains(&notice) {
            return false;
        }
        self.notices.push(notice);
        true
    }

    pub fn add_misc(&mut self, key: &str, data: impl Into<String>, now: u64) {
        self.misc.entry(key.to_string()).or_default().push(MiscNote {
            time: now,
            data: data.into(),
        });
    }

    pub fn misc(&self, key: &str) -> Vec<&str> {
        self.misc
            .get(key)
            .map(|notes| notes.iter().map(|n| n.data.as_str()).collect())
            .unwrap_or_default()
    }

    pub fn delete_misc(&mut self, key: &str) {
        self.misc.remove(key);
    }

    /// Drop notes older than `max_age` seconds and keys left empty.
    pub fn prune_misc(&mut self, now: u64, max_age: u64) {
        for notes in self.misc.values_mut() {
            notes.retain(|n| now.saturating_sub(n.time) < max_age);
        }
        self.misc.retain(|_, notes| !notes.is_empty());
    }

    /// Record `key` as skipped. Returns `true` the first time only.
    pub fn mark_skipped(&mut self, key: &TemplateKey) -> bool {
        let templates = self.skipped.entry(key.theme.clone()).or_default();
        if templates.contains(&key.template) {
            return false;
        }
        templates.push(key.template.clone());
        true
    }
}

/// A [`Database`] backed by a JSON file.
#[derive(Debug)]
pub struct Store {
    path: Option<PathBuf>,
    db: Database,
    dirty: bool,
}

impl Store {
    /// Open the store at `path`; a missing file yields an empty database.
    pub fn open(path: &Path) -> Result<Self> {
        let db = match fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str(&raw)
                .with_context(|| format!("Failed to parse store {}", path.display()))?,
            Err(e) if e.kind() == ErrorKind::NotFound => Database::default(),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read store {}", path.display()))
            }
        };
        Ok(Self {
            path: Some(path.to_path_buf()),
            db,
            dirty: false,
        })
    }

    /// A store that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            db: Database::default(),
            dirty: false,
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn db_mut(&mut self) -> &mut Database {
        self.dirty = true;
        &mut self.db
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Clear everything. With `keep_notices` the notice list survives.
    pub fn reset(&mut self, keep_notices: bool) {
        let notices = std::mem::take(&mut self.db.notices);
        self.db = Database::default();
        if keep_notices {
            self.db.notices = notices;
        }
        self.dirty = true;
    }

    /// Prune stale misc notes, touching the store only if any are stale.
    pub fn prune_misc(&mut self, now: u64) {
        let stale = self
            .db
            .misc
            .values()
            .flatten()
            .any(|n| now.saturating_sub(n.time) >= MISC_MAX_AGE_SECS);
        if stale {
            self.db_mut().prune_misc(now, MISC_MAX_AGE_SECS);
        }
    }

    /// Write the database if it changed since it was opened.
    pub fn save(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        if let Some(path) = &self.path {
            let json = serde_json::to_string_pretty(&self.db)?;
            write_atomic(path, json.as_bytes())?;
            debug!("saved store to {}", path.display());
        }
        self.dirty = false;
        Ok(())
    }
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn key() -> TemplateKey {
        TemplateKey::new("a1b2c", "single")
    }

    #[test]
    fn test_notice_deduplication() {
        let mut db = Database::default();
        assert!(db.add_notice("hello", true));
        assert!(!db.add_notice("hello", true));
        assert!(db.add_notice("hello", false));
        assert_eq!(db.notices.len(), 2);
    }

    #[test]
    fn test_latest_diff_skips_messages() {
        let mut db = Database::default();
        let mut diff = TemplateDiff::new();
        diff.insert(
            Location::Footer,
            LocationDiff {
                added: vec!["/a.js".into()],
                removed: Vec::new(),
            },
        );
        db.add_log_entry(&key(), LogData::Diff(diff.clone()), 1);
        db.add_log_entry(&key(), LogData::Message("Updated.".into()), 2);
        assert_eq!(db.latest_diff(&key()), Some(&diff));
        assert_eq!(db.latest_diff(&TemplateKey::new("x", "y")), None);
    }

    #[test]
    fn test_prune_misc() {
        let mut db = Database::default();
        db.add_misc("old", "stale", 0);
        db.add_misc("new", "fresh", 1_000_000);
        db.prune_misc(1_000_001, MISC_MAX_AGE_SECS);
        assert_eq!(db.misc("old"), Vec::<&str>::new());
        assert_eq!(db.misc("new"), vec!["fresh"]);
        assert!(!db.misc.contains_key("old"));
    }

    #[test]
    fn test_mark_skipped_once() {
        let mut db = Database::default();
        assert!(db.mark_skipped(&key()));
        assert!(!db.mark_skipped(&key()));
    }

    #[test]
    fn test_store_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.json");
        let mut store = Store::open(&path).unwrap();
        assert_eq!(store.db(), &Database::default());
        store.db_mut().set_entry(&key(), TemplateEntry::DO_NOT_MINIFY);
        store.db_mut().add_log_entry(&key(), LogData::Message("Removed.".into()), 7);
        store.save().unwrap();
        assert!(!store.is_dirty());

        let reopened = Store::open(&path).unwrap();
        assert_eq!(reopened.db().entry(&key()), Some(&TemplateEntry::DO_NOT_MINIFY));
        assert_eq!(reopened.db().log["a1b2c"]["single"][0].time, 7);
    }

    #[test]
    fn test_reset_keeps_notices() {
        let mut store = Store::in_memory();
        store.db_mut().add_notice("kept", false);
        store.db_mut().set_entry(&key(), TemplateEntry::default());
        store.reset(true);
        assert_eq!(store.db().notices, vec!["kept"]);
        assert!(store.db().data.is_empty());
    }
}
