//! Manual mode: persist per-template file order and regenerate the host's
//! grouping configuration.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{debug, info};
use serde_json::{Map, Value};

use crate::atomic::write_atomic;
use crate::notices::{remove_template_notices, NoticeQueue, NOTICE_PREFIX, TEMPLATE_WARNINGS};
use crate::store::{Database, LocationDiff, LogData, TemplateDiff};
use crate::types::{Location, OrderedFileList, TemplateEntry, TemplateKey};

/// Name of the generated configuration document.
pub const CONF_FILE_NAME: &str = "mc_alt_w3tc_minify.json";

/// Key of the host's manual-mode grouping map.
pub const GROUPS_KEY: &str = "minify.js.groups";

/// Builds the configuration document from the stored template entries.
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    output_dir: PathBuf,
    host_config: Option<PathBuf>,
}

impl ConfigBuilder {
    pub fn new(output_dir: impl Into<PathBuf>, host_config: Option<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            host_config,
        }
    }

    pub fn config_path(&self) -> PathBuf {
        self.output_dir.join(CONF_FILE_NAME)
    }

    /// Store `new` for `key` if it differs from the stored entry.
    ///
    /// A `DO-NOT-MINIFY` entry is only replaced when `override_do_not_minify`
    /// is set, and then only if the request queued no order warnings.
    /// Returns `true` if anything was written.
    pub fn update_database(
        &self,
        db: &mut Database,
        notices: &mut NoticeQueue,
        key: &TemplateKey,
        new: TemplateEntry,
        override_do_not_minify: bool,
        now: u64,
    ) -> Result<bool> {
        let old = db.entry(key).cloned().unwrap_or_default();
        let risky = !notices.pending(TEMPLATE_WARNINGS).is_empty();
        let new = if override_do_not_minify && old.is_do_not_minify() && risky {
            TemplateEntry::DO_NOT_MINIFY
        } else {
            new
        };

        if !(override_do_not_minify || !old.is_do_not_minify()) || new == old {
            notices.empty(TEMPLATE_WARNINGS);
            debug!("no change for template {key}");
            return Ok(false);
        }

        notices.flush(TEMPLATE_WARNINGS, db);
        if let (Some(new_files), Some(old_files)) = (new.files(), old.files()) {
            db.add_log_entry(key, LogData::Diff(diff(new_files, old_files)), now);
        }
        let removed = new.is_do_not_minify();
        db.set_entry(key, new);
        self.write_config(db)?;
        let message = if removed { "Removed." } else { "Updated." };
        db.add_log_entry(key, LogData::Message(message.to_string()), now);
        db.add_notice(
            format!(
                "{NOTICE_PREFIX}: The ordered list of JavaScript files for the theme: \"{}\" and the template: \
                 \"{}\" has been updated.",
                key.theme, key.template
            ),
            false,
        );
        info!("template {key}: {message}");
        Ok(true)
    }

    /// Operator decision on a queued warning.
    ///
    /// With `skip` the template is recorded as skipped and marked
    /// `DO-NOT-MINIFY`; otherwise only a notice is added. Either way the
    /// notice `notice_id` and every other notice for the template are removed.
    pub fn set_template_skip(
        &self,
        db: &mut Database,
        key: &TemplateKey,
        notice_id: &str,
        skip: bool,
        now: u64,
    ) -> Result<()> {
        if skip {
            if db.mark_skipped(key) {
                db.add_log_entry(
                    key,
                    LogData::Message(
                        "Skipped because a script has an out of order localize, translation, before or after script."
                            .to_string(),
                    ),
                    now,
                );
                db.add_notice(
                    format!("{NOTICE_PREFIX}: The scripts of template \"{key}\" will not be minified."),
                    false,
                );
            }
            self.update_database(
                db,
                &mut NoticeQueue::new(),
                key,
                TemplateEntry::DO_NOT_MINIFY,
                false,
                now,
            )?;
        } else {
            db.add_notice(
                format!("{NOTICE_PREFIX}: The scripts of template \"{key}\" will be minified."),
                false,
            );
        }
        remove_template_notices(db, notice_id);
        Ok(())
    }

    /// Merge the stored entries into the host configuration and write the
    /// result atomically.
    pub fn write_config(&self, db: &Database) -> Result<()> {
        let base = match &self.host_config {
            Some(path) => load_host_config(path)?,
            None => Value::Object(Map::new()),
        };
        let config = merge_groups(base, db)?;
        let json = serde_json::to_string_pretty(&config)?;
        let path = self.config_path();
        write_atomic(&path, json.as_bytes())?;
        debug!("wrote {}", path.display());
        Ok(())
    }

    /// Remove the generated document, if present.
    pub fn remove_config(&self) -> Result<()> {
        match fs::remove_file(self.config_path()) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

fn load_host_config(path: &Path) -> Result<Value> {
    match fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse host config {}", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Value::Object(Map::new())),
        Err(e) => Err(e).with_context(|| format!("Failed to read host config {}", path.display())),
    }
}

/// Merge `db.data` into `config[GROUPS_KEY]`.
///
/// Template entries of a stored theme replace matching entries in the base;
/// other templates of the theme are kept. `DO-NOT-MINIFY` entries and themes
/// left empty are dropped.
pub fn merge_groups(mut config: Value, db: &Database) -> Result<Value> {
    let root = config
        .as_object_mut()
        .context("Host config is not a JSON object")?;
    if !root.get(GROUPS_KEY).is_some_and(Value::is_object) {
        root.insert(GROUPS_KEY.to_string(), Value::Object(Map::new()));
    }
    let groups = root
        .get_mut(GROUPS_KEY)
        .and_then(Value::as_object_mut)
        .context("Grouping map is not a JSON object")?;

    for (theme, templates) in &db.data {
        let entry = groups
            .entry(theme.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        if let Some(entry) = entry.as_object_mut() {
            for (template, value) in templates {
                entry.insert(template.clone(), serde_json::to_value(value)?);
            }
        }
    }

    let marker = serde_json::to_value(TemplateEntry::DO_NOT_MINIFY)?;
    for templates in groups.values_mut() {
        if let Some(templates) = templates.as_object_mut() {
            templates.retain(|_, v| *v != marker);
        }
    }
    groups.retain(|_, templates| templates.as_object().is_some_and(|t| !t.is_empty()));
    Ok(config)
}

/// Added and removed files per location.
pub fn diff(new: &OrderedFileList, old: &OrderedFileList) -> TemplateDiff {
    Location::ALL
        .iter()
        .map(|&location| {
            let new_files = new.files(location);
            let old_files = old.files(location);
            let added = new_files
                .iter()
                .filter(|f| !old_files.contains(f))
                .cloned()
                .collect();
            let removed = old_files
                .iter()
                .filter(|f| !new_files.contains(f))
                .cloned()
                .collect();
            (location, LocationDiff { added, removed })
        })
        .collect()
}
