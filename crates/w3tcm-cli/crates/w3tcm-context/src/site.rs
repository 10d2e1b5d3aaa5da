use crate::config::SiteConfig;
use anyhow::{Context, Result};
use log::info;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use w3tcm_monitor::recovery::{CommandMinifier, Minifier};
use w3tcm_monitor::{purge_inline_scripts, write_atomic, ConfigBuilder, DirSink, SessionOptions, Store};

pub const CONFIG_FILE: &str = "w3tcm.json";
pub const SKIP_LIST_FILE: &str = "files-to-omit.ini";

/// A site root with its loaded configuration.
#[derive(Debug, Clone)]
pub struct Site {
    pub root: PathBuf,
    pub config: SiteConfig,
}

impl Site {
    /// Load the site at `dir`. A missing `w3tcm.json` gives the defaults.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE);
        let config = match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw)
                .with_context(|| format!("Failed to parse {}", path.display()))?,
            Err(e) if e.kind() == ErrorKind::NotFound => SiteConfig::default(),
            Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
        };
        Ok(Self {
            root: dir.to_path_buf(),
            config,
        })
    }

    pub fn load_cwd() -> Result<Self> {
        let cwd = std::env::current_dir()?;
        Self::load(&cwd)
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    pub fn output_dir(&self) -> PathBuf {
        self.root.join(&self.config.output_dir)
    }

    pub fn store_path(&self) -> PathBuf {
        self.root.join(&self.config.store_file)
    }

    /// The configured skip list extended by `files-to-omit.ini`.
    pub fn files_to_skip(&self) -> Result<Vec<String>> {
        let mut files = self.config.files_to_skip.clone();
        let path = self.root.join(SKIP_LIST_FILE);
        match fs::read_to_string(&path) {
            Ok(raw) => files.extend(parse_skip_list(&raw)),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
        Ok(files)
    }

    pub fn open_store(&self) -> Result<Store> {
        Store::open(&self.store_path())
    }

    pub fn builder(&self) -> ConfigBuilder {
        let host_config = self.config.host_config.as_ref().map(|p| self.root.join(p));
        ConfigBuilder::new(self.output_dir(), host_config)
    }

    /// Sink for extracted inline scripts; file names are reported relative to
    /// the site root.
    pub fn sink(&self) -> DirSink {
        let relative = self.config.output_dir.to_string_lossy().replace('\\', "/");
        DirSink::new(self.output_dir(), relative)
    }

    pub fn minifier(&self) -> Option<Box<dyn Minifier>> {
        self.config.minifier.as_ref().map(|m| {
            Box::new(CommandMinifier::new(m.program.clone(), m.args.clone())) as Box<dyn Minifier>
        })
    }

    pub fn session_options(&self) -> Result<SessionOptions> {
        Ok(SessionOptions {
            use_include: self.config.use_include,
            auto_minify: self.config.auto_minify,
            monitor_filters: self.config.monitor_filters.clone(),
            files_to_skip: self.files_to_skip()?,
            output_dir: self.output_dir(),
            host_config: self.config.host_config.as_ref().map(|p| self.root.join(p)),
            plugin_url: self.config.plugin_url.clone(),
            site_url: self.config.site_url.clone(),
            external_scripts: self.config.external_scripts.clone(),
        })
    }

    pub fn save_config(&self) -> Result<()> {
        write_atomic(&self.config_path(), self.config.to_json_pretty()?.as_bytes())
    }

    /// Flip auto-minify mode. Turning it on discards the manual-mode data
    /// but keeps the operator's notices.
    pub fn toggle_auto_minify(&mut self) -> Result<bool> {
        self.config.auto_minify = !self.config.auto_minify;
        if self.config.auto_minify {
            let mut store = self.open_store()?;
            store.reset(true);
            store.save()?;
            self.builder().remove_config()?;
        }
        self.save_config()?;
        info!("auto minify {}", if self.config.auto_minify { "on" } else { "off" });
        Ok(self.config.auto_minify)
    }

    /// Turn tracing of one extension point on or off.
    pub fn set_monitor_filter(&mut self, filter: &str, on: bool) -> Result<()> {
        if on {
            self.config.monitor_filters.insert(filter.to_string());
        } else {
            self.config.monitor_filters.remove(filter);
        }
        self.save_config()
    }

    pub fn clear_monitor(&mut self) -> Result<()> {
        self.config.monitor_filters.clear();
        self.save_config()
    }

    /// Clear the store and remove the generated configuration document.
    pub fn reset(&self) -> Result<()> {
        let mut store = self.open_store()?;
        store.reset(false);
        store.save()?;
        self.builder().remove_config()
    }

    /// Delete the extracted inline scripts; run when the host's minify cache
    /// is flushed.
    pub fn purge(&self) -> Result<usize> {
        let removed = purge_inline_scripts(&self.output_dir())?;
        info!("purged {removed} inline script(s)");
        Ok(removed)
    }
}

/// Non-comment lines of a skip-list file.
fn parse_skip_list(raw: &str) -> Vec<String> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;
    use w3tcm_monitor::{TemplateEntry, TemplateKey, CONF_FILE_NAME};

    #[test]
    fn test_parse_skip_list() {
        let raw = "# skipped files\n/wp-content/plugins/chat/chat.js\n\n  /a.js  \n";
        assert_eq!(
            parse_skip_list(raw),
            vec!["/wp-content/plugins/chat/chat.js", "/a.js"]
        );
    }

    #[test]
    fn test_missing_config_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let site = Site::load(dir.path()).unwrap();
        assert_eq!(site.config, SiteConfig::default());
        assert_eq!(site.files_to_skip().unwrap().len(), 2);
    }

    #[test]
    fn test_partial_config() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{"use_include": true, "thresholds": {"max_name_len": 6}}"#,
        )
        .unwrap();
        fs::write(dir.path().join(SKIP_LIST_FILE), "/x.js\n").unwrap();
        let site = Site::load(dir.path()).unwrap();
        assert!(site.config.use_include);
        assert_eq!(site.config.thresholds.max_name_len, 6);
        assert_eq!(site.config.thresholds.avg_name_len, 3.0);
        let options = site.session_options().unwrap();
        assert_eq!(options.files_to_skip.last().map(String::as_str), Some("/x.js"));
    }

    #[test]
    fn test_enabling_auto_minify_resets_manual_data() {
        let dir = TempDir::new().unwrap();
        let mut site = Site::load(dir.path()).unwrap();
        let mut store = site.open_store().unwrap();
        store
            .db_mut()
            .set_entry(&TemplateKey::new("abcde", "page"), TemplateEntry::DO_NOT_MINIFY);
        store.db_mut().add_notice("kept", false);
        store.save().unwrap();
        fs::create_dir_all(site.output_dir()).unwrap();
        fs::write(site.output_dir().join(CONF_FILE_NAME), "{}").unwrap();

        assert!(site.toggle_auto_minify().unwrap());
        let store = site.open_store().unwrap();
        assert!(store.db().data.is_empty());
        assert_eq!(store.db().notices, vec!["kept"]);
        assert!(!site.output_dir().join(CONF_FILE_NAME).exists());
        assert!(Site::load(dir.path()).unwrap().config.auto_minify);

        assert!(!site.toggle_auto_minify().unwrap());
    }

    #[test]
    fn test_monitor_filters_persist() {
        let dir = TempDir::new().unwrap();
        let mut site = Site::load(dir.path()).unwrap();
        site.set_monitor_filter("step", true).unwrap();
        site.set_monitor_filter("excluded_tag", true).unwrap();
        site.set_monitor_filter("step", false).unwrap();
        let loaded = Site::load(dir.path()).unwrap();
        assert_eq!(
            loaded.config.monitor_filters.into_iter().collect::<Vec<_>>(),
            vec!["excluded_tag"]
        );
        site.clear_monitor().unwrap();
        assert!(Site::load(dir.path()).unwrap().config.monitor_filters.is_empty());
    }
}
