use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use w3tcm_lexer::Thresholds;

/// Represents the `w3tcm.json` site configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteConfig {
    /// Emit head scripts as `include` instead of `include-body`.
    pub use_include: bool,
    pub auto_minify: bool,
    /// Extension points whose values are traced.
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub monitor_filters: BTreeSet<String>,
    pub files_to_skip: Vec<String>,
    pub thresholds: Thresholds,
    /// Relative to the site root.
    pub output_dir: PathBuf,
    pub store_file: PathBuf,
    /// Exported host configuration used as the merge base.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_config: Option<PathBuf>,
    pub site_url: String,
    pub plugin_url: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub external_scripts: Vec<String>,
    /// Request path prefix of the host's combined files.
    pub minify_cache_prefix: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minifier: Option<MinifierCommand>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics_token: Option<String>,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            use_include: false,
            auto_minify: false,
            monitor_filters: BTreeSet::new(),
            files_to_skip: vec![
                "/wp-includes/js/admin-bar.js".into(),
                "/wp-includes/js/admin-bar.min.js".into(),
            ],
            thresholds: Thresholds::default(),
            output_dir: PathBuf::from("wp-content/mc-w3tcm-output"),
            store_file: PathBuf::from("wp-content/mc-w3tcm-output/store.json"),
            host_config: None,
            site_url: String::new(),
            plugin_url: String::new(),
            external_scripts: Vec::new(),
            minify_cache_prefix: "/wp-content/cache/minify/".into(),
            minifier: None,
            diagnostics_token: None,
        }
    }
}

/// External program used as the per-file minifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinifierCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl SiteConfig {
    pub fn to_json_pretty(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
