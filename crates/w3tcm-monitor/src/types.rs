use std::fmt;

use serde::{Deserialize, Serialize};

use crate::hash::content_hash;

/// Where the host emits a combined bundle for manual-mode groups.
///
/// `Head` is emitted right after `<head>`, `Body` right after `<body>` and
/// `Footer` right before `</body>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Location {
    #[serde(rename = "include")]
    Head,
    #[serde(rename = "include-body")]
    Body,
    #[serde(rename = "include-footer")]
    Footer,
}

impl Location {
    pub const ALL: [Location; 3] = [Location::Head, Location::Body, Location::Footer];

    pub fn as_str(self) -> &'static str {
        match self {
            Location::Head => "include",
            Location::Body => "include-body",
            Location::Footer => "include-footer",
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileGroup {
    #[serde(default)]
    pub files: Vec<String>,
}

/// The as-served script order of one template, bucketed by location.
///
/// Serializes to the host's manual-mode group shape:
/// `{"include": {"files": [...]}, "include-body": {...}, "include-footer": {...}}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderedFileList {
    #[serde(rename = "include", default)]
    pub head: FileGroup,
    #[serde(rename = "include-body", default)]
    pub body: FileGroup,
    #[serde(rename = "include-footer", default)]
    pub footer: FileGroup,
}

impl OrderedFileList {
    pub fn files(&self, location: Location) -> &[String] {
        match location {
            Location::Head => &self.head.files,
            Location::Body => &self.body.files,
            Location::Footer => &self.footer.files,
        }
    }

    pub fn push(&mut self, location: Location, src: impl Into<String>) {
        let group = match location {
            Location::Head => &mut self.head,
            Location::Body => &mut self.body,
            Location::Footer => &mut self.footer,
        };
        group.files.push(src.into());
    }

    pub fn is_empty(&self) -> bool {
        Location::ALL.iter().all(|l| self.files(*l).is_empty())
    }
}

/// The three values that identify a (possibly child) theme.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThemeInfo {
    pub theme_root: String,
    pub template: String,
    pub stylesheet: String,
}

impl ThemeInfo {
    /// Local fingerprint used when the host does not supply its own theme key.
    /// Five hex chars, the same width as the host's keys.
    pub fn fingerprint(&self) -> String {
        let hash = content_hash(&format!(
            "{}{}{}",
            self.theme_root, self.template, self.stylesheet
        ));
        hash[..5].to_string()
    }
}

/// `(theme_hash, template_basename)`: the index of all per-template state.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TemplateKey {
    pub theme: String,
    pub template: String,
}

impl TemplateKey {
    pub fn new(theme: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            theme: theme.into(),
            template: template.into(),
        }
    }
}

impl fmt::Display for TemplateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.theme, self.template)
    }
}

/// Basename of a template path without its `.php` extension.
pub fn template_basename(template: &str) -> String {
    let name = template.rsplit(['/', '\\']).next().unwrap_or(template);
    name.strip_suffix(".php").unwrap_or(name).to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DoNotMinify {
    #[serde(rename = "DO-NOT-MINIFY")]
    Marker,
}

/// The persisted value for one template: either its file order or the
/// `"DO-NOT-MINIFY"` marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TemplateEntry {
    Marker(DoNotMinify),
    Files(OrderedFileList),
}

impl TemplateEntry {
    pub const DO_NOT_MINIFY: TemplateEntry = TemplateEntry::Marker(DoNotMinify::Marker);

    pub fn is_do_not_minify(&self) -> bool {
        matches!(self, TemplateEntry::Marker(_))
    }

    pub fn files(&self) -> Option<&OrderedFileList> {
        match self {
            TemplateEntry::Files(files) => Some(files),
            TemplateEntry::Marker(_) => None,
        }
    }
}

impl Default for TemplateEntry {
    fn default() -> Self {
        TemplateEntry::Files(OrderedFileList::default())
    }
}

/// Per-template minification decision derived from the persisted entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TemplateDecision {
    Pending,
    Minify,
    DoNotMinify,
}

impl TemplateDecision {
    pub fn of(entry: Option<&TemplateEntry>) -> Self {
        match entry {
            None => TemplateDecision::Pending,
            Some(TemplateEntry::Marker(_)) => TemplateDecision::DoNotMinify,
            Some(TemplateEntry::Files(_)) => TemplateDecision::Minify,
        }
    }
}

/// Load behaviour of an external `<script>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncType {
    Sync,
    Async,
    Defer,
}

impl SyncType {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncType::Sync => "sync",
            SyncType::Async => "async",
            SyncType::Defer => "defer",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiagnosticCode {
    /// The shadow list and the host's script numbering diverged.
    #[serde(rename = "MC_DESYNC")]
    Desync,
    /// A conditional script does not end with the closing sequence the
    /// embed-position clamp assumes.
    #[serde(rename = "CONDITIONAL_TAIL")]
    ConditionalTail,
    /// An extracted inline script could not be written.
    #[serde(rename = "INLINE_WRITE")]
    InlineWrite,
    /// The template was replaced by a later `template_include` filter.
    #[serde(rename = "TEMPLATE_OVERRIDE")]
    TemplateOverride,
}

/// A recovered fault observed during one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub code: DiagnosticCode,
    pub message: String,
}

impl Diagnostic {
    pub fn new(code: DiagnosticCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}
