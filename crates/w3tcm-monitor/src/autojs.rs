//! Auto mode: take over the host's automatic script batching.
//!
//! The host flushes its collected batch every time it meets an inline script,
//! which splits a page into many bundles and can reorder execution. This
//! engine extracts each inline script into a content-addressed file, keeps
//! collecting into the same batch, and hands the host its own mirror of the
//! batch at flush time.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::Result;
use log::{debug, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::atomic::write_atomic;
use crate::conditional::{
    all_script_tags, check_conditional_tails, check_for_conditional_html, excluded_guard_setter,
    guard_name, guard_open, guarded_content, inline_guard_setter, GUARD_CLOSE,
};
use crate::embed::EmbedCorrector;
use crate::extension::MinifyExtension;
use crate::hash::content_hash;
use crate::recorder::sync_type_of;
use crate::session::RequestContext;
use crate::shadow::ShadowFileList;
use crate::types::{Diagnostic, DiagnosticCode, SyncType};

/// File name prefix of extracted inline scripts.
pub const INLINE_PREFIX: &str = "mc-w3tcm-inline-";

/// Replacement for an extracted, unconditional inline script.
pub const INLINE_REPLACED: &str = "<!-- mc_w3tcm: inline replaced. -->\n";

static SRC_ATTRIBUTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<script\s+[^<>]*src=["']?([^"'> ]+)["'> ]"#).expect("valid regex")
});

static SCRIPT_TAGS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"</?script(\s.*?>|>)").expect("valid regex"));

/// Name of the file holding extracted inline `content`.
pub fn inline_filename(content: &str) -> String {
    format!("{INLINE_PREFIX}{}.js", content_hash(content))
}

/// Where extracted inline scripts are written.
pub trait ScriptSink {
    /// Persist `content` as `filename` unless that file already exists and
    /// return the path the host should minify it from.
    fn persist(&mut self, filename: &str, content: &str) -> Result<String>;
}

/// Writes inline scripts into a directory below the site root.
#[derive(Debug, Clone)]
pub struct DirSink {
    dir: PathBuf,
    /// `dir` relative to the document root, as the host expects file names.
    relative: String,
}

impl DirSink {
    pub fn new(dir: impl Into<PathBuf>, relative: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            relative: relative.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl ScriptSink for DirSink {
    fn persist(&mut self, filename: &str, content: &str) -> Result<String> {
        let path = self.dir.join(filename);
        // Same name means same content.
        if !path.exists() {
            write_atomic(&path, content.as_bytes())?;
            debug!("wrote inline script {}", path.display());
        }
        let relative = self.relative.trim_end_matches('/');
        Ok(if relative.is_empty() {
            filename.to_string()
        } else {
            format!("{relative}/{filename}")
        })
    }
}

/// Keeps extracted scripts in memory; used when replaying traces dry.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    pub files: std::collections::BTreeMap<String, String>,
}

impl ScriptSink for MemorySink {
    fn persist(&mut self, filename: &str, content: &str) -> Result<String> {
        self.files
            .entry(filename.to_string())
            .or_insert_with(|| content.to_string());
        Ok(filename.to_string())
    }
}

/// Maps a script `src` to what the host minifies: a document-root relative
/// file for local scripts, the full URL for remote scripts the host accepts.
pub trait AssetResolver {
    fn resolve(&self, src: &str) -> Option<String>;
}

#[derive(Debug, Clone, Default)]
pub struct SiteResolver {
    site_url: String,
    external_scripts: Vec<String>,
}

impl SiteResolver {
    pub fn new(site_url: impl Into<String>, external_scripts: Vec<String>) -> Self {
        Self {
            site_url: site_url.into().trim_end_matches('/').to_string(),
            external_scripts,
        }
    }

    fn full_url(&self, src: &str) -> String {
        if let Some(rest) = src.strip_prefix("//") {
            let scheme = match self.site_url.split_once("://") {
                Some((scheme, _)) if !scheme.is_empty() => scheme,
                _ => "https",
            };
            format!("{scheme}://{rest}")
        } else if src.starts_with('/') {
            format!("{}{src}", self.site_url)
        } else {
            src.to_string()
        }
    }
}

impl AssetResolver for SiteResolver {
    fn resolve(&self, src: &str) -> Option<String> {
        let url = self.full_url(src);
        let url = url.split(['?', '#']).next().unwrap_or(&url);
        if !self.site_url.is_empty() {
            if let Some(path) = url.strip_prefix(&self.site_url) {
                if path.starts_with('/') {
                    let path = path.trim_start_matches('/');
                    return (!path.is_empty()).then(|| path.to_string());
                }
            }
        }
        self.external_scripts
            .iter()
            .any(|allowed| url.starts_with(allowed.as_str()))
            .then(|| url.to_string())
    }
}

/// What the flush decision learned about the last script tag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LastTag {
    #[default]
    Unknown,
    Inline,
    Skipped,
    HeadEnd,
    AfterLast,
}

/// Per-request state of the auto-mode engine.
#[derive(Debug, Default)]
pub struct AutoState {
    pub conditional_scripts: Vec<String>,
    pub all_scripts: Option<Vec<String>>,
    pub shadow: ShadowFileList,
    pub embed: EmbedCorrector,
    pub skipped_scripts: Vec<String>,
    pub last_tag: LastTag,
    pub inline_conditional: bool,
}

impl AutoState {
    fn is_conditional(&self, tag: &str) -> bool {
        self.conditional_scripts.iter().any(|s| s == tag)
    }
}

/// Data passed with "should this inline script be handled locally".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalScriptData {
    pub script_tag_original: String,
    pub script_tag_number: usize,
    pub script_tag_pos: usize,
    #[serde(default)]
    pub should_replace: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_tag_new: Option<String>,
}

/// Data passed with "should this excluded script be handled".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExcludedTagData {
    pub script_tag_original: String,
    pub script_tag_number: usize,
    #[serde(default)]
    pub script_tag_pos: usize,
    pub script_src: String,
    #[serde(default)]
    pub should_replace: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_tag_new: Option<String>,
}

/// Data passed with "finalize this batch".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepData {
    pub files_to_minify: Vec<String>,
    pub embed_pos: usize,
    pub embed_type: String,
}

impl StepData {
    fn is_non_blocking(&self) -> bool {
        matches!(self.embed_type.as_str(), "nb-async" | "nb-defer")
    }
}

/// A script the host is asked to enqueue so that a page made only of inline
/// scripts still produces a batch in each section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceholderScript {
    pub handle: String,
    pub src: String,
    pub in_footer: bool,
}

pub fn placeholder_scripts(plugin_url: &str) -> Vec<PlaceholderScript> {
    let base = plugin_url.trim_end_matches('/');
    vec![
        PlaceholderScript {
            handle: "mc_w3tcm-dummy-fe-head".into(),
            src: format!("{base}/mc_w3tcm-dummy-fe-head.js"),
            in_footer: false,
        },
        PlaceholderScript {
            handle: "mc_w3tcm-dummy-fe-body".into(),
            src: format!("{base}/mc_w3tcm-dummy-fe-body.js"),
            in_footer: true,
        },
    ]
}

/// The auto-mode engine. Each extension point reads and updates the
/// request's [`AutoState`].
pub struct AutoMinifyMonitor {
    sink: Box<dyn ScriptSink>,
    resolver: Box<dyn AssetResolver>,
}

impl AutoMinifyMonitor {
    pub fn new(sink: Box<dyn ScriptSink>, resolver: Box<dyn AssetResolver>) -> Self {
        Self { sink, resolver }
    }

    fn persist(&mut self, ctx: &mut RequestContext, content: &str) -> Option<String> {
        let filename = inline_filename(content);
        match self.sink.persist(&filename, content) {
            Ok(path) => Some(path),
            Err(e) => {
                let message = format!("failed to write {filename}: {e:#}");
                warn!("{message}");
                ctx.diagnostics
                    .push(Diagnostic::new(DiagnosticCode::InlineWrite, message));
                None
            }
        }
    }

    fn check_sync(ctx: &mut RequestContext, script_tag_number: usize) {
        if let Some(diagnostic) = ctx.auto.shadow.check(script_tag_number) {
            ctx.diagnostics.push(diagnostic);
        }
    }
}

impl MinifyExtension for AutoMinifyMonitor {
    fn name(&self) -> &'static str {
        "auto-minify"
    }

    fn process_content(&mut self, ctx: &mut RequestContext, buffer: String) -> String {
        let found = check_for_conditional_html(&buffer);
        if found.is_empty() {
            return buffer;
        }
        for diagnostic in check_conditional_tails(&buffer, &found) {
            warn!("{}", diagnostic.message);
            ctx.diagnostics.push(diagnostic);
        }
        ctx.auto.conditional_scripts = found.into_iter().map(|c| c.script).collect();
        let all = all_script_tags(&buffer);
        if !all.is_empty() {
            ctx.auto.all_scripts = Some(all);
        }
        buffer
    }

    fn script_tags(&mut self, ctx: &mut RequestContext, script_tags: Vec<String>) -> Vec<String> {
        // The host's own scan misses scripts inside conditional comments.
        match &ctx.auto.all_scripts {
            Some(all) => all.clone(),
            None => script_tags,
        }
    }

    fn local_script(&mut self, ctx: &mut RequestContext, mut data: LocalScriptData) -> LocalScriptData {
        let number = data.script_tag_number;
        if data.script_tag_original.contains("</head>") {
            let slot = ctx.auto.shadow.slot(number);
            ctx.auto.shadow.set_at(slot, None);
            ctx.auto.embed.record_head_end(data.script_tag_pos);
            return data;
        }

        let tag = data.script_tag_original.as_str();
        let guard = ctx.auto.is_conditional(tag).then(|| guard_name(tag));
        let content = SCRIPT_TAGS.replace_all(tag, "");
        let content = match &guard {
            Some(guard) => guarded_content(guard, &content),
            None => content.into_owned(),
        };

        Self::check_sync(ctx, number);
        let slot = ctx.auto.shadow.slot(number);
        let Some(file) = self.persist(ctx, &content) else {
            ctx.auto.shadow.set_at(slot, None);
            return data;
        };
        ctx.auto.shadow.set_at(slot, Some(file));

        let replacement = match &guard {
            Some(guard) => inline_guard_setter(guard),
            None => INLINE_REPLACED.to_string(),
        };
        ctx.auto
            .embed
            .record_inline(data.script_tag_pos, replacement.len(), guard.is_some());
        ctx.auto.inline_conditional = guard.is_some();
        data.should_replace = true;
        data.script_tag_new = Some(replacement);
        data
    }

    fn tag_minification(
        &mut self,
        ctx: &mut RequestContext,
        do_tag_minification: bool,
        script_tag: &str,
        file: &str,
    ) -> bool {
        if ctx.auto.is_conditional(script_tag) {
            // Handled later as an excluded tag.
            return false;
        }
        let entry = (do_tag_minification && sync_type_of(script_tag) == SyncType::Sync)
            .then(|| file.to_string());
        ctx.auto.shadow.push(entry);
        do_tag_minification
    }

    fn excluded_tag(&mut self, ctx: &mut RequestContext, mut data: ExcludedTagData) -> ExcludedTagData {
        let original = data.script_tag_original.clone();
        if !ctx.auto.is_conditional(&original) {
            data.should_replace = true;
            data.script_tag_new = Some(format!("<!-- mc_w3tcm -->{original}<!-- mc_w3tcm-->"));
            return data;
        }

        let number = data.script_tag_number;
        let guard = guard_name(&original);
        Self::check_sync(ctx, number);
        let slot = ctx.auto.shadow.slot(number);

        let resolved = self.resolver.resolve(&data.script_src);
        let wrapped = resolved.and_then(|file| {
            let pre = self.persist(ctx, &guard_open(&guard))?;
            let post = self.persist(ctx, GUARD_CLOSE)?;
            Some((pre, file, post))
        });
        let Some((pre, file, post)) = wrapped else {
            // Leave the script to the host.
            debug!("conditional script {} left to the host", data.script_src);
            ctx.auto.shadow.set_at(slot, None);
            ctx.auto.skipped_scripts.push(original);
            return data;
        };

        ctx.auto.shadow.set_at(slot, Some(pre));
        ctx.auto.shadow.set_at(slot + 1, Some(file));
        ctx.auto.shadow.set_at(slot + 2, Some(post));
        ctx.auto.shadow.add_extras(number, 2);
        data.should_replace = true;
        data.script_tag_new = Some(excluded_guard_setter(&guard));
        data
    }

    fn flush_collected(
        &mut self,
        ctx: &mut RequestContext,
        do_flush_collected: bool,
        last_script_tag: &str,
        sync_type: SyncType,
    ) -> bool {
        if sync_type != SyncType::Sync {
            return do_flush_collected;
        }
        let auto = &mut ctx.auto;
        if last_script_tag.contains("</head>") {
            auto.last_tag = LastTag::HeadEnd;
            return true;
        }
        if last_script_tag.is_empty() {
            auto.last_tag = LastTag::AfterLast;
            return true;
        }
        if !SRC_ATTRIBUTE.is_match(last_script_tag) {
            // Inline scripts were extracted, keep collecting.
            auto.last_tag = LastTag::Inline;
            auto.inline_conditional = false;
            return false;
        }
        if auto.is_conditional(last_script_tag)
            && !auto.skipped_scripts.iter().any(|s| s == last_script_tag)
        {
            return false;
        }
        auto.last_tag = LastTag::Skipped;
        true
    }

    fn step(&mut self, ctx: &mut RequestContext, mut data: StepData) -> StepData {
        if data.is_non_blocking() {
            return data;
        }
        if !ctx.auto.shadow.contains_all(&data.files_to_minify) {
            let message = format!(
                "shadow file list is out of sync at batch flush: host={:?} shadow={:?}",
                data.files_to_minify,
                ctx.auto.shadow.entries()
            );
            warn!("{message}");
            ctx.diagnostics
                .push(Diagnostic::new(DiagnosticCode::Desync, message));
        }
        if matches!(
            ctx.auto.last_tag,
            LastTag::Skipped | LastTag::HeadEnd | LastTag::AfterLast
        ) {
            data.files_to_minify = ctx.auto.shadow.take_batch();
        }
        ctx.auto.last_tag = LastTag::Unknown;
        data.embed_pos = ctx.auto.embed.correct(data.embed_pos);
        data
    }

    fn minify_filename(
        &mut self,
        ctx: &mut RequestContext,
        minify_filename: String,
        files: &[String],
        _kind: &str,
    ) -> String {
        if ctx.store.db().minify_map.get(&minify_filename).map(Vec::as_slice) != Some(files) {
            ctx.store
                .db_mut()
                .minify_map
                .insert(minify_filename.clone(), files.to_vec());
        }
        minify_filename
    }
}

/// Delete every extracted inline script in `dir`. Returns how many were
/// removed.
pub fn purge_inline_scripts(dir: &Path) -> Result<usize> {
    let mut removed = 0;
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(INLINE_PREFIX) && name.ends_with(".js") {
            std::fs::remove_file(entry.path())?;
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn monitor() -> AutoMinifyMonitor {
        AutoMinifyMonitor::new(
            Box::new(MemorySink::default()),
            Box::new(SiteResolver::new("https://example.com", Vec::new())),
        )
    }

    fn ctx() -> RequestContext {
        RequestContext::new(Store::in_memory(), 0, false)
    }

    fn local(tag: &str, number: usize, pos: usize) -> LocalScriptData {
        LocalScriptData {
            script_tag_original: tag.into(),
            script_tag_number: number,
            script_tag_pos: pos,
            should_replace: false,
            script_tag_new: None,
        }
    }

    #[test]
    fn test_resolver() {
        let resolver = SiteResolver::new(
            "https://example.com/",
            vec!["https://cdn.example.net/".into()],
        );
        assert_eq!(resolver.resolve("/wp/a.js?ver=1").as_deref(), Some("wp/a.js"));
        assert_eq!(
            resolver.resolve("https://example.com/wp/b.js").as_deref(),
            Some("wp/b.js")
        );
        assert_eq!(
            resolver.resolve("//cdn.example.net/c.js").as_deref(),
            Some("https://cdn.example.net/c.js")
        );
        assert_eq!(resolver.resolve("https://other.org/d.js"), None);
    }

    #[test]
    fn test_protocol_relative_src_without_site_scheme() {
        let cdn = vec!["https://cdn.example.net/".to_string()];
        for site_url in ["example.com", ""] {
            let resolver = SiteResolver::new(site_url, cdn.clone());
            assert_eq!(
                resolver.resolve("//cdn.example.net/c.js").as_deref(),
                Some("https://cdn.example.net/c.js")
            );
        }
        let resolver = SiteResolver::new("", cdn);
        assert_eq!(resolver.resolve("/x.js"), None);
    }

    #[test]
    fn test_inline_script_is_extracted() {
        let mut monitor = monitor();
        let mut ctx = ctx();
        let tag = "<script type='text/javascript'>var a = 1;</script>";
        let data = monitor.local_script(&mut ctx, local(tag, 0, 40));
        assert!(data.should_replace);
        assert_eq!(data.script_tag_new.as_deref(), Some(INLINE_REPLACED));
        assert_eq!(
            ctx.auto.shadow.entries(),
            &[Some(inline_filename("var a = 1;"))]
        );
        assert!(ctx.diagnostics.is_empty());
        assert!(!monitor.flush_collected(&mut ctx, true, tag, SyncType::Sync));
        assert_eq!(ctx.auto.last_tag, LastTag::Inline);
    }

    #[test]
    fn test_async_scripts_hold_empty_slots() {
        let mut monitor = monitor();
        let mut ctx = ctx();
        assert!(monitor.tag_minification(&mut ctx, true, "<script src='/a.js'></script>", "a.js"));
        assert!(monitor.tag_minification(&mut ctx, true, "<script async src='/b.js'></script>", "b.js"));
        assert!(!monitor.tag_minification(&mut ctx, false, "<script src='/c.js'></script>", "c.js"));
        assert_eq!(
            ctx.auto.shadow.entries(),
            &[Some("a.js".to_string()), None, None]
        );
    }

    #[test]
    fn test_head_end_sets_embed_position() {
        let mut monitor = monitor();
        let mut ctx = ctx();
        monitor.tag_minification(&mut ctx, true, "<script src='/a.js'></script>", "a.js");
        monitor.local_script(&mut ctx, local("<script>x()</script>", 1, 80));
        monitor.local_script(&mut ctx, local("</head>", 2, 120));
        assert!(monitor.flush_collected(&mut ctx, true, "</head>", SyncType::Sync));
        let step = monitor.step(
            &mut ctx,
            StepData {
                files_to_minify: vec!["a.js".into()],
                embed_pos: 10,
                embed_type: "blocking".into(),
            },
        );
        assert_eq!(step.embed_pos, 120);
        assert_eq!(
            step.files_to_minify,
            vec!["a.js".to_string(), inline_filename("x()")]
        );
        assert!(ctx.diagnostics.is_empty());
    }

    #[test]
    fn test_non_conditional_excluded_tag_is_marked() {
        let mut monitor = monitor();
        let mut ctx = ctx();
        let data = monitor.excluded_tag(
            &mut ctx,
            ExcludedTagData {
                script_tag_original: "<script src='/x.js'></script>".into(),
                script_tag_number: 0,
                script_tag_pos: 0,
                script_src: "/x.js".into(),
                should_replace: false,
                script_tag_new: None,
            },
        );
        assert_eq!(
            data.script_tag_new.as_deref(),
            Some("<!-- mc_w3tcm --><script src='/x.js'></script><!-- mc_w3tcm-->")
        );
        assert!(ctx.auto.shadow.is_empty());
    }

    #[test]
    fn test_unresolvable_conditional_is_left_to_host() {
        let mut monitor = monitor();
        let mut ctx = ctx();
        let tag = "<script src='https://other.org/ie.js'></script>";
        ctx.auto.conditional_scripts = vec![tag.into()];
        let data = monitor.excluded_tag(
            &mut ctx,
            ExcludedTagData {
                script_tag_original: tag.into(),
                script_tag_number: 0,
                script_tag_pos: 0,
                script_src: "https://other.org/ie.js".into(),
                should_replace: false,
                script_tag_new: None,
            },
        );
        assert!(!data.should_replace);
        assert_eq!(ctx.auto.skipped_scripts, vec![tag]);
        assert!(monitor.flush_collected(&mut ctx, false, tag, SyncType::Sync));
        assert_eq!(ctx.auto.last_tag, LastTag::Skipped);
    }

    #[test]
    fn test_minify_map_recorded() {
        let mut monitor = monitor();
        let mut ctx = ctx();
        let files = vec!["a.js".to_string(), "b.js".to_string()];
        let name = monitor.minify_filename(&mut ctx, "c7035.js".into(), &files, "js");
        assert_eq!(name, "c7035.js");
        assert_eq!(ctx.store.db().minify_map["c7035.js"], files);
        let options = serde_json::json!({"cache_control": "max-age=3600"});
        assert_eq!(monitor.file_handler_options(&mut ctx, options.clone()), options);
    }

    #[test]
    fn test_dir_sink_and_purge() {
        let dir = TempDir::new().unwrap();
        let mut sink = DirSink::new(dir.path(), "wp-content/mc-w3tcm-output/");
        let name = inline_filename("x();");
        let path = sink.persist(&name, "x();").unwrap();
        assert_eq!(path, format!("wp-content/mc-w3tcm-output/{name}"));
        assert_eq!(
            std::fs::read_to_string(dir.path().join(&name)).unwrap(),
            "x();"
        );
        std::fs::write(dir.path().join("keep.js"), "").unwrap();
        assert_eq!(purge_inline_scripts(dir.path()).unwrap(), 1);
        assert!(dir.path().join("keep.js").exists());
    }
}
