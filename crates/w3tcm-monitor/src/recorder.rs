//! Manual mode: record the as-served script order of each template.

use std::sync::LazyLock;

use log::{debug, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::hash::content_hash;
use crate::notices::{notice_id_marker, template_marker, NOTICE_PREFIX, TEMPLATE_WARNINGS};
use crate::session::{RecordState, RequestContext};
use crate::store::LogData;
use crate::types::{
    template_basename, Diagnostic, DiagnosticCode, Location, SyncType, TemplateKey, ThemeInfo,
};

static CONDITIONAL_COMMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<!--(\[if\s.+\])>.+<!\[endif\]-->").expect("valid regex")
});

static SCRIPT_ELEMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<script.*?</script>").expect("valid regex"));

static SRC_ATTRIBUTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\ssrc=(?:'[^']+'|"[^"]+")"#).expect("valid regex")
});

static SYNC_ATTRIBUTE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)\s+(async|defer)(\s|>)").expect("valid regex"));

/// Render phase the host is in when it emits a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderPhase {
    Head,
    Footer,
    Other,
}

/// An inline script WordPress emits next to the script it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Companion {
    Localize,
    Before,
    After,
}

impl Companion {
    pub fn as_str(self) -> &'static str {
        match self {
            Companion::Localize => "localize",
            Companion::Before => "before",
            Companion::After => "after",
        }
    }
}

/// Where a companion ends up relative to the combined bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmittedOrder {
    Before,
    After,
}

impl EmittedOrder {
    pub fn as_str(self) -> &'static str {
        match self {
            EmittedOrder::Before => "before",
            EmittedOrder::After => "after",
        }
    }
}

/// `(use_include, companion, resulting order)` combinations that break
/// execution order. With `include` the bundle lands right after `<head>`, so
/// localize and before scripts run after their owner; with `include-body`
/// it lands after `<body>`, so after scripts run before it.
const COMPANION_RISKS: [(bool, Companion, EmittedOrder); 3] = [
    (true, Companion::Localize, EmittedOrder::After),
    (true, Companion::Before, EmittedOrder::After),
    (false, Companion::After, EmittedOrder::Before),
];

/// One classified `<script>` emission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScriptEvent {
    pub src: String,
    /// Emission sequence number within the request.
    pub index: usize,
    pub conditional: Option<String>,
    pub has_localize: bool,
    pub has_before: bool,
    pub has_after: bool,
    pub sync_type: SyncType,
}

impl ScriptEvent {
    /// Classify the markup WordPress emitted for one enqueued script.
    pub fn classify(tag: &str, src: &str, has_localize: bool, index: usize) -> Self {
        let conditional = CONDITIONAL_COMMENT
            .captures(tag)
            .map(|caps| caps[1].to_string());
        let mut src_index = None;
        let mut has_before = false;
        let mut has_after = false;
        for (i, element) in SCRIPT_ELEMENT.find_iter(tag).enumerate() {
            if SRC_ATTRIBUTE.is_match(element.as_str()) {
                src_index.get_or_insert(i);
            } else if src_index.is_none() {
                has_before = true;
            } else {
                has_after = true;
            }
        }
        Self {
            src: src.to_string(),
            index,
            conditional,
            has_localize,
            has_before,
            has_after,
            sync_type: sync_type_of(tag),
        }
    }

    fn has(&self, companion: Companion) -> bool {
        match companion {
            Companion::Localize => self.has_localize,
            Companion::Before => self.has_before,
            Companion::After => self.has_after,
        }
    }

    /// Companions that would be emitted on the wrong side of the bundle.
    pub fn companion_risks(&self, use_include: bool) -> Vec<(Companion, EmittedOrder)> {
        COMPANION_RISKS
            .iter()
            .filter(|(include, companion, _)| *include == use_include && self.has(*companion))
            .map(|(_, companion, order)| (*companion, *order))
            .collect()
    }
}

/// Load behaviour declared on a script tag.
pub fn sync_type_of(tag: &str) -> SyncType {
    match SYNC_ATTRIBUTE.captures(tag) {
        Some(caps) if caps[1].eq_ignore_ascii_case("async") => SyncType::Async,
        Some(_) => SyncType::Defer,
        None => SyncType::Sync,
    }
}

/// A `script_loader_tag` emission as the host reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptTag {
    pub tag: String,
    #[serde(default)]
    pub handle: String,
    pub src: String,
    pub phase: RenderPhase,
    /// Data registered with `wp_localize_script` for the handle, if any.
    #[serde(default)]
    pub localize_data: Option<String>,
}

/// Watches template resolution and script emission in manual mode.
#[derive(Debug, Clone)]
pub struct ScriptRecorder {
    use_include: bool,
    files_to_skip: Vec<String>,
}

impl ScriptRecorder {
    pub fn new(use_include: bool, files_to_skip: Vec<String>) -> Self {
        Self {
            use_include,
            files_to_skip,
        }
    }

    /// Handle one `template_include` resolution.
    ///
    /// The first resolution of the request is the original candidate; a later
    /// one that differs is an override the host cannot minify.
    pub fn resolve_template(
        &self,
        ctx: &mut RequestContext,
        template: &str,
        theme: &ThemeInfo,
        theme_key: Option<&str>,
    ) {
        let initial = ctx
            .initial_template
            .get_or_insert_with(|| template.to_string())
            .clone();
        let theme_key = theme_key
            .map(str::to_string)
            .unwrap_or_else(|| theme.fingerprint());
        let key = TemplateKey::new(theme_key, template_basename(template));

        if ctx.store.db().theme_map.get(&key.theme) != Some(theme) {
            ctx.store
                .db_mut()
                .theme_map
                .insert(key.theme.clone(), theme.clone());
        }
        ctx.key = Some(key.clone());
        ctx.state = RecordState::Skip;

        if !ctx.override_do_not_minify
            && ctx
                .store
                .db()
                .entry(&key)
                .is_some_and(|entry| entry.is_do_not_minify())
        {
            debug!("template {key} is marked do-not-minify");
            return;
        }

        if template != initial {
            let now = ctx.now;
            let db = ctx.store.db_mut();
            if db.mark_skipped(&key) {
                db.add_log_entry(
                    &key,
                    LogData::Message(format!(
                        "Skipped because it is an override of {initial}."
                    )),
                    now,
                );
                db.add_notice(
                    format!(
                        "{NOTICE_PREFIX}: WARNING: Template \"{template}\" cannot be minified because it was \
                         included using the filter 'template_include' to override the template \"{initial}\". \
                         W3TC cannot handle templates included using the filter 'template_include'."
                    ),
                    false,
                );
            }
            let message = format!("template {template} overrides {initial}");
            warn!("{message}");
            ctx.diagnostics
                .push(Diagnostic::new(DiagnosticCode::TemplateOverride, message));
            ctx.state = RecordState::ForceDoNotMinify;
            return;
        }

        ctx.state = RecordState::Record;
    }

    fn is_skipped(&self, src: &str) -> bool {
        self.files_to_skip.iter().any(|f| src.contains(f.as_str()))
    }

    /// Handle one `script_loader_tag` emission. The tag itself is never
    /// changed.
    pub fn on_script_tag(&self, ctx: &mut RequestContext, tag: &ScriptTag) {
        if ctx.state != RecordState::Record || self.is_skipped(&tag.src) {
            return;
        }
        let Some(key) = ctx.key.clone() else {
            return;
        };
        let index = ctx.emitted;
        ctx.emitted += 1;

        match tag.phase {
            RenderPhase::Footer => ctx.files.push(Location::Footer, tag.src.as_str()),
            RenderPhase::Head => {
                let event =
                    ScriptEvent::classify(&tag.tag, &tag.src, tag.localize_data.is_some(), index);
                let location = if self.use_include {
                    Location::Head
                } else {
                    Location::Body
                };
                ctx.files.push(location, event.src.as_str());
                self.queue_warnings(ctx, &key, tag, &event);
            }
            RenderPhase::Other => {}
        }
    }

    fn queue_warnings(
        &self,
        ctx: &mut RequestContext,
        key: &TemplateKey,
        tag: &ScriptTag,
        event: &ScriptEvent,
    ) {
        let src = &event.src;
        if let Some(condition) = &event.conditional {
            let id = content_hash(&format!("{}{}{src}{condition}", key.theme, key.template));
            ctx.notices.add(
                TEMPLATE_WARNINGS,
                format!(
                    "{NOTICE_PREFIX}: WARNING: In template \"{key}\" the script \"{src}\" has a HTML conditional \
                     comment - \"{condition}\". An action is required to resolve this: either do not minify this \
                     template or mark it safe to minify. {} {}",
                    template_marker(key),
                    notice_id_marker(&id)
                ),
            );
        }

        for (companion, order) in event.companion_risks(self.use_include) {
            let id = content_hash(&format!(
                "{}{}{src}{}{}",
                key.theme,
                key.template,
                companion.as_str(),
                order.as_str()
            ));
            ctx.notices.add(
                TEMPLATE_WARNINGS,
                format!(
                    "{NOTICE_PREFIX}: WARNING: In template \"{key}\" the script \"{src}\" has a {} script which \
                     will be emitted {} itself. An action is required to resolve this: either do not minify this \
                     template or mark it safe to minify. {} {}",
                    companion.as_str(),
                    order.as_str(),
                    template_marker(key),
                    notice_id_marker(&id)
                ),
            );
            let payload = match companion {
                Companion::Localize => tag.localize_data.clone().unwrap_or_default(),
                Companion::Before | Companion::After => tag.tag.clone(),
            };
            let now = ctx.now;
            ctx.store.db_mut().add_misc(&id, payload, now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notices::TEMPLATE_WARNINGS;
    use crate::store::Store;
    use crate::types::TemplateEntry;
    use pretty_assertions::assert_eq;

    const LOCALIZED: &str = "<script type='text/javascript'>/* localize */</script>\n\
<script type='text/javascript' src='/wp-includes/js/a.js'></script>\n";

    const BEFORE_AFTER: &str = "<script>/* before */</script>\n\
<script src=\"/b.js\"></script>\n<script>/* after */</script>\n";

    const CONDITIONAL: &str = "<!--[if lt IE 9]>\n<script src='/html5.js'></script>\n<![endif]-->\n";

    fn theme() -> ThemeInfo {
        ThemeInfo {
            theme_root: "/wp/themes".into(),
            template: "twentysixteen".into(),
            stylesheet: "twentysixteen".into(),
        }
    }

    fn ctx() -> RequestContext {
        RequestContext::new(Store::in_memory(), 1_000, false)
    }

    fn head(tag: &str, src: &str) -> ScriptTag {
        ScriptTag {
            tag: tag.into(),
            handle: "h".into(),
            src: src.into(),
            phase: RenderPhase::Head,
            localize_data: None,
        }
    }

    #[test]
    fn test_classify_companions() {
        let event = ScriptEvent::classify(BEFORE_AFTER, "/b.js", false, 0);
        assert!(event.has_before);
        assert!(event.has_after);
        assert!(!event.has_localize);
        assert_eq!(event.conditional, None);

        let event = ScriptEvent::classify(CONDITIONAL, "/html5.js", false, 0);
        assert_eq!(event.conditional.as_deref(), Some("[if lt IE 9]"));
        assert!(!event.has_before);
    }

    #[test]
    fn test_src_first_makes_trailing_inline_an_after_script() {
        let tag = "<script src='/c.js'></script><script>/* after */</script>";
        let event = ScriptEvent::classify(tag, "/c.js", false, 0);
        assert!(!event.has_before);
        assert!(event.has_after);
    }

    #[test]
    fn test_risk_table() {
        let event = ScriptEvent::classify(BEFORE_AFTER, "/b.js", true, 0);
        assert_eq!(
            event.companion_risks(true),
            vec![
                (Companion::Localize, EmittedOrder::After),
                (Companion::Before, EmittedOrder::After)
            ]
        );
        assert_eq!(
            event.companion_risks(false),
            vec![(Companion::After, EmittedOrder::Before)]
        );
    }

    #[test]
    fn test_sync_type() {
        assert_eq!(sync_type_of("<script src='a.js'></script>"), SyncType::Sync);
        assert_eq!(sync_type_of("<script async src='a.js'></script>"), SyncType::Async);
        assert_eq!(sync_type_of("<script src='a.js' DEFER></script>"), SyncType::Defer);
    }

    #[test]
    fn test_routes_by_phase_and_skips() {
        let recorder = ScriptRecorder::new(false, vec!["admin-bar".into()]);
        let mut ctx = ctx();
        recorder.resolve_template(&mut ctx, "/t/single.php", &theme(), Some("abcde"));
        assert_eq!(ctx.state, RecordState::Record);

        recorder.on_script_tag(&mut ctx, &head("<script src='/a.js'></script>", "/a.js"));
        recorder.on_script_tag(
            &mut ctx,
            &head("<script src='/admin-bar.min.js'></script>", "/admin-bar.min.js"),
        );
        let mut footer = head("<script src='/f.js'></script>", "/f.js");
        footer.phase = RenderPhase::Footer;
        recorder.on_script_tag(&mut ctx, &footer);
        let mut other = head("<script src='/o.js'></script>", "/o.js");
        other.phase = RenderPhase::Other;
        recorder.on_script_tag(&mut ctx, &other);

        assert_eq!(ctx.files.body.files, vec!["/a.js"]);
        assert_eq!(ctx.files.footer.files, vec!["/f.js"]);
        assert!(ctx.files.head.files.is_empty());
        assert_eq!(ctx.key, Some(TemplateKey::new("abcde", "single")));
        assert_eq!(ctx.store.db().theme_map["abcde"], theme());
    }

    #[test]
    fn test_localize_risk_queues_warning_and_misc() {
        let recorder = ScriptRecorder::new(true, Vec::new());
        let mut ctx = ctx();
        recorder.resolve_template(&mut ctx, "page.php", &theme(), Some("abcde"));
        let mut tag = head(LOCALIZED, "/wp-includes/js/a.js");
        tag.localize_data = Some("var l10n = {};".into());
        recorder.on_script_tag(&mut ctx, &tag);

        let pending = ctx.notices.pending(TEMPLATE_WARNINGS);
        // localize data plus the inline element before the owner
        assert_eq!(pending.len(), 2);
        assert!(pending[0].contains("has a localize script which will be emitted after itself"));
        assert!(pending[0].contains("[template:abcde.page]"));
        assert_eq!(ctx.files.head.files, vec!["/wp-includes/js/a.js"]);
        let misc_values: Vec<_> = ctx.store.db().misc.values().flatten().collect();
        assert_eq!(misc_values.len(), 2);
    }

    #[test]
    fn test_conditional_queues_warning() {
        let recorder = ScriptRecorder::new(false, Vec::new());
        let mut ctx = ctx();
        recorder.resolve_template(&mut ctx, "page.php", &theme(), Some("abcde"));
        recorder.on_script_tag(&mut ctx, &head(CONDITIONAL, "/html5.js"));
        let pending = ctx.notices.pending(TEMPLATE_WARNINGS);
        assert_eq!(pending.len(), 1);
        assert!(pending[0].contains("HTML conditional comment - \"[if lt IE 9]\""));
    }

    #[test]
    fn test_do_not_minify_template_is_skipped() {
        let recorder = ScriptRecorder::new(false, Vec::new());
        let mut store = Store::in_memory();
        store
            .db_mut()
            .set_entry(&TemplateKey::new("abcde", "page"), TemplateEntry::DO_NOT_MINIFY);
        let mut ctx = RequestContext::new(store, 0, false);
        recorder.resolve_template(&mut ctx, "page.php", &theme(), Some("abcde"));
        assert_eq!(ctx.state, RecordState::Skip);
        recorder.on_script_tag(&mut ctx, &head("<script src='/a.js'></script>", "/a.js"));
        assert!(ctx.files.is_empty());

        let mut ctx = RequestContext::new(ctx.store, 0, true);
        recorder.resolve_template(&mut ctx, "page.php", &theme(), Some("abcde"));
        assert_eq!(ctx.state, RecordState::Record);
    }

    #[test]
    fn test_template_override_fault() {
        let recorder = ScriptRecorder::new(false, Vec::new());
        let mut ctx = ctx();
        recorder.resolve_template(&mut ctx, "page.php", &theme(), Some("abcde"));
        recorder.resolve_template(&mut ctx, "landing.php", &theme(), Some("abcde"));
        assert_eq!(ctx.state, RecordState::ForceDoNotMinify);
        assert_eq!(ctx.diagnostics[0].code, DiagnosticCode::TemplateOverride);
        let db = ctx.store.db();
        assert_eq!(db.skipped["abcde"], vec!["landing"]);
        assert_eq!(db.notices.len(), 1);

        // a second override of the same template is not reported again
        let mut ctx = RequestContext::new(ctx.store, 0, false);
        recorder.resolve_template(&mut ctx, "page.php", &theme(), Some("abcde"));
        recorder.resolve_template(&mut ctx, "landing.php", &theme(), Some("abcde"));
        assert_eq!(ctx.store.db().notices.len(), 1);
    }
}
