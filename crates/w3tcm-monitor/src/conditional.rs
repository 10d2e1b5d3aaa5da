//! Legacy conditional comments (`<!--[if lt IE 9]> ... <![endif]-->`).
//!
//! The host strips HTML comments before it scans for scripts, so scripts
//! inside conditional comments would be lost. Each such script is turned into
//! a runtime guard: its content is wrapped in `if (guard) { ... }` and the tag
//! itself is replaced by a tiny script that sets the guard to `true`. The
//! replacement stays inside the comment, so the guard is only set when the
//! condition holds.

use std::sync::LazyLock;

use regex::Regex;

use crate::hash::content_hash;
use crate::types::{Diagnostic, DiagnosticCode};

static CONDITIONAL_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<!--(\[if\s.+?\])>(.*?)<!\[endif\]-->").expect("valid regex")
});

static FIRST_SCRIPT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<script.+?</script>").expect("valid regex"));

static ALL_SCRIPTS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)(<script\s*[^>]*>.*?</script>|</head>)").expect("valid regex")
});

/// Closing sequence the embed-position clamp assumes after a conditional
/// script.
pub const CONDITIONAL_TAIL: &str = "</script>\n<![endif]-->";

/// Bytes past a conditional script's replacement that belong to its comment:
/// the newline and `<![endif]-->`.
pub const CONDITIONAL_TAIL_EXTRA: usize = 1 + "<![endif]-->".len();

/// A `<script>` found inside a conditional comment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionalScript {
    /// The `[if ...]` condition text.
    pub condition: String,
    /// Exactly the `<script>...</script>` element.
    pub script: String,
    /// Byte range of the whole comment in the buffer.
    pub start: usize,
    pub end: usize,
}

/// Find every conditional comment in `buffer` that wraps a `<script>`.
pub fn check_for_conditional_html(buffer: &str) -> Vec<ConditionalScript> {
    CONDITIONAL_BLOCK
        .captures_iter(buffer)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let body = caps.get(2)?.as_str();
            if !body.contains("<script") {
                return None;
            }
            let script = FIRST_SCRIPT.find(body)?;
            Some(ConditionalScript {
                condition: caps[1].to_string(),
                script: script.as_str().to_string(),
                start: whole.start(),
                end: whole.end(),
            })
        })
        .collect()
}

/// Every `<script>` element and the `</head>` marker, in document order,
/// including scripts hidden in comments.
pub fn all_script_tags(buffer: &str) -> Vec<String> {
    ALL_SCRIPTS
        .find_iter(buffer)
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Guard variable name for a conditional script tag.
pub fn guard_name(script_tag: &str) -> String {
    format!("w3tcmHtmlCond_{}", content_hash(script_tag))
}

pub fn guard_open(guard: &str) -> String {
    format!("if ( typeof {guard} !== 'undefined' && {guard} ) {{\n")
}

pub const GUARD_CLOSE: &str = "\n}\n";

/// Wrap extracted inline content so it only runs when `guard` is set.
pub fn guarded_content(guard: &str, content: &str) -> String {
    format!("{}{content}{GUARD_CLOSE}", guard_open(guard))
}

/// Replacement for an inline conditional script.
pub fn inline_guard_setter(guard: &str) -> String {
    format!("<script>\n// mc_w3tcm: inline replaced.\nvar {guard} = true;\n</script>")
}

/// Replacement for an external conditional script.
pub fn excluded_guard_setter(guard: &str) -> String {
    format!("<script>\n// mc_w3tcm: HTML comment conditional replaced.\nvar {guard} = true;\n</script>")
}

/// Check that each conditional script ends with [`CONDITIONAL_TAIL`].
/// Mismatches are reported, never corrected.
pub fn check_conditional_tails(buffer: &str, scripts: &[ConditionalScript]) -> Vec<Diagnostic> {
    scripts
        .iter()
        .filter_map(|script| {
            let block = buffer.get(script.start..script.end)?;
            let script_end = block.find(&script.script)? + script.script.len();
            let tail_start = script_end - "</script>".len();
            if block[tail_start..].starts_with(CONDITIONAL_TAIL) {
                return None;
            }
            Some(Diagnostic::new(
                DiagnosticCode::ConditionalTail,
                format!(
                    "conditional script at offset {} does not end with {:?}; embed position may be off",
                    script.start, CONDITIONAL_TAIL
                ),
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const PAGE: &str = "<html><head>\n\
<!--[if lt IE 9]>\n<script src='/html5.js'></script>\n<![endif]-->\n\
<!--[if IE]><p>no script</p><![endif]-->\n\
<script>var a = 1;</script>\n\
</head><body>\n\
<!--[if lte IE 8]>\n<script>var ie = 8;</script><![endif]-->\n\
</body></html>";

    #[test]
    fn test_finds_only_blocks_with_scripts() {
        let found = check_for_conditional_html(PAGE);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].condition, "[if lt IE 9]");
        assert_eq!(found[0].script, "<script src='/html5.js'></script>");
        assert_eq!(found[1].condition, "[if lte IE 8]");
        assert_eq!(found[1].script, "<script>var ie = 8;</script>");
    }

    #[test]
    fn test_all_script_tags_in_order() {
        let tags = all_script_tags(PAGE);
        assert_eq!(
            tags,
            vec![
                "<script src='/html5.js'></script>",
                "<script>var a = 1;</script>",
                "</head>",
                "<script>var ie = 8;</script>",
            ]
        );
    }

    #[test]
    fn test_guard_is_deterministic() {
        let tag = "<script>var ie = 8;</script>";
        let guard = guard_name(tag);
        assert_eq!(guard, guard_name(tag));
        assert!(guard.starts_with("w3tcmHtmlCond_"));
        assert_eq!(guard.len(), "w3tcmHtmlCond_".len() + 32);
        assert_ne!(guard, guard_name("<script>var ie = 9;</script>"));
    }

    #[test]
    fn test_guarded_content() {
        assert_eq!(
            guarded_content("g", "x();"),
            "if ( typeof g !== 'undefined' && g ) {\nx();\n}\n"
        );
    }

    #[test]
    fn test_conditional_tail_monitor() {
        let found = check_for_conditional_html(PAGE);
        let diagnostics = check_conditional_tails(PAGE, &found);
        // The second block has no newline before `<![endif]-->`.
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].code, DiagnosticCode::ConditionalTail);
    }
}
