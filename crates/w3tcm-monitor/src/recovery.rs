//! Recovery from minifier faults on generated bundle requests.

use std::fmt;
use std::io::Write;
use std::process::{Command, Stdio};

use log::{error, warn};
use serde::{Deserialize, Serialize};
use w3tcm_lexer::{classify_with, Thresholds};

use crate::notices::NOTICE_PREFIX;
use crate::store::Database;

/// Separator between combined sources; terminates a trailing line comment.
pub const IMPLODE_SEPARATOR: &str = "\n;";

pub const JS_CONTENT_TYPE: &str = "application/x-javascript";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MinifyError {
    pub message: String,
}

impl MinifyError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for MinifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for MinifyError {}

/// A per-file JavaScript minifier.
pub trait Minifier {
    fn name(&self) -> &str;
    fn minify(&self, source: &str) -> Result<String, MinifyError>;
}

/// Runs an external program that reads JavaScript on stdin and writes the
/// minified result to stdout.
#[derive(Debug, Clone)]
pub struct CommandMinifier {
    program: String,
    args: Vec<String>,
}

impl CommandMinifier {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl Minifier for CommandMinifier {
    fn name(&self) -> &str {
        &self.program
    }

    fn minify(&self, source: &str) -> Result<String, MinifyError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| MinifyError::new(format!("failed to start {}: {e}", self.program)))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(source.as_bytes())
                .map_err(|e| MinifyError::new(e.to_string()))?;
        }
        let output = child
            .wait_with_output()
            .map_err(|e| MinifyError::new(e.to_string()))?;
        if !output.status.success() {
            return Err(MinifyError::new(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        String::from_utf8(output.stdout).map_err(|e| MinifyError::new(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Combined {
    pub original_length: usize,
    pub content: String,
}

/// Combine `sources`, minifying each one that does not already look minified.
///
/// A source the minifier rejects is emitted unminified, and the operator is
/// told once per file.
pub fn combine_minify(
    sources: &[Source],
    minifier: Option<&dyn Minifier>,
    thresholds: &Thresholds,
    db: &mut Database,
) -> Combined {
    let mut parts = Vec::with_capacity(sources.len());
    let mut original_length = 0;
    for source in sources {
        original_length += source.content.len();
        let minifier = minifier.filter(|_| !classify_with(&source.content, thresholds).is_yes());
        let Some(minifier) = minifier else {
            parts.push(source.content.clone());
            continue;
        };
        match minifier.minify(&source.content) {
            Ok(minified) => parts.push(minified),
            Err(e) => {
                warn!("minify of {} by {} failed: {e}", source.path, minifier.name());
                parts.push(source.content.clone());
                let first = db.add_notice(
                    format!(
                        "{NOTICE_PREFIX}: Minify of file \"{}\" by {}() failed.",
                        source.path,
                        minifier.name()
                    ),
                    true,
                );
                if first {
                    db.add_notice(
                        format!(
                            "{NOTICE_PREFIX}: Consider excluding file \"{}\" from minification.",
                            source.path
                        ),
                        true,
                    );
                }
            }
        }
    }
    Combined {
        original_length,
        content: parts.join(IMPLODE_SEPARATOR),
    }
}

/// A finished response to a request under the host's minify cache path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinifyResponse {
    pub status: u16,
    pub request_uri: String,
    /// Extension the host derived for the requested bundle.
    #[serde(default)]
    pub ext: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Recovery {
    /// Send this instead of the host's failed response.
    Replaced {
        status: u16,
        content_type: String,
        body: String,
    },
    Unchanged,
}

/// Bundle file name of a request under `cache_prefix`, without query.
pub fn minify_filename(request_uri: &str, cache_prefix: &str) -> Option<String> {
    let rest = request_uri.strip_prefix(cache_prefix)?;
    let name = rest.split(['?', '#']).next().unwrap_or(rest);
    Some(name.to_string())
}

/// Replace a failed bundle response with the unminified recombination of its
/// sources.
///
/// Only a 500 for a `.js` bundle is replaced. A 500 that cannot be recovered
/// leaves a single notice per bundle.
pub fn recover_failed_request(
    response: &MinifyResponse,
    cache_prefix: &str,
    sources: &[Source],
    minifier: Option<&dyn Minifier>,
    thresholds: &Thresholds,
    db: &mut Database,
) -> Recovery {
    if response.status != 500 {
        return Recovery::Unchanged;
    }
    if response.ext.as_deref() == Some("js") {
        let combined = combine_minify(sources, minifier, thresholds, db);
        return Recovery::Replaced {
            status: 200,
            content_type: JS_CONTENT_TYPE.to_string(),
            body: combined.content,
        };
    }
    if let Some(filename) = minify_filename(&response.request_uri, cache_prefix) {
        error!("request for minified file {filename} failed");
        db.add_notice(
            format!("{NOTICE_PREFIX}: HTTP request for minified file \"{filename}\" failed."),
            true,
        );
    }
    Recovery::Unchanged
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::cell::Cell;

    struct Failing {
        calls: Cell<usize>,
    }

    impl Minifier for Failing {
        fn name(&self) -> &str {
            "Minify_YUICompressor::minify"
        }

        fn minify(&self, _source: &str) -> Result<String, MinifyError> {
            self.calls.set(self.calls.get() + 1);
            Err(MinifyError::new("parse error"))
        }
    }

    struct Trim;

    impl Minifier for Trim {
        fn name(&self) -> &str {
            "trim"
        }

        fn minify(&self, source: &str) -> Result<String, MinifyError> {
            Ok(source.split_whitespace().collect::<Vec<_>>().join(" "))
        }
    }

    fn source(path: &str, content: &str) -> Source {
        Source {
            path: path.into(),
            content: content.into(),
        }
    }

    #[test]
    fn test_combine_skips_minified_sources() {
        let sources = [
            source("a.min.js", "var a=1,b=2;"),
            source("b.js", "var accumulatorValue   =   1;"),
        ];
        let mut db = Database::default();
        let combined = combine_minify(&sources, Some(&Trim), &Thresholds::default(), &mut db);
        assert_eq!(combined.content, "var a=1,b=2;\n;var accumulatorValue = 1;");
        assert_eq!(
            combined.original_length,
            sources.iter().map(|s| s.content.len()).sum::<usize>()
        );
    }

    #[test]
    fn test_failed_minify_falls_back_with_one_notice_pair() {
        let failing = Failing { calls: Cell::new(0) };
        let sources = [source("big.js", "var temporaryResult = 2;")];
        let mut db = Database::default();
        let combined = combine_minify(&sources, Some(&failing), &Thresholds::default(), &mut db);
        assert_eq!(combined.content, "var temporaryResult = 2;");
        assert_eq!(db.notices.len(), 2);
        assert!(db.notices[1].contains("Consider excluding file \"big.js\""));

        combine_minify(&sources, Some(&failing), &Thresholds::default(), &mut db);
        assert_eq!(failing.calls.get(), 2);
        assert_eq!(db.notices.len(), 2);
    }

    #[test]
    fn test_recover_failed_js_bundle() {
        let mut db = Database::default();
        let response = MinifyResponse {
            status: 500,
            request_uri: "/wp-content/cache/minify/c7035.js".into(),
            ext: Some("js".into()),
        };
        let recovery = recover_failed_request(
            &response,
            "/wp-content/cache/minify/",
            &[source("a.js", "x()"), source("b.js", "y()")],
            None,
            &Thresholds::default(),
            &mut db,
        );
        assert_eq!(
            recovery,
            Recovery::Replaced {
                status: 200,
                content_type: JS_CONTENT_TYPE.into(),
                body: "x()\n;y()".into(),
            }
        );
        assert!(db.notices.is_empty());
    }

    #[test]
    fn test_unrecoverable_failure_notices_once() {
        let mut db = Database::default();
        let response = MinifyResponse {
            status: 500,
            request_uri: "/wp-content/cache/minify/c7035.css?x=1".into(),
            ext: None,
        };
        for _ in 0..2 {
            let recovery = recover_failed_request(
                &response,
                "/wp-content/cache/minify/",
                &[],
                None,
                &Thresholds::default(),
                &mut db,
            );
            assert_eq!(recovery, Recovery::Unchanged);
        }
        assert_eq!(
            db.notices,
            vec!["W3TC Minify Helper: HTTP request for minified file \"c7035.css\" failed."]
        );
    }

    #[test]
    fn test_success_is_unchanged() {
        let mut db = Database::default();
        let response = MinifyResponse {
            status: 200,
            request_uri: "/wp-content/cache/minify/c7035.js".into(),
            ext: Some("js".into()),
        };
        assert_eq!(
            recover_failed_request(&response, "/", &[], None, &Thresholds::default(), &mut db),
            Recovery::Unchanged
        );
    }
}
