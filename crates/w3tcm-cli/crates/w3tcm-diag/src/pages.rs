use anyhow::Result;
use serde_json::Value;
use std::collections::HashMap;
use w3tcm_monitor::{Database, TemplateKey};

/// Query parameter that must match the configured diagnostics token.
pub const NONCE_PARAM: &str = "_wpnonce";

pub const PAGE_NAMES: [&str; 7] = [
    "theme-map",
    "log",
    "misc",
    "diff",
    "database",
    "minify-map",
    "notices",
];

/// One read-only dump page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Page {
    ThemeMap,
    Log,
    /// A single notice's notes, or all of them.
    Misc { key: Option<String> },
    Diff { theme: String, basename: String },
    Database,
    MinifyMap,
    Notices,
}

impl Page {
    pub fn parse(name: &str, query: &HashMap<String, String>) -> Option<Self> {
        let page = match name {
            "theme-map" => Page::ThemeMap,
            "log" => Page::Log,
            "misc" => Page::Misc {
                key: query.get("key").cloned(),
            },
            "diff" => Page::Diff {
                theme: query.get("theme")?.clone(),
                basename: query.get("basename")?.clone(),
            },
            "database" => Page::Database,
            "minify-map" => Page::MinifyMap,
            "notices" => Page::Notices,
            _ => return None,
        };
        Some(page)
    }

    pub fn title(&self) -> String {
        match self {
            Page::ThemeMap => "Theme Map".into(),
            Page::Log => "Log".into(),
            Page::Misc { key: Some(key) } => format!("Misc: {key}"),
            Page::Misc { key: None } => "Misc".into(),
            Page::Diff { theme, basename } => format!("Diff: {theme}.{basename}"),
            Page::Database => "Database".into(),
            Page::MinifyMap => "Minify Map".into(),
            Page::Notices => "Notices".into(),
        }
    }

    /// The part of the database this page shows.
    pub fn projection(&self, db: &Database) -> Result<Value> {
        let value = match self {
            Page::ThemeMap => serde_json::to_value(&db.theme_map)?,
            Page::Log => serde_json::to_value(&db.log)?,
            Page::Misc { key: Some(key) } => serde_json::to_value(db.misc(key))?,
            Page::Misc { key: None } => serde_json::to_value(&db.misc)?,
            Page::Diff { theme, basename } => {
                let key = TemplateKey::new(theme.as_str(), basename.as_str());
                serde_json::to_value(db.latest_diff(&key))?
            }
            Page::Database => serde_json::to_value(&db.data)?,
            Page::MinifyMap => serde_json::to_value(&db.minify_map)?,
            Page::Notices => serde_json::to_value(&db.notices)?,
        };
        Ok(value)
    }

    pub fn render(&self, db: &Database) -> Result<String> {
        let json = serde_json::to_string_pretty(&self.projection(db)?)?;
        Ok(format!(
            "<!DOCTYPE html><html><head><title>{title}</title></head><body>\n<h1>{title}</h1>\n<pre>{json}</pre>\n</body></html>",
            title = escape_html(&self.title()),
            json = escape_html(&json)
        ))
    }
}

/// With a configured token every request must carry it.
pub fn authorized(token: Option<&str>, query: &HashMap<String, String>) -> bool {
    match token {
        None => true,
        Some(token) => query.get(NONCE_PARAM).is_some_and(|nonce| nonce == token),
    }
}

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
