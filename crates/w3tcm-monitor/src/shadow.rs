use std::collections::BTreeMap;

use log::warn;

use crate::types::{Diagnostic, DiagnosticCode};

/// Mirror of the host's private "files to minify" list.
///
/// Index `n + extras` corresponds to the host's script number `n`, where
/// `extras` counts the slots inserted for conditional pre/post wrappers.
/// Skipped, async and deferred scripts hold `None` so the numbering stays
/// aligned.
#[derive(Debug, Default, Clone)]
pub struct ShadowFileList {
    entries: Vec<Option<String>>,
    extras: BTreeMap<usize, usize>,
}

impl ShadowFileList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn extras(&self) -> usize {
        self.extras.values().sum()
    }

    /// Verify `len - extras == script_tag_number`.
    pub fn check(&self, script_tag_number: usize) -> Option<Diagnostic> {
        let extras = self.extras();
        let expected = self.entries.len().checked_sub(extras);
        if expected == Some(script_tag_number) {
            return None;
        }
        let message = format!(
            "shadow file list is out of sync: script_tag_number={script_tag_number}, len={}, extras={extras}",
            self.entries.len()
        );
        warn!("{message}");
        Some(Diagnostic::new(DiagnosticCode::Desync, message))
    }

    /// Slot index for the host's script number.
    pub fn slot(&self, script_tag_number: usize) -> usize {
        script_tag_number + self.extras()
    }

    /// Store `file` at `index`, growing the list with `None` if needed.
    pub fn set_at(&mut self, index: usize, file: Option<String>) {
        if index >= self.entries.len() {
            self.entries.resize(index + 1, None);
        }
        self.entries[index] = file;
    }

    pub fn push(&mut self, file: Option<String>) {
        self.entries.push(file);
    }

    /// Record that `count` extra slots were inserted for `script_tag_number`.
    pub fn add_extras(&mut self, script_tag_number: usize, count: usize) {
        self.extras.insert(script_tag_number, count);
    }

    /// Hand the collected files to the host.
    ///
    /// Returns the non-empty entries in order and blanks every slot. The
    /// length is kept so later script numbers still line up.
    pub fn take_batch(&mut self) -> Vec<String> {
        self.entries.iter_mut().filter_map(Option::take).collect()
    }

    /// `true` if every file the host reports is present in the mirror.
    pub fn contains_all(&self, host_files: &[String]) -> bool {
        host_files
            .iter()
            .all(|f| self.entries.iter().flatten().any(|e| e == f))
    }

    pub fn entries(&self) -> &[Option<String>] {
        &self.entries
    }
}
