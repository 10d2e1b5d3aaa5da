use std::collections::BTreeMap;

use crate::store::Database;
use crate::types::TemplateKey;

/// Queue holding order-risk warnings for the current template.
pub const TEMPLATE_WARNINGS: &str = "TEMPLATE-WARNINGS";

/// Prefix of every operator-visible notice.
pub const NOTICE_PREFIX: &str = "W3TC Minify Helper";

/// Per-request warnings that only become durable notices once the change
/// they describe is actually written.
#[derive(Debug, Default)]
pub struct NoticeQueue {
    queues: BTreeMap<String, Vec<String>>,
}

impl NoticeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, queue: &str, notice: impl Into<String>) {
        self.queues
            .entry(queue.to_string())
            .or_default()
            .push(notice.into());
    }

    /// Promote every notice in `queue` to `db` and empty the queue.
    /// Returns the number of notices promoted.
    pub fn flush(&mut self, queue: &str, db: &mut Database) -> usize {
        let notices = self.queues.remove(queue).unwrap_or_default();
        let count = notices.len();
        for notice in notices {
            db.add_notice(notice, false);
        }
        count
    }

    pub fn empty(&mut self, queue: &str) {
        self.queues.remove(queue);
    }

    pub fn pending(&self, queue: &str) -> &[String] {
        self.queues.get(queue).map(Vec::as_slice).unwrap_or_default()
    }
}

/// Marker embedded in a notice that identifies it for operator actions.
pub fn notice_id_marker(id: &str) -> String {
    format!("[notice:{id}]")
}

/// Marker embedded in a notice that ties it to one template.
pub fn template_marker(key: &TemplateKey) -> String {
    format!("[template:{key}]")
}

/// Remove the notice carrying `id` and every other notice for the same
/// template. Returns how many notices were removed.
pub fn remove_template_notices(db: &mut Database, id: &str) -> usize {
    let id_marker = notice_id_marker(id);
    let Some(index) = db.notices.iter().position(|n| n.contains(&id_marker)) else {
        return 0;
    };
    let notice = db.notices.remove(index);
    let mut removed = 1;
    if let Some(template) = extract_template_marker(&notice) {
        let before = db.notices.len();
        db.notices.retain(|n| !n.contains(template));
        removed += before - db.notices.len();
    } else {
        log::error!("notice {id} has no template marker");
    }
    removed
}

fn extract_template_marker(notice: &str) -> Option<&str> {
    let start = notice.find("[template:")?;
    let end = notice[start..].find(']')?;
    Some(&notice[start..start + end + 1])
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_flush_promotes_and_empties() {
        let mut queue = NoticeQueue::new();
        let mut db = Database::default();
        queue.add(TEMPLATE_WARNINGS, "first");
        queue.add(TEMPLATE_WARNINGS, "second");
        assert_eq!(queue.flush(TEMPLATE_WARNINGS, &mut db), 2);
        assert_eq!(db.notices, vec!["first", "second"]);
        assert!(queue.pending(TEMPLATE_WARNINGS).is_empty());
        assert_eq!(queue.flush(TEMPLATE_WARNINGS, &mut db), 0);
    }

    #[test]
    fn test_empty_discards() {
        let mut queue = NoticeQueue::new();
        let mut db = Database::default();
        queue.add(TEMPLATE_WARNINGS, "noise");
        queue.empty(TEMPLATE_WARNINGS);
        queue.flush(TEMPLATE_WARNINGS, &mut db);
        assert!(db.notices.is_empty());
    }

    #[test]
    fn test_remove_template_notices() {
        let key = TemplateKey::new("abcde", "single");
        let other = TemplateKey::new("abcde", "page");
        let mut db = Database::default();
        db.add_notice(
            format!("a {} {}", template_marker(&key), notice_id_marker("n1")),
            false,
        );
        db.add_notice(
            format!("b {} {}", template_marker(&other), notice_id_marker("n2")),
            false,
        );
        db.add_notice(
            format!("c {} {}", template_marker(&key), notice_id_marker("n3")),
            false,
        );
        db.add_notice("unrelated", false);

        assert_eq!(remove_template_notices(&mut db, "n1"), 2);
        assert_eq!(db.notices.len(), 2);
        assert!(db.notices[0].starts_with("b "));
        assert_eq!(remove_template_notices(&mut db, "missing"), 0);
    }
}
