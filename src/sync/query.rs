//! Read-side filtering of an archived conversation.

use crate::sync::model::ArchivedMessage;
use chrono::NaiveDate;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveQuery {
    /// Case-insensitive text matched against body, author name and
    /// attachment names.
    pub search: Option<String>,
    /// Inclusive first day (UTC).
    pub from: Option<NaiveDate>,
    /// Inclusive last day (UTC).
    pub to: Option<NaiveDate>,
    /// Keep only the newest `last` matches.
    pub last: Option<usize>,
}

impl ArchiveQuery {
    fn matches(&self, msg: &ArchivedMessage, needle: Option<&str>) -> bool {
        let date = msg.date();
        if self.from.is_some_and(|from| date < from) || self.to.is_some_and(|to| date > to) {
            return false;
        }
        let Some(needle) = needle else {
            return true;
        };
        msg.body.to_lowercase().contains(needle)
            || msg.author.name.to_lowercase().contains(needle)
            || msg
                .attachments
                .iter()
                .any(|a| a.name.to_lowercase().contains(needle))
    }

    /// Matching messages in archive order.
    pub fn apply<'a>(&self, messages: &'a [ArchivedMessage]) -> Vec<&'a ArchivedMessage> {
        let needle = self
            .search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_lowercase);
        let mut out: Vec<&ArchivedMessage> = messages
            .iter()
            .filter(|m| self.matches(m, needle.as_deref()))
            .collect();
        if let Some(last) = self.last {
            let excess = out.len().saturating_sub(last);
            out.drain(..excess);
        }
        out
    }
}
