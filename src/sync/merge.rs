use crate::sync::markdown::ArchiveDocument;
use crate::sync::model::{ArchivedMessage, MessageId, Reaction};
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeOutcome {
    pub appended: usize,
    pub updated: usize,
    /// Highest id seen in the incoming batch, whether new or not.
    pub newest_id: Option<MessageId>,
    pub total: usize,
}

impl MergeOutcome {
    pub fn changed(&self) -> bool {
        self.appended > 0 || self.updated > 0
    }
}

/// Reactions follow the latest fetch. Emojis keep the position they were
/// first seen at; new ones go to the end; ones missing from the fetch drop.
fn refresh_reactions(existing: &[Reaction], latest: &[Reaction]) -> Vec<Reaction> {
    let mut out: Vec<Reaction> = existing
        .iter()
        .filter_map(|old| latest.iter().find(|r| r.emoji == old.emoji).cloned())
        .collect();
    for reaction in latest {
        if !out.iter().any(|r| r.emoji == reaction.emoji) {
            out.push(reaction.clone());
        }
    }
    out
}

/// Merge normalized records into `doc` with at-most-once semantics.
///
/// Known ids only have their reactions refreshed; body, author, reply and
/// attachments of an archived message never change. New records are placed
/// by `(timestamp, id)`. Merging the same batch twice is a no-op the second
/// time.
pub fn merge_into(doc: &mut ArchiveDocument, incoming: Vec<ArchivedMessage>) -> MergeOutcome {
    let mut outcome = MergeOutcome {
        newest_id: incoming.iter().map(|m| m.id).max(),
        ..MergeOutcome::default()
    };
    let mut index: HashMap<MessageId, usize> = doc
        .messages
        .iter()
        .enumerate()
        .map(|(idx, m)| (m.id, idx))
        .collect();
    let mut touched = vec![false; doc.messages.len()];

    for record in incoming {
        if let Some(&idx) = index.get(&record.id) {
            let current = &mut doc.messages[idx];
            let refreshed = refresh_reactions(&current.reactions, &record.reactions);
            if refreshed != current.reactions {
                current.reactions = refreshed;
                if idx < touched.len() && !touched[idx] {
                    touched[idx] = true;
                    outcome.updated += 1;
                }
            }
            continue;
        }
        index.insert(record.id, doc.messages.len());
        doc.messages.push(record);
        outcome.appended += 1;
    }

    if outcome.appended > 0 {
        doc.messages.sort_by_key(ArchivedMessage::sort_key);
    }
    outcome.total = doc.messages.len();
    outcome
}
