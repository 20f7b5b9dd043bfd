//! Markdown archive codec.
//!
//! An archive file is a small header followed by one `## YYYY-MM-DD` section
//! per calendar day (UTC). Each message is a block:
//!
//! ```text
//! ### 09:15:02 - @alice (111) [#1001]
//! ↳ replying to @bob [#998]
//! body line one
//! body line two
//! 📎 diagram.png (20480 bytes) https://cdn.example/diagram.png
//! Reactions: 👍 3 | 🎉 1
//!
//! ```
//!
//! Body lines that would be mistaken for structure are prefixed with `\`.
//! Rendering a parsed file reproduces it byte for byte. Lines the parser
//! cannot read back (hand edits, damaged blocks) are carried verbatim as
//! [`PreservedSpan`]s and written back next to the message they followed.

use crate::sync::model::{
    ArchivedMessage, Attachment, Author, ConversationKey, MessageId, Platform, Reaction, ReplyRef,
};
use chrono::{NaiveDate, NaiveTime, TimeZone, Utc};
use std::borrow::Cow;
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::ops::Range;

const DATE_PREFIX: &str = "## ";
const MESSAGE_PREFIX: &str = "### ";
const REPLY_PREFIX: &str = "↳ replying to ";
const ATTACHMENT_PREFIX: &str = "📎 ";
const REACTIONS_PREFIX: &str = "Reactions: ";
const HEADER_RULE: &str = "---";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveHeader {
    pub title: String,
    pub conversation: ConversationKey,
    pub platform: Platform,
    pub scope: Option<String>,
}

/// Where an unreadable span sat relative to the readable content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpanAnchor {
    /// Between the header and the first date section.
    Preamble,
    /// Top of a date section, before its first readable message.
    SectionStart(NaiveDate),
    /// Directly after a readable message.
    After(MessageId),
    /// Under a date line that does not parse. Written after everything else.
    Trailing,
}

/// Archive lines that did not parse, kept so a rewrite never drops them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreservedSpan {
    pub anchor: SpanAnchor,
    /// Original lines, trailing blank lines removed.
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveDocument {
    pub header: ArchiveHeader,
    /// Sorted by `(timestamp, id)`, ids unique.
    pub messages: Vec<ArchivedMessage>,
    pub preserved: Vec<PreservedSpan>,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedArchive {
    pub header: Option<ArchiveHeader>,
    pub messages: Vec<ArchivedMessage>,
    pub preserved: Vec<PreservedSpan>,
    /// Blocks and stray lines that could not be read back.
    pub skipped: usize,
}

impl ArchiveDocument {
    pub fn new(header: ArchiveHeader) -> Self {
        Self {
            header,
            messages: Vec::new(),
            preserved: Vec::new(),
        }
    }

    pub fn max_id(&self) -> Option<MessageId> {
        self.messages.iter().map(|m| m.id).max()
    }

    pub fn min_id(&self) -> Option<MessageId> {
        self.messages.iter().map(|m| m.id).min()
    }
}

fn escape_body_line(line: &str) -> String {
    let needs_escape = line.starts_with('#')
        || line.starts_with('\\')
        || line.starts_with('↳')
        || line.starts_with('📎')
        || line.starts_with("Reactions:")
        || line == HEADER_RULE;
    if needs_escape {
        format!("\\{line}")
    } else {
        line.to_string()
    }
}

fn unescape_body_line(line: &str) -> &str {
    line.strip_prefix('\\').unwrap_or(line)
}

fn render_message(out: &mut String, msg: &ArchivedMessage) {
    let _ = writeln!(
        out,
        "{MESSAGE_PREFIX}{} - @{} ({}) [#{}]",
        msg.timestamp.format("%H:%M:%S"),
        msg.author.name,
        msg.author.id,
        msg.id
    );
    if let Some(reply) = &msg.reply_to {
        match &reply.author {
            Some(author) => {
                let _ = writeln!(out, "{REPLY_PREFIX}@{author} [#{}]", reply.message_id);
            }
            None => {
                let _ = writeln!(out, "{REPLY_PREFIX}[#{}]", reply.message_id);
            }
        }
    }
    if !msg.body.is_empty() {
        for line in msg.body.split('\n') {
            out.push_str(&escape_body_line(line));
            out.push('\n');
        }
    }
    for attachment in &msg.attachments {
        let _ = write!(
            out,
            "{ATTACHMENT_PREFIX}{} ({} bytes)",
            attachment.name, attachment.size
        );
        if !attachment.url.is_empty() {
            let _ = write!(out, " {}", attachment.url);
        }
        out.push('\n');
    }
    if !msg.reactions.is_empty() {
        let joined = msg
            .reactions
            .iter()
            .map(|r| format!("{} {}", r.emoji, r.count))
            .collect::<Vec<_>>()
            .join(" | ");
        let _ = writeln!(out, "{REACTIONS_PREFIX}{joined}");
    }
    out.push('\n');
}

pub fn render_header(header: &ArchiveHeader) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# {}", header.title);
    out.push('\n');
    let _ = writeln!(out, "Conversation: {}", header.conversation);
    let _ = writeln!(out, "Platform: {}", header.platform);
    if let Some(scope) = &header.scope {
        let _ = writeln!(out, "Scope: {scope}");
    }
    let _ = writeln!(out, "{HEADER_RULE}");
    out
}

fn write_date_line(out: &mut String, date: NaiveDate) {
    let _ = write!(out, "\n{DATE_PREFIX}{}\n\n", date.format("%Y-%m-%d"));
}

/// Write every span not written yet whose anchor satisfies `pick`.
fn write_spans(
    out: &mut String,
    spans: &[PreservedSpan],
    written: &mut [bool],
    pick: impl Fn(&SpanAnchor) -> bool,
) {
    for (span, done) in spans.iter().zip(written.iter_mut()) {
        if *done || !pick(&span.anchor) {
            continue;
        }
        *done = true;
        out.push_str(&span.text);
        out.push_str("\n\n");
    }
}

/// Date sections that only hold preserved spans, in date order.
fn write_span_sections(
    out: &mut String,
    spans: &[PreservedSpan],
    written: &mut [bool],
    pick: impl Fn(NaiveDate) -> bool,
) {
    let dates: BTreeSet<NaiveDate> = spans
        .iter()
        .zip(written.iter())
        .filter_map(|(span, done)| match span.anchor {
            SpanAnchor::SectionStart(date) if !*done && pick(date) => Some(date),
            _ => None,
        })
        .collect();
    for date in dates {
        write_date_line(out, date);
        write_spans(out, spans, written, |a| *a == SpanAnchor::SectionStart(date));
    }
}

/// Render a document. Messages must already be sorted and normalized.
pub fn render(doc: &ArchiveDocument) -> String {
    let spans = doc.preserved.as_slice();
    let mut written = vec![false; spans.len()];
    let mut out = render_header(&doc.header);

    for (span, done) in spans.iter().zip(written.iter_mut()) {
        if span.anchor == SpanAnchor::Preamble {
            *done = true;
            let _ = write!(out, "\n{}\n", span.text);
        }
    }

    let mut current_date: Option<NaiveDate> = None;
    for msg in &doc.messages {
        let date = msg.date();
        if current_date != Some(date) {
            write_span_sections(&mut out, spans, &mut written, |d| d < date);
            write_date_line(&mut out, date);
            write_spans(&mut out, spans, &mut written, |a| *a == SpanAnchor::SectionStart(date));
            current_date = Some(date);
        }
        render_message(&mut out, msg);
        write_spans(&mut out, spans, &mut written, |a| *a == SpanAnchor::After(msg.id));
    }
    write_span_sections(&mut out, spans, &mut written, |_| true);
    if written.iter().any(|done| !done) && !out.ends_with("\n\n") {
        out.push('\n');
    }
    write_spans(&mut out, spans, &mut written, |_| true);
    out
}

fn parse_header(lines: &[&str]) -> (Option<ArchiveHeader>, usize) {
    let Some(title) = lines.first().and_then(|l| l.strip_prefix("# ")) else {
        return (None, 0);
    };
    let mut conversation = None;
    let mut platform = None;
    let mut scope = None;
    for (idx, line) in lines.iter().enumerate().skip(1) {
        if *line == HEADER_RULE {
            let header = match (conversation, platform) {
                (Some(conversation), Some(platform)) => Some(ArchiveHeader {
                    title: title.to_string(),
                    conversation,
                    platform,
                    scope,
                }),
                _ => None,
            };
            return (header, idx + 1);
        }
        if line.starts_with(DATE_PREFIX) || line.starts_with(MESSAGE_PREFIX) {
            return (None, idx);
        }
        if let Some(value) = line.strip_prefix("Conversation: ") {
            conversation = ConversationKey::parse(value.trim()).ok();
        } else if let Some(value) = line.strip_prefix("Platform: ") {
            platform = value.trim().parse::<Platform>().ok();
        } else if let Some(value) = line.strip_prefix("Scope: ") {
            scope = Some(value.trim().to_string());
        }
    }
    (None, lines.len())
}

struct Heading {
    time: NaiveTime,
    author: Author,
    id: MessageId,
}

fn parse_heading(line: &str) -> Option<Heading> {
    let rest = line.strip_prefix(MESSAGE_PREFIX)?;
    let rest = rest.strip_suffix(']')?;
    let (rest, id) = rest.rsplit_once(" [#")?;
    let id = id.parse::<MessageId>().ok()?;
    let rest = rest.strip_suffix(')')?;
    let (rest, author_id) = rest.rsplit_once(" (")?;
    let (time, name) = rest.split_once(" - @")?;
    let time = NaiveTime::parse_from_str(time, "%H:%M:%S").ok()?;
    Some(Heading {
        time,
        author: Author {
            id: author_id.to_string(),
            name: name.to_string(),
        },
        id,
    })
}

fn parse_reply(line: &str) -> Option<ReplyRef> {
    let rest = line.strip_prefix(REPLY_PREFIX)?.strip_suffix(']')?;
    if let Some(id) = rest.strip_prefix("[#") {
        return Some(ReplyRef {
            message_id: id.parse().ok()?,
            author: None,
        });
    }
    let (author, id) = rest.rsplit_once(" [#")?;
    let author = author.strip_prefix('@')?;
    Some(ReplyRef {
        message_id: id.parse().ok()?,
        author: Some(author.to_string()),
    })
}

fn parse_attachment(line: &str) -> Option<Attachment> {
    let rest = line.strip_prefix(ATTACHMENT_PREFIX)?;
    let (head, url) = match rest.rsplit_once(" bytes) ") {
        Some((head, url)) if !url.contains(' ') => (head, url),
        _ => (rest.strip_suffix(" bytes)")?, ""),
    };
    let (name, size) = head.rsplit_once(" (")?;
    Some(Attachment {
        name: name.to_string(),
        size: size.parse().ok()?,
        url: url.to_string(),
    })
}

fn parse_reactions(line: &str) -> Option<Vec<Reaction>> {
    let rest = line.strip_prefix(REACTIONS_PREFIX)?;
    rest.split(" | ")
        .map(|item| {
            let (emoji, count) = item.rsplit_once(' ')?;
            Some(Reaction {
                emoji: emoji.to_string(),
                count: count.parse().ok()?,
            })
        })
        .collect()
}

fn parse_block(date: NaiveDate, lines: &[&str]) -> Option<ArchivedMessage> {
    let (first, rest) = lines.split_first()?;
    let heading = parse_heading(first)?;

    let mut end = rest.len();
    while end > 0 && rest[end - 1].is_empty() {
        end -= 1;
    }
    let mut rest = &rest[..end];

    let mut reply_to = None;
    if let Some((line, tail)) = rest.split_first() {
        if line.starts_with(REPLY_PREFIX) {
            reply_to = Some(parse_reply(line)?);
            rest = tail;
        }
    }

    let mut reactions = Vec::new();
    if let Some((line, init)) = rest.split_last() {
        if line.starts_with(REACTIONS_PREFIX) {
            reactions = parse_reactions(line)?;
            rest = init;
        }
    }

    let mut attachment_start = rest.len();
    while attachment_start > 0 && rest[attachment_start - 1].starts_with(ATTACHMENT_PREFIX) {
        attachment_start -= 1;
    }
    let attachments = rest[attachment_start..]
        .iter()
        .map(|line| parse_attachment(line))
        .collect::<Option<Vec<_>>>()?;
    let body = rest[..attachment_start]
        .iter()
        .map(|line| unescape_body_line(line))
        .collect::<Vec<_>>()
        .join("\n");

    Some(ArchivedMessage {
        id: heading.id,
        author: heading.author,
        timestamp: Utc.from_utc_datetime(&date.and_time(heading.time)),
        body,
        reply_to,
        attachments,
        reactions,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Preamble,
    Dated(NaiveDate),
    Undated,
}

/// Unreadable lines collected until the next readable message or date line.
struct PendingSpan {
    anchor: SpanAnchor,
    lines: Vec<String>,
}

#[derive(Default)]
struct SpanCollector {
    pending: Option<PendingSpan>,
    done: Vec<PreservedSpan>,
}

impl SpanCollector {
    fn keep(&mut self, anchor: SpanAnchor, lines: &[&str]) {
        match &mut self.pending {
            Some(pending) if pending.anchor == anchor => {
                pending.lines.extend(lines.iter().map(|l| l.to_string()));
            }
            _ => {
                self.flush();
                self.pending = Some(PendingSpan {
                    anchor,
                    lines: lines.iter().map(|l| l.to_string()).collect(),
                });
            }
        }
    }

    /// Blank lines only count when they sit inside kept text.
    fn blank(&mut self) {
        if let Some(pending) = &mut self.pending {
            pending.lines.push(String::new());
        }
    }

    fn flush(&mut self) {
        let Some(mut pending) = self.pending.take() else {
            return;
        };
        while pending.lines.last().is_some_and(|l| l.is_empty()) {
            pending.lines.pop();
        }
        if pending.lines.is_empty() {
            return;
        }
        self.done.push(PreservedSpan {
            anchor: pending.anchor,
            text: pending.lines.join("\n"),
        });
    }
}

fn anchor_for(section: Section, last: Option<MessageId>) -> SpanAnchor {
    match (section, last) {
        (Section::Dated(_), Some(id)) => SpanAnchor::After(id),
        (Section::Dated(date), None) => SpanAnchor::SectionStart(date),
        (Section::Preamble, _) => SpanAnchor::Preamble,
        (Section::Undated, _) => SpanAnchor::Trailing,
    }
}

fn parse_lines(lines: &[&str], invalid: &[bool]) -> ParsedArchive {
    let is_invalid = |range: Range<usize>| range.into_iter().any(|i| invalid.get(i) == Some(&true));
    let (header, start) = parse_header(lines);

    let mut parsed = ParsedArchive {
        header,
        ..ParsedArchive::default()
    };
    let mut spans = SpanCollector::default();
    if parsed.header.is_none() && start > 0 {
        parsed.skipped += 1;
        spans.keep(SpanAnchor::Preamble, &lines[..start]);
    }

    let mut seen = BTreeSet::new();
    let mut section = Section::Preamble;
    let mut last: Option<MessageId> = None;
    let mut idx = start;

    while idx < lines.len() {
        let line = lines[idx];
        if let Some(date) = line.strip_prefix(DATE_PREFIX) {
            spans.flush();
            last = None;
            match NaiveDate::parse_from_str(date.trim(), "%Y-%m-%d") {
                Ok(date) if !is_invalid(idx..idx + 1) => section = Section::Dated(date),
                _ => {
                    section = Section::Undated;
                    parsed.skipped += 1;
                    spans.keep(SpanAnchor::Trailing, &[line]);
                }
            }
            idx += 1;
            continue;
        }
        if !line.starts_with(MESSAGE_PREFIX) {
            if line.is_empty() {
                spans.blank();
            } else {
                parsed.skipped += 1;
                spans.keep(anchor_for(section, last), &[line]);
            }
            idx += 1;
            continue;
        }

        let mut end = idx + 1;
        while end < lines.len()
            && !lines[end].starts_with(MESSAGE_PREFIX)
            && !lines[end].starts_with(DATE_PREFIX)
        {
            end += 1;
        }
        let block = match section {
            Section::Dated(date) if !is_invalid(idx..end) => parse_block(date, &lines[idx..end]),
            _ => None,
        };
        match block {
            Some(msg) if seen.insert(msg.id) => {
                spans.flush();
                last = Some(msg.id);
                parsed.messages.push(msg);
            }
            Some(_) => {}
            None => {
                parsed.skipped += 1;
                spans.keep(anchor_for(section, last), &lines[idx..end]);
            }
        }
        idx = end;
    }
    spans.flush();

    parsed.preserved = spans.done;
    parsed.messages.sort_by_key(ArchivedMessage::sort_key);
    parsed
}

/// Parse an archive. Blocks that cannot be read are kept as preserved
/// spans. Duplicate ids keep their first occurrence.
pub fn parse(raw: &str) -> ParsedArchive {
    let lines: Vec<&str> = raw.split('\n').collect();
    parse_lines(&lines, &[])
}

/// Parse raw archive bytes. A block holding bytes that are not UTF-8 is kept
/// as a preserved span, decoded lossily; the rest of the file parses as
/// usual.
pub fn parse_bytes(raw: &[u8]) -> ParsedArchive {
    let decoded: Vec<(Cow<'_, str>, bool)> = raw
        .split(|byte| *byte == b'\n')
        .map(|line| match std::str::from_utf8(line) {
            Ok(text) => (Cow::Borrowed(text), false),
            Err(_) => (String::from_utf8_lossy(line), true),
        })
        .collect();
    let lines: Vec<&str> = decoded.iter().map(|(line, _)| line.as_ref()).collect();
    let invalid: Vec<bool> = decoded.iter().map(|(_, bad)| *bad).collect();
    parse_lines(&lines, &invalid)
}
