// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::collections::HashSet;
use std::fmt;

use async_imap::types::Fetch;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single address from an envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Address {
    pub name: Option<String>,
    pub mailbox: Option<String>,
    pub host: Option<String>,
}

impl Address {
    /// `mailbox@host`, empty parts left blank.
    pub fn email(&self) -> String {
        format!(
            "{}@{}",
            self.mailbox.as_deref().unwrap_or(""),
            self.host.as_deref().unwrap_or("")
        )
    }
}

/// Envelope-level metadata for one message, as fetched with
/// `(FLAGS ENVELOPE INTERNALDATE)`.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageMeta {
    pub uid: u32,
    pub message_id: Option<String>,
    pub subject: Option<String>,
    pub from: Vec<Address>,
    pub to: Vec<Address>,
    pub cc: Vec<Address>,
    pub in_reply_to: Option<String>,
    /// Date header of the message.
    pub sent_at: Option<DateTime<Utc>>,
    /// Server INTERNALDATE.
    pub internal_date: Option<DateTime<Utc>>,
    pub flags: Vec<String>,
}

impl MessageMeta {
    pub fn is_read(&self) -> bool {
        self.flags.iter().any(|f| f == "Seen")
    }

    pub fn is_starred(&self) -> bool {
        self.flags.iter().any(|f| f == "Flagged")
    }
}

/// A mailbox as reported by LIST.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FolderInfo {
    pub name: String,
    pub selectable: bool,
}

/// One node of the server-computed THREAD forest.
#[derive(Debug, Clone, PartialEq)]
pub struct ThreadNode {
    pub uid: u32,
    pub children: Vec<ThreadNode>,
}

impl ThreadNode {
    pub fn leaf(uid: u32) -> Self {
        Self {
            uid,
            children: Vec::new(),
        }
    }

    /// All UIDs in this subtree, root first.
    pub fn descendants(&self) -> Vec<u32> {
        let mut out = vec![self.uid];
        for child in &self.children {
            out.extend(child.descendants());
        }
        out
    }
}

/// What an IDLE cycle observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleOutcome {
    /// The mailbox grew (`* N EXISTS`).
    NewMessages,
    /// Heartbeat interval elapsed, or an update we do not translate.
    Timeout,
}

/// Flag mutation direction for UID STORE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagOperation {
    Add,
    Remove,
}

/// Structured IMAP search criteria.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum SearchCriteria {
    All,
    From(String),
    To(String),
    Subject(String),
    Text(String),
    Since(DateTime<Utc>),
    Before(DateTime<Utc>),
    And(Vec<SearchCriteria>),
}

impl SearchCriteria {
    /// Escapes text for IMAP search queries.
    fn escape_search_text(text: &str) -> String {
        text.replace('\\', "\\\\").replace('"', "\\\"")
    }

    /// Render for `UID SEARCH`. A top-level `And` is space-joined without
    /// parentheses; nested groups keep them.
    pub fn to_imap_string(&self) -> String {
        match self {
            SearchCriteria::And(criteria) if !criteria.is_empty() => criteria
                .iter()
                .map(|c| c.to_string())
                .collect::<Vec<_>>()
                .join(" "),
            SearchCriteria::And(_) => "ALL".to_string(),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for SearchCriteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchCriteria::All => write!(f, "ALL"),
            SearchCriteria::From(text) => {
                write!(f, "FROM \"{}\"", Self::escape_search_text(text))
            }
            SearchCriteria::To(text) => write!(f, "TO \"{}\"", Self::escape_search_text(text)),
            SearchCriteria::Subject(text) => {
                write!(f, "SUBJECT \"{}\"", Self::escape_search_text(text))
            }
            SearchCriteria::Text(text) => {
                write!(f, "TEXT \"{}\"", Self::escape_search_text(text))
            }
            SearchCriteria::Since(date) => write!(f, "SINCE {}", date.format("%d-%b-%Y")),
            SearchCriteria::Before(date) => write!(f, "BEFORE {}", date.format("%d-%b-%Y")),
            SearchCriteria::And(criteria) => write!(
                f,
                "({})",
                criteria
                    .iter()
                    .map(|c| c.to_string())
                    .collect::<Vec<_>>()
                    .join(" ")
            ),
        }
    }
}

/// Decode MIME RFC 2047 encoded header text (e.g. `=?UTF-8?q?Subject?=`).
pub(crate) fn decode_mime_encoded_text(bytes: &[u8]) -> String {
    let raw = String::from_utf8_lossy(bytes);

    if raw.contains("=?") && raw.contains("?=") {
        // Parse as a minimal header to let mail-parser decode encoded words.
        if let Some(message) =
            mail_parser::Message::parse(format!("Subject: {}\r\n\r\n", raw).as_bytes())
        {
            if let Some(subject) = message.subject() {
                return subject.to_string();
            }
        }
    }

    raw.to_string()
}

fn convert_address(addr: &async_imap::imap_proto::Address) -> Address {
    Address {
        name: addr.name.as_ref().map(|s| decode_mime_encoded_text(s)),
        mailbox: addr.mailbox.as_ref().map(|s| decode_mime_encoded_text(s)),
        host: addr.host.as_ref().map(|s| decode_mime_encoded_text(s)),
    }
}

fn parse_envelope_date(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            DateTime::parse_from_rfc3339(raw)
                .map(|dt| dt.with_timezone(&Utc))
                .ok()
        })
}

impl MessageMeta {
    pub fn from_fetch(fetch: &Fetch) -> Option<Self> {
        let uid = fetch.uid?;
        let flags: Vec<String> = fetch.flags().map(|f| format!("{:?}", f)).collect();
        let internal_date = fetch.internal_date().map(|d| d.with_timezone(&Utc));

        let envelope = fetch.envelope();
        let empty = Vec::new();

        let (message_id, subject, from, to, cc, in_reply_to, sent_at) = match envelope {
            Some(env) => (
                env.message_id.as_ref().map(|s| decode_mime_encoded_text(s)),
                env.subject.as_ref().map(|s| decode_mime_encoded_text(s)),
                env.from
                    .as_ref()
                    .unwrap_or(&empty)
                    .iter()
                    .map(convert_address)
                    .collect(),
                env.to
                    .as_ref()
                    .unwrap_or(&empty)
                    .iter()
                    .map(convert_address)
                    .collect(),
                env.cc
                    .as_ref()
                    .unwrap_or(&empty)
                    .iter()
                    .map(convert_address)
                    .collect(),
                env.in_reply_to.as_ref().map(|s| decode_mime_encoded_text(s)),
                env.date
                    .as_ref()
                    .and_then(|d| parse_envelope_date(&String::from_utf8_lossy(d))),
            ),
            None => (None, None, Vec::new(), Vec::new(), Vec::new(), None, None),
        };

        Some(Self {
            uid,
            message_id,
            subject,
            from,
            to,
            cc,
            in_reply_to,
            sent_at: sent_at.or(internal_date),
            internal_date,
            flags,
        })
    }
}

/// Render a UID set (`1,2,5`) for a UID command.
pub(crate) fn uid_set(uids: &[u32]) -> String {
    uids.iter()
        .map(|u| u.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Collect every UID appearing in a THREAD forest, de-duplicated.
pub fn forest_uids(forest: &[ThreadNode]) -> Vec<u32> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for root in forest {
        for uid in root.descendants() {
            if seen.insert(uid) {
                out.push(uid);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn search_criteria_render() {
        let since = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let criteria = SearchCriteria::And(vec![
            SearchCriteria::From("alice".to_string()),
            SearchCriteria::Subject("budget \"Q3\"".to_string()),
            SearchCriteria::Since(since),
            SearchCriteria::Text("cabbage".to_string()),
        ]);

        assert_eq!(
            criteria.to_imap_string(),
            "FROM \"alice\" SUBJECT \"budget \\\"Q3\\\"\" SINCE 01-Jan-2025 TEXT \"cabbage\""
        );
    }

    #[test]
    fn empty_and_renders_all() {
        assert_eq!(SearchCriteria::And(vec![]).to_imap_string(), "ALL");
    }

    #[test]
    fn thread_node_descendants_depth_first() {
        let node = ThreadNode {
            uid: 3,
            children: vec![
                ThreadNode::leaf(6),
                ThreadNode {
                    uid: 4,
                    children: vec![ThreadNode::leaf(23)],
                },
            ],
        };
        assert_eq!(node.descendants(), vec![3, 6, 4, 23]);
    }

    #[test]
    fn forest_uids_deduplicates() {
        let forest = vec![
            ThreadNode::leaf(2),
            ThreadNode {
                uid: 3,
                children: vec![ThreadNode::leaf(2)],
            },
        ];
        assert_eq!(forest_uids(&forest), vec![2, 3]);
    }

    #[test]
    fn uid_set_renders_comma_separated() {
        assert_eq!(uid_set(&[1, 2, 10]), "1,2,10");
    }

    #[test]
    fn decodes_encoded_words() {
        let decoded = decode_mime_encoded_text(b"=?UTF-8?q?Hello_world?=");
        assert_eq!(decoded, "Hello world");
    }
}
