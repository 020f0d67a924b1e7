// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! MIME parsing of raw message bytes.
//!
//! Thin wrapper over `mail_parser`: the rest of the crate treats this as a
//! pure function from bytes to `(html, text, attachments)` and never touches
//! the parser types directly.

use mail_parser::{Message, MimeHeaders};

use crate::imap::error::ImapError;

/// Attachment metadata extracted from a parsed message. Bodies stay on the
/// IMAP server; the cache only records what is needed to render a list.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedAttachment {
    pub filename: String,
    pub mime_type: String,
    pub size_bytes: i64,
    pub is_inline: bool,
    pub content_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedBody {
    pub html: Option<String>,
    pub text: Option<String>,
    pub attachments: Vec<ParsedAttachment>,
}

/// Parse raw RFC 5322 bytes into displayable bodies plus attachment metadata.
pub fn parse(raw: &[u8]) -> Result<ParsedBody, ImapError> {
    let message = Message::parse(raw)
        .ok_or_else(|| ImapError::Parse("failed to parse message bytes".to_string()))?;

    let text = message.body_text(0).map(|s| s.to_string());
    let html = message.body_html(0).map(|s| s.to_string());

    let mut attachments = Vec::new();
    for (i, part) in message.parts.iter().enumerate() {
        // Part 0 is the message itself; parts carrying a filename are
        // attachments regardless of nesting depth.
        if i == 0 {
            continue;
        }
        let Some(name) = part.attachment_name() else {
            continue;
        };

        let mime_type = part
            .content_type()
            .map(|ct| {
                let sub = ct
                    .c_subtype
                    .as_ref()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "octet-stream".to_string());
                format!("{}/{}", ct.c_type, sub)
            })
            .unwrap_or_else(|| "application/octet-stream".to_string());

        let is_inline = part
            .content_disposition()
            .map(|cd| cd.c_type.eq_ignore_ascii_case("inline"))
            .unwrap_or(false);

        let content_id = part.content_id().map(|id| id.to_string());

        attachments.push(ParsedAttachment {
            filename: name.to_string(),
            mime_type,
            size_bytes: part.contents().len() as i64,
            is_inline,
            content_id,
        });
    }

    Ok(ParsedBody {
        html,
        text,
        attachments,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain_message() -> Vec<u8> {
        b"From: alice@example.com\r\n\
          To: bob@example.com\r\n\
          Subject: hello\r\n\
          Message-ID: <a@x>\r\n\
          Content-Type: text/plain; charset=utf-8\r\n\
          \r\n\
          Just checking in.\r\n"
            .to_vec()
    }

    fn multipart_with_attachment() -> Vec<u8> {
        b"From: alice@example.com\r\n\
          To: bob@example.com\r\n\
          Subject: report\r\n\
          Content-Type: multipart/mixed; boundary=\"xyz\"\r\n\
          \r\n\
          --xyz\r\n\
          Content-Type: text/plain\r\n\
          \r\n\
          See attached.\r\n\
          --xyz\r\n\
          Content-Type: application/pdf; name=\"q3.pdf\"\r\n\
          Content-Disposition: attachment; filename=\"q3.pdf\"\r\n\
          Content-Transfer-Encoding: base64\r\n\
          \r\n\
          JVBERi0xLjQK\r\n\
          --xyz--\r\n"
            .to_vec()
    }

    #[test]
    fn plain_text_body() {
        let parsed = parse(&plain_message()).unwrap();
        assert_eq!(parsed.text.unwrap().trim(), "Just checking in.");
        assert!(parsed.attachments.is_empty());
    }

    #[test]
    fn attachment_metadata_extracted() {
        let parsed = parse(&multipart_with_attachment()).unwrap();
        assert_eq!(parsed.text.unwrap().trim(), "See attached.");
        assert_eq!(parsed.attachments.len(), 1);

        let att = &parsed.attachments[0];
        assert_eq!(att.filename, "q3.pdf");
        assert_eq!(att.mime_type, "application/pdf");
        assert!(att.size_bytes > 0);
        assert!(!att.is_inline);
    }
}
