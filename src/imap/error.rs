// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use thiserror::Error;

/// Errors surfaced by the IMAP session layer.
#[derive(Debug, Error, Clone)]
pub enum ImapError {
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("TLS error: {0}")]
    Tls(String),
    #[error("Authentication failed: {0}")]
    Auth(String),
    #[error("Command failed: {0}")]
    Command(String),
    #[error("Fetch failed: {0}")]
    Fetch(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Missing data in response: {0}")]
    MissingData(String),
    #[error("Operation timed out: {0}")]
    Timeout(String),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("Server does not support THREAD=REFERENCES")]
    ThreadUnsupported,
}

impl From<async_imap::error::Error> for ImapError {
    fn from(err: async_imap::error::Error) -> Self {
        use async_imap::error::Error as E;
        match err {
            E::Io(e) => ImapError::Io(e.to_string()),
            E::No(msg) => ImapError::Command(format!("NO: {}", msg)),
            E::Bad(msg) => ImapError::Command(format!("BAD: {}", msg)),
            E::ConnectionLost => ImapError::Connection("connection lost".to_string()),
            E::Parse(e) => ImapError::Parse(e.to_string()),
            other => ImapError::Command(other.to_string()),
        }
    }
}

impl From<std::io::Error> for ImapError {
    fn from(err: std::io::Error) -> Self {
        ImapError::Io(err.to_string())
    }
}
