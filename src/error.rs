// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Unified error handling for the V-Mail core.
//!
//! The error set is closed: every failure a caller can observe maps to one of
//! these variants, and each variant carries a fixed HTTP status for the outer
//! layer. Per-message parse failures inside a batch sync are absorbed by the
//! engine and never reach this type.

use thiserror::Error;

use crate::crypto::CryptoError;
use crate::imap::error::ImapError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Entity absent.
    #[error("not found")]
    NotFound,

    /// Search query could not be parsed.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// Request validation failure.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// IMAP/SMTP rejected the stored credentials; distinct from the outer
    /// identity layer, this asks the user to re-enter mail credentials.
    #[error("mail authentication failed: {0}")]
    AuthFailed(String),

    /// Transport-level failure reaching IMAP/SMTP.
    #[error("connection failed: {0}")]
    ConnectFailed(String),

    /// Database failure.
    #[error("storage failed: {0}")]
    StorageFailed(String),

    /// MIME parsing of a specific message failed.
    #[error("parse failed: {0}")]
    ParseFailed(String),

    /// The caller's cancellation handle was tripped.
    #[error("cancelled")]
    Cancelled,

    /// Ownership mismatch on an action-queue row.
    #[error("conflict")]
    Conflict,
}

impl Error {
    /// HTTP status the outer layer should answer with. `Conflict` reports 404
    /// so that job ids do not leak across users; `Cancelled` uses the
    /// client-closed-request convention and carries no body.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::NotFound => 404,
            Error::InvalidQuery(_) | Error::InvalidInput(_) => 400,
            Error::AuthFailed(_) => 401,
            Error::ConnectFailed(_) => 502,
            Error::StorageFailed(_) | Error::ParseFailed(_) => 500,
            Error::Cancelled => 499,
            Error::Conflict => 404,
        }
    }

    /// Transient errors leave durable work (queue rows) in place for retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::ConnectFailed(_) | Error::StorageFailed(_) | Error::Cancelled
        )
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Error::NotFound,
            other => Error::StorageFailed(other.to_string()),
        }
    }
}

impl From<ImapError> for Error {
    fn from(err: ImapError) -> Self {
        match err {
            ImapError::Auth(msg) => Error::AuthFailed(msg),
            ImapError::Connection(msg) | ImapError::Tls(msg) => Error::ConnectFailed(msg),
            ImapError::Io(msg) => Error::ConnectFailed(msg),
            ImapError::Timeout(msg) => Error::ConnectFailed(msg),
            ImapError::Parse(msg) => Error::ParseFailed(msg),
            other => Error::ConnectFailed(other.to_string()),
        }
    }
}

impl From<CryptoError> for Error {
    fn from(err: CryptoError) -> Self {
        // A credential that cannot be decrypted is as good as a rejected one.
        Error::AuthFailed(err.to_string())
    }
}

/// True for database "unique_violation" (23505). On upsert paths this means a
/// concurrent upsert won and the write can be absorbed.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.code().as_deref() == Some("23505"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_are_stable() {
        assert_eq!(Error::NotFound.status_code(), 404);
        assert_eq!(Error::InvalidQuery("x".into()).status_code(), 400);
        assert_eq!(Error::AuthFailed("x".into()).status_code(), 401);
        assert_eq!(Error::ConnectFailed("x".into()).status_code(), 502);
        assert_eq!(Error::StorageFailed("x".into()).status_code(), 500);
        assert_eq!(Error::Cancelled.status_code(), 499);
        // Conflict hides ownership behind 404.
        assert_eq!(Error::Conflict.status_code(), 404);
    }

    #[test]
    fn transient_classification() {
        assert!(Error::ConnectFailed("net down".into()).is_transient());
        assert!(Error::StorageFailed("db".into()).is_transient());
        assert!(!Error::InvalidInput("bad".into()).is_transient());
        assert!(!Error::Conflict.is_transient());
    }
}
