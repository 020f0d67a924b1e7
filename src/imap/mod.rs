// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! IMAP session layer: connection establishment, the `MailSession` seam the
//! engine and workers program against, and the async-imap backed
//! implementations.

pub mod error;
pub mod session;
pub mod types;

pub use error::ImapError;
pub use session::{ImapEndpoint, ListenerSession, MailSession, WorkerSession};
