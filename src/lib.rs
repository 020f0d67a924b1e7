//! Library core for the V-Mail synchronization service.

// --- Modules ---
pub mod actions;
pub mod config;
pub mod crypto;
pub mod error;
pub mod events;
pub mod idle;
pub mod imap;
pub mod mime;
pub mod pool;
pub mod query;
pub mod service;
pub mod smtp;
pub mod store;
pub mod sync;

// CONSOLIDATED PRELUDE
pub mod prelude {
    // Config
    pub use crate::config::Settings;

    // Errors
    pub use crate::error::{Error, Result};
    pub use crate::imap::error::ImapError;

    // IMAP
    pub use crate::imap::session::{ImapEndpoint, ListenerSession, MailSession, WorkerSession};
    pub use crate::imap::types::{
        FlagOperation, FolderInfo, IdleOutcome, MessageMeta, SearchCriteria, ThreadNode,
    };

    // Store
    pub use crate::store::Store;

    // Common Libs
    pub use log::{debug, error, info, trace, warn};
    pub use std::sync::Arc;
    pub use tokio::sync::Mutex as TokioMutex;
    pub use uuid::Uuid;
}
