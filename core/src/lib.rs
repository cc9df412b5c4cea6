/// Messaging core - live direct-message threads and inbox
///
/// Keeps an optimistically-updated, de-duplicated view of 1:1 threads and the
/// viewer's conversation list in sync with a backend change feed, with a
/// per-session profile cache.

pub mod error;
pub mod config;
pub mod models;
pub mod identity;
pub mod backend;
pub mod profile_cache;
pub mod feed;
pub mod debounce;
pub mod thread;
pub mod conversations;
pub mod cli_app;

pub use backend::{Backend, SledBackend};
pub use config::Config;
pub use conversations::ConversationList;
pub use error::{MessagingError, Result};
pub use identity::{Identity, SessionIdentity};
pub use profile_cache::ProfileCache;
pub use thread::ThreadSession;
