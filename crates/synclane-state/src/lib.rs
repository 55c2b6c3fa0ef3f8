//! Checkpoint persistence for the synclane replication core.
//!
//! Provides the [`SyncPersistence`] trait and a [`SqliteSyncPersistence`]
//! implementation that keeps the latest destination-acknowledged checkpoint
//! per connection and stream, plus a history of attempt summaries.

#![warn(clippy::pedantic)]

pub mod backend;
pub mod error;
pub mod sqlite;

pub use backend::SyncPersistence;
pub use error::StateError;
pub use sqlite::SqliteSyncPersistence;
