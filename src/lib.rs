//! Client-side synchronization cache for zoned, versioned remote records.
//!
//! - [`sync::RecordSynchronizer`] fetches, creates, edits and deletes typed
//!   records against a [`remote::RemoteBackend`], mirroring every outcome
//!   into the local [`store::CacheStore`].
//! - [`query::QueryController`] presents a live, sorted, paged view of one
//!   query's cached results and reports row-level changes as they commit.

pub mod config;
pub mod error;
pub mod logging;
pub mod query;
pub mod record;
pub mod remote;
pub mod store;
pub mod sync;

pub use error::{DecodeError, RemoteError, StoreError, SyncError, SyncResult};
pub use query::{QueryController, QueryEvent, RowValue};
pub use record::{Query, RecordId, SyncRecord};
pub use store::CacheStore;
pub use sync::RecordSynchronizer;
