//! Live query controllers over the local cache.
//!
//! A [`QueryController`] keeps a sorted projection of one query's cached
//! results, pages further results in from the remote backend, and follows
//! every store commit through a per-controller change bridge.

mod bridge;
mod controller;
mod event;
mod projection;
mod state;

pub use bridge::{classify, LiveUpdate};
pub use controller::{QueryController, QueryOptions, RowValue, DEFAULT_PAGE_SIZE};
pub use event::{EventStream, QueryEvent, QueryObserver, RowChange};
pub use projection::{Comparator, ResultProjection};
pub use state::{ControllerState, Transition};
