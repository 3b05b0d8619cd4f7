//! Local caching layer
//!
//! Path sanitizing, the on-disk content cache, and the trust windows that
//! decide when a cached copy may be served without asking the remote store.

pub mod freshness;
pub mod local;
pub mod paths;

pub use freshness::{Clock, FreshnessTracker, ManualClock, SystemClock};
pub use local::{LocalCache, LocalEntry};
