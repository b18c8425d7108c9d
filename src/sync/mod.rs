//! Connectivity-aware sync coordination.
//!
//! - [`ConnectivityHandle`] / [`Connectivity`]: the host's online/offline signal
//! - [`SyncCoordinator`]: status tracking, subscriber notification, sync passes
//!   and best-effort prefetch into the article cache

mod connectivity;
mod coordinator;

pub use connectivity::{Connectivity, ConnectivityHandle};
pub use coordinator::{PrefetchItem, Subscription, SyncCoordinator, SyncError, SyncPass, SyncStatus};
