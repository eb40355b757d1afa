//! Connectivity state and the offline request queue.

mod monitor;
mod probe;
mod queue;
mod state;

pub use monitor::{DrainReport, NetworkMonitor, PendingReplay, PendingTicket, REQUEUE_RETRY_DELAY};
pub use probe::{ConnectivityProbe, DEFAULT_PROBE_INTERVAL};
pub use queue::{PendingRequest, DEFAULT_QUEUE_CAPACITY, QUEUE_KEY};
pub use state::NetworkState;
