//! Resilient API client: TTL cache, connectivity-aware offline queue,
//! single-flight token refresh, retrying request executor and a stateful
//! per-query facade.

pub mod api;
pub mod auth;
pub mod cache;
pub mod client;
pub mod config;
mod flight;
pub mod network;
pub mod query;
pub mod store;

pub use api::{ApiError, ApiResponse, HttpMethod, NetworkErrorKind, RequestDescriptor, RequestExecutor};
pub use auth::{AuthCoordinator, AuthFailure, AuthToken};
pub use cache::{CacheEntry, CacheStore};
pub use client::ApiClient;
pub use config::Config;
pub use network::{NetworkMonitor, NetworkState, PendingRequest};
pub use query::{CacheStrategy, ExecuteParams, FacadeConfig, QueryStatus, RequestFacade, RequestTarget};
pub use store::{MemoryStore, PersistentStore, SqliteStore};
