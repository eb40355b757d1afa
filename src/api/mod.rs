//! Request execution: descriptors, transport, retry policy and errors.

mod descriptor;
mod error;
mod executor;
mod transport;

pub use descriptor::{HttpMethod, RequestDescriptor, DEFAULT_RETRIES, DEFAULT_RETRY_DELAY};
pub use error::{ApiError, NetworkErrorKind};
pub use executor::{should_retry, ApiResponse, RequestExecutor, DEFAULT_TIMEOUT};
pub use transport::{HttpRequest, HttpResponse, ReqwestTransport, Transport, TransportError};
