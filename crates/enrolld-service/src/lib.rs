pub mod client;
pub mod error;
pub mod proxy;
pub mod retry;

pub use client::{DeviceServiceClient, SerialOutcome, DEFAULT_SERVICE_URL};
pub use error::ServiceError;
pub use proxy::{resolve_endpoint, ProxyInfo, ServiceEndpoint};
pub use retry::RetryPolicy;
