pub mod authenticator;
pub mod http_client;
pub mod http_handler;
pub mod pipeline;
pub mod proxy;
pub mod stages;
pub mod tls;

/// Re-export commonly used types from adapters
pub use authenticator::{BearerAuthenticator, NoAuth};
pub use http_client::HttpClientAdapter;
pub use http_handler::HttpHandler;
pub use pipeline::{Next, Pipeline, PipelineRequest, Stage};
pub use proxy::ProxyExecutor;
pub use tls::{TlsError, TlsListenerAdapter};
