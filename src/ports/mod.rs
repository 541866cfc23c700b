pub mod authenticator;
pub mod http_client;
