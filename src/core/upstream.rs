use std::{fmt, str::FromStr, time::Duration};

use http::Uri;
use thiserror::Error;

use crate::config::UpstreamServiceConfig;

/// Errors related to upstream definitions
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum UpstreamError {
    /// Error when URL is invalid
    #[error("Invalid upstream URL: {0}")]
    InvalidUrl(String),

    /// The rewritten destination could not be turned into a URI
    #[error("Invalid upstream target '{target}': {reason}")]
    InvalidTarget { target: String, reason: String },

    /// A route names a service that is not configured
    #[error("Route '{prefix}' points to unknown service '{service}'")]
    UnknownService { prefix: String, service: String },
}

/// Result type for upstream operations
pub type UpstreamResult<T> = Result<T, UpstreamError>;

/// A type-safe representation of an upstream base URL
///
/// Stored without a trailing slash so request paths can be appended directly.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UpstreamUrl {
    url: String,
    is_secure: bool,
}

impl UpstreamUrl {
    /// Creates a new UpstreamUrl if the provided string is an http(s) URL with a host
    pub fn new(url: &str) -> UpstreamResult<Self> {
        let is_secure = url.starts_with("https://");
        let is_http = url.starts_with("http://");

        if !is_secure && !is_http {
            return Err(UpstreamError::InvalidUrl(format!(
                "Upstream URL must start with http:// or https://, got: {url}"
            )));
        }

        let parsed: Uri = url
            .parse()
            .map_err(|e| UpstreamError::InvalidUrl(format!("{url}: {e}")))?;
        if parsed.host().is_none() {
            return Err(UpstreamError::InvalidUrl(format!("{url}: missing host")));
        }

        Ok(UpstreamUrl {
            url: url.trim_end_matches('/').to_string(),
            is_secure,
        })
    }

    /// Get the underlying URL as a string reference
    pub fn as_str(&self) -> &str {
        &self.url
    }

    /// Check if the URL is using HTTPS
    pub fn is_secure(&self) -> bool {
        self.is_secure
    }

    /// Append a path (and optional query) to this base URL.
    pub fn join(&self, path_and_query: &str) -> UpstreamResult<Uri> {
        let target = if path_and_query.starts_with('/') {
            format!("{}{}", self.url, path_and_query)
        } else {
            format!("{}/{}", self.url, path_and_query)
        };

        target
            .parse()
            .map_err(|e: http::uri::InvalidUri| UpstreamError::InvalidTarget {
                target: target.clone(),
                reason: e.to_string(),
            })
    }
}

impl FromStr for UpstreamUrl {
    type Err = UpstreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        UpstreamUrl::new(s)
    }
}

impl fmt::Display for UpstreamUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url)
    }
}

/// Immutable runtime view of one configured upstream service.
#[derive(Debug, Clone)]
pub struct UpstreamService {
    name: String,
    base_url: UpstreamUrl,
    health_path: String,
    timeout: Duration,
    max_retries: u32,
}

impl UpstreamService {
    pub fn from_config(name: &str, config: &UpstreamServiceConfig) -> UpstreamResult<Self> {
        Ok(Self {
            name: name.to_string(),
            base_url: UpstreamUrl::new(&config.base_url)?,
            health_path: config.health_path.clone(),
            timeout: config.timeout(),
            max_retries: config.max_retries,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base_url(&self) -> &UpstreamUrl {
        &self.base_url
    }

    /// Per-attempt deadline
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Retries after the first attempt; at most `max_retries + 1` calls are made
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn health_url(&self) -> String {
        format!("{}{}", self.base_url, self.health_path)
    }
}
