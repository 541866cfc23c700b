#![allow(clippy::collapsible_if)]

use std::{collections::BTreeMap, net::SocketAddr};

use crate::config::models::{
    AuthConfig, CircuitBreakerConfig, ProxyConfig, RateLimitConfig, RouteConfig, ServerConfig,
    ServerSettings, TlsConfig, UpstreamServiceConfig,
};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Invalid TLS configuration: {message}")]
    InvalidTls { message: String },

    #[error("Route conflict detected: {message}")]
    RouteConflict { message: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Server configuration validator
///
/// Collects every violation instead of stopping at the first one, so operators
/// can fix a broken file in a single pass.
pub struct ServerConfigValidator;

impl ServerConfigValidator {
    /// Validate the entire server configuration
    pub fn validate(config: &ServerConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_listen_address(&config.listen_addr) {
            errors.push(e);
        }

        if config.gateway_name.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: "gateway_name".to_string(),
            });
        }

        if config.services.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "services".to_string(),
            });
        }
        for (name, service) in &config.services {
            errors.extend(Self::validate_service(name, service));
        }

        if config.routes.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "routes".to_string(),
            });
        }
        for route in &config.routes {
            errors.extend(Self::validate_route(route, &config.services));
        }
        errors.extend(Self::check_route_conflicts(&config.routes));

        errors.extend(Self::validate_rate_limit(&config.rate_limit));
        errors.extend(Self::validate_circuit_breaker(&config.circuit_breaker));
        errors.extend(Self::validate_proxy(&config.proxy));
        errors.extend(Self::validate_server_settings(&config.server));
        errors.extend(Self::validate_auth(&config.auth));

        if let Some(tls_config) = &config.tls {
            if let Err(e) = Self::validate_tls_config(tls_config) {
                errors.push(e);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    /// Validate listen address format
    fn validate_listen_address(address: &str) -> ValidationResult<()> {
        if address.parse::<SocketAddr>().is_err() {
            return Err(ValidationError::InvalidListenAddress {
                address: address.to_string(),
                reason: "Must be in format 'IP:PORT' (e.g., '127.0.0.1:3000' or '0.0.0.0:8080')"
                    .to_string(),
            });
        }
        Ok(())
    }

    fn validate_service(name: &str, service: &UpstreamServiceConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if name.trim().is_empty() {
            errors.push(ValidationError::InvalidField {
                field: "services".to_string(),
                message: "Service names cannot be empty".to_string(),
            });
        }

        if let Err(e) = Self::validate_url(&service.base_url, &format!("service '{name}' base_url"))
        {
            errors.push(e);
        }

        if !service.health_path.starts_with('/') {
            errors.push(ValidationError::InvalidField {
                field: format!("service '{name}' health_path"),
                message: "Health path must start with '/'".to_string(),
            });
        }

        if service.timeout_ms == 0 {
            errors.push(ValidationError::InvalidField {
                field: format!("service '{name}' timeout_ms"),
                message: "Must be greater than 0".to_string(),
            });
        }

        errors
    }

    /// Validate a single route entry
    fn validate_route(
        route: &RouteConfig,
        services: &BTreeMap<String, UpstreamServiceConfig>,
    ) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let path = &route.prefix;

        if !path.starts_with('/') {
            errors.push(ValidationError::InvalidField {
                field: format!("route path: {path}"),
                message: "Route prefixes must start with '/'".to_string(),
            });
        }

        if !services.contains_key(&route.service) {
            errors.push(ValidationError::InvalidField {
                field: format!("route '{path}' service"),
                message: format!("Unknown service '{}'", route.service),
            });
        }

        errors
    }

    /// Validate URL format
    fn validate_url(url_str: &str, context: &str) -> ValidationResult<()> {
        match url::Url::parse(url_str) {
            Ok(url) => {
                if url.scheme() != "http" && url.scheme() != "https" {
                    return Err(ValidationError::InvalidField {
                        field: context.to_string(),
                        message: format!(
                            "URL scheme must be 'http' or 'https', got '{}'",
                            url.scheme()
                        ),
                    });
                }

                if url.host().is_none() {
                    return Err(ValidationError::InvalidField {
                        field: context.to_string(),
                        message: "URL must have a valid host".to_string(),
                    });
                }

                if url.query().is_some() {
                    return Err(ValidationError::InvalidField {
                        field: context.to_string(),
                        message: "Base URL must not carry a query string".to_string(),
                    });
                }

                Ok(())
            }
            Err(e) => Err(ValidationError::InvalidField {
                field: context.to_string(),
                message: format!("Invalid URL format: {e}"),
            }),
        }
    }

    fn validate_rate_limit(config: &RateLimitConfig) -> Vec<ValidationError> {
        if !config.enabled {
            return Vec::new();
        }

        [
            ("rate_limit.requests_per_window", config.requests_per_window as u64),
            ("rate_limit.window_secs", config.window_secs),
            ("rate_limit.block_secs", config.block_secs),
            ("rate_limit.cleanup_interval_secs", config.cleanup_interval_secs),
        ]
        .into_iter()
        .filter(|(_, value)| *value == 0)
        .map(|(field, _)| ValidationError::InvalidField {
            field: field.to_string(),
            message: "Must be greater than 0 when rate limiting is enabled".to_string(),
        })
        .collect()
    }

    fn validate_circuit_breaker(config: &CircuitBreakerConfig) -> Vec<ValidationError> {
        [
            ("circuit_breaker.failure_threshold", config.failure_threshold as u64),
            ("circuit_breaker.open_interval_secs", config.open_interval_secs),
            ("circuit_breaker.sweep_interval_secs", config.sweep_interval_secs),
        ]
        .into_iter()
        .filter(|(_, value)| *value == 0)
        .map(|(field, _)| ValidationError::InvalidField {
            field: field.to_string(),
            message: "Must be greater than 0".to_string(),
        })
        .collect()
    }

    fn validate_proxy(config: &ProxyConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if config.max_request_body_bytes == 0 {
            errors.push(ValidationError::InvalidField {
                field: "proxy.max_request_body_bytes".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }
        errors
    }

    fn validate_server_settings(config: &ServerSettings) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if config.request_timeout_secs == 0 {
            errors.push(ValidationError::InvalidField {
                field: "server.request_timeout_secs".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        if config.max_in_flight == Some(0) {
            errors.push(ValidationError::InvalidField {
                field: "server.max_in_flight".to_string(),
                message: "Must be greater than 0 (omit it to disable the admission gate)"
                    .to_string(),
            });
        }

        errors
    }

    fn validate_auth(config: &AuthConfig) -> Vec<ValidationError> {
        config
            .public_prefixes
            .iter()
            .filter(|prefix| !prefix.starts_with('/'))
            .map(|prefix| ValidationError::InvalidField {
                field: "auth.public_prefixes".to_string(),
                message: format!("Prefix '{prefix}' must start with '/'"),
            })
            .collect()
    }

    /// Validate TLS configuration
    fn validate_tls_config(config: &TlsConfig) -> ValidationResult<()> {
        if !std::path::Path::new(&config.cert_path).exists() {
            return Err(ValidationError::InvalidTls {
                message: format!("Certificate file does not exist: {}", config.cert_path),
            });
        }

        if !std::path::Path::new(&config.key_path).exists() {
            return Err(ValidationError::InvalidTls {
                message: format!("Private key file does not exist: {}", config.key_path),
            });
        }

        Ok(())
    }

    /// Duplicate prefixes make longest-prefix resolution ambiguous.
    fn check_route_conflicts(routes: &[RouteConfig]) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        for (i, first) in routes.iter().enumerate() {
            for second in routes.iter().skip(i + 1) {
                if first.prefix == second.prefix {
                    errors.push(ValidationError::RouteConflict {
                        message: format!(
                            "Duplicate route prefix '{}' (services '{}' and '{}')",
                            first.prefix, first.service, second.service
                        ),
                    });
                }
            }
        }

        errors
    }

    /// Format multiple validation errors into a single message
    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        if errors.is_empty() {
            return "No errors".to_string();
        }

        if errors.len() == 1 {
            return errors[0].to_string();
        }

        let mut message = format!("Found {} validation errors:\n", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("  {}. {}\n", i + 1, error));
        }
        message
    }
}
