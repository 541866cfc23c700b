use std::path::Path;

use config::{Config, Environment, File, FileFormat};
use eyre::{Context, Result};

use crate::config::{ServerConfigValidator, models::ServerConfig};

/// Prefix of environment overrides, e.g. `RAMPART__RATE_LIMIT__REQUESTS_PER_WINDOW=500`
pub const ENV_PREFIX: &str = "RAMPART";

/// Load and validate configuration from a file.
///
/// Supports multiple formats (YAML, JSON, TOML, ...) picked by file extension,
/// layered with `RAMPART__*` environment overrides. Validation failures are
/// returned as errors so that startup aborts before any component is built.
pub async fn load_config(config_path: &str) -> Result<ServerConfig> {
    let config = load_config_unchecked(config_path).await?;
    ServerConfigValidator::validate(&config)
        .with_context(|| format!("Invalid configuration in {config_path}"))?;
    Ok(config)
}

/// Load configuration without validation (used by the `validate` command so it
/// can report parse and validation failures separately)
pub async fn load_config_unchecked(config_path: &str) -> Result<ServerConfig> {
    load_config_sync(config_path)
}

/// Load configuration synchronously
pub fn load_config_sync(config_path: &str) -> Result<ServerConfig> {
    let config_path = Path::new(config_path);

    // Determine file format based on extension
    let format = match config_path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => FileFormat::Yaml,
        Some("json") => FileFormat::Json,
        Some("ini") => FileFormat::Ini,
        _ => FileFormat::Toml,
    };

    let settings = Config::builder()
        .add_source(File::new(
            config_path
                .to_str()
                .ok_or_else(|| eyre::eyre!("Invalid UTF-8 path: {}", config_path.display()))?,
            format,
        ))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .with_context(|| format!("Failed to build config from {}", config_path.display()))?;

    let server_config: ServerConfig = settings.try_deserialize().with_context(|| {
        format!(
            "Failed to deserialize config from {}",
            config_path.display()
        )
    })?;

    Ok(server_config)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    #[tokio::test]
    async fn test_load_toml_config() {
        let toml_content = r#"
listen_addr = "127.0.0.1:3000"

[services.combat]
base_url = "http://combat:8081"
timeout_ms = 5000
max_retries = 2

[[routes]]
prefix = "/api/v1/combat"
service = "combat"

[rate_limit]
requests_per_window = 50
"#;

        let mut temp_file = NamedTempFile::with_suffix(".toml").unwrap();
        write!(temp_file, "{}", toml_content).unwrap();

        let config = load_config(temp_file.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:3000");
        assert_eq!(config.routes.len(), 1);
        assert_eq!(config.services["combat"].max_retries, 2);
        assert_eq!(config.rate_limit.requests_per_window, 50);
        // untouched fields keep their defaults
        assert_eq!(config.rate_limit.window_secs, 60);
    }

    #[tokio::test]
    async fn test_load_yaml_config() {
        let yaml_content = r#"
listen_addr: "127.0.0.1:3000"
services:
  chat:
    base_url: "http://chat:8082"
routes:
  - prefix: "/api/v1/chat"
    service: "chat"
    strip_prefix: true
circuit_breaker:
  failure_threshold: 3
"#;

        let mut temp_file = NamedTempFile::with_suffix(".yaml").unwrap();
        write!(temp_file, "{}", yaml_content).unwrap();

        let config = load_config(temp_file.path().to_str().unwrap())
            .await
            .unwrap();
        assert!(config.routes[0].strip_prefix);
        assert_eq!(config.circuit_breaker.failure_threshold, 3);
    }

    #[tokio::test]
    async fn test_load_rejects_invalid_config() {
        let json_content = r#"
{
  "listen_addr": "not-an-address",
  "services": { "chat": { "base_url": "http://chat:8082" } },
  "routes": [ { "prefix": "/api/v1/chat", "service": "economy" } ]
}
"#;

        let mut temp_file = NamedTempFile::with_suffix(".json").unwrap();
        write!(temp_file, "{}", json_content).unwrap();

        let path = temp_file.path().to_str().unwrap();
        assert!(load_config(path).await.is_err());
        // parsing alone succeeds
        assert!(load_config_unchecked(path).await.is_ok());
    }
}
