use std::path::Path;

use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use rampart::{
    Gateway,
    config::{ServerConfigValidator, loader::load_config_unchecked},
    tracing_setup::{self, LogFormat},
};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = "config.toml")]
    config: String,

    /// Log output format
    #[clap(long, value_enum, default_value_t = LogFormat::Json, global = true)]
    log_format: LogFormat,

    /// Log filter directive (overrides RUST_LOG), e.g. `info,rampart=debug`
    #[clap(long, global = true)]
    log_level: Option<String>,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        #[clap(short, long, default_value = "config.toml")]
        config: String,
    },
    /// Initialize a new configuration file
    Init {
        /// Output path for the new config file
        #[clap(short, long, default_value = "config.toml")]
        config: String,
    },
    /// Start the gateway server (default)
    Serve {
        /// Configuration file to use
        #[clap(short, long, default_value = "config.toml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    match args.command {
        Some(Commands::Validate { config }) => validate_config_command(&config).await,
        Some(Commands::Init { config }) => init_config_command(&config).await,
        Some(Commands::Serve { config }) => {
            serve(&config, args.log_format, args.log_level.as_deref()).await
        }
        None => serve(&args.config, args.log_format, args.log_level.as_deref()).await,
    }
}

async fn serve(config_path: &str, log_format: LogFormat, log_level: Option<&str>) -> Result<()> {
    tracing_setup::init_tracing(log_format, log_level)
        .map_err(|e| eyre!("Failed to initialize tracing: {}", e))?;
    rampart::metrics::describe_metrics();

    let provider = rustls::crypto::aws_lc_rs::default_provider();
    if let Err(e) = rustls::crypto::CryptoProvider::install_default(provider) {
        tracing::warn!(
            "CryptoProvider::install_default for aws-lc-rs reported an error: {:?}. \
            A provider was probably installed already; continuing.",
            e
        );
    }

    tracing::info!("Loading configuration from {config_path}");
    let config = rampart::config::load_config(config_path)
        .await
        .with_context(|| format!("Failed to load config from {config_path}"))?;
    let shutdown_timeout = config.server.shutdown_timeout();

    let gateway = Gateway::new(config).context("Failed to build gateway")?;

    let signal_handler_shutdown = gateway.shutdown_handle();
    tokio::spawn(async move {
        if let Err(e) = signal_handler_shutdown.run_signal_handler().await {
            tracing::error!("Signal handler error: {}", e);
        }
    });

    let running = gateway.start().await.context("Failed to start gateway")?;
    println!("Rampart gateway listening on {}", running.local_addr());

    running.wait_for_shutdown_signal().await;
    let report = running
        .shutdown(shutdown_timeout)
        .await
        .context("Gateway shutdown failed")?;
    if !report.drained {
        tracing::warn!(
            abandoned = report.abandoned,
            "Shutdown deadline cut in-flight requests short"
        );
    }

    Ok(())
}

/// Validate configuration file and exit
async fn validate_config_command(config_path: &str) -> Result<()> {
    println!("🔍 Validating configuration file: {config_path}");

    if !Path::new(config_path).exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' not found");
        std::process::exit(1);
    }

    let config = match load_config_unchecked(config_path).await {
        Ok(config) => {
            println!("✅ Configuration parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("❌ Configuration parsing failed:");
            eprintln!("   {e:#}");
            std::process::exit(1);
        }
    };

    match ServerConfigValidator::validate(&config) {
        Ok(()) => {
            println!("✅ Configuration validation: OK");
            println!();
            println!("📋 Configuration Summary:");
            println!("   • Listen Address: {}", config.listen_addr);
            println!("   • Services: {}", config.services.len());
            for (name, service) in &config.services {
                println!(
                    "     - {name}: {} (timeout {}ms, retries {})",
                    service.base_url, service.timeout_ms, service.max_retries
                );
            }
            println!("   • Routes: {}", config.routes.len());
            for route in &config.routes {
                println!("     - {} -> {}", route.prefix, route.service);
            }
            println!(
                "   • Rate Limit: {} (limit {} / {}s, block {}s)",
                if config.rate_limit.enabled {
                    "enabled"
                } else {
                    "disabled"
                },
                config.rate_limit.requests_per_window,
                config.rate_limit.window_secs,
                config.rate_limit.block_secs
            );
            println!(
                "   • Circuit Breaker: threshold {}, open {}s",
                config.circuit_breaker.failure_threshold, config.circuit_breaker.open_interval_secs
            );
            println!("   • TLS Enabled: {}", config.tls.is_some());
            println!();
            println!("🎉 Configuration is valid and ready to use!");
            Ok(())
        }
        Err(e) => {
            eprintln!("❌ Configuration validation failed:");
            eprintln!("{e}");
            println!();
            println!("💡 Common fixes:");
            println!("   • Ensure all base URLs start with http:// or https://");
            println!("   • Check that every route points to a configured service");
            println!("   • Verify listen address format (e.g., '127.0.0.1:3000')");
            println!("   • Ensure limits, thresholds and intervals are greater than zero");
            std::process::exit(1);
        }
    }
}

/// Initialize a new configuration file
async fn init_config_command(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);
    if path.exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' already exists");
        std::process::exit(1);
    }

    let default_config = r#"# Rampart Gateway Configuration

# The address to listen on
listen_addr = "0.0.0.0:8080"
gateway_name = "rampart"

[services.auth]
base_url = "http://auth-service:8080"

[services.player]
base_url = "http://player-service:8080"

[services.combat]
base_url = "http://combat-service:8081"
timeout_ms = 5000
max_retries = 2

[services.chat]
base_url = "http://chat-service:8082"

[[routes]]
prefix = "/api/v1/auth"
service = "auth"

[[routes]]
prefix = "/api/v1/players"
service = "player"

[[routes]]
prefix = "/api/v1/combat"
service = "combat"

[[routes]]
prefix = "/api/v1/chat"
service = "chat"

[rate_limit]
enabled = true
requests_per_window = 1000
window_secs = 60
block_secs = 900

[circuit_breaker]
failure_threshold = 5
open_interval_secs = 60
sweep_interval_secs = 30

[server]
request_timeout_secs = 30
shutdown_timeout_secs = 30
# max_in_flight = 10000

[auth]
mode = "none"
public_prefixes = ["/api/v1/auth"]

# [tls]
# cert_path = "certs/gateway.pem"
# key_path = "certs/gateway.key"
"#;

    tokio::fs::write(path, default_config)
        .await
        .context("Failed to write config file")?;
    println!("✅ Created default configuration at: {config_path}");
    println!("   Run 'rampart serve --config {config_path}' to start the server");
    Ok(())
}
