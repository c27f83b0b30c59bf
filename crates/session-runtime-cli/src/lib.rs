//! # Session Runtime CLI
//!
//! Demo host for the session processing engine.
//!
//! This module provides CLI commands for:
//! - Running the processor against a seeded in-memory broker
//! - Validating and printing the resolved configuration

use bytes::Bytes;
use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};
use session_runtime::{
    handler_fn, ConfigError, InMemoryBroker, InMemoryBrokerConfig, Message, ProcessorConfig,
    ProcessorError, SessionId, SessionProcessor, TracingEventSink, ValidationError,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;

/// Environment variable holding an explicit configuration file path
pub const CONFIG_PATH_ENV: &str = "SESSION_RUNTIME_CONFIG";

/// Prefix of environment variables overriding configuration values
pub const ENV_PREFIX: &str = "SR";

const IDLE_CHECK_INTERVAL: Duration = Duration::from_millis(100);

// ============================================================================
// CLI Structure
// ============================================================================

/// Session Runtime - ordered, session-affine message processing
#[derive(Parser, Debug)]
#[command(name = "session-runtime")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Session-affinity message processing demo")]
#[command(
    long_about = "Processes messages from session-enabled queues with per-session ordering, lock renewal and retry"
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, env = CONFIG_PATH_ENV, global = true)]
    pub config: Option<PathBuf>,

    /// Logging level (overrides the configuration file)
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long, global = true)]
    pub json_logs: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Seed an in-memory broker and process its sessions
    Run(RunArgs),

    /// Validate and print the resolved configuration
    Config {
        /// Output format for configuration
        #[arg(short = 'f', long, default_value = "yaml")]
        format: ConfigFormat,
    },
}

/// Arguments of the `run` command
#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct RunArgs {
    /// Number of sessions to seed
    #[arg(short, long, default_value = "3")]
    pub sessions: u32,

    /// Messages seeded into each session
    #[arg(short, long, default_value = "5")]
    pub messages_per_session: u32,

    /// Stop once every seeded message has been settled
    #[arg(long)]
    pub exit_when_idle: bool,
}

/// Configuration format options
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum ConfigFormat {
    /// YAML format
    Yaml,
    /// JSON format
    Json,
    /// TOML format
    Toml,
}

// ============================================================================
// CLI Error Types
// ============================================================================

/// CLI-specific errors
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Startup error: {0}")]
    Startup(#[source] ProcessorError),

    #[error("Command failed: {message}")]
    CommandFailed { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CliError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration(_) => 1,
            Self::Startup(_) => 2,
            Self::CommandFailed { .. } => 3,
            Self::Io(_) => 5,
        }
    }

    fn command_failed(message: impl Into<String>) -> Self {
        Self::CommandFailed {
            message: message.into(),
        }
    }
}

impl From<ProcessorError> for CliError {
    fn from(error: ProcessorError) -> Self {
        match error {
            ProcessorError::Config(e) => Self::Configuration(e),
            other => Self::Startup(other),
        }
    }
}

impl From<ValidationError> for CliError {
    fn from(error: ValidationError) -> Self {
        Self::command_failed(error.to_string())
    }
}

// ============================================================================
// Configuration Types
// ============================================================================

/// Resolved CLI configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Session processor settings
    pub processor: ProcessorConfig,

    /// In-memory broker used by the demo
    pub broker: DemoBrokerConfig,

    /// Default logging configuration
    pub logging: LoggingConfig,
}

impl CliConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.processor.validate()?;

        if self.broker.session_lock_duration_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "broker.session_lock_duration_ms".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        Ok(())
    }
}

/// Settings of the demo in-memory broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoBrokerConfig {
    /// Lock duration granted on accept and on every renewal
    pub session_lock_duration_ms: u64,

    /// Broker-side dead-letter threshold
    pub max_delivery_count: Option<u32>,
}

impl Default for DemoBrokerConfig {
    fn default() -> Self {
        Self {
            session_lock_duration_ms: 30_000,
            max_delivery_count: None,
        }
    }
}

impl DemoBrokerConfig {
    pub fn to_broker_config(&self) -> InMemoryBrokerConfig {
        InMemoryBrokerConfig {
            session_lock_duration: Duration::from_millis(self.session_lock_duration_ms),
            max_delivery_count: self.max_delivery_count,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

/// Log format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogFormat {
    #[serde(rename = "text")]
    Text,
    #[serde(rename = "json")]
    Json,
}

/// Load configuration from the layered sources
///
/// Sources, later ones overriding earlier ones:
/// 1. `/etc/session-runtime/processor.yaml`
/// 2. `./config/processor.yaml`
/// 3. the explicit path, if given (format taken from its extension)
/// 4. environment variables prefixed `SR__`, e.g. `SR__PROCESSOR__PREFETCH_COUNT=10`
///
/// Missing optional files are skipped. The result is validated.
pub fn load_config(explicit_path: Option<&Path>) -> Result<CliConfig, ConfigError> {
    let mut builder = config::Config::builder()
        .add_source(
            config::File::with_name("/etc/session-runtime/processor")
                .required(false)
                .format(config::FileFormat::Yaml),
        )
        .add_source(
            config::File::with_name("config/processor")
                .required(false)
                .format(config::FileFormat::Yaml),
        );

    if let Some(path) = explicit_path {
        builder = builder.add_source(config::File::from(path).required(true));
    }

    let settings = builder
        .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
        .build()
        .map_err(|e| ConfigError::Parsing {
            message: e.to_string(),
        })?;

    let config: CliConfig = settings
        .try_deserialize()
        .map_err(|e| ConfigError::Parsing {
            message: e.to_string(),
        })?;

    config.validate()?;
    Ok(config)
}

/// Default `EnvFilter` directives for the given level
pub fn default_filter(level: &str) -> String {
    format!("session_runtime={level},session_runtime_cli={level}")
}

/// Install the global tracing subscriber
///
/// `RUST_LOG` takes precedence over `level`.
pub fn init_logging(level: &str, json: bool) -> Result<(), CliError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(level).into());
    let registry = tracing_subscriber::registry().with(filter);

    let result = if json {
        registry.with(tracing_subscriber::fmt::layer().json()).try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };

    result.map_err(|e| CliError::command_failed(format!("Failed to initialise logging: {}", e)))
}

// ============================================================================
// Main Entry Point
// ============================================================================

/// Main CLI entry point
pub async fn run_cli() -> Result<(), CliError> {
    execute(Cli::parse()).await
}

/// Execute a parsed command line
pub async fn execute(cli: Cli) -> Result<(), CliError> {
    let loaded = load_config(cli.config.as_deref());

    let (level, json) = match &loaded {
        Ok(config) => (
            cli.log_level.clone().unwrap_or_else(|| config.logging.level.clone()),
            cli.json_logs || config.logging.format == LogFormat::Json,
        ),
        Err(_) => (
            cli.log_level.clone().unwrap_or_else(|| "info".to_string()),
            cli.json_logs,
        ),
    };
    init_logging(&level, json)?;

    let config = loaded.inspect_err(|e| error!(error = %e, "Configuration is invalid"))?;

    match cli.command {
        Commands::Run(args) => execute_run_command(&args, &config).await,
        Commands::Config { format } => {
            let rendered = render_config(&config, format)?;
            println!("{}", rendered);
            Ok(())
        }
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

/// Serialize the configuration in the requested format
pub fn render_config(config: &CliConfig, format: ConfigFormat) -> Result<String, CliError> {
    match format {
        ConfigFormat::Yaml => serde_yaml::to_string(config)
            .map_err(|e| CliError::command_failed(format!("YAML serialization failed: {}", e))),
        ConfigFormat::Json => serde_json::to_string_pretty(config)
            .map_err(|e| CliError::command_failed(format!("JSON serialization failed: {}", e))),
        ConfigFormat::Toml => toml::to_string_pretty(config)
            .map_err(|e| CliError::command_failed(format!("TOML serialization failed: {}", e))),
    }
}

/// Enqueue the demo messages
///
/// Sessions are named `session-1..=N`; bodies record their position so the
/// per-session order is visible in the logs.
pub fn seed_broker(
    broker: &InMemoryBroker,
    sessions: u32,
    messages_per_session: u32,
) -> Result<usize, CliError> {
    let mut seeded = 0;

    for session in 1..=sessions {
        let session_id = SessionId::new(format!("session-{}", session))?;
        for sequence in 1..=messages_per_session {
            let body = format!("Message {} of {}", sequence, session_id);
            broker.send(
                Message::new(session_id.clone(), Bytes::from(body))
                    .with_attribute("sequence".to_string(), sequence.to_string()),
            );
            seeded += 1;
        }
    }

    Ok(seeded)
}

async fn execute_run_command(args: &RunArgs, config: &CliConfig) -> Result<(), CliError> {
    let broker = InMemoryBroker::new(config.broker.to_broker_config());
    let seeded = seed_broker(&broker, args.sessions, args.messages_per_session)?;

    info!(
        sessions = args.sessions,
        messages = seeded,
        max_concurrent_sessions = config.processor.max_concurrent_sessions,
        "Seeded in-memory broker"
    );

    let handler = handler_fn(|message| async move {
        info!(
            session_id = %message.session_id,
            message_id = %message.message_id,
            delivery_count = message.delivery_count,
            body = message.body_as_str().unwrap_or("<binary>"),
            "Handling message"
        );
        Ok(())
    });

    let processor = SessionProcessor::new(
        Arc::new(broker.clone()),
        Arc::new(handler),
        config.processor.clone(),
        Arc::new(TracingEventSink::new()),
    )?;

    let exit_when_idle = args.exit_when_idle;
    let idle = async {
        if exit_when_idle {
            while broker.unsettled_count() > 0 {
                tokio::time::sleep(IDLE_CHECK_INTERVAL).await;
            }
            info!("All seeded messages settled");
        } else {
            std::future::pending::<()>().await;
        }
    };

    let shutdown = async {
        tokio::select! {
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => info!("Shutdown signal received"),
                Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
            },
            _ = idle => {}
        }
    };

    processor.run_until(shutdown).await?;

    let dead_lettered = broker.dead_letters().len();
    info!(
        settled = broker.settlements().len(),
        dead_lettered,
        remaining = broker.unsettled_count(),
        "Demo finished"
    );

    Ok(())
}
