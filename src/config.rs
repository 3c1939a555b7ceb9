//! Configuration module for chunkcast.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::protocol::{MAX_RECORD_LEN, SENTINEL};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for chunkcast
#[derive(Parser, Debug)]
#[command(name = "chunkcast")]
#[command(author = "chunkcast authors")]
#[command(version = "0.1.0")]
#[command(about = "Send a single file over TCP", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Transfer buffer capacity in bytes (one chunk per read/write)
    #[arg(short = 'b', long, global = true)]
    pub buffer_size: Option<usize>,

    /// Wire framing: length-prefixed records or the legacy EOF sentinel
    #[arg(long, value_enum, global = true)]
    pub framing: Option<Framing>,

    /// Per-operation I/O timeout in seconds (0 = wait forever)
    #[arg(long, global = true)]
    pub timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Listen for receivers and stream the source file to each of them
    Send(SendArgs),
    /// Connect to a sender and write the stream to the destination file
    Receive(ReceiveArgs),
}

#[derive(Args, Debug, Default)]
pub struct SendArgs {
    /// Interface to listen on
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// File to send
    #[arg(short = 'f', long)]
    pub source: Option<PathBuf>,

    /// Number of sessions to serve before exiting (0 = serve forever)
    #[arg(short = 'n', long)]
    pub sessions: Option<u64>,

    /// Maximum sessions in flight at once
    #[arg(long)]
    pub max_concurrent: Option<usize>,
}

#[derive(Args, Debug, Default)]
pub struct ReceiveArgs {
    /// Sender host name or address
    #[arg(long)]
    pub host: Option<String>,

    /// Sender port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// File to write (created or truncated)
    #[arg(short = 'o', long)]
    pub destination: Option<PathBuf>,
}

/// How the end of a transfer is marked on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Framing {
    /// Raw chunks terminated by the literal 3-byte `EOF` chunk.
    Sentinel,
    /// Length-prefixed data records followed by an end record.
    #[default]
    Framed,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub sender: SenderSection,
    #[serde(default)]
    pub receiver: ReceiverSection,
    #[serde(default)]
    pub transfer: TransferSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Sender-related configuration
#[derive(Debug, Deserialize)]
pub struct SenderSection {
    #[serde(default = "default_listen_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_source")]
    pub source: PathBuf,
    #[serde(default = "default_sessions")]
    pub sessions: u64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

impl Default for SenderSection {
    fn default() -> Self {
        Self {
            host: default_listen_host(),
            port: default_port(),
            source: default_source(),
            sessions: default_sessions(),
            max_concurrent: default_max_concurrent(),
        }
    }
}

/// Receiver-related configuration
#[derive(Debug, Deserialize)]
pub struct ReceiverSection {
    #[serde(default = "default_connect_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_destination")]
    pub destination: PathBuf,
}

impl Default for ReceiverSection {
    fn default() -> Self {
        Self {
            host: default_connect_host(),
            port: default_port(),
            destination: default_destination(),
        }
    }
}

/// Settings shared by both sides of a transfer
#[derive(Debug, Deserialize)]
pub struct TransferSection {
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default)]
    pub framing: Framing,
    /// Per-operation timeout in seconds; 0 disables it.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for TransferSection {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            framing: Framing::default(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen_host() -> String {
    "0.0.0.0".to_string()
}

fn default_connect_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8877
}

fn default_source() -> PathBuf {
    PathBuf::from("testVideo.mp4")
}

fn default_destination() -> PathBuf {
    PathBuf::from("downloadedVideo.mp4")
}

fn default_sessions() -> u64 {
    1
}

fn default_max_concurrent() -> usize {
    64
}

fn default_buffer_size() -> usize {
    1024
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Sender settings after merging CLI and file.
#[derive(Debug, Clone)]
pub struct SenderConfig {
    pub host: String,
    pub port: u16,
    pub source: PathBuf,
    /// Sessions to serve before closing the listener; 0 means unlimited.
    pub sessions: u64,
    pub max_concurrent: usize,
}

/// Receiver settings after merging CLI and file.
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    pub host: String,
    pub port: u16,
    pub destination: PathBuf,
}

/// Per-session transfer parameters, identical on both sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferConfig {
    pub buffer_size: usize,
    pub framing: Framing,
    pub timeout: Option<Duration>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            framing: Framing::default(),
            timeout: timeout_from_secs(default_timeout_secs()),
        }
    }
}

fn timeout_from_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then_some(Duration::from_secs(secs))
}

/// Which side this process plays.
#[derive(Debug, Clone)]
pub enum Role {
    Send(SenderConfig),
    Receive(ReceiverConfig),
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub role: Role,
    pub transfer: TransferConfig,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::resolve(CliArgs::parse())
    }

    /// Merge already-parsed CLI arguments with the TOML file they name.
    pub fn resolve(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let role = match cli.command {
            Command::Send(args) => {
                let file = toml_config.sender;
                Role::Send(SenderConfig {
                    host: args.host.unwrap_or(file.host),
                    port: args.port.unwrap_or(file.port),
                    source: args.source.unwrap_or(file.source),
                    sessions: args.sessions.unwrap_or(file.sessions),
                    max_concurrent: args.max_concurrent.unwrap_or(file.max_concurrent),
                })
            }
            Command::Receive(args) => {
                let file = toml_config.receiver;
                Role::Receive(ReceiverConfig {
                    host: args.host.unwrap_or(file.host),
                    port: args.port.unwrap_or(file.port),
                    destination: args.destination.unwrap_or(file.destination),
                })
            }
        };

        let transfer = TransferConfig {
            buffer_size: cli.buffer_size.unwrap_or(toml_config.transfer.buffer_size),
            framing: cli.framing.unwrap_or(toml_config.transfer.framing),
            timeout: timeout_from_secs(cli.timeout.unwrap_or(toml_config.transfer.timeout_secs)),
        };

        let config = Config {
            role,
            transfer,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let size = self.transfer.buffer_size;
        if size == 0 || size > MAX_RECORD_LEN {
            return Err(ConfigError::Invalid(format!(
                "buffer_size must be between 1 and {MAX_RECORD_LEN}, got {size}"
            )));
        }
        // A read shorter than the marker can never match it.
        if self.transfer.framing == Framing::Sentinel && size < SENTINEL.len() {
            return Err(ConfigError::Invalid(format!(
                "buffer_size must be at least {} with sentinel framing, got {size}",
                SENTINEL.len()
            )));
        }
        if let Role::Send(ref sender) = self.role {
            if sender.max_concurrent == 0 {
                return Err(ConfigError::Invalid(
                    "max_concurrent must be at least 1".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}
