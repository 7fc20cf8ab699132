use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Deserialize;

use cluster_memory::MemoryClusterConfig;
use topic_engine::EngineConfig;

use crate::error::ServerError;

#[derive(Parser)]
#[command(name = "topic-lens", about = "Search and tail Kafka topics over HTTP")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the gateway
    Serve(ServeArgs),
}

/// Where topics live.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    /// A Kafka cluster at KAFKA_HOST:KAFKA_PORT.
    Kafka,
    /// An empty in-process log; topics appear on first publish.
    Memory,
}

#[derive(Args, Clone, Debug)]
pub struct ServeArgs {
    #[arg(long, default_value = "127.0.0.1", env = "HOST")]
    pub host: String,
    #[arg(long, default_value_t = 8090, env = "PORT")]
    pub port: u16,
    #[arg(long, default_value = ".", env = "LOG_DIR")]
    pub log_dir: PathBuf,
    /// `STDOUT`, or a file name inside LOG_DIR to append to.
    #[arg(long, default_value = "STDOUT", env = "LOG_FILE")]
    pub log_file: String,
    #[arg(long, default_value = "localhost", env = "KAFKA_HOST")]
    pub kafka_host: String,
    #[arg(long, default_value_t = 9092, env = "KAFKA_PORT")]
    pub kafka_port: u16,
    #[arg(long, value_enum, default_value_t = Backend::Kafka, env = "BACKEND")]
    pub backend: Backend,
    /// Optional TOML file with engine and client tunables.
    #[arg(long, env = "CONFIG_PATH")]
    pub config: Option<PathBuf>,
}

impl ServeArgs {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn brokers(&self) -> String {
        format!("{}:{}", self.kafka_host, self.kafka_port)
    }

    /// Log file path, `None` when logging to stdout.
    pub fn log_path(&self) -> Option<PathBuf> {
        if self.log_file.eq_ignore_ascii_case("STDOUT") {
            None
        } else {
            Some(self.log_dir.join(&self.log_file))
        }
    }
}

// ---- TOML Config ----

#[derive(Debug, Default, Deserialize)]
pub struct ServerConfig {
    #[serde(flatten)]
    pub engine: EngineConfig,
    #[cfg(feature = "kafka")]
    #[serde(default)]
    pub kafka: cluster_kafka::KafkaConfig,
    #[serde(default)]
    pub memory: MemoryClusterConfig,
}

impl ServerConfig {
    /// Read `path`, or fall back to defaults when no file is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ServerError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = std::fs::read_to_string(path).map_err(|e| ServerError::Config {
            context: "read",
            detail: format!("'{}': {e}", path.display()),
        })?;
        toml::from_str(&content).map_err(|e| ServerError::Config {
            context: "parse",
            detail: format!("'{}': {e}", path.display()),
        })
    }
}
