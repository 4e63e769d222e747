use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use serde::Deserialize;

use tabula_coordination::{CoordinationConfig, InstanceId};
use tabula_engine::DestinationConfig;

use crate::error::ServerError;

#[derive(Parser)]
#[command(name = "tabula-server", about = "Warehouse schema coordination node")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Join the coordination backend and stay registered until Ctrl-C
    Serve(ConfigArgs),
    /// List instances with a fresh heartbeat
    Instances(ConfigArgs),
    /// Print the schema version counter of a table, optionally bumping it
    Version(VersionArgs),
    /// Report whether a table lock is held right now
    LockStatus(KeyArgs),
    /// Reconcile a batch against an in-memory warehouse and print the result
    Plan(PlanArgs),
}

#[derive(Args, Clone, Debug)]
pub struct ConfigArgs {
    /// Path to the TOML config file
    #[arg(long, default_value = "config.toml", env = "CONFIG_PATH")]
    pub config: String,
}

#[derive(Args, Clone, Debug)]
pub struct KeyArgs {
    #[command(flatten)]
    pub config: ConfigArgs,
    /// Destination id
    pub system: String,
    /// Table name
    pub collection: String,
}

#[derive(Args, Clone, Debug)]
pub struct VersionArgs {
    #[command(flatten)]
    pub key: KeyArgs,
    /// Increment the counter before printing it
    #[arg(long)]
    pub bump: bool,
}

#[derive(Args, Clone, Debug)]
pub struct PlanArgs {
    #[command(flatten)]
    pub config: ConfigArgs,
    /// Destination id from `[destinations.<id>]`
    #[arg(long)]
    pub destination: String,
    /// BatchHeader JSON file
    #[arg(long)]
    pub batch: PathBuf,
    /// Current table definition JSON file to start from
    #[arg(long)]
    pub current: Option<PathBuf>,
}

// ---- TOML Config ----

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Name this node registers under. Random when absent.
    #[serde(default)]
    pub instance_id: Option<InstanceId>,
    #[serde(default)]
    pub coordination: CoordinationConfig,
    #[serde(default)]
    pub destinations: BTreeMap<String, DestinationConfig>,
    /// How often `serve` logs the live instance list.
    #[serde(default = "default_report_interval")]
    pub report_interval_secs: u64,
}

fn default_report_interval() -> u64 {
    300
}

impl ServerConfig {
    pub fn load(path: &str) -> Result<Self, ServerError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ServerError::Config { context: "read", detail: format!("'{path}': {e}") })?;
        Self::parse(&content)
            .map_err(|e| ServerError::Config { context: "parse", detail: format!("'{path}': {e}") })
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance_id.clone().unwrap_or_else(InstanceId::random)
    }

    pub fn destination(&self, id: &str) -> Result<&DestinationConfig, ServerError> {
        self.destinations
            .get(id)
            .ok_or_else(|| ServerError::DestinationNotFound(id.to_string()))
    }
}
