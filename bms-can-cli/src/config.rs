//! Configuration loading and validation
//!
//! The file is read once at startup. The store credential is never part of the
//! file: only the name of the environment variable holding it is.

use anyhow::{bail, Context, Result};
use bms_can_core::writer::{Credential, StoreConfig};
use bms_can_core::{
    AdapterConfig, BatchConfig, BusConfig, OperatingMode, PipelineConfig, RetryConfig, SignalTable,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main application configuration (loaded from config.toml)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    pub adapter: AdapterConfig,
    #[serde(default)]
    pub bus: BusConfig,
    pub vehicle: VehicleConfig,
    #[serde(default)]
    pub decode: DecodeConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    pub store: StoreSection,
    #[serde(default)]
    pub pipeline: PipelineSection,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VehicleConfig {
    pub car_id: String,
    /// Static `source` tag added to every line
    #[serde(default)]
    pub source_tag: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DecodeConfig {
    pub mode: OperatingMode,
    /// Signal table file (.toml or .dbc); the Orion layout is used when absent
    pub table: Option<PathBuf>,
    pub orion_id: u32,
    pub orion_extended: bool,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            mode: OperatingMode::Raw,
            table: None,
            orion_id: 0x6B0,
            orion_extended: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreSection {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    pub database: String,
    /// Environment variable holding the bearer token
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_endpoint() -> String {
    "http://127.0.0.1:8181".to_string()
}

fn default_token_env() -> String {
    "INFLUXDB3_AUTH_TOKEN".to_string()
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

impl StoreSection {
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            endpoint: self.endpoint.clone(),
            database: self.database.clone(),
            request_timeout_ms: self.request_timeout_ms,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineSection {
    pub read_timeout_ms: u64,
    pub reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    pub drain_timeout_ms: u64,
    pub stats_interval_s: u64,
}

impl Default for PipelineSection {
    fn default() -> Self {
        let defaults = PipelineConfig::new("");
        Self {
            read_timeout_ms: defaults.read_timeout_ms,
            reconnect_attempts: defaults.reconnect_attempts,
            reconnect_delay_ms: defaults.reconnect_delay_ms,
            drain_timeout_ms: defaults.drain_timeout_ms,
            stats_interval_s: defaults.stats_interval_s,
        }
    }
}

/// Command-line overrides applied on top of the file
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub car_id: Option<String>,
    pub mode: Option<OperatingMode>,
    pub port: Option<String>,
}

impl AppConfig {
    pub fn apply_overrides(&mut self, overrides: Overrides) {
        if let Some(car_id) = overrides.car_id {
            self.vehicle.car_id = car_id;
        }
        if let Some(mode) = overrides.mode {
            self.decode.mode = mode;
        }
        if let Some(port) = overrides.port {
            self.adapter = self.adapter.clone().with_port(port);
        }
    }

    /// Reject configurations that cannot work
    pub fn validate(&self) -> Result<()> {
        if self.vehicle.car_id.trim().is_empty() {
            bail!("[vehicle] car_id must not be empty");
        }
        if self.vehicle.source_tag.as_deref().is_some_and(|tag| tag.trim().is_empty()) {
            bail!("[vehicle] source_tag must not be empty; remove it to omit the tag");
        }
        if self.store.database.trim().is_empty() {
            bail!("[store] database must not be empty");
        }
        if !(self.store.endpoint.starts_with("http://") || self.store.endpoint.starts_with("https://")) {
            bail!("[store] endpoint must be an http:// or https:// URL, got {:?}", self.store.endpoint);
        }
        if self.store.token_env.trim().is_empty() {
            bail!("[store] token_env must name an environment variable");
        }
        if self.batch.max_batch_size == 0 {
            bail!("[batch] max_batch_size must be at least 1");
        }
        if self.batch.max_batch_age_ms == 0 {
            bail!("[batch] max_batch_age_ms must be at least 1");
        }
        if self.retry.retry_ceiling == 0 {
            bail!("[retry] retry_ceiling must be at least 1");
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            bail!("[retry] initial_backoff_ms must not exceed max_backoff_ms");
        }
        if self.pipeline.read_timeout_ms == 0 {
            bail!("[pipeline] read_timeout_ms must be at least 1");
        }
        Ok(())
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        let mut config = PipelineConfig::new(self.vehicle.car_id.clone())
            .with_mode(self.decode.mode)
            .with_retry(self.retry)
            .with_read_timeout(Duration::from_millis(self.pipeline.read_timeout_ms))
            .with_reconnect(
                self.pipeline.reconnect_attempts,
                Duration::from_millis(self.pipeline.reconnect_delay_ms),
            )
            .with_drain_timeout(Duration::from_millis(self.pipeline.drain_timeout_ms));
        config.batch = self.batch;
        config.stats_interval_s = self.pipeline.stats_interval_s;
        if let Some(tag) = &self.vehicle.source_tag {
            config = config.with_source_tag(tag.clone());
        }
        config
    }

    /// Read the store credential from the configured environment variable
    pub fn resolve_credential(&self) -> Result<Credential> {
        match Credential::from_env(&self.store.token_env) {
            Some(credential) => Ok(credential),
            None => bail!(
                "Store credential missing: environment variable {} is not set or empty",
                self.store.token_env
            ),
        }
    }

    /// Signal table for decoded modes; None in raw mode
    pub fn load_signal_table(&self) -> Result<Option<SignalTable>> {
        if !self.decode.mode.decodes() {
            return Ok(None);
        }

        let table = match &self.decode.table {
            Some(path) => SignalTable::load(path)
                .with_context(|| format!("Failed to load signal table: {:?}", path))?,
            None => {
                log::info!(
                    "No signal table configured, using built-in Orion telemetry layout at 0x{:X}",
                    self.decode.orion_id
                );
                SignalTable::orion_telemetry(self.decode.orion_id, self.decode.orion_extended)
                    .context("Invalid Orion telemetry id")?
            }
        };

        let stats = table.stats();
        log::info!(
            "Signal table {}: {} signals across {} ids",
            table.version(),
            stats.num_signals,
            stats.num_ids
        );
        Ok(Some(table))
    }
}

/// Load and validate configuration from a TOML file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let config: AppConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    config
        .validate()
        .with_context(|| format!("Invalid config file: {:?}", path))?;

    Ok(config)
}

/// Annotated configuration printed by `example-config`
pub const EXAMPLE_CONFIG: &str = r#"# BMS CAN logger configuration

[adapter]
kind = "slcan"              # slcan | socketcan | replay
port = "/dev/ttyUSB0"
serial_baud = 115200
listen_only = true
# kind = "socketcan"
# interface = "can0"
# kind = "replay"
# path = "capture.csv"
# realtime = false

[bus]
bitrate = 500000

[vehicle]
car_id = "car1"
source_tag = "candapter"

[decode]
mode = "raw"                # raw | decoded | both
# table = "signals.toml"    # .toml or .dbc; built-in Orion layout when absent
orion_id = 0x6B0
orion_extended = false

[batch]
max_batch_size = 200
max_batch_age_ms = 1000
max_buffered_records = 50000

[retry]
retry_ceiling = 5
initial_backoff_ms = 250
max_backoff_ms = 10000

[store]
endpoint = "http://127.0.0.1:8181"
database = "bms"
token_env = "INFLUXDB3_AUTH_TOKEN"
request_timeout_ms = 10000

[pipeline]
read_timeout_ms = 1000
reconnect_attempts = 5
reconnect_delay_ms = 2000
drain_timeout_ms = 5000
stats_interval_s = 60
"#;
