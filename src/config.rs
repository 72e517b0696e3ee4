//! Application configuration
//!
//! Loaded from a TOML file (every field has a default), with a few env overrides.

use serde::{Deserialize, Serialize};
use std::{path::Path, path::PathBuf, time::Duration};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub drift: DriftConfig,
    #[serde(default)]
    pub constant: ConstantConfig,
    #[serde(default)]
    pub broadcast: BroadcastConfig,
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default = "default_instruments")]
    pub instruments: Vec<InstrumentDescriptor>,
}

impl AppConfig {
    /// Load from TOML file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load from `COINPUSHER_CONFIG` (or `coinpusher.toml`), then apply env overrides.
    pub fn from_env() -> Self {
        let path =
            std::env::var("COINPUSHER_CONFIG").unwrap_or_else(|_| "coinpusher.toml".to_string());

        let mut config = Self::load(&path).unwrap_or_else(|e| {
            tracing::debug!("Using default coinpusher config ({}): {}", path, e);
            Self::default_with_instruments()
        });

        if let Some(port) = std::env::var("PORT").ok().and_then(|v| v.parse().ok()) {
            config.server.port = port;
        }
        if let Ok(dir) = std::env::var("STREAMS_DIR") {
            if !dir.trim().is_empty() {
                config.storage.streams_dir = PathBuf::from(dir);
            }
        }
        if let Ok(dir) = std::env::var("NETS_DIR") {
            if !dir.trim().is_empty() {
                config.storage.nets_dir = PathBuf::from(dir);
            }
        }

        config
    }

    pub fn default_with_instruments() -> Self {
        Self {
            instruments: default_instruments(),
            ..Self::default()
        }
    }

    pub fn instrument(&self, symbol: &str) -> Option<&InstrumentDescriptor> {
        self.instruments.iter().find(|i| i.symbol == symbol)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    3333
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: default_port() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding one append-only `<symbol>.fs` log per instrument
    #[serde(default = "default_streams_dir")]
    pub streams_dir: PathBuf,
    /// Directory holding one `<symbol>.nn` model per instrument
    #[serde(default = "default_nets_dir")]
    pub nets_dir: PathBuf,
}

fn default_streams_dir() -> PathBuf {
    PathBuf::from("streams")
}

fn default_nets_dir() -> PathBuf {
    PathBuf::from("nets")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            streams_dir: default_streams_dir(),
            nets_dir: default_nets_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// In-memory dataset capacity (M)
    #[serde(default = "default_dataset_capacity")]
    pub dataset_capacity: usize,
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
    /// Flush only once at least this many trades are buffered
    #[serde(default = "default_min_flush_batch")]
    pub min_flush_batch: usize,
}

fn default_dataset_capacity() -> usize {
    50_000
}

fn default_flush_interval_secs() -> u64 {
    12
}

fn default_min_flush_batch() -> usize {
    1
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            dataset_capacity: default_dataset_capacity(),
            flush_interval_secs: default_flush_interval_secs(),
            min_flush_batch: default_min_flush_batch(),
        }
    }
}

impl IngestConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftConfig {
    /// Sliding window length (W), also the model input size
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    /// Seconds between two forecast steps
    #[serde(default = "default_step_secs")]
    pub step_secs: f64,
    /// Fraction of the horizon averaged into the future value
    #[serde(default = "default_tail_fraction")]
    pub tail_fraction: f64,
    /// Pending + resolved records kept per instrument
    #[serde(default = "default_max_records")]
    pub max_records: usize,
    /// Performance samples kept for subscriber bootstrap (K)
    #[serde(default = "default_performance_history")]
    pub performance_history: usize,
}

fn default_window_size() -> usize {
    10
}

fn default_step_secs() -> f64 {
    5.0
}

fn default_tail_fraction() -> f64 {
    0.2
}

fn default_max_records() -> usize {
    500
}

fn default_performance_history() -> usize {
    1_000
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            step_secs: default_step_secs(),
            tail_fraction: default_tail_fraction(),
            max_records: default_max_records(),
            performance_history: default_performance_history(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstantConfig {
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
    /// Points kept per instrument
    #[serde(default = "default_constant_capacity")]
    pub capacity: usize,
}

fn default_refresh_interval_secs() -> u64 {
    60
}

fn default_constant_capacity() -> usize {
    500
}

impl Default for ConstantConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: default_refresh_interval_secs(),
            capacity: default_constant_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastConfig {
    /// Trades per instrument pushed to a new subscriber
    #[serde(default = "default_bootstrap_trades")]
    pub bootstrap_trades: usize,
    /// Delay before constant predictions are pushed to a new subscriber
    #[serde(default = "default_bootstrap_grace_ms")]
    pub bootstrap_grace_ms: u64,
    #[serde(default = "default_liveness_interval_secs")]
    pub liveness_interval_secs: u64,
    /// Outbound messages queued per subscriber before drops
    #[serde(default = "default_subscriber_queue")]
    pub subscriber_queue: usize,
}

fn default_bootstrap_trades() -> usize {
    64
}

fn default_bootstrap_grace_ms() -> u64 {
    5_000
}

fn default_liveness_interval_secs() -> u64 {
    3
}

fn default_subscriber_queue() -> usize {
    1_024
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            bootstrap_trades: default_bootstrap_trades(),
            bootstrap_grace_ms: default_bootstrap_grace_ms(),
            liveness_interval_secs: default_liveness_interval_secs(),
            subscriber_queue: default_subscriber_queue(),
        }
    }
}

impl BroadcastConfig {
    pub fn bootstrap_grace(&self) -> Duration {
        Duration::from_millis(self.bootstrap_grace_ms)
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_secs(self.liveness_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    #[serde(default = "default_feed_url")]
    pub url: String,
}

fn default_feed_url() -> String {
    "wss://ws.bitstamp.net".to_string()
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self { url: default_feed_url() }
    }
}

/// A tracked instrument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentDescriptor {
    pub symbol: String,
    /// Prices are divided by this before prediction and multiplied back after
    #[serde(default = "default_scale")]
    pub scale: f64,
    /// Feed topic; defaults to the symbol
    #[serde(default)]
    pub topic: Option<String>,
}

fn default_scale() -> f64 {
    1.0
}

impl InstrumentDescriptor {
    pub fn new(symbol: &str, scale: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            scale,
            topic: None,
        }
    }

    pub fn topic(&self) -> &str {
        self.topic.as_deref().unwrap_or(&self.symbol)
    }

    pub fn normalize(&self, price: f64) -> f64 {
        price / self.scale
    }

    pub fn denormalize(&self, value: f64) -> f64 {
        value * self.scale
    }
}

fn default_instruments() -> Vec<InstrumentDescriptor> {
    vec![
        InstrumentDescriptor::new("etheur", 1_000.0),
        InstrumentDescriptor::new("btceur", 10_000.0),
        InstrumentDescriptor::new("ltceur", 100.0),
        InstrumentDescriptor::new("xrpeur", 1.0),
        InstrumentDescriptor::new("eurusd", 1.0),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.server.port, 3333);
        assert_eq!(config.drift.window_size, 10);
        assert_eq!(config.ingest.flush_interval_secs, 12);
        assert_eq!(config.instruments.len(), 5);
        assert_eq!(config.instrument("btceur").map(|i| i.scale), Some(10_000.0));
    }

    #[test]
    fn test_partial_toml() {
        let raw = r#"
            [drift]
            window_size = 20

            [[instruments]]
            symbol = "etheur"
            scale = 1000.0
            topic = "etheur_live"
        "#;
        let config: AppConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.drift.window_size, 20);
        assert_eq!(config.drift.step_secs, 5.0);
        assert_eq!(config.instruments.len(), 1);
        assert_eq!(config.instruments[0].topic(), "etheur_live");
    }

    #[test]
    fn test_normalization_roundtrip() {
        let eth = InstrumentDescriptor::new("etheur", 1_000.0);
        assert_eq!(eth.normalize(2_500.0), 2.5);
        assert_eq!(eth.denormalize(2.5), 2_500.0);
        assert_eq!(eth.topic(), "etheur");
    }
}
