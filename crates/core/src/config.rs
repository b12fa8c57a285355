//! Configuration management for Firewatch.
//!
//! Configuration is read from a TOML file. Every section and field has a
//! default, so a partial file (or no file at all) yields a runnable node.
//!
//! ```toml
//! [node]
//! listen_addr = "127.0.0.1:50051"
//!
//! [registry]
//! backend = "sqlite"
//! path = "firewatch.db"
//!
//! [[registry.resources]]
//! id = "dron01"
//! latitude = 0
//! longitude = 0
//!
//! [simulation]
//! time_unit_ms = 1000
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::event::{REGISTRATION_TOPIC, STATUS_TOPIC};
use crate::types::{Coordinate, ResourceRecord};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node: NodeConfig,
    pub registry: RegistryConfig,
    pub broadcast: BroadcastConfig,
    pub simulation: SimulationConfig,
    pub retry: RetryConfig,
    pub ledger: LedgerConfig,
    pub client: ClientConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub listen_addr: String,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:50051".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryBackend {
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub backend: RegistryBackend,
    /// SQLite database file; in-memory database when absent
    pub path: Option<PathBuf>,
    /// Resources upserted into the registry at startup
    pub resources: Vec<ResourceSeed>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            backend: RegistryBackend::Memory,
            path: None,
            resources: vec![
                ResourceSeed::new("dron01", 0, 0),
                ResourceSeed::new("dron02", 50, 50),
                ResourceSeed::new("dron03", -40, 25),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSeed {
    pub id: String,
    pub latitude: i32,
    pub longitude: i32,
}

impl ResourceSeed {
    pub fn new(id: impl Into<String>, latitude: i32, longitude: i32) -> Self {
        Self {
            id: id.into(),
            latitude,
            longitude,
        }
    }

    /// Seeds always start out available
    pub fn to_record(&self) -> ResourceRecord {
        ResourceRecord::available(self.id.clone(), Coordinate::new(self.latitude, self.longitude))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    /// Per-topic ring buffer size
    pub capacity: usize,
    pub status_topic: String,
    pub registration_topic: String,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            status_topic: STATUS_TOPIC.to_string(),
            registration_topic: REGISTRATION_TOPIC.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Wall-clock length of one simulated time unit
    pub time_unit_ms: u64,
    /// Units per travel tick
    pub travel_tick_units: u64,
    /// Units per suppression tick
    pub suppression_tick_units: u64,
    /// Travel time units per unit of distance
    pub travel_factor: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            time_unit_ms: 1000,
            travel_tick_units: 5,
            suppression_tick_units: 2,
            travel_factor: 0.5,
        }
    }
}

impl SimulationConfig {
    pub fn time_unit(&self) -> Duration {
        Duration::from_millis(self.time_unit_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first one
    pub attempts: u32,
    pub first_delay_ms: u64,
    pub max_delay_ms: u64,
    pub factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 4,
            first_delay_ms: 100,
            max_delay_ms: 2000,
            factor: 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub enabled: bool,
    /// SQLite database file; in-memory database when absent
    pub path: Option<PathBuf>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub endpoint: String,
    pub assign_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:50051".to_string(),
            assign_timeout_secs: 10,
        }
    }
}

impl Config {
    /// Load and validate a TOML configuration file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate TOML configuration text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn default_config() -> Self {
        Self::default()
    }

    /// Parsed listen address of the node
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.node.listen_addr.parse().map_err(|e| {
            Error::InvalidConfig(format!(
                "node.listen_addr '{}' is not a socket address: {}",
                self.node.listen_addr, e
            ))
        })
    }

    pub fn validate(&self) -> Result<()> {
        self.listen_addr()?;

        if self.broadcast.capacity == 0 {
            return Err(Error::InvalidConfig(
                "broadcast.capacity must be at least 1".to_string(),
            ));
        }
        if self.broadcast.status_topic.is_empty() || self.broadcast.registration_topic.is_empty() {
            return Err(Error::InvalidConfig(
                "broadcast topic names must not be empty".to_string(),
            ));
        }
        if self.broadcast.status_topic == self.broadcast.registration_topic {
            return Err(Error::InvalidConfig(
                "status and registration topics must differ".to_string(),
            ));
        }

        let sim = &self.simulation;
        if sim.time_unit_ms == 0 || sim.travel_tick_units == 0 || sim.suppression_tick_units == 0 {
            return Err(Error::InvalidConfig(
                "simulation time unit and tick lengths must be positive".to_string(),
            ));
        }
        if !sim.travel_factor.is_finite() || sim.travel_factor < 0.0 {
            return Err(Error::InvalidConfig(format!(
                "simulation.travel_factor must be a non-negative number, got {}",
                sim.travel_factor
            )));
        }

        if self.retry.attempts == 0 {
            return Err(Error::InvalidConfig(
                "retry.attempts must be at least 1".to_string(),
            ));
        }
        if !self.retry.factor.is_finite() || self.retry.factor < 1.0 {
            return Err(Error::InvalidConfig(format!(
                "retry.factor must be >= 1.0, got {}",
                self.retry.factor
            )));
        }

        let mut seen = HashSet::new();
        for seed in &self.registry.resources {
            if seed.id.is_empty() {
                return Err(Error::InvalidConfig(
                    "registry resource ids must not be empty".to_string(),
                ));
            }
            if !seen.insert(seed.id.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate registry resource id '{}'",
                    seed.id
                )));
            }
        }

        if self.client.assign_timeout_secs == 0 {
            return Err(Error::InvalidConfig(
                "client.assign_timeout_secs must be positive".to_string(),
            ));
        }

        Ok(())
    }
}
