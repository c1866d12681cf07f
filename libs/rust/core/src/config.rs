//! Server and trainer configuration.
//!
//! `ServerConfig` is layered with the `config` crate: built-in defaults, an optional file,
//! then `FEDROUND__*` environment variables. Unknown keys are rejected and the whole
//! structure is validated once, before any client connects.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use fedround_resilience::RetryConfig;
use serde::{Deserialize, Serialize};

use crate::error::{FlError, Result};

pub const ENV_PREFIX: &str = "FEDROUND";

/// Options forwarded to the Local Trainer with every fit/evaluate instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrainConfig {
    pub local_epochs: u32,
    pub learning_rate: f64,
    pub batch_size: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self { local_epochs: 1, learning_rate: 0.01, batch_size: 32 }
    }
}

impl TrainConfig {
    /// Build from a loose key/value map; keys outside the recognized set are an error.
    pub fn from_map(map: BTreeMap<String, serde_json::Value>) -> Result<Self> {
        let value = serde_json::Value::Object(map.into_iter().collect());
        let cfg: TrainConfig = serde_json::from_value(value).map_err(|e| FlError::config(format!("train config: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.local_epochs == 0 {
            return Err(FlError::config("local_epochs must be at least 1"));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(FlError::config(format!("learning_rate must be positive, got {}", self.learning_rate)));
        }
        if self.batch_size == 0 {
            return Err(FlError::config("batch_size must be at least 1"));
        }
        Ok(())
    }
}

/// Where a Local Trainer runs its computation. Passed explicitly on every call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    #[default]
    Cpu,
    Cuda(u32),
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => f.write_str("cpu"),
            Device::Cuda(i) => write!(f, "cuda:{i}"),
        }
    }
}

impl FromStr for Device {
    type Err = FlError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cpu" => Ok(Device::Cpu),
            "cuda" => Ok(Device::Cuda(0)),
            other => other
                .strip_prefix("cuda:")
                .and_then(|i| i.parse().ok())
                .map(Device::Cuda)
                .ok_or_else(|| FlError::config(format!("unknown device {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub num_rounds: u64,
    pub start_round: u64,
    pub fraction_fit: f64,
    pub fraction_evaluate: f64,
    pub min_fit_clients: usize,
    pub min_evaluate_clients: usize,
    pub min_available_clients: usize,
    pub fit_timeout_ms: u64,
    pub evaluate_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub client_wait_timeout_ms: Option<u64>,
    pub max_round_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub selection_seed: Option<u64>,
    pub fit_config: TrainConfig,
    pub evaluate_config: TrainConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            num_rounds: 5,
            start_round: 1,
            fraction_fit: 1.0,
            fraction_evaluate: 1.0,
            min_fit_clients: 1,
            min_evaluate_clients: 1,
            min_available_clients: 1,
            fit_timeout_ms: 600_000,
            evaluate_timeout_ms: 300_000,
            poll_interval_ms: 1_000,
            client_wait_timeout_ms: None,
            max_round_retries: 3,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 30_000,
            selection_seed: None,
            fit_config: TrainConfig::default(),
            evaluate_config: TrainConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Defaults, then `file` (any format the `config` crate recognizes), then environment.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let defaults = config::Config::try_from(&ServerConfig::default()).map_err(|e| FlError::config(e.to_string()))?;
        let mut builder = config::Config::builder().add_source(defaults);
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX).prefix_separator("__").separator("__").try_parsing(true),
        );
        let cfg: ServerConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| FlError::config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_rounds == 0 {
            return Err(FlError::config("num_rounds must be at least 1"));
        }
        if self.start_round.checked_add(self.num_rounds - 1).is_none() {
            return Err(FlError::config(format!(
                "start_round ({}) plus num_rounds ({}) overflows the round counter",
                self.start_round, self.num_rounds
            )));
        }
        if !(self.fraction_fit > 0.0 && self.fraction_fit <= 1.0) {
            return Err(FlError::config(format!("fraction_fit must be in (0, 1], got {}", self.fraction_fit)));
        }
        if !(0.0..=1.0).contains(&self.fraction_evaluate) {
            return Err(FlError::config(format!("fraction_evaluate must be in [0, 1], got {}", self.fraction_evaluate)));
        }
        if self.min_available_clients == 0 {
            return Err(FlError::config("min_available_clients must be at least 1"));
        }
        if self.min_fit_clients > self.min_available_clients {
            return Err(FlError::config(format!(
                "min_fit_clients ({}) exceeds min_available_clients ({})",
                self.min_fit_clients, self.min_available_clients
            )));
        }
        if self.min_evaluate_clients > self.min_available_clients {
            return Err(FlError::config(format!(
                "min_evaluate_clients ({}) exceeds min_available_clients ({})",
                self.min_evaluate_clients, self.min_available_clients
            )));
        }
        if self.fit_timeout_ms == 0 || self.evaluate_timeout_ms == 0 || self.poll_interval_ms == 0 {
            return Err(FlError::config("timeouts and poll interval must be positive"));
        }
        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            return Err(FlError::config("retry_base_delay_ms exceeds retry_max_delay_ms"));
        }
        self.fit_config.validate()?;
        self.evaluate_config.validate()?;
        Ok(())
    }

    pub fn fit_timeout(&self) -> Duration {
        Duration::from_millis(self.fit_timeout_ms)
    }

    pub fn evaluate_timeout(&self) -> Duration {
        Duration::from_millis(self.evaluate_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn client_wait_timeout(&self) -> Option<Duration> {
        self.client_wait_timeout_ms.map(Duration::from_millis)
    }

    pub fn last_round(&self) -> u64 {
        self.start_round.saturating_add(self.num_rounds.saturating_sub(1))
    }

    pub fn round_retry(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_round_retries as usize,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            jitter: 0.0,
        }
    }
}
