use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::em2::ConnectionConfig;
use crate::formula::Formula;
use crate::types::{AxisRole, SyncMode, TriggerInput, MAX_AXES};

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct AppConfig {
    pub instrument: InstrumentConfig,
    pub acquisition: AcquisitionConfig,
    /// Conversion formula per measurement axis, keyed by axis number.
    #[serde(default)]
    pub formulas: BTreeMap<String, String>,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct InstrumentConfig {
    pub host: String,
    pub port: u16,
    /// External line used in hardware synchronization, e.g. `DIFF_IO_1`
    pub ext_trigger_input: Option<String>,
    pub connect_timeout_ms: u64,
    pub io_timeout_ms: u64,
    pub start_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AcquisitionConfig {
    /// Integration time of one sample, in seconds
    pub integration_time: f64,
    pub repetitions: u64,
    pub sync_mode: SyncMode,
    pub acquisition_mode: Option<String>,
    /// Number of measurement channels in use
    pub channels: u8,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    pub log_level: String,
    /// Directory for JSONL readout records; disabled when unset
    pub data_path: Option<String>,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5025,
            ext_trigger_input: None,
            connect_timeout_ms: 1000,
            io_timeout_ms: 1000,
            start_timeout_ms: 3000,
        }
    }
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            integration_time: 0.1,
            repetitions: 1,
            sync_mode: SyncMode::SoftwareTrigger,
            acquisition_mode: None,
            channels: MAX_AXES - 1,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            data_path: None,
        }
    }
}

impl InstrumentConfig {
    pub fn connection_config(&self) -> ConnectionConfig {
        let io_timeout = Duration::from_millis(self.io_timeout_ms);
        ConnectionConfig {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            read_timeout: io_timeout,
            write_timeout: io_timeout,
        }
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    pub fn trigger_input(&self) -> Result<Option<TriggerInput>, ConfigError> {
        self.ext_trigger_input
            .as_deref()
            .map(|text| {
                text.parse::<TriggerInput>().map_err(|e| {
                    ConfigError::Message(format!("Invalid ext_trigger_input: {e}"))
                })
            })
            .transpose()
    }
}

impl AcquisitionConfig {
    /// Axis numbers of the configured controller, master first.
    pub fn axes(&self) -> Vec<u8> {
        (1..=self.channels.saturating_add(1)).collect()
    }
}

impl AppConfig {
    /// Formulas parsed and mapped to axis numbers.
    pub fn axis_formulas(&self) -> Result<Vec<(u8, String)>, ConfigError> {
        self.formulas
            .iter()
            .map(|(key, text)| {
                let axis: u8 = key
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::Message(format!("Invalid formula axis '{key}'")))?;
                match AxisRole::of(axis) {
                    Ok(AxisRole::Measurement { .. }) => {}
                    _ => {
                        return Err(ConfigError::Message(format!(
                            "Formula axis {axis} is not a measurement axis"
                        )));
                    }
                }
                Formula::parse(text).map_err(|e| {
                    ConfigError::Message(format!("Invalid formula for axis {axis}: {e}"))
                })?;
                Ok((axis, text.clone()))
            })
            .collect()
    }

    /// Validate all configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.instrument.host.trim().is_empty() {
            return Err(ConfigError::Message("instrument.host is empty".to_string()));
        }
        if self.instrument.port == 0 {
            return Err(ConfigError::Message("instrument.port must be > 0".to_string()));
        }
        if !(1..MAX_AXES).contains(&self.acquisition.channels) {
            return Err(ConfigError::Message(format!(
                "acquisition.channels must be in 1..={}",
                MAX_AXES - 1
            )));
        }
        if !self.acquisition.integration_time.is_finite()
            || self.acquisition.integration_time < 0.0
        {
            return Err(ConfigError::Message(
                "acquisition.integration_time must be a non-negative number".to_string(),
            ));
        }

        let input = self.instrument.trigger_input()?;
        if self.acquisition.sync_mode.needs_trigger_input() && input.is_none() {
            return Err(ConfigError::Message(format!(
                "sync_mode {} needs instrument.ext_trigger_input",
                self.acquisition.sync_mode
            )));
        }

        self.axis_formulas()?;
        Ok(())
    }
}

/// Load configuration from file with layered fallbacks
pub fn load_config(config_path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let mut builder = Config::builder().add_source(Config::try_from(&AppConfig::default())?);

    if let Some(path) = config_path {
        if path.exists() {
            builder = builder.add_source(File::from(path));
        } else {
            return Err(ConfigError::Message(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
    } else {
        let possible_paths = ["rusty_em.toml", "config.toml"];

        for path in &possible_paths {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
                break;
            }
        }
    }

    // e.g. RUSTY_EM_INSTRUMENT__HOST
    builder = builder.add_source(
        Environment::with_prefix("RUSTY_EM")
            .separator("__")
            .try_parsing(true),
    );

    let config = builder.build()?;
    let config = config.try_deserialize::<AppConfig>()?;
    config.validate()?;
    Ok(config)
}

/// Load configuration, falling back to defaults on any error
pub fn load_config_or_default(config_path: Option<&Path>) -> AppConfig {
    match load_config(config_path) {
        Ok(config) => {
            log::info!("Configuration loaded successfully");
            config
        }
        Err(e) => {
            log::warn!("Failed to load config ({}), using defaults", e);
            AppConfig::default()
        }
    }
}
