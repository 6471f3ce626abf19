use config::{Config, ConfigError, Environment, File};
use emittance_scanner::acr::protocol;
use emittance_scanner::scan::GAINS;
use emittance_scanner::{AcquisitionSettings, Command, MotionConfig};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct AppConfig {
    pub controller: ControllerConfig,
    pub motion: MotionSettings,
    pub acquisition: AcquisitionConfig,
    pub output: OutputConfig,
    pub console: ConsoleConfig,
}

impl AppConfig {
    /// Validate all configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.controller.validate()?;
        self.acquisition
            .to_settings()
            .validate()
            .map_err(|e| ConfigError::Message(format!("Invalid acquisition: {e}")))?;
        Ok(())
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ControllerConfig {
    pub host_ip: String,
    pub port: u16,
    pub connect_timeout_ms: u64,
    /// Motion profile sent once per session
    pub acceleration: f64,
    pub deceleration: f64,
    pub velocity: f64,
    pub stop_ramp: f64,
}

impl ControllerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host_ip.parse::<IpAddr>().is_err() {
            return Err(ConfigError::Message(format!(
                "controller.host_ip must be an IP address, got: {}",
                self.host_ip
            )));
        }
        if self.port == 0 {
            return Err(ConfigError::Message("controller.port must be non-zero".to_string()));
        }
        for (name, value) in [
            ("acceleration", self.acceleration),
            ("deceleration", self.deceleration),
            ("velocity", self.velocity),
            ("stop_ramp", self.stop_ramp),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(ConfigError::Message(format!(
                    "controller.{name} must be positive, got: {value}"
                )));
            }
        }
        Ok(())
    }

    pub fn motion_profile(&self) -> Command {
        protocol::motion_profile(self.acceleration, self.deceleration, self.velocity, self.stop_ramp)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            host_ip: "10.10.100.60".to_string(),
            port: 5002,
            connect_timeout_ms: 3000,
            acceleration: 5.0,
            deceleration: 5.0,
            velocity: 15.0,
            stop_ramp: 100.0,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct MotionSettings {
    /// Extra pause between in-motion polls
    pub poll_interval_ms: u64,
    /// Longest a single move may take; 0 waits indefinitely
    pub move_timeout_secs: u64,
}

impl MotionSettings {
    pub fn to_motion_config(&self) -> MotionConfig {
        MotionConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            move_timeout: (self.move_timeout_secs > 0).then(|| Duration::from_secs(self.move_timeout_secs)),
        }
    }
}

impl Default for MotionSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 0,
            move_timeout_secs: 120,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AcquisitionConfig {
    pub samples: usize,
    pub sample_interval_ms: u64,
    pub settle_delay_ms: u64,
    /// Scan cup amplifier gain in V/A, one of 1e3 ... 1e11
    pub gain: f64,
    pub output_divisor: f64,
    pub output_offset: f64,
}

impl AcquisitionConfig {
    pub fn to_settings(&self) -> AcquisitionSettings {
        AcquisitionSettings {
            samples: self.samples,
            sample_interval: Duration::from_millis(self.sample_interval_ms),
            settle_delay: Duration::from_millis(self.settle_delay_ms),
            gain: self.gain,
            output_divisor: self.output_divisor,
            output_offset: self.output_offset,
        }
    }
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        let settings = AcquisitionSettings::default();
        Self {
            samples: settings.samples,
            sample_interval_ms: settings.sample_interval.as_millis() as u64,
            settle_delay_ms: settings.settle_delay.as_millis() as u64,
            gain: settings.gain,
            output_divisor: settings.output_divisor,
            output_offset: settings.output_offset,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct OutputConfig {
    /// Directory receiving scan data files
    pub data_dir: PathBuf,
    /// Directory receiving variables files
    pub variables_dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            variables_dir: PathBuf::from("."),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ConsoleConfig {
    pub verbosity: String,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            verbosity: "info".to_string(),
        }
    }
}

/// Parse a gain given as `1e8` or as a decade exponent `8`
pub fn parse_gain(text: &str) -> Result<f64, String> {
    let value: f64 = text.trim().parse().map_err(|_| format!("not a number: {text}"))?;
    let gain = if (3.0..=11.0).contains(&value) && value.fract() == 0.0 {
        10f64.powi(value as i32)
    } else {
        value
    };
    if GAINS.contains(&gain) {
        Ok(gain)
    } else {
        Err(format!("{text} is not one of 1e3 ... 1e11 V/A"))
    }
}

/// Load configuration: built-in defaults, then the TOML file, then
/// `EMITTANCE__SECTION__KEY` environment overrides
pub fn load_config(config_path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let mut builder = Config::builder().add_source(Config::try_from(&AppConfig::default())?);

    if let Some(path) = config_path {
        if !path.exists() {
            return Err(ConfigError::Message(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
        builder = builder.add_source(File::from(path));
    } else if Path::new("emittance.toml").exists() {
        builder = builder.add_source(File::with_name("emittance.toml"));
    }

    builder = builder.add_source(
        Environment::with_prefix("EMITTANCE")
            .separator("__")
            .try_parsing(true),
    );

    let app_config = builder.build()?.try_deserialize::<AppConfig>()?;
    app_config.validate()?;

    Ok(app_config)
}
