//! Configuration management for circuit-sidecar.
//!
//! Configuration is read once at startup and handed to the core as plain
//! values. Sources are applied in order: defaults → TOML file → command-line
//! arguments and `MGR_*` environment variables, with later sources overriding
//! earlier ones.
//!
//! # Configuration Flow
//!
//! ```text
//!     ┌─────────────────┐
//!     │ Config::default │ ◄── Sensible defaults
//!     └────────┬────────┘
//!              │
//!              ▼
//!     ┌─────────────────┐     ┌──────────────────────┐
//!     │ Config file     │ ◄───│ circuit-sidecar.conf │  (TOML)
//!     │ exists?         │     │ or --config          │
//!     └────────┬────────┘     └──────────────────────┘
//!              │
//!              ▼
//!     ┌─────────────────┐     ┌─────────────────┐
//!     │ Apply CLI / env │ ◄───│ --control-port  │
//!     │ (override)      │     │ MGR_HOPCOUNT .. │
//!     └────────┬────────┘     └─────────────────┘
//!              │
//!              ▼
//!     ┌─────────────────┐
//!     │ Resolve host,   │
//!     │ validate        │
//!     └─────────────────┘
//! ```
//!
//! # Example Configuration File
//!
//! ```toml
//! control_ip = "127.0.0.1"
//! control_port = 9051
//! cookie_path = "/var/lib/anon/control_auth_cookie"
//!
//! loglevel = "notice"
//! # logfile = ":syslog:"
//!
//! hop_count = 3
//! exit_countries = []        # empty = AUTO
//! targets = []               # empty = built-in probe hosts
//! min_circuits = 1
//! max_circuits = 3
//!
//! [cache]
//! file = "/root/.anon-cache/ip-country-cache.json"
//! refresh_interval_secs = 10
//! country_ttl_secs = 600
//! batch_size = 20
//! sweep_batch_size = 10
//! sweep_pacing_ms = 200
//! sweep_delay_secs = 10
//!
//! [rotation]
//! enabled = true
//! interval_secs = 600
//! variance_percent = 20
//! ```

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, ToSocketAddrs};
use std::path::PathBuf;

use crate::error::{Error, Result};

/// Log level for sidecar logging.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Debug level - most verbose.
    Debug,
    /// Info level.
    Info,
    /// Notice level - default.
    #[default]
    Notice,
    /// Warning level.
    Warn,
    /// Error level - least verbose.
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Notice => write!(f, "NOTICE"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "NOTICE" => Ok(LogLevel::Notice),
            "WARN" | "WARNING" => Ok(LogLevel::Warn),
            "ERROR" | "ERR" => Ok(LogLevel::Error),
            _ => Err(Error::Config(format!("invalid log level: {}", s))),
        }
    }
}

/// Country cache and circuit cache settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheConfig {
    /// Path of the persisted address → country file.
    #[serde(default = "default_cache_file")]
    pub file: PathBuf,
    /// Period of the circuit cache refresh cycle.
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
    /// Freshness window for country resolutions.
    #[serde(default = "default_country_ttl_secs")]
    pub country_ttl_secs: u64,
    /// Concurrent lookups per batch for on-demand batch resolution.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Concurrent lookups per batch for the background sweep.
    #[serde(default = "default_sweep_batch_size")]
    pub sweep_batch_size: usize,
    /// Pause between background sweep batches.
    #[serde(default = "default_sweep_pacing_ms")]
    pub sweep_pacing_ms: u64,
    /// Delay between startup and the background sweep.
    #[serde(default = "default_sweep_delay_secs")]
    pub sweep_delay_secs: u64,
}

fn default_cache_file() -> PathBuf {
    PathBuf::from("/root/.anon-cache/ip-country-cache.json")
}
fn default_refresh_interval_secs() -> u64 {
    10
}
fn default_country_ttl_secs() -> u64 {
    600
}
fn default_batch_size() -> usize {
    20
}
fn default_sweep_batch_size() -> usize {
    10
}
fn default_sweep_pacing_ms() -> u64 {
    200
}
fn default_sweep_delay_secs() -> u64 {
    10
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            file: default_cache_file(),
            refresh_interval_secs: default_refresh_interval_secs(),
            country_ttl_secs: default_country_ttl_secs(),
            batch_size: default_batch_size(),
            sweep_batch_size: default_sweep_batch_size(),
            sweep_pacing_ms: default_sweep_pacing_ms(),
            sweep_delay_secs: default_sweep_delay_secs(),
        }
    }
}

/// Initial automatic rotation settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RotationSettings {
    /// Whether automatic rotation starts armed.
    #[serde(default = "default_rotation_enabled")]
    pub enabled: bool,
    /// Base interval between automatic rebuilds.
    #[serde(default = "default_rotation_interval_secs")]
    pub interval_secs: u64,
    /// Uniform jitter applied to the base interval, in percent.
    #[serde(default = "default_rotation_variance_percent")]
    pub variance_percent: u8,
}

fn default_rotation_enabled() -> bool {
    true
}
fn default_rotation_interval_secs() -> u64 {
    600
}
fn default_rotation_variance_percent() -> u8 {
    20
}

impl Default for RotationSettings {
    fn default() -> Self {
        Self {
            enabled: default_rotation_enabled(),
            interval_secs: default_rotation_interval_secs(),
            variance_percent: default_rotation_variance_percent(),
        }
    }
}

/// Main configuration for circuit-sidecar.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Control port host (IP or hostname).
    #[serde(default = "default_control_ip")]
    pub control_ip: String,
    /// Control port number.
    #[serde(default = "default_control_port")]
    pub control_port: u16,
    /// Path of the authentication cookie.
    #[serde(default = "default_cookie_path")]
    pub cookie_path: PathBuf,
    /// Log level.
    #[serde(default)]
    pub loglevel: LogLevel,
    /// Log destination (`None` = stdout, `":syslog:"` = syslog).
    #[serde(default)]
    pub logfile: Option<String>,
    /// Startup attempts before giving up (`None` = retry forever).
    #[serde(default)]
    pub retry_limit: Option<u32>,
    /// Default hop count for built circuits (2 or 3).
    #[serde(default = "default_hop_count")]
    pub hop_count: u8,
    /// Default exit countries, lowercase. Empty means AUTO.
    #[serde(default)]
    pub exit_countries: Vec<String>,
    /// Target addresses circuits are kept ready for.
    #[serde(default)]
    pub targets: Vec<String>,
    /// Minimum circuits per target.
    #[serde(default = "default_min_circuits")]
    pub min_circuits: u32,
    /// Maximum circuits per target.
    #[serde(default = "default_max_circuits")]
    pub max_circuits: u32,
    /// Cache settings.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Rotation settings.
    #[serde(default)]
    pub rotation: RotationSettings,
}

fn default_control_ip() -> String {
    "127.0.0.1".to_string()
}
fn default_control_port() -> u16 {
    9051
}
fn default_cookie_path() -> PathBuf {
    PathBuf::from("/var/lib/anon/control_auth_cookie")
}
fn default_hop_count() -> u8 {
    3
}
fn default_min_circuits() -> u32 {
    1
}
fn default_max_circuits() -> u32 {
    3
}

impl Default for Config {
    fn default() -> Self {
        Self {
            control_ip: default_control_ip(),
            control_port: default_control_port(),
            cookie_path: default_cookie_path(),
            loglevel: LogLevel::default(),
            logfile: None,
            retry_limit: None,
            hop_count: default_hop_count(),
            exit_countries: Vec::new(),
            targets: Vec::new(),
            min_circuits: default_min_circuits(),
            max_circuits: default_max_circuits(),
            cache: CacheConfig::default(),
            rotation: RotationSettings::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| Error::Config(e.to_string()))
    }

    /// Serialize configuration to TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first invalid value.
    pub fn validate(&self) -> Result<()> {
        if self.hop_count != 2 && self.hop_count != 3 {
            return Err(Error::Config("hop_count must be 2 or 3".to_string()));
        }
        if self.min_circuits == 0 {
            return Err(Error::Config("min_circuits must be at least 1".to_string()));
        }
        if self.min_circuits > self.max_circuits {
            return Err(Error::Config(
                "min_circuits must be <= max_circuits".to_string(),
            ));
        }
        if let Some(cc) = self
            .exit_countries
            .iter()
            .find(|cc| !is_valid_country_code(cc))
        {
            return Err(Error::Config(format!("invalid exit country: {}", cc)));
        }
        if self.rotation.interval_secs < 60 {
            return Err(Error::Config(
                "rotation interval_secs must be at least 60".to_string(),
            ));
        }
        if self.rotation.variance_percent > 80 {
            return Err(Error::Config(
                "rotation variance_percent must be <= 80".to_string(),
            ));
        }
        if self.cache.batch_size == 0 || self.cache.sweep_batch_size == 0 {
            return Err(Error::Config("batch sizes must be positive".to_string()));
        }
        if self.cache.refresh_interval_secs == 0 {
            return Err(Error::Config(
                "refresh_interval_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolve a hostname in `control_ip` to an IP address.
    pub fn resolve_control_ip(&mut self) -> Result<()> {
        if self.control_ip.parse::<IpAddr>().is_err() {
            let addr = format!("{}:0", self.control_ip)
                .to_socket_addrs()
                .map_err(|e| {
                    Error::Config(format!(
                        "failed to resolve hostname {}: {}",
                        self.control_ip, e
                    ))
                })?
                .next()
                .ok_or_else(|| {
                    Error::Config(format!(
                        "no addresses found for hostname {}",
                        self.control_ip
                    ))
                })?;
            self.control_ip = addr.ip().to_string();
        }
        Ok(())
    }
}

/// Returns `true` for a two-letter ASCII country code.
pub fn is_valid_country_code(code: &str) -> bool {
    code.len() == 2 && code.chars().all(|c| c.is_ascii_alphabetic())
}

/// Splits a comma-separated list, trimming and dropping empty items.
fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

/// Command-line arguments for circuit-sidecar.
///
/// Every connection and pool option can also come from the `MGR_*`
/// environment variables listed in each option's help.
#[derive(Parser, Debug)]
#[command(name = "circuit-sidecar")]
#[command(about = "Live, enriched view of anonymity-network circuits")]
#[command(version)]
pub struct CliArgs {
    /// Path to configuration file.
    #[arg(
        long = "config",
        env = "MGR_CONFIG",
        default_value = "circuit-sidecar.conf"
    )]
    pub config_file: PathBuf,

    /// Write default configuration to this file and exit.
    #[arg(long = "generate_config")]
    pub generate_config: Option<PathBuf>,

    /// Log verbosity: DEBUG, INFO, NOTICE, WARN, ERROR.
    #[arg(long)]
    pub loglevel: Option<String>,

    /// Log to file instead of stdout (":syslog:" for syslog).
    #[arg(long)]
    pub logfile: Option<String>,

    /// Control port host.
    #[arg(long, env = "MGR_CONTROL_HOST")]
    pub control_ip: Option<String>,

    /// Control port number.
    #[arg(long, env = "MGR_CONTROL_PORT")]
    pub control_port: Option<u16>,

    /// Path of the control port authentication cookie.
    #[arg(long, env = "MGR_COOKIE_PATH")]
    pub cookie_path: Option<PathBuf>,

    /// Default hop count (2 or 3).
    #[arg(long, env = "MGR_HOPCOUNT")]
    pub hop_count: Option<u8>,

    /// Comma-separated default exit countries (empty = AUTO).
    #[arg(long, env = "MGR_EXIT_COUNTRIES")]
    pub exit_countries: Option<String>,

    /// Comma-separated target addresses.
    #[arg(long, env = "MGR_TARGETS")]
    pub targets: Option<String>,

    /// Minimum circuits per target.
    #[arg(long, env = "MGR_MIN_CIRCS")]
    pub min_circuits: Option<u32>,

    /// Maximum circuits per target.
    #[arg(long, env = "MGR_MAX_CIRCS")]
    pub max_circuits: Option<u32>,

    /// Path of the persisted country cache.
    #[arg(long, env = "MGR_COUNTRY_CACHE")]
    pub country_cache: Option<PathBuf>,

    /// Startup attempt limit (default: infinite).
    #[arg(long)]
    pub retry_limit: Option<u32>,

    /// Start with automatic rotation disabled.
    #[arg(long)]
    pub disable_rotation: bool,
}

impl CliArgs {
    /// Apply CLI arguments to a configuration, overriding values.
    pub fn apply_to(&self, config: &mut Config) {
        if let Some(ref loglevel) = self.loglevel {
            if let Ok(level) = loglevel.parse() {
                config.loglevel = level;
            }
        }
        if let Some(ref logfile) = self.logfile {
            config.logfile = Some(logfile.clone());
        }
        if let Some(ref control_ip) = self.control_ip {
            config.control_ip = control_ip.clone();
        }
        if let Some(control_port) = self.control_port {
            config.control_port = control_port;
        }
        if let Some(ref cookie_path) = self.cookie_path {
            config.cookie_path = cookie_path.clone();
        }
        if let Some(hop_count) = self.hop_count {
            config.hop_count = hop_count;
        }
        if let Some(ref exits) = self.exit_countries {
            config.exit_countries = split_list(exits)
                .into_iter()
                .map(|cc| cc.to_lowercase())
                .collect();
        }
        if let Some(ref targets) = self.targets {
            config.targets = split_list(targets);
        }
        if let Some(min) = self.min_circuits {
            config.min_circuits = min.max(1);
        }
        if let Some(max) = self.max_circuits {
            config.max_circuits = max;
        }
        if let Some(ref path) = self.country_cache {
            config.cache.file = path.clone();
        }
        if let Some(retry_limit) = self.retry_limit {
            config.retry_limit = Some(retry_limit);
        }
        if self.disable_rotation {
            config.rotation.enabled = false;
        }
    }
}

/// Load configuration from file and CLI arguments.
///
/// # Errors
///
/// Returns [`Error::Config`] if the result is invalid.
pub fn load_config(args: &CliArgs) -> Result<Config> {
    let mut config = Config::default();

    if args.config_file.exists() {
        config = Config::from_file(&args.config_file)?;
    }

    args.apply_to(&mut config);
    config.max_circuits = config.max_circuits.max(config.min_circuits);
    config.resolve_control_ip()?;
    config.validate()?;

    Ok(config)
}
