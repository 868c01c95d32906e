//! Configuration system for dnswatch
//!
//! Provides:
//! - Config file discovery (CLI flag, env var, standard paths)
//! - TOML parsing with serde
//! - Environment variable overrides

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Complete dnswatch configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DnswatchConfig {
    /// General settings
    pub general: GeneralSettings,

    /// Capture settings
    pub capture: CaptureSettings,

    /// Output settings
    pub output: OutputSettings,

    /// Prometheus exporter settings
    pub exporter: ExporterSettings,
}

/// General settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralSettings {
    /// Log level: trace, debug, info, warn, error
    pub log_level: String,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// How the send interceptors are attached
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachMode {
    /// fentry when kernel BTF is available, kprobe otherwise
    #[default]
    Auto,
    /// Dynamic kprobes
    Kprobe,
    /// BTF trampolines
    Fentry,
}

impl std::str::FromStr for AttachMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(AttachMode::Auto),
            "kprobe" => Ok(AttachMode::Kprobe),
            "fentry" => Ok(AttachMode::Fentry),
            other => Err(ConfigError::ValidationError(format!(
                "Invalid attach mode: {}. Must be one of: auto, kprobe, fentry",
                other
            ))),
        }
    }
}

impl std::fmt::Display for AttachMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            AttachMode::Auto => "auto",
            AttachMode::Kprobe => "kprobe",
            AttachMode::Fentry => "fentry",
        })
    }
}

/// Capture settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    /// Interceptor attachment: auto, kprobe, fentry
    pub attach_mode: AttachMode,

    /// Copy the exec-time command line into each record in the kernel
    pub cmdline_enrichment: bool,

    /// Read /proc for records that arrive without a command line
    pub proc_fallback: bool,

    /// Path to the probe object (uses the embedded object if unset)
    pub ebpf_path: Option<String>,

    /// Ring buffer poll interval in milliseconds
    pub poll_interval_ms: u64,

    /// Capacity of the channel between capture and output
    pub channel_capacity: usize,

    /// Thread group ids to show (empty = all)
    pub tgid_filter: Vec<u32>,

    /// Thread ids to show (empty = all)
    pub pid_filter: Vec<u32>,

    /// Process names to show (substring match, empty = all)
    pub process_filter: Vec<String>,

    /// Process names to hide (substring match)
    pub exclude_process: Vec<String>,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            attach_mode: AttachMode::Auto,
            cmdline_enrichment: true,
            proc_fallback: true,
            ebpf_path: None,
            poll_interval_ms: 10,
            channel_capacity: 10_000,
            tgid_filter: Vec::new(),
            pid_filter: Vec::new(),
            process_filter: Vec::new(),
            exclude_process: Vec::new(),
        }
    }
}

/// Output format for `snoop`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            other => Err(ConfigError::ValidationError(format!(
                "Invalid output format: {}. Must be one of: text, json",
                other
            ))),
        }
    }
}

/// Column names accepted in `output.fields` (case-insensitive)
pub const OUTPUT_FIELDS: [&str; 8] = [
    "TIME", "PID", "TGID", "PNAME", "PORT", "HOOK", "HOST", "CMDLINE",
];

/// Output settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSettings {
    /// Output format: text, json
    pub format: OutputFormat,

    /// Comma separated columns for text output
    pub fields: String,

    /// Also append records to this JSONL file
    pub jsonl_path: Option<String>,

    /// Refresh period of `top`, in seconds
    pub period_secs: u64,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            format: OutputFormat::Text,
            fields: "PID,TGID,PNAME,PORT,HOOK,CMDLINE".to_string(),
            jsonl_path: None,
            period_secs: 3,
        }
    }
}

/// Prometheus exporter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExporterSettings {
    /// Address to serve /metrics on
    pub listen: String,
}

impl Default for ExporterSettings {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:9422".to_string(),
        }
    }
}

/// Configuration loader
pub struct ConfigLoader {
    /// Path to config file (if specified via CLI)
    cli_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new config loader
    pub fn new() -> Self {
        Self { cli_path: None }
    }

    /// Set the config path from CLI argument
    pub fn with_cli_path(mut self, path: Option<PathBuf>) -> Self {
        self.cli_path = path;
        self
    }

    /// Load configuration with the following precedence:
    /// 1. CLI --config flag
    /// 2. DNSWATCH_CONFIG environment variable
    /// 3. ~/.config/dnswatch/config.toml
    /// 4. /etc/dnswatch/config.toml
    /// 5. Default values
    pub fn load(&self) -> ConfigResult<DnswatchConfig> {
        let mut config = match self.find_config_file() {
            Some(path) => {
                info!("Loading configuration from: {}", path.display());
                self.load_from_file(&path)?
            }
            None => {
                debug!("No config file found, using defaults");
                DnswatchConfig::default()
            }
        };

        apply_overrides(&mut config, |key| std::env::var(key).ok());

        self.validate(&config)?;

        Ok(config)
    }

    /// Find the config file to use
    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.cli_path {
            if path.exists() {
                return Some(path.clone());
            }
            warn!("CLI config path does not exist: {}", path.display());
        }

        if let Ok(env_path) = std::env::var("DNSWATCH_CONFIG") {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Some(path);
            }
            warn!("DNSWATCH_CONFIG path does not exist: {}", env_path);
        }

        if let Some(path) = Self::default_config_path() {
            if path.exists() {
                return Some(path);
            }
        }

        let path = PathBuf::from("/etc/dnswatch/config.toml");
        if path.exists() {
            return Some(path);
        }

        None
    }

    /// Load configuration from a TOML file
    pub fn load_from_file(&self, path: &Path) -> ConfigResult<DnswatchConfig> {
        let content = std::fs::read_to_string(path)?;
        let config: DnswatchConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self, config: &DnswatchConfig) -> ConfigResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&config.general.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level: {}. Must be one of: {:?}",
                config.general.log_level, valid_levels
            )));
        }

        if config.capture.poll_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "Poll interval cannot be 0".to_string(),
            ));
        }

        if config.capture.channel_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "Channel capacity cannot be 0".to_string(),
            ));
        }

        if config.output.period_secs == 0 {
            return Err(ConfigError::ValidationError(
                "Refresh period cannot be 0".to_string(),
            ));
        }

        if config.output.fields.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "Output fields cannot be empty".to_string(),
            ));
        }

        for field in config.output.fields.split(',').map(str::trim) {
            if !OUTPUT_FIELDS.iter().any(|f| f.eq_ignore_ascii_case(field)) {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid output field: '{}'. Must be one of: {}",
                    field,
                    OUTPUT_FIELDS.join(",")
                )));
            }
        }

        if config.exporter.listen.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::ValidationError(format!(
                "Invalid exporter listen address: {}",
                config.exporter.listen
            )));
        }

        Ok(())
    }

    /// Save configuration to a file
    pub fn save(&self, config: &DnswatchConfig, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(config).map_err(|e| {
            ConfigError::ValidationError(format!("Failed to serialize config: {}", e))
        })?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, content)?;
        info!("Configuration saved to: {}", path.display());
        Ok(())
    }

    /// Get the default per-user config file path
    pub fn default_config_path() -> Option<PathBuf> {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| PathBuf::from(h).join(".config"))
            })
            .map(|d| d.join("dnswatch").join("config.toml"))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply `DNSWATCH_*` overrides. Unparsable values are ignored with a warning.
fn apply_overrides<F>(config: &mut DnswatchConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(val) = lookup("DNSWATCH_LOG_LEVEL") {
        config.general.log_level = val;
    }

    if let Some(val) = lookup("DNSWATCH_ATTACH_MODE") {
        match val.parse() {
            Ok(mode) => config.capture.attach_mode = mode,
            Err(e) => warn!("Ignoring DNSWATCH_ATTACH_MODE: {}", e),
        }
    }
    if let Some(val) = lookup("DNSWATCH_EBPF_PATH") {
        config.capture.ebpf_path = Some(val);
    }
    if let Some(val) = lookup("DNSWATCH_CMDLINE_ENRICHMENT") {
        config.capture.cmdline_enrichment =
            val.parse().unwrap_or(config.capture.cmdline_enrichment);
    }
    if let Some(val) = lookup("DNSWATCH_PROC_FALLBACK") {
        config.capture.proc_fallback = val.parse().unwrap_or(config.capture.proc_fallback);
    }

    if let Some(val) = lookup("DNSWATCH_OUTPUT_FORMAT") {
        match val.parse() {
            Ok(format) => config.output.format = format,
            Err(e) => warn!("Ignoring DNSWATCH_OUTPUT_FORMAT: {}", e),
        }
    }
    if let Some(val) = lookup("DNSWATCH_FIELDS") {
        config.output.fields = val;
    }

    if let Some(val) = lookup("DNSWATCH_EXPORTER_LISTEN") {
        config.exporter.listen = val;
    }
}
