//! Configuration management for herakles-log-exporter.
//!
//! This module handles loading, merging, and validating configuration from files
//! and CLI arguments. It supports YAML, JSON, and TOML formats.

use crate::cli::{Args, ConfigFormat};
use herakles_log_exporter::compiler::CompileOptions;
use herakles_log_exporter::engine::EngineOptions;
use herakles_log_exporter::exporter::{local_hostname, ExporterOptions};
use herakles_log_exporter::runtime::timefmt::Location;
use herakles_log_exporter::runtime::{RuntimeOptions, VmOptions};
use herakles_log_exporter::tailer::TailerOptions;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

// Default configuration constants
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 3903;
pub const DEFAULT_PROGS_DIR: &str = "/etc/herakles-log-exporter/progs";
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 250;
pub const DEFAULT_POLL_LOG_INTERVAL_MS: u64 = 250;
pub const DEFAULT_STALE_LOG_GC_INTERVAL_SECS: u64 = 3600;
pub const DEFAULT_EXPIRED_METRICS_GC_INTERVAL_SECS: u64 = 3600;
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 1000;
pub const DEFAULT_LINE_CHANNEL_CAPACITY: usize = 1024;

/// Enhanced configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Server configuration
    pub port: Option<u16>,
    pub bind: Option<String>,

    // Inputs
    /// Program file or directory of *.lpm programs
    pub progs: Option<PathBuf>,
    /// Log globs and socket URLs
    pub logs: Option<Vec<String>>,
    #[serde(alias = "ignore-filename-regex")]
    pub ignore_filename_regex: Option<String>,

    // Timing
    #[serde(alias = "poll-interval-ms")]
    pub poll_interval_ms: Option<u64>,
    #[serde(alias = "poll-log-interval-ms")]
    pub poll_log_interval_ms: Option<u64>,
    #[serde(alias = "stale-log-gc-interval-secs")]
    pub stale_log_gc_interval_secs: Option<u64>,
    #[serde(alias = "expired-metrics-gc-interval-secs")]
    pub expired_metrics_gc_interval_secs: Option<u64>,
    #[serde(alias = "read-timeout-ms")]
    pub read_timeout_ms: Option<u64>,

    // Execution
    #[serde(alias = "execution-workers")]
    pub execution_workers: Option<usize>,
    #[serde(alias = "line-channel-capacity")]
    pub line_channel_capacity: Option<usize>,
    /// Rayon threads for program compilation (0 = auto)
    pub parallelism: Option<usize>,
    #[serde(alias = "one-shot")]
    pub one_shot: Option<bool>,
    #[serde(alias = "read-from-start")]
    pub read_from_start: Option<bool>,

    // Output
    #[serde(alias = "emit-prog-label")]
    pub emit_prog_label: Option<bool>,
    #[serde(alias = "emit-metric-timestamp")]
    pub emit_metric_timestamp: Option<bool>,
    pub hostname: Option<String>,
    #[serde(alias = "graphite-prefix")]
    pub graphite_prefix: Option<String>,

    // Compiler and VM
    #[serde(alias = "override-timezone")]
    pub override_timezone: Option<String>,
    #[serde(alias = "syslog-use-current-year")]
    pub syslog_use_current_year: Option<bool>,
    #[serde(alias = "max-regexp-length")]
    pub max_regexp_length: Option<usize>,
    #[serde(alias = "max-recursion-depth")]
    pub max_recursion_depth: Option<usize>,

    // Feature flags
    #[serde(alias = "enable-health")]
    pub enable_health: Option<bool>,

    // TLS/SSL Configuration
    #[serde(alias = "enable-tls")]
    pub enable_tls: Option<bool>,
    #[serde(alias = "tls-cert-path")]
    pub tls_cert_path: Option<String>,
    #[serde(alias = "tls-key-path")]
    pub tls_key_path: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        let compile = CompileOptions::default();
        Self {
            bind: Some(DEFAULT_BIND_ADDR.to_string()),
            port: Some(DEFAULT_PORT),
            progs: Some(PathBuf::from(DEFAULT_PROGS_DIR)),
            logs: Some(Vec::new()),
            ignore_filename_regex: None,
            poll_interval_ms: Some(DEFAULT_POLL_INTERVAL_MS),
            poll_log_interval_ms: Some(DEFAULT_POLL_LOG_INTERVAL_MS),
            stale_log_gc_interval_secs: Some(DEFAULT_STALE_LOG_GC_INTERVAL_SECS),
            expired_metrics_gc_interval_secs: Some(DEFAULT_EXPIRED_METRICS_GC_INTERVAL_SECS),
            read_timeout_ms: Some(DEFAULT_READ_TIMEOUT_MS),
            execution_workers: None,
            line_channel_capacity: Some(DEFAULT_LINE_CHANNEL_CAPACITY),
            parallelism: None,
            one_shot: Some(false),
            read_from_start: Some(false),
            emit_prog_label: Some(true),
            emit_metric_timestamp: Some(false),
            hostname: None,
            graphite_prefix: Some(String::new()),
            override_timezone: None,
            syslog_use_current_year: Some(true),
            max_regexp_length: Some(compile.max_regexp_length),
            max_recursion_depth: Some(compile.max_recursion_depth),
            enable_health: Some(true),
            enable_tls: Some(false),
            tls_cert_path: None,
            tls_key_path: None,
        }
    }
}

impl Config {
    /// Builds engine options, filling unset fields with defaults.
    pub fn engine_options(&self) -> Result<EngineOptions, Box<dyn std::error::Error>> {
        let defaults = RuntimeOptions::default();
        let compile_defaults = CompileOptions::default();

        let timezone = match self.override_timezone.as_deref() {
            Some(tz) => Some(Location::parse(tz)?),
            None => None,
        };
        let ignore = match self.ignore_filename_regex.as_deref() {
            Some(re) if !re.is_empty() => Some(Regex::new(re)?),
            _ => None,
        };

        let read_timeout = self.read_timeout_ms.unwrap_or(DEFAULT_READ_TIMEOUT_MS);
        Ok(EngineOptions {
            logs: self.logs.clone().unwrap_or_default(),
            runtime: RuntimeOptions {
                program_path: self.progs.clone(),
                compile: CompileOptions {
                    max_regexp_length: self
                        .max_regexp_length
                        .unwrap_or(compile_defaults.max_regexp_length),
                    max_recursion_depth: self
                        .max_recursion_depth
                        .unwrap_or(compile_defaults.max_recursion_depth),
                },
                vm: VmOptions {
                    timezone,
                    syslog_use_current_year: self.syslog_use_current_year.unwrap_or(true),
                },
                workers: self.execution_workers.unwrap_or(defaults.workers),
                channel_capacity: self
                    .line_channel_capacity
                    .unwrap_or(DEFAULT_LINE_CHANNEL_CAPACITY),
            },
            tailer: TailerOptions {
                read_timeout: Duration::from_millis(read_timeout),
                one_shot: self.one_shot.unwrap_or(false),
                read_from_start: self.read_from_start.unwrap_or(false),
                ignore,
                ..TailerOptions::default()
            },
            exporter: ExporterOptions {
                emit_prog_label: self.emit_prog_label.unwrap_or(true),
                emit_metric_timestamp: self.emit_metric_timestamp.unwrap_or(false),
                hostname: self.hostname.clone().unwrap_or_else(local_hostname),
                graphite_prefix: self.graphite_prefix.clone().unwrap_or_default(),
            },
            poll_interval: Duration::from_millis(
                self.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS),
            ),
            poll_log_interval: Duration::from_millis(
                self.poll_log_interval_ms
                    .unwrap_or(DEFAULT_POLL_LOG_INTERVAL_MS),
            ),
            stale_log_gc_interval: Duration::from_secs(
                self.stale_log_gc_interval_secs
                    .unwrap_or(DEFAULT_STALE_LOG_GC_INTERVAL_SECS),
            ),
            expired_metrics_gc_interval: Duration::from_secs(
                self.expired_metrics_gc_interval_secs
                    .unwrap_or(DEFAULT_EXPIRED_METRICS_GC_INTERVAL_SECS),
            ),
        })
    }
}

/// Validate effective config (used by --check-config and at startup)
pub fn validate_effective_config(cfg: &Config) -> Result<(), Box<dyn std::error::Error>> {
    if cfg.poll_log_interval_ms == Some(0) {
        return Err("poll_log_interval_ms must be greater than 0".into());
    }
    if cfg.read_timeout_ms == Some(0) {
        return Err("read_timeout_ms must be greater than 0".into());
    }
    if cfg.execution_workers == Some(0) {
        return Err("execution_workers must be greater than 0".into());
    }
    if cfg.line_channel_capacity == Some(0) {
        return Err("line_channel_capacity must be greater than 0".into());
    }
    if cfg.max_regexp_length == Some(0) {
        return Err("max_regexp_length must be greater than 0".into());
    }
    if cfg.max_recursion_depth == Some(0) {
        return Err("max_recursion_depth must be greater than 0".into());
    }

    if let Some(re) = cfg.ignore_filename_regex.as_deref() {
        Regex::new(re).map_err(|e| format!("Invalid ignore_filename_regex '{}': {}", re, e))?;
    }
    if let Some(tz) = cfg.override_timezone.as_deref() {
        Location::parse(tz).map_err(|e| format!("Invalid override_timezone '{}': {}", tz, e))?;
    }

    if let Some(logs) = &cfg.logs {
        for pattern in logs {
            if pattern.trim().is_empty() {
                return Err("logs contains an empty pattern".into());
            }
        }
    }

    // TLS validation
    if cfg.enable_tls.unwrap_or(false) {
        let cert_path = cfg.tls_cert_path.as_deref();
        let key_path = cfg.tls_key_path.as_deref();

        match (cert_path, key_path) {
            (None, None) => {
                return Err(
                    "TLS is enabled but neither tls_cert_path nor tls_key_path are set".into(),
                );
            }
            (Some(_), None) => {
                return Err("TLS is enabled but tls_key_path is not set".into());
            }
            (None, Some(_)) => {
                return Err("TLS is enabled but tls_cert_path is not set".into());
            }
            (Some(cert), Some(key)) => {
                check_pem_file("certificate", cert)?;
                check_pem_file("private key", key)?;
            }
        }
    }

    Ok(())
}

fn check_pem_file(what: &str, path: &str) -> Result<(), Box<dyn std::error::Error>> {
    match fs::metadata(path) {
        Ok(meta) if meta.len() == 0 => Err(format!("TLS {} file is empty: {}", what, path).into()),
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(format!("TLS {} file not found: {}", what, path).into())
        }
        Err(e) => Err(format!("TLS {} file is not readable: {} ({})", what, path, e).into()),
    }
}

/// Resolves configuration from CLI args, config file, and defaults.
/// This enforces precedence: CLI (if provided) > config file > default.
pub fn resolve_config(args: &Args) -> Result<Config, Box<dyn std::error::Error>> {
    let mut config = if args.no_config {
        Config::default()
    } else {
        load_config(args.config.as_deref())?
    };

    // Override with CLI args
    if let Some(bind_ip) = args.bind {
        config.bind = Some(bind_ip.to_string());
    }
    if let Some(cli_port) = args.port {
        config.port = Some(cli_port);
    }

    // Inputs
    if let Some(progs) = &args.progs {
        config.progs = Some(progs.clone());
    }
    if !args.logs.is_empty() {
        config.logs = Some(args.logs.clone());
    }
    if let Some(re) = &args.ignore_filename_regex {
        config.ignore_filename_regex = Some(re.clone());
    }

    // Timing and execution
    if let Some(ms) = args.poll_interval_ms {
        config.poll_interval_ms = Some(ms);
    }
    if let Some(ms) = args.poll_log_interval_ms {
        config.poll_log_interval_ms = Some(ms);
    }
    if let Some(n) = args.execution_workers {
        config.execution_workers = Some(n);
    }
    if let Some(n) = args.parallelism {
        config.parallelism = Some(n);
    }
    if args.read_from_start {
        config.read_from_start = Some(true);
    }

    // Output
    if args.omit_prog_label {
        config.emit_prog_label = Some(false);
    }
    if args.emit_metric_timestamp {
        config.emit_metric_timestamp = Some(true);
    }
    if let Some(tz) = &args.override_timezone {
        config.override_timezone = Some(tz.clone());
    }

    // Feature flags
    if args.disable_health {
        config.enable_health = Some(false);
    }

    // TLS configuration: CLI wins if provided
    if args.enable_tls {
        config.enable_tls = Some(true);
    }
    if let Some(cert_path) = &args.tls_cert {
        config.tls_cert_path = Some(cert_path.to_string_lossy().to_string());
    }
    if let Some(key_path) = &args.tls_key {
        config.tls_key_path = Some(key_path.to_string_lossy().to_string());
    }

    Ok(config)
}

/// Enhanced configuration loading with multiple format support
pub fn load_config(path: Option<&Path>) -> Result<Config, Box<dyn std::error::Error>> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => {
            // Try default locations
            let defaults = [
                "/etc/herakles-log-exporter/herakles-log-exporter.yaml",
                "/etc/herakles-log-exporter/herakles-log-exporter.yml",
                "/etc/herakles-log-exporter/herakles-log-exporter.json",
                "./herakles-log-exporter.yaml",
                "./herakles-log-exporter.yml",
                "./herakles-log-exporter.json",
            ];

            match defaults.iter().find(|p| Path::new(p).exists()) {
                Some(p) => PathBuf::from(p),
                None => return Ok(Config::default()),
            }
        }
    };

    if !path.exists() {
        return Err(format!("Config file not found: {}", path.display()).into());
    }

    let content = fs::read_to_string(&path)?;
    parse_config(&content, &path)
}

/// Parses `content` in the format implied by `path`'s extension.
pub fn parse_config(content: &str, path: &Path) -> Result<Config, Box<dyn std::error::Error>> {
    match path.extension().and_then(|s| s.to_str()) {
        Some("json") => {
            let config: Config = serde_json::from_str(content)?;
            info!("Loaded JSON configuration from: {}", path.display());
            Ok(config)
        }
        Some("toml") => {
            let config: Config = toml::from_str(content)?;
            info!("Loaded TOML configuration from: {}", path.display());
            Ok(config)
        }
        _ => {
            // Default to YAML
            let config: Config = serde_yaml::from_str(content)?;
            info!("Loaded YAML configuration from: {}", path.display());
            Ok(config)
        }
    }
}

/// Shows configuration in requested format
pub fn show_config(
    config: &Config,
    format: ConfigFormat,
    user_config: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let output = match format {
        ConfigFormat::Json => serde_json::to_string_pretty(config)?,
        ConfigFormat::Toml => toml::to_string_pretty(config)?,
        ConfigFormat::Yaml => serde_yaml::to_string(config)?,
    };

    if user_config {
        println!("User configuration (effective values):");
    }
    println!("{output}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(validate_effective_config(&config).is_ok());
        let options = config.engine_options().unwrap();
        assert_eq!(options.poll_log_interval, Duration::from_millis(250));
        assert!(options.exporter.emit_prog_label);
    }

    #[test]
    fn test_yaml_with_kebab_case_aliases() {
        let yaml = "port: 9000\nlogs:\n  - /var/log/syslog\nread-from-start: true\noverride-timezone: \"+02:00\"\n";
        let config = parse_config(yaml, Path::new("c.yaml")).unwrap();
        assert_eq!(config.port, Some(9000));
        assert_eq!(config.read_from_start, Some(true));
        let options = config.engine_options().unwrap();
        assert_eq!(options.logs, vec!["/var/log/syslog".to_string()]);
        assert!(options.tailer.read_from_start);
        assert_eq!(
            options.runtime.vm.timezone.map(|tz| tz.to_string()),
            Some("+02:00".to_string())
        );
    }

    #[test]
    fn test_json_and_toml() {
        let json = r#"{"execution_workers": 3, "graphite_prefix": "logs."}"#;
        let config = parse_config(json, Path::new("c.json")).unwrap();
        assert_eq!(config.execution_workers, Some(3));

        let toml = "emit_prog_label = false\nmax_regexp_length = 64\n";
        let config = parse_config(toml, Path::new("c.toml")).unwrap();
        let options = config.engine_options().unwrap();
        assert!(!options.exporter.emit_prog_label);
        assert_eq!(options.runtime.compile.max_regexp_length, 64);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let mut config = Config {
            ignore_filename_regex: Some("(".into()),
            ..Config::default()
        };
        assert!(validate_effective_config(&config).is_err());

        config.ignore_filename_regex = None;
        config.execution_workers = Some(0);
        assert!(validate_effective_config(&config).is_err());

        config.execution_workers = None;
        config.enable_tls = Some(true);
        let err = validate_effective_config(&config).unwrap_err();
        assert!(err.to_string().contains("neither tls_cert_path nor tls_key_path"));
    }
}
