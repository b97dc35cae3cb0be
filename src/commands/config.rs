//! Config command implementation.
//!
//! Generates configuration files in various formats.

use std::fs;
use std::path::PathBuf;

use crate::cli::ConfigFormat;
use crate::config::Config;

/// Generates configuration files.
pub fn command_config(
    output: Option<PathBuf>,
    format: ConfigFormat,
    commented: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::default();
    let output = match output {
        Some(path) => path,
        None => PathBuf::from("herakles-log-exporter.yaml"),
    };

    let content = match format {
        ConfigFormat::Json => serde_json::to_string_pretty(&config)?,
        ConfigFormat::Toml => toml::to_string_pretty(&config)?,
        ConfigFormat::Yaml => {
            let mut content = serde_yaml::to_string(&config)?;
            if commented {
                content = add_config_comments(content);
            }
            content
        }
    };

    if output.to_string_lossy() == "-" {
        print!("{}", content);
    } else {
        fs::write(&output, content)?;
        println!("✅ Configuration written to: {}", output.display());
    }

    Ok(())
}

/// Adds comments to YAML configuration.
fn add_config_comments(yaml: String) -> String {
    let comments = r#"# Herakles Log Exporter Configuration
# ===================================
#
# Server Configuration
# --------------------
# bind: "0.0.0.0"              # Bind IP (0.0.0.0 = all interfaces)
# port: 3903                   # HTTP port
#
# Inputs
# ------
# progs: "/etc/herakles-log-exporter/progs"  # Program file or directory of *.lpm
# logs:                        # Globs and socket URLs to read
#   - "/var/log/nginx/*.log"
#   - "unixgram:///run/herakles/syslog.sock"
# ignore_filename_regex: null  # Skip matching file names
#
# Timing
# ------
# poll_interval_ms: 250        # Log discovery and program reload interval
# poll_log_interval_ms: 250    # Read cycle interval per log
# read_timeout_ms: 1000        # Read timeout for sockets and pipes
# stale_log_gc_interval_secs: 3600       # Stop logs idle for 24h (0 = never)
# expired_metrics_gc_interval_secs: 3600 # Remove expired label sets (0 = never)
#
# Execution
# ---------
# execution_workers: null      # Program worker tasks (null = CPU count)
# line_channel_capacity: 1024  # Lines buffered between tailer and workers
# parallelism: null            # Compilation threads (null = auto)
# one_shot: false              # Read logs to EOF once, then stop
# read_from_start: false       # Read logs found at startup from offset 0
#
# Output
# ------
# emit_prog_label: true        # Add prog="<file>" to every metric
# emit_metric_timestamp: false # Attach last update time to samples
# hostname: null               # Instance name for varz (null = system hostname)
# graphite_prefix: ""          # Prefix for graphite paths
#
# Compiler and VM
# ---------------
# override_timezone: null      # Zone for timestamps without one, e.g. "Europe/Berlin" or "+02:00"
# syslog_use_current_year: true # Year for timestamps that carry none
# max_regexp_length: 1024      # Longest accepted regular expression
# max_recursion_depth: 100     # Deepest accepted nesting
#
# Feature Flags
# -------------
# enable_health: true          # Enable /health endpoint
#
# TLS/SSL Configuration
# ---------------------
# enable_tls: false            # Enable HTTPS (default: false)
# tls_cert_path: null          # Path to TLS certificate (PEM format)
# tls_key_path: null           # Path to TLS private key (PEM format)
"#;

    format!("{comments}\n{yaml}")
}
