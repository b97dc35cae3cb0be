//! CLI arguments and subcommands for herakles-log-exporter.
//!
//! This module defines the command-line interface structure using the clap library,
//! including all flags, options, and subcommands.

use clap::{Parser, Subcommand, ValueEnum};
use std::net::IpAddr;
use std::path::PathBuf;

/// Log level options for CLI parsing
#[derive(Debug, Clone, ValueEnum)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Configuration format options for output
#[derive(Debug, Clone, ValueEnum)]
pub enum ConfigFormat {
    Yaml,
    Json,
    Toml,
}

/// Metric output formats for the oneshot command
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Prometheus,
    Json,
    Varz,
    Graphite,
}

impl From<OutputFormat> for herakles_log_exporter::Format {
    fn from(f: OutputFormat) -> Self {
        use herakles_log_exporter::Format;
        match f {
            OutputFormat::Prometheus => Format::Prometheus,
            OutputFormat::Json => Format::Json,
            OutputFormat::Varz => Format::Varz,
            OutputFormat::Graphite => Format::Graphite,
        }
    }
}

/// Main CLI arguments structure
#[derive(Parser, Debug)]
#[command(
    name = "herakles-log-exporter",
    about = "Prometheus exporter deriving metrics from log files",
    long_about = "Prometheus exporter deriving metrics from log files.\n\n\
                  Tails log files, named pipes and sockets, runs every line through small \
                  pattern programs (*.lpm) and exports the counters, gauges and histograms \
                  they maintain in Prometheus, JSON, varz and graphite formats.",
    author = "Michael Moll <exporter@herakles.now> - Herakles",
    version = "0.1.0",
    propagate_version = true,
    after_help = "Project: https://github.com/cansp-dev/herakles-log-exporter — More info: https://www.herakles.now — Support: exporter@herakles.now"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// HTTP listen port
    #[arg(short = 'p', long)]
    pub port: Option<u16>,

    /// Bind to specific interface/IP
    #[arg(long)]
    pub bind: Option<IpAddr>,

    /// Log level
    #[arg(long, value_enum, default_value = "info")]
    pub log_level: LogLevel,

    /// Config file (YAML/JSON/TOML)
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Disable all config file loading
    #[arg(long)]
    pub no_config: bool,

    /// Print effective merged config and exit
    #[arg(long)]
    pub show_config: bool,

    /// Print only the loaded user config file + full path and exit
    #[arg(long)]
    pub show_user_config: bool,

    /// Output format for --show-config*
    #[arg(long, value_enum, default_value = "yaml")]
    pub config_format: ConfigFormat,

    /// Validate config and exit (return code 1 on error)
    #[arg(long)]
    pub check_config: bool,

    /// Program file or directory of *.lpm programs
    #[arg(long)]
    pub progs: Option<PathBuf>,

    /// Log glob or socket URL to read (repeatable)
    #[arg(long = "logs", value_delimiter = ',')]
    pub logs: Vec<String>,

    /// Do not tail file names matching this regex
    #[arg(long)]
    pub ignore_filename_regex: Option<String>,

    /// Interval between log discovery and program reload passes (ms)
    #[arg(long)]
    pub poll_interval_ms: Option<u64>,

    /// Interval between read cycles of each log (ms)
    #[arg(long)]
    pub poll_log_interval_ms: Option<u64>,

    /// Number of execution worker tasks
    #[arg(long)]
    pub execution_workers: Option<usize>,

    /// Parallel compilation threads (0 = auto)
    #[arg(long)]
    pub parallelism: Option<usize>,

    /// Read files found at startup from the beginning instead of the end
    #[arg(long)]
    pub read_from_start: bool,

    /// Do not add the prog label to exported metrics
    #[arg(long)]
    pub omit_prog_label: bool,

    /// Attach the last update time to exported samples
    #[arg(long)]
    pub emit_metric_timestamp: bool,

    /// Zone for timestamps without one, e.g. Europe/Berlin or +02:00
    #[arg(long)]
    pub override_timezone: Option<String>,

    /// Disable /health endpoint
    #[arg(long)]
    pub disable_health: bool,

    /// Enable TLS/SSL for HTTPS
    #[arg(long)]
    pub enable_tls: bool,

    /// Path to TLS certificate file (PEM format)
    #[arg(long)]
    pub tls_cert: Option<PathBuf>,

    /// Path to TLS private key file (PEM format)
    #[arg(long)]
    pub tls_key: Option<PathBuf>,
}

/// Subcommands for additional functionality
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Compile all programs and report errors without running
    Check {
        /// Program file or directory (defaults to the configured progs)
        path: Option<PathBuf>,
    },

    /// Print a compiled program's AST, types or bytecode
    Dump {
        /// Program file
        file: PathBuf,

        /// Print the parsed syntax tree
        #[arg(long, group = "what")]
        ast: bool,

        /// Print the syntax tree annotated with types
        #[arg(long, group = "what")]
        types: bool,

        /// Print the bytecode listing (default)
        #[arg(long, group = "what")]
        bytecode: bool,
    },

    /// Read the configured logs to EOF once and print the metrics
    Oneshot {
        /// Output format
        #[arg(long, value_enum, default_value = "prometheus")]
        format: OutputFormat,
    },

    /// Generate configuration files
    Config {
        /// Output file path
        #[arg(short = 'o', long)]
        output: Option<PathBuf>,

        /// Output format
        #[arg(long, value_enum, default_value = "yaml")]
        format: ConfigFormat,

        /// Include comments and examples
        #[arg(long)]
        commented: bool,
    },
}
