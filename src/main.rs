//! herakles-log-exporter - version 0.1.0
//!
//! Log-pattern metrics exporter with tracing logging.
//! This is the main entry point that initializes the server and handles subcommands.

mod cli;
mod commands;
mod config;
mod handlers;
mod state;

use axum::{routing::get, Router};
use axum_server::tls_rustls::RustlsConfig;
use clap::Parser;
use herakles_log_exporter::Engine;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::{net::TcpListener, signal};
use tracing::{debug, error, info, warn, Level};

use cli::{Args, Commands, LogLevel};
use commands::{command_check, command_config, command_dump, command_oneshot, DumpKind};
use config::{resolve_config, show_config, validate_effective_config, Config, DEFAULT_BIND_ADDR, DEFAULT_PORT};
use handlers::{
    graphite_handler, health_handler, json_handler, metrics_handler, progz_handler, root_handler,
    varz_handler,
};
use state::AppState;

/// Initializes tracing logging subsystem with configured log level.
fn setup_logging(args: &Args) {
    let log_level = match args.log_level {
        LogLevel::Off => Level::ERROR,
        LogLevel::Error => Level::ERROR,
        LogLevel::Warn => Level::WARN,
        LogLevel::Info => Level::INFO,
        LogLevel::Debug => Level::DEBUG,
        LogLevel::Trace => Level::TRACE,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");

    info!("Logging initialized with level: {:?}", args.log_level);
}

/// Helper function to load and validate configuration.
/// Exits the process with error code 1 if validation fails.
fn load_validated_config(args: &Args) -> Result<Config, Box<dyn std::error::Error>> {
    let config = resolve_config(args)?;
    if let Err(e) = validate_effective_config(&config) {
        eprintln!("❌ Configuration invalid: {}", e);
        std::process::exit(1);
    }
    Ok(config)
}

/// Configures the global rayon pool used for program compilation.
fn configure_parallelism(config: &Config) {
    if let Some(threads) = config.parallelism {
        if threads > 0 {
            rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .build_global()
                .unwrap_or_else(|e| error!("Failed to set rayon thread pool: {}", e));
            debug!("Rayon thread pool configured with {} threads", threads);
        }
    }
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), shutting down gracefully...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
    }
}

/// Reloads programs whenever SIGHUP arrives.
#[cfg(unix)]
fn spawn_reload_on_hangup(engine: Arc<Engine>) {
    tokio::spawn(async move {
        let mut hangup = match signal::unix::signal(signal::unix::SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to install SIGHUP handler: {}", e);
                return;
            }
        };
        while hangup.recv().await.is_some() {
            info!("Received SIGHUP, reloading programs");
            let runtime = engine.runtime().clone();
            match tokio::task::spawn_blocking(move || runtime.load_all()).await {
                Ok(Ok(summary)) => info!(
                    "Programs reloaded: {} loaded, {} unchanged, {} failed, {} unloaded",
                    summary.loaded, summary.unchanged, summary.failed, summary.unloaded
                ),
                Ok(Err(e)) => warn!("Program reload failed: {}", e),
                Err(e) => error!("Program reload task failed: {}", e),
            }
        }
    });
}

/// Main application entry point.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Early config resolution for show/check modes
    if args.show_config || args.show_user_config || args.check_config {
        let config = resolve_config(&args)?;

        if args.check_config {
            if let Err(e) = validate_effective_config(&config) {
                eprintln!("❌ Configuration invalid: {}", e);
                std::process::exit(1);
            }
            println!("✅ Configuration is valid");
            return Ok(());
        }

        if args.show_config {
            return show_config(&config, args.config_format, false);
        }

        if args.show_user_config {
            return show_config(&config, args.config_format, true);
        }
    }

    // Handle subcommands
    if let Some(command) = &args.command {
        if let Commands::Config {
            output,
            format,
            commented,
        } = command
        {
            return command_config(output.clone(), format.clone(), *commented);
        }

        let config = resolve_config(&args)?;
        let result = match command {
            Commands::Check { path } => command_check(path.as_deref(), &config),
            Commands::Dump {
                file,
                ast,
                types,
                bytecode: _,
            } => {
                let kind = if *ast {
                    DumpKind::Ast
                } else if *types {
                    DumpKind::Types
                } else {
                    DumpKind::Bytecode
                };
                let options = config
                    .engine_options()
                    .map_err(|e| anyhow::anyhow!("{}", e))?
                    .runtime
                    .compile;
                command_dump(file, kind, &options)
            }
            Commands::Oneshot { format } => {
                if let Err(e) = validate_effective_config(&config) {
                    eprintln!("❌ Configuration invalid: {}", e);
                    std::process::exit(1);
                }
                setup_logging(&args);
                configure_parallelism(&config);
                command_oneshot(&config, (*format).into()).await
            }
            Commands::Config { .. } => unreachable!("Config handled above"),
        };
        if let Err(e) = result {
            eprintln!("❌ {:#}", e);
            std::process::exit(1);
        }
        return Ok(());
    }

    // Load configuration for main server mode
    let config = load_validated_config(&args)?;

    setup_logging(&args);

    info!("Starting herakles-log-exporter");

    let bind_ip_str = config.bind.clone().unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
    let port = config.port.unwrap_or(DEFAULT_PORT);

    configure_parallelism(&config);

    let engine = Arc::new(Engine::new(config.engine_options()?)?);
    let summary = engine.load_programs()?;
    info!(
        "Loaded {} programs ({} failed) from {}",
        summary.loaded,
        summary.failed,
        config
            .progs
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none)".to_string())
    );
    for (name, e) in engine.runtime().load_errors() {
        warn!("Program {} failed to compile:\n{}", name, e);
    }

    let streams = engine.poll_logs().await;
    info!("Tailing {} log stream(s)", streams);
    engine.start();

    #[cfg(unix)]
    spawn_reload_on_hangup(engine.clone());

    let state = Arc::new(AppState::new(engine.clone(), config.clone()));

    // Configure HTTP server routes
    let addr: SocketAddr = format!("{}:{}", bind_ip_str, port).parse()?;

    let mut app = Router::new()
        .route("/", get(root_handler))
        .route("/metrics", get(metrics_handler))
        .route("/json", get(json_handler))
        .route("/varz", get(varz_handler))
        .route("/graphite", get(graphite_handler))
        .route("/progz", get(progz_handler));

    if config.enable_health.unwrap_or(true) {
        app = app.route("/health", get(health_handler));
    }

    let app = app.with_state(state);

    // Check if TLS is enabled
    let enable_tls = config.enable_tls.unwrap_or(false);

    let served: Result<(), Box<dyn std::error::Error>> = if enable_tls {
        // These paths are guaranteed to exist since validate_effective_config() was called earlier
        let cert_path = config
            .tls_cert_path
            .as_ref()
            .expect("tls_cert_path should be set when enable_tls is true (validated at startup)");
        let key_path = config
            .tls_key_path
            .as_ref()
            .expect("tls_key_path should be set when enable_tls is true (validated at startup)");

        info!("Loading TLS certificate from: {}", cert_path);
        info!("Loading TLS private key from: {}", key_path);

        let tls_config = RustlsConfig::from_pem_file(cert_path, key_path)
            .await
            .map_err(|e| {
                error!("Failed to load TLS configuration: {}", e);
                e
            })?;

        info!(
            "herakles-log-exporter listening on https://{}:{}",
            bind_ip_str, port
        );

        let server = axum_server::bind_rustls(addr, tls_config).serve(app.into_make_service());

        tokio::select! {
            result = server => result.map_err(Into::into),
            _ = shutdown_signal() => Ok(()),
        }
    } else {
        let listener = TcpListener::bind(addr).await?;
        info!(
            "herakles-log-exporter listening on http://{}:{}",
            bind_ip_str, port
        );

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(Into::into)
    };

    if let Err(e) = &served {
        error!("Server error: {}", e);
    }

    info!("Stopping log streams and draining program workers");
    engine.shutdown().await;

    info!("herakles-log-exporter stopped gracefully");
    served
}
