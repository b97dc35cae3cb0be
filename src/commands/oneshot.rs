//! Oneshot command implementation.
//!
//! Reads every configured log to EOF, runs the programs over it and prints
//! the resulting metrics instead of serving them.

use anyhow::anyhow;
use herakles_log_exporter::{Engine, Format};
use tracing::info;

use crate::config::Config;

/// Runs the engine once over the configured logs and returns the rendering.
pub async fn run_oneshot(config: &Config, format: Format) -> anyhow::Result<String> {
    let mut options = config.engine_options().map_err(|e| anyhow!("{}", e))?;
    options.tailer.one_shot = true;
    options.tailer.read_from_start = true;

    let engine = Engine::new(options)?;
    let summary = engine.load_programs()?;
    if summary.failed > 0 {
        for (name, error) in engine.runtime().load_errors() {
            eprintln!("❌ {}: {}", name, error);
        }
    }
    info!("Loaded {} programs, reading logs once", summary.loaded);

    engine.run_one_shot().await?;
    Ok(engine.render(format)?)
}

pub async fn command_oneshot(config: &Config, format: Format) -> anyhow::Result<()> {
    print!("{}", run_oneshot(config, format).await?);
    Ok(())
}
