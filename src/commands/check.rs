//! Check command implementation.
//!
//! Compiles every program and reports errors without starting the engine.

use anyhow::{bail, Context};
use herakles_log_exporter::compiler;
use herakles_log_exporter::runtime::discover_programs;
use std::fs;
use std::path::Path;

use crate::config::{validate_effective_config, Config};

/// Compiles all programs under `path` and validates the configuration.
pub fn command_check(path: Option<&Path>, config: &Config) -> anyhow::Result<()> {
    println!("🔍 Herakles Log Exporter - Program Check");
    println!("========================================");

    let mut all_ok = true;

    println!("\n⚙️  Checking configuration...");
    match validate_effective_config(config) {
        Ok(_) => println!("   ✅ Configuration is valid"),
        Err(e) => {
            println!("   ❌ Configuration invalid: {}", e);
            all_ok = false;
        }
    }

    let Some(path) = path.or(config.progs.as_deref()) else {
        bail!("no program path given and none configured");
    };
    println!("\n📜 Compiling programs in {}...", path.display());

    let files = discover_programs(path)
        .with_context(|| format!("cannot list programs in {}", path.display()))?;
    if files.is_empty() {
        println!("   ⚠️  No *.lpm programs found");
    }

    let options = config
        .engine_options()
        .map_err(|e| anyhow::anyhow!("{}", e))?
        .runtime
        .compile;
    let mut failed = 0;
    for file in &files {
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| file.display().to_string());
        let source = fs::read_to_string(file)
            .with_context(|| format!("cannot read {}", file.display()))?;
        match compiler::compile(&name, &source, &options) {
            Ok(obj) => println!(
                "   ✅ {} ({} metrics, {} instructions)",
                name,
                obj.metrics.len(),
                obj.program.len()
            ),
            Err(errors) => {
                println!("   ❌ {}", name);
                for error in &errors.0 {
                    println!("      {}", error);
                }
                failed += 1;
            }
        }
    }

    println!("\n📋 Summary:");
    if failed > 0 {
        all_ok = false;
        println!("   ❌ {} of {} programs failed to compile", failed, files.len());
    }
    if all_ok {
        println!("   ✅ All checks passed");
        Ok(())
    } else {
        std::process::exit(1);
    }
}
