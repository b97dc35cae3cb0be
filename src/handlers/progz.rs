//! Program status endpoint handler.
//!
//! `/progz` lists every loaded program with its load time and source hash,
//! followed by the compile errors of programs that failed to load.

use axum::{extract::State, response::IntoResponse};
use std::fmt::Write as FmtWrite;
use tracing::{debug, instrument};

use crate::handlers::health::FOOTER_TEXT;
use crate::state::SharedState;

/// Handler for the /progz endpoint.
#[instrument(skip(state))]
pub async fn progz_handler(State(state): State<SharedState>) -> impl IntoResponse {
    debug!("Processing /progz request");
    state.record_http_request();

    let runtime = state.engine.runtime();
    let mut out = String::new();

    writeln!(out, "PROGRAMS").ok();
    writeln!(out, "========").ok();
    match &runtime.options().program_path {
        Some(path) => writeln!(out, "Program path: {}\n", path.display()).ok(),
        None => writeln!(out, "Program path: (none)\n").ok(),
    };
    writeln!(out, "{:30} | {:25} | {:>16}", "Program", "Loaded at", "Source hash").ok();
    writeln!(out, "{}", "-".repeat(77)).ok();
    for program in runtime.programs().iter() {
        writeln!(
            out,
            "{:30} | {:25} | {:>16x}",
            program.name,
            program.loaded_at.format("%Y-%m-%d %H:%M:%S UTC"),
            program.source_hash
        )
        .ok();
    }

    let errors = runtime.load_errors();
    if !errors.is_empty() {
        writeln!(out, "\nLOAD ERRORS").ok();
        writeln!(out, "===========").ok();
        for (name, error) in errors {
            writeln!(out, "{}:\n{}\n", name, error).ok();
        }
    }

    (
        [("Content-Type", "text/plain; charset=utf-8")],
        format!("{out}\n{FOOTER_TEXT}"),
    )
}
