//! Dump command implementation.
//!
//! Prints a program's syntax tree, its type-annotated tree, or its bytecode.

use anyhow::{anyhow, Context};
use herakles_log_exporter::compiler::{self, parser, sexp, CompileOptions};
use std::fs;
use std::path::Path;

/// What `dump` prints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpKind {
    Ast,
    Types,
    Bytecode,
}

/// Compiles `file` as far as `kind` needs and renders the result.
pub fn render_dump(file: &Path, kind: DumpKind, options: &CompileOptions) -> anyhow::Result<String> {
    let source =
        fs::read_to_string(file).with_context(|| format!("cannot read {}", file.display()))?;
    let name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| file.display().to_string());

    let out = match kind {
        DumpKind::Ast => {
            let ast = parser::parse(&name, &source, options).map_err(|e| anyhow!("{}", e))?;
            sexp::dump(&ast, false)
        }
        DumpKind::Types => {
            let checked =
                compiler::compile_checked(&name, &source, options).map_err(|e| anyhow!("{}", e))?;
            sexp::dump(&checked.ast, true)
        }
        DumpKind::Bytecode => {
            let obj = compiler::compile(&name, &source, options).map_err(|e| anyhow!("{}", e))?;
            obj.to_string()
        }
    };
    Ok(out)
}

pub fn command_dump(file: &Path, kind: DumpKind, options: &CompileOptions) -> anyhow::Result<()> {
    print!("{}", render_dump(file, kind, options)?);
    Ok(())
}
