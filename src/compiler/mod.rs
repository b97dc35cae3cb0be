//! Compiler for the log-pattern language.
//!
//! Source text goes through [`lexer`], [`parser`], [`checker`] and
//! [`codegen`] to produce an [`Object`] the runtime can execute. Every stage
//! reports errors with file, line and column; a program that fails to compile
//! is simply not loaded.

pub mod ast;
pub mod checker;
pub mod codegen;
pub mod errors;
pub mod lexer;
pub mod parser;
pub mod sexp;
pub mod symbols;
pub mod types;

pub use checker::CheckedProgram;
pub use codegen::Object;
pub use errors::{CompileError, CompileErrors, Position};

/// Limits applied while compiling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileOptions {
    /// Longest regular expression accepted, in bytes.
    pub max_regexp_length: usize,
    /// Deepest expression or block nesting accepted by the parser.
    pub max_recursion_depth: usize,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            max_regexp_length: 1024,
            max_recursion_depth: 100,
        }
    }
}

/// Compiles `source` into an executable object named `name`.
pub fn compile(name: &str, source: &str, options: &CompileOptions) -> Result<Object, CompileErrors> {
    let checked = compile_checked(name, source, options)?;
    Ok(codegen::generate(name, checked))
}

/// Parses and checks `source` without generating code.
pub fn compile_checked(
    name: &str,
    source: &str,
    options: &CompileOptions,
) -> Result<CheckedProgram, CompileErrors> {
    let ast = parser::parse(name, source, options)?;
    checker::check(ast, options)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_reports_all_errors_with_positions() {
        let err = compile("bad.lpm", "counter\n/x/ {\n y++\n}\n", &CompileOptions::default())
            .unwrap_err();
        assert_eq!(err.len(), 1);
        assert!(err.0[0].to_string().starts_with("bad.lpm:2:1"));
    }

    #[test]
    fn test_compile_empty_program() {
        let obj = compile("empty.lpm", "# nothing here\n", &CompileOptions::default()).unwrap();
        assert!(obj.program.is_empty());
        assert!(obj.metrics.is_empty());
    }

    #[test]
    fn test_checker_errors_after_clean_parse() {
        let err = compile("bad.lpm", "counter c\n/x/ {\n y++\n}\n", &CompileOptions::default())
            .unwrap_err();
        assert!(err.to_string().contains("bad.lpm:3:2"));
    }
}
