//! Lexically scoped symbol table used by the checker.

use ahash::AHashMap;

use super::ast::CaptureBinding;
use super::errors::Position;
use super::types::Type;

#[derive(Debug, Clone, PartialEq)]
pub enum Symbol {
    /// Index into the program's metric declarations.
    Metric { index: usize, pos: Position },
    /// A `const` regex fragment.
    Pattern { regex: String, pos: Position },
    /// A capture group of a pattern in an enclosing condition.
    Capture {
        binding: CaptureBinding,
        ty: Type,
        pos: Position,
    },
}

impl Symbol {
    pub fn pos(&self) -> &Position {
        match self {
            Symbol::Metric { pos, .. }
            | Symbol::Pattern { pos, .. }
            | Symbol::Capture { pos, .. } => pos,
        }
    }
}

/// Identifiers and capture references live in separate namespaces; capture
/// names are stored with their `$` sigil.
#[derive(Debug)]
pub struct SymbolTable {
    scopes: Vec<AHashMap<String, Symbol>>,
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolTable {
    pub fn new() -> Self {
        Self {
            scopes: vec![AHashMap::new()],
        }
    }

    pub fn push_scope(&mut self) {
        self.scopes.push(AHashMap::new());
    }

    pub fn pop_scope(&mut self) {
        if self.scopes.len() > 1 {
            self.scopes.pop();
        }
    }

    /// Declares a program-wide identifier.
    pub fn insert_global(&mut self, name: &str, symbol: Symbol) -> Option<Symbol> {
        self.scopes[0].insert(name.to_string(), symbol)
    }

    /// Binds a capture reference in the innermost scope.
    pub fn insert_capture(&mut self, name: &str, symbol: Symbol) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(format!("${}", name), symbol);
        }
    }

    pub fn lookup(&self, name: &str) -> Option<&Symbol> {
        self.scopes.iter().rev().find_map(|scope| scope.get(name))
    }

    pub fn lookup_capture(&self, name: &str) -> Option<&Symbol> {
        let key = format!("${}", name);
        self.lookup(&key)
    }
}
