//! S-expression dump of the syntax tree, used by `dump --ast` and `--types`.

use std::fmt::Write;

use super::ast::{Node, NodeKind};
use super::types::Type;

/// Renders `node` as an indented s-expression. With `types`, every typed
/// node is suffixed with `:type`.
pub fn dump(node: &Node, types: bool) -> String {
    let mut out = String::new();
    Printer { out: &mut out, types }.node(node, 0);
    out.push('\n');
    out
}

struct Printer<'a> {
    out: &'a mut String,
    types: bool,
}

impl Printer<'_> {
    fn indent(&mut self, depth: usize) {
        self.out.push('\n');
        for _ in 0..depth {
            self.out.push_str("  ");
        }
    }

    fn node(&mut self, node: &Node, depth: usize) {
        match &node.kind {
            NodeKind::StmtList(stmts) => {
                self.out.push_str("(stmts");
                for stmt in stmts {
                    self.indent(depth + 1);
                    self.node(stmt, depth + 1);
                }
                self.out.push(')');
            }
            NodeKind::Cond {
                cond,
                truth,
                else_branch,
            } => {
                self.out.push_str("(cond ");
                self.node(cond, depth + 1);
                self.indent(depth + 1);
                self.node(truth, depth + 1);
                if let Some(else_branch) = else_branch {
                    self.indent(depth + 1);
                    self.out.push_str("(else ");
                    self.node(else_branch, depth + 2);
                    self.out.push(')');
                }
                self.out.push(')');
            }
            NodeKind::Otherwise => self.out.push_str("(otherwise)"),
            NodeKind::Decl(decl) => {
                let _ = write!(self.out, "(decl {} {}", decl.kind, decl.name);
                if decl.hidden {
                    self.out.push_str(" hidden");
                }
                if !decl.keys.is_empty() {
                    let _ = write!(self.out, " (by {})", decl.keys.join(" "));
                }
                if let Some(name) = &decl.exported_name {
                    let _ = write!(self.out, " (as {:?})", name);
                }
                if !decl.buckets.is_empty() {
                    let buckets: Vec<String> = decl.buckets.iter().map(|b| format!("{:?}", b)).collect();
                    let _ = write!(self.out, " (buckets {})", buckets.join(" "));
                }
                if let Some(limit) = decl.limit {
                    let _ = write!(self.out, " (limit {})", limit);
                }
                self.out.push(')');
            }
            NodeKind::PatternConst { name, pattern } => {
                let _ = write!(self.out, "(const {} ", name);
                self.node(pattern, depth + 1);
                self.out.push(')');
            }
            NodeKind::Delete { target, expiry } => {
                self.out.push_str("(del ");
                self.node(target, depth + 1);
                if let Some(expiry) = expiry {
                    let _ = write!(self.out, " (after {:?})", expiry);
                }
                self.out.push(')');
            }
            NodeKind::Stop => self.out.push_str("(stop)"),
            NodeKind::IntLit(v) => {
                let _ = write!(self.out, "{}", v);
            }
            NodeKind::FloatLit(v) => {
                let _ = write!(self.out, "{:?}", v);
            }
            NodeKind::StringLit(s) => {
                let _ = write!(self.out, "{:?}", s);
            }
            NodeKind::Pattern { regex, .. } => {
                let _ = write!(self.out, "/{}/", regex.replace('/', "\\/"));
            }
            NodeKind::Id { name, .. } => self.out.push_str(name),
            NodeKind::Capref { name, .. } => {
                let _ = write!(self.out, "${}", name);
            }
            NodeKind::Indexed { base, index } => {
                self.out.push_str("(index ");
                self.node(base, depth + 1);
                for label in index {
                    self.out.push(' ');
                    self.node(label, depth + 1);
                }
                self.out.push(')');
            }
            NodeKind::Binary { op, lhs, rhs } => {
                let _ = write!(self.out, "({} ", op);
                self.node(lhs, depth + 1);
                self.out.push(' ');
                self.node(rhs, depth + 1);
                self.out.push(')');
            }
            NodeKind::Unary { op, operand } => {
                let _ = write!(self.out, "({} ", op);
                self.node(operand, depth + 1);
                self.out.push(')');
            }
            NodeKind::Assign { op, lhs, rhs } => {
                let _ = write!(self.out, "({} ", op);
                self.node(lhs, depth + 1);
                self.out.push(' ');
                self.node(rhs, depth + 1);
                self.out.push(')');
            }
            NodeKind::Builtin { func, args } => {
                let _ = write!(self.out, "({}", func);
                for arg in args {
                    self.out.push(' ');
                    self.node(arg, depth + 1);
                }
                self.out.push(')');
            }
        }
        if self.types && node.ty != Type::None {
            let _ = write!(self.out, ":{}", node.ty);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{compile_checked, parser::parse, CompileOptions};

    const PROG: &str = "counter lines by file\n/(\\d+) ms/ {\n lines[getfilename()] += $1\n} else {\n stop\n}\n";

    #[test]
    fn test_dump_ast() {
        let ast = parse("t.lpm", PROG, &CompileOptions::default()).unwrap();
        assert_eq!(
            dump(&ast, false),
            "(stmts\n  (decl counter lines (by file))\n  (cond /(\\d+) ms/\n    (stmts\n      (+= (index lines (getfilename)) $1))\n    (else (stmts\n        (stop)))))\n"
        );
    }

    #[test]
    fn test_dump_types() {
        let checked = compile_checked("t.lpm", PROG, &CompileOptions::default()).unwrap();
        let out = dump(&checked.ast, true);
        assert!(out.contains("(index lines:int (getfilename):string):int"));
        assert!(out.contains("$1:int"));
        assert!(out.contains("/(\\d+) ms/:pattern"));
    }

    #[test]
    fn test_dump_is_stable() {
        let checked = compile_checked("t.lpm", PROG, &CompileOptions::default()).unwrap();
        let first = dump(&checked.ast, true);
        let again = compile_checked("t.lpm", PROG, &CompileOptions::default()).unwrap();
        assert_eq!(first, dump(&again.ast, true));
    }
}
