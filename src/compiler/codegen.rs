//! Code generation from a checked tree to stack-machine bytecode.

use regex::Regex;
use std::fmt;
use std::sync::Arc;

use super::ast::{AssignOp, BinOp, Builtin, Node, NodeKind, UnOp};
use super::checker::{CheckedProgram, MetricDef};
use super::types::Type;
use crate::metrics::{ranges_from_boundaries, Kind, Metric, ValueType};
use crate::runtime::code::{CmpOp, Instr, Opcode, Operand};

/// A compiled program: bytecode plus its constant pools.
#[derive(Debug, Clone)]
pub struct Object {
    pub name: String,
    pub program: Vec<Instr>,
    pub regexes: Vec<Regex>,
    pub strings: Vec<String>,
    /// Metrics indexed by `Mload` operands.
    pub metrics: Vec<Arc<Metric>>,
}

impl fmt::Display for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "program {}", self.name)?;
        if !self.metrics.is_empty() {
            writeln!(f, "metrics:")?;
            for (i, m) in self.metrics.iter().enumerate() {
                write!(f, "  {:>3}  {} {} {}", i, m.kind, m.value_type, m.name)?;
                if !m.keys.is_empty() {
                    write!(f, " by {}", m.keys.join(", "))?;
                }
                writeln!(f)?;
            }
        }
        if !self.regexes.is_empty() {
            writeln!(f, "regexes:")?;
            for (i, re) in self.regexes.iter().enumerate() {
                writeln!(f, "  {:>3}  /{}/", i, re.as_str())?;
            }
        }
        if !self.strings.is_empty() {
            writeln!(f, "strings:")?;
            for (i, s) in self.strings.iter().enumerate() {
                writeln!(f, "  {:>3}  {:?}", i, s)?;
            }
        }
        writeln!(f, "code:")?;
        for (pc, instr) in self.program.iter().enumerate() {
            writeln!(f, "  {:>3}  {}", pc, instr)?;
        }
        Ok(())
    }
}

/// Generates the object for a checked program.
pub fn generate(name: &str, checked: CheckedProgram) -> Object {
    let metrics = checked
        .metrics
        .iter()
        .map(|def| Arc::new(build_metric(name, def)))
        .collect();
    let mut gen = CodeGen {
        metric_types: checked
            .metrics
            .iter()
            .map(|d| (d.decl.kind, d.value_type))
            .collect(),
        ..CodeGen::default()
    };
    gen.walk(&checked.ast);
    gen.patch_labels();
    Object {
        name: name.to_string(),
        program: gen.program,
        regexes: checked.regexes,
        strings: gen.strings,
        metrics,
    }
}

fn build_metric(program: &str, def: &MetricDef) -> Metric {
    Metric::new(
        def.decl.exported(),
        program,
        def.decl.kind,
        def.value_type,
        def.decl.keys.clone(),
    )
    .with_source(def.pos.to_string())
    .with_buckets(ranges_from_boundaries(&def.decl.buckets))
    .with_limit(def.decl.limit)
    .hidden(def.decl.hidden)
}

fn cmp_op(op: BinOp) -> Option<CmpOp> {
    Some(match op {
        BinOp::Lt => CmpOp::Lt,
        BinOp::Le => CmpOp::Le,
        BinOp::Eq => CmpOp::Eq,
        BinOp::Ne => CmpOp::Ne,
        BinOp::Gt => CmpOp::Gt,
        BinOp::Ge => CmpOp::Ge,
        _ => return None,
    })
}

fn metric_target(node: &Node) -> Option<(usize, &[Node])> {
    match &node.kind {
        NodeKind::Id {
            metric: Some(i), ..
        } => Some((*i, &[] as &[Node])),
        NodeKind::Indexed { base, index } => match base.kind {
            NodeKind::Id {
                metric: Some(i), ..
            } => Some((i, index.as_slice())),
            _ => None,
        },
        _ => None,
    }
}

#[derive(Default)]
struct CodeGen {
    program: Vec<Instr>,
    strings: Vec<String>,
    metric_types: Vec<(Kind, ValueType)>,
    /// Label targets, set once the label's position is known.
    labels: Vec<Option<usize>>,
    /// Instructions whose operand is a label to back-patch.
    patches: Vec<usize>,
    line: usize,
}

impl CodeGen {
    fn emit(&mut self, opcode: Opcode, operand: Operand) {
        self.program.push(Instr::new(opcode, operand, self.line));
    }

    fn emit_op(&mut self, opcode: Opcode) {
        self.emit(opcode, Operand::None);
    }

    fn new_label(&mut self) -> usize {
        self.labels.push(None);
        self.labels.len() - 1
    }

    fn set_label(&mut self, label: usize) {
        self.labels[label] = Some(self.program.len());
    }

    fn emit_jump(&mut self, opcode: Opcode, label: usize) {
        self.patches.push(self.program.len());
        self.emit(opcode, Operand::Int(label as i64));
    }

    fn patch_labels(&mut self) {
        let end = self.program.len();
        for &pc in &self.patches {
            if let Some(label) = self.program[pc].operand.as_index() {
                let target = self.labels.get(label).copied().flatten().unwrap_or(end);
                self.program[pc].operand = Operand::Int(target as i64);
            }
        }
    }

    fn intern(&mut self, s: &str) -> usize {
        if let Some(i) = self.strings.iter().position(|x| x == s) {
            return i;
        }
        self.strings.push(s.to_string());
        self.strings.len() - 1
    }

    /// Emits the conversion of the top of stack from `from` to `to`.
    fn convert(&mut self, from: Type, to: Type) {
        let opcode = match (from, to) {
            (Type::Int, Type::Float) => Opcode::I2f,
            (Type::Int, Type::String) => Opcode::I2s,
            (Type::Float, Type::String) => Opcode::F2s,
            (Type::Float, Type::Int) => Opcode::F2i,
            (Type::String, Type::Int) => Opcode::S2i,
            (Type::String, Type::Float) => Opcode::S2f,
            _ => return,
        };
        self.emit_op(opcode);
    }

    fn walk_as(&mut self, node: &Node, to: Type) {
        self.walk(node);
        self.convert(node.ty, to);
    }

    /// Pushes the datum handle for a metric target.
    fn datum_ref(&mut self, metric: usize, labels: &[Node]) {
        for label in labels {
            self.walk(label);
        }
        self.emit(Opcode::Mload, Operand::Int(metric as i64));
        self.emit(Opcode::Dload, Operand::Int(labels.len() as i64));
    }

    fn metric_store_type(&self, metric: usize) -> Type {
        match self.metric_types[metric] {
            (Kind::Histogram, _) => Type::Float,
            (Kind::Text, _) => Type::String,
            (_, vt) => vt.into(),
        }
    }

    fn walk(&mut self, node: &Node) {
        self.line = node.pos.line;
        match &node.kind {
            NodeKind::StmtList(stmts) => {
                for stmt in stmts {
                    self.walk(stmt);
                }
            }
            NodeKind::Cond {
                cond,
                truth,
                else_branch,
            } => {
                self.walk(cond);
                let else_label = self.new_label();
                self.emit_jump(Opcode::Jnm, else_label);
                self.emit(Opcode::Setmatched, Operand::Bool(false));
                self.walk(truth);
                self.line = node.pos.line;
                self.emit(Opcode::Setmatched, Operand::Bool(true));
                match else_branch {
                    Some(else_branch) => {
                        let end_label = self.new_label();
                        self.emit_jump(Opcode::Jmp, end_label);
                        self.set_label(else_label);
                        self.walk(else_branch);
                        self.set_label(end_label);
                    }
                    None => self.set_label(else_label),
                }
            }
            NodeKind::Otherwise => self.emit_op(Opcode::Otherwise),
            NodeKind::Decl(_) | NodeKind::PatternConst { .. } => {}
            NodeKind::Delete { target, expiry } => {
                let Some((metric, labels)) = metric_target(target) else {
                    return;
                };
                match expiry {
                    Some(expiry) => {
                        let nanos = i64::try_from(expiry.as_nanos()).unwrap_or(i64::MAX);
                        self.emit(Opcode::Push, Operand::Int(nanos));
                        for label in labels {
                            self.walk(label);
                        }
                        self.emit(Opcode::Mload, Operand::Int(metric as i64));
                        self.emit(Opcode::Expire, Operand::Int(labels.len() as i64));
                    }
                    None => {
                        for label in labels {
                            self.walk(label);
                        }
                        self.emit(Opcode::Mload, Operand::Int(metric as i64));
                        self.emit(Opcode::Del, Operand::Int(labels.len() as i64));
                    }
                }
            }
            NodeKind::Stop => self.emit_op(Opcode::Stop),
            NodeKind::IntLit(v) => self.emit(Opcode::Push, Operand::Int(*v)),
            NodeKind::FloatLit(v) => self.emit(Opcode::Push, Operand::Float(*v)),
            NodeKind::StringLit(s) => {
                let i = self.intern(s);
                self.emit(Opcode::Str, Operand::Int(i as i64));
            }
            NodeKind::Pattern { slot, .. } => {
                if let Some(slot) = slot {
                    self.emit(Opcode::Match, Operand::Int(*slot as i64));
                }
            }
            NodeKind::Id { .. } | NodeKind::Indexed { .. } => {
                let Some((metric, labels)) = metric_target(node) else {
                    return;
                };
                self.datum_ref(metric, labels);
                let get = match self.metric_store_type(metric) {
                    Type::Float => Opcode::Fget,
                    Type::String => Opcode::Sget,
                    _ => Opcode::Iget,
                };
                self.emit_op(get);
            }
            NodeKind::Capref { binding, .. } => {
                if let Some(b) = binding {
                    self.emit(Opcode::Push, Operand::Int(b.slot as i64));
                    self.emit(Opcode::Capref, Operand::Int(b.group as i64));
                    self.convert(Type::String, node.ty);
                }
            }
            NodeKind::Binary { op, lhs, rhs } => self.walk_binary(node, *op, lhs, rhs),
            NodeKind::Unary { op, operand } => self.walk_unary(node, *op, operand),
            NodeKind::Assign { op, lhs, rhs } => {
                let Some((metric, labels)) = metric_target(lhs) else {
                    return;
                };
                let store_type = self.metric_store_type(metric);
                self.datum_ref(metric, labels);
                self.walk_as(rhs, store_type);
                self.line = node.pos.line;
                match op {
                    AssignOp::Add => self.emit(Opcode::Inc, Operand::Int(1)),
                    AssignOp::Set => self.emit_op(match store_type {
                        Type::Float => Opcode::Fset,
                        Type::String => Opcode::Sset,
                        _ => Opcode::Iset,
                    }),
                }
            }
            NodeKind::Builtin { func, args } => self.walk_builtin(*func, args),
        }
    }

    fn walk_binary(&mut self, node: &Node, op: BinOp, lhs: &Node, rhs: &Node) {
        match op {
            BinOp::And | BinOp::Or => {
                // Short-circuit: `&&` bails out on the first false, `||` on
                // the first true.
                let (bail, bail_value) = match op {
                    BinOp::And => (Opcode::Jnm, false),
                    _ => (Opcode::Jm, true),
                };
                let short = self.new_label();
                let end = self.new_label();
                self.walk(lhs);
                self.emit_jump(bail, short);
                self.walk(rhs);
                self.emit_jump(bail, short);
                self.emit(Opcode::Push, Operand::Bool(!bail_value));
                self.emit_jump(Opcode::Jmp, end);
                self.set_label(short);
                self.emit(Opcode::Push, Operand::Bool(bail_value));
                self.set_label(end);
            }
            BinOp::Match | BinOp::NotMatch => {
                let slot = match rhs.kind {
                    NodeKind::Pattern { slot: Some(s), .. } => s,
                    _ => return,
                };
                self.walk_as(lhs, Type::String);
                self.emit(Opcode::Smatch, Operand::Int(slot as i64));
                if op == BinOp::NotMatch {
                    self.emit_op(Opcode::Not);
                }
            }
            _ if op.is_comparison() => {
                let target = if lhs.ty.is_numeric()
                    && rhs.ty.is_numeric()
                    && (lhs.ty == Type::Float || rhs.ty == Type::Float)
                {
                    Type::Float
                } else {
                    Type::None
                };
                self.walk_as(lhs, target);
                self.walk_as(rhs, target);
                if let Some(cmp) = cmp_op(op) {
                    self.line = node.pos.line;
                    self.emit(Opcode::Cmp, Operand::Cmp(cmp));
                }
            }
            _ if op.is_bitwise() => {
                self.walk(lhs);
                self.walk(rhs);
                self.line = node.pos.line;
                self.emit_op(match op {
                    BinOp::Shl => Opcode::Shl,
                    BinOp::Shr => Opcode::Shr,
                    BinOp::BitAnd => Opcode::And,
                    BinOp::BitOr => Opcode::Or,
                    _ => Opcode::Xor,
                });
            }
            _ => {
                if node.ty == Type::String {
                    self.walk_as(lhs, Type::String);
                    self.walk_as(rhs, Type::String);
                    self.emit_op(Opcode::Cat);
                    return;
                }
                let float = node.ty == Type::Float;
                // Strings are left for the VM to parse lazily.
                let target = if float { Type::Float } else { Type::None };
                self.walk_as(lhs, target);
                self.walk_as(rhs, target);
                self.line = node.pos.line;
                let opcode = match (op, float) {
                    (BinOp::Add, false) => Opcode::Iadd,
                    (BinOp::Sub, false) => Opcode::Isub,
                    (BinOp::Mul, false) => Opcode::Imul,
                    (BinOp::Div, false) => Opcode::Idiv,
                    (BinOp::Mod, false) => Opcode::Imod,
                    (BinOp::Pow, false) => Opcode::Ipow,
                    (BinOp::Add, true) => Opcode::Fadd,
                    (BinOp::Sub, true) => Opcode::Fsub,
                    (BinOp::Mul, true) => Opcode::Fmul,
                    (BinOp::Div, true) => Opcode::Fdiv,
                    (BinOp::Mod, true) => Opcode::Fmod,
                    (_, true) => Opcode::Fpow,
                    (_, false) => Opcode::Ipow,
                };
                self.emit_op(opcode);
            }
        }
    }

    fn walk_unary(&mut self, node: &Node, op: UnOp, operand: &Node) {
        match op {
            UnOp::Not => {
                self.walk(operand);
                self.emit_op(Opcode::Not);
            }
            UnOp::BitNot => {
                self.walk(operand);
                self.emit_op(Opcode::Neg);
            }
            UnOp::Minus => {
                if node.ty == Type::Float {
                    self.emit(Opcode::Push, Operand::Float(0.0));
                    self.walk_as(operand, Type::Float);
                    self.emit_op(Opcode::Fsub);
                } else {
                    self.emit(Opcode::Push, Operand::Int(0));
                    self.walk(operand);
                    self.emit_op(Opcode::Isub);
                }
            }
            UnOp::Inc | UnOp::Dec => {
                let Some((metric, labels)) = metric_target(operand) else {
                    return;
                };
                self.datum_ref(metric, labels);
                self.line = node.pos.line;
                self.emit_op(if op == UnOp::Inc {
                    Opcode::Inc
                } else {
                    Opcode::Dec
                });
            }
        }
    }

    fn walk_builtin(&mut self, func: Builtin, args: &[Node]) {
        let line = self.line;
        match func {
            Builtin::Strptime => {
                self.walk_as(&args[0], Type::String);
                self.walk_as(&args[1], Type::String);
                self.line = line;
                self.emit_op(Opcode::Strptime);
            }
            Builtin::Settime => {
                self.walk_as(&args[0], Type::Int);
                self.line = line;
                self.emit_op(Opcode::Settime);
            }
            Builtin::Timestamp => self.emit_op(Opcode::Timestamp),
            Builtin::Getfilename => self.emit_op(Opcode::Getfilename),
            Builtin::Len => {
                self.walk_as(&args[0], Type::String);
                self.line = line;
                self.emit_op(Opcode::Length);
            }
            Builtin::Tolower => {
                self.walk_as(&args[0], Type::String);
                self.line = line;
                self.emit_op(Opcode::Tolower);
            }
            Builtin::Int => self.walk_as(&args[0], Type::Int),
            Builtin::Float => self.walk_as(&args[0], Type::Float),
            Builtin::String => self.walk_as(&args[0], Type::String),
            Builtin::Strtol => {
                self.walk_as(&args[0], Type::String);
                self.walk_as(&args[1], Type::Int);
                self.line = line;
                self.emit(Opcode::S2i, Operand::Int(1));
            }
            Builtin::Subst => {
                if let NodeKind::Pattern { slot: Some(slot), .. } = args[0].kind {
                    self.walk_as(&args[1], Type::String);
                    self.walk_as(&args[2], Type::String);
                    self.line = line;
                    self.emit(Opcode::Rsubst, Operand::Int(slot as i64));
                } else {
                    for arg in args {
                        self.walk_as(arg, Type::String);
                    }
                    self.line = line;
                    self.emit_op(Opcode::Subst);
                }
            }
        }
    }
}
