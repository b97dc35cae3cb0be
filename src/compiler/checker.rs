//! Type checking, name resolution and constant folding.
//!
//! The checker walks the tree bottom-up, annotating every node with its
//! [`Type`] and resolving identifiers to metric indexes and capture references
//! to pattern slots. It never inserts conversion nodes: the code generator
//! derives conversions from the annotated types.
//!
//! Assigning a float to an integer counter, gauge or timer promotes that
//! metric to float. Reads of the metric earlier in the program were already
//! typed as integers, so the whole program is checked again after any
//! promotion until the types settle.

use ahash::AHashMap;
use once_cell::sync::Lazy;
use regex::Regex;

use super::ast::{AssignOp, BinOp, Builtin, CaptureBinding, Decl, Node, NodeKind, UnOp};
use super::errors::{CompileError, CompileErrors, Position};
use super::symbols::{Symbol, SymbolTable};
use super::types::Type;
use super::CompileOptions;
use crate::metrics::{Kind, ValueType};
use crate::runtime::vm::{int_pow, shift_left, shift_right};

static INT_GROUP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(-\??)?(\\d|\[0-9\])(\+|\*|\{\d+(,\d*)?\})?$").expect("static regex")
});

static FLOAT_TOKENS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\\d|\[0-9\.?\]|\[-\+\]|\[\+-\]|\[eE\]|\\\.|\(\?:|[()+*?-]|\{\d+(,\d*)?\}")
        .expect("static regex")
});

/// A metric declaration with its settled value type.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricDef {
    pub decl: Decl,
    pub value_type: ValueType,
    pub pos: Position,
}

/// A fully annotated program, ready for code generation.
#[derive(Debug, Clone)]
pub struct CheckedProgram {
    pub ast: Node,
    pub metrics: Vec<MetricDef>,
    /// Compiled patterns indexed by slot.
    pub regexes: Vec<Regex>,
}

pub fn check(mut ast: Node, options: &CompileOptions) -> Result<CheckedProgram, CompileErrors> {
    let mut metric_types = AHashMap::new();
    loop {
        let mut checker = Checker::new(options, metric_types);
        checker.check_node(&mut ast);
        let Checker {
            errors,
            metrics,
            regexes,
            metric_types: settled,
            promoted,
            ..
        } = checker;
        if !errors.is_empty() {
            return Err(CompileErrors(errors));
        }
        if !promoted {
            return Ok(CheckedProgram {
                ast,
                metrics,
                regexes,
            });
        }
        metric_types = settled;
    }
}

/// Source text of each capturing group, in group-number order.
fn capture_group_sources(regex: &str) -> Vec<String> {
    let bytes = regex.as_bytes();
    let mut groups: Vec<String> = Vec::new();
    let mut open: Vec<(Option<usize>, usize)> = Vec::new();
    let mut in_class = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => {
                i += 2;
                continue;
            }
            b'[' if !in_class => {
                in_class = true;
                i += 1;
                if bytes.get(i) == Some(&b'^') {
                    i += 1;
                }
                if bytes.get(i) == Some(&b']') {
                    i += 1;
                }
                continue;
            }
            b']' if in_class => in_class = false,
            b'(' if !in_class => {
                let rest = &regex[i + 1..];
                let named = rest
                    .strip_prefix("?P<")
                    .map(|r| (3, r))
                    .or_else(|| rest.strip_prefix("?<").map(|r| (2, r)));
                let (capturing, header) = match named {
                    Some((prefix, r)) => (true, prefix + r.find('>').map_or(0, |p| p + 1)),
                    None if rest.starts_with('?') => (false, 0),
                    None => (true, 0),
                };
                let start = i + 1 + header;
                if capturing {
                    groups.push(String::new());
                    open.push((Some(groups.len() - 1), start));
                } else {
                    open.push((None, start));
                }
                i = start;
                continue;
            }
            b')' if !in_class => {
                if let Some((Some(idx), start)) = open.pop() {
                    groups[idx] = regex[start.min(i)..i].to_string();
                }
            }
            _ => {}
        }
        i += 1;
    }
    groups
}

/// Value type of a capture group judged from its sub-pattern.
fn infer_group_type(source: &str) -> Type {
    if INT_GROUP.is_match(source) {
        return Type::Int;
    }
    let has_digit = source.contains(r"\d") || source.contains("[0-9");
    let has_point = source.contains(r"\.") || source.contains("[0-9.]");
    if has_digit && has_point && FLOAT_TOKENS.replace_all(source, "").is_empty() {
        return Type::Float;
    }
    Type::String
}

fn metric_index(node: &Node) -> Option<usize> {
    match &node.kind {
        NodeKind::Id { metric, .. } => *metric,
        NodeKind::Indexed { base, .. } => metric_index(base),
        _ => None,
    }
}

struct Checker<'a> {
    options: &'a CompileOptions,
    symbols: SymbolTable,
    metrics: Vec<MetricDef>,
    metric_types: AHashMap<String, ValueType>,
    regexes: Vec<Regex>,
    errors: Vec<CompileError>,
    promoted: bool,
}

impl<'a> Checker<'a> {
    fn new(options: &'a CompileOptions, metric_types: AHashMap<String, ValueType>) -> Self {
        Self {
            options,
            symbols: SymbolTable::new(),
            metrics: Vec::new(),
            metric_types,
            regexes: Vec::new(),
            errors: Vec::new(),
            promoted: false,
        }
    }

    fn error(&mut self, pos: &Position, message: impl Into<String>) {
        self.errors.push(CompileError::new(pos.clone(), message));
    }

    fn check_node(&mut self, node: &mut Node) {
        self.fold_pattern_expr(node);
        if matches!(node.kind, NodeKind::Id { .. }) {
            node.ty = self.resolve_metric(node, 0);
            return;
        }

        let pos = node.pos.clone();
        let ty = match &mut node.kind {
            NodeKind::StmtList(stmts) => {
                for stmt in stmts.iter_mut() {
                    self.check_node(stmt);
                }
                Type::None
            }
            NodeKind::Cond {
                cond,
                truth,
                else_branch,
            } => {
                // Captures of the condition are visible in the truth block only.
                self.symbols.push_scope();
                self.check_node(cond);
                if !cond.ty.is_condition() && cond.ty != Type::Error {
                    let msg = format!("cannot use {} as a condition", cond.ty);
                    self.error(&cond.pos, msg);
                }
                self.check_node(truth);
                self.symbols.pop_scope();
                if let Some(else_branch) = else_branch {
                    self.symbols.push_scope();
                    self.check_node(else_branch);
                    self.symbols.pop_scope();
                }
                Type::None
            }
            NodeKind::Otherwise => Type::Bool,
            NodeKind::Decl(decl) => {
                self.declare(decl, &pos);
                Type::None
            }
            NodeKind::PatternConst { name, pattern } => {
                match self.pattern_text(pattern) {
                    Some(regex) => {
                        pattern.kind = NodeKind::Pattern { regex: regex.clone(), slot: None };
                        pattern.ty = Type::Pattern;
                        if let Some(prev) = self.symbols.lookup(name).cloned() {
                            let msg = format!(
                                "redefinition of `{}', previously defined at {}",
                                name,
                                prev.pos()
                            );
                            self.error(&pos, msg);
                        } else {
                            self.symbols
                                .insert_global(name, Symbol::Pattern { regex, pos: pos.clone() });
                        }
                    }
                    None => {
                        let msg = format!("const `{}' must be a regular expression", name);
                        self.error(&pos, msg);
                    }
                }
                Type::None
            }
            NodeKind::Delete { target, .. } => {
                self.check_node(target);
                if target.ty != Type::Error && metric_index(target).is_none() {
                    self.error(&target.pos, "`del' requires a metric");
                }
                Type::None
            }
            NodeKind::Stop => Type::None,
            NodeKind::IntLit(_) => Type::Int,
            NodeKind::FloatLit(_) => Type::Float,
            NodeKind::StringLit(_) => Type::String,
            NodeKind::Pattern { regex, slot } => match self.register_pattern(regex, &pos) {
                Some(s) => {
                    *slot = Some(s);
                    Type::Pattern
                }
                None => Type::Error,
            },
            NodeKind::Id { .. } => Type::Error,
            NodeKind::Capref { name, binding } => match self.symbols.lookup_capture(name).cloned() {
                Some(Symbol::Capture { binding: b, ty, .. }) => {
                    *binding = Some(b);
                    ty
                }
                _ => {
                    let msg = format!(
                        "capture group `${}' is not defined by an enclosing pattern",
                        name
                    );
                    self.error(&pos, msg);
                    Type::Error
                }
            },
            NodeKind::Indexed { base, index } => {
                let mut poisoned = false;
                for label in index.iter_mut() {
                    self.check_node(label);
                    if label.ty == Type::Error {
                        poisoned = true;
                    } else if !label.ty.is_scalar() {
                        let msg = format!("cannot use {} as a label value", label.ty);
                        self.error(&label.pos, msg);
                        poisoned = true;
                    }
                }
                let ty = self.resolve_metric(base, index.len());
                if poisoned {
                    Type::Error
                } else {
                    ty
                }
            }
            NodeKind::Binary { op, lhs, rhs } => {
                self.check_node(lhs);
                self.check_node(rhs);
                self.binary_type(*op, lhs, rhs, &pos)
            }
            NodeKind::Unary { op, operand } => {
                self.check_node(operand);
                self.unary_type(*op, operand, &pos)
            }
            NodeKind::Assign { op, lhs, rhs } => {
                self.check_node(lhs);
                self.check_node(rhs);
                self.check_assign(*op, lhs, rhs)
            }
            NodeKind::Builtin { func, args } => {
                for arg in args.iter_mut() {
                    self.check_node(arg);
                }
                self.builtin_type(*func, args, &pos)
            }
        };
        node.ty = ty;

        if let Some(folded) = self.fold_constant(node) {
            node.kind = folded;
        }
    }

    fn declare(&mut self, decl: &Decl, pos: &Position) {
        if let Some(prev) = self.symbols.lookup(&decl.name).cloned() {
            if let Symbol::Metric { index, .. } = &prev {
                if self.metrics[*index].decl == *decl {
                    return;
                }
            }
            let msg = format!(
                "redeclaration of `{}', previously declared at {}",
                decl.name,
                prev.pos()
            );
            self.error(pos, msg);
            return;
        }

        if decl.kind == Kind::Histogram && decl.buckets.is_empty() {
            let msg = format!("histogram `{}' needs at least one bucket", decl.name);
            self.error(pos, msg);
        }
        if decl.kind != Kind::Histogram && !decl.buckets.is_empty() {
            let msg = format!("buckets are only valid on histograms, `{}' is a {}", decl.name, decl.kind);
            self.error(pos, msg);
        }
        if decl.buckets.windows(2).any(|w| w[0] >= w[1]) {
            let msg = format!("buckets of `{}' must be strictly increasing", decl.name);
            self.error(pos, msg);
        }

        let default_type = match decl.kind {
            Kind::Text => ValueType::String,
            Kind::Histogram => ValueType::Float,
            Kind::Counter | Kind::Gauge | Kind::Timer => ValueType::Int,
        };
        let value_type = self
            .metric_types
            .get(&decl.name)
            .copied()
            .unwrap_or(default_type);
        let index = self.metrics.len();
        self.metrics.push(MetricDef {
            decl: decl.clone(),
            value_type,
            pos: pos.clone(),
        });
        self.symbols.insert_global(
            &decl.name,
            Symbol::Metric {
                index,
                pos: pos.clone(),
            },
        );
    }

    /// Resolves `base` to a metric indexed with `arity` label values.
    fn resolve_metric(&mut self, base: &mut Node, arity: usize) -> Type {
        let pos = base.pos.clone();
        let NodeKind::Id { name, metric } = &mut base.kind else {
            self.error(&pos, "only metrics can be indexed");
            return Type::Error;
        };
        let Some(Symbol::Metric { index, .. }) = self.symbols.lookup(name).cloned() else {
            let msg = format!("`{}' is not a declared metric", name);
            self.error(&pos, msg);
            return Type::Error;
        };
        let expected = self.metrics[index].decl.keys.len();
        if expected != arity {
            let msg = format!(
                "metric `{}' takes {} label value(s), got {}",
                name, expected, arity
            );
            self.error(&pos, msg);
            return Type::Error;
        }
        *metric = Some(index);
        let ty = Type::from(self.metrics[index].value_type);
        base.ty = ty;
        ty
    }

    /// Rewrites a pattern constant reference, or a `+` chain made only of
    /// pattern fragments, into a single pattern node.
    fn fold_pattern_expr(&mut self, node: &mut Node) {
        let folded = match &node.kind {
            NodeKind::Id { .. } | NodeKind::Binary { op: BinOp::Add, .. } => {
                self.pattern_text(node)
            }
            _ => None,
        };
        if let Some(regex) = folded {
            node.kind = NodeKind::Pattern { regex, slot: None };
        }
    }

    fn pattern_text(&self, node: &Node) -> Option<String> {
        match &node.kind {
            NodeKind::Pattern { regex, .. } => Some(regex.clone()),
            NodeKind::Id { name, .. } => match self.symbols.lookup(name) {
                Some(Symbol::Pattern { regex, .. }) => Some(regex.clone()),
                _ => None,
            },
            NodeKind::Binary {
                op: BinOp::Add,
                lhs,
                rhs,
            } => {
                let mut text = self.pattern_text(lhs)?;
                text.push_str(&self.pattern_text(rhs)?);
                Some(text)
            }
            _ => None,
        }
    }

    fn register_pattern(&mut self, regex: &str, pos: &Position) -> Option<usize> {
        if regex.len() > self.options.max_regexp_length {
            let msg = format!(
                "regular expression is {} bytes, longer than the maximum of {}",
                regex.len(),
                self.options.max_regexp_length
            );
            self.error(pos, msg);
            return None;
        }
        let re = match Regex::new(regex) {
            Ok(re) => re,
            Err(e) => {
                let msg = format!("invalid regular expression /{}/: {}", regex, e);
                self.error(pos, msg);
                return None;
            }
        };

        let slot = self.regexes.len();
        let sources = capture_group_sources(regex);
        let inferred = sources.len() + 1 == re.captures_len();
        for group in 0..re.captures_len() {
            let ty = if group > 0 && inferred {
                infer_group_type(&sources[group - 1])
            } else {
                Type::String
            };
            let symbol = Symbol::Capture {
                binding: CaptureBinding { slot, group },
                ty,
                pos: pos.clone(),
            };
            if let Some(Some(name)) = re.capture_names().nth(group) {
                self.symbols.insert_capture(name, symbol.clone());
            }
            self.symbols.insert_capture(&group.to_string(), symbol);
        }
        self.regexes.push(re);
        Some(slot)
    }

    fn binary_type(&mut self, op: BinOp, lhs: &Node, rhs: &Node, pos: &Position) -> Type {
        let (l, r) = (lhs.ty, rhs.ty);
        if l == Type::Error || r == Type::Error {
            return Type::Error;
        }

        if op.is_logical() {
            if l.is_condition() && r.is_condition() {
                return Type::Bool;
            }
            self.error(pos, format!("`{}' needs boolean operands, got {} and {}", op, l, r));
            return Type::Error;
        }

        if matches!(op, BinOp::Match | BinOp::NotMatch) {
            if r != Type::Pattern {
                let msg = format!("right side of `{}' must be a regular expression", op);
                self.error(&rhs.pos, msg);
                return Type::Error;
            }
            if !l.is_scalar() {
                let msg = format!("cannot match a regular expression against {}", l);
                self.error(&lhs.pos, msg);
                return Type::Error;
            }
            return Type::Bool;
        }

        if op.is_comparison() {
            if (l.is_scalar() && r.is_scalar()) || (l == Type::Bool && r == Type::Bool) {
                return Type::Bool;
            }
            self.error(pos, format!("cannot compare {} with {}", l, r));
            return Type::Error;
        }

        if op.is_bitwise() {
            let integral = |t: Type| matches!(t, Type::Int | Type::String);
            if integral(l) && integral(r) {
                return Type::Int;
            }
            self.error(pos, format!("`{}' needs integer operands, got {} and {}", op, l, r));
            return Type::Error;
        }

        if !l.is_scalar() || !r.is_scalar() {
            self.error(pos, format!("cannot apply `{}' to {} and {}", op, l, r));
            return Type::Error;
        }
        if op == BinOp::Add && l == Type::String && r == Type::String {
            Type::String
        } else if l == Type::Float || r == Type::Float {
            Type::Float
        } else {
            Type::Int
        }
    }

    fn unary_type(&mut self, op: UnOp, operand: &Node, pos: &Position) -> Type {
        let t = operand.ty;
        if t == Type::Error {
            return Type::Error;
        }
        match op {
            UnOp::Not => {
                if t.is_condition() {
                    return Type::Bool;
                }
                self.error(pos, format!("`!' needs a boolean operand, got {}", t));
                Type::Error
            }
            UnOp::Minus => match t {
                Type::Int | Type::String => Type::Int,
                Type::Float => Type::Float,
                _ => {
                    self.error(pos, format!("cannot negate {}", t));
                    Type::Error
                }
            },
            UnOp::BitNot => {
                if matches!(t, Type::Int | Type::String) {
                    return Type::Int;
                }
                self.error(pos, format!("`~' needs an integer operand, got {}", t));
                Type::Error
            }
            UnOp::Inc | UnOp::Dec => {
                let Some(index) = metric_index(operand) else {
                    self.error(pos, format!("`{}' needs a metric operand", op));
                    return Type::Error;
                };
                let kind = self.metrics[index].decl.kind;
                if matches!(kind, Kind::Text | Kind::Histogram) {
                    self.error(pos, format!("cannot apply `{}' to a {}", op, kind));
                    return Type::Error;
                }
                Type::None
            }
        }
    }

    fn check_assign(&mut self, op: AssignOp, lhs: &Node, rhs: &Node) -> Type {
        if lhs.ty == Type::Error || rhs.ty == Type::Error {
            return Type::Error;
        }
        let Some(index) = metric_index(lhs) else {
            self.error(&lhs.pos, "only metrics can be assigned to");
            return Type::Error;
        };
        let def = &self.metrics[index];
        let (kind, value_type, name) = (def.decl.kind, def.value_type, def.decl.name.clone());

        if op == AssignOp::Add && matches!(kind, Kind::Text | Kind::Histogram) {
            self.error(&lhs.pos, format!("`+=' is not valid on a {}", kind));
            return Type::Error;
        }
        if !rhs.ty.is_scalar() {
            let msg = format!("cannot assign {} to {} `{}'", rhs.ty, kind, name);
            self.error(&rhs.pos, msg);
            return Type::Error;
        }
        if kind != Kind::Text && value_type == ValueType::Int && rhs.ty == Type::Float {
            self.metrics[index].value_type = ValueType::Float;
            self.metric_types.insert(name, ValueType::Float);
            self.promoted = true;
        }
        Type::None
    }

    fn builtin_type(&mut self, func: Builtin, args: &[Node], pos: &Position) -> Type {
        if args.len() != func.arity() {
            let msg = format!(
                "`{}' takes {} argument(s), got {}",
                func,
                func.arity(),
                args.len()
            );
            self.error(pos, msg);
            return Type::Error;
        }
        if args.iter().any(|a| a.ty == Type::Error) {
            return Type::Error;
        }
        for (i, arg) in args.iter().enumerate() {
            let pattern_ok = func == Builtin::Subst && i == 0 && arg.ty == Type::Pattern;
            if !arg.ty.is_scalar() && !pattern_ok {
                let msg = format!("cannot pass {} to `{}'", arg.ty, func);
                self.error(&arg.pos, msg);
                return Type::Error;
            }
        }
        match func {
            Builtin::Strptime | Builtin::Settime => Type::None,
            Builtin::Timestamp | Builtin::Len | Builtin::Int | Builtin::Strtol => Type::Int,
            Builtin::Float => Type::Float,
            Builtin::Tolower | Builtin::Getfilename | Builtin::String | Builtin::Subst => {
                Type::String
            }
        }
    }

    /// Folds operations on literals. Integer division by zero is reported here.
    fn fold_constant(&mut self, node: &Node) -> Option<NodeKind> {
        match &node.kind {
            NodeKind::Binary { op, lhs, rhs } => match (&lhs.kind, &rhs.kind) {
                (NodeKind::IntLit(a), NodeKind::IntLit(b)) => {
                    self.fold_int(*op, *a, *b, &node.pos).map(NodeKind::IntLit)
                }
                (NodeKind::StringLit(a), NodeKind::StringLit(b)) if *op == BinOp::Add => {
                    Some(NodeKind::StringLit(format!("{}{}", a, b)))
                }
                (l, r) => {
                    let as_float = |k: &NodeKind| match k {
                        NodeKind::IntLit(v) => Some(*v as f64),
                        NodeKind::FloatLit(v) => Some(*v),
                        _ => None,
                    };
                    let (a, b) = (as_float(l)?, as_float(r)?);
                    fold_float(*op, a, b).map(NodeKind::FloatLit)
                }
            },
            NodeKind::Unary { op, operand } => match (op, &operand.kind) {
                (UnOp::Minus, NodeKind::IntLit(v)) => Some(NodeKind::IntLit(v.wrapping_neg())),
                (UnOp::Minus, NodeKind::FloatLit(v)) => Some(NodeKind::FloatLit(-v)),
                (UnOp::BitNot, NodeKind::IntLit(v)) => Some(NodeKind::IntLit(!v)),
                _ => None,
            },
            _ => None,
        }
    }

    fn fold_int(&mut self, op: BinOp, a: i64, b: i64, pos: &Position) -> Option<i64> {
        Some(match op {
            BinOp::Add => a.wrapping_add(b),
            BinOp::Sub => a.wrapping_sub(b),
            BinOp::Mul => a.wrapping_mul(b),
            BinOp::Div | BinOp::Mod if b == 0 => {
                self.error(pos, "division by zero");
                return None;
            }
            BinOp::Div => a.wrapping_div(b),
            BinOp::Mod => a.wrapping_rem(b),
            BinOp::Pow => int_pow(a, b),
            BinOp::Shl => shift_left(a, b),
            BinOp::Shr => shift_right(a, b),
            BinOp::BitAnd => a & b,
            BinOp::BitOr => a | b,
            BinOp::BitXor => a ^ b,
            _ => return None,
        })
    }
}

fn fold_float(op: BinOp, a: f64, b: f64) -> Option<f64> {
    Some(match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div if b != 0.0 => a / b,
        BinOp::Mod if b != 0.0 => a % b,
        BinOp::Pow => a.powf(b),
        _ => return None,
    })
}
