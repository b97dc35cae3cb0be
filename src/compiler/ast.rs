//! Abstract syntax tree.
//!
//! The node set is closed: every traversal matches on [`NodeKind`]
//! exhaustively. The checker annotates `ty` and resolves bindings in place.

use std::fmt;
use std::time::Duration;

use super::errors::Position;
use super::types::Type;
use crate::metrics::Kind;

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub kind: NodeKind,
    pub pos: Position,
    pub ty: Type,
}

impl Node {
    pub fn new(kind: NodeKind, pos: Position) -> Self {
        Self {
            kind,
            pos,
            ty: Type::None,
        }
    }

    pub fn boxed(kind: NodeKind, pos: Position) -> Box<Self> {
        Box::new(Self::new(kind, pos))
    }
}

/// Resolved location of a capture group: pattern slot and group index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureBinding {
    pub slot: usize,
    pub group: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    StmtList(Vec<Node>),
    /// `cond { truth } else { otherwise }`.
    Cond {
        cond: Box<Node>,
        truth: Box<Node>,
        else_branch: Option<Box<Node>>,
    },
    /// The `otherwise` condition.
    Otherwise,
    Decl(Decl),
    /// `const NAME /regex/`.
    PatternConst {
        name: String,
        pattern: Box<Node>,
    },
    /// `del m[..]` or `del m[..] after DURATION`.
    Delete {
        target: Box<Node>,
        expiry: Option<Duration>,
    },
    Stop,

    IntLit(i64),
    FloatLit(f64),
    StringLit(String),
    /// A regex literal, or the folded concatenation of pattern fragments.
    Pattern {
        regex: String,
        slot: Option<usize>,
    },
    /// A reference to a metric or pattern constant.
    Id {
        name: String,
        metric: Option<usize>,
    },
    Capref {
        name: String,
        binding: Option<CaptureBinding>,
    },
    /// `m[a, b]`.
    Indexed {
        base: Box<Node>,
        index: Vec<Node>,
    },
    Binary {
        op: BinOp,
        lhs: Box<Node>,
        rhs: Box<Node>,
    },
    Unary {
        op: UnOp,
        operand: Box<Node>,
    },
    Assign {
        op: AssignOp,
        lhs: Box<Node>,
        rhs: Box<Node>,
    },
    Builtin {
        func: Builtin,
        args: Vec<Node>,
    },
}

/// A metric declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct Decl {
    pub name: String,
    pub kind: Kind,
    pub keys: Vec<String>,
    pub exported_name: Option<String>,
    pub buckets: Vec<f64>,
    pub limit: Option<usize>,
    pub hidden: bool,
}

impl Decl {
    pub fn exported(&self) -> &str {
        self.exported_name.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Shl,
    Shr,
    BitAnd,
    BitOr,
    BitXor,
    And,
    Or,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    Match,
    NotMatch,
}

impl BinOp {
    pub fn is_arithmetic(self) -> bool {
        matches!(
            self,
            BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod | BinOp::Pow
        )
    }

    pub fn is_bitwise(self) -> bool {
        matches!(
            self,
            BinOp::Shl | BinOp::Shr | BinOp::BitAnd | BinOp::BitOr | BinOp::BitXor
        )
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge | BinOp::Eq | BinOp::Ne
        )
    }

    pub fn is_logical(self) -> bool {
        matches!(self, BinOp::And | BinOp::Or)
    }
}

impl fmt::Display for BinOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::Pow => "**",
            BinOp::Shl => "<<",
            BinOp::Shr => ">>",
            BinOp::BitAnd => "&",
            BinOp::BitOr => "|",
            BinOp::BitXor => "^",
            BinOp::And => "&&",
            BinOp::Or => "||",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Match => "=~",
            BinOp::NotMatch => "!~",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    /// Logical `!`.
    Not,
    /// Arithmetic `-`.
    Minus,
    /// Bitwise `~`.
    BitNot,
    /// Postfix `++`.
    Inc,
    /// Postfix `--`.
    Dec,
}

impl fmt::Display for UnOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UnOp::Not => "!",
            UnOp::Minus => "-",
            UnOp::BitNot => "~",
            UnOp::Inc => "++",
            UnOp::Dec => "--",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    Set,
    Add,
}

impl fmt::Display for AssignOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AssignOp::Set => "=",
            AssignOp::Add => "+=",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Strptime,
    Settime,
    Timestamp,
    Len,
    Tolower,
    Getfilename,
    Int,
    Float,
    String,
    Strtol,
    Subst,
}

impl Builtin {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "strptime" => Builtin::Strptime,
            "settime" => Builtin::Settime,
            "timestamp" => Builtin::Timestamp,
            "len" => Builtin::Len,
            "tolower" => Builtin::Tolower,
            "getfilename" => Builtin::Getfilename,
            "int" => Builtin::Int,
            "float" => Builtin::Float,
            "string" => Builtin::String,
            "strtol" => Builtin::Strtol,
            "subst" => Builtin::Subst,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Builtin::Strptime => "strptime",
            Builtin::Settime => "settime",
            Builtin::Timestamp => "timestamp",
            Builtin::Len => "len",
            Builtin::Tolower => "tolower",
            Builtin::Getfilename => "getfilename",
            Builtin::Int => "int",
            Builtin::Float => "float",
            Builtin::String => "string",
            Builtin::Strtol => "strtol",
            Builtin::Subst => "subst",
        }
    }

    /// Number of arguments the builtin takes.
    pub fn arity(self) -> usize {
        match self {
            Builtin::Timestamp | Builtin::Getfilename => 0,
            Builtin::Settime
            | Builtin::Len
            | Builtin::Tolower
            | Builtin::Int
            | Builtin::Float
            | Builtin::String => 1,
            Builtin::Strptime | Builtin::Strtol => 2,
            Builtin::Subst => 3,
        }
    }
}

impl fmt::Display for Builtin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
