//! Bytecode instructions.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Match the line against regex slot `operand`; push the result.
    Match,
    /// Pop a string and match regex slot `operand` against it.
    Smatch,
    Cmp,
    /// Jump if the popped bool is false.
    Jnm,
    /// Jump if the popped bool is true.
    Jm,
    Jmp,
    Inc,
    Dec,
    Strptime,
    Timestamp,
    Settime,
    Push,
    Capref,
    Str,
    Iset,
    Iget,
    Fset,
    Fget,
    Sset,
    Sget,
    Iadd,
    Isub,
    Imul,
    Idiv,
    Imod,
    Ipow,
    Fadd,
    Fsub,
    Fmul,
    Fdiv,
    Fmod,
    Fpow,
    Shl,
    Shr,
    And,
    Or,
    Xor,
    /// Bitwise not.
    Neg,
    /// Logical not.
    Not,
    Mload,
    Dload,
    Tolower,
    Length,
    Cat,
    Subst,
    Rsubst,
    Setmatched,
    Otherwise,
    Del,
    Expire,
    Getfilename,
    Stop,
    S2i,
    S2f,
    I2f,
    I2s,
    F2s,
    F2i,
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = format!("{:?}", self);
        f.write_str(&name.to_lowercase())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Lt,
    Le,
    Eq,
    Ne,
    Gt,
    Ge,
}

impl CmpOp {
    pub fn holds(self, ordering: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::*;
        match self {
            CmpOp::Lt => ordering == Less,
            CmpOp::Le => ordering != Greater,
            CmpOp::Eq => ordering == Equal,
            CmpOp::Ne => ordering != Equal,
            CmpOp::Gt => ordering == Greater,
            CmpOp::Ge => ordering != Less,
        }
    }
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CmpOp::Lt => "lt",
            CmpOp::Le => "le",
            CmpOp::Eq => "eq",
            CmpOp::Ne => "ne",
            CmpOp::Gt => "gt",
            CmpOp::Ge => "ge",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Operand {
    #[default]
    None,
    Int(i64),
    Float(f64),
    Bool(bool),
    Cmp(CmpOp),
}

impl Operand {
    pub fn as_index(&self) -> Option<usize> {
        match self {
            Operand::Int(i) => usize::try_from(*i).ok(),
            _ => None,
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::None => Ok(()),
            Operand::Int(i) => write!(f, "{}", i),
            Operand::Float(v) => write!(f, "{:?}", v),
            Operand::Bool(b) => write!(f, "{}", b),
            Operand::Cmp(op) => write!(f, "{}", op),
        }
    }
}

/// One instruction with the source line it was generated from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Instr {
    pub opcode: Opcode,
    pub operand: Operand,
    pub source_line: usize,
}

impl Instr {
    pub fn new(opcode: Opcode, operand: Operand, source_line: usize) -> Self {
        Self {
            opcode,
            operand,
            source_line,
        }
    }
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.operand {
            Operand::None => write!(f, "{} @{}", self.opcode, self.source_line),
            operand => write!(f, "{} {} @{}", self.opcode, operand, self.source_line),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Ordering;

    #[test]
    fn test_instr_display() {
        assert_eq!(
            Instr::new(Opcode::Match, Operand::Int(0), 3).to_string(),
            "match 0 @3"
        );
        assert_eq!(
            Instr::new(Opcode::Cmp, Operand::Cmp(CmpOp::Ge), 1).to_string(),
            "cmp ge @1"
        );
        assert_eq!(Instr::new(Opcode::Getfilename, Operand::None, 7).to_string(), "getfilename @7");
    }

    #[test]
    fn test_cmp_holds() {
        assert!(CmpOp::Le.holds(Ordering::Equal));
        assert!(!CmpOp::Lt.holds(Ordering::Equal));
        assert!(CmpOp::Ne.holds(Ordering::Greater));
    }
}
