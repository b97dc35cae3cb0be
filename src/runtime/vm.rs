//! The stack machine that runs one compiled program against one log line.
//!
//! A [`Vm`] owns an immutable [`Object`] and may be shared between workers;
//! all per-line state lives in the caller's [`Thread`]. Execution never
//! suspends: [`Vm::execute`] runs the instruction sequence to completion,
//! to a `stop`, or to the first fault.

use ahash::AHashMap as HashMap;
use chrono::{DateTime, TimeZone, Utc};
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use super::code::{CmpOp, Instr, Opcode, Operand};
use super::timefmt;
use crate::compiler::Object;
use crate::logline::LogLine;
use crate::metrics::datum::format_float;
use crate::metrics::{Datum, Metric, MetricError};

/// Shifts past the width of an i64 (or by a negative count) clear every bit.
pub(crate) fn shift_left(a: i64, b: i64) -> i64 {
    match u32::try_from(b) {
        Ok(b) if b < 64 => a << b,
        _ => 0,
    }
}

/// Arithmetic shift; out of range counts leave only the sign.
pub(crate) fn shift_right(a: i64, b: i64) -> i64 {
    match u32::try_from(b) {
        Ok(b) if b < 64 => a >> b,
        _ if a < 0 => -1,
        _ => 0,
    }
}

/// Integer power with wrapping overflow. Negative exponents go through
/// floating point and truncate.
pub(crate) fn int_pow(base: i64, exp: i64) -> i64 {
    match u32::try_from(exp) {
        Ok(exp) => base.wrapping_pow(exp),
        Err(_) => (base as f64).powf(exp as f64) as i64,
    }
}

/// A value on the VM stack.
#[derive(Debug, Clone)]
pub enum Value {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    Datum(Arc<Datum>),
    Metric(Arc<Metric>),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Datum(a), Value::Datum(b)) => Arc::ptr_eq(a, b),
            (Value::Metric(a), Value::Metric(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Bool(_) => "bool",
            Value::Datum(_) => "datum",
            Value::Metric(_) => "metric",
        }
    }
}

/// Per-line execution state. One thread is reused for every line a worker
/// processes; [`Vm::execute`] resets it first.
#[derive(Debug, Default)]
pub struct Thread {
    pub pc: usize,
    pub stack: Vec<Value>,
    /// Capture groups of the last successful match, keyed by regex slot.
    pub matches: HashMap<usize, Vec<String>>,
    /// Timestamp set by `strptime` or `settime` for this line.
    pub time: Option<DateTime<Utc>>,
    pub matched: bool,
    pub terminated: bool,
}

impl Thread {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.pc = 0;
        self.stack.clear();
        self.matches.clear();
        self.time = None;
        self.matched = false;
        self.terminated = false;
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VmOptions {
    /// Zone applied to `strptime` layouts that carry no offset.
    pub timezone: Option<timefmt::Location>,
    /// Fill in the current year for layouts without one.
    pub syslog_use_current_year: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Completed,
    /// The program executed `stop`.
    Stopped,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum FaultKind {
    #[error("stack underflow")]
    StackUnderflow,

    #[error("expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    #[error("cannot parse {value:?} as {ty}")]
    Parse { value: String, ty: &'static str },

    #[error("division by zero")]
    DivisionByZero,

    #[error("invalid operand for {0}")]
    InvalidOperand(Opcode),

    #[error("no capture group {group} for regex {slot}")]
    NoMatch { slot: usize, group: usize },

    #[error(transparent)]
    Metric(#[from] MetricError),

    #[error("strptime: {0}")]
    Strptime(String),

    #[error("base {0} is out of range 2..=36")]
    InvalidBase(i64),

    #[error("integer overflow in {0}")]
    Overflow(Opcode),
}

/// A fault that aborted one program's execution of one line.
#[derive(Debug, thiserror::Error, PartialEq)]
#[error("{program}: runtime fault at pc {pc} (line {source_line}): {kind}")]
pub struct RuntimeFault {
    pub program: String,
    pub pc: usize,
    pub source_line: usize,
    pub kind: FaultKind,
}

enum Flow {
    Next,
    Stop,
}

#[derive(Debug)]
pub struct Vm {
    object: Object,
    options: VmOptions,
}

impl Vm {
    pub fn new(object: Object, options: VmOptions) -> Self {
        Self { object, options }
    }

    pub fn name(&self) -> &str {
        &self.object.name
    }

    pub fn object(&self) -> &Object {
        &self.object
    }

    /// Runs the program against `line`.
    pub fn execute(
        &self,
        thread: &mut Thread,
        line: &LogLine,
    ) -> Result<ExecutionOutcome, RuntimeFault> {
        thread.reset();
        self.run(thread, line).map_err(|kind| {
            thread.terminated = true;
            let pc = thread.pc.saturating_sub(1);
            RuntimeFault {
                program: self.object.name.clone(),
                pc,
                source_line: self
                    .object
                    .program
                    .get(pc)
                    .map(|i| i.source_line)
                    .unwrap_or(0),
                kind,
            }
        })
    }

    fn run(&self, t: &mut Thread, line: &LogLine) -> Result<ExecutionOutcome, FaultKind> {
        while let Some(instr) = self.object.program.get(t.pc).copied() {
            t.pc += 1;
            if let Flow::Stop = self.step(t, line, instr)? {
                return Ok(ExecutionOutcome::Stopped);
            }
        }
        Ok(ExecutionOutcome::Completed)
    }

    fn now(t: &Thread) -> DateTime<Utc> {
        t.time.unwrap_or_else(Utc::now)
    }

    fn index(instr: Instr) -> Result<usize, FaultKind> {
        instr
            .operand
            .as_index()
            .ok_or(FaultKind::InvalidOperand(instr.opcode))
    }

    fn regex(&self, instr: Instr) -> Result<(usize, &regex::Regex), FaultKind> {
        let slot = Self::index(instr)?;
        self.object
            .regexes
            .get(slot)
            .map(|re| (slot, re))
            .ok_or(FaultKind::InvalidOperand(instr.opcode))
    }

    /// Matches `re` against `text`, recording capture groups on success.
    fn do_match(t: &mut Thread, slot: usize, re: &regex::Regex, text: &str) -> bool {
        match re.captures(text) {
            Some(caps) => {
                let groups = caps
                    .iter()
                    .map(|g| g.map(|m| m.as_str().to_string()).unwrap_or_default())
                    .collect();
                t.matches.insert(slot, groups);
                true
            }
            None => false,
        }
    }

    fn step(&self, t: &mut Thread, line: &LogLine, instr: Instr) -> Result<Flow, FaultKind> {
        match instr.opcode {
            Opcode::Match => {
                let (slot, re) = self.regex(instr)?;
                let matched = Self::do_match(t, slot, re, &line.line);
                t.stack.push(Value::Bool(matched));
            }
            Opcode::Smatch => {
                let (slot, re) = self.regex(instr)?;
                let text = pop_string(t)?;
                let matched = Self::do_match(t, slot, re, &text);
                t.stack.push(Value::Bool(matched));
            }
            Opcode::Cmp => {
                let Operand::Cmp(op) = instr.operand else {
                    return Err(FaultKind::InvalidOperand(instr.opcode));
                };
                let b = pop(t)?;
                let a = pop(t)?;
                t.stack.push(Value::Bool(compare(op, &a, &b)?));
            }
            Opcode::Jnm => {
                let target = Self::index(instr)?;
                if !pop_bool(t)? {
                    t.pc = target;
                }
            }
            Opcode::Jm => {
                let target = Self::index(instr)?;
                if pop_bool(t)? {
                    t.pc = target;
                }
            }
            Opcode::Jmp => t.pc = Self::index(instr)?,
            Opcode::Inc | Opcode::Dec => {
                let delta = if instr.operand == Operand::Int(1) {
                    Some(pop(t)?)
                } else {
                    None
                };
                let datum = pop_datum(t)?;
                let now = Self::now(t);
                let sign: i64 = if instr.opcode == Opcode::Dec { -1 } else { 1 };
                let delta = match delta {
                    None => Value::Int(1),
                    Some(Value::Str(s)) => parse_number(&s)?,
                    Some(v) => v,
                };
                match delta {
                    Value::Int(d) => {
                        let d = d.checked_mul(sign).ok_or(FaultKind::Overflow(instr.opcode))?;
                        datum.inc_int_by(d, now)?
                    }
                    Value::Float(d) => datum.inc_float_by(sign as f64 * d, now)?,
                    other => {
                        return Err(FaultKind::TypeMismatch {
                            expected: "number",
                            found: other.type_name(),
                        })
                    }
                }
            }
            Opcode::Strptime => {
                let layout = pop_string(t)?;
                let value = pop_string(t)?;
                let time = timefmt::strptime(
                    &value,
                    &layout,
                    self.options.timezone,
                    self.options.syslog_use_current_year,
                )
                .map_err(FaultKind::Strptime)?;
                t.time = Some(time);
            }
            Opcode::Timestamp => {
                let now = Self::now(t);
                t.stack.push(Value::Int(now.timestamp()));
            }
            Opcode::Settime => {
                let secs = pop_int(t)?;
                let time = Utc
                    .timestamp_opt(secs, 0)
                    .single()
                    .ok_or_else(|| FaultKind::Strptime(format!("timestamp {} out of range", secs)))?;
                t.time = Some(time);
            }
            Opcode::Push => {
                let v = match instr.operand {
                    Operand::Int(i) => Value::Int(i),
                    Operand::Float(f) => Value::Float(f),
                    Operand::Bool(b) => Value::Bool(b),
                    _ => return Err(FaultKind::InvalidOperand(instr.opcode)),
                };
                t.stack.push(v);
            }
            Opcode::Capref => {
                let group = Self::index(instr)?;
                let slot = usize::try_from(pop_int(t)?)
                    .map_err(|_| FaultKind::InvalidOperand(instr.opcode))?;
                let text = t
                    .matches
                    .get(&slot)
                    .and_then(|groups| groups.get(group))
                    .cloned()
                    .ok_or(FaultKind::NoMatch { slot, group })?;
                t.stack.push(Value::Str(text));
            }
            Opcode::Str => {
                let s = self
                    .object
                    .strings
                    .get(Self::index(instr)?)
                    .ok_or(FaultKind::InvalidOperand(instr.opcode))?;
                t.stack.push(Value::Str(s.clone()));
            }
            Opcode::Iset => {
                let v = pop_int(t)?;
                let datum = pop_datum(t)?;
                datum.set_int(v, Self::now(t))?;
            }
            Opcode::Fset => {
                let v = pop_float(t)?;
                let datum = pop_datum(t)?;
                datum.set_float(v, Self::now(t))?;
            }
            Opcode::Sset => {
                let v = pop_string(t)?;
                let datum = pop_datum(t)?;
                datum.set_string(&v, Self::now(t))?;
            }
            Opcode::Iget => {
                let datum = pop_datum(t)?;
                t.stack.push(Value::Int(datum.get_int()?));
            }
            Opcode::Fget => {
                let datum = pop_datum(t)?;
                t.stack.push(Value::Float(datum.get_float()?));
            }
            Opcode::Sget => {
                let datum = pop_datum(t)?;
                t.stack.push(Value::Str(datum.value_string()));
            }
            Opcode::Iadd
            | Opcode::Isub
            | Opcode::Imul
            | Opcode::Idiv
            | Opcode::Imod
            | Opcode::Ipow
            | Opcode::Shl
            | Opcode::Shr
            | Opcode::And
            | Opcode::Or
            | Opcode::Xor => {
                let b = pop_int(t)?;
                let a = pop_int(t)?;
                t.stack.push(Value::Int(int_op(instr.opcode, a, b)?));
            }
            Opcode::Fadd
            | Opcode::Fsub
            | Opcode::Fmul
            | Opcode::Fdiv
            | Opcode::Fmod
            | Opcode::Fpow => {
                let b = pop_float(t)?;
                let a = pop_float(t)?;
                let v = match instr.opcode {
                    Opcode::Fadd => a + b,
                    Opcode::Fsub => a - b,
                    Opcode::Fmul => a * b,
                    Opcode::Fdiv | Opcode::Fmod if b == 0.0 => {
                        return Err(FaultKind::DivisionByZero)
                    }
                    Opcode::Fdiv => a / b,
                    Opcode::Fmod => a % b,
                    _ => a.powf(b),
                };
                t.stack.push(Value::Float(v));
            }
            Opcode::Neg => {
                let a = pop_int(t)?;
                t.stack.push(Value::Int(!a));
            }
            Opcode::Not => {
                let a = pop_bool(t)?;
                t.stack.push(Value::Bool(!a));
            }
            Opcode::Mload => {
                let m = self
                    .object
                    .metrics
                    .get(Self::index(instr)?)
                    .ok_or(FaultKind::InvalidOperand(instr.opcode))?;
                t.stack.push(Value::Metric(m.clone()));
            }
            Opcode::Dload => {
                let n = Self::index(instr)?;
                let metric = pop_metric(t)?;
                let labels = pop_labels(t, n)?;
                t.stack.push(Value::Datum(metric.get_datum(&labels)?));
            }
            Opcode::Del => {
                let n = Self::index(instr)?;
                let metric = pop_metric(t)?;
                let labels = pop_labels(t, n)?;
                metric.remove_datum(&labels)?;
            }
            Opcode::Expire => {
                let n = Self::index(instr)?;
                let metric = pop_metric(t)?;
                let labels = pop_labels(t, n)?;
                let nanos = pop_int(t)?;
                metric.expire_datum(&labels, Duration::from_nanos(nanos.max(0) as u64))?;
            }
            Opcode::Tolower => {
                let s = pop_string(t)?;
                t.stack.push(Value::Str(s.to_lowercase()));
            }
            Opcode::Length => {
                let s = pop_string(t)?;
                t.stack.push(Value::Int(s.chars().count() as i64));
            }
            Opcode::Cat => {
                let b = pop_string(t)?;
                let mut a = pop_string(t)?;
                a.push_str(&b);
                t.stack.push(Value::Str(a));
            }
            Opcode::Subst => {
                let value = pop_string(t)?;
                let new = pop_string(t)?;
                let old = pop_string(t)?;
                t.stack.push(Value::Str(value.replace(&old, &new)));
            }
            Opcode::Rsubst => {
                let (_, re) = self.regex(instr)?;
                let value = pop_string(t)?;
                let new = pop_string(t)?;
                let replaced = re.replace_all(&value, new.as_str()).into_owned();
                t.stack.push(Value::Str(replaced));
            }
            Opcode::Setmatched => {
                let Operand::Bool(b) = instr.operand else {
                    return Err(FaultKind::InvalidOperand(instr.opcode));
                };
                t.matched = b;
            }
            Opcode::Otherwise => t.stack.push(Value::Bool(!t.matched)),
            Opcode::Getfilename => t.stack.push(Value::Str(line.filename.to_string())),
            Opcode::Stop => return Ok(Flow::Stop),
            Opcode::S2i => {
                let base = if instr.operand == Operand::Int(1) {
                    let base = pop_int(t)?;
                    if !(2..=36).contains(&base) {
                        return Err(FaultKind::InvalidBase(base));
                    }
                    base as u32
                } else {
                    10
                };
                let v = match pop(t)? {
                    Value::Str(s) => i64::from_str_radix(s.trim(), base).map_err(|_| {
                        FaultKind::Parse {
                            value: s,
                            ty: "int",
                        }
                    })?,
                    Value::Int(i) => i,
                    Value::Float(f) => f as i64,
                    other => {
                        return Err(FaultKind::TypeMismatch {
                            expected: "string",
                            found: other.type_name(),
                        })
                    }
                };
                t.stack.push(Value::Int(v));
            }
            Opcode::S2f => {
                let v = pop_float(t)?;
                t.stack.push(Value::Float(v));
            }
            Opcode::I2f => {
                let v = pop_int(t)?;
                t.stack.push(Value::Float(v as f64));
            }
            Opcode::I2s => {
                let v = pop_int(t)?;
                t.stack.push(Value::Str(v.to_string()));
            }
            Opcode::F2s => {
                let v = pop_float(t)?;
                t.stack.push(Value::Str(format_float(v)));
            }
            Opcode::F2i => {
                let v = pop_float(t)?;
                t.stack.push(Value::Int(v as i64));
            }
        }
        Ok(Flow::Next)
    }
}

fn int_op(opcode: Opcode, a: i64, b: i64) -> Result<i64, FaultKind> {
    Ok(match opcode {
        Opcode::Iadd => a.wrapping_add(b),
        Opcode::Isub => a.wrapping_sub(b),
        Opcode::Imul => a.wrapping_mul(b),
        Opcode::Idiv | Opcode::Imod if b == 0 => return Err(FaultKind::DivisionByZero),
        Opcode::Idiv => a.wrapping_div(b),
        Opcode::Imod => a.wrapping_rem(b),
        Opcode::Ipow => int_pow(a, b),
        Opcode::Shl => shift_left(a, b),
        Opcode::Shr => shift_right(a, b),
        Opcode::And => a & b,
        Opcode::Or => a | b,
        _ => a ^ b,
    })
}

fn pop(t: &mut Thread) -> Result<Value, FaultKind> {
    t.stack.pop().ok_or(FaultKind::StackUnderflow)
}

/// Parses a numeric string as an integer, falling back to a float.
fn parse_number(s: &str) -> Result<Value, FaultKind> {
    let trimmed = s.trim();
    if let Ok(i) = trimmed.parse::<i64>() {
        return Ok(Value::Int(i));
    }
    trimmed.parse::<f64>().map(Value::Float).map_err(|_| FaultKind::Parse {
        value: s.to_string(),
        ty: "number",
    })
}

fn pop_int(t: &mut Thread) -> Result<i64, FaultKind> {
    match pop(t)? {
        Value::Int(i) => Ok(i),
        Value::Float(f) => Ok(f as i64),
        Value::Bool(b) => Ok(b as i64),
        Value::Str(s) => match parse_number(&s) {
            Ok(Value::Int(i)) => Ok(i),
            Ok(Value::Float(f)) => Ok(f as i64),
            _ => Err(FaultKind::Parse {
                value: s,
                ty: "int",
            }),
        },
        other => Err(FaultKind::TypeMismatch {
            expected: "int",
            found: other.type_name(),
        }),
    }
}

fn pop_float(t: &mut Thread) -> Result<f64, FaultKind> {
    match pop(t)? {
        Value::Int(i) => Ok(i as f64),
        Value::Float(f) => Ok(f),
        Value::Str(s) => s.trim().parse::<f64>().map_err(|_| FaultKind::Parse {
            value: s,
            ty: "float",
        }),
        other => Err(FaultKind::TypeMismatch {
            expected: "float",
            found: other.type_name(),
        }),
    }
}

fn pop_string(t: &mut Thread) -> Result<String, FaultKind> {
    match pop(t)? {
        Value::Str(s) => Ok(s),
        Value::Int(i) => Ok(i.to_string()),
        Value::Float(f) => Ok(format_float(f)),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(FaultKind::TypeMismatch {
            expected: "string",
            found: other.type_name(),
        }),
    }
}

fn pop_bool(t: &mut Thread) -> Result<bool, FaultKind> {
    match pop(t)? {
        Value::Bool(b) => Ok(b),
        Value::Int(i) => Ok(i != 0),
        other => Err(FaultKind::TypeMismatch {
            expected: "bool",
            found: other.type_name(),
        }),
    }
}

fn pop_datum(t: &mut Thread) -> Result<Arc<Datum>, FaultKind> {
    match pop(t)? {
        Value::Datum(d) => Ok(d),
        other => Err(FaultKind::TypeMismatch {
            expected: "datum",
            found: other.type_name(),
        }),
    }
}

fn pop_metric(t: &mut Thread) -> Result<Arc<Metric>, FaultKind> {
    match pop(t)? {
        Value::Metric(m) => Ok(m),
        other => Err(FaultKind::TypeMismatch {
            expected: "metric",
            found: other.type_name(),
        }),
    }
}

/// Pops `n` label values; the first label is deepest on the stack.
fn pop_labels(t: &mut Thread, n: usize) -> Result<Vec<String>, FaultKind> {
    let mut labels = Vec::with_capacity(n);
    for _ in 0..n {
        labels.push(pop_string(t)?);
    }
    labels.reverse();
    Ok(labels)
}

/// Compares two stack values. A string compared with a number is parsed as
/// that number's type; an integer parse that fails is retried as a float.
fn compare(op: CmpOp, a: &Value, b: &Value) -> Result<bool, FaultKind> {
    let ordering = match (a, b) {
        (Value::Int(x), Value::Int(y)) => Some(x.cmp(y)),
        (Value::Float(x), Value::Float(y)) => x.partial_cmp(y),
        (Value::Int(x), Value::Float(y)) => (*x as f64).partial_cmp(y),
        (Value::Float(x), Value::Int(y)) => x.partial_cmp(&(*y as f64)),
        (Value::Str(x), Value::Str(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Str(s), n @ (Value::Int(_) | Value::Float(_))) => {
            numeric_ordering(&coerce_str(s, n)?, n)
        }
        (n @ (Value::Int(_) | Value::Float(_)), Value::Str(s)) => {
            numeric_ordering(n, &coerce_str(s, n)?)
        }
        _ => {
            return Err(FaultKind::TypeMismatch {
                expected: a.type_name(),
                found: b.type_name(),
            })
        }
    };
    // NaN is unordered: only `!=` holds.
    Ok(match ordering {
        Some(o) => op.holds(o),
        None => op == CmpOp::Ne,
    })
}

fn coerce_str(s: &str, like: &Value) -> Result<Value, FaultKind> {
    match like {
        Value::Int(_) => parse_number(s),
        _ => s
            .trim()
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| FaultKind::Parse {
                value: s.to_string(),
                ty: "float",
            }),
    }
}

fn numeric_ordering(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Some(x.cmp(y)),
        (Value::Int(x), Value::Float(y)) => (*x as f64).partial_cmp(y),
        (Value::Float(x), Value::Int(y)) => x.partial_cmp(&(*y as f64)),
        (Value::Float(x), Value::Float(y)) => x.partial_cmp(y),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{compile, CompileOptions};
    use crate::metrics::{DatumValue, Kind, ValueType};

    fn object(program: Vec<Instr>) -> Object {
        Object {
            name: "test".to_string(),
            program,
            regexes: vec![regex::Regex::new("a+").unwrap()],
            strings: vec![],
            metrics: vec![],
        }
    }

    fn instr(opcode: Opcode) -> Instr {
        Instr::new(opcode, Operand::None, 1)
    }

    /// Runs a single instruction over `stack` and returns the resulting stack.
    fn exec_one(instr: Instr, stack: Vec<Value>) -> Result<Vec<Value>, FaultKind> {
        let vm = Vm::new(object(vec![instr]), VmOptions::default());
        let mut t = Thread::new();
        t.stack = stack;
        vm.run(&mut t, &LogLine::new("test", ""))?;
        Ok(t.stack)
    }

    #[test]
    fn test_integer_arithmetic() {
        let cases = [
            (Opcode::Iadd, 2, 1, 3),
            (Opcode::Isub, 2, 1, 1),
            (Opcode::Imul, 2, 1, 2),
            (Opcode::Idiv, 4, 2, 2),
            (Opcode::Imod, 4, 2, 0),
            (Opcode::Imod, 3, 2, 1),
            (Opcode::Ipow, 2, 2, 4),
            (Opcode::Shl, 1, 4, 16),
            (Opcode::Xor, 6, 3, 5),
        ];
        for (op, a, b, want) in cases {
            let got = exec_one(instr(op), vec![Value::Int(a), Value::Int(b)]).unwrap();
            assert_eq!(got, vec![Value::Int(want)], "{} {} {}", op, a, b);
        }
    }

    #[test]
    fn test_float_arithmetic() {
        let got = exec_one(instr(Opcode::Fdiv), vec![Value::Float(1.0), Value::Float(4.0)]).unwrap();
        assert_eq!(got, vec![Value::Float(0.25)]);
        let got = exec_one(instr(Opcode::Fpow), vec![Value::Float(2.0), Value::Float(3.0)]).unwrap();
        assert_eq!(got, vec![Value::Float(8.0)]);
    }

    #[test]
    fn test_division_by_zero_faults() {
        let err = exec_one(instr(Opcode::Idiv), vec![Value::Int(1), Value::Int(0)]).unwrap_err();
        assert_eq!(err, FaultKind::DivisionByZero);
        let err = exec_one(instr(Opcode::Fmod), vec![Value::Float(1.0), Value::Float(0.0)])
            .unwrap_err();
        assert_eq!(err, FaultKind::DivisionByZero);
    }

    #[test]
    fn test_compare() {
        let cmp = |op| Instr::new(Opcode::Cmp, Operand::Cmp(op), 1);
        let cases = [
            (CmpOp::Gt, Value::Float(2.0), Value::Float(1.0), true),
            (CmpOp::Gt, Value::Str("1.0".into()), Value::Int(2), false),
            (CmpOp::Eq, Value::Str("abc".into()), Value::Str("abc".into()), true),
            (CmpOp::Eq, Value::Str("abc".into()), Value::Str("def".into()), false),
            (CmpOp::Lt, Value::Int(1), Value::Str("10".into()), true),
            (CmpOp::Ne, Value::Float(f64::NAN), Value::Float(1.0), true),
            (CmpOp::Eq, Value::Float(f64::NAN), Value::Float(f64::NAN), false),
        ];
        for (op, a, b, want) in cases {
            let got = exec_one(cmp(op), vec![a.clone(), b.clone()]).unwrap();
            assert_eq!(got, vec![Value::Bool(want)], "{:?} {} {:?}", a, op, b);
        }
    }

    #[test]
    fn test_compare_unparsable_string_faults() {
        let cmp = Instr::new(Opcode::Cmp, Operand::Cmp(CmpOp::Lt), 1);
        let err = exec_one(cmp, vec![Value::Str("abc".into()), Value::Int(1)]).unwrap_err();
        assert!(matches!(err, FaultKind::Parse { .. }));
    }

    #[test]
    fn test_string_ops() {
        let got = exec_one(
            instr(Opcode::Subst),
            vec![
                Value::Str("aa".into()),
                Value::Str("a".into()),
                Value::Str("caat".into()),
            ],
        )
        .unwrap();
        assert_eq!(got, vec![Value::Str("cat".into())]);

        let rsubst = Instr::new(Opcode::Rsubst, Operand::Int(0), 1);
        let got = exec_one(rsubst, vec![Value::Str("b".into()), Value::Str("caaat".into())]).unwrap();
        assert_eq!(got, vec![Value::Str("cbt".into())]);

        let got = exec_one(instr(Opcode::Cat), vec![Value::Str("ab".into()), Value::Int(3)]).unwrap();
        assert_eq!(got, vec![Value::Str("ab3".into())]);

        let got = exec_one(instr(Opcode::Length), vec![Value::Str("héllo".into())]).unwrap();
        assert_eq!(got, vec![Value::Int(5)]);
    }

    #[test]
    fn test_conversions() {
        let got = exec_one(instr(Opcode::S2i), vec![Value::Str(" 42 ".into())]).unwrap();
        assert_eq!(got, vec![Value::Int(42)]);
        let strtol = Instr::new(Opcode::S2i, Operand::Int(1), 1);
        let got = exec_one(strtol, vec![Value::Str("ff".into()), Value::Int(16)]).unwrap();
        assert_eq!(got, vec![Value::Int(255)]);
        let err = exec_one(strtol, vec![Value::Str("ff".into()), Value::Int(99)]).unwrap_err();
        assert_eq!(err, FaultKind::InvalidBase(99));
        let got = exec_one(instr(Opcode::F2s), vec![Value::Float(1.5)]).unwrap();
        assert_eq!(got, vec![Value::Str("1.5".into())]);
        let err = exec_one(instr(Opcode::S2f), vec![Value::Str("x".into())]).unwrap_err();
        assert!(matches!(err, FaultKind::Parse { .. }));
    }

    #[test]
    fn test_strptime_sets_thread_time() {
        let vm = Vm::new(object(vec![instr(Opcode::Strptime)]), VmOptions::default());
        let mut t = Thread::new();
        t.stack = vec![
            Value::Str("2012/01/18 06:25:00".into()),
            Value::Str("2006/01/02 15:04:05".into()),
        ];
        vm.run(&mut t, &LogLine::new("test", "")).unwrap();
        assert_eq!(t.time, Utc.with_ymd_and_hms(2012, 1, 18, 6, 25, 0).single());
    }

    #[test]
    fn test_strptime_with_location() {
        let options = VmOptions {
            timezone: Some(timefmt::Location::parse("Europe/Berlin").unwrap()),
            ..VmOptions::default()
        };
        let vm = Vm::new(object(vec![instr(Opcode::Strptime)]), options);
        let mut t = Thread::new();
        t.stack = vec![
            Value::Str("2012/01/18 06:25:00".into()),
            Value::Str("2006/01/02 15:04:05".into()),
        ];
        vm.run(&mut t, &LogLine::new("test", "")).unwrap();
        // 06:25 CET.
        assert_eq!(t.time, Utc.with_ymd_and_hms(2012, 1, 18, 5, 25, 0).single());
    }

    #[test]
    fn test_stack_underflow() {
        for op in [Opcode::Iadd, Opcode::Cat, Opcode::Jnm, Opcode::Iset, Opcode::Not] {
            let op = if op == Opcode::Jnm {
                Instr::new(op, Operand::Int(0), 1)
            } else {
                instr(op)
            };
            assert_eq!(exec_one(op, vec![]).unwrap_err(), FaultKind::StackUnderflow);
        }
    }

    #[test]
    fn test_execute_reports_fault_position() {
        let vm = Vm::new(
            object(vec![
                Instr::new(Opcode::Push, Operand::Int(1), 1),
                Instr::new(Opcode::Push, Operand::Int(0), 2),
                Instr::new(Opcode::Imod, Operand::None, 3),
            ]),
            VmOptions::default(),
        );
        let mut t = Thread::new();
        let fault = vm.execute(&mut t, &LogLine::new("f", "x")).unwrap_err();
        assert_eq!(fault.pc, 2);
        assert_eq!(fault.source_line, 3);
        assert!(t.terminated);
        assert_eq!(fault.to_string(), "test: runtime fault at pc 2 (line 3): division by zero");
    }

    fn run_program(src: &str, lines: &[&str]) -> Object {
        let obj = compile("prog.lpm", src, &CompileOptions::default()).unwrap();
        let vm = Vm::new(obj.clone(), VmOptions::default());
        let mut t = Thread::new();
        for line in lines {
            vm.execute(&mut t, &LogLine::new("/var/log/app.log", *line)).unwrap();
        }
        obj
    }

    fn value(obj: &Object, metric: usize, labels: &[&str]) -> DatumValue {
        let labels: Vec<String> = labels.iter().map(|s| s.to_string()).collect();
        obj.metrics[metric].get_datum(&labels).unwrap().value()
    }

    #[test]
    fn test_counter_and_labels() {
        let obj = run_program(
            "counter lines\ncounter bytes by method\n/^(\\w+) (\\d+)$/ {\n lines++\n bytes[$1] += $2\n}\n",
            &["GET 10", "POST 5", "GET 7", "junk"],
        );
        assert_eq!(value(&obj, 0, &[]), DatumValue::Int(3));
        assert_eq!(value(&obj, 1, &["GET"]), DatumValue::Int(17));
        assert_eq!(value(&obj, 1, &["POST"]), DatumValue::Int(5));
    }

    #[test]
    fn test_otherwise_and_else() {
        let obj = run_program(
            "counter a\ncounter b\ncounter c\n/x/ {\n a++\n}\notherwise {\n b++\n}\n/y/ {\n} else {\n c++\n}\n",
            &["x", "z", "y"],
        );
        assert_eq!(value(&obj, 0, &[]), DatumValue::Int(1));
        assert_eq!(value(&obj, 1, &[]), DatumValue::Int(2));
        assert_eq!(value(&obj, 2, &[]), DatumValue::Int(2));
    }

    #[test]
    fn test_stop_ends_line() {
        let obj = compile(
            "prog.lpm",
            "counter a\n/skip/ {\n stop\n}\na++\n",
            &CompileOptions::default(),
        )
        .unwrap();
        let vm = Vm::new(obj.clone(), VmOptions::default());
        let mut t = Thread::new();
        let outcome = vm.execute(&mut t, &LogLine::new("f", "skip me")).unwrap();
        assert_eq!(outcome, ExecutionOutcome::Stopped);
        assert_eq!(vm.execute(&mut t, &LogLine::new("f", "count me")).unwrap(), ExecutionOutcome::Completed);
        assert_eq!(value(&obj, 0, &[]), DatumValue::Int(1));
    }

    #[test]
    fn test_float_promotion_and_text() {
        let obj = run_program(
            "gauge latency\ntext last\n/took (\\d+\\.\\d+)s by (\\w+)/ {\n latency = $1\n last = $2\n}\n",
            &["took 1.25s by alice", "took 0.5s by bob"],
        );
        assert_eq!(obj.metrics[0].value_type, ValueType::Float);
        assert_eq!(obj.metrics[1].kind, Kind::Text);
        assert_eq!(value(&obj, 0, &[]), DatumValue::Float(0.5));
        assert_eq!(value(&obj, 1, &[]), DatumValue::String("bob".into()));
    }

    #[test]
    fn test_timestamp_follows_strptime() {
        let obj = run_program(
            "gauge ts\n/^(\\S+ \\S+) / {\n strptime($1, \"2006/01/02 15:04:05\")\n ts = timestamp()\n}\n",
            &["2012/01/18 06:25:00 started"],
        );
        assert_eq!(value(&obj, 0, &[]), DatumValue::Int(1326867900));
        let datum = obj.metrics[0].get_datum(&[]).unwrap();
        assert_eq!(datum.time().timestamp(), 1326867900);
    }

    #[test]
    fn test_getfilename_label() {
        let obj = run_program("counter lines by file\nlines[getfilename()]++\n", &["a", "b"]);
        assert_eq!(value(&obj, 0, &["/var/log/app.log"]), DatumValue::Int(2));
    }

    #[test]
    fn test_delete_label_set() {
        let obj = run_program(
            "counter open by id\n/open (\\d+)/ {\n open[$1]++\n}\n/close (\\d+)/ {\n del open[$1]\n}\n",
            &["open 1", "open 2", "close 1"],
        );
        assert_eq!(obj.metrics[0].len(), 1);
        assert!(obj.metrics[0].expiry(&["2".to_string()]).is_none());
    }

    #[test]
    fn test_histogram_observes() {
        let obj = run_program(
            "histogram h buckets 0, 1, 2\n/(\\d+)/ {\n h = $1\n}\n",
            &["0", "1", "5"],
        );
        let DatumValue::Buckets(b) = value(&obj, 0, &[]) else {
            panic!("expected buckets");
        };
        assert_eq!(b.count, 3);
        assert_eq!(b.sum, 6.0);
        assert_eq!(b.cumulative(), vec![(1.0, 1), (2.0, 2), (f64::INFINITY, 3)]);
    }

    #[test]
    fn test_decrement_overflow_faults() {
        let m = Metric::new("c", "test", Kind::Counter, ValueType::Int, vec![]);
        let datum = m.get_datum(&[]).unwrap();
        let dec = Instr::new(Opcode::Dec, Operand::Int(1), 1);
        let err = exec_one(dec, vec![Value::Datum(datum.clone()), Value::Int(i64::MIN)])
            .unwrap_err();
        assert_eq!(err, FaultKind::Overflow(Opcode::Dec));
        assert_eq!(datum.value(), DatumValue::Int(0));

        exec_one(dec, vec![Value::Datum(datum.clone()), Value::Int(i64::MAX)]).unwrap();
        assert_eq!(datum.value(), DatumValue::Int(-i64::MAX));
    }

    #[test]
    fn test_shifts_out_of_range() {
        assert_eq!(shift_left(1, 64), 0);
        assert_eq!(shift_left(1, -1), 0);
        assert_eq!(shift_right(-8, 70), -1);
        assert_eq!(shift_right(8, 70), 0);
        assert_eq!(shift_right(-8, 1), -4);
    }

    #[test]
    fn test_int_pow() {
        assert_eq!(int_pow(2, 10), 1024);
        assert_eq!(int_pow(2, -1), 0);
        assert_eq!(int_pow(-3, 3), -27);
    }
}
