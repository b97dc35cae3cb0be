//! Tokenizer for program source.
//!
//! Tokens are produced by a logos-derived [`Token`] enum. Regular expression
//! literals cannot be told apart from division by the lexer alone, so the
//! parser asks for one explicitly with [`Lexer::scan_regex`] after consuming a
//! `/` in a position where an expression is expected.

use logos::Logos;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use super::errors::{CompileError, Position};

#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n]+")]
#[logos(skip r"#[^\n]*")]
pub enum Token {
    // Declarations
    #[token("counter")]
    Counter,
    #[token("gauge")]
    Gauge,
    #[token("timer")]
    Timer,
    #[token("text")]
    Text,
    #[token("histogram")]
    Histogram,
    #[token("hidden")]
    Hidden,
    #[token("by")]
    By,
    #[token("as")]
    As,
    #[token("buckets")]
    Buckets,
    #[token("limit")]
    Limit,
    #[token("const")]
    Const,

    // Statements
    #[token("else")]
    Else,
    #[token("otherwise")]
    Otherwise,
    #[token("del")]
    Del,
    #[token("after")]
    After,
    #[token("stop")]
    Stop,

    // Delimiters
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token(",")]
    Comma,

    // Operators
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("%")]
    Percent,
    #[token("**")]
    Pow,
    #[token("<<")]
    Shl,
    #[token(">>")]
    Shr,
    #[token("&")]
    BitAnd,
    #[token("|")]
    BitOr,
    #[token("^")]
    BitXor,
    #[token("~")]
    Tilde,
    #[token("!")]
    Not,
    #[token("&&")]
    And,
    #[token("||")]
    Or,
    #[token("<")]
    Lt,
    #[token(">")]
    Gt,
    #[token("<=")]
    Le,
    #[token(">=")]
    Ge,
    #[token("==")]
    Eq,
    #[token("!=")]
    Ne,
    #[token("=~")]
    Match,
    #[token("!~")]
    NotMatch,
    #[token("=")]
    Assign,
    #[token("+=")]
    AddAssign,
    #[token("++")]
    Inc,
    #[token("--")]
    Dec,

    // Literals
    #[regex(r"[0-9]+(ns|us|ms|s|m|h)([0-9]+(ns|us|ms|s|m|h))*", parse_duration)]
    Duration(Duration),
    #[regex(r"[0-9]+\.[0-9]*([eE][+-]?[0-9]+)?", |lex| lex.slice().parse::<f64>().ok())]
    Float(f64),
    #[regex(r"[0-9]+", |lex| lex.slice().parse::<i64>().ok())]
    Int(i64),
    #[regex(r#""([^"\\\n]|\\.)*""#, |lex| unescape_string(lex.slice()))]
    Str(String),
    #[regex(r"\$[0-9]+", |lex| lex.slice()[1..].to_string())]
    #[regex(r"\$[a-zA-Z_][a-zA-Z0-9_]*", |lex| lex.slice()[1..].to_string())]
    Capref(String),
    #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*", |lex| lex.slice().to_string())]
    Ident(String),
}

fn parse_duration(lex: &mut logos::Lexer<Token>) -> Option<Duration> {
    let s = lex.slice();
    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit())?;
        let value: u64 = rest[..digits].parse().ok()?;
        rest = &rest[digits..];
        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];
        let part = match unit {
            "ns" => Duration::from_nanos(value),
            "us" => Duration::from_micros(value),
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value.checked_mul(60)?),
            "h" => Duration::from_secs(value.checked_mul(3600)?),
            _ => return None,
        };
        total = total.checked_add(part)?;
    }
    Some(total)
}

fn unescape_string(s: &str) -> Option<String> {
    let inner = &s[1..s.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next()? {
            'n' => out.push('\n'),
            't' => out.push('\t'),
            'r' => out.push('\r'),
            '"' => out.push('"'),
            '\\' => out.push('\\'),
            other => {
                out.push('\\');
                out.push(other);
            }
        }
    }
    Some(out)
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Token::Counter => "counter",
            Token::Gauge => "gauge",
            Token::Timer => "timer",
            Token::Text => "text",
            Token::Histogram => "histogram",
            Token::Hidden => "hidden",
            Token::By => "by",
            Token::As => "as",
            Token::Buckets => "buckets",
            Token::Limit => "limit",
            Token::Const => "const",
            Token::Else => "else",
            Token::Otherwise => "otherwise",
            Token::Del => "del",
            Token::After => "after",
            Token::Stop => "stop",
            Token::LBrace => "{",
            Token::RBrace => "}",
            Token::LParen => "(",
            Token::RParen => ")",
            Token::LBracket => "[",
            Token::RBracket => "]",
            Token::Comma => ",",
            Token::Plus => "+",
            Token::Minus => "-",
            Token::Star => "*",
            Token::Slash => "/",
            Token::Percent => "%",
            Token::Pow => "**",
            Token::Shl => "<<",
            Token::Shr => ">>",
            Token::BitAnd => "&",
            Token::BitOr => "|",
            Token::BitXor => "^",
            Token::Tilde => "~",
            Token::Not => "!",
            Token::And => "&&",
            Token::Or => "||",
            Token::Lt => "<",
            Token::Gt => ">",
            Token::Le => "<=",
            Token::Ge => ">=",
            Token::Eq => "==",
            Token::Ne => "!=",
            Token::Match => "=~",
            Token::NotMatch => "!~",
            Token::Assign => "=",
            Token::AddAssign => "+=",
            Token::Inc => "++",
            Token::Dec => "--",
            Token::Duration(d) => return write!(f, "{:?}", d),
            Token::Float(v) => return write!(f, "{}", v),
            Token::Int(v) => return write!(f, "{}", v),
            Token::Str(s) => return write!(f, "{:?}", s),
            Token::Capref(s) => return write!(f, "${}", s),
            Token::Ident(s) => return f.write_str(s),
        };
        f.write_str(s)
    }
}

/// A token with its byte span in the source.
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub span: Range<usize>,
}

/// Source tokenizer with position tracking.
pub struct Lexer<'src> {
    inner: logos::Lexer<'src, Token>,
    filename: Arc<str>,
    line_starts: Vec<usize>,
}

impl<'src> Lexer<'src> {
    pub fn new(filename: &str, source: &'src str) -> Self {
        let mut line_starts = vec![0];
        line_starts.extend(memchr::memchr_iter(b'\n', source.as_bytes()).map(|i| i + 1));
        Self {
            inner: Token::lexer(source),
            filename: Arc::from(filename),
            line_starts,
        }
    }

    pub fn filename(&self) -> &Arc<str> {
        &self.filename
    }

    /// Converts a byte span to a line/column position.
    pub fn position(&self, span: Range<usize>) -> Position {
        let line_idx = match self.line_starts.binary_search(&span.start) {
            Ok(i) => i,
            Err(i) => i - 1,
        };
        let line_start = self.line_starts[line_idx];
        let start_col = span.start - line_start + 1;
        let end_col = span.end.saturating_sub(line_start).max(start_col);
        Position::new(self.filename.clone(), line_idx + 1, start_col, end_col)
    }

    /// Position just past the end of input.
    pub fn eof_position(&self) -> Position {
        let end = self.inner.source().len();
        self.position(end..end)
    }

    /// Next token, or a lexical error for input no rule matches.
    pub fn next_token(&mut self) -> Option<Result<Spanned, CompileError>> {
        let token = self.inner.next()?;
        let span = self.inner.span();
        Some(match token {
            Ok(token) => Ok(Spanned { token, span }),
            Err(()) => Err(CompileError::new(
                self.position(span.clone()),
                format!("unexpected input {:?}", self.inner.slice()),
            )),
        })
    }

    /// Scans a regex literal body after its opening `/` at `open`.
    ///
    /// `\/` is unescaped to `/`; any other escape is passed through to the
    /// regex engine untouched.
    pub fn scan_regex(&mut self, open: Range<usize>) -> Result<(String, Position), CompileError> {
        let rest = self.inner.remainder();
        let mut body = String::new();
        let mut chars = rest.char_indices();
        while let Some((i, c)) = chars.next() {
            match c {
                '\\' => match chars.next() {
                    Some((_, '/')) => body.push('/'),
                    Some((_, other)) => {
                        body.push('\\');
                        body.push(other);
                    }
                    None => break,
                },
                '/' => {
                    let consumed = i + 1;
                    self.inner.bump(consumed);
                    let end = open.end + consumed;
                    return Ok((body, self.position(open.start..end)));
                }
                '\n' => break,
                _ => body.push(c),
            }
        }
        Err(CompileError::new(
            self.position(open),
            "unterminated regular expression",
        ))
    }
}
