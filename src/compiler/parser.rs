//! Recursive-descent parser with precedence climbing for binary operators.
//!
//! Syntax errors are collected rather than returned on first sight: after an
//! error the parser skips to the next statement boundary and carries on, so a
//! single compile reports every broken statement.

use std::ops::Range;

use super::ast::{AssignOp, BinOp, Builtin, Decl, Node, NodeKind, UnOp};
use super::errors::{CompileError, CompileErrors, Position};
use super::lexer::{Lexer, Spanned, Token};
use super::CompileOptions;
use crate::metrics::Kind;

type PResult<T> = Result<T, CompileError>;

/// Parses `source` into a statement list.
pub fn parse(name: &str, source: &str, options: &CompileOptions) -> Result<Node, CompileErrors> {
    let mut parser = Parser::new(name, source, options.max_recursion_depth);
    let ast = parser.parse_program();
    if parser.errors.is_empty() {
        Ok(ast)
    } else {
        Err(CompileErrors(parser.errors))
    }
}

/// Binding power and operator for a binary operator token.
fn binary_op_info(token: &Token) -> Option<(u8, BinOp)> {
    Some(match token {
        Token::Or => (1, BinOp::Or),
        Token::And => (2, BinOp::And),
        Token::BitOr => (3, BinOp::BitOr),
        Token::BitXor => (4, BinOp::BitXor),
        Token::BitAnd => (5, BinOp::BitAnd),
        Token::Lt => (6, BinOp::Lt),
        Token::Le => (6, BinOp::Le),
        Token::Gt => (6, BinOp::Gt),
        Token::Ge => (6, BinOp::Ge),
        Token::Eq => (6, BinOp::Eq),
        Token::Ne => (6, BinOp::Ne),
        Token::Match => (6, BinOp::Match),
        Token::NotMatch => (6, BinOp::NotMatch),
        Token::Shl => (7, BinOp::Shl),
        Token::Shr => (7, BinOp::Shr),
        Token::Plus => (8, BinOp::Add),
        Token::Minus => (8, BinOp::Sub),
        Token::Star => (9, BinOp::Mul),
        Token::Slash => (9, BinOp::Div),
        Token::Percent => (9, BinOp::Mod),
        _ => return None,
    })
}

fn decl_kind(token: &Token) -> Option<Kind> {
    Some(match token {
        Token::Counter => Kind::Counter,
        Token::Gauge => Kind::Gauge,
        Token::Timer => Kind::Timer,
        Token::Histogram => Kind::Histogram,
        Token::Text => Kind::Text,
        _ => return None,
    })
}

fn starts_statement(token: &Token) -> bool {
    matches!(
        token,
        Token::Counter
            | Token::Gauge
            | Token::Timer
            | Token::Histogram
            | Token::Text
            | Token::Hidden
            | Token::Const
            | Token::Otherwise
            | Token::Del
            | Token::Stop
    )
}

pub struct Parser<'src> {
    lexer: Lexer<'src>,
    peeked: Option<Spanned>,
    last_span: Range<usize>,
    consumed: usize,
    errors: Vec<CompileError>,
    depth: usize,
    max_depth: usize,
}

impl<'src> Parser<'src> {
    pub fn new(name: &str, source: &'src str, max_depth: usize) -> Self {
        Self {
            lexer: Lexer::new(name, source),
            peeked: None,
            last_span: 0..0,
            consumed: 0,
            errors: Vec::new(),
            depth: 0,
            max_depth,
        }
    }

    fn peek(&mut self) -> Option<&Token> {
        if self.peeked.is_none() {
            while let Some(next) = self.lexer.next_token() {
                match next {
                    Ok(spanned) => {
                        self.peeked = Some(spanned);
                        break;
                    }
                    Err(e) => self.errors.push(e),
                }
            }
        }
        self.peeked.as_ref().map(|s| &s.token)
    }

    fn advance(&mut self) -> Option<Spanned> {
        self.peek();
        let next = self.peeked.take();
        if let Some(s) = &next {
            self.last_span = s.span.clone();
            self.consumed += 1;
        }
        next
    }

    fn check(&mut self, token: &Token) -> bool {
        self.peek() == Some(token)
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.check(token) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn current_pos(&mut self) -> Position {
        self.peek();
        match &self.peeked {
            Some(s) => self.lexer.position(s.span.clone()),
            None => self.lexer.eof_position(),
        }
    }

    fn last_pos(&self) -> Position {
        self.lexer.position(self.last_span.clone())
    }

    fn unexpected(&mut self, expected: &str) -> CompileError {
        let pos = self.current_pos();
        match self.peek().cloned() {
            Some(token) => CompileError::new(
                pos,
                format!("unexpected `{}`, expected {}", token, expected),
            ),
            None => CompileError::new(pos, format!("unexpected end of input, expected {}", expected)),
        }
    }

    fn expect(&mut self, token: &Token) -> PResult<Spanned> {
        if self.check(token) {
            if let Some(s) = self.advance() {
                return Ok(s);
            }
        }
        Err(self.unexpected(&format!("`{}`", token)))
    }

    fn expect_ident(&mut self, what: &str) -> PResult<String> {
        if let Some(Token::Ident(name)) = self.peek().cloned() {
            self.advance();
            return Ok(name);
        }
        Err(self.unexpected(what))
    }

    fn enter(&mut self, pos: &Position) -> PResult<()> {
        self.depth += 1;
        if self.depth > self.max_depth {
            self.depth -= 1;
            return Err(CompileError::new(
                pos.clone(),
                format!("nesting exceeds the maximum depth of {}", self.max_depth),
            ));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    /// Skips ahead to something that can start the next statement.
    ///
    /// `mark` is the token count when the failed statement began; at least
    /// one token is always consumed past it so recovery makes progress.
    fn synchronize(&mut self, mark: usize) {
        while let Some(token) = self.peek().cloned() {
            let progressed = self.consumed > mark;
            match token {
                Token::RBrace => return,
                Token::LBrace => {
                    self.skip_block();
                    return;
                }
                t if progressed && starts_statement(&t) => return,
                _ => {
                    self.advance();
                }
            }
        }
    }

    fn skip_block(&mut self) {
        let mut depth = 0usize;
        while let Some(s) = self.advance() {
            match s.token {
                Token::LBrace => depth += 1,
                Token::RBrace => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        return;
                    }
                }
                _ => {}
            }
        }
    }

    fn parse_program(&mut self) -> Node {
        let start = self.current_pos();
        let mut stmts = Vec::new();
        while self.peek().is_some() {
            if self.check(&Token::RBrace) {
                let pos = self.current_pos();
                self.errors.push(CompileError::new(pos, "unexpected `}`"));
                self.advance();
                continue;
            }
            let mark = self.consumed;
            match self.parse_stmt() {
                Ok(stmt) => stmts.push(stmt),
                Err(e) => {
                    self.errors.push(e);
                    self.synchronize(mark);
                }
            }
        }
        Node::new(NodeKind::StmtList(stmts), start)
    }

    fn parse_block(&mut self) -> PResult<Node> {
        let open = self.expect(&Token::LBrace)?;
        let pos = self.lexer.position(open.span);
        self.enter(&pos)?;
        let mut stmts = Vec::new();
        loop {
            match self.peek() {
                None => {
                    self.leave();
                    return Err(CompileError::new(pos, "unterminated block, expected `}`"));
                }
                Some(Token::RBrace) => {
                    self.advance();
                    break;
                }
                Some(_) => {
                    let mark = self.consumed;
                    if let Err(e) = self.parse_stmt().map(|stmt| stmts.push(stmt)) {
                        self.errors.push(e);
                        self.synchronize(mark);
                    }
                }
            }
        }
        self.leave();
        Ok(Node::new(NodeKind::StmtList(stmts), pos))
    }

    fn parse_stmt(&mut self) -> PResult<Node> {
        let pos = self.current_pos();
        match self.peek().cloned() {
            Some(t) if decl_kind(&t).is_some() || t == Token::Hidden => self.parse_decl(),
            Some(Token::Const) => self.parse_const(),
            Some(Token::Del) => self.parse_delete(),
            Some(Token::Stop) => {
                self.advance();
                Ok(Node::new(NodeKind::Stop, pos))
            }
            Some(Token::Otherwise) => {
                self.advance();
                let cond = Node::boxed(NodeKind::Otherwise, pos.clone());
                let truth = self.parse_block()?;
                Ok(Node::new(
                    NodeKind::Cond {
                        cond,
                        truth: Box::new(truth),
                        else_branch: None,
                    },
                    pos,
                ))
            }
            Some(Token::LBrace) | None => Err(self.unexpected("a statement")),
            Some(_) => {
                let expr = self.parse_expr()?;
                if !self.check(&Token::LBrace) {
                    return Ok(expr);
                }
                let truth = self.parse_block()?;
                let else_branch = if self.eat(&Token::Else) {
                    Some(Box::new(self.parse_block()?))
                } else {
                    None
                };
                let pos = expr.pos.clone();
                Ok(Node::new(
                    NodeKind::Cond {
                        cond: Box::new(expr),
                        truth: Box::new(truth),
                        else_branch,
                    },
                    pos,
                ))
            }
        }
    }

    fn parse_decl(&mut self) -> PResult<Node> {
        let start = self.current_pos();
        let hidden = self.eat(&Token::Hidden);
        let kind = match self.peek().and_then(decl_kind) {
            Some(kind) => {
                self.advance();
                kind
            }
            None => return Err(self.unexpected("a metric kind")),
        };
        let name = self.expect_ident("a metric name")?;
        let mut decl = Decl {
            name,
            kind,
            keys: Vec::new(),
            exported_name: None,
            buckets: Vec::new(),
            limit: None,
            hidden,
        };

        loop {
            match self.peek() {
                Some(Token::By) => {
                    self.advance();
                    decl.keys = self.parse_key_list()?;
                }
                Some(Token::As) => {
                    self.advance();
                    match self.peek().cloned() {
                        Some(Token::Str(s)) => {
                            self.advance();
                            decl.exported_name = Some(s);
                        }
                        _ => return Err(self.unexpected("an exported name string")),
                    }
                }
                Some(Token::Buckets) => {
                    self.advance();
                    decl.buckets = self.parse_number_list()?;
                }
                Some(Token::Limit) => {
                    self.advance();
                    match self.peek().cloned() {
                        Some(Token::Int(n)) if n > 0 => {
                            self.advance();
                            decl.limit = Some(n as usize);
                        }
                        _ => return Err(self.unexpected("a positive label set limit")),
                    }
                }
                _ => break,
            }
        }

        let pos = start.merge(&self.last_pos());
        Ok(Node::new(NodeKind::Decl(decl), pos))
    }

    fn parse_key_list(&mut self) -> PResult<Vec<String>> {
        let mut keys = Vec::new();
        loop {
            match self.peek().cloned() {
                Some(Token::Ident(k)) | Some(Token::Str(k)) => {
                    self.advance();
                    keys.push(k);
                }
                _ => return Err(self.unexpected("a label key")),
            }
            if !self.eat(&Token::Comma) {
                return Ok(keys);
            }
        }
    }

    fn parse_number_list(&mut self) -> PResult<Vec<f64>> {
        let mut values = Vec::new();
        loop {
            let negative = self.eat(&Token::Minus);
            let v = match self.peek().cloned() {
                Some(Token::Int(v)) => v as f64,
                Some(Token::Float(v)) => v,
                _ => return Err(self.unexpected("a bucket boundary")),
            };
            self.advance();
            values.push(if negative { -v } else { v });
            if !self.eat(&Token::Comma) {
                return Ok(values);
            }
        }
    }

    fn parse_const(&mut self) -> PResult<Node> {
        let start = self.current_pos();
        self.advance();
        let name = self.expect_ident("a constant name")?;
        let pattern = self.parse_expr()?;
        let pos = start.merge(&pattern.pos);
        Ok(Node::new(
            NodeKind::PatternConst {
                name,
                pattern: Box::new(pattern),
            },
            pos,
        ))
    }

    fn parse_delete(&mut self) -> PResult<Node> {
        let start = self.current_pos();
        self.advance();
        let target = self.parse_primary()?;
        let expiry = if self.eat(&Token::After) {
            match self.peek().cloned() {
                Some(Token::Duration(d)) => {
                    self.advance();
                    Some(d)
                }
                _ => return Err(self.unexpected("a duration")),
            }
        } else {
            None
        };
        let pos = start.merge(&self.last_pos());
        Ok(Node::new(
            NodeKind::Delete {
                target: Box::new(target),
                expiry,
            },
            pos,
        ))
    }

    /// Assignment is the loosest-binding, right-associative form.
    fn parse_expr(&mut self) -> PResult<Node> {
        let lhs = self.parse_binary(1)?;
        let op = match self.peek() {
            Some(Token::Assign) => AssignOp::Set,
            Some(Token::AddAssign) => AssignOp::Add,
            _ => return Ok(lhs),
        };
        self.advance();
        let rhs = self.parse_expr()?;
        let pos = lhs.pos.merge(&rhs.pos);
        Ok(Node::new(
            NodeKind::Assign {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
            pos,
        ))
    }

    fn parse_binary(&mut self, min_prec: u8) -> PResult<Node> {
        let pos = self.current_pos();
        self.enter(&pos)?;
        let result = self.parse_binary_inner(min_prec);
        self.leave();
        result
    }

    fn parse_binary_inner(&mut self, min_prec: u8) -> PResult<Node> {
        let mut lhs = self.parse_unary()?;
        loop {
            let Some((prec, op)) = self.peek().and_then(binary_op_info) else {
                break;
            };
            if prec < min_prec {
                break;
            }
            self.advance();
            let rhs = self.parse_binary(prec + 1)?;
            let pos = lhs.pos.merge(&rhs.pos);
            lhs = Node::new(
                NodeKind::Binary {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                pos,
            );
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> PResult<Node> {
        let op = match self.peek() {
            Some(Token::Not) => UnOp::Not,
            Some(Token::Minus) => UnOp::Minus,
            Some(Token::Tilde) => UnOp::BitNot,
            _ => return self.parse_pow(),
        };
        let pos = self.current_pos();
        self.advance();
        self.enter(&pos)?;
        let operand = self.parse_unary();
        self.leave();
        let operand = operand?;
        let pos = pos.merge(&operand.pos);
        Ok(Node::new(
            NodeKind::Unary {
                op,
                operand: Box::new(operand),
            },
            pos,
        ))
    }

    /// `**` binds tighter than unary minus and associates to the right.
    fn parse_pow(&mut self) -> PResult<Node> {
        let base = self.parse_postfix()?;
        if !self.eat(&Token::Pow) {
            return Ok(base);
        }
        let exponent = self.parse_unary()?;
        let pos = base.pos.merge(&exponent.pos);
        Ok(Node::new(
            NodeKind::Binary {
                op: BinOp::Pow,
                lhs: Box::new(base),
                rhs: Box::new(exponent),
            },
            pos,
        ))
    }

    fn parse_postfix(&mut self) -> PResult<Node> {
        let mut node = self.parse_primary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Inc) => UnOp::Inc,
                Some(Token::Dec) => UnOp::Dec,
                _ => break,
            };
            self.advance();
            let pos = node.pos.merge(&self.last_pos());
            node = Node::new(
                NodeKind::Unary {
                    op,
                    operand: Box::new(node),
                },
                pos,
            );
        }
        Ok(node)
    }

    fn parse_primary(&mut self) -> PResult<Node> {
        let Some(spanned) = self.advance() else {
            return Err(self.unexpected("an expression"));
        };
        let pos = self.lexer.position(spanned.span.clone());
        match spanned.token {
            Token::Int(v) => Ok(Node::new(NodeKind::IntLit(v), pos)),
            Token::Float(v) => Ok(Node::new(NodeKind::FloatLit(v), pos)),
            Token::Str(s) => Ok(Node::new(NodeKind::StringLit(s), pos)),
            Token::Capref(name) => Ok(Node::new(
                NodeKind::Capref {
                    name,
                    binding: None,
                },
                pos,
            )),
            Token::Slash => {
                let (regex, pos) = self.lexer.scan_regex(spanned.span)?;
                Ok(Node::new(NodeKind::Pattern { regex, slot: None }, pos))
            }
            Token::LParen => {
                let expr = self.parse_expr()?;
                self.expect(&Token::RParen)?;
                Ok(expr)
            }
            Token::Ident(name) => {
                if self.check(&Token::LParen) {
                    let Some(func) = Builtin::from_name(&name) else {
                        return Err(CompileError::new(
                            pos,
                            format!("unknown builtin function `{}'", name),
                        ));
                    };
                    self.advance();
                    let args = self.parse_args(&Token::RParen)?;
                    let pos = pos.merge(&self.last_pos());
                    return Ok(Node::new(NodeKind::Builtin { func, args }, pos));
                }
                let id = Node::new(NodeKind::Id { name, metric: None }, pos.clone());
                if !self.eat(&Token::LBracket) {
                    return Ok(id);
                }
                let index = self.parse_args(&Token::RBracket)?;
                let pos = pos.merge(&self.last_pos());
                Ok(Node::new(
                    NodeKind::Indexed {
                        base: Box::new(id),
                        index,
                    },
                    pos,
                ))
            }
            other => Err(CompileError::new(
                pos,
                format!("unexpected `{}`, expected an expression", other),
            )),
        }
    }

    /// Comma-separated expressions up to and including `close`.
    fn parse_args(&mut self, close: &Token) -> PResult<Vec<Node>> {
        let mut args = Vec::new();
        if self.eat(close) {
            return Ok(args);
        }
        loop {
            args.push(self.parse_expr()?);
            if self.eat(close) {
                return Ok(args);
            }
            self.expect(&Token::Comma)?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(src: &str) -> Node {
        parse("test.lpm", src, &CompileOptions::default()).unwrap()
    }

    fn stmts(node: &Node) -> &[Node] {
        match &node.kind {
            NodeKind::StmtList(s) => s,
            other => panic!("expected statement list, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_declaration() {
        let ast = parse_ok("hidden counter foo by a, \"b\" as \"foo-total\" limit 10");
        let NodeKind::Decl(decl) = &stmts(&ast)[0].kind else {
            panic!("expected decl");
        };
        assert_eq!(decl.name, "foo");
        assert_eq!(decl.kind, Kind::Counter);
        assert_eq!(decl.keys, vec!["a", "b"]);
        assert_eq!(decl.exported(), "foo-total");
        assert_eq!(decl.limit, Some(10));
        assert!(decl.hidden);
    }

    #[test]
    fn test_parse_histogram_buckets() {
        let ast = parse_ok("histogram latency buckets -1, 0, 0.5, 2");
        let NodeKind::Decl(decl) = &stmts(&ast)[0].kind else {
            panic!("expected decl");
        };
        assert_eq!(decl.buckets, vec![-1.0, 0.0, 0.5, 2.0]);
    }

    #[test]
    fn test_parse_cond_with_else() {
        let ast = parse_ok("counter a\n/foo/ {\n a++\n} else {\n a--\n}");
        let NodeKind::Cond {
            cond, else_branch, ..
        } = &stmts(&ast)[1].kind
        else {
            panic!("expected cond");
        };
        assert!(matches!(&cond.kind, NodeKind::Pattern { regex, .. } if regex == "foo"));
        assert!(else_branch.is_some());
    }

    #[test]
    fn test_division_versus_regex() {
        let ast = parse_ok("counter a\na = 4 / 2");
        let NodeKind::Assign { rhs, .. } = &stmts(&ast)[1].kind else {
            panic!("expected assignment");
        };
        assert!(matches!(rhs.kind, NodeKind::Binary { op: BinOp::Div, .. }));
    }

    #[test]
    fn test_precedence() {
        let ast = parse_ok("counter a\na = 1 + 2 * 3");
        let NodeKind::Assign { rhs, .. } = &stmts(&ast)[1].kind else {
            panic!("expected assignment");
        };
        let NodeKind::Binary { op, rhs: inner, .. } = &rhs.kind else {
            panic!("expected binary");
        };
        assert_eq!(*op, BinOp::Add);
        assert!(matches!(inner.kind, NodeKind::Binary { op: BinOp::Mul, .. }));
    }

    #[test]
    fn test_pow_binds_tighter_than_minus() {
        let ast = parse_ok("counter a\na = -2 ** 2");
        let NodeKind::Assign { rhs, .. } = &stmts(&ast)[1].kind else {
            panic!("expected assignment");
        };
        let NodeKind::Unary { op, operand } = &rhs.kind else {
            panic!("expected unary");
        };
        assert_eq!(*op, UnOp::Minus);
        assert!(matches!(operand.kind, NodeKind::Binary { op: BinOp::Pow, .. }));
    }

    #[test]
    fn test_parse_match_operator_and_builtins() {
        let ast = parse_ok("$1 =~ /x/ && len($2) > 3 {\n strptime($3, \"2006\")\n}");
        assert!(matches!(stmts(&ast)[0].kind, NodeKind::Cond { .. }));
    }

    #[test]
    fn test_parse_delete_after() {
        let ast = parse_ok("counter a by x\ndel a[$1] after 1h");
        let NodeKind::Delete { expiry, .. } = &stmts(&ast)[1].kind else {
            panic!("expected delete");
        };
        assert_eq!(*expiry, Some(std::time::Duration::from_secs(3600)));
    }

    #[test]
    fn test_reports_multiple_errors() {
        let err = parse("test.lpm", "counter\ngauge ok\n/a/ { x = = 1 }\n", &CompileOptions::default())
            .unwrap_err();
        assert_eq!(err.len(), 2);
        assert!(err.0[0].to_string().starts_with("test.lpm:2:1"));
    }

    #[test]
    fn test_unknown_builtin() {
        let err = parse("test.lpm", "nope(1)", &CompileOptions::default()).unwrap_err();
        assert!(err.to_string().contains("unknown builtin function `nope'"));
    }

    #[test]
    fn test_max_depth() {
        let options = CompileOptions {
            max_recursion_depth: 5,
            ..CompileOptions::default()
        };
        let src = format!("counter a\na = {}1{}", "(".repeat(10), ")".repeat(10));
        let err = parse("test.lpm", &src, &options).unwrap_err();
        assert!(err.to_string().contains("maximum depth"));
    }

    #[test]
    fn test_unterminated_block() {
        let err = parse("test.lpm", "/a/ {\n", &CompileOptions::default()).unwrap_err();
        assert!(err.to_string().contains("unterminated block"));
    }
}
