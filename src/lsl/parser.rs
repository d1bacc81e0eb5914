use std::collections::HashSet;

use super::ast::*;
use super::error::CompileError;
use super::lexer::{SpannedToken, Token, TokenStream};
use super::operators::{precedence, ASSIGN_PRECEDENCE};
use super::types::Type;

/// Vector and rotation components bind tighter than the relational operators,
/// so the closing `>` is not read as greater-than.
const COMPONENT_PRECEDENCE: u32 = 260;
/// `e is type` sits with the relational operators.
const IS_PRECEDENCE: u32 = 240;

pub fn parse(tokens: TokenStream) -> Result<Script, Vec<CompileError>> {
    let arrays_enabled = tokens.arrays_enabled;
    let mut parser = Parser::new(tokens.into_tokens(), arrays_enabled);
    parser.parse_script()
}

struct Parser {
    tokens: Vec<SpannedToken>,
    pos: usize,
    errors: Vec<CompileError>,
    next_block_id: usize,
    arrays_enabled: bool,
}

impl Parser {
    fn new(tokens: Vec<SpannedToken>, arrays_enabled: bool) -> Self {
        Self {
            tokens,
            pos: 0,
            errors: Vec::new(),
            next_block_id: 0,
            arrays_enabled,
        }
    }

    fn parse_script(&mut self) -> Result<Script, Vec<CompileError>> {
        let mut globals = Vec::new();
        let mut functions: Vec<DeclFunc> = Vec::new();
        let mut default_state: Option<DeclState> = None;
        let mut states: Vec<DeclState> = Vec::new();
        let mut names = HashSet::new();

        while !self.at_eof() {
            let item_start = self.pos;
            let result = match self.peek() {
                Token::Default => self.parse_state().map(|s| {
                    if default_state.is_some() {
                        self.errors
                            .push(CompileError::parser("default state already defined", s.span));
                    } else {
                        default_state = Some(s);
                    }
                }),
                Token::State => self.parse_state().map(|s| {
                    if s.name == "default" || states.iter().any(|o| o.name == s.name) {
                        self.errors.push(CompileError::parser(
                            format!("state {} already defined", s.name),
                            s.span,
                        ));
                    } else {
                        states.push(s);
                    }
                }),
                Token::Name(_) if self.lookahead_is_lparen() => self.parse_function(Type::Void).map(|f| {
                    if names.insert(f.name.clone()) {
                        functions.push(f);
                    } else {
                        self.errors.push(CompileError::parser(
                            format!("function {} already defined", f.name),
                            f.span,
                        ));
                    }
                }),
                tok if tok.as_type().is_some() => self.parse_typed_item().map(|item| match item {
                    TopItem::Global(var) => globals.push(var),
                    TopItem::Function(f) => {
                        if names.insert(f.name.clone()) {
                            functions.push(f);
                        } else {
                            self.errors.push(CompileError::parser(
                                format!("function {} already defined", f.name),
                                f.span,
                            ));
                        }
                    }
                }),
                _ => Err(CompileError::parser(
                    format!("Expected declaration, got {:?}", self.peek()),
                    self.span(),
                )),
            };
            if let Err(e) = result {
                self.errors.push(e);
                self.recover_top_level(item_start);
            }
        }

        let mut all_states = Vec::with_capacity(states.len() + 1);
        match default_state {
            Some(d) => all_states.push(d),
            None => self
                .errors
                .push(CompileError::parser("no default state defined", self.span())),
        }
        all_states.extend(states);

        if self.errors.is_empty() {
            Ok(Script {
                globals,
                functions,
                states: all_states,
                arrays_enabled: self.arrays_enabled,
            })
        } else {
            Err(std::mem::take(&mut self.errors))
        }
    }

    // ── Helpers ────────────────────────────────────────────────────

    fn peek(&self) -> &Token {
        self.tokens.get(self.pos).map_or(&Token::Eof, |t| &t.token)
    }

    fn peek_at(&self, offset: usize) -> &Token {
        self.tokens.get(self.pos + offset).map_or(&Token::Eof, |t| &t.token)
    }

    fn span(&self) -> Span {
        self.tokens.get(self.pos).map_or(Span::new(0, 0), |t| t.span)
    }

    /// Span of the most recently consumed token.
    fn prev_span(&self) -> Span {
        self.pos
            .checked_sub(1)
            .and_then(|p| self.tokens.get(p))
            .map_or_else(|| self.span(), |t| t.span)
    }

    fn at_eof(&self) -> bool {
        matches!(self.peek(), Token::Eof)
    }

    fn lookahead_is_lparen(&self) -> bool {
        matches!(self.peek_at(1), Token::LParen)
    }

    fn advance(&mut self) {
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == expected {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: &Token) -> Result<Span, CompileError> {
        if self.peek() == expected {
            let sp = self.span();
            self.advance();
            Ok(sp)
        } else {
            Err(CompileError::parser(
                format!("Expected {expected:?}, got {:?}", self.peek()),
                self.span(),
            ))
        }
    }

    fn expect_name(&mut self) -> Result<(String, Span), CompileError> {
        if let Token::Name(name) = self.peek().clone() {
            let sp = self.span();
            self.advance();
            Ok((name, sp))
        } else {
            Err(CompileError::parser(
                format!("Expected name, got {:?}", self.peek()),
                self.span(),
            ))
        }
    }

    fn expect_type(&mut self) -> Result<Type, CompileError> {
        match self.peek().as_type() {
            Some(ty) => {
                self.advance();
                Ok(ty)
            }
            None => Err(CompileError::parser(
                format!("Expected type name, got {:?}", self.peek()),
                self.span(),
            )),
        }
    }

    /// Skip to the end of the current statement without leaving the block.
    fn recover_to_semicolon(&mut self) {
        while !matches!(self.peek(), Token::Semicolon | Token::RBrace | Token::Eof) {
            self.advance();
        }
        self.eat(&Token::Semicolon);
    }

    /// Rewind to the start of a failed top-level item and skip it whole:
    /// up to a `;`, or over its first balanced `{ … }`.
    fn recover_top_level(&mut self, item_start: usize) {
        self.pos = item_start;
        let mut depth = 0usize;
        loop {
            match self.peek() {
                Token::Eof => return,
                Token::Semicolon if depth == 0 => {
                    self.advance();
                    return;
                }
                Token::LBrace => depth += 1,
                Token::RBrace => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        self.advance();
                        return;
                    }
                }
                _ => {}
            }
            self.advance();
        }
    }

    fn new_block_id(&mut self) -> usize {
        let id = self.next_block_id;
        self.next_block_id += 1;
        id
    }

    // ── Top-level items ───────────────────────────────────────────

    fn parse_typed_item(&mut self) -> Result<TopItem, CompileError> {
        let start = self.span();
        let ty = self.expect_type()?;
        if matches!(self.peek(), Token::Name(_)) && self.lookahead_is_lparen() {
            return self.parse_function(ty).map(TopItem::Function);
        }
        let (name, _) = self.expect_name()?;
        let init = if self.eat(&Token::Assign) {
            Some(self.parse_expr()?)
        } else {
            None
        };
        let end = self.expect(&Token::Semicolon)?;
        Ok(TopItem::Global(DeclVar {
            name,
            ty,
            init,
            hoisted: false,
            span: start.merge(end),
        }))
    }

    /// `name(params) block`, with the return type already consumed.
    fn parse_function(&mut self, ret: Type) -> Result<DeclFunc, CompileError> {
        let (name, start) = self.expect_name()?;
        let params = self.parse_params()?;
        let body = self.parse_block()?;
        let span = start.merge(body.span);
        Ok(DeclFunc {
            name,
            ret,
            params,
            body,
            span,
        })
    }

    fn parse_params(&mut self) -> Result<Vec<Param>, CompileError> {
        self.expect(&Token::LParen)?;
        let mut params = Vec::new();
        if !matches!(self.peek(), Token::RParen) {
            loop {
                let start = self.span();
                let ty = self.expect_type()?;
                let (name, end) = self.expect_name()?;
                params.push(Param {
                    name,
                    ty,
                    span: start.merge(end),
                });
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
        }
        self.expect(&Token::RParen)?;
        Ok(params)
    }

    fn parse_state(&mut self) -> Result<DeclState, CompileError> {
        let start = self.span();
        let name = if self.eat(&Token::Default) {
            "default".to_string()
        } else {
            self.expect(&Token::State)?;
            if self.eat(&Token::Default) {
                "default".to_string()
            } else {
                self.expect_name()?.0
            }
        };
        self.expect(&Token::LBrace)?;

        let mut handlers = Vec::new();
        while !matches!(self.peek(), Token::RBrace | Token::Eof) {
            handlers.push(self.parse_function(Type::Void)?);
        }
        let end = self.expect(&Token::RBrace)?;
        Ok(DeclState {
            name,
            handlers,
            span: start.merge(end),
        })
    }

    // ── Statements ────────────────────────────────────────────────

    fn parse_block(&mut self) -> Result<Block, CompileError> {
        let start = self.expect(&Token::LBrace)?;
        let id = self.new_block_id();
        let mut stmts = Vec::new();
        let mut seen_statement = false;

        while !matches!(self.peek(), Token::RBrace | Token::Eof) {
            let result = if self.peek().as_type().is_some() {
                self.parse_local_decl(seen_statement).map(Stmt::Decl)
            } else {
                self.parse_stmt()
            };
            match result {
                Ok(stmt) => {
                    if !matches!(stmt, Stmt::Decl(_) | Stmt::Null(_)) {
                        seen_statement = true;
                    }
                    stmts.push(stmt);
                }
                Err(e) => {
                    self.errors.push(e);
                    self.recover_to_semicolon();
                }
            }
        }
        let end = self.expect(&Token::RBrace)?;
        Ok(Block {
            id,
            stmts,
            span: start.merge(end),
        })
    }

    fn parse_local_decl(&mut self, hoisted: bool) -> Result<DeclVar, CompileError> {
        let start = self.span();
        let ty = self.expect_type()?;
        let (name, _) = self.expect_name()?;
        let init = if self.eat(&Token::Assign) {
            Some(self.parse_expr()?)
        } else {
            None
        };
        let end = self.expect(&Token::Semicolon)?;
        Ok(DeclVar {
            name,
            ty,
            init,
            hoisted,
            span: start.merge(end),
        })
    }

    fn parse_stmt(&mut self) -> Result<Stmt, CompileError> {
        let start = self.span();
        match self.peek().clone() {
            Token::LBrace => self.parse_block().map(Stmt::Block),
            Token::Semicolon => {
                self.advance();
                Ok(Stmt::Null(start))
            }
            Token::If => {
                self.advance();
                let cond = self.parse_paren_expr()?;
                let then_branch = Box::new(self.parse_stmt()?);
                let else_branch = if self.eat(&Token::Else) {
                    Some(Box::new(self.parse_stmt()?))
                } else {
                    None
                };
                let end = else_branch.as_ref().map_or(then_branch.span(), |e| e.span());
                Ok(Stmt::If {
                    cond,
                    then_branch,
                    else_branch,
                    span: start.merge(end),
                })
            }
            Token::While => {
                self.advance();
                let cond = self.parse_paren_expr()?;
                let body = Box::new(self.parse_stmt()?);
                let span = start.merge(body.span());
                Ok(Stmt::While { cond, body, span })
            }
            Token::Do => {
                self.advance();
                let body = Box::new(self.parse_stmt()?);
                self.expect(&Token::While)?;
                let cond = self.parse_paren_expr()?;
                let end = self.expect(&Token::Semicolon)?;
                Ok(Stmt::DoWhile {
                    body,
                    cond,
                    span: start.merge(end),
                })
            }
            Token::For => self.parse_for(),
            Token::ForEach => self.parse_foreach(),
            Token::Jump => {
                self.advance();
                let (label, _) = self.expect_name()?;
                let end = self.expect(&Token::Semicolon)?;
                Ok(Stmt::Jump {
                    label,
                    span: start.merge(end),
                })
            }
            Token::At => {
                self.advance();
                let (name, _) = self.expect_name()?;
                let end = self.expect(&Token::Semicolon)?;
                Ok(Stmt::Label {
                    name,
                    span: start.merge(end),
                })
            }
            Token::Return => {
                self.advance();
                let value = if matches!(self.peek(), Token::Semicolon) {
                    None
                } else {
                    Some(self.parse_expr()?)
                };
                let end = self.expect(&Token::Semicolon)?;
                Ok(Stmt::Return {
                    value,
                    span: start.merge(end),
                })
            }
            Token::State => {
                self.advance();
                let name = if self.eat(&Token::Default) {
                    "default".to_string()
                } else {
                    self.expect_name()?.0
                };
                let end = self.expect(&Token::Semicolon)?;
                Ok(Stmt::State {
                    name,
                    span: start.merge(end),
                })
            }
            tok if tok.as_type().is_some() => Err(CompileError::parser(
                "declaration not allowed here",
                start,
            )),
            _ => {
                let expr = self.parse_expr()?;
                self.expect(&Token::Semicolon)?;
                Ok(Stmt::Expr(expr))
            }
        }
    }

    fn parse_paren_expr(&mut self) -> Result<Expr, CompileError> {
        self.expect(&Token::LParen)?;
        let expr = self.parse_expr()?;
        self.expect(&Token::RParen)?;
        Ok(expr)
    }

    fn parse_expr_list(&mut self, end: &Token) -> Result<Vec<Expr>, CompileError> {
        let mut exprs = Vec::new();
        if self.peek() == end {
            return Ok(exprs);
        }
        exprs.push(self.parse_expr()?);
        while self.eat(&Token::Comma) {
            exprs.push(self.parse_expr()?);
        }
        Ok(exprs)
    }

    fn parse_for(&mut self) -> Result<Stmt, CompileError> {
        let start = self.expect(&Token::For)?;
        self.expect(&Token::LParen)?;
        let init = self.parse_expr_list(&Token::Semicolon)?;
        self.expect(&Token::Semicolon)?;
        let cond = if matches!(self.peek(), Token::Semicolon) {
            None
        } else {
            Some(self.parse_expr()?)
        };
        self.expect(&Token::Semicolon)?;
        let step = self.parse_expr_list(&Token::RParen)?;
        self.expect(&Token::RParen)?;
        let body = Box::new(self.parse_stmt()?);
        let span = start.merge(body.span());
        Ok(Stmt::For {
            init,
            cond,
            step,
            body,
            span,
        })
    }

    /// `foreach (key, value in array) stmt`; either name may be left out.
    fn parse_foreach(&mut self) -> Result<Stmt, CompileError> {
        let start = self.expect(&Token::ForEach)?;
        self.expect(&Token::LParen)?;
        let key = if matches!(self.peek(), Token::Name(_)) {
            Some(self.expect_name()?)
        } else {
            None
        };
        self.expect(&Token::Comma)?;
        let value = if matches!(self.peek(), Token::Name(_)) {
            Some(self.expect_name()?)
        } else {
            None
        };
        self.expect(&Token::In)?;
        let array = self.parse_expr()?;
        self.expect(&Token::RParen)?;
        let body = Box::new(self.parse_stmt()?);
        let span = start.merge(body.span());
        Ok(Stmt::ForEach {
            key,
            value,
            array,
            body,
            span,
        })
    }

    // ── Expressions ───────────────────────────────────────────────

    fn parse_expr(&mut self) -> Result<Expr, CompileError> {
        let target = self.parse_binary(ASSIGN_PRECEDENCE + 1)?;
        let op = match self.peek() {
            Token::Assign => None,
            tok => match compound_op(tok) {
                Some(op) => Some(op),
                None => return Ok(target),
            },
        };
        if !is_lvalue(&target) {
            return Err(CompileError::parser("invalid assignment target", target.span));
        }
        self.advance();
        // Right associative: `a = b = c` assigns c to b, then b to a.
        let value = self.parse_expr()?;
        let span = target.span.merge(value.span);
        Ok(Expr {
            kind: ExprKind::Assign {
                op,
                target: Box::new(target),
                value: Box::new(value),
            },
            span,
        })
    }

    fn parse_binary(&mut self, min_prec: u32) -> Result<Expr, CompileError> {
        let mut left = self.parse_unary()?;
        loop {
            if matches!(self.peek(), Token::Is) {
                if IS_PRECEDENCE < min_prec {
                    break;
                }
                self.advance();
                let ty = self.expect_type()?;
                let span = left.span.merge(self.prev_span());
                left = Expr {
                    kind: ExprKind::IsType {
                        operand: Box::new(left),
                        ty,
                    },
                    span,
                };
                continue;
            }
            let Some(op) = binary_op(self.peek()) else {
                break;
            };
            let prec = precedence(op.symbol()).unwrap_or(0);
            if prec < min_prec {
                break;
            }
            self.advance();
            let right = self.parse_binary(prec + 1)?;
            let span = left.span.merge(right.span);
            left = Expr {
                kind: ExprKind::BinOp {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                span,
            };
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, CompileError> {
        let start = self.span();
        let op = match self.peek() {
            Token::Minus => UnaryOp::Neg,
            Token::Bang => UnaryOp::Not,
            Token::Tilde => UnaryOp::BitNot,
            Token::PlusPlus | Token::MinusMinus => {
                let increment = matches!(self.peek(), Token::PlusPlus);
                self.advance();
                let target = self.parse_unary()?;
                if !is_lvalue(&target) {
                    return Err(CompileError::parser("invalid increment target", target.span));
                }
                let span = start.merge(target.span);
                return Ok(Expr {
                    kind: ExprKind::IncDec {
                        target: Box::new(target),
                        increment,
                        prefix: true,
                    },
                    span,
                });
            }
            Token::LParen if self.peek_at(1).as_type().is_some() && matches!(self.peek_at(2), Token::RParen) => {
                self.advance();
                let ty = self.expect_type()?;
                self.expect(&Token::RParen)?;
                let operand = self.parse_unary()?;
                let span = start.merge(operand.span);
                return Ok(Expr {
                    kind: ExprKind::Cast {
                        ty,
                        operand: Box::new(operand),
                    },
                    span,
                });
            }
            _ => return self.parse_postfix(),
        };
        self.advance();
        let operand = self.parse_unary()?;
        let span = start.merge(operand.span);
        Ok(Expr {
            kind: ExprKind::UnaryOp {
                op,
                operand: Box::new(operand),
            },
            span,
        })
    }

    fn parse_postfix(&mut self) -> Result<Expr, CompileError> {
        let mut expr = self.parse_primary()?;

        loop {
            match self.peek() {
                Token::Dot => {
                    self.advance();
                    let (field, field_span) = self.expect_name()?;
                    if self.arrays_enabled && matches!(self.peek(), Token::LParen) {
                        self.advance();
                        let args = self.parse_expr_list(&Token::RParen)?;
                        let end = self.expect(&Token::RParen)?;
                        let span = expr.span.merge(end);
                        expr = Expr {
                            kind: ExprKind::MethodCall {
                                object: Box::new(expr),
                                method: field,
                                args,
                            },
                            span,
                        };
                    } else {
                        let span = expr.span.merge(field_span);
                        expr = Expr {
                            kind: ExprKind::Field {
                                object: Box::new(expr),
                                field,
                            },
                            span,
                        };
                    }
                }
                Token::LBracket if self.arrays_enabled => {
                    self.advance();
                    let key = self.parse_expr()?;
                    let end = self.expect(&Token::RBracket)?;
                    let span = expr.span.merge(end);
                    expr = Expr {
                        kind: ExprKind::Index {
                            array: Box::new(expr),
                            key: Box::new(key),
                        },
                        span,
                    };
                }
                Token::PlusPlus | Token::MinusMinus if is_lvalue(&expr) => {
                    let increment = matches!(self.peek(), Token::PlusPlus);
                    let end = self.span();
                    self.advance();
                    let span = expr.span.merge(end);
                    expr = Expr {
                        kind: ExprKind::IncDec {
                            target: Box::new(expr),
                            increment,
                            prefix: false,
                        },
                        span,
                    };
                }
                _ => break,
            }
        }

        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, CompileError> {
        let span = self.span();
        match self.peek().clone() {
            Token::Int(v) => {
                self.advance();
                Ok(Expr { kind: ExprKind::IntLit(v), span })
            }
            Token::Float(v) => {
                self.advance();
                Ok(Expr { kind: ExprKind::FloatLit(v), span })
            }
            Token::String(s) => {
                self.advance();
                Ok(Expr { kind: ExprKind::StringLit(s), span })
            }
            Token::Undef => {
                self.advance();
                Ok(Expr { kind: ExprKind::Undef, span })
            }
            Token::Name(name) => {
                self.advance();
                if matches!(self.peek(), Token::LParen) {
                    self.advance();
                    let args = self.parse_expr_list(&Token::RParen)?;
                    let end = self.expect(&Token::RParen)?;
                    return Ok(Expr {
                        kind: ExprKind::Call { name, args },
                        span: span.merge(end),
                    });
                }
                Ok(Expr { kind: ExprKind::Ident(name), span })
            }
            Token::LParen => {
                self.advance();
                let expr = self.parse_expr()?;
                self.expect(&Token::RParen)?;
                Ok(expr)
            }
            Token::LBracket => {
                self.advance();
                let items = self.parse_expr_list(&Token::RBracket)?;
                let end = self.expect(&Token::RBracket)?;
                Ok(Expr {
                    kind: ExprKind::ListLit(items),
                    span: span.merge(end),
                })
            }
            Token::Lt => {
                self.advance();
                let mut parts = vec![self.parse_binary(COMPONENT_PRECEDENCE)?];
                while self.eat(&Token::Comma) {
                    parts.push(self.parse_binary(COMPONENT_PRECEDENCE)?);
                }
                let end = self.expect(&Token::Gt)?;
                let span = span.merge(end);
                match parts.len() {
                    3 => Ok(Expr { kind: ExprKind::VectorLit(parts), span }),
                    4 => Ok(Expr { kind: ExprKind::RotationLit(parts), span }),
                    n => Err(CompileError::parser(
                        format!("vector needs 3 and rotation 4 components, got {n}"),
                        span,
                    )),
                }
            }
            _ => Err(CompileError::parser(
                format!("Unexpected token: {:?}", self.peek()),
                self.span(),
            )),
        }
    }
}

enum TopItem {
    Global(DeclVar),
    Function(DeclFunc),
}

fn is_lvalue(expr: &Expr) -> bool {
    match &expr.kind {
        ExprKind::Ident(_) | ExprKind::Index { .. } => true,
        ExprKind::Field { object, .. } => is_lvalue(object),
        _ => false,
    }
}

fn binary_op(token: &Token) -> Option<BinOp> {
    Some(match token {
        Token::Plus => BinOp::Add,
        Token::Minus => BinOp::Sub,
        Token::Star => BinOp::Mul,
        Token::Slash => BinOp::Div,
        Token::Percent => BinOp::Mod,
        Token::EqEq => BinOp::Eq,
        Token::Ne => BinOp::Ne,
        Token::Lt => BinOp::Lt,
        Token::Le => BinOp::Le,
        Token::Gt => BinOp::Gt,
        Token::Ge => BinOp::Ge,
        Token::AndAnd => BinOp::And,
        Token::OrOr => BinOp::Or,
        Token::Amp => BinOp::BitAnd,
        Token::Pipe => BinOp::BitOr,
        Token::Caret => BinOp::BitXor,
        Token::Shl => BinOp::Shl,
        Token::Shr => BinOp::Shr,
        _ => return None,
    })
}

fn compound_op(token: &Token) -> Option<BinOp> {
    Some(match token {
        Token::PlusAssign => BinOp::Add,
        Token::MinusAssign => BinOp::Sub,
        Token::StarAssign => BinOp::Mul,
        Token::SlashAssign => BinOp::Div,
        Token::PercentAssign => BinOp::Mod,
        Token::AndAssign => BinOp::BitAnd,
        Token::OrAssign => BinOp::BitOr,
        Token::XorAssign => BinOp::BitXor,
        Token::ShlAssign => BinOp::Shl,
        Token::ShrAssign => BinOp::Shr,
        _ => return None,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::lsl::lexer::lex;

    fn parse_str(s: &str) -> Script {
        let tokens = lex(s).unwrap();
        parse(tokens).unwrap()
    }

    fn parse_errors(s: &str) -> Vec<String> {
        let tokens = lex(s).unwrap();
        parse(tokens).unwrap_err().into_iter().map(|e| e.message).collect()
    }

    fn handler_body(script: &Script) -> &[Stmt] {
        &script.states[0].handlers[0].body.stmts
    }

    #[test]
    fn default_state_is_first() {
        let script = parse_str("state other { timer() {} } default { state_entry() { state other; } }");
        assert_eq!(script.states.len(), 2);
        assert_eq!(script.states[0].name, "default");
        assert_eq!(script.states[1].name, "other");
    }

    #[test]
    fn missing_default_state() {
        assert_eq!(parse_errors("integer x;"), vec!["no default state defined"]);
    }

    #[test]
    fn duplicate_names_are_errors() {
        let errs = parse_errors("f() {} f() {} default {} state s {} state s {}");
        assert_eq!(errs, vec!["function f already defined", "state s already defined"]);
    }

    #[test]
    fn globals_and_functions() {
        let script = parse_str(
            "integer count = 3;\nfloat half(float x) { return x / 2; }\nsay() {}\ndefault {}",
        );
        assert_eq!(script.globals.len(), 1);
        assert_eq!(script.globals[0].ty, Type::Integer);
        assert!(script.globals[0].init.is_some());
        assert_eq!(script.functions.len(), 2);
        assert_eq!(script.functions[0].ret, Type::Float);
        assert_eq!(script.functions[0].params[0].ty, Type::Float);
        assert_eq!(script.functions[1].ret, Type::Void);
    }

    #[test]
    fn precedence_climbing() {
        let script = parse_str("default { timer() { x = 1 + 2 * 3 << 1; } }");
        let Stmt::Expr(expr) = &handler_body(&script)[0] else { panic!("expected expr") };
        let ExprKind::Assign { value, .. } = &expr.kind else { panic!("expected assign") };
        let ExprKind::BinOp { op: BinOp::Shl, left, .. } = &value.kind else { panic!("expected <<") };
        let ExprKind::BinOp { op: BinOp::Add, right, .. } = &left.kind else { panic!("expected +") };
        assert!(matches!(right.kind, ExprKind::BinOp { op: BinOp::Mul, .. }));
    }

    #[test]
    fn vector_literal_closes_before_greater_than() {
        let script = parse_str("default { timer() { v = <1, 2, 3> * 2; r = <0, 0, 0, 1>; } }");
        let body = handler_body(&script);
        let Stmt::Expr(Expr { kind: ExprKind::Assign { value, .. }, .. }) = &body[0] else { panic!() };
        let ExprKind::BinOp { op: BinOp::Mul, left, .. } = &value.kind else { panic!("expected *") };
        assert!(matches!(&left.kind, ExprKind::VectorLit(p) if p.len() == 3));
        let Stmt::Expr(Expr { kind: ExprKind::Assign { value, .. }, .. }) = &body[1] else { panic!() };
        assert!(matches!(&value.kind, ExprKind::RotationLit(p) if p.len() == 4));
    }

    #[test]
    fn cast_binds_to_unary_operand() {
        let script = parse_str("default { timer() { s = (string)i + \"x\"; } }");
        let Stmt::Expr(Expr { kind: ExprKind::Assign { value, .. }, .. }) = &handler_body(&script)[0] else {
            panic!()
        };
        let ExprKind::BinOp { left, .. } = &value.kind else { panic!("expected +") };
        assert!(matches!(left.kind, ExprKind::Cast { ty: Type::String, .. }));
    }

    #[test]
    fn hoisted_declarations_are_marked() {
        let script = parse_str("default { timer() { integer a; a = 1; integer b; } }");
        let body = handler_body(&script);
        assert!(matches!(&body[0], Stmt::Decl(d) if !d.hoisted));
        assert!(matches!(&body[2], Stmt::Decl(d) if d.hoisted && d.name == "b"));
    }

    #[test]
    fn block_ids_are_unique() {
        let script = parse_str("f() { { } { { } } } default { timer() { } }");
        let body = &script.functions[0].body;
        let mut ids = vec![body.id];
        for stmt in &body.stmts {
            if let Stmt::Block(b) = stmt {
                ids.push(b.id);
                for inner in &b.stmts {
                    if let Stmt::Block(c) = inner {
                        ids.push(c.id);
                    }
                }
            }
        }
        ids.push(script.states[0].handlers[0].body.id);
        let unique: HashSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), 5);
    }

    #[test]
    fn control_flow_statements() {
        let script = parse_str(
            "default { timer() {\n\
             for (i = 0, j = 1; i < 10; i++) {}\n\
             do { @top; } while (i);\n\
             if (i) jump top; else return;\n\
             state default;\n} }",
        );
        let body = handler_body(&script);
        assert!(matches!(&body[0], Stmt::For { init, step, .. } if init.len() == 2 && step.len() == 1));
        assert!(matches!(&body[1], Stmt::DoWhile { .. }));
        assert!(matches!(&body[2], Stmt::If { else_branch: Some(_), .. }));
        assert!(matches!(&body[3], Stmt::State { name, .. } if name == "default"));
    }

    #[test]
    fn statement_errors_recover_and_accumulate() {
        let errs = parse_errors("default { timer() { x = ; y = 1; z = ); } }");
        assert_eq!(errs.len(), 2);
    }

    #[test]
    fn declaration_as_branch_is_rejected() {
        assert_eq!(
            parse_errors("default { timer() { if (1) integer x; } }"),
            vec!["declaration not allowed here"]
        );
    }

    #[test]
    fn array_syntax_with_pragma() {
        let script = parse_str(
            "XMROption arrays;\ndefault { timer() { array a; a[\"k\"] = 1; n = a.count; v = a.value(0); \
             foreach (k, v in a) {} b = a[1] is integer; } }",
        );
        assert!(script.arrays_enabled);
        let body = handler_body(&script);
        assert!(matches!(&body[1], Stmt::Expr(Expr { kind: ExprKind::Assign { target, .. }, .. })
            if matches!(target.kind, ExprKind::Index { .. })));
        assert!(matches!(&body[3], Stmt::Expr(Expr { kind: ExprKind::Assign { value, .. }, .. })
            if matches!(value.kind, ExprKind::MethodCall { .. })));
        assert!(matches!(&body[4], Stmt::ForEach { key: Some(_), value: Some(_), .. }));
        assert!(matches!(&body[5], Stmt::Expr(Expr { kind: ExprKind::Assign { value, .. }, .. })
            if matches!(value.kind, ExprKind::IsType { ty: Type::Integer, .. })));
    }
}
