use std::{
    borrow::Cow,
    collections::{HashMap, VecDeque},
    ops::Add,
};

use lazy_static::lazy_static;

use crate::{
    error::{IntoSpanned, SpannedError},
    frontend::{
        ast::{
            Access, AssignOp, BinaryOp, ClassDecl, ClassKind, CompileTimeDecl, Expr, ExprKind, FieldDecl, FnDecl,
            IfStmt, Literal, MethodDecl, ObjectKey, Param, Pattern, Stmt, StmtKind, SwitchArm,
            TryStmt, TypeName, UnaryOp, VarDecl,
        },
        lexer::{Span, Token, TokenKind},
    },
};

lazy_static! {
    static ref TOKEN_TYPES: HashMap<&'static str, TokenType> = {
        [
            ("**", TokenType::Binary((BinaryOp::Pow, Prec::Pow))),
            ("%", TokenType::Binary((BinaryOp::Mod, Prec::Mul))),
            ("*", TokenType::Binary((BinaryOp::Mul, Prec::Mul))),
            ("/", TokenType::Binary((BinaryOp::Div, Prec::Mul))),
            ("+", TokenType::Binary((BinaryOp::Add, Prec::Add))),
            ("-", TokenType::Binary((BinaryOp::Sub, Prec::Add))),
            ("<<", TokenType::Binary((BinaryOp::ShiftLeft, Prec::Shift))),
            (">>", TokenType::Binary((BinaryOp::ShiftRight, Prec::Shift))),
            ("<=", TokenType::Binary((BinaryOp::Lte, Prec::Relational))),
            (">=", TokenType::Binary((BinaryOp::Gte, Prec::Relational))),
            ("<", TokenType::Binary((BinaryOp::Lt, Prec::Relational))),
            (">", TokenType::Binary((BinaryOp::Gt, Prec::Relational))),
            ("==", TokenType::Binary((BinaryOp::Eq, Prec::Equal))),
            ("!=", TokenType::Binary((BinaryOp::Ne, Prec::Equal))),
            ("&", TokenType::Binary((BinaryOp::BitAnd, Prec::BitwiseAnd))),
            ("^", TokenType::Binary((BinaryOp::BitXor, Prec::BitwiseXor))),
            ("|", TokenType::Binary((BinaryOp::BitOr, Prec::BitwiseOr))),
            ("&&", TokenType::Binary((BinaryOp::LogicalAnd, Prec::LogicalAnd))),
            ("||", TokenType::Binary((BinaryOp::LogicalOr, Prec::LogicalOr))),
            ("?", TokenType::Conditional),
            ("=", TokenType::Assign(None)),
            ("+=", TokenType::Assign(Some(AssignOp::Add))),
            ("-=", TokenType::Assign(Some(AssignOp::Sub))),
            ("*=", TokenType::Assign(Some(AssignOp::Mul))),
            ("/=", TokenType::Assign(Some(AssignOp::Div))),
            ("%=", TokenType::Assign(Some(AssignOp::Mod))),
            ("(", TokenType::Postfix(PostfixType::Call)),
            ("[", TokenType::Postfix(PostfixType::Index)),
        ]
        .iter()
        .cloned()
        .collect()
    };
}

#[derive(Clone, Copy)]
enum PostfixType {
    Call,
    Member,
    Index,
}

#[derive(Clone)]
enum TokenType {
    Conditional,
    Postfix(PostfixType),
    Binary((BinaryOp, Prec)),
    Assign(Option<AssignOp>),
}

#[derive(PartialEq, PartialOrd, Clone, Copy)]
#[repr(u8)]
enum Prec {
    Assign,
    Conditional,
    LogicalOr,
    LogicalAnd,
    BitwiseOr,
    BitwiseXor,
    BitwiseAnd,
    Equal,
    Relational,
    Shift,
    Add,
    Mul,
    Pow,
    Prefix,
    Postfix,
}

impl Default for Prec {
    // The first precedence level after assignments
    fn default() -> Self {
        Self::Conditional
    }
}

impl TryFrom<u8> for Prec {
    type Error = &'static str;

    fn try_from(n: u8) -> Result<Self, Self::Error> {
        match n {
            0 => Ok(Prec::Assign),
            1 => Ok(Prec::Conditional),
            2 => Ok(Prec::LogicalOr),
            3 => Ok(Prec::LogicalAnd),
            4 => Ok(Prec::BitwiseOr),
            5 => Ok(Prec::BitwiseXor),
            6 => Ok(Prec::BitwiseAnd),
            7 => Ok(Prec::Equal),
            8 => Ok(Prec::Relational),
            9 => Ok(Prec::Shift),
            10 => Ok(Prec::Add),
            11 => Ok(Prec::Mul),
            12 => Ok(Prec::Pow),
            13 => Ok(Prec::Prefix),
            14 => Ok(Prec::Postfix),
            _ => Err("invalid precedence"),
        }
    }
}

impl Add<u8> for Prec {
    type Output = Self;

    fn add(self, rhs: u8) -> Self::Output {
        let n = self as u8 + rhs;
        n.try_into().unwrap_or(Prec::Postfix)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ErrorKind {
    #[error("invalid expr '{0}'")]
    InvalidExpr(TokenKind),
    #[error("unexpected token '{actual}', expected: '{expected}'")]
    UnexpectedToken {
        expected: Cow<'static, str>,
        actual: String,
    },
    #[error("unexpected break outside of loop")]
    UnexpectedBreak,
    #[error("unexpected continue outside of loop")]
    UnexpectedContinue,
    #[error("unexpected end-of-file")]
    UnexpectedEof,
}

pub type ParseError = SpannedError<ErrorKind>;

fn supports_assign(expr: &Expr) -> bool {
    matches!(
        expr.kind,
        ExprKind::Ident(_) | ExprKind::Member(..) | ExprKind::Index(..)
    )
}

fn access_modifier(token: &TokenKind) -> Option<Access> {
    match token {
        TokenKind::Keyword(k) if k == "pub" => Some(Access::Public),
        TokenKind::Keyword(k) if k == "pro" => Some(Access::Protected),
        TokenKind::Keyword(k) if k == "pri" => Some(Access::Private),
        _ => None,
    }
}

pub struct Parser {
    loop_counter: usize,
    tokens: VecDeque<Token>,
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self {
            loop_counter: 0,
            tokens: VecDeque::from(tokens),
        }
    }

    fn test_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(TokenKind::Keyword(ref k)) if k == keyword)
    }

    fn accept_keyword(&mut self, keyword: &str) -> bool {
        if self.test_keyword(keyword) {
            self.advance();
            return true;
        }

        false
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<(), ParseError> {
        let token = self
            .peek()
            .ok_or_else(|| ErrorKind::UnexpectedEof.at(self.span()))?;

        if !self.test_keyword(keyword) {
            return Err(ErrorKind::UnexpectedToken {
                expected: keyword.to_string().into(),
                actual: token.to_string(),
            }
            .at(self.span()));
        }

        self.advance();
        Ok(())
    }

    fn peek(&self) -> Option<&TokenKind> {
        self.tokens.front().map(|t| &t.kind)
    }

    fn peek_nth(&self, n: usize) -> Option<&TokenKind> {
        self.tokens.get(n).map(|t| &t.kind)
    }

    fn span(&self) -> Span {
        self.tokens.front().map(|t| t.span).unwrap_or_default()
    }

    fn advance(&mut self) {
        let _ = self.next();
    }

    fn next(&mut self) -> Option<Token> {
        self.tokens.pop_front()
    }

    fn expect(&mut self, expected: TokenKind) -> Result<(), ParseError> {
        let span = self.span();

        match self.next() {
            Some(token) if token.kind == expected => Ok(()),
            Some(token) => Err(ErrorKind::UnexpectedToken {
                expected: Cow::Owned(expected.to_string()),
                actual: token.to_string(),
            }
            .at(span)),
            None => Err(ErrorKind::UnexpectedToken {
                expected: Cow::Owned(expected.to_string()),
                actual: "EOF".to_string(),
            }
            .at(span)),
        }
    }

    fn accept(&mut self, kind: &TokenKind) -> bool {
        if matches!(self.peek(), Some(token) if token == kind) {
            self.advance();
            return true;
        }

        false
    }

    fn semi(&mut self) -> Result<(), ParseError> {
        self.expect(TokenKind::Punct(";"))
    }

    /// Index of the `)` closing the `(` found at `open`.
    fn matching_paren(&self, open: usize) -> Option<usize> {
        let mut depth = 0usize;

        for (i, token) in self.tokens.iter().enumerate().skip(open) {
            match token.kind {
                TokenKind::Punct("(") => depth += 1,
                TokenKind::Punct(")") => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(i);
                    }
                }
                _ => {}
            }
        }

        None
    }

    fn is_lambda(&self) -> bool {
        matches!(self.peek(), Some(TokenKind::Punct("(")))
            && self
                .matching_paren(0)
                .is_some_and(|close| matches!(self.peek_nth(close + 1), Some(TokenKind::Punct("=>"))))
    }

    fn is_fn_decl(&self, offset: usize) -> bool {
        matches!(self.peek_nth(offset), Some(TokenKind::Ident(_)))
            && matches!(self.peek_nth(offset + 1), Some(TokenKind::Punct("(")))
            && self.matching_paren(offset + 1).is_some_and(|close| {
                matches!(
                    self.peek_nth(close + 1),
                    Some(TokenKind::Punct("{")) | Some(TokenKind::Punct(":"))
                )
            })
    }

    fn is_cast(&self) -> bool {
        matches!(self.peek(), Some(TokenKind::Punct("<")))
            && matches!(self.peek_nth(1), Some(TokenKind::Ident(_)))
            && (matches!(self.peek_nth(2), Some(TokenKind::Punct(">")))
                || (matches!(self.peek_nth(2), Some(TokenKind::Punct("[")))
                    && matches!(self.peek_nth(3), Some(TokenKind::Punct("]")))
                    && matches!(self.peek_nth(4), Some(TokenKind::Punct(">")))))
    }

    fn ident(&mut self) -> Result<String, ParseError> {
        let span = self.span();

        match self.next() {
            Some(token) => match token.kind {
                TokenKind::Ident(id) => Ok(id),
                _ => Err(ErrorKind::UnexpectedToken {
                    expected: Cow::Borrowed("ident"),
                    actual: token.to_string(),
                }
                .at(span)),
            },
            None => Err(ErrorKind::UnexpectedEof.at(span)),
        }
    }

    fn string_lit(&mut self) -> Result<String, ParseError> {
        let span = self.span();

        match self.next() {
            Some(Token {
                kind: TokenKind::StringLit(s),
                ..
            }) => Ok(s),
            Some(token) => Err(ErrorKind::UnexpectedToken {
                expected: Cow::Borrowed("string"),
                actual: token.to_string(),
            }
            .at(span)),
            None => Err(ErrorKind::UnexpectedEof.at(span)),
        }
    }

    fn type_name(&mut self) -> Result<TypeName, ParseError> {
        let name = self.ident()?;
        let array = if self.accept(&TokenKind::Punct("[")) {
            self.expect(TokenKind::Punct("]"))?;
            true
        } else {
            false
        };

        Ok(TypeName { name, array })
    }

    fn type_annotation(&mut self) -> Result<Option<TypeName>, ParseError> {
        if self.accept(&TokenKind::Punct(":")) {
            Ok(Some(self.type_name()?))
        } else {
            Ok(None)
        }
    }

    fn expr_list(&mut self, end: TokenKind) -> Result<Vec<Expr>, ParseError> {
        let mut exprs = vec![];

        while !self.accept(&end) {
            exprs.push(self.expr(Prec::default())?);

            if !self.accept(&TokenKind::Punct(",")) {
                self.expect(end)?;
                break;
            }
        }

        Ok(exprs)
    }

    fn name_list(&mut self, end: TokenKind) -> Result<Vec<String>, ParseError> {
        let mut names = vec![];

        while !self.accept(&end) {
            names.push(self.ident()?);

            if !self.accept(&TokenKind::Punct(",")) {
                self.expect(end)?;
                break;
            }
        }

        Ok(names)
    }

    fn params(&mut self) -> Result<(Vec<Param>, Option<Param>), ParseError> {
        let mut params = vec![];
        let mut varargs = None;

        self.expect(TokenKind::Punct("("))?;

        while !self.accept(&TokenKind::Punct(")")) {
            let span = self.span();
            let variadic = self.accept(&TokenKind::Punct("..."));
            let name = self.ident()?;
            let ty = self.type_annotation()?;
            let default = if !variadic && self.accept(&TokenKind::Punct("=")) {
                Some(self.expr(Prec::default())?)
            } else {
                None
            };
            let param = Param {
                name,
                ty,
                default,
                span,
            };

            if variadic {
                varargs = Some(param);
                self.expect(TokenKind::Punct(")"))?;
                break;
            }

            params.push(param);

            if !self.accept(&TokenKind::Punct(",")) {
                self.expect(TokenKind::Punct(")"))?;
                break;
            }
        }

        Ok((params, varargs))
    }

    fn fn_body(&mut self) -> Result<Vec<Stmt>, ParseError> {
        // function bodies reset the loop context
        let loop_counter = std::mem::take(&mut self.loop_counter);
        let body = self.block();
        self.loop_counter = loop_counter;
        body
    }

    fn fn_decl(&mut self, access: Access) -> Result<FnDecl, ParseError> {
        let span = self.span();
        let name = self.ident()?;
        let (params, varargs) = self.params()?;
        let ret = self.type_annotation()?;
        let body = self.fn_body()?;

        Ok(FnDecl {
            name,
            access,
            params,
            varargs,
            ret,
            body,
            span,
        })
    }

    fn lambda(&mut self, span: Span) -> Result<Expr, ParseError> {
        let (params, varargs) = self.params()?;
        self.expect(TokenKind::Punct("=>"))?;

        let body = if matches!(self.peek(), Some(TokenKind::Punct("{"))) {
            self.fn_body()?
        } else {
            let span = self.span();
            let expr = self.expr(Prec::default())?;
            vec![StmtKind::Return(Some(expr)).at(span)]
        };

        Ok(ExprKind::Lambda(Box::new(FnDecl {
            name: format!("<lambda@{}>", span.line),
            access: Access::Private,
            params,
            varargs,
            ret: None,
            body,
            span,
        }))
        .at(span))
    }

    fn object(&mut self, span: Span) -> Result<Expr, ParseError> {
        let mut entries = vec![];

        while !self.accept(&TokenKind::Punct("}")) {
            let key = match self.next() {
                Some(Token {
                    kind: TokenKind::Ident(name),
                    ..
                })
                | Some(Token {
                    kind: TokenKind::StringLit(name),
                    ..
                }) => ObjectKey::Name(name),
                Some(Token {
                    kind: TokenKind::Punct("["),
                    ..
                }) => {
                    let key = self.expr(Prec::default())?;
                    self.expect(TokenKind::Punct("]"))?;
                    ObjectKey::Computed(key)
                }
                Some(token) => return Err(ErrorKind::InvalidExpr(token.kind).at(token.span)),
                None => return Err(ErrorKind::UnexpectedEof.at(self.span())),
            };

            self.expect(TokenKind::Punct(":"))?;
            entries.push((key, self.expr(Prec::default())?));

            if !self.accept(&TokenKind::Punct(",")) {
                self.expect(TokenKind::Punct("}"))?;
                break;
            }
        }

        Ok(ExprKind::Object(entries).at(span))
    }

    fn generator(&mut self, span: Span) -> Result<Expr, ParseError> {
        // opening `{{` is already consumed
        let body = self.body(false)?;
        self.expect(TokenKind::Punct("}"))?;
        self.expect(TokenKind::Punct("}"))?;

        Ok(ExprKind::Generator(body).at(span))
    }

    fn primary(&mut self) -> Result<Expr, ParseError> {
        let span = self.span();

        if self.is_lambda() {
            return self.lambda(span);
        }

        if self.is_cast() {
            self.advance();
            let ty = self.type_name()?;
            self.expect(TokenKind::Punct(">"))?;
            let expr = self.expr(Prec::Prefix)?;
            return Ok(ExprKind::Cast(ty, Box::new(expr)).at(span));
        }

        match self.next() {
            Some(token) => match token.kind {
                TokenKind::NullLit => Ok(ExprKind::Literal(Literal::Null).at(span)),
                TokenKind::BoolLit(b) => Ok(ExprKind::Literal(Literal::Bool(b)).at(span)),
                TokenKind::IntLit(i) => Ok(ExprKind::Literal(Literal::Int(i)).at(span)),
                TokenKind::FloatLit(f) => Ok(ExprKind::Literal(Literal::Float(f)).at(span)),
                TokenKind::StringLit(s) => Ok(ExprKind::Literal(Literal::Str(s)).at(span)),
                TokenKind::CharLit(c) => Ok(ExprKind::Literal(Literal::Char(c)).at(span)),
                TokenKind::Ident(id) => Ok(ExprKind::Ident(id).at(span)),
                TokenKind::Keyword(w) if w == "this" => Ok(ExprKind::This.at(span)),
                TokenKind::Punct("[") => {
                    let items = self.expr_list(TokenKind::Punct("]"))?;
                    Ok(ExprKind::Array(items).at(span))
                }
                TokenKind::Punct("{") if self.accept(&TokenKind::Punct("{")) => {
                    self.generator(span)
                }
                TokenKind::Punct("{") => self.object(span),
                TokenKind::Punct("(") => {
                    let expr = self.expr(Prec::Assign)?;
                    self.expect(TokenKind::Punct(")"))?;
                    Ok(expr)
                }
                TokenKind::Punct("!") => self.unary(UnaryOp::Not, span),
                TokenKind::Punct("-") => self.unary(UnaryOp::Neg, span),
                TokenKind::Punct("~") => self.unary(UnaryOp::BitNot, span),
                kind => Err(ErrorKind::InvalidExpr(kind).at(span)),
            },
            None => Err(ErrorKind::UnexpectedEof.at(span)),
        }
    }

    fn unary(&mut self, op: UnaryOp, span: Span) -> Result<Expr, ParseError> {
        let expr = self.expr(Prec::Prefix)?;
        Ok(ExprKind::Unary(op, Box::new(expr)).at(span))
    }

    fn binary(&mut self, lhs: Expr, op: BinaryOp, prec: Prec) -> Result<Expr, ParseError> {
        let span = lhs.span;
        self.advance();
        // `**` is right associative
        let rhs = if op == BinaryOp::Pow {
            self.expr(prec)?
        } else {
            self.expr(prec + 1)?
        };

        Ok(ExprKind::Binary(Box::new(lhs), op, Box::new(rhs)).at(span))
    }

    fn assign(&mut self, lhs: Expr, op: Option<AssignOp>) -> Result<Expr, ParseError> {
        let span = lhs.span;
        self.advance();
        let rhs = self.expr(Prec::Assign)?;

        Ok(ExprKind::Assign(op, Box::new(lhs), Box::new(rhs)).at(span))
    }

    fn conditional(&mut self, cond: Expr) -> Result<Expr, ParseError> {
        let span = cond.span;
        self.advance();
        let then = self.expr(Prec::default())?;
        self.expect(TokenKind::Punct(":"))?;
        let alt = self.expr(Prec::default())?;

        Ok(ExprKind::Conditional(Box::new(cond), Box::new(then), Box::new(alt)).at(span))
    }

    fn postfix(&mut self, ty: PostfixType, expr: Expr) -> Result<Expr, ParseError> {
        let span = expr.span;
        self.advance();

        Ok(match ty {
            PostfixType::Member => {
                let name = self.ident()?;
                ExprKind::Member(Box::new(expr), name).at(span)
            }
            PostfixType::Index => {
                let index = self.expr(Prec::default())?;
                self.expect(TokenKind::Punct("]"))?;
                ExprKind::Index(Box::new(expr), Box::new(index)).at(span)
            }
            PostfixType::Call => {
                let args = self.expr_list(TokenKind::Punct(")"))?;
                ExprKind::Call(Box::new(expr), args).at(span)
            }
        })
    }

    fn peek_typed(&self) -> Option<TokenType> {
        match self.peek()? {
            TokenKind::Punct(".") if matches!(self.peek_nth(1), Some(TokenKind::Ident(_))) => {
                Some(TokenType::Postfix(PostfixType::Member))
            }
            TokenKind::Punct(tok) => TOKEN_TYPES.get(tok).cloned(),
            _ => None,
        }
    }

    fn expr(&mut self, min_prec: Prec) -> Result<Expr, ParseError> {
        let mut expr = self.primary()?;

        loop {
            expr = match self.peek_typed() {
                Some(annotated) => match annotated {
                    TokenType::Postfix(ty) if min_prec <= Prec::Postfix => {
                        self.postfix(ty, expr)?
                    }
                    TokenType::Binary((op, prec)) if min_prec <= prec => {
                        self.binary(expr, op, prec)?
                    }
                    TokenType::Conditional if min_prec <= Prec::Conditional => {
                        self.conditional(expr)?
                    }
                    TokenType::Assign(op) if supports_assign(&expr) && min_prec == Prec::Assign => {
                        self.assign(expr, op)?
                    }
                    _ => break,
                },
                None => break,
            };
        }

        Ok(expr)
    }

    fn expr_stmt(&mut self) -> Result<Stmt, ParseError> {
        let span = self.span();
        let expr = self.expr(Prec::Assign)?;
        self.semi()?;

        Ok(StmtKind::Expr(expr).at(span))
    }

    fn pattern(&mut self) -> Result<Pattern, ParseError> {
        if self.accept(&TokenKind::Punct("{")) {
            return Ok(Pattern::Object(self.name_list(TokenKind::Punct("}"))?));
        }

        if self.accept(&TokenKind::Punct("[")) {
            return Ok(Pattern::Array(self.name_list(TokenKind::Punct("]"))?));
        }

        Ok(Pattern::Ident(self.ident()?))
    }

    fn var_decl(&mut self, access: Access, using: bool) -> Result<VarDecl, ParseError> {
        self.expect_keyword("var")?;
        let pattern = self.pattern()?;
        let ty = self.type_annotation()?;
        let value = if self.accept(&TokenKind::Punct("=")) {
            Some(self.expr(Prec::default())?)
        } else {
            None
        };

        Ok(VarDecl {
            access,
            using,
            pattern,
            ty,
            value,
        })
    }

    fn var_stmt(&mut self, access: Access, using: bool) -> Result<Stmt, ParseError> {
        let span = self.span();
        let decl = self.var_decl(access, using)?;
        self.semi()?;

        Ok(StmtKind::Var(decl).at(span))
    }

    fn block(&mut self) -> Result<Vec<Stmt>, ParseError> {
        self.expect(TokenKind::Punct("{"))?;
        let body = self.body(false)?;
        self.expect(TokenKind::Punct("}"))?;

        Ok(body)
    }

    fn loop_block(&mut self) -> Result<Vec<Stmt>, ParseError> {
        self.loop_counter += 1;
        let body = self.block();
        self.loop_counter -= 1;
        body
    }

    fn paren_expr(&mut self) -> Result<Expr, ParseError> {
        self.expect(TokenKind::Punct("("))?;
        let expr = self.expr(Prec::Assign)?;
        self.expect(TokenKind::Punct(")"))?;
        Ok(expr)
    }

    fn if_stmt(&mut self) -> Result<Stmt, ParseError> {
        let span = self.span();
        self.advance();
        let cond = self.paren_expr()?;
        let body = self.block()?;

        let alt = if self.accept_keyword("else") {
            if self.test_keyword("if") {
                Some(Box::new(self.if_stmt()?))
            } else {
                let span = self.span();
                Some(Box::new(StmtKind::Block(self.block()?).at(span)))
            }
        } else {
            None
        };

        Ok(StmtKind::If(IfStmt(cond, body, alt)).at(span))
    }

    fn while_stmt(&mut self) -> Result<Stmt, ParseError> {
        let span = self.span();
        self.advance();
        let cond = self.paren_expr()?;
        let body = self.loop_block()?;

        Ok(StmtKind::While(cond, body).at(span))
    }

    fn for_stmt(&mut self) -> Result<Stmt, ParseError> {
        let span = self.span();
        self.advance();
        self.expect(TokenKind::Punct("("))?;

        let init = if self.accept(&TokenKind::Punct(";")) {
            None
        } else if self.test_keyword("var") {
            let init_span = self.span();
            self.advance();
            let pattern = self.pattern()?;

            if self.accept_keyword("in") {
                let iter = self.expr(Prec::default())?;
                self.expect(TokenKind::Punct(")"))?;
                let body = self.loop_block()?;
                return Ok(StmtKind::ForEach(pattern, iter, body).at(span));
            }

            let ty = self.type_annotation()?;
            let value = if self.accept(&TokenKind::Punct("=")) {
                Some(self.expr(Prec::default())?)
            } else {
                None
            };
            self.semi()?;

            Some(Box::new(
                StmtKind::Var(VarDecl {
                    access: Access::Private,
                    using: false,
                    pattern,
                    ty,
                    value,
                })
                .at(init_span),
            ))
        } else {
            Some(Box::new(self.expr_stmt()?))
        };

        let cond = if self.accept(&TokenKind::Punct(";")) {
            None
        } else {
            let cond = self.expr(Prec::default())?;
            self.semi()?;
            Some(cond)
        };

        let step = if self.accept(&TokenKind::Punct(")")) {
            None
        } else {
            let step = self.expr(Prec::Assign)?;
            self.expect(TokenKind::Punct(")"))?;
            Some(step)
        };

        let body = self.loop_block()?;

        Ok(StmtKind::For {
            init,
            cond,
            step,
            body,
        }
        .at(span))
    }

    fn switch_stmt(&mut self) -> Result<Stmt, ParseError> {
        let span = self.span();
        self.advance();
        let value = self.paren_expr()?;
        self.expect(TokenKind::Punct("{"))?;

        let mut arms = vec![];
        let mut default = None;

        while !self.accept(&TokenKind::Punct("}")) {
            self.expect(TokenKind::Punct("("))?;

            if self.accept(&TokenKind::Punct(")")) {
                default = Some(self.block()?);
                continue;
            }

            let value = self.expr(Prec::default())?;
            self.expect(TokenKind::Punct(")"))?;
            let body = self.block()?;
            arms.push(SwitchArm { value, body });
        }

        Ok(StmtKind::Switch(value, arms, default).at(span))
    }

    fn return_stmt(&mut self) -> Result<Stmt, ParseError> {
        let span = self.span();
        self.advance();

        if self.accept(&TokenKind::Punct(";")) {
            return Ok(StmtKind::Return(None).at(span));
        }

        let expr = self.expr(Prec::default())?;
        self.semi()?;

        Ok(StmtKind::Return(Some(expr)).at(span))
    }

    fn try_stmt(&mut self) -> Result<Stmt, ParseError> {
        let span = self.span();
        self.advance();
        let body = self.block()?;

        let catch = if self.accept_keyword("catch") {
            self.expect(TokenKind::Punct("("))?;
            let name = self.ident()?;
            self.expect(TokenKind::Punct(")"))?;
            Some((name, self.block()?))
        } else {
            None
        };

        let finally = if self.accept_keyword("finally") {
            Some(self.block()?)
        } else {
            None
        };

        if catch.is_none() && finally.is_none() {
            return Err(ErrorKind::UnexpectedToken {
                expected: Cow::Borrowed("catch"),
                actual: self
                    .peek()
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "EOF".to_string()),
            }
            .at(self.span()));
        }

        Ok(StmtKind::Try(TryStmt {
            body,
            catch,
            finally,
        })
        .at(span))
    }

    fn keyword_stmt(&mut self, kind: StmtKind) -> Result<Stmt, ParseError> {
        let span = self.span();
        self.advance();
        self.semi()?;
        Ok(kind.at(span))
    }

    fn break_stmt(&mut self) -> Result<Stmt, ParseError> {
        if self.loop_counter == 0 {
            return Err(ErrorKind::UnexpectedBreak.at(self.span()));
        }

        self.keyword_stmt(StmtKind::Break)
    }

    fn continue_stmt(&mut self) -> Result<Stmt, ParseError> {
        if self.loop_counter == 0 {
            return Err(ErrorKind::UnexpectedContinue.at(self.span()));
        }

        self.keyword_stmt(StmtKind::Continue)
    }

    fn value_stmt(&mut self, build: fn(Expr) -> StmtKind) -> Result<Stmt, ParseError> {
        let span = self.span();
        self.advance();
        let expr = self.expr(Prec::default())?;
        self.semi()?;

        Ok(build(expr).at(span))
    }

    fn module_stmt(&mut self) -> Result<Stmt, ParseError> {
        let span = self.span();
        self.advance();
        let name = self.string_lit()?;
        self.semi()?;

        Ok(StmtKind::Module(name).at(span))
    }

    /// `%test("name") { ... }` or a `%compileTime` declaration.
    fn directive_stmt(&mut self) -> Result<Stmt, ParseError> {
        let span = self.span();
        self.expect(TokenKind::Punct("%"))?;

        let directive = self.ident()?;
        match directive.as_str() {
            "test" => {
                self.expect(TokenKind::Punct("("))?;
                let name = self.string_lit()?;
                self.expect(TokenKind::Punct(")"))?;
                let body = self.fn_body()?;

                Ok(StmtKind::Test(name, body).at(span))
            }
            "compileTime" => {
                let decl = match self.peek() {
                    Some(TokenKind::Keyword(w)) if w == "var" => {
                        let decl = self.var_decl(Access::Private, false)?;
                        self.semi()?;
                        CompileTimeDecl::Var(decl)
                    }
                    Some(TokenKind::Punct("{")) => CompileTimeDecl::Block(self.block()?),
                    _ => CompileTimeDecl::Fn(self.fn_decl(Access::Private)?),
                };

                Ok(StmtKind::CompileTime(decl).at(span))
            }
            _ => Err(ErrorKind::UnexpectedToken {
                expected: Cow::Borrowed("test or compileTime"),
                actual: directive,
            }
            .at(span)),
        }
    }

    fn class_stmt(&mut self, access: Access) -> Result<Stmt, ParseError> {
        let span = self.span();
        let kind = if self.accept_keyword("struct") {
            ClassKind::Struct
        } else {
            self.expect_keyword("class")?;
            ClassKind::Class
        };
        let name = self.ident()?;

        let mut inherits = vec![];
        if self.accept(&TokenKind::Punct(":")) {
            loop {
                inherits.push(self.ident()?);

                if !self.accept(&TokenKind::Punct(",")) {
                    break;
                }
            }
        }

        self.expect(TokenKind::Punct("{"))?;

        let mut fields = vec![];
        let mut methods = vec![];

        while !self.accept(&TokenKind::Punct("}")) {
            let member_access = match self.peek().and_then(access_modifier) {
                Some(access) => {
                    self.advance();
                    access
                }
                None => Access::Public,
            };
            let is_static = self.accept_keyword("static");

            if self.test_keyword("var") {
                let span = self.span();
                self.advance();
                let name = self.ident()?;
                let ty = self.type_annotation()?;
                self.semi()?;

                fields.push(FieldDecl {
                    name,
                    access: member_access,
                    is_static,
                    ty,
                    span,
                });
            } else {
                let is_meta = self.accept(&TokenKind::Punct("@"));
                let decl = self.fn_decl(member_access)?;

                methods.push(MethodDecl {
                    decl,
                    is_static,
                    is_meta,
                });
            }
        }

        Ok(StmtKind::Class(ClassDecl {
            name,
            kind,
            access,
            inherits,
            fields,
            methods,
            span,
        })
        .at(span))
    }

    fn declaration(&mut self, access: Access) -> Result<Stmt, ParseError> {
        let span = self.span();

        match self.peek() {
            Some(TokenKind::Keyword(w)) if w == "var" => self.var_stmt(access, false),
            Some(TokenKind::Keyword(w)) if w == "using" => {
                self.advance();
                self.var_stmt(access, true)
            }
            Some(TokenKind::Keyword(w)) if w == "class" || w == "struct" => {
                self.class_stmt(access)
            }
            _ if self.is_fn_decl(0) => Ok(StmtKind::Fn(self.fn_decl(access)?).at(span)),
            Some(token) => Err(ErrorKind::UnexpectedToken {
                expected: Cow::Borrowed("declaration"),
                actual: token.to_string(),
            }
            .at(span)),
            None => Err(ErrorKind::UnexpectedEof.at(span)),
        }
    }

    fn stmt(&mut self) -> Result<Stmt, ParseError> {
        let span = self.span();

        if let Some(access) = self.peek().and_then(access_modifier) {
            self.advance();
            return self.declaration(access);
        }

        match self.peek() {
            Some(TokenKind::Keyword(w)) => match w.as_str() {
                "var" | "using" | "class" | "struct" => self.declaration(Access::Private),
                "module" => self.module_stmt(),
                "if" => self.if_stmt(),
                "while" => self.while_stmt(),
                "for" => self.for_stmt(),
                "switch" => self.switch_stmt(),
                "return" => self.return_stmt(),
                "break" => self.break_stmt(),
                "continue" => self.continue_stmt(),
                "throw" => self.value_stmt(StmtKind::Throw),
                "out" => self.value_stmt(StmtKind::Out),
                "try" => self.try_stmt(),
                _ => self.expr_stmt(),
            },
            Some(TokenKind::Punct("{")) => Ok(StmtKind::Block(self.block()?).at(span)),
            Some(TokenKind::Punct("%")) => self.directive_stmt(),
            _ if self.is_fn_decl(0) => Ok(StmtKind::Fn(self.fn_decl(Access::Private)?).at(span)),
            _ => self.expr_stmt(),
        }
    }

    fn body(&mut self, global: bool) -> Result<Vec<Stmt>, ParseError> {
        let mut stmts = vec![];

        while let Some(token) = self.peek() {
            if !global && matches!(token, TokenKind::Punct("}")) {
                break;
            }

            stmts.push(self.stmt()?);
        }

        Ok(stmts)
    }

    pub fn parse(mut self) -> Result<Vec<Stmt>, ParseError> {
        self.body(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::parse;

    #[test]
    fn test_fn_decl_without_keyword() {
        let stmts = parse("testFunc(a, b, c) { return a + b + c; }").unwrap();

        match &stmts[0].kind {
            StmtKind::Fn(decl) => {
                assert_eq!(decl.name, "testFunc");
                assert_eq!(decl.params.len(), 3);
                assert!(decl.varargs.is_none());
            }
            kind => panic!("expected fn decl, got: {kind:?}"),
        }
    }

    #[test]
    fn test_call_is_not_a_decl() {
        let stmts = parse("foo(1, 2);").unwrap();
        assert!(matches!(
            stmts[0].kind,
            StmtKind::Expr(Expr {
                kind: ExprKind::Call(..),
                ..
            })
        ));
    }

    #[test]
    fn test_typed_varargs() {
        let stmts = parse("sum(first: int, ...args: int[]): int { return first; }").unwrap();

        match &stmts[0].kind {
            StmtKind::Fn(decl) => {
                let varargs = decl.varargs.as_ref().unwrap();
                assert_eq!(varargs.name, "args");
                assert_eq!(
                    varargs.ty,
                    Some(TypeName {
                        name: "int".into(),
                        array: true
                    })
                );
                assert_eq!(decl.ret.as_ref().unwrap().name, "int");
            }
            kind => panic!("expected fn decl, got: {kind:?}"),
        }
    }

    #[test]
    fn test_lambda_and_cast() {
        let stmts = parse("var f = (x) => x + 1; var i = <int> 3.14;").unwrap();

        assert!(matches!(
            &stmts[0].kind,
            StmtKind::Var(VarDecl {
                value: Some(Expr {
                    kind: ExprKind::Lambda(_),
                    ..
                }),
                ..
            })
        ));
        assert!(matches!(
            &stmts[1].kind,
            StmtKind::Var(VarDecl {
                value: Some(Expr {
                    kind: ExprKind::Cast(..),
                    ..
                }),
                ..
            })
        ));
    }

    #[test]
    fn test_precedence() {
        let stmts = parse("1 + 2 * 3;").unwrap();

        match &stmts[0].kind {
            StmtKind::Expr(Expr {
                kind: ExprKind::Binary(_, BinaryOp::Add, rhs),
                ..
            }) => assert!(matches!(rhs.kind, ExprKind::Binary(_, BinaryOp::Mul, _))),
            kind => panic!("unexpected: {kind:?}"),
        }
    }

    #[test]
    fn test_switch_and_generator() {
        let stmts = parse(
            "switch (x) { (1) { a = 1; } () { a = 2; } } var g = {{ out 1; out 2; }};",
        )
        .unwrap();

        assert!(matches!(&stmts[0].kind, StmtKind::Switch(_, arms, Some(_)) if arms.len() == 1));
        assert!(matches!(
            &stmts[1].kind,
            StmtKind::Var(VarDecl {
                value: Some(Expr {
                    kind: ExprKind::Generator(body),
                    ..
                }),
                ..
            }) if body.len() == 2
        ));
    }

    #[test]
    fn test_break_outside_loop() {
        let err = parse("break;").unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Parse(SpannedError {
                kind: ErrorKind::UnexpectedBreak,
                ..
            })
        ));
    }

    #[test]
    fn test_class_members() {
        let stmts = parse(
            "pub class Point : Base { pub var x: int; pri static var count: int; @add(other) { return this; } len(): int { return 0; } }",
        )
        .unwrap();

        match &stmts[0].kind {
            StmtKind::Class(class) => {
                assert_eq!(class.access, Access::Public);
                assert_eq!(class.inherits, vec!["Base".to_string()]);
                assert_eq!(class.fields.len(), 2);
                assert!(class.fields[1].is_static);
                assert!(class.methods[0].is_meta);
                assert!(!class.methods[1].is_meta);
            }
            kind => panic!("unexpected: {kind:?}"),
        }
    }

    #[test]
    fn test_compile_time_declarations() {
        let stmts = parse(
            "%compileTime var MAX = 10; %compileTime twice(n: int): int { return n * 2; } %compileTime { Assert(MAX > 0); }",
        )
        .unwrap();
        let kinds = stmts
            .iter()
            .map(|stmt| match &stmt.kind {
                StmtKind::CompileTime(CompileTimeDecl::Var(_)) => "var",
                StmtKind::CompileTime(CompileTimeDecl::Fn(_)) => "fn",
                StmtKind::CompileTime(CompileTimeDecl::Block(_)) => "block",
                _ => "other",
            })
            .collect::<Vec<_>>();

        assert_eq!(kinds, vec!["var", "fn", "block"]);
    }

    #[test]
    fn test_unknown_directive() {
        assert!(parse("%bench(\"x\") {}").is_err());
    }
}
