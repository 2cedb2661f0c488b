// Copyright (c) 2025 Flowengine Contributors
// SPDX-License-Identifier: Apache-2.0

//! The `${{ ... }}` expression evaluator (spec §4.1).
//!
//! A hand-written tokenizer + recursive-descent parser + tree-walking evaluator.
//! There is no host-language `eval` anywhere in this module: an expression can only
//! ever read from the [`EvalContext`] passed in, so "no host globals" is a structural
//! property of the interpreter rather than a denylist bolted on afterwards.

use crate::error::{EngineError, ExpressionErrorKind};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::{Duration, Instant};

const MAX_LITERAL_DEPTH: usize = 3;
const EVAL_TIMEOUT: Duration = Duration::from_secs(1);
const BANNED_IDENTIFIERS: &[&str] = &["Array", "Function", "eval", "globalThis", "process", "require"];

/// Per-step rollup exposed under `steps.<id>` in the context.
#[derive(Debug, Clone, Default)]
pub struct StepContext {
    pub output: Value,
    pub outputs: Value,
    pub status: String,
    pub error: Option<String>,
    /// Present for foreach parents: one entry per iteration.
    pub items: Option<Vec<StepContext>>,
}

impl StepContext {
    fn as_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("output".into(), self.output.clone());
        map.insert("outputs".into(), self.outputs.clone());
        map.insert("status".into(), Value::String(self.status.clone()));
        map.insert(
            "error".into(),
            self.error.clone().map(Value::String).unwrap_or(Value::Null),
        );
        if let Some(items) = &self.items {
            map.insert(
                "items".into(),
                Value::Array(items.iter().map(StepContext::as_value).collect()),
            );
        }
        Value::Object(map)
    }
}

/// The evaluation context: `{inputs, secrets, env, steps, item, index, memory}` (spec §4.1).
#[derive(Debug, Clone, Default)]
pub struct EvalContext {
    pub inputs: Value,
    pub secrets: Value,
    pub env: Value,
    pub steps: HashMap<String, StepContext>,
    pub item: Option<Value>,
    pub index: Option<i64>,
    pub memory: Value,
}

impl EvalContext {
    fn root(&self, name: &str) -> Option<Value> {
        match name {
            "inputs" => Some(self.inputs.clone()),
            "secrets" => Some(self.secrets.clone()),
            "env" => Some(self.env.clone()),
            "memory" => Some(self.memory.clone()),
            "item" => self.item.clone(),
            "index" => self.index.map(|i| Value::from(i)),
            "steps" => {
                let mut map = Map::new();
                for (k, v) in &self.steps {
                    map.insert(k.clone(), v.as_value());
                }
                Some(Value::Object(map))
            }
            _ => None,
        }
    }
}

/// Replaces every `${{ expr }}` fragment in `tpl` with its stringified evaluation;
/// literal text outside the markers is preserved verbatim.
pub fn evaluate_string(tpl: &str, ctx: &EvalContext) -> Result<String, EngineError> {
    let mut out = String::with_capacity(tpl.len());
    let mut rest = tpl;
    while let Some(start) = rest.find("${{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 3..];
        let Some(end) = after.find("}}") else {
            // Unterminated marker: treat the rest as literal text (no crash on malformed templates).
            out.push_str(&rest[start..]);
            rest = "";
            break;
        };
        let expr_src = after[..end].trim();
        let value = evaluate_expr(expr_src, ctx)?;
        out.push_str(&stringify(&value));
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

/// If `tpl` is exactly one `${{ ... }}` fragment, returns the native evaluated value;
/// otherwise behaves like [`evaluate_string`] and returns a JSON string.
pub fn evaluate(tpl: &str, ctx: &EvalContext) -> Result<Value, EngineError> {
    let trimmed = tpl.trim();
    if let Some(inner) = single_marker(trimmed) {
        return evaluate_expr(inner, ctx);
    }
    evaluate_string(tpl, ctx).map(Value::String)
}

fn single_marker(trimmed: &str) -> Option<&str> {
    let body = trimmed.strip_prefix("${{")?.strip_suffix("}}")?;
    // Must be the *entire* string -- no extra markers or literal text around it.
    if trimmed.matches("${{").count() == 1 {
        Some(body.trim())
    } else {
        None
    }
}

fn stringify(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

pub fn evaluate_expr(src: &str, ctx: &EvalContext) -> Result<Value, EngineError> {
    let tokens = tokenize(src)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let ast = parser.parse_ternary()?;
    if parser.pos != parser.tokens.len() {
        return Err(expr_err(ExpressionErrorKind::Syntax(
            "unexpected trailing tokens".into(),
        )));
    }
    let mut state = EvalState {
        start: Instant::now(),
    };
    eval_node(&ast, ctx, &mut state)
}

fn expr_err(kind: ExpressionErrorKind) -> EngineError {
    EngineError::Expression {
        step_id: None,
        kind,
    }
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    True,
    False,
    Null,
    Dot,
    LBracket,
    RBracket,
    LParen,
    RParen,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Question,
    Bang,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Lt,
    Le,
    Gt,
    Ge,
    EqEq,
    EqEqEq,
    NotEq,
    NotEqEq,
    AndAnd,
    OrOr,
}

fn tokenize(src: &str) -> Result<Vec<Token>, EngineError> {
    let chars: Vec<char> = src.chars().collect();
    let mut i = 0;
    let mut tokens = Vec::new();
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        match c {
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '{' => {
                tokens.push(Token::LBrace);
                i += 1;
            }
            '}' => {
                tokens.push(Token::RBrace);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            ':' => {
                tokens.push(Token::Colon);
                i += 1;
            }
            '?' => {
                tokens.push(Token::Question);
                i += 1;
            }
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '%' => {
                tokens.push(Token::Percent);
                i += 1;
            }
            '!' => {
                if peek(&chars, i + 1) == Some('=') {
                    if peek(&chars, i + 2) == Some('=') {
                        tokens.push(Token::NotEqEq);
                        i += 3;
                    } else {
                        tokens.push(Token::NotEq);
                        i += 2;
                    }
                } else {
                    tokens.push(Token::Bang);
                    i += 1;
                }
            }
            '=' => {
                if peek(&chars, i + 1) == Some('=') {
                    if peek(&chars, i + 2) == Some('=') {
                        tokens.push(Token::EqEqEq);
                        i += 3;
                    } else {
                        tokens.push(Token::EqEq);
                        i += 2;
                    }
                } else {
                    return Err(expr_err(ExpressionErrorKind::Syntax(
                        "unexpected '=' (use '==' or '===')".into(),
                    )));
                }
            }
            '<' => {
                if peek(&chars, i + 1) == Some('=') {
                    tokens.push(Token::Le);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '>' => {
                if peek(&chars, i + 1) == Some('=') {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '&' => {
                if peek(&chars, i + 1) == Some('&') {
                    tokens.push(Token::AndAnd);
                    i += 2;
                } else {
                    return Err(expr_err(ExpressionErrorKind::Syntax("unexpected '&'".into())));
                }
            }
            '|' => {
                if peek(&chars, i + 1) == Some('|') {
                    tokens.push(Token::OrOr);
                    i += 2;
                } else {
                    return Err(expr_err(ExpressionErrorKind::Syntax("unexpected '|'".into())));
                }
            }
            '\'' | '"' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => {
                            return Err(expr_err(ExpressionErrorKind::Syntax(
                                "unterminated string literal".into(),
                            )))
                        }
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some('\\') => {
                            i += 1;
                            match chars.get(i) {
                                Some('n') => s.push('\n'),
                                Some('t') => s.push('\t'),
                                Some(&ch) => s.push(ch),
                                None => {
                                    return Err(expr_err(ExpressionErrorKind::Syntax(
                                        "unterminated escape".into(),
                                    )))
                                }
                            }
                            i += 1;
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n: f64 = text
                    .parse()
                    .map_err(|_| expr_err(ExpressionErrorKind::Syntax(format!("bad number: {text}"))))?;
                tokens.push(Token::Number(n));
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$') {
                    i += 1;
                }
                let ident: String = chars[start..i].iter().collect();
                match ident.as_str() {
                    "true" => tokens.push(Token::True),
                    "false" => tokens.push(Token::False),
                    "null" => tokens.push(Token::Null),
                    _ => tokens.push(Token::Ident(ident)),
                }
            }
            other => {
                return Err(expr_err(ExpressionErrorKind::Syntax(format!(
                    "unexpected character: {other}"
                ))))
            }
        }
    }
    Ok(tokens)
}

fn peek(chars: &[char], i: usize) -> Option<char> {
    chars.get(i).copied()
}

// ---------------------------------------------------------------------------
// AST + parser
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Ast {
    Literal(Value),
    Root(String),
    Member(Box<Ast>, String),
    Index(Box<Ast>, Box<Ast>),
    MethodCall(Box<Ast>, String, Vec<Ast>),
    Array(Vec<Ast>),
    Object(Vec<(String, Ast)>),
    Unary(UnaryOp, Box<Ast>),
    Binary(BinOp, Box<Ast>, Box<Ast>),
    Ternary(Box<Ast>, Box<Ast>, Box<Ast>),
}

#[derive(Debug, Clone, Copy)]
enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Lt,
    Le,
    Gt,
    Ge,
    EqLoose,
    EqStrict,
    NeLoose,
    NeStrict,
    And,
    Or,
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, tok: &Token) -> Result<(), EngineError> {
        if self.peek() == Some(tok) {
            self.pos += 1;
            Ok(())
        } else {
            Err(expr_err(ExpressionErrorKind::Syntax(format!(
                "expected {tok:?}, found {:?}",
                self.peek()
            ))))
        }
    }

    fn parse_ternary(&mut self) -> Result<Ast, EngineError> {
        let cond = self.parse_or()?;
        if self.peek() == Some(&Token::Question) {
            self.bump();
            let then_branch = self.parse_ternary()?;
            self.expect(&Token::Colon)?;
            let else_branch = self.parse_ternary()?;
            Ok(Ast::Ternary(
                Box::new(cond),
                Box::new(then_branch),
                Box::new(else_branch),
            ))
        } else {
            Ok(cond)
        }
    }

    fn parse_or(&mut self) -> Result<Ast, EngineError> {
        let mut lhs = self.parse_and()?;
        while self.peek() == Some(&Token::OrOr) {
            self.bump();
            let rhs = self.parse_and()?;
            lhs = Ast::Binary(BinOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Ast, EngineError> {
        let mut lhs = self.parse_equality()?;
        while self.peek() == Some(&Token::AndAnd) {
            self.bump();
            let rhs = self.parse_equality()?;
            lhs = Ast::Binary(BinOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_equality(&mut self) -> Result<Ast, EngineError> {
        let mut lhs = self.parse_relational()?;
        loop {
            let op = match self.peek() {
                Some(Token::EqEq) => BinOp::EqLoose,
                Some(Token::EqEqEq) => BinOp::EqStrict,
                Some(Token::NotEq) => BinOp::NeLoose,
                Some(Token::NotEqEq) => BinOp::NeStrict,
                _ => break,
            };
            self.bump();
            let rhs = self.parse_relational()?;
            lhs = Ast::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_relational(&mut self) -> Result<Ast, EngineError> {
        let mut lhs = self.parse_additive()?;
        loop {
            let op = match self.peek() {
                Some(Token::Lt) => BinOp::Lt,
                Some(Token::Le) => BinOp::Le,
                Some(Token::Gt) => BinOp::Gt,
                Some(Token::Ge) => BinOp::Ge,
                _ => break,
            };
            self.bump();
            let rhs = self.parse_additive()?;
            lhs = Ast::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_additive(&mut self) -> Result<Ast, EngineError> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => break,
            };
            self.bump();
            let rhs = self.parse_multiplicative()?;
            lhs = Ast::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_multiplicative(&mut self) -> Result<Ast, EngineError> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                Some(Token::Percent) => BinOp::Mod,
                _ => break,
            };
            self.bump();
            let rhs = self.parse_unary()?;
            lhs = Ast::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Ast, EngineError> {
        match self.peek() {
            Some(Token::Bang) => {
                self.bump();
                Ok(Ast::Unary(UnaryOp::Not, Box::new(self.parse_unary()?)))
            }
            Some(Token::Minus) => {
                self.bump();
                Ok(Ast::Unary(UnaryOp::Neg, Box::new(self.parse_unary()?)))
            }
            _ => self.parse_postfix(),
        }
    }

    fn parse_postfix(&mut self) -> Result<Ast, EngineError> {
        let mut node = self.parse_primary()?;
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.bump();
                    match self.bump() {
                        Some(Token::Ident(name)) => {
                            if self.peek() == Some(&Token::LParen) {
                                self.bump();
                                let args = self.parse_call_args()?;
                                node = Ast::MethodCall(Box::new(node), name, args);
                            } else {
                                node = Ast::Member(Box::new(node), name);
                            }
                        }
                        other => {
                            return Err(expr_err(ExpressionErrorKind::Syntax(format!(
                                "expected identifier after '.', found {other:?}"
                            ))))
                        }
                    }
                }
                Some(Token::LBracket) => {
                    self.bump();
                    let index_expr = self.parse_ternary()?;
                    self.expect(&Token::RBracket)?;
                    node = Ast::Index(Box::new(node), Box::new(index_expr));
                }
                _ => break,
            }
        }
        Ok(node)
    }

    fn parse_call_args(&mut self) -> Result<Vec<Ast>, EngineError> {
        let mut args = Vec::new();
        if self.peek() != Some(&Token::RParen) {
            loop {
                args.push(self.parse_ternary()?);
                if self.peek() == Some(&Token::Comma) {
                    self.bump();
                } else {
                    break;
                }
            }
        }
        self.expect(&Token::RParen)?;
        Ok(args)
    }

    fn parse_primary(&mut self) -> Result<Ast, EngineError> {
        match self.bump() {
            Some(Token::Number(n)) => Ok(Ast::Literal(Value::from(n))),
            Some(Token::Str(s)) => Ok(Ast::Literal(Value::String(s))),
            Some(Token::True) => Ok(Ast::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Ast::Literal(Value::Bool(false))),
            Some(Token::Null) => Ok(Ast::Literal(Value::Null)),
            Some(Token::Ident(name)) => {
                if BANNED_IDENTIFIERS.contains(&name.as_str()) {
                    return Err(expr_err(ExpressionErrorKind::BannedIdentifier(name)));
                }
                Ok(Ast::Root(name))
            }
            Some(Token::LParen) => {
                let inner = self.parse_ternary()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Some(Token::LBracket) => self.parse_array(),
            Some(Token::LBrace) => self.parse_object(),
            other => Err(expr_err(ExpressionErrorKind::Syntax(format!(
                "unexpected token: {other:?}"
            )))),
        }
    }

    fn enter_literal(&mut self) -> Result<(), EngineError> {
        self.depth += 1;
        if self.depth > MAX_LITERAL_DEPTH {
            return Err(expr_err(ExpressionErrorKind::NestingDepthExceeded));
        }
        Ok(())
    }

    fn parse_array(&mut self) -> Result<Ast, EngineError> {
        self.enter_literal()?;
        let mut items = Vec::new();
        if self.peek() != Some(&Token::RBracket) {
            loop {
                items.push(self.parse_ternary()?);
                if self.peek() == Some(&Token::Comma) {
                    self.bump();
                } else {
                    break;
                }
            }
        }
        self.expect(&Token::RBracket)?;
        self.depth -= 1;
        Ok(Ast::Array(items))
    }

    fn parse_object(&mut self) -> Result<Ast, EngineError> {
        self.enter_literal()?;
        let mut fields = Vec::new();
        if self.peek() != Some(&Token::RBrace) {
            loop {
                let key = match self.bump() {
                    Some(Token::Ident(s)) | Some(Token::Str(s)) => s,
                    other => {
                        return Err(expr_err(ExpressionErrorKind::Syntax(format!(
                            "expected object key, found {other:?}"
                        ))))
                    }
                };
                self.expect(&Token::Colon)?;
                let value = self.parse_ternary()?;
                fields.push((key, value));
                if self.peek() == Some(&Token::Comma) {
                    self.bump();
                } else {
                    break;
                }
            }
        }
        self.expect(&Token::RBrace)?;
        self.depth -= 1;
        Ok(Ast::Object(fields))
    }
}

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

struct EvalState {
    start: Instant,
}

fn check_timeout(state: &EvalState) -> Result<(), EngineError> {
    if state.start.elapsed() > EVAL_TIMEOUT {
        return Err(expr_err(ExpressionErrorKind::EvaluationTimeout));
    }
    Ok(())
}

fn eval_node(ast: &Ast, ctx: &EvalContext, state: &mut EvalState) -> Result<Value, EngineError> {
    check_timeout(state)?;
    match ast {
        Ast::Literal(v) => Ok(v.clone()),
        Ast::Root(name) => ctx
            .root(name)
            .ok_or_else(|| expr_err(ExpressionErrorKind::UndefinedVariable(name.clone()))),
        Ast::Member(base, field) => {
            let base_val = eval_node(base, ctx, state)?;
            Ok(index_member(&base_val, field))
        }
        Ast::Index(base, index) => {
            let base_val = eval_node(base, ctx, state)?;
            let idx_val = eval_node(index, ctx, state)?;
            Ok(index_value(&base_val, &idx_val))
        }
        Ast::MethodCall(base, method, args) => {
            let base_val = eval_node(base, ctx, state)?;
            let mut arg_vals = Vec::with_capacity(args.len());
            for arg in args {
                arg_vals.push(eval_node(arg, ctx, state)?);
            }
            call_method(&base_val, method, &arg_vals)
        }
        Ast::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(eval_node(item, ctx, state)?);
            }
            Ok(Value::Array(out))
        }
        Ast::Object(fields) => {
            let mut map = Map::new();
            for (k, v) in fields {
                map.insert(k.clone(), eval_node(v, ctx, state)?);
            }
            Ok(Value::Object(map))
        }
        Ast::Unary(op, inner) => {
            let v = eval_node(inner, ctx, state)?;
            match op {
                UnaryOp::Not => Ok(Value::Bool(!truthy(&v))),
                UnaryOp::Neg => {
                    let n = as_number(&v)?;
                    Ok(Value::from(-n))
                }
            }
        }
        Ast::Binary(op, lhs, rhs) => eval_binary(*op, lhs, rhs, ctx, state),
        Ast::Ternary(cond, then_b, else_b) => {
            let c = eval_node(cond, ctx, state)?;
            if truthy(&c) {
                eval_node(then_b, ctx, state)
            } else {
                eval_node(else_b, ctx, state)
            }
        }
    }
}

fn eval_binary(
    op: BinOp,
    lhs: &Ast,
    rhs: &Ast,
    ctx: &EvalContext,
    state: &mut EvalState,
) -> Result<Value, EngineError> {
    // Short-circuit logical operators.
    if matches!(op, BinOp::And) {
        let l = eval_node(lhs, ctx, state)?;
        if !truthy(&l) {
            return Ok(l);
        }
        return eval_node(rhs, ctx, state);
    }
    if matches!(op, BinOp::Or) {
        let l = eval_node(lhs, ctx, state)?;
        if truthy(&l) {
            return Ok(l);
        }
        return eval_node(rhs, ctx, state);
    }

    let l = eval_node(lhs, ctx, state)?;
    let r = eval_node(rhs, ctx, state)?;
    match op {
        BinOp::Add => match (&l, &r) {
            (Value::String(a), _) => Ok(Value::String(format!("{a}{}", stringify(&r)))),
            (_, Value::String(b)) => Ok(Value::String(format!("{}{b}", stringify(&l)))),
            _ => Ok(Value::from(as_number(&l)? + as_number(&r)?)),
        },
        BinOp::Sub => Ok(Value::from(as_number(&l)? - as_number(&r)?)),
        BinOp::Mul => Ok(Value::from(as_number(&l)? * as_number(&r)?)),
        BinOp::Div => Ok(Value::from(as_number(&l)? / as_number(&r)?)),
        BinOp::Mod => Ok(Value::from(as_number(&l)? % as_number(&r)?)),
        BinOp::Lt => Ok(Value::Bool(compare(&l, &r)? == std::cmp::Ordering::Less)),
        BinOp::Le => Ok(Value::Bool(compare(&l, &r)? != std::cmp::Ordering::Greater)),
        BinOp::Gt => Ok(Value::Bool(compare(&l, &r)? == std::cmp::Ordering::Greater)),
        BinOp::Ge => Ok(Value::Bool(compare(&l, &r)? != std::cmp::Ordering::Less)),
        BinOp::EqStrict => Ok(Value::Bool(l == r)),
        BinOp::NeStrict => Ok(Value::Bool(l != r)),
        BinOp::EqLoose => Ok(Value::Bool(loose_eq(&l, &r))),
        BinOp::NeLoose => Ok(Value::Bool(!loose_eq(&l, &r))),
        BinOp::And | BinOp::Or => unreachable!("handled above"),
    }
}

fn index_member(base: &Value, field: &str) -> Value {
    match base {
        Value::Object(map) => map.get(field).cloned().unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

/// Built-in method calls reachable from expression syntax, e.g.
/// `${{ steps.s2.output.stdout.trim() }}`. Deliberately small: string trimming and
/// length are the only methods a workflow template needs without reaching for a
/// host-language `eval`.
fn call_method(base: &Value, method: &str, _args: &[Value]) -> Result<Value, EngineError> {
    match (base, method) {
        (Value::String(s), "trim") => Ok(Value::String(s.trim().to_string())),
        (Value::String(s), "length") | (Value::String(s), "len") => Ok(Value::from(s.chars().count() as i64)),
        (Value::Array(a), "length") | (Value::Array(a), "len") => Ok(Value::from(a.len() as i64)),
        (other, m) => Err(expr_err(ExpressionErrorKind::TypeError(format!(
            "no method \"{m}\" on {other:?}"
        )))),
    }
}

fn index_value(base: &Value, index: &Value) -> Value {
    match (base, index) {
        (Value::Array(arr), Value::Number(n)) => {
            let i = n.as_i64().unwrap_or(-1);
            if i >= 0 {
                arr.get(i as usize).cloned().unwrap_or(Value::Null)
            } else {
                Value::Null
            }
        }
        (Value::Object(map), Value::String(s)) => map.get(s).cloned().unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

pub fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(_) => true,
    }
}

fn as_number(v: &Value) -> Result<f64, EngineError> {
    match v {
        Value::Number(n) => Ok(n.as_f64().unwrap_or(f64::NAN)),
        Value::String(s) => s
            .parse()
            .map_err(|_| expr_err(ExpressionErrorKind::TypeError(format!("cannot coerce {s:?} to number")))),
        Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        Value::Null => Ok(0.0),
        other => Err(expr_err(ExpressionErrorKind::TypeError(format!(
            "cannot coerce {other:?} to number"
        )))),
    }
}

fn compare(l: &Value, r: &Value) -> Result<std::cmp::Ordering, EngineError> {
    match (l, r) {
        (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
        _ => {
            let a = as_number(l)?;
            let b = as_number(r)?;
            a.partial_cmp(&b)
                .ok_or_else(|| expr_err(ExpressionErrorKind::TypeError("NaN comparison".into())))
        }
    }
}

/// JS-style loose `==`: numeric coercion across number/string/bool, `null`
/// equal only to `null`, structural equality for arrays/objects.
fn loose_eq(l: &Value, r: &Value) -> bool {
    match (l, r) {
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        (Value::Array(_), _) | (_, Value::Array(_)) | (Value::Object(_), _) | (_, Value::Object(_)) => l == r,
        _ if std::mem::discriminant(l) == std::mem::discriminant(r) => l == r,
        _ => as_number(l).ok().zip(as_number(r).ok()).map(|(a, b)| a == b).unwrap_or(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx_with_steps() -> EvalContext {
        let mut steps = HashMap::new();
        steps.insert(
            "s2".to_string(),
            StepContext {
                output: json!({"stdout": "done\n", "code": 0}),
                outputs: json!({}),
                status: "success".into(),
                error: None,
                items: None,
            },
        );
        EvalContext {
            inputs: json!({"name": "world"}),
            secrets: json!({}),
            env: json!({}),
            steps,
            item: None,
            index: None,
            memory: Value::Null,
        }
    }

    #[test]
    fn literal_text_preserved() {
        let ctx = EvalContext::default();
        let out = evaluate_string("hello world", &ctx).unwrap();
        assert_eq!(out, "hello world");
    }

    #[test]
    fn interpolates_inputs() {
        let ctx = ctx_with_steps();
        let out = evaluate_string("hi ${{ inputs.name }}!", &ctx).unwrap();
        assert_eq!(out, "hi world!");
    }

    #[test]
    fn evaluate_returns_native_value_for_whole_marker() {
        let ctx = ctx_with_steps();
        let v = evaluate("${{ steps.s2.output }}", &ctx).unwrap();
        assert_eq!(v, json!({"stdout": "done\n", "code": 0}));
    }

    #[test]
    fn arithmetic_and_comparison() {
        let ctx = EvalContext::default();
        assert_eq!(evaluate("${{ 1 + 2 * 3 }}", &ctx).unwrap(), json!(7.0));
        assert_eq!(evaluate("${{ 1 < 2 }}", &ctx).unwrap(), json!(true));
        assert_eq!(evaluate("${{ '1' == 1 }}", &ctx).unwrap(), json!(true));
        assert_eq!(evaluate("${{ '1' === 1 }}", &ctx).unwrap(), json!(false));
    }

    #[test]
    fn ternary_and_logical() {
        let ctx = EvalContext::default();
        assert_eq!(evaluate("${{ true ? 'a' : 'b' }}", &ctx).unwrap(), json!("a"));
        assert_eq!(evaluate("${{ false || 'fallback' }}", &ctx).unwrap(), json!("fallback"));
        assert_eq!(evaluate("${{ !false }}", &ctx).unwrap(), json!(true));
    }

    #[test]
    fn array_and_object_literals() {
        let ctx = EvalContext::default();
        assert_eq!(evaluate("${{ [1, 2, 3] }}", &ctx).unwrap(), json!([1.0, 2.0, 3.0]));
        assert_eq!(evaluate("${{ {a: 1, b: 2} }}", &ctx).unwrap(), json!({"a": 1.0, "b": 2.0}));
    }

    #[test]
    fn undefined_variable_errors() {
        let ctx = EvalContext::default();
        let err = evaluate("${{ nope.field }}", &ctx).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Expression {
                kind: ExpressionErrorKind::UndefinedVariable(_),
                ..
            }
        ));
    }

    #[test]
    fn banned_identifier_rejected() {
        let ctx = EvalContext::default();
        let err = evaluate("${{ Array }}", &ctx).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Expression {
                kind: ExpressionErrorKind::BannedIdentifier(_),
                ..
            }
        ));
    }

    #[test]
    fn nesting_depth_enforced() {
        let ctx = EvalContext::default();
        // depth 4 array literal: [[[[1]]]]
        let err = evaluate("${{ [[[[1]]]] }}", &ctx);
        assert!(err.is_err());
    }

    #[test]
    fn index_and_member_chains() {
        let ctx = ctx_with_steps();
        assert_eq!(
            evaluate("${{ steps.s2.output.stdout }}", &ctx).unwrap(),
            json!("done\n")
        );
        assert_eq!(evaluate("${{ [10,20,30][1] }}", &ctx).unwrap(), json!(20.0));
    }

    #[test]
    fn string_trim_method_call() {
        let ctx = ctx_with_steps();
        assert_eq!(
            evaluate("${{ steps.s2.output.stdout.trim() }}", &ctx).unwrap(),
            json!("done")
        );
    }

    #[test]
    fn string_and_array_length_methods() {
        let ctx = EvalContext::default();
        assert_eq!(evaluate("${{ 'hello'.length() }}", &ctx).unwrap(), json!(5_i64));
        assert_eq!(evaluate("${{ 'hello'.len() }}", &ctx).unwrap(), json!(5_i64));
        assert_eq!(evaluate("${{ [1,2,3].length() }}", &ctx).unwrap(), json!(3_i64));
    }
}
