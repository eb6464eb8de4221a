//! Condition expression evaluation.
//!
//! `if` expressions are parsed into a small typed AST and evaluated
//! against an explicit [`RunContext`] - no templating, no reflection.
//!
//! Grammar:
//!
//! ```text
//! expr   := and ("||" and)*
//! and    := unary ("&&" unary)*
//! unary  := "!" unary | cmp
//! cmp    := primary (("==" | "!=") primary)?
//! primary:= "(" expr ")" | literal | function "()" | field-path
//! ```
//!
//! Fields: `event`, `ref`, `sha`, `actor`, `matrix.<axis>`,
//! `needs.<job>.result`. Functions: `always()`, `success()`, `failure()`,
//! `cancelled()`. A condition that uses no status function gets an
//! implicit `success() &&` prefix, which is what makes a failed
//! dependency block dependents unless they opt out with `always()`.

use std::collections::BTreeMap;

use crate::error::{EngineError, EngineResult};

/// Outcome of a needed job, as seen by a dependent's condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeedOutcome {
    Success,
    Failure,
    Skipped,
    Cancelled,
}

impl NeedOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            NeedOutcome::Success => "success",
            NeedOutcome::Failure => "failure",
            NeedOutcome::Skipped => "skipped",
            NeedOutcome::Cancelled => "cancelled",
        }
    }
}

/// Typed evaluation context for one job instance.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    pub event: String,
    pub ref_name: String,
    pub sha: String,
    pub actor: String,
    pub run_cancelled: bool,
    /// Conclusions of this job's `needs`, keyed by job id.
    pub needs: BTreeMap<String, NeedOutcome>,
    /// Matrix point values for this instance.
    pub matrix: BTreeMap<String, String>,
    /// Whether a Skipped dependency satisfies `success()`.
    pub skipped_satisfies: bool,
}

impl RunContext {
    /// `success()`: every dependency succeeded (Skipped counts when policy
    /// allows). True with no dependencies.
    pub fn needs_satisfied(&self) -> bool {
        self.needs.values().all(|outcome| match outcome {
            NeedOutcome::Success => true,
            NeedOutcome::Skipped => self.skipped_satisfies,
            _ => false,
        })
    }

    /// `failure()`: at least one dependency failed or was cancelled.
    pub fn any_need_failed(&self) -> bool {
        self.needs
            .values()
            .any(|o| matches!(o, NeedOutcome::Failure | NeedOutcome::Cancelled))
    }
}

/// Typed expression values.
#[derive(Debug, Clone, PartialEq)]
enum Value {
    Str(String),
    Bool(bool),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Str(_) => "string",
            Value::Bool(_) => "bool",
        }
    }
}

/// Status functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Func {
    Always,
    Success,
    Failure,
    Cancelled,
}

/// Condition expression AST.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    StrLit(String),
    BoolLit(bool),
    Field(Vec<String>),
    Call(Func),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Eq(Box<Expr>, Box<Expr>),
    Ne(Box<Expr>, Box<Expr>),
}

impl Expr {
    /// Whether the expression references any status function.
    pub fn uses_status_fn(&self) -> bool {
        match self {
            Expr::Call(_) => true,
            Expr::Not(e) => e.uses_status_fn(),
            Expr::And(a, b) | Expr::Or(a, b) | Expr::Eq(a, b) | Expr::Ne(a, b) => {
                a.uses_status_fn() || b.uses_status_fn()
            }
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    EqEq,
    NotEq,
    AndAnd,
    OrOr,
    Bang,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> EngineResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '=' => {
                chars.next();
                if chars.next_if_eq(&'=').is_some() {
                    tokens.push(Token::EqEq);
                } else {
                    return Err(parse_err(input, "expected '=='"));
                }
            }
            '!' => {
                chars.next();
                if chars.next_if_eq(&'=').is_some() {
                    tokens.push(Token::NotEq);
                } else {
                    tokens.push(Token::Bang);
                }
            }
            '&' => {
                chars.next();
                if chars.next_if_eq(&'&').is_some() {
                    tokens.push(Token::AndAnd);
                } else {
                    return Err(parse_err(input, "expected '&&'"));
                }
            }
            '|' => {
                chars.next();
                if chars.next_if_eq(&'|').is_some() {
                    tokens.push(Token::OrOr);
                } else {
                    return Err(parse_err(input, "expected '||'"));
                }
            }
            '\'' | '"' => {
                let quote = c;
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some(ch) if ch == quote => break,
                        Some(ch) => s.push(ch),
                        None => return Err(parse_err(input, "unterminated string literal")),
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' || c == '/' => {
                let mut ident = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_ascii_alphanumeric() || ch == '_' || ch == '.' || ch == '-' || ch == '/'
                    {
                        ident.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            other => {
                return Err(parse_err(input, &format!("unexpected character '{}'", other)));
            }
        }
    }

    Ok(tokens)
}

fn parse_err(expr: &str, msg: &str) -> EngineError {
    EngineError::ConditionEval(format!("'{}': {}", expr, msg))
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expr(&mut self) -> EngineResult<Expr> {
        let mut left = self.and()?;
        while self.eat(&Token::OrOr) {
            let right = self.and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> EngineResult<Expr> {
        let mut left = self.unary()?;
        while self.eat(&Token::AndAnd) {
            let right = self.unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> EngineResult<Expr> {
        if self.eat(&Token::Bang) {
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> EngineResult<Expr> {
        let left = self.primary()?;
        if self.eat(&Token::EqEq) {
            let right = self.primary()?;
            return Ok(Expr::Eq(Box::new(left), Box::new(right)));
        }
        if self.eat(&Token::NotEq) {
            let right = self.primary()?;
            return Ok(Expr::Ne(Box::new(left), Box::new(right)));
        }
        Ok(left)
    }

    fn primary(&mut self) -> EngineResult<Expr> {
        match self.next() {
            Some(Token::LParen) => {
                let inner = self.expr()?;
                if !self.eat(&Token::RParen) {
                    return Err(parse_err(self.source, "expected ')'"));
                }
                Ok(inner)
            }
            Some(Token::Str(s)) => Ok(Expr::StrLit(s)),
            Some(Token::Ident(ident)) => {
                if self.eat(&Token::LParen) {
                    if !self.eat(&Token::RParen) {
                        return Err(parse_err(self.source, "status functions take no arguments"));
                    }
                    let func = match ident.as_str() {
                        "always" => Func::Always,
                        "success" => Func::Success,
                        "failure" => Func::Failure,
                        "cancelled" => Func::Cancelled,
                        other => {
                            return Err(parse_err(
                                self.source,
                                &format!("unknown function '{}'", other),
                            ))
                        }
                    };
                    return Ok(Expr::Call(func));
                }
                match ident.as_str() {
                    "true" => Ok(Expr::BoolLit(true)),
                    "false" => Ok(Expr::BoolLit(false)),
                    _ => Ok(Expr::Field(
                        ident.split('.').map(|s| s.to_string()).collect(),
                    )),
                }
            }
            other => Err(parse_err(
                self.source,
                &format!("unexpected token {:?}", other),
            )),
        }
    }
}

/// Parse a condition expression into its AST.
pub fn parse(input: &str) -> EngineResult<Expr> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(parse_err(input, "empty expression"));
    }
    let mut parser = Parser {
        source: input,
        tokens,
        pos: 0,
    };
    let expr = parser.expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(parse_err(input, "trailing tokens after expression"));
    }
    Ok(expr)
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

fn eval_expr(expr: &Expr, ctx: &RunContext, source: &str) -> EngineResult<Value> {
    match expr {
        Expr::StrLit(s) => Ok(Value::Str(s.clone())),
        Expr::BoolLit(b) => Ok(Value::Bool(*b)),
        Expr::Field(path) => resolve_field(path, ctx, source),
        Expr::Call(func) => Ok(Value::Bool(match func {
            Func::Always => true,
            Func::Success => ctx.needs_satisfied(),
            Func::Failure => ctx.any_need_failed(),
            Func::Cancelled => ctx.run_cancelled,
        })),
        Expr::Not(inner) => {
            let v = eval_bool_value(inner, ctx, source)?;
            Ok(Value::Bool(!v))
        }
        Expr::And(a, b) => {
            // Short-circuit.
            if !eval_bool_value(a, ctx, source)? {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(eval_bool_value(b, ctx, source)?))
        }
        Expr::Or(a, b) => {
            if eval_bool_value(a, ctx, source)? {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(eval_bool_value(b, ctx, source)?))
        }
        Expr::Eq(a, b) => compare(a, b, ctx, source).map(Value::Bool),
        Expr::Ne(a, b) => compare(a, b, ctx, source).map(|eq| Value::Bool(!eq)),
    }
}

fn compare(a: &Expr, b: &Expr, ctx: &RunContext, source: &str) -> EngineResult<bool> {
    let left = eval_expr(a, ctx, source)?;
    let right = eval_expr(b, ctx, source)?;
    match (&left, &right) {
        (Value::Str(l), Value::Str(r)) => Ok(l == r),
        (Value::Bool(l), Value::Bool(r)) => Ok(l == r),
        _ => Err(EngineError::ConditionEval(format!(
            "'{}': cannot compare {} with {}",
            source,
            left.type_name(),
            right.type_name()
        ))),
    }
}

fn eval_bool_value(expr: &Expr, ctx: &RunContext, source: &str) -> EngineResult<bool> {
    match eval_expr(expr, ctx, source)? {
        Value::Bool(b) => Ok(b),
        Value::Str(_) => Err(EngineError::ConditionEval(format!(
            "'{}': expected a boolean, got a string",
            source
        ))),
    }
}

fn resolve_field(path: &[String], ctx: &RunContext, source: &str) -> EngineResult<Value> {
    let unknown = || {
        EngineError::ConditionEval(format!(
            "'{}': unknown field '{}'",
            source,
            path.join(".")
        ))
    };

    match path {
        [single] => match single.as_str() {
            "event" => Ok(Value::Str(ctx.event.clone())),
            "ref" | "branch" => Ok(Value::Str(ctx.ref_name.clone())),
            "sha" => Ok(Value::Str(ctx.sha.clone())),
            "actor" => Ok(Value::Str(ctx.actor.clone())),
            _ => Err(unknown()),
        },
        [ns, axis] if ns == "matrix" => ctx
            .matrix
            .get(axis)
            .map(|v| Value::Str(v.clone()))
            .ok_or_else(unknown),
        [ns, job, field] if ns == "needs" && field == "result" => ctx
            .needs
            .get(job)
            .map(|o| Value::Str(o.as_str().to_string()))
            .ok_or_else(unknown),
        _ => Err(unknown()),
    }
}

/// Evaluate a condition expression against the context.
///
/// Expressions without a status function get the implicit
/// `success() &&` prefix.
pub fn evaluate(input: &str, ctx: &RunContext) -> EngineResult<bool> {
    let expr = parse(input)?;
    let effective = if expr.uses_status_fn() {
        expr
    } else {
        Expr::And(Box::new(Expr::Call(Func::Success)), Box::new(expr))
    };
    eval_bool_value(&effective, ctx, input)
}
