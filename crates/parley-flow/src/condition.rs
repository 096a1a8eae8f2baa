//! Equation conditions: a small boolean language over session variables.
//!
//! ```text
//! expr      := and_expr ( "OR" and_expr )*
//! and_expr  := unary ( "AND" unary )*
//! unary     := "(" expr ")" | predicate
//! predicate := operand ( "exists" | "not exists" | "not_exists" )
//!            | operand cmp operand
//!            | operand
//! cmp       := ">=" | "<=" | ">>" | "<<" | ">" | "<" | "!=" | "==" | "CONTAINS" | "NOT CONTAINS"
//! operand   := "{{" name "}}" | 'quoted' | "quoted" | bare words
//! ```
//!
//! `AND` binds tighter than `OR`; both associate to the left. Variables are
//! resolved after parsing, so operator text inside a value never changes the
//! shape of the expression. A missing or null variable reads as the empty string.

use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;
use tracing::warn;

/// Why an equation could not be parsed.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message} (at offset {offset})")]
pub struct ConditionError {
    pub message: String,
    pub offset: usize,
}

impl ConditionError {
    fn new(message: impl Into<String>, offset: usize) -> Self {
        Self {
            message: message.into(),
            offset,
        }
    }
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Ge,
    Le,
    Gt,
    Lt,
    Ne,
    Eq,
    Contains,
    NotContains,
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CmpOp::Ge => ">=",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">>",
            CmpOp::Lt => "<<",
            CmpOp::Ne => "!=",
            CmpOp::Eq => "==",
            CmpOp::Contains => "CONTAINS",
            CmpOp::NotContains => "NOT CONTAINS",
        };
        f.write_str(s)
    }
}

/// One side of a comparison.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// `{{name}}`
    Var(String),
    /// A quoted literal, always a string.
    Quoted(String),
    /// Unquoted text, coerced to int, float, bool or string.
    Bare(String),
}

/// Parsed equation.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Blank equation; vacuously true.
    Always,
    Or(Box<Condition>, Box<Condition>),
    And(Box<Condition>, Box<Condition>),
    Exists { name: String, negated: bool },
    Compare { left: Operand, op: CmpOp, right: Operand },
    Truthy(Operand),
}

/// Read access to variables during evaluation.
pub trait VariableLookup {
    fn lookup(&self, name: &str) -> Option<&Value>;
}

impl VariableLookup for std::collections::HashMap<String, Value> {
    fn lookup(&self, name: &str) -> Option<&Value> {
        self.get(name)
    }
}

impl Condition {
    /// Parse an equation. Blank input yields [`Condition::Always`].
    pub fn parse(input: &str) -> Result<Self, ConditionError> {
        let tokens = lex(input)?;
        if tokens.is_empty() {
            return Ok(Condition::Always);
        }
        let mut parser = Parser { tokens, pos: 0 };
        let condition = parser.parse_or()?;
        if let Some(tok) = parser.peek() {
            return Err(ConditionError::new(
                format!("unexpected {}", tok.kind.describe()),
                tok.offset,
            ));
        }
        Ok(condition)
    }

    /// Evaluate against a set of variables. Type mismatches in ordering
    /// comparisons are logged and evaluate to false.
    pub fn evaluate(&self, vars: &dyn VariableLookup) -> bool {
        match self {
            Condition::Always => true,
            Condition::Or(a, b) => a.evaluate(vars) || b.evaluate(vars),
            Condition::And(a, b) => a.evaluate(vars) && b.evaluate(vars),
            Condition::Exists { name, negated } => {
                let present = matches!(vars.lookup(name), Some(v) if !v.is_null());
                present != *negated
            }
            Condition::Compare { left, op, right } => {
                let l = resolve(left, vars);
                let r = resolve(right, vars);
                match compare(&l, *op, &r) {
                    Some(result) => result,
                    None => {
                        warn!(left = %l, op = %op, right = %r, "Equation type mismatch");
                        false
                    }
                }
            }
            Condition::Truthy(operand) => truthy(&resolve(operand, vars)),
        }
    }
}

fn resolve(operand: &Operand, vars: &dyn VariableLookup) -> Value {
    match operand {
        Operand::Var(name) => match vars.lookup(name) {
            Some(Value::Null) | None => Value::String(String::new()),
            Some(v) => v.clone(),
        },
        Operand::Quoted(s) => Value::String(s.clone()),
        Operand::Bare(s) => coerce_literal(s),
    }
}

/// Trial coercion of unquoted text: integer, then float, then boolean, else string.
pub fn coerce_literal(text: &str) -> Value {
    let text = text.trim();
    if text.contains('.') {
        if let Ok(f) = text.parse::<f64>() {
            if let Some(n) = serde_json::Number::from_f64(f) {
                return Value::Number(n);
            }
        }
    } else if let Ok(i) = text.parse::<i64>() {
        return Value::from(i);
    }
    if text.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if text.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    Value::String(text.to_string())
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn ordering(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match (haystack, needle) {
        (Value::String(h), Value::String(n)) => h.contains(n.as_str()),
        (Value::Array(items), n) => items.iter().any(|item| values_equal(item, n)),
        _ => false,
    }
}

/// `None` signals a type mismatch.
fn compare(l: &Value, op: CmpOp, r: &Value) -> Option<bool> {
    match op {
        CmpOp::Eq => Some(values_equal(l, r)),
        CmpOp::Ne => Some(!values_equal(l, r)),
        CmpOp::Contains => Some(contains(l, r)),
        CmpOp::NotContains => Some(!contains(l, r)),
        CmpOp::Gt => ordering(l, r).map(|o| o == Ordering::Greater),
        CmpOp::Lt => ordering(l, r).map(|o| o == Ordering::Less),
        CmpOp::Ge => ordering(l, r).map(|o| o != Ordering::Less),
        CmpOp::Le => ordering(l, r).map(|o| o != Ordering::Greater),
    }
}

// -----------------------------------------------------------------------------
// Lexer
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    LParen,
    RParen,
    Symbol(CmpOp),
    Var(String),
    Quoted(String),
    Word(String),
}

impl TokenKind {
    fn describe(&self) -> String {
        match self {
            TokenKind::LParen => "'('".to_string(),
            TokenKind::RParen => "')'".to_string(),
            TokenKind::Symbol(op) => format!("operator '{}'", op),
            TokenKind::Var(name) => format!("variable '{{{{{}}}}}'", name),
            TokenKind::Quoted(s) => format!("literal '{}'", s),
            TokenKind::Word(w) => format!("'{}'", w),
        }
    }

    fn is_word(&self, word: &str) -> bool {
        matches!(self, TokenKind::Word(w) if w == word)
    }

    fn is_word_ignore_case(&self, word: &str) -> bool {
        matches!(self, TokenKind::Word(w) if w.eq_ignore_ascii_case(word))
    }
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    offset: usize,
}

const SYMBOLS: [(&str, CmpOp); 8] = [
    (">=", CmpOp::Ge),
    ("<=", CmpOp::Le),
    (">>", CmpOp::Gt),
    ("<<", CmpOp::Lt),
    ("!=", CmpOp::Ne),
    ("==", CmpOp::Eq),
    (">", CmpOp::Gt),
    ("<", CmpOp::Lt),
];

fn symbol_at(rest: &str) -> Option<(&'static str, CmpOp)> {
    SYMBOLS.iter().copied().find(|(s, _)| rest.starts_with(s))
}

fn lex(input: &str) -> Result<Vec<Token>, ConditionError> {
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < input.len() {
        let rest = &input[pos..];
        let Some(c) = rest.chars().next() else { break };

        if c.is_whitespace() {
            pos += c.len_utf8();
            continue;
        }
        if c == '(' || c == ')' {
            let kind = if c == '(' { TokenKind::LParen } else { TokenKind::RParen };
            tokens.push(Token { kind, offset: pos });
            pos += 1;
            continue;
        }
        if rest.starts_with("{{") {
            let end = rest
                .find("}}")
                .ok_or_else(|| ConditionError::new("unterminated '{{'", pos))?;
            let name = rest[2..end].trim();
            if name.is_empty() {
                return Err(ConditionError::new("empty variable name", pos));
            }
            tokens.push(Token {
                kind: TokenKind::Var(name.to_string()),
                offset: pos,
            });
            pos += end + 2;
            continue;
        }
        if c == '"' || c == '\'' {
            let body = &rest[1..];
            let end = body
                .find(c)
                .ok_or_else(|| ConditionError::new("unterminated quoted literal", pos))?;
            tokens.push(Token {
                kind: TokenKind::Quoted(body[..end].to_string()),
                offset: pos,
            });
            pos += end + 2;
            continue;
        }
        if let Some((sym, op)) = symbol_at(rest) {
            tokens.push(Token {
                kind: TokenKind::Symbol(op),
                offset: pos,
            });
            pos += sym.len();
            continue;
        }

        // Bare word: up to whitespace, a paren, a quote, a variable or a symbol
        let start = pos;
        let mut end = pos;
        for (i, ch) in rest.char_indices() {
            let here = &rest[i..];
            if ch.is_whitespace()
                || ch == '('
                || ch == ')'
                || ch == '"'
                || ch == '\''
                || here.starts_with("{{")
                || symbol_at(here).is_some()
            {
                break;
            }
            end = pos + i + ch.len_utf8();
        }
        if end == start {
            return Err(ConditionError::new(format!("unexpected character '{}'", c), pos));
        }
        tokens.push(Token {
            kind: TokenKind::Word(input[start..end].to_string()),
            offset: start,
        });
        pos = end;
    }

    Ok(tokens)
}

// -----------------------------------------------------------------------------
// Parser
// -----------------------------------------------------------------------------

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_kind(&self, ahead: usize) -> Option<&TokenKind> {
        self.tokens.get(self.pos + ahead).map(|t| &t.kind)
    }

    fn end_offset(&self) -> usize {
        self.tokens.last().map(|t| t.offset + 1).unwrap_or(0)
    }

    fn parse_or(&mut self) -> Result<Condition, ConditionError> {
        let mut left = self.parse_and()?;
        while self.peek_kind(0).is_some_and(|k| k.is_word("OR")) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Condition::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Condition, ConditionError> {
        let mut left = self.parse_unary()?;
        while self.peek_kind(0).is_some_and(|k| k.is_word("AND")) {
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Condition::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Condition, ConditionError> {
        if matches!(self.peek_kind(0), Some(TokenKind::LParen)) {
            self.pos += 1;
            let inner = self.parse_or()?;
            match self.peek() {
                Some(Token {
                    kind: TokenKind::RParen,
                    ..
                }) => {
                    self.pos += 1;
                    Ok(inner)
                }
                Some(tok) => Err(ConditionError::new(
                    format!("expected ')', found {}", tok.kind.describe()),
                    tok.offset,
                )),
                None => Err(ConditionError::new("expected ')'", self.end_offset())),
            }
        } else {
            self.parse_predicate()
        }
    }

    fn parse_predicate(&mut self) -> Result<Condition, ConditionError> {
        let offset = self.peek().map(|t| t.offset).unwrap_or_else(|| self.end_offset());
        let left = self.parse_operand()?;

        if let Some(negated) = self.take_exists() {
            return match left {
                Operand::Var(name) => Ok(Condition::Exists { name, negated }),
                _ => Err(ConditionError::new("'exists' expects a {{variable}}", offset)),
            };
        }

        if let Some(op) = self.take_cmp() {
            let right = self.parse_operand()?;
            return Ok(Condition::Compare { left, op, right });
        }

        Ok(Condition::Truthy(left))
    }

    fn take_exists(&mut self) -> Option<bool> {
        let first = self.peek_kind(0)?;
        if first.is_word_ignore_case("exists") {
            self.pos += 1;
            return Some(false);
        }
        if first.is_word_ignore_case("not_exists") {
            self.pos += 1;
            return Some(true);
        }
        if first.is_word_ignore_case("not")
            && self.peek_kind(1).is_some_and(|k| k.is_word_ignore_case("exists"))
        {
            self.pos += 2;
            return Some(true);
        }
        None
    }

    fn take_cmp(&mut self) -> Option<CmpOp> {
        match self.peek_kind(0)? {
            TokenKind::Symbol(op) => {
                let op = *op;
                self.pos += 1;
                Some(op)
            }
            k if k.is_word("CONTAINS") => {
                self.pos += 1;
                Some(CmpOp::Contains)
            }
            k if k.is_word("NOT") && self.peek_kind(1).is_some_and(|n| n.is_word("CONTAINS")) => {
                self.pos += 2;
                Some(CmpOp::NotContains)
            }
            _ => None,
        }
    }

    /// True if the word at `ahead` starts a keyword rather than continuing bare text.
    fn keyword_at(&self, ahead: usize) -> bool {
        let Some(kind) = self.peek_kind(ahead) else {
            return false;
        };
        let next = self.peek_kind(ahead + 1);
        kind.is_word("AND")
            || kind.is_word("OR")
            || kind.is_word("CONTAINS")
            || kind.is_word_ignore_case("exists")
            || kind.is_word_ignore_case("not_exists")
            || (kind.is_word("NOT") && next.is_some_and(|n| n.is_word("CONTAINS")))
            || (kind.is_word_ignore_case("not") && next.is_some_and(|n| n.is_word_ignore_case("exists")))
    }

    fn parse_operand(&mut self) -> Result<Operand, ConditionError> {
        let Some(tok) = self.peek().cloned() else {
            return Err(ConditionError::new("expected an operand", self.end_offset()));
        };
        match tok.kind {
            TokenKind::Var(name) => {
                self.pos += 1;
                Ok(Operand::Var(name))
            }
            TokenKind::Quoted(s) => {
                self.pos += 1;
                Ok(Operand::Quoted(s))
            }
            TokenKind::Word(_) if !self.keyword_at(0) => {
                let mut words = Vec::new();
                while let Some(TokenKind::Word(w)) = self.peek_kind(0) {
                    if self.keyword_at(0) {
                        break;
                    }
                    words.push(w.clone());
                    self.pos += 1;
                }
                Ok(Operand::Bare(words.join(" ")))
            }
            other => Err(ConditionError::new(
                format!("expected an operand, found {}", other.describe()),
                tok.offset,
            )),
        }
    }
}
