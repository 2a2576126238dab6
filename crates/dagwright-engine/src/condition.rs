//! Condition expressions for edges, loops, and signal nodes.
//!
//! A condition is compiled once, when the edge or node that owns it is
//! built, and evaluated against a read-only JSON namespace. On edges the
//! namespace maps each completed node id to that node's output, so
//! `chooser.selected_option == 0` or `not brk['triggered']` read upstream
//! results directly.
//!
//! Grammar:
//!
//! ```text
//! expr    := or
//! or      := and (("or" | "||") and)*
//! and     := not (("and" | "&&") not)*
//! not     := ("not" | "!") not | compare
//! compare := operand (("==" | "!=" | "<" | "<=" | ">" | ">=" | "in") operand)?
//! operand := literal | path | "(" expr ")"
//! path    := ident ("." ident | "[" (string | integer) "]")*
//! ```
//!
//! Syntax errors surface as `DagError::InvalidCondition` at construction.
//! Evaluation errors (unknown names, missing fields, mismatched types) make
//! [`Condition::check`] return false.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use dagwright_core::{is_truthy, DagError, Payload, Result};

/// Why a condition could not be evaluated.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error("unresolved name '{0}'")]
    Unresolved(String),

    #[error("'{path}' has no field '{field}'")]
    MissingField { path: String, field: String },

    #[error("index {index} out of range for '{path}'")]
    IndexOutOfRange { path: String, index: i64 },

    #[error("cannot index {kind} value at '{path}'")]
    NotIndexable { path: String, kind: &'static str },

    #[error("cannot order {left} and {right}")]
    Incomparable {
        left: &'static str,
        right: &'static str,
    },

    #[error("'in' is not supported for {needle} in {haystack}")]
    Membership {
        needle: &'static str,
        haystack: &'static str,
    },
}

/// A compiled condition expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    source: String,
    expr: Expr,
}

impl Condition {
    /// Compile a condition.
    pub fn parse(source: &str) -> Result<Self> {
        let invalid = |message: String| DagError::InvalidCondition {
            expr: source.to_string(),
            message,
        };

        let tokens = tokenize(source).map_err(invalid)?;
        if tokens.is_empty() {
            return Err(invalid("empty expression".into()));
        }

        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let expr = parser.parse_or().map_err(invalid)?;
        if let Some(tok) = parser.peek() {
            return Err(invalid(format!("unexpected {} after expression", tok)));
        }

        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    /// The original expression text.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate to a boolean, reporting why evaluation failed.
    pub fn evaluate(&self, namespace: &Payload) -> std::result::Result<bool, EvalError> {
        self.expr.eval(namespace).map(|v| is_truthy(&v))
    }

    /// Evaluate to a boolean; any evaluation failure counts as false.
    pub fn check(&self, namespace: &Payload) -> bool {
        match self.evaluate(namespace) {
            Ok(result) => result,
            Err(e) => {
                debug!(condition = %self.source, error = %e, "Condition evaluation failed, treating as false");
                false
            }
        }
    }
}

impl FromStr for Condition {
    type Err = DagError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

// ── Lexer ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Literal(Value),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Dot,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Not,
    In,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(name) => write!(f, "name '{}'", name),
            Token::Literal(v) => write!(f, "literal {}", v),
            Token::LParen => f.write_str("'('"),
            Token::RParen => f.write_str("')'"),
            Token::LBracket => f.write_str("'['"),
            Token::RBracket => f.write_str("']'"),
            Token::Dot => f.write_str("'.'"),
            Token::Eq => f.write_str("'=='"),
            Token::Ne => f.write_str("'!='"),
            Token::Lt => f.write_str("'<'"),
            Token::Le => f.write_str("'<='"),
            Token::Gt => f.write_str("'>'"),
            Token::Ge => f.write_str("'>='"),
            Token::And => f.write_str("'and'"),
            Token::Or => f.write_str("'or'"),
            Token::Not => f.write_str("'not'"),
            Token::In => f.write_str("'in'"),
        }
    }
}

fn tokenize(input: &str) -> std::result::Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
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
            '[' => {
                chars.next();
                tokens.push(Token::LBracket);
            }
            ']' => {
                chars.next();
                tokens.push(Token::RBracket);
            }
            '.' => {
                chars.next();
                tokens.push(Token::Dot);
            }
            '=' => {
                chars.next();
                if chars.next_if_eq(&'=').is_none() {
                    return Err("expected '==' (assignment is not supported)".into());
                }
                tokens.push(Token::Eq);
            }
            '!' => {
                chars.next();
                if chars.next_if_eq(&'=').is_some() {
                    tokens.push(Token::Ne);
                } else {
                    tokens.push(Token::Not);
                }
            }
            '<' => {
                chars.next();
                if chars.next_if_eq(&'=').is_some() {
                    tokens.push(Token::Le);
                } else {
                    tokens.push(Token::Lt);
                }
            }
            '>' => {
                chars.next();
                if chars.next_if_eq(&'=').is_some() {
                    tokens.push(Token::Ge);
                } else {
                    tokens.push(Token::Gt);
                }
            }
            '&' => {
                chars.next();
                if chars.next_if_eq(&'&').is_none() {
                    return Err("expected '&&'".into());
                }
                tokens.push(Token::And);
            }
            '|' => {
                chars.next();
                if chars.next_if_eq(&'|').is_none() {
                    return Err("expected '||'".into());
                }
                tokens.push(Token::Or);
            }
            '\'' | '"' => {
                chars.next();
                let mut text = String::new();
                let mut closed = false;
                while let Some(ch) = chars.next() {
                    match ch {
                        '\\' => match chars.next() {
                            Some('n') => text.push('\n'),
                            Some('t') => text.push('\t'),
                            Some(other) => text.push(other),
                            None => return Err("unterminated escape sequence".into()),
                        },
                        ch if ch == c => {
                            closed = true;
                            break;
                        }
                        ch => text.push(ch),
                    }
                }
                if !closed {
                    return Err("unterminated string literal".into());
                }
                tokens.push(Token::Literal(Value::String(text)));
            }
            c if c.is_ascii_digit() || c == '-' => {
                let mut text = String::new();
                text.push(c);
                chars.next();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' || d == 'e' || d == 'E' {
                        text.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Literal(parse_number(&text)?));
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut word = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_alphanumeric() || d == '_' || d == '-' {
                        word.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(match word.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "in" => Token::In,
                    "true" | "True" => Token::Literal(Value::Bool(true)),
                    "false" | "False" => Token::Literal(Value::Bool(false)),
                    "null" | "None" => Token::Literal(Value::Null),
                    _ => Token::Ident(word),
                });
            }
            other => return Err(format!("unexpected character '{}'", other)),
        }
    }

    Ok(tokens)
}

fn parse_number(text: &str) -> std::result::Result<Value, String> {
    if let Ok(i) = text.parse::<i64>() {
        return Ok(Value::from(i));
    }
    text.parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
        .ok_or_else(|| format!("invalid number '{}'", text))
}

// ── AST ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Key(String),
    Index(i64),
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Path(String, Vec<Segment>),

    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),

    Equal(Box<Expr>, Box<Expr>),
    NotEqual(Box<Expr>, Box<Expr>),
    LessThan(Box<Expr>, Box<Expr>),
    LessThanOrEqual(Box<Expr>, Box<Expr>),
    GreaterThan(Box<Expr>, Box<Expr>),
    GreaterThanOrEqual(Box<Expr>, Box<Expr>),
    In(Box<Expr>, Box<Expr>),
}

/// Deepest nesting of `not` and parentheses a condition may use.
const MAX_DEPTH: usize = 64;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn descend(&mut self) -> std::result::Result<(), String> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(format!("expression nested deeper than {} levels", MAX_DEPTH));
        }
        Ok(())
    }

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

    fn expect(&mut self, expected: Token) -> std::result::Result<(), String> {
        match self.next() {
            Some(tok) if tok == expected => Ok(()),
            Some(tok) => Err(format!("expected {}, found {}", expected, tok)),
            None => Err(format!("expected {}, found end of expression", expected)),
        }
    }

    fn parse_or(&mut self) -> std::result::Result<Expr, String> {
        let mut left = self.parse_and()?;
        while self.eat(&Token::Or) {
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> std::result::Result<Expr, String> {
        let mut left = self.parse_not()?;
        while self.eat(&Token::And) {
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> std::result::Result<Expr, String> {
        if self.eat(&Token::Not) {
            self.descend()?;
            let inner = self.parse_not()?;
            self.depth -= 1;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_compare()
    }

    fn parse_compare(&mut self) -> std::result::Result<Expr, String> {
        let left = self.parse_operand()?;
        let build: fn(Box<Expr>, Box<Expr>) -> Expr = match self.peek() {
            Some(Token::Eq) => Expr::Equal,
            Some(Token::Ne) => Expr::NotEqual,
            Some(Token::Lt) => Expr::LessThan,
            Some(Token::Le) => Expr::LessThanOrEqual,
            Some(Token::Gt) => Expr::GreaterThan,
            Some(Token::Ge) => Expr::GreaterThanOrEqual,
            Some(Token::In) => Expr::In,
            _ => return Ok(left),
        };
        self.pos += 1;
        let right = self.parse_operand()?;
        Ok(build(Box::new(left), Box::new(right)))
    }

    fn parse_operand(&mut self) -> std::result::Result<Expr, String> {
        match self.next() {
            Some(Token::Literal(v)) => Ok(Expr::Literal(v)),
            Some(Token::LParen) => {
                self.descend()?;
                let inner = self.parse_or()?;
                self.expect(Token::RParen)?;
                self.depth -= 1;
                Ok(inner)
            }
            Some(Token::Ident(root)) => {
                let mut segments = Vec::new();
                loop {
                    if self.eat(&Token::Dot) {
                        match self.next() {
                            Some(Token::Ident(field)) => segments.push(Segment::Key(field)),
                            Some(tok) => return Err(format!("expected field name after '.', found {}", tok)),
                            None => return Err("expected field name after '.'".into()),
                        }
                    } else if self.eat(&Token::LBracket) {
                        match self.next() {
                            Some(Token::Literal(Value::String(key))) => segments.push(Segment::Key(key)),
                            Some(Token::Literal(Value::Number(n))) if n.is_i64() => {
                                segments.push(Segment::Index(n.as_i64().unwrap_or_default()))
                            }
                            Some(tok) => return Err(format!("expected string or integer index, found {}", tok)),
                            None => return Err("expected index after '['".into()),
                        }
                        self.expect(Token::RBracket)?;
                    } else {
                        break;
                    }
                }
                Ok(Expr::Path(root, segments))
            }
            Some(tok) => Err(format!("unexpected {}", tok)),
            None => Err("unexpected end of expression".into()),
        }
    }
}

// ── Evaluation ──────────────────────────────────────────────────

impl Expr {
    fn eval(&self, ns: &Payload) -> std::result::Result<Value, EvalError> {
        match self {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Path(root, segments) => resolve(ns, root, segments).cloned(),
            Expr::Not(inner) => Ok(Value::Bool(!is_truthy(&inner.eval(ns)?))),
            Expr::And(l, r) => {
                if !is_truthy(&l.eval(ns)?) {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(is_truthy(&r.eval(ns)?)))
            }
            Expr::Or(l, r) => {
                if is_truthy(&l.eval(ns)?) {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(is_truthy(&r.eval(ns)?)))
            }
            Expr::Equal(l, r) => Ok(Value::Bool(values_equal(&l.eval(ns)?, &r.eval(ns)?))),
            Expr::NotEqual(l, r) => Ok(Value::Bool(!values_equal(&l.eval(ns)?, &r.eval(ns)?))),
            Expr::LessThan(l, r) => ordered(ns, l, r, |o| o == Ordering::Less),
            Expr::LessThanOrEqual(l, r) => ordered(ns, l, r, |o| o != Ordering::Greater),
            Expr::GreaterThan(l, r) => ordered(ns, l, r, |o| o == Ordering::Greater),
            Expr::GreaterThanOrEqual(l, r) => ordered(ns, l, r, |o| o != Ordering::Less),
            Expr::In(l, r) => contains(&r.eval(ns)?, &l.eval(ns)?).map(Value::Bool),
        }
    }
}

fn resolve<'a>(
    ns: &'a Payload,
    root: &str,
    segments: &[Segment],
) -> std::result::Result<&'a Value, EvalError> {
    let mut current = ns
        .get(root)
        .ok_or_else(|| EvalError::Unresolved(root.to_string()))?;
    let mut path = root.to_string();

    for segment in segments {
        current = match (segment, current) {
            (Segment::Key(key), Value::Object(map)) => {
                map.get(key).ok_or_else(|| EvalError::MissingField {
                    path: path.clone(),
                    field: key.clone(),
                })?
            }
            (Segment::Index(index), Value::Array(items)) => {
                let len = items.len() as i64;
                let idx = if *index < 0 { len + index } else { *index };
                if idx < 0 || idx >= len {
                    return Err(EvalError::IndexOutOfRange {
                        path,
                        index: *index,
                    });
                }
                &items[idx as usize]
            }
            (_, other) => {
                return Err(EvalError::NotIndexable {
                    path,
                    kind: kind_name(other),
                })
            }
        };
        match segment {
            Segment::Key(key) => {
                path.push('.');
                path.push_str(key);
            }
            Segment::Index(index) => path.push_str(&format!("[{}]", index)),
        }
    }

    Ok(current)
}

fn ordered(
    ns: &Payload,
    l: &Expr,
    r: &Expr,
    accept: fn(Ordering) -> bool,
) -> std::result::Result<Value, EvalError> {
    let left = l.eval(ns)?;
    let right = r.eval(ns)?;
    compare_values(&left, &right).map(|o| Value::Bool(accept(o)))
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn compare_values(a: &Value, b: &Value) -> std::result::Result<Ordering, EvalError> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .zip(y.as_f64())
            .and_then(|(x, y)| x.partial_cmp(&y))
            .ok_or(EvalError::Incomparable {
                left: "number",
                right: "number",
            }),
        (Value::String(x), Value::String(y)) => Ok(x.cmp(y)),
        _ => Err(EvalError::Incomparable {
            left: kind_name(a),
            right: kind_name(b),
        }),
    }
}

fn contains(haystack: &Value, needle: &Value) -> std::result::Result<bool, EvalError> {
    match (haystack, needle) {
        (Value::String(h), Value::String(n)) => Ok(h.contains(n.as_str())),
        (Value::Array(items), _) => Ok(items.iter().any(|item| values_equal(item, needle))),
        (Value::Object(map), Value::String(key)) => Ok(map.contains_key(key)),
        _ => Err(EvalError::Membership {
            needle: kind_name(needle),
            haystack: kind_name(haystack),
        }),
    }
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
