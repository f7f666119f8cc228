//! Restricted expression language.
//!
//! Expressions appear inside `${ ... }` substitution markers and in stage
//! `condition` fields. The language has literals, read-only path lookups
//! and a fixed operator set; there are no function calls, assignments or
//! loops, so evaluating an expression can only ever read from the
//! [`Scope`] it is given.
//!
//! ```
//! use pipewright::expr::{evaluate, Scope};
//! use serde_json::json;
//!
//! let scope = Scope::new().with_root("variables", json!({"chapters": 12}));
//! let value = evaluate("chapters > 10 ? 'long' : 'short'", &scope).unwrap();
//! assert_eq!(value, json!("long"));
//! ```

use serde_json::{Map, Number, Value};
use std::fmt;
use thiserror::Error;

/// Maximum nesting depth accepted by the parser.
const MAX_DEPTH: usize = 64;

/// Maximum expression length in bytes.
const MAX_LEN: usize = 4096;

/// Roots consulted, in order, when an expression uses a bare identifier.
const BARE_ROOTS: [&str; 2] = ["variables", "settings"];

/// Errors produced while parsing or evaluating an expression.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExprError {
    /// The expression is malformed.
    #[error("syntax error at {pos}: {message}")]
    Syntax {
        /// Byte offset of the offending token.
        pos: usize,
        /// What went wrong.
        message: String,
    },

    /// A path did not resolve against the scope.
    #[error("unresolved reference '{0}'")]
    Unresolved(String),

    /// An operator was applied to operands of the wrong type.
    #[error("type error: {0}")]
    Type(String),

    /// Division or remainder by zero.
    #[error("division by zero")]
    DivisionByZero,
}

/// Read-only lookup context for evaluation.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    roots: Map<String, Value>,
    env: bool,
}

impl Scope {
    /// Creates an empty scope with environment lookups disabled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) a named root.
    #[must_use]
    pub fn with_root(mut self, name: impl Into<String>, value: Value) -> Self {
        self.roots.insert(name.into(), value);
        self
    }

    /// Enables `env.NAME` lookups against the process environment.
    #[must_use]
    pub fn with_env(mut self) -> Self {
        self.env = true;
        self
    }

    /// Inserts a named root in place.
    pub fn set_root(&mut self, name: impl Into<String>, value: Value) {
        self.roots.insert(name.into(), value);
    }

    fn resolve(&self, path: &[Segment]) -> Result<Value, ExprError> {
        let unresolved = || ExprError::Unresolved(display_path(path));
        let Some(Segment::Key(first)) = path.first() else {
            return Err(unresolved());
        };

        if first == "env" && self.env && !self.roots.contains_key("env") {
            return match path {
                [_, Segment::Key(name)] => std::env::var(name)
                    .map(Value::String)
                    .map_err(|_| unresolved()),
                _ => Err(unresolved()),
            };
        }

        if let Some(root) = self.roots.get(first) {
            return walk(root, &path[1..]).cloned().ok_or_else(unresolved);
        }

        // Bare identifier: look it up under the fallback roots.
        BARE_ROOTS
            .iter()
            .filter_map(|root| self.roots.get(*root))
            .find_map(|root| walk(root, path))
            .cloned()
            .ok_or_else(unresolved)
    }
}

fn walk<'v>(mut current: &'v Value, path: &[Segment]) -> Option<&'v Value> {
    for segment in path {
        current = match (segment, current) {
            (Segment::Key(key), Value::Object(map)) => map.get(key)?,
            (Segment::Index(idx), Value::Array(items)) => items.get(*idx)?,
            _ => return None,
        };
    }
    Some(current)
}

/// One step of a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Object key.
    Key(String),
    /// Array index.
    Index(usize),
}

fn display_path(path: &[Segment]) -> String {
    let mut out = String::new();
    for (i, segment) in path.iter().enumerate() {
        match segment {
            Segment::Key(key) if i == 0 => out.push_str(key),
            Segment::Key(key) => {
                out.push('.');
                out.push_str(key);
            }
            Segment::Index(idx) => out.push_str(&format!("[{idx}]")),
        }
    }
    out
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    /// `!`
    Not,
    /// `-`
    Neg,
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    /// `||`
    Or,
    /// `&&`
    And,
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
    /// `%`
    Rem,
}

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A literal value.
    Literal(Value),
    /// A path lookup.
    Path(Vec<Segment>),
    /// A unary operation.
    Unary(UnaryOp, Box<Expr>),
    /// A binary operation.
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    /// `cond ? then : otherwise`
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>),
}

impl Expr {
    /// Evaluates the expression against a scope.
    pub fn eval(&self, scope: &Scope) -> Result<Value, ExprError> {
        match self {
            Self::Literal(v) => Ok(v.clone()),
            Self::Path(path) => scope.resolve(path),
            Self::Unary(UnaryOp::Not, inner) => Ok(Value::Bool(!truthy(&inner.eval(scope)?))),
            Self::Unary(UnaryOp::Neg, inner) => {
                let n = as_number(&inner.eval(scope)?, "-")?;
                Ok(number(-n))
            }
            Self::Binary(BinaryOp::Or, left, right) => match left.eval(scope) {
                Ok(v) if truthy(&v) => Ok(v),
                _ => right.eval(scope),
            },
            Self::Binary(BinaryOp::And, left, right) => {
                let l = left.eval(scope)?;
                if truthy(&l) {
                    right.eval(scope)
                } else {
                    Ok(l)
                }
            }
            Self::Binary(op, left, right) => {
                let l = left.eval(scope)?;
                let r = right.eval(scope)?;
                binary(*op, &l, &r)
            }
            Self::Ternary(cond, then, otherwise) => {
                if truthy(&cond.eval(scope)?) {
                    then.eval(scope)
                } else {
                    otherwise.eval(scope)
                }
            }
        }
    }
}

fn binary(op: BinaryOp, l: &Value, r: &Value) -> Result<Value, ExprError> {
    match op {
        BinaryOp::Eq => Ok(Value::Bool(loose_eq(l, r))),
        BinaryOp::Ne => Ok(Value::Bool(!loose_eq(l, r))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = match (l, r) {
                (Value::Number(_), Value::Number(_)) => {
                    as_number(l, "compare")?.partial_cmp(&as_number(r, "compare")?)
                }
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                _ => None,
            }
            .ok_or_else(|| ExprError::Type(format!("cannot compare {l} and {r}")))?;
            let result = match op {
                BinaryOp::Lt => ordering.is_lt(),
                BinaryOp::Le => ordering.is_le(),
                BinaryOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            };
            Ok(Value::Bool(result))
        }
        BinaryOp::Add => match (l, r) {
            (Value::Number(_), Value::Number(_)) => {
                Ok(number(as_number(l, "+")? + as_number(r, "+")?))
            }
            (Value::String(_), _) | (_, Value::String(_)) => {
                Ok(Value::String(format!("{}{}", render(l), render(r))))
            }
            _ => Err(ExprError::Type(format!("cannot add {l} and {r}"))),
        },
        BinaryOp::Sub => Ok(number(as_number(l, "-")? - as_number(r, "-")?)),
        BinaryOp::Mul => Ok(number(as_number(l, "*")? * as_number(r, "*")?)),
        BinaryOp::Div | BinaryOp::Rem => {
            let divisor = as_number(r, "/")?;
            if divisor == 0.0 {
                return Err(ExprError::DivisionByZero);
            }
            let dividend = as_number(l, "/")?;
            Ok(number(if op == BinaryOp::Div {
                dividend / divisor
            } else {
                dividend % divisor
            }))
        }
        BinaryOp::Or | BinaryOp::And => unreachable_logical(),
    }
}

// Logical operators short-circuit in `Expr::eval` and never reach `binary`.
fn unreachable_logical() -> Result<Value, ExprError> {
    Err(ExprError::Type("logical operator evaluated eagerly".into()))
}

fn loose_eq(l: &Value, r: &Value) -> bool {
    match (l, r) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => l == r,
    }
}

fn as_number(v: &Value, op: &str) -> Result<f64, ExprError> {
    v.as_f64()
        .ok_or_else(|| ExprError::Type(format!("operator '{op}' expects a number, got {v}")))
}

#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        Value::Number(Number::from(n as i64))
    } else {
        Number::from_f64(n).map_or(Value::Null, Value::Number)
    }
}

/// Truthiness: `null`, `false`, `0`, `""` and empty collections are false.
#[must_use]
pub fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// String rendering used when a value is interpolated into text.
#[must_use]
pub fn render(v: &Value) -> String {
    match v {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Parses and evaluates `src` in one step.
pub fn evaluate(src: &str, scope: &Scope) -> Result<Value, ExprError> {
    parse(src)?.eval(scope)
}

/// Evaluates `src` as a boolean condition. A `${ ... }` wrapper is allowed.
pub fn evaluate_condition(src: &str, scope: &Scope) -> Result<bool, ExprError> {
    let trimmed = src.trim();
    let inner = trimmed
        .strip_prefix("${")
        .and_then(|rest| rest.strip_suffix('}'))
        .unwrap_or(trimmed);
    evaluate(inner, scope).map(|v| truthy(&v))
}

// ============================================================================
// Lexer
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    Sym(&'static str),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Str(s) => write!(f, "'{s}'"),
            Self::Ident(s) => write!(f, "{s}"),
            Self::Sym(s) => write!(f, "{s}"),
        }
    }
}

const SYMBOLS: [&str; 20] = [
    "||", "&&", "==", "!=", "<=", ">=", "<", ">", "!", "+", "-", "*", "/", "%", "?", ":", "(",
    ")", ".", "[",
];

fn tokenize(src: &str) -> Result<Vec<(usize, Token)>, ExprError> {
    let bytes = src.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        if c.is_ascii_whitespace() {
            i += 1;
        } else if c.is_ascii_digit() {
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            // Only treat '.' as a decimal point when a digit follows, so
            // `items.0.name` still lexes as a path.
            if i + 1 < bytes.len() && bytes[i] == b'.' && bytes[i + 1].is_ascii_digit() {
                i += 1;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
            }
            let n = src[start..i].parse::<f64>().map_err(|e| ExprError::Syntax {
                pos: start,
                message: e.to_string(),
            })?;
            tokens.push((start, Token::Number(n)));
        } else if c == b'\'' || c == b'"' {
            let start = i;
            let mut out = String::new();
            i += 1;
            loop {
                let Some(&b) = bytes.get(i) else {
                    return Err(ExprError::Syntax {
                        pos: start,
                        message: "unterminated string".into(),
                    });
                };
                if b == c {
                    i += 1;
                    break;
                }
                if b == b'\\' && i + 1 < bytes.len() {
                    i += 1;
                }
                let ch = src[i..].chars().next().unwrap_or_default();
                out.push(ch);
                i += ch.len_utf8();
            }
            tokens.push((start, Token::Str(out)));
        } else if c.is_ascii_alphabetic() || c == b'_' {
            let start = i;
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
            tokens.push((start, Token::Ident(src[start..i].to_string())));
        } else if c == b']' {
            tokens.push((i, Token::Sym("]")));
            i += 1;
        } else if let Some(sym) = SYMBOLS.iter().find(|s| src[i..].starts_with(**s)) {
            tokens.push((i, Token::Sym(sym)));
            i += sym.len();
        } else {
            return Err(ExprError::Syntax {
                pos: i,
                message: format!("unexpected character '{}'", src[i..].chars().next().unwrap_or('?')),
            });
        }
    }

    Ok(tokens)
}

// ============================================================================
// Parser
// ============================================================================

/// Parses an expression.
pub fn parse(src: &str) -> Result<Expr, ExprError> {
    if src.len() > MAX_LEN {
        return Err(ExprError::Syntax {
            pos: MAX_LEN,
            message: format!("expression longer than {MAX_LEN} bytes"),
        });
    }
    let tokens = tokenize(src)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
        end: src.len(),
    };
    let expr = parser.ternary()?;
    if let Some((pos, tok)) = parser.tokens.get(parser.pos) {
        return Err(ExprError::Syntax {
            pos: *pos,
            message: format!("unexpected token {tok}"),
        });
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    depth: usize,
    end: usize,
}

impl Parser {
    fn peek_sym(&self) -> Option<&'static str> {
        match self.tokens.get(self.pos) {
            Some((_, Token::Sym(s))) => Some(s),
            _ => None,
        }
    }

    fn eat(&mut self, sym: &str) -> bool {
        if self.peek_sym() == Some(sym) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map_or(self.end, |(p, _)| *p)
    }

    fn expect(&mut self, sym: &str) -> Result<(), ExprError> {
        if self.eat(sym) {
            Ok(())
        } else {
            Err(ExprError::Syntax {
                pos: self.offset(),
                message: format!("expected '{sym}'"),
            })
        }
    }

    fn descend(&mut self) -> Result<(), ExprError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(ExprError::Syntax {
                pos: self.offset(),
                message: "expression nested too deeply".into(),
            });
        }
        Ok(())
    }

    fn ternary(&mut self) -> Result<Expr, ExprError> {
        self.descend()?;
        let cond = self.binary_level(0)?;
        let expr = if self.eat("?") {
            let then = self.ternary()?;
            self.expect(":")?;
            let otherwise = self.ternary()?;
            Expr::Ternary(Box::new(cond), Box::new(then), Box::new(otherwise))
        } else {
            cond
        };
        self.depth -= 1;
        Ok(expr)
    }

    /// Precedence climbing over the binary operator table, lowest first.
    fn binary_level(&mut self, level: usize) -> Result<Expr, ExprError> {
        const LEVELS: [&[(&str, BinaryOp)]; 6] = [
            &[("||", BinaryOp::Or)],
            &[("&&", BinaryOp::And)],
            &[("==", BinaryOp::Eq), ("!=", BinaryOp::Ne)],
            &[
                ("<=", BinaryOp::Le),
                (">=", BinaryOp::Ge),
                ("<", BinaryOp::Lt),
                (">", BinaryOp::Gt),
            ],
            &[("+", BinaryOp::Add), ("-", BinaryOp::Sub)],
            &[("*", BinaryOp::Mul), ("/", BinaryOp::Div), ("%", BinaryOp::Rem)],
        ];

        if level == LEVELS.len() {
            return self.unary();
        }
        let mut left = self.binary_level(level + 1)?;
        loop {
            let Some(sym) = self.peek_sym() else { break };
            let Some((_, op)) = LEVELS[level].iter().find(|(s, _)| *s == sym) else {
                break;
            };
            self.pos += 1;
            let right = self.binary_level(level + 1)?;
            left = Expr::Binary(*op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, ExprError> {
        if self.eat("!") {
            self.descend()?;
            let inner = self.unary()?;
            self.depth -= 1;
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(inner)));
        }
        if self.eat("-") {
            self.descend()?;
            let inner = self.unary()?;
            self.depth -= 1;
            return Ok(Expr::Unary(UnaryOp::Neg, Box::new(inner)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, ExprError> {
        let pos = self.offset();
        let Some((_, token)) = self.tokens.get(self.pos).cloned() else {
            return Err(ExprError::Syntax {
                pos,
                message: "unexpected end of expression".into(),
            });
        };
        self.pos += 1;

        match token {
            Token::Number(n) => Ok(Expr::Literal(number(n))),
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::Ident(ident) => match ident.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                _ => self.path(ident),
            },
            Token::Sym("(") => {
                let inner = self.ternary()?;
                self.expect(")")?;
                Ok(inner)
            }
            other => Err(ExprError::Syntax {
                pos,
                message: format!("unexpected token {other}"),
            }),
        }
    }

    fn path(&mut self, first: String) -> Result<Expr, ExprError> {
        let mut segments = vec![Segment::Key(first)];
        loop {
            if self.eat(".") {
                let pos = self.offset();
                match self.tokens.get(self.pos).cloned() {
                    Some((_, Token::Ident(key))) => segments.push(Segment::Key(key)),
                    Some((_, Token::Number(n))) if n.fract() == 0.0 && n >= 0.0 => {
                        segments.push(Segment::Index(index(n)));
                    }
                    _ => {
                        return Err(ExprError::Syntax {
                            pos,
                            message: "expected identifier after '.'".into(),
                        })
                    }
                }
                self.pos += 1;
            } else if self.eat("[") {
                let pos = self.offset();
                match self.tokens.get(self.pos).cloned() {
                    Some((_, Token::Str(key))) => segments.push(Segment::Key(key)),
                    Some((_, Token::Number(n))) if n.fract() == 0.0 && n >= 0.0 => {
                        segments.push(Segment::Index(index(n)));
                    }
                    _ => {
                        return Err(ExprError::Syntax {
                            pos,
                            message: "expected string key or index inside '[]'".into(),
                        })
                    }
                }
                self.pos += 1;
                self.expect("]")?;
            } else {
                break;
            }
        }
        Ok(Expr::Path(segments))
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn index(n: f64) -> usize {
    n as usize
}
