//! Filter strings: `status = "done" && (title ~ "report" || assignees ?= @request.auth.id)`.
//!
//! Parsed once into an [`Expr`] and evaluated against the JSON view of a
//! record. The server uses it for `filter=` on list requests; client stores
//! use the same evaluator to decide whether a pushed record belongs in a
//! filtered list.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;
use uuid::Uuid;

// ── AST ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Like,
    NotLike,
}

impl Op {
    fn is_negated(self) -> bool {
        matches!(self, Op::Neq | Op::NotLike)
    }

    /// The positive form of a negated operator.
    fn positive(self) -> Op {
        match self {
            Op::Neq => Op::Eq,
            Op::NotLike => Op::Like,
            other => other,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Field(String),
    Literal(Value),
    AuthId,
    Now,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare {
        left: Operand,
        op: Op,
        /// `?`-prefixed: true when some element pair satisfies `op`. Plain
        /// negated operators instead require that no pair satisfies the
        /// positive form.
        any: bool,
        right: Operand,
    },
}

/// Request-dependent values the placeholders resolve to.
#[derive(Debug, Clone, Copy)]
pub struct EvalContext {
    pub auth_id: Option<Uuid>,
    pub now: DateTime<Utc>,
}

impl EvalContext {
    pub fn new(auth_id: Option<Uuid>) -> Self {
        EvalContext { auth_id, now: Utc::now() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterError {
    pub position: usize,
    pub message: String,
}

impl fmt::Display for FilterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid filter at {}: {}", self.position, self.message)
    }
}

impl std::error::Error for FilterError {}

// ── Lexer ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    LParen,
    RParen,
    And,
    Or,
    Cmp { op: Op, any: bool },
}

const OPERATORS: &[(&str, Op, bool)] = &[
    ("?!=", Op::Neq, true),
    ("?!~", Op::NotLike, true),
    ("?>=", Op::Gte, true),
    ("?<=", Op::Lte, true),
    ("?=", Op::Eq, true),
    ("?~", Op::Like, true),
    ("?>", Op::Gt, true),
    ("?<", Op::Lt, true),
    ("!=", Op::Neq, false),
    ("!~", Op::NotLike, false),
    (">=", Op::Gte, false),
    ("<=", Op::Lte, false),
    ("=", Op::Eq, false),
    ("~", Op::Like, false),
    (">", Op::Gt, false),
    ("<", Op::Lt, false),
];

fn tokenize(input: &str) -> Result<Vec<(usize, Token)>, FilterError> {
    let chars: Vec<(usize, char)> = input.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (pos, c) = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        let rest = &input[pos..];

        if c == '(' {
            tokens.push((pos, Token::LParen));
            i += 1;
        } else if c == ')' {
            tokens.push((pos, Token::RParen));
            i += 1;
        } else if rest.starts_with("&&") {
            tokens.push((pos, Token::And));
            i += 2;
        } else if rest.starts_with("||") {
            tokens.push((pos, Token::Or));
            i += 2;
        } else if c == '"' || c == '\'' {
            let quote = c;
            let mut value = String::new();
            i += 1;
            loop {
                let Some(&(_, ch)) = chars.get(i) else {
                    return Err(FilterError { position: pos, message: "unterminated string".into() });
                };
                i += 1;
                if ch == '\\' {
                    if let Some(&(_, escaped)) = chars.get(i) {
                        value.push(escaped);
                        i += 1;
                    }
                } else if ch == quote {
                    break;
                } else {
                    value.push(ch);
                }
            }
            tokens.push((pos, Token::Str(value)));
        } else if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(|(_, n)| n.is_ascii_digit())) {
            let start = i;
            i += 1;
            while chars.get(i).is_some_and(|(_, ch)| ch.is_ascii_digit() || *ch == '.') {
                i += 1;
            }
            let end = chars.get(i).map_or(input.len(), |(p, _)| *p);
            let text = &input[chars[start].0..end];
            let num = text
                .parse::<f64>()
                .map_err(|_| FilterError { position: pos, message: format!("bad number `{text}`") })?;
            tokens.push((pos, Token::Num(num)));
        } else if c.is_alphabetic() || c == '_' || c == '@' {
            let start = i;
            while chars
                .get(i)
                .is_some_and(|(_, ch)| ch.is_alphanumeric() || matches!(ch, '_' | '.' | '@'))
            {
                i += 1;
            }
            let end = chars.get(i).map_or(input.len(), |(p, _)| *p);
            tokens.push((pos, Token::Ident(input[chars[start].0..end].to_string())));
        } else if let Some((text, op, any)) = OPERATORS.iter().find(|(text, _, _)| rest.starts_with(text)) {
            tokens.push((pos, Token::Cmp { op: *op, any: *any }));
            i += text.chars().count();
        } else {
            return Err(FilterError { position: pos, message: format!("unexpected `{c}`") });
        }
    }
    Ok(tokens)
}

// ── Parser ─────────────────────────────────────────────────────

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn here(&self) -> usize {
        self.tokens.get(self.pos).map_or(self.end, |(p, _)| *p)
    }

    fn error(&self, message: impl Into<String>) -> FilterError {
        FilterError { position: self.here(), message: message.into() }
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        self.pos += 1;
        token
    }

    fn or_expr(&mut self) -> Result<Expr, FilterError> {
        let mut left = self.and_expr()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.and_expr()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr, FilterError> {
        let mut left = self.primary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.primary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn primary(&mut self) -> Result<Expr, FilterError> {
        if self.peek() == Some(&Token::LParen) {
            self.pos += 1;
            let inner = self.or_expr()?;
            if self.next() != Some(Token::RParen) {
                return Err(self.error("expected `)`"));
            }
            return Ok(inner);
        }
        let left = self.operand()?;
        let (op, any) = match self.next() {
            Some(Token::Cmp { op, any }) => (op, any),
            _ => return Err(self.error("expected a comparison operator")),
        };
        let right = self.operand()?;
        Ok(Expr::Compare { left, op, any, right })
    }

    fn operand(&mut self) -> Result<Operand, FilterError> {
        match self.next() {
            Some(Token::Str(s)) => Ok(Operand::Literal(Value::String(s))),
            Some(Token::Num(n)) => Ok(Operand::Literal(
                serde_json::Number::from_f64(n).map_or(Value::Null, Value::Number),
            )),
            Some(Token::Ident(name)) => Ok(match name.as_str() {
                "true" => Operand::Literal(Value::Bool(true)),
                "false" => Operand::Literal(Value::Bool(false)),
                "null" => Operand::Literal(Value::Null),
                "@request.auth.id" => Operand::AuthId,
                "@now" => Operand::Now,
                other if other.starts_with('@') => {
                    self.pos -= 1;
                    return Err(self.error(format!("unknown placeholder `{other}`")));
                }
                _ => Operand::Field(name),
            }),
            _ => {
                self.pos = self.pos.saturating_sub(1);
                Err(self.error("expected a field or value"))
            }
        }
    }
}

/// Parse a filter string. Blank input means "no filter".
pub fn parse(input: &str) -> Result<Option<Expr>, FilterError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Ok(None);
    }
    let mut parser = Parser { tokens, pos: 0, end: input.len() };
    let expr = parser.or_expr()?;
    if parser.pos < parser.tokens.len() {
        return Err(parser.error("unexpected trailing input"));
    }
    Ok(Some(expr))
}

// ── Evaluation ─────────────────────────────────────────────────

impl Expr {
    pub fn matches(&self, record: &Value, ctx: &EvalContext) -> bool {
        match self {
            Expr::And(a, b) => a.matches(record, ctx) && b.matches(record, ctx),
            Expr::Or(a, b) => a.matches(record, ctx) || b.matches(record, ctx),
            Expr::Compare { left, op, any, right } => {
                let lhs = candidates(resolve(left, record, ctx));
                let rhs = candidates(resolve(right, record, ctx));
                if *any {
                    return lhs.iter().any(|l| rhs.iter().any(|r| compare(l, *op, r)));
                }
                let hit = lhs
                    .iter()
                    .any(|l| rhs.iter().any(|r| compare(l, op.positive(), r)));
                if op.is_negated() {
                    !hit
                } else {
                    hit
                }
            }
        }
    }
}

fn resolve(operand: &Operand, record: &Value, ctx: &EvalContext) -> Value {
    match operand {
        Operand::Literal(v) => v.clone(),
        Operand::AuthId => ctx.auth_id.map_or(Value::Null, |id| Value::String(id.to_string())),
        Operand::Now => Value::String(ctx.now.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        Operand::Field(path) => {
            let segments: Vec<&str> = path.split('.').collect();
            walk(record, &segments)
        }
    }
}

/// Follow a dotted path. Arrays along the way fan out, so
/// `expand.assignees.name` yields every assignee's name.
fn walk(value: &Value, segments: &[&str]) -> Value {
    let Some((first, rest)) = segments.split_first() else {
        return value.clone();
    };
    match value {
        Value::Object(map) => map.get(*first).map_or(Value::Null, |next| walk(next, rest)),
        Value::Array(items) => {
            let mut out = Vec::new();
            for item in items {
                match walk(item, segments) {
                    Value::Array(inner) => out.extend(inner),
                    Value::Null => {}
                    other => out.push(other),
                }
            }
            Value::Array(out)
        }
        _ => Value::Null,
    }
}

/// Arrays compare element-wise; an empty array behaves like an empty value.
fn candidates(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) if items.is_empty() => vec![Value::Null],
        Value::Array(items) => items,
        other => vec![other],
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

fn as_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn compare(left: &Value, op: Op, right: &Value) -> bool {
    match op {
        Op::Eq => {
            if is_blank(left) || is_blank(right) {
                return is_blank(left) && is_blank(right);
            }
            compare_values(left, right) == Ordering::Equal
        }
        Op::Like => like(&as_text(left), &as_text(right)),
        Op::Gt => !is_blank(left) && compare_values(left, right) == Ordering::Greater,
        Op::Gte => compare_values(left, right) != Ordering::Less,
        Op::Lt => compare_values(left, right) == Ordering::Less,
        Op::Lte => compare_values(left, right) != Ordering::Greater,
        Op::Neq => !compare(left, Op::Eq, right),
        Op::NotLike => !compare(left, Op::Like, right),
    }
}

/// Case-insensitive contains, or a LIKE match when the pattern has `%`.
fn like(value: &str, pattern: &str) -> bool {
    let value = value.to_lowercase();
    let pattern = pattern.to_lowercase();
    if !pattern.contains('%') {
        return value.contains(&pattern);
    }

    let parts: Vec<&str> = pattern.split('%').collect();
    let mut rest = value.as_str();
    let last = parts.len() - 1;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            match rest.strip_prefix(part) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == last {
            return rest.ends_with(part);
        } else {
            match rest.find(part) {
                Some(idx) => rest = &rest[idx + part.len()..],
                None => return false,
            }
        }
    }
    true
}

/// Total order over JSON scalars used by comparisons and sorting.
/// Blank sorts first; numbers compare numerically; strings that both parse as
/// timestamps compare as instants.
pub fn compare_values(left: &Value, right: &Value) -> Ordering {
    match (is_blank(left), is_blank(right)) {
        (true, true) => return Ordering::Equal,
        (true, false) => return Ordering::Less,
        (false, true) => return Ordering::Greater,
        _ => {}
    }
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a
            .as_f64()
            .partial_cmp(&b.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
        (Value::String(a), Value::String(b)) => {
            match (DateTime::parse_from_rfc3339(a), DateTime::parse_from_rfc3339(b)) {
                (Ok(x), Ok(y)) => x.cmp(&y),
                _ => a.cmp(b),
            }
        }
        (Value::Number(a), Value::String(b)) => match b.parse::<f64>() {
            Ok(b) => a.as_f64().partial_cmp(&Some(b)).unwrap_or(Ordering::Equal),
            Err(_) => as_text(left).cmp(b),
        },
        (Value::String(a), Value::Number(b)) => match a.parse::<f64>() {
            Ok(a) => Some(a).partial_cmp(&b.as_f64()).unwrap_or(Ordering::Equal),
            Err(_) => a.cmp(&as_text(right)),
        },
        _ => as_text(left).cmp(&as_text(right)),
    }
}

// ── Builder ────────────────────────────────────────────────────

/// Quote a value as a filter string literal.
pub fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Composes filter strings clause by clause with correct quoting.
///
/// ```
/// use taskdesk::filter::Filter;
/// let f = Filter::all().eq("status", "done").contains("title", "q3 \"plan\"");
/// assert_eq!(f.build(), r#"status = "done" && title ~ "q3 \"plan\"""#);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    clauses: Vec<String>,
    joiner: &'static str,
}

impl Filter {
    /// Clauses joined with `&&`.
    pub fn all() -> Self {
        Filter { clauses: Vec::new(), joiner: " && " }
    }

    /// Clauses joined with `||`.
    pub fn any() -> Self {
        Filter { clauses: Vec::new(), joiner: " || " }
    }

    fn clause(mut self, field: &str, op: &str, value: &str) -> Self {
        self.clauses.push(format!("{field} {op} {}", quote(value)));
        self
    }

    pub fn eq(self, field: &str, value: &str) -> Self {
        self.clause(field, "=", value)
    }

    pub fn neq(self, field: &str, value: &str) -> Self {
        self.clause(field, "!=", value)
    }

    pub fn contains(self, field: &str, value: &str) -> Self {
        self.clause(field, "~", value)
    }

    /// Array field holds `value`.
    pub fn any_eq(self, field: &str, value: &str) -> Self {
        self.clause(field, "?=", value)
    }

    /// Add a nested filter, parenthesized when it has more than one clause.
    pub fn group(mut self, inner: Filter) -> Self {
        match inner.clauses.len() {
            0 => {}
            1 => self.clauses.extend(inner.clauses),
            _ => self.clauses.push(format!("({})", inner.build())),
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    pub fn build(&self) -> String {
        self.clauses.join(self.joiner)
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.build())
    }
}

// ── Tests ──────────────────────────────────────────────────────
