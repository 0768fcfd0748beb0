//! A small, sandboxed expression language for filtering and sorting
//! documents.
//!
//! Collections in the config select and order documents with expressions
//! such as:
//!
//! ```toml
//! [[collections]]
//! name = "posts"
//! filter = "draft != true and 'post' in tags and date >= days_ago(365)"
//! sort = "date desc, title"
//! ```
//!
//! The language has comparisons, `and`/`or`/`not`, membership (`in`,
//! `not in`), list literals and a fixed set of functions: `date("…")`,
//! `now()`, `days_ago(n)`, `len(x)` and `lower(x)`. There is no assignment,
//! no loops and no access to anything but the fields of the document being
//! evaluated. Evaluation never fails: a missing field is `null`, and
//! comparisons between unrelated types are false.

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExprError {
    #[error("syntax error at offset {pos} in `{source_text}`: {message}")]
    Syntax {
        source_text: String,
        pos: usize,
        message: String,
    },
    #[error("unknown function `{0}`")]
    UnknownFunction(String),
    #[error("invalid date `{0}` (expected YYYY-MM-DD or RFC 3339)")]
    InvalidDate(String),
    #[error("invalid sort key `{0}`")]
    InvalidSort(String),
}

/// Parse `YYYY-MM-DD`, `YYYY-MM-DD HH:MM:SS` or an RFC 3339 timestamp.
/// Timestamps with an offset are normalised to UTC.
pub fn parse_date(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return d.and_hms_opt(0, 0, 0);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_utc());
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S"))
        .ok()
}

/// Anything expressions can read fields from.
pub trait Scope {
    fn lookup(&self, path: &[&str]) -> Option<Value>;
}

impl Scope for crate::document::Document {
    fn lookup(&self, path: &[&str]) -> Option<Value> {
        crate::document::Document::lookup(self, path)
    }
}

impl Scope for serde_json::Map<String, Value> {
    fn lookup(&self, path: &[&str]) -> Option<Value> {
        let (head, rest) = path.split_first()?;
        let root = self.get(*head)?.clone();
        rest.iter()
            .try_fold(root, |value, key| value.get(key).cloned())
    }
}

// =============================================================================
// Values
// =============================================================================

/// A runtime value.
#[derive(Debug, Clone, PartialEq)]
pub enum Val {
    Null,
    Bool(bool),
    Num(f64),
    Str(String),
    Date(NaiveDateTime),
    List(Vec<Val>),
    Map(serde_json::Map<String, Value>),
}

impl Val {
    pub fn truthy(&self) -> bool {
        match self {
            Val::Null => false,
            Val::Bool(b) => *b,
            Val::Num(n) => *n != 0.0,
            Val::Str(s) => !s.is_empty(),
            Val::Date(_) => true,
            Val::List(items) => !items.is_empty(),
            Val::Map(map) => !map.is_empty(),
        }
    }

    fn as_date(&self) -> Option<NaiveDateTime> {
        match self {
            Val::Date(d) => Some(*d),
            Val::Str(s) => parse_date(s),
            _ => None,
        }
    }

    fn type_rank(&self) -> u8 {
        match self {
            Val::Bool(_) => 0,
            Val::Num(_) => 1,
            Val::Date(_) => 2,
            Val::Str(_) => 3,
            Val::List(_) => 4,
            Val::Map(_) => 5,
            Val::Null => 6,
        }
    }
}

impl From<Value> for Val {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Val::Null,
            Value::Bool(b) => Val::Bool(b),
            Value::Number(n) => n.as_f64().map(Val::Num).unwrap_or(Val::Null),
            Value::String(s) => Val::Str(s),
            Value::Array(items) => Val::List(items.into_iter().map(Val::from).collect()),
            Value::Object(map) => Val::Map(map),
        }
    }
}

impl fmt::Display for Val {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Val::Null => f.write_str("null"),
            Val::Bool(b) => write!(f, "{b}"),
            Val::Num(n) => write!(f, "{n}"),
            Val::Str(s) => write!(f, "{s:?}"),
            Val::Date(d) => write!(f, "{}", d.format("%Y-%m-%dT%H:%M:%S")),
            Val::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Val::Map(map) => write!(f, "{}", Value::Object(map.clone())),
        }
    }
}

fn values_equal(a: &Val, b: &Val) -> bool {
    match (a, b) {
        (Val::Date(_), _) | (_, Val::Date(_)) => match (a.as_date(), b.as_date()) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        },
        (Val::List(x), Val::List(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| values_equal(a, b))
        }
        _ => a == b,
    }
}

/// Ordering for `<`/`>` comparisons. `None` when the operands are not
/// comparable.
fn compare_values(a: &Val, b: &Val) -> Option<Ordering> {
    match (a, b) {
        (Val::Num(x), Val::Num(y)) => x.partial_cmp(y),
        (Val::Bool(x), Val::Bool(y)) => Some(x.cmp(y)),
        (Val::Date(_), _) | (_, Val::Date(_)) => Some(a.as_date()?.cmp(&b.as_date()?)),
        (Val::Str(x), Val::Str(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Total order used for sorting: nulls last, then by type, then by value.
/// Two strings that both parse as dates compare as dates.
fn sort_order(a: &Val, b: &Val) -> Ordering {
    if let (Val::Str(x), Val::Str(y)) = (a, b) {
        if let (Some(dx), Some(dy)) = (parse_date(x), parse_date(y)) {
            return dx.cmp(&dy);
        }
    }
    compare_values(a, b)
        .unwrap_or_else(|| a.type_rank().cmp(&b.type_rank()))
}

// =============================================================================
// Syntax tree
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
}

#[derive(Debug, Clone, PartialEq)]
enum Func {
    Now,
    DaysAgo(f64),
    Len(Box<Node>),
    Lower(Box<Node>),
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Literal(Val),
    Field(Vec<String>),
    List(Vec<Node>),
    Call(Func),
    Not(Box<Node>),
    And(Box<Node>, Box<Node>),
    Or(Box<Node>, Box<Node>),
    Cmp(CmpOp, Box<Node>, Box<Node>),
}

impl Node {
    fn eval(&self, scope: &dyn Scope) -> Val {
        match self {
            Node::Literal(v) => v.clone(),
            Node::Field(path) => {
                let parts: Vec<&str> = path.iter().map(String::as_str).collect();
                scope.lookup(&parts).map(Val::from).unwrap_or(Val::Null)
            }
            Node::List(items) => Val::List(items.iter().map(|n| n.eval(scope)).collect()),
            Node::Call(func) => match func {
                Func::Now => Val::Date(Utc::now().naive_utc()),
                Func::DaysAgo(n) => days_ago(*n).map_or(Val::Null, Val::Date),
                Func::Len(arg) => match arg.eval(scope) {
                    Val::Str(s) => Val::Num(s.chars().count() as f64),
                    Val::List(items) => Val::Num(items.len() as f64),
                    Val::Map(map) => Val::Num(map.len() as f64),
                    Val::Null => Val::Num(0.0),
                    _ => Val::Null,
                },
                Func::Lower(arg) => match arg.eval(scope) {
                    Val::Str(s) => Val::Str(s.to_lowercase()),
                    Val::List(items) => Val::List(
                        items
                            .into_iter()
                            .map(|v| match v {
                                Val::Str(s) => Val::Str(s.to_lowercase()),
                                other => other,
                            })
                            .collect(),
                    ),
                    other => other,
                },
            },
            Node::Not(inner) => Val::Bool(!inner.eval(scope).truthy()),
            Node::And(a, b) => Val::Bool(a.eval(scope).truthy() && b.eval(scope).truthy()),
            Node::Or(a, b) => Val::Bool(a.eval(scope).truthy() || b.eval(scope).truthy()),
            Node::Cmp(op, a, b) => {
                let (a, b) = (a.eval(scope), b.eval(scope));
                let result = match op {
                    CmpOp::Eq => values_equal(&a, &b),
                    CmpOp::Ne => !values_equal(&a, &b),
                    CmpOp::Lt => compare_values(&a, &b) == Some(Ordering::Less),
                    CmpOp::Le => matches!(
                        compare_values(&a, &b),
                        Some(Ordering::Less | Ordering::Equal)
                    ),
                    CmpOp::Gt => compare_values(&a, &b) == Some(Ordering::Greater),
                    CmpOp::Ge => matches!(
                        compare_values(&a, &b),
                        Some(Ordering::Greater | Ordering::Equal)
                    ),
                    CmpOp::In => contains(&b, &a),
                    CmpOp::NotIn => !contains(&b, &a),
                };
                Val::Bool(result)
            }
        }
    }
}

/// `None` when the offset does not fit chrono's range.
fn days_ago(days: f64) -> Option<NaiveDateTime> {
    let secs = days * 86_400.0;
    if !secs.is_finite() || secs.abs() >= i64::MAX as f64 {
        return None;
    }
    let offset = Duration::try_seconds(secs as i64)?;
    Utc::now().naive_utc().checked_sub_signed(offset)
}

fn contains(haystack: &Val, needle: &Val) -> bool {
    match (haystack, needle) {
        (Val::List(items), _) => items.iter().any(|item| values_equal(item, needle)),
        (Val::Str(s), Val::Str(n)) => s.contains(n.as_str()),
        (Val::Map(map), Val::Str(key)) => map.contains_key(key),
        _ => false,
    }
}

// =============================================================================
// Tokenizer
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Str(String),
    Num(f64),
    Ident(String),
    Op(&'static str),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
}

fn tokenize(src: &str) -> Result<Vec<(usize, Tok)>, ExprError> {
    let err = |pos: usize, message: &str| ExprError::Syntax {
        source_text: src.to_string(),
        pos,
        message: message.to_string(),
    };
    let chars: Vec<(usize, char)> = src.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let (pos, c) = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' | ')' | '[' | ']' | ',' | '.' => {
                let tok = match c {
                    '(' => Tok::LParen,
                    ')' => Tok::RParen,
                    '[' => Tok::LBracket,
                    ']' => Tok::RBracket,
                    ',' => Tok::Comma,
                    _ => Tok::Dot,
                };
                tokens.push((pos, tok));
                i += 1;
            }
            '=' | '!' | '<' | '>' => {
                let next = chars.get(i + 1).map(|(_, c)| *c);
                let op = match (c, next) {
                    ('=', Some('=')) => "==",
                    ('!', Some('=')) => "!=",
                    ('<', Some('=')) => "<=",
                    ('>', Some('=')) => ">=",
                    ('<', _) => "<",
                    ('>', _) => ">",
                    _ => return Err(err(pos, "expected `==` or `!=`")),
                };
                tokens.push((pos, Tok::Op(op)));
                i += op.len();
            }
            '\'' | '"' => {
                let quote = c;
                let mut text = String::new();
                i += 1;
                loop {
                    let Some(&(_, ch)) = chars.get(i) else {
                        return Err(err(pos, "unterminated string"));
                    };
                    i += 1;
                    match ch {
                        '\\' => {
                            let Some(&(_, escaped)) = chars.get(i) else {
                                return Err(err(pos, "unterminated string"));
                            };
                            text.push(escaped);
                            i += 1;
                        }
                        ch if ch == quote => break,
                        ch => text.push(ch),
                    }
                }
                tokens.push((pos, Tok::Str(text)));
            }
            c if c.is_ascii_digit()
                || (c == '-' && chars.get(i + 1).is_some_and(|(_, n)| n.is_ascii_digit())) =>
            {
                let start = i;
                i += 1;
                while chars
                    .get(i)
                    .is_some_and(|(_, ch)| ch.is_ascii_digit() || *ch == '.')
                {
                    i += 1;
                }
                let text: String = chars[start..i].iter().map(|(_, ch)| ch).collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| err(pos, "invalid number"))?;
                tokens.push((pos, Tok::Num(n)));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while chars
                    .get(i)
                    .is_some_and(|(_, ch)| ch.is_alphanumeric() || *ch == '_')
                {
                    i += 1;
                }
                let text: String = chars[start..i].iter().map(|(_, ch)| ch).collect();
                tokens.push((pos, Tok::Ident(text)));
            }
            _ => return Err(err(pos, &format!("unexpected character `{c}`"))),
        }
    }
    Ok(tokens)
}

// =============================================================================
// Parser
// =============================================================================

struct Parser<'a> {
    src: &'a str,
    tokens: Vec<(usize, Tok)>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn error(&self, message: impl Into<String>) -> ExprError {
        let pos = self
            .tokens
            .get(self.pos)
            .map(|(p, _)| *p)
            .unwrap_or(self.src.len());
        ExprError::Syntax {
            source_text: self.src.to_string(),
            pos,
            message: message.into(),
        }
    }

    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn peek_at(&self, offset: usize) -> Option<&Tok> {
        self.tokens.get(self.pos + offset).map(|(_, t)| t)
    }

    fn bump(&mut self) -> Option<Tok> {
        let tok = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        self.pos += 1;
        tok
    }

    fn is_keyword(&self, word: &str) -> bool {
        matches!(self.peek(), Some(Tok::Ident(w)) if w == word)
    }

    fn expect(&mut self, tok: Tok, what: &str) -> Result<(), ExprError> {
        if self.peek() == Some(&tok) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(format!("expected {what}")))
        }
    }

    fn parse_or(&mut self) -> Result<Node, ExprError> {
        let mut left = self.parse_and()?;
        while self.is_keyword("or") {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Node::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Node, ExprError> {
        let mut left = self.parse_not()?;
        while self.is_keyword("and") {
            self.pos += 1;
            let right = self.parse_not()?;
            left = Node::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Node, ExprError> {
        if self.is_keyword("not") {
            self.pos += 1;
            return Ok(Node::Not(Box::new(self.parse_not()?)));
        }
        self.parse_cmp()
    }

    fn parse_cmp(&mut self) -> Result<Node, ExprError> {
        let left = self.parse_primary()?;
        let op = match self.peek() {
            Some(Tok::Op(op)) => {
                let op = match *op {
                    "==" => CmpOp::Eq,
                    "!=" => CmpOp::Ne,
                    "<" => CmpOp::Lt,
                    "<=" => CmpOp::Le,
                    ">" => CmpOp::Gt,
                    _ => CmpOp::Ge,
                };
                self.pos += 1;
                op
            }
            Some(Tok::Ident(w)) if w == "in" => {
                self.pos += 1;
                CmpOp::In
            }
            Some(Tok::Ident(w))
                if w == "not" && matches!(self.peek_at(1), Some(Tok::Ident(n)) if n == "in") =>
            {
                self.pos += 2;
                CmpOp::NotIn
            }
            _ => return Ok(left),
        };
        let right = self.parse_primary()?;
        Ok(Node::Cmp(op, Box::new(left), Box::new(right)))
    }

    fn parse_primary(&mut self) -> Result<Node, ExprError> {
        match self.bump() {
            Some(Tok::Str(s)) => Ok(Node::Literal(Val::Str(s))),
            Some(Tok::Num(n)) => Ok(Node::Literal(Val::Num(n))),
            Some(Tok::LParen) => {
                let inner = self.parse_or()?;
                self.expect(Tok::RParen, "`)`")?;
                Ok(inner)
            }
            Some(Tok::LBracket) => {
                let mut items = Vec::new();
                if self.peek() != Some(&Tok::RBracket) {
                    loop {
                        items.push(self.parse_or()?);
                        if self.peek() == Some(&Tok::Comma) {
                            self.pos += 1;
                        } else {
                            break;
                        }
                    }
                }
                self.expect(Tok::RBracket, "`]`")?;
                Ok(Node::List(items))
            }
            Some(Tok::Ident(word)) => match word.as_str() {
                "true" => Ok(Node::Literal(Val::Bool(true))),
                "false" => Ok(Node::Literal(Val::Bool(false))),
                "null" => Ok(Node::Literal(Val::Null)),
                "and" | "or" | "not" | "in" => {
                    self.pos -= 1;
                    Err(self.error(format!("unexpected keyword `{word}`")))
                }
                _ if self.peek() == Some(&Tok::LParen) => self.parse_call(word),
                _ => self.parse_field(word),
            },
            Some(_) => {
                self.pos -= 1;
                Err(self.error("expected a value"))
            }
            None => Err(self.error("unexpected end of expression")),
        }
    }

    fn parse_field(&mut self, head: String) -> Result<Node, ExprError> {
        let mut path = vec![head];
        while self.peek() == Some(&Tok::Dot) {
            self.pos += 1;
            match self.bump() {
                Some(Tok::Ident(part)) => path.push(part),
                _ => {
                    self.pos -= 1;
                    return Err(self.error("expected a field name after `.`"));
                }
            }
        }
        Ok(Node::Field(path))
    }

    fn parse_call(&mut self, name: String) -> Result<Node, ExprError> {
        self.expect(Tok::LParen, "`(`")?;
        let node = match name.as_str() {
            "now" => Node::Call(Func::Now),
            "date" => match self.bump() {
                Some(Tok::Str(s)) => {
                    let date = parse_date(&s).ok_or(ExprError::InvalidDate(s))?;
                    Node::Literal(Val::Date(date))
                }
                _ => {
                    self.pos -= 1;
                    return Err(self.error("date() takes a string literal"));
                }
            },
            "days_ago" => match self.bump() {
                Some(Tok::Num(n)) if n.is_finite() => Node::Call(Func::DaysAgo(n)),
                _ => {
                    self.pos -= 1;
                    return Err(self.error("days_ago() takes a number"));
                }
            },
            "len" => Node::Call(Func::Len(Box::new(self.parse_or()?))),
            "lower" => Node::Call(Func::Lower(Box::new(self.parse_or()?))),
            _ => return Err(ExprError::UnknownFunction(name)),
        };
        self.expect(Tok::RParen, "`)`")?;
        Ok(node)
    }
}

/// A parsed expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    source: String,
    root: Node,
}

impl Expr {
    pub fn parse(src: &str) -> Result<Self, ExprError> {
        let mut parser = Parser {
            src,
            tokens: tokenize(src)?,
            pos: 0,
        };
        let root = parser.parse_or()?;
        if parser.pos < parser.tokens.len() {
            return Err(parser.error("unexpected trailing input"));
        }
        Ok(Self {
            source: src.to_string(),
            root,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn eval(&self, scope: &dyn Scope) -> Val {
        self.root.eval(scope)
    }

    /// Evaluate and apply truthiness.
    pub fn matches(&self, scope: &dyn Scope) -> bool {
        self.eval(scope).truthy()
    }
}

// =============================================================================
// Sorting
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub field: Vec<String>,
    pub descending: bool,
}

/// Comma-separated sort keys, e.g. `"date desc, title"`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SortSpec {
    keys: Vec<SortKey>,
}

impl SortSpec {
    pub fn parse(src: &str) -> Result<Self, ExprError> {
        let mut keys = Vec::new();
        for part in src.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let mut words = part.split_whitespace();
            let field = words.next().unwrap_or_default();
            let descending = match words.next().map(str::to_ascii_lowercase).as_deref() {
                None | Some("asc") => false,
                Some("desc") => true,
                Some(_) => return Err(ExprError::InvalidSort(part.to_string())),
            };
            let path: Vec<String> = field.split('.').map(str::to_string).collect();
            let valid = words.next().is_none()
                && path.iter().all(|p| {
                    !p.is_empty() && p.chars().all(|c| c.is_alphanumeric() || c == '_')
                });
            if !valid {
                return Err(ExprError::InvalidSort(part.to_string()));
            }
            keys.push(SortKey {
                field: path,
                descending,
            });
        }
        Ok(Self { keys })
    }

    pub fn keys(&self) -> &[SortKey] {
        &self.keys
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Compare two scopes. Nulls sort last in either direction.
    pub fn compare(&self, a: &dyn Scope, b: &dyn Scope) -> Ordering {
        for key in &self.keys {
            let parts: Vec<&str> = key.field.iter().map(String::as_str).collect();
            let va = a.lookup(&parts).map(Val::from).unwrap_or(Val::Null);
            let vb = b.lookup(&parts).map(Val::from).unwrap_or(Val::Null);
            let ord = match (&va, &vb) {
                (Val::Null, Val::Null) => Ordering::Equal,
                (Val::Null, _) => Ordering::Greater,
                (_, Val::Null) => Ordering::Less,
                _ if key.descending => sort_order(&vb, &va),
                _ => sort_order(&va, &vb),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }

    /// Stable sort of borrowed scopes.
    pub fn sort<S: Scope>(&self, items: &mut [&S]) {
        items.sort_by(|a, b| self.compare(*a, *b));
    }
}
