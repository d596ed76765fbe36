//! Expression Evaluator
//!
//! A small sandboxed language for deriving plot coordinates from event
//! pages. Expressions can only read page columns and call a fixed table of
//! elementwise math functions; nothing else is reachable.
//!
//! # Grammar
//!
//! ```text
//! expr    := term (('+' | '-') term)*
//! term    := unary (('*' | '/' | '%') unary)*
//! unary   := ('-' | '+') unary | power
//! power   := primary ('**' unary)?
//! primary := number | name | name '(' args ')' | '(' expr ')'
//! ```
//!
//! `**` binds tighter than a leading minus and is right associative, so
//! `-2**2` is `-4` and `2**3**2` is `512`.
//!
//! # Names
//!
//! A name resolves against the [`Namespace`] first (page data columns, then
//! the page's own fields for [`PageNamespace`]), then the constants `pi`,
//! `e`, `inf` and `nan`. Function names are only looked up in call position.
//! Of the page fields only `time` and `seq_num` are numeric; naming `uid`,
//! `descriptor`, `data`, `timestamps` or `filled` is a type error.
//!
//! # Limits
//!
//! Source text is capped at [`MAX_TOKENS`] tokens and nesting (parentheses,
//! call arguments, prefix signs, exponents) at [`MAX_DEPTH`] levels, so the
//! tree stays shallow enough to evaluate recursively.

use std::collections::BTreeMap;
use std::iter::Peekable;
use std::str::CharIndices;

use serde_json::Value as Json;
use thiserror::Error;

use crate::document::EventPage;

/// Longest accepted expression, in tokens
pub const MAX_TOKENS: usize = 1024;

/// Deepest accepted nesting
pub const MAX_DEPTH: usize = 64;

/// Expression failures
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ExpressionError {
    /// Source text is not a valid expression
    #[error("parse error at offset {position}: {message}")]
    Parse {
        /// Byte offset into the source
        position: usize,
        /// What was expected
        message: String,
    },

    /// Name not found in the namespace, constants or function table
    #[error("unknown name '{name}'")]
    UnknownName {
        /// The name
        name: String,
    },

    /// A column holds something other than numbers or booleans
    #[error("column '{name}' is not numeric: {message}")]
    Type {
        /// Column name
        name: String,
        /// Offending value
        message: String,
    },

    /// Wrong number of arguments to a function
    #[error("{function}() takes {expected} argument(s), got {found}")]
    Arity {
        /// Function name
        function: String,
        /// Required count
        expected: usize,
        /// Supplied count
        found: usize,
    },

    /// Two columns of different lengths were combined
    #[error("cannot combine columns of length {left} and {right}")]
    Length {
        /// Left operand length
        left: usize,
        /// Right operand length
        right: usize,
    },
}

// =============================================================================
// Values and namespaces
// =============================================================================

/// Result of evaluating an expression
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// Broadcasts against any column
    Scalar(f64),
    /// One value per page row
    Column(Vec<f64>),
}

impl Value {
    /// Expand to a column of `height` rows; columns are returned unchanged
    #[must_use]
    pub fn into_column(self, height: usize) -> Vec<f64> {
        match self {
            Self::Scalar(v) => vec![v; height],
            Self::Column(column) => column,
        }
    }

    fn map(self, f: impl Fn(f64) -> f64) -> Self {
        match self {
            Self::Scalar(v) => Self::Scalar(f(v)),
            Self::Column(column) => Self::Column(column.into_iter().map(f).collect()),
        }
    }

    fn zip(self, other: Self, f: impl Fn(f64, f64) -> f64) -> Result<Self, ExpressionError> {
        Ok(match (self, other) {
            (Self::Scalar(a), Self::Scalar(b)) => Self::Scalar(f(a, b)),
            (Self::Scalar(a), Self::Column(b)) => {
                Self::Column(b.into_iter().map(|b| f(a, b)).collect())
            }
            (Self::Column(a), Self::Scalar(b)) => {
                Self::Column(a.into_iter().map(|a| f(a, b)).collect())
            }
            (Self::Column(a), Self::Column(b)) => {
                if a.len() != b.len() {
                    return Err(ExpressionError::Length {
                        left: a.len(),
                        right: b.len(),
                    });
                }
                Self::Column(a.into_iter().zip(b).map(|(a, b)| f(a, b)).collect())
            }
        })
    }
}

/// Name lookup for evaluation
pub trait Namespace {
    /// `None` when the name is not defined here
    fn lookup(&self, name: &str) -> Option<Result<Value, ExpressionError>>;
}

impl Namespace for BTreeMap<String, Value> {
    fn lookup(&self, name: &str) -> Option<Result<Value, ExpressionError>> {
        self.get(name).cloned().map(Ok)
    }
}

/// Page data columns, then the `time` and `seq_num` pseudo-fields
pub struct PageNamespace<'a> {
    page: &'a EventPage,
}

impl<'a> PageNamespace<'a> {
    /// Namespace over one page
    #[must_use]
    pub fn new(page: &'a EventPage) -> Self {
        Self { page }
    }
}

impl Namespace for PageNamespace<'_> {
    #[allow(clippy::cast_precision_loss)]
    fn lookup(&self, name: &str) -> Option<Result<Value, ExpressionError>> {
        if let Some(column) = self.page.data.get(name) {
            return Some(numeric_column(name, column).map(Value::Column));
        }
        let not_numeric = |message: &str| {
            Some(Err(ExpressionError::Type {
                name: name.to_string(),
                message: message.to_string(),
            }))
        };
        match name {
            "time" => Some(Ok(Value::Column(self.page.time.clone()))),
            "seq_num" => Some(Ok(Value::Column(
                self.page.seq_num.iter().map(|&s| s as f64).collect(),
            ))),
            "uid" | "descriptor" => not_numeric("page field holds identifiers"),
            "data" | "timestamps" | "filled" => not_numeric("page field is a per-column map"),
            _ => None,
        }
    }
}

fn numeric_column(name: &str, column: &[Json]) -> Result<Vec<f64>, ExpressionError> {
    column
        .iter()
        .map(|value| match value {
            Json::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
            Json::Number(n) => n.as_f64().ok_or_else(|| ExpressionError::Type {
                name: name.to_string(),
                message: n.to_string(),
            }),
            other => Err(ExpressionError::Type {
                name: name.to_string(),
                message: other.to_string(),
            }),
        })
        .collect()
}

fn constant(name: &str) -> Option<f64> {
    match name {
        "pi" => Some(std::f64::consts::PI),
        "e" => Some(std::f64::consts::E),
        "inf" => Some(f64::INFINITY),
        "nan" => Some(f64::NAN),
        _ => None,
    }
}

// =============================================================================
// Function table
// =============================================================================

#[derive(Clone, Copy)]
enum Function {
    Unary(fn(f64) -> f64),
    Binary(fn(f64, f64) -> f64),
}

impl Function {
    fn arity(self) -> usize {
        match self {
            Self::Unary(_) => 1,
            Self::Binary(_) => 2,
        }
    }
}

fn function(name: &str) -> Option<Function> {
    use Function::{Binary, Unary};
    let f = match name {
        "sin" => Unary(f64::sin),
        "cos" => Unary(f64::cos),
        "tan" => Unary(f64::tan),
        "arcsin" => Unary(f64::asin),
        "arccos" => Unary(f64::acos),
        "arctan" => Unary(f64::atan),
        "sinh" => Unary(f64::sinh),
        "cosh" => Unary(f64::cosh),
        "tanh" => Unary(f64::tanh),
        "exp" => Unary(f64::exp),
        "log" => Unary(f64::ln),
        "log10" => Unary(f64::log10),
        "log2" => Unary(f64::log2),
        "sqrt" => Unary(f64::sqrt),
        "abs" => Unary(f64::abs),
        "floor" => Unary(f64::floor),
        "ceil" => Unary(f64::ceil),
        "round" => Unary(f64::round_ties_even),
        "sign" => Unary(sign),
        "arctan2" => Binary(f64::atan2),
        "power" => Binary(f64::powf),
        "minimum" => Binary(minimum),
        "maximum" => Binary(maximum),
        _ => return None,
    };
    Some(f)
}

fn sign(v: f64) -> f64 {
    if v == 0.0 || v.is_nan() {
        v
    } else {
        v.signum()
    }
}

fn minimum(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        f64::NAN
    } else {
        a.min(b)
    }
}

fn maximum(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        f64::NAN
    } else {
        a.max(b)
    }
}

// =============================================================================
// Syntax tree
// =============================================================================

/// Binary operators
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
    /// `%` (result takes the sign of the divisor)
    Rem,
    /// `**`
    Pow,
}

impl BinaryOp {
    fn apply(self, a: f64, b: f64) -> f64 {
        match self {
            Self::Add => a + b,
            Self::Sub => a - b,
            Self::Mul => a * b,
            Self::Div => a / b,
            Self::Rem => a - b * (a / b).floor(),
            Self::Pow => a.powf(b),
        }
    }
}

/// Parsed expression
#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    /// Literal
    Number(f64),
    /// Column, pseudo-field or constant
    Name(String),
    /// Unary minus
    Neg(Box<Expr>),
    /// Arithmetic
    Binary {
        /// Operator
        op: BinaryOp,
        /// Left operand
        lhs: Box<Expr>,
        /// Right operand
        rhs: Box<Expr>,
    },
    /// Function call; the name is checked against the table when parsed
    Call {
        /// Function name
        function: String,
        /// Arguments
        args: Vec<Expr>,
    },
}

impl Expr {
    /// Parse source text
    pub fn parse(source: &str) -> Result<Self, ExpressionError> {
        let tokens = tokenize(source)?;
        if tokens.len() > MAX_TOKENS + 1 {
            return Err(ExpressionError::Parse {
                position: tokens[MAX_TOKENS].0,
                message: format!("expression longer than {MAX_TOKENS} tokens"),
            });
        }
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let expr = parser.expr()?;
        match parser.peek() {
            (_, Token::End) => Ok(expr),
            (position, token) => Err(ExpressionError::Parse {
                position: *position,
                message: format!("unexpected {token:?}"),
            }),
        }
    }

    /// Evaluate against a namespace
    pub fn eval<N: Namespace + ?Sized>(&self, ns: &N) -> Result<Value, ExpressionError> {
        match self {
            Self::Number(v) => Ok(Value::Scalar(*v)),
            Self::Name(name) => match ns.lookup(name) {
                Some(value) => value,
                None => constant(name)
                    .map(Value::Scalar)
                    .ok_or_else(|| ExpressionError::UnknownName { name: name.clone() }),
            },
            Self::Neg(inner) => Ok(inner.eval(ns)?.map(|v| -v)),
            Self::Binary { op, lhs, rhs } => {
                let op = *op;
                lhs.eval(ns)?.zip(rhs.eval(ns)?, move |a, b| op.apply(a, b))
            }
            Self::Call { function: name, args } => {
                let f = function(name)
                    .ok_or_else(|| ExpressionError::UnknownName { name: name.clone() })?;
                match (f, args.as_slice()) {
                    (Function::Unary(f), [arg]) => Ok(arg.eval(ns)?.map(f)),
                    (Function::Binary(f), [a, b]) => a.eval(ns)?.zip(b.eval(ns)?, f),
                    (f, args) => Err(ExpressionError::Arity {
                        function: name.clone(),
                        expected: f.arity(),
                        found: args.len(),
                    }),
                }
            }
        }
    }
}

// =============================================================================
// Lexer
// =============================================================================

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    StarStar,
    Slash,
    Percent,
    LParen,
    RParen,
    Comma,
    End,
}

fn tokenize(source: &str) -> Result<Vec<(usize, Token)>, ExpressionError> {
    let mut tokens = Vec::new();
    let mut chars = source.char_indices().peekable();

    while let Some(&(pos, c)) = chars.peek() {
        let token = match c {
            c if c.is_whitespace() => {
                chars.next();
                continue;
            }
            '0'..='9' | '.' => number(source, &mut chars)?,
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&(_, c)) = chars.peek() {
                    if !(c.is_ascii_alphanumeric() || c == '_') {
                        break;
                    }
                    ident.push(c);
                    chars.next();
                }
                Token::Ident(ident)
            }
            _ => {
                chars.next();
                match c {
                    '+' => Token::Plus,
                    '-' => Token::Minus,
                    '*' if chars.peek().is_some_and(|&(_, n)| n == '*') => {
                        chars.next();
                        Token::StarStar
                    }
                    '*' => Token::Star,
                    '/' => Token::Slash,
                    '%' => Token::Percent,
                    '(' => Token::LParen,
                    ')' => Token::RParen,
                    ',' => Token::Comma,
                    other => {
                        return Err(ExpressionError::Parse {
                            position: pos,
                            message: format!("unexpected character '{other}'"),
                        })
                    }
                }
            }
        };
        tokens.push((pos, token));
    }

    tokens.push((source.len(), Token::End));
    Ok(tokens)
}

fn number(source: &str, chars: &mut Peekable<CharIndices<'_>>) -> Result<Token, ExpressionError> {
    let start = chars.peek().map_or(source.len(), |&(pos, _)| pos);
    let mut end = start;
    let mut prev = ' ';

    while let Some(&(pos, c)) = chars.peek() {
        let exponent_sign = (c == '+' || c == '-') && (prev == 'e' || prev == 'E');
        if !(c.is_ascii_digit() || c == '.' || c == 'e' || c == 'E' || exponent_sign) {
            break;
        }
        prev = c;
        end = pos + c.len_utf8();
        chars.next();
    }

    let text = &source[start..end];
    text.parse::<f64>()
        .map(Token::Number)
        .map_err(|_| ExpressionError::Parse {
            position: start,
            message: format!("invalid number '{text}'"),
        })
}

// =============================================================================
// Parser
// =============================================================================

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> &(usize, Token) {
        // tokenize always ends the stream with End
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> (usize, Token) {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if &self.peek().1 == token {
            self.advance();
            true
        } else {
            false
        }
    }

    /// Run one nested production, failing past `MAX_DEPTH`
    fn nested<T>(
        &mut self,
        parse: impl FnOnce(&mut Self) -> Result<T, ExpressionError>,
    ) -> Result<T, ExpressionError> {
        if self.depth >= MAX_DEPTH {
            return Err(ExpressionError::Parse {
                position: self.peek().0,
                message: format!("nested deeper than {MAX_DEPTH} levels"),
            });
        }
        self.depth += 1;
        let result = parse(self);
        self.depth -= 1;
        result
    }

    fn expr(&mut self) -> Result<Expr, ExpressionError> {
        let mut lhs = self.term()?;
        loop {
            let op = match self.peek().1 {
                Token::Plus => BinaryOp::Add,
                Token::Minus => BinaryOp::Sub,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.term()?;
            lhs = binary(op, lhs, rhs);
        }
    }

    fn term(&mut self) -> Result<Expr, ExpressionError> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek().1 {
                Token::Star => BinaryOp::Mul,
                Token::Slash => BinaryOp::Div,
                Token::Percent => BinaryOp::Rem,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.unary()?;
            lhs = binary(op, lhs, rhs);
        }
    }

    fn unary(&mut self) -> Result<Expr, ExpressionError> {
        if self.eat(&Token::Minus) {
            return Ok(Expr::Neg(Box::new(self.nested(Self::unary)?)));
        }
        if self.eat(&Token::Plus) {
            return self.nested(Self::unary);
        }
        self.power()
    }

    fn power(&mut self) -> Result<Expr, ExpressionError> {
        let base = self.primary()?;
        if self.eat(&Token::StarStar) {
            let exponent = self.nested(Self::unary)?;
            return Ok(binary(BinaryOp::Pow, base, exponent));
        }
        Ok(base)
    }

    fn primary(&mut self) -> Result<Expr, ExpressionError> {
        let (position, token) = self.advance();
        match token {
            Token::Number(v) => Ok(Expr::Number(v)),
            Token::Ident(name) if self.eat(&Token::LParen) => self.call(name),
            Token::Ident(name) => Ok(Expr::Name(name)),
            Token::LParen => {
                let inner = self.nested(Self::expr)?;
                self.expect_close()?;
                Ok(inner)
            }
            other => Err(ExpressionError::Parse {
                position,
                message: format!("expected a value, found {other:?}"),
            }),
        }
    }

    fn call(&mut self, name: String) -> Result<Expr, ExpressionError> {
        let Some(f) = function(&name) else {
            return Err(ExpressionError::UnknownName { name });
        };

        let mut args = Vec::new();
        if !self.eat(&Token::RParen) {
            loop {
                args.push(self.nested(Self::expr)?);
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
            self.expect_close()?;
        }

        if args.len() != f.arity() {
            return Err(ExpressionError::Arity {
                function: name,
                expected: f.arity(),
                found: args.len(),
            });
        }
        Ok(Expr::Call {
            function: name,
            args,
        })
    }

    fn expect_close(&mut self) -> Result<(), ExpressionError> {
        if self.eat(&Token::RParen) {
            return Ok(());
        }
        let (position, token) = self.peek().clone();
        Err(ExpressionError::Parse {
            position,
            message: format!("expected ')', found {token:?}"),
        })
    }
}

fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr::Binary {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
    }
}
