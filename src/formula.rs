//! Per-channel conversion formulas.
//!
//! A formula is a small arithmetic expression over the single variable `value`,
//! e.g. `"(value/10)*1e-06"`. It is parsed once into an expression tree and then
//! evaluated for every raw sample. Only numbers, `value`, the operators
//! `+ - * / % **`, parentheses and a fixed set of numeric functions are accepted.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Identity formula every measurement channel starts with.
pub const IDENTITY: &str = "value";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FormulaError {
    #[error("Unexpected character '{found}' at {position} in '{formula}'")]
    UnexpectedChar {
        formula: String,
        found: char,
        position: usize,
    },
    #[error("Unexpected end of formula '{0}'")]
    UnexpectedEnd(String),
    #[error("Unexpected token '{found}' in '{formula}'")]
    UnexpectedToken { formula: String, found: String },
    #[error("Unknown name '{name}' in '{formula}'")]
    UnknownName { formula: String, name: String },
    #[error("Function '{name}' takes {expected} argument(s), got {got}")]
    Arity {
        name: String,
        expected: usize,
        got: usize,
    },
    #[error("Division by zero evaluating '{0}'")]
    DivisionByZero(String),
    #[error("Formula '{formula}' produced a non-finite result for value {value}")]
    NonFinite { formula: String, value: f64 },
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Power,
    LParen,
    RParen,
    Comma,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Number(n) => write!(f, "{n}"),
            Token::Ident(s) => f.write_str(s),
            Token::Plus => f.write_str("+"),
            Token::Minus => f.write_str("-"),
            Token::Star => f.write_str("*"),
            Token::Slash => f.write_str("/"),
            Token::Percent => f.write_str("%"),
            Token::Power => f.write_str("**"),
            Token::LParen => f.write_str("("),
            Token::RParen => f.write_str(")"),
            Token::Comma => f.write_str(","),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Pow,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Function {
    Abs,
    Sqrt,
    Exp,
    Log,
    Log10,
    Round,
    Min,
    Max,
    Pow,
}

impl Function {
    fn lookup(name: &str) -> Option<Self> {
        Some(match name {
            "abs" => Function::Abs,
            "sqrt" => Function::Sqrt,
            "exp" => Function::Exp,
            "log" => Function::Log,
            "log10" => Function::Log10,
            "round" => Function::Round,
            "min" => Function::Min,
            "max" => Function::Max,
            "pow" => Function::Pow,
            _ => return None,
        })
    }

    fn arity(self) -> usize {
        match self {
            Function::Min | Function::Max | Function::Pow => 2,
            _ => 1,
        }
    }

    fn apply(self, args: &[f64]) -> f64 {
        match self {
            Function::Abs => args[0].abs(),
            Function::Sqrt => args[0].sqrt(),
            Function::Exp => args[0].exp(),
            Function::Log => args[0].ln(),
            Function::Log10 => args[0].log10(),
            Function::Round => args[0].round(),
            Function::Min => args[0].min(args[1]),
            Function::Max => args[0].max(args[1]),
            Function::Pow => args[0].powf(args[1]),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Number(f64),
    Value,
    Neg(Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Call(Function, Vec<Expr>),
}

fn tokenize(formula: &str) -> Result<Vec<Token>, FormulaError> {
    let chars: Vec<char> = formula.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' => i += 1,
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' if chars.get(i + 1) == Some(&'*') => {
                tokens.push(Token::Power);
                i += 2;
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
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                // exponent part, e.g. 1e-06
                if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                    let mut j = i + 1;
                    if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
                        j += 1;
                    }
                    if j < chars.len() && chars[j].is_ascii_digit() {
                        while j < chars.len() && chars[j].is_ascii_digit() {
                            j += 1;
                        }
                        i = j;
                    }
                }
                let text: String = chars[start..i].iter().collect();
                let number = text.parse::<f64>().map_err(|_| FormulaError::UnexpectedToken {
                    formula: formula.to_string(),
                    found: text.clone(),
                })?;
                tokens.push(Token::Number(number));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => {
                return Err(FormulaError::UnexpectedChar {
                    formula: formula.to_string(),
                    found: other,
                    position: i,
                });
            }
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    formula: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Result<Token, FormulaError> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| FormulaError::UnexpectedEnd(self.formula.to_string()))?;
        self.pos += 1;
        Ok(token)
    }

    fn expect(&mut self, expected: Token) -> Result<(), FormulaError> {
        let token = self.next()?;
        if token == expected {
            Ok(())
        } else {
            Err(self.unexpected(&token))
        }
    }

    fn unexpected(&self, token: &Token) -> FormulaError {
        FormulaError::UnexpectedToken {
            formula: self.formula.to_string(),
            found: token.to_string(),
        }
    }

    // expr := term (('+' | '-') term)*
    fn expr(&mut self) -> Result<Expr, FormulaError> {
        let mut lhs = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.term()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    // term := unary (('*' | '/' | '%') unary)*
    fn term(&mut self) -> Result<Expr, FormulaError> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                Some(Token::Percent) => BinaryOp::Rem,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    // unary := ('-' | '+') unary | power
    fn unary(&mut self) -> Result<Expr, FormulaError> {
        match self.peek() {
            Some(Token::Minus) => {
                self.pos += 1;
                Ok(Expr::Neg(Box::new(self.unary()?)))
            }
            Some(Token::Plus) => {
                self.pos += 1;
                self.unary()
            }
            _ => self.power(),
        }
    }

    // power := atom ('**' unary)?   (right associative, binds tighter than unary minus on the left)
    fn power(&mut self) -> Result<Expr, FormulaError> {
        let base = self.atom()?;
        if let Some(Token::Power) = self.peek() {
            self.pos += 1;
            let exponent = self.unary()?;
            return Ok(Expr::Binary(BinaryOp::Pow, Box::new(base), Box::new(exponent)));
        }
        Ok(base)
    }

    fn atom(&mut self) -> Result<Expr, FormulaError> {
        match self.next()? {
            Token::Number(n) => Ok(Expr::Number(n)),
            Token::LParen => {
                let inner = self.expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Token::Ident(name) if name == "value" => Ok(Expr::Value),
            Token::Ident(name) => {
                let function =
                    Function::lookup(&name).ok_or_else(|| FormulaError::UnknownName {
                        formula: self.formula.to_string(),
                        name: name.clone(),
                    })?;
                self.expect(Token::LParen)?;
                let mut args = Vec::new();
                if self.peek() != Some(&Token::RParen) {
                    loop {
                        args.push(self.expr()?);
                        if self.peek() == Some(&Token::Comma) {
                            self.pos += 1;
                        } else {
                            break;
                        }
                    }
                }
                self.expect(Token::RParen)?;
                if args.len() != function.arity() {
                    return Err(FormulaError::Arity {
                        name,
                        expected: function.arity(),
                        got: args.len(),
                    });
                }
                Ok(Expr::Call(function, args))
            }
            other => Err(self.unexpected(&other)),
        }
    }
}

/// A parsed conversion formula.
#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    source: String,
    expr: Expr,
}

impl Formula {
    /// Parse a formula. The text is lower-cased first, so `VALUE/10` is accepted.
    pub fn parse(text: &str) -> Result<Self, FormulaError> {
        let source = text.trim().to_lowercase();
        let tokens = tokenize(&source)?;
        let mut parser = Parser {
            formula: &source,
            tokens,
            pos: 0,
        };
        let expr = parser.expr()?;
        if let Some(token) = parser.peek() {
            return Err(parser.unexpected(token));
        }
        Ok(Self { source, expr })
    }

    pub fn identity() -> Self {
        Self {
            source: IDENTITY.to_string(),
            expr: Expr::Value,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn is_identity(&self) -> bool {
        self.expr == Expr::Value
    }

    /// Evaluate the formula for one raw sample.
    pub fn evaluate(&self, value: f64) -> Result<f64, FormulaError> {
        let result = self.eval(&self.expr, value)?;
        if result.is_finite() || !value.is_finite() {
            Ok(result)
        } else {
            Err(FormulaError::NonFinite {
                formula: self.source.clone(),
                value,
            })
        }
    }

    /// Evaluate the formula for a whole slice of raw samples.
    pub fn apply(&self, values: &[f64]) -> Result<Vec<f64>, FormulaError> {
        values.iter().map(|&v| self.evaluate(v)).collect()
    }

    fn eval(&self, expr: &Expr, value: f64) -> Result<f64, FormulaError> {
        Ok(match expr {
            Expr::Number(n) => *n,
            Expr::Value => value,
            Expr::Neg(inner) => -self.eval(inner, value)?,
            Expr::Binary(op, lhs, rhs) => {
                let a = self.eval(lhs, value)?;
                let b = self.eval(rhs, value)?;
                match op {
                    BinaryOp::Add => a + b,
                    BinaryOp::Sub => a - b,
                    BinaryOp::Mul => a * b,
                    BinaryOp::Div | BinaryOp::Rem if b == 0.0 => {
                        return Err(FormulaError::DivisionByZero(self.source.clone()));
                    }
                    BinaryOp::Div => a / b,
                    BinaryOp::Rem => a.rem_euclid(b),
                    BinaryOp::Pow => a.powf(b),
                }
            }
            Expr::Call(function, args) => {
                let args = args
                    .iter()
                    .map(|arg| self.eval(arg, value))
                    .collect::<Result<Vec<_>, _>>()?;
                function.apply(&args)
            }
        })
    }
}

impl Default for Formula {
    fn default() -> Self {
        Self::identity()
    }
}

impl FromStr for Formula {
    type Err = FormulaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Formula::parse(s)
    }
}

impl fmt::Display for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Conversion formulas keyed by instrument channel index (1-based).
///
/// Channels without an explicit entry convert with the identity formula.
#[derive(Debug, Clone, Default)]
pub struct FormulaRegistry {
    formulas: BTreeMap<u8, Formula>,
}

impl FormulaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and install a formula for a channel, replacing the previous one.
    pub fn set(&mut self, channel: u8, text: &str) -> Result<(), FormulaError> {
        let formula = Formula::parse(text)?;
        log::debug!("Channel {channel} formula set to '{formula}'");
        self.formulas.insert(channel, formula);
        Ok(())
    }

    pub fn get(&self, channel: u8) -> &Formula {
        static IDENTITY_FORMULA: std::sync::OnceLock<Formula> = std::sync::OnceLock::new();
        self.formulas
            .get(&channel)
            .unwrap_or_else(|| IDENTITY_FORMULA.get_or_init(Formula::identity))
    }

    /// Drop a channel's formula; it falls back to the identity.
    pub fn reset(&mut self, channel: u8) {
        self.formulas.remove(&channel);
    }

    pub fn convert(&self, channel: u8, values: &[f64]) -> Result<Vec<f64>, FormulaError> {
        let formula = self.get(channel);
        if formula.is_identity() {
            return Ok(values.to_vec());
        }
        formula.apply(values)
    }
}
