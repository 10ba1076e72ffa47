//! Boolean expressions gating workflow stages.
//!
//! ```text
//! expr    := or
//! or      := and (("||" | "or") and)*
//! and     := not (("&&" | "and") not)*
//! not     := ("!" | "not") not | cmp
//! cmp     := primary (("==" | "!=" | "<" | "<=" | ">" | ">=") primary)?
//! primary := "(" expr ")" | string | number | true | false | null | path
//! path    := ident ("." ident)*
//! ```
//!
//! Paths resolve against the run context: a key equal to the whole dotted
//! path wins, otherwise the first segment is looked up and the rest walk into
//! nested objects. Unknown paths are `null`.

use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;

use sandflow_core::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    And,
    Or,
    Not,
    Op(CmpOp),
    Str(String),
    Num(f64),
    Ident(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Parsed condition expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Literal(Value),
    Path(String),
    Not(Box<Expression>),
    And(Box<Expression>, Box<Expression>),
    Or(Box<Expression>, Box<Expression>),
    Compare(Box<Expression>, ComparisonOperator, Box<Expression>),
}

/// Comparison operator of [`Expression::Compare`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOperator {
    Equal,
    NotEqual,
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
}

impl From<CmpOp> for ComparisonOperator {
    fn from(op: CmpOp) -> Self {
        match op {
            CmpOp::Eq => Self::Equal,
            CmpOp::Ne => Self::NotEqual,
            CmpOp::Lt => Self::Less,
            CmpOp::Le => Self::LessOrEqual,
            CmpOp::Gt => Self::Greater,
            CmpOp::Ge => Self::GreaterOrEqual,
        }
    }
}

fn syntax(expr: &str, msg: impl std::fmt::Display) -> Error {
    Error::invalid_workflow(format!("invalid condition '{}': {}", expr, msg))
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '&' | '|' => {
                if chars.get(i + 1) != Some(&c) {
                    return Err(syntax(input, format!("expected '{}{}'", c, c)));
                }
                tokens.push(if c == '&' { Token::And } else { Token::Or });
                i += 2;
            }
            '=' | '!' | '<' | '>' => {
                let next_eq = chars.get(i + 1) == Some(&'=');
                let token = match (c, next_eq) {
                    ('=', true) => Token::Op(CmpOp::Eq),
                    ('!', true) => Token::Op(CmpOp::Ne),
                    ('<', true) => Token::Op(CmpOp::Le),
                    ('>', true) => Token::Op(CmpOp::Ge),
                    ('<', false) => Token::Op(CmpOp::Lt),
                    ('>', false) => Token::Op(CmpOp::Gt),
                    ('!', false) => Token::Not,
                    _ => return Err(syntax(input, "single '=' is not an operator, use '=='")),
                };
                i += if next_eq { 2 } else { 1 };
                tokens.push(token);
            }
            '\'' | '"' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(syntax(input, "unterminated string")),
                        Some('\\') if chars.get(i + 1).is_some() => {
                            s.push(chars[i + 1]);
                            i += 2;
                        }
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| syntax(input, format!("bad number '{}'", text)))?;
                tokens.push(Token::Num(n));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || matches!(chars[i], '_' | '-' | '.'))
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    _ => Token::Ident(word),
                });
            }
            other => return Err(syntax(input, format!("unexpected character '{}'", other))),
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn or(&mut self) -> Result<Expression> {
        let mut left = self.and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            left = Expression::Or(Box::new(left), Box::new(self.and()?));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expression> {
        let mut left = self.not()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            left = Expression::And(Box::new(left), Box::new(self.not()?));
        }
        Ok(left)
    }

    fn not(&mut self) -> Result<Expression> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            return Ok(Expression::Not(Box::new(self.not()?)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expression> {
        let left = self.primary()?;
        if let Some(Token::Op(op)) = self.peek().cloned() {
            self.pos += 1;
            let right = self.primary()?;
            return Ok(Expression::Compare(Box::new(left), op.into(), Box::new(right)));
        }
        Ok(left)
    }

    fn primary(&mut self) -> Result<Expression> {
        match self.next() {
            Some(Token::LParen) => {
                let inner = self.or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(syntax(self.source, "missing ')'")),
                }
            }
            Some(Token::Str(s)) => Ok(Expression::Literal(Value::String(s))),
            Some(Token::Num(n)) => Ok(Expression::Literal(
                serde_json::Number::from_f64(n)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
            )),
            Some(Token::Ident(word)) => Ok(match word.as_str() {
                "true" => Expression::Literal(Value::Bool(true)),
                "false" => Expression::Literal(Value::Bool(false)),
                "null" => Expression::Literal(Value::Null),
                _ => Expression::Path(word),
            }),
            Some(other) => Err(syntax(self.source, format!("unexpected {:?}", other))),
            None => Err(syntax(self.source, "unexpected end of expression")),
        }
    }
}

impl Expression {
    pub fn parse(source: &str) -> Result<Self> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(syntax(source, "empty expression"));
        }
        let mut parser = Parser {
            source,
            tokens,
            pos: 0,
        };
        let expr = parser.or()?;
        if parser.pos < parser.tokens.len() {
            return Err(syntax(source, "trailing tokens"));
        }
        Ok(expr)
    }

    /// Evaluate to a boolean using JSON truthiness.
    pub fn evaluate(&self, context: &HashMap<String, Value>) -> Result<bool> {
        Ok(truthy(&self.value(context)?))
    }

    fn value(&self, context: &HashMap<String, Value>) -> Result<Value> {
        Ok(match self {
            Self::Literal(v) => v.clone(),
            Self::Path(path) => resolve(path, context),
            Self::Not(inner) => Value::Bool(!inner.evaluate(context)?),
            Self::And(l, r) => Value::Bool(l.evaluate(context)? && r.evaluate(context)?),
            Self::Or(l, r) => Value::Bool(l.evaluate(context)? || r.evaluate(context)?),
            Self::Compare(l, op, r) => {
                Value::Bool(compare(&l.value(context)?, *op, &r.value(context)?)?)
            }
        })
    }
}

/// Parse and evaluate `source` in one step.
pub fn evaluate(source: &str, context: &HashMap<String, Value>) -> Result<bool> {
    Expression::parse(source)?.evaluate(context)
}

fn resolve(path: &str, context: &HashMap<String, Value>) -> Value {
    if let Some(v) = context.get(path) {
        return v.clone();
    }
    let mut segments = path.split('.');
    let Some(mut current) = segments.next().and_then(|head| context.get(head)) else {
        return Value::Null;
    };
    for segment in segments {
        match current.get(segment) {
            Some(next) => current = next,
            None => return Value::Null,
        }
    }
    current.clone()
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn compare(left: &Value, op: ComparisonOperator, right: &Value) -> Result<bool> {
    use ComparisonOperator::*;

    let ordering = match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64().zip(b.as_f64()).and_then(|(a, b)| a.partial_cmp(&b)),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    };

    Ok(match op {
        Equal => ordering.map_or_else(|| left == right, |o| o == Ordering::Equal),
        NotEqual => ordering.map_or_else(|| left != right, |o| o != Ordering::Equal),
        Less | LessOrEqual | Greater | GreaterOrEqual => {
            let Some(o) = ordering else {
                return Err(Error::stage_execution(format!(
                    "cannot order {} and {}",
                    left, right
                )));
            };
            match op {
                Less => o == Ordering::Less,
                LessOrEqual => o != Ordering::Greater,
                Greater => o == Ordering::Greater,
                _ => o != Ordering::Less,
            }
        }
    })
}
