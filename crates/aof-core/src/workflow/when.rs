//! `when` predicate grammar for conditional gates.
//!
//! A minimal expression language over a task's routing:
//!
//! ```text
//! tags.security                       -- tag presence
//! role == "backend"                   -- field equality
//! team != "infra" && !tags.hotfix     -- boolean combinators
//! (priority == "critical") || tags.security
//! ```
//!
//! Sources are parsed once at workflow-load time; evaluation is a pure
//! function over routing and priority. Unknown identifiers evaluate to
//! false, so a typo disables a gate instead of crashing a poll.

use std::fmt;

use thiserror::Error;

use aof_store::{Priority, Routing};

/// Errors raised while parsing a `when` source string.
#[derive(Debug, Error)]
pub enum WhenParseError {
    #[error("unexpected character {0:?} at offset {1}")]
    UnexpectedChar(char, usize),

    #[error("unterminated string literal starting at offset {0}")]
    UnterminatedString(usize),

    #[error("unexpected end of expression")]
    UnexpectedEnd,

    #[error("unexpected token {0:?}")]
    UnexpectedToken(String),

    #[error("comparison against {0:?} requires a string literal")]
    ExpectedLiteral(String),

    #[error("empty expression")]
    Empty,
}

/// A routing field usable in comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKey {
    Role,
    Team,
    Priority,
}

impl fmt::Display for FieldKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Role => "role",
            Self::Team => "team",
            Self::Priority => "priority",
        };
        f.write_str(s)
    }
}

/// A parsed predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum WhenExpr {
    /// `tags.<name>`: true when the tag is present.
    Tag(String),
    /// Bare field reference: true when the field is set.
    Field(FieldKey),
    Eq(FieldKey, String),
    Ne(FieldKey, String),
    Not(Box<WhenExpr>),
    And(Box<WhenExpr>, Box<WhenExpr>),
    Or(Box<WhenExpr>, Box<WhenExpr>),
    /// Unknown identifier. Always false.
    Unknown(String),
}

impl WhenExpr {
    /// Parse a predicate source string.
    pub fn parse(source: &str) -> Result<Self, WhenParseError> {
        let tokens = lex(source)?;
        if tokens.is_empty() {
            return Err(WhenParseError::Empty);
        }
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(WhenParseError::UnexpectedToken(format!(
                "{:?}",
                parser.tokens[parser.pos]
            )));
        }
        Ok(expr)
    }

    /// Evaluate the predicate against a task's routing and priority.
    pub fn eval(&self, routing: &Routing, priority: Priority) -> bool {
        match self {
            Self::Tag(name) => routing.tags.iter().any(|t| t == name),
            Self::Field(key) => field_value(*key, routing, priority).is_some(),
            Self::Eq(key, literal) => {
                field_value(*key, routing, priority).as_deref() == Some(literal.as_str())
            }
            Self::Ne(key, literal) => {
                field_value(*key, routing, priority).as_deref() != Some(literal.as_str())
            }
            Self::Not(inner) => !inner.eval(routing, priority),
            Self::And(a, b) => a.eval(routing, priority) && b.eval(routing, priority),
            Self::Or(a, b) => a.eval(routing, priority) || b.eval(routing, priority),
            Self::Unknown(_) => false,
        }
    }
}

fn field_value(key: FieldKey, routing: &Routing, priority: Priority) -> Option<String> {
    match key {
        FieldKey::Role => routing.role.clone(),
        FieldKey::Team => routing.team.clone(),
        FieldKey::Priority => Some(priority.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Literal(String),
    AndAnd,
    OrOr,
    Bang,
    EqEq,
    NotEq,
    LParen,
    RParen,
}

fn lex(source: &str) -> Result<Vec<Token>, WhenParseError> {
    let mut tokens = Vec::new();
    let bytes: Vec<char> = source.chars().collect();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        match c {
            ' ' | '\t' | '\n' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '&' if bytes.get(i + 1) == Some(&'&') => {
                tokens.push(Token::AndAnd);
                i += 2;
            }
            '|' if bytes.get(i + 1) == Some(&'|') => {
                tokens.push(Token::OrOr);
                i += 2;
            }
            '=' if bytes.get(i + 1) == Some(&'=') => {
                tokens.push(Token::EqEq);
                i += 2;
            }
            '!' if bytes.get(i + 1) == Some(&'=') => {
                tokens.push(Token::NotEq);
                i += 2;
            }
            '!' => {
                tokens.push(Token::Bang);
                i += 1;
            }
            '\'' | '"' => {
                let quote = c;
                let start = i;
                i += 1;
                let mut value = String::new();
                loop {
                    match bytes.get(i) {
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            value.push(ch);
                            i += 1;
                        }
                        None => return Err(WhenParseError::UnterminatedString(start)),
                    }
                }
                tokens.push(Token::Literal(value));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&ch) = bytes.get(i) {
                    if ch.is_ascii_alphanumeric() || ch == '_' || ch == '.' || ch == '-' {
                        ident.push(ch);
                        i += 1;
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            other => return Err(WhenParseError::UnexpectedChar(other, i)),
        }
    }

    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn parse_or(&mut self) -> Result<WhenExpr, WhenParseError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::OrOr) {
            self.next();
            let right = self.parse_and()?;
            left = WhenExpr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<WhenExpr, WhenParseError> {
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Token::AndAnd) {
            self.next();
            let right = self.parse_unary()?;
            left = WhenExpr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<WhenExpr, WhenParseError> {
        if self.peek() == Some(&Token::Bang) {
            self.next();
            let inner = self.parse_unary()?;
            return Ok(WhenExpr::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<WhenExpr, WhenParseError> {
        match self.next() {
            Some(Token::LParen) => {
                let expr = self.parse_or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(expr),
                    Some(other) => Err(WhenParseError::UnexpectedToken(format!("{other:?}"))),
                    None => Err(WhenParseError::UnexpectedEnd),
                }
            }
            Some(Token::Ident(ident)) => self.parse_ident_tail(ident),
            Some(other) => Err(WhenParseError::UnexpectedToken(format!("{other:?}"))),
            None => Err(WhenParseError::UnexpectedEnd),
        }
    }

    /// After an identifier: optional `==`/`!=` comparison.
    fn parse_ident_tail(&mut self, ident: String) -> Result<WhenExpr, WhenParseError> {
        let comparison = match self.peek() {
            Some(Token::EqEq) => Some(true),
            Some(Token::NotEq) => Some(false),
            _ => None,
        };

        let Some(is_eq) = comparison else {
            // Bare reference.
            return Ok(match resolve_ident(&ident) {
                Resolved::Tag(name) => WhenExpr::Tag(name),
                Resolved::Field(key) => WhenExpr::Field(key),
                Resolved::Unknown => WhenExpr::Unknown(ident),
            });
        };

        self.next();
        let literal = match self.next() {
            Some(Token::Literal(value)) => value,
            _ => return Err(WhenParseError::ExpectedLiteral(ident)),
        };

        Ok(match resolve_ident(&ident) {
            Resolved::Field(key) if is_eq => WhenExpr::Eq(key, literal),
            Resolved::Field(key) => WhenExpr::Ne(key, literal),
            // Comparing a tag or an unknown identifier never matches.
            _ => WhenExpr::Unknown(ident),
        })
    }
}

enum Resolved {
    Tag(String),
    Field(FieldKey),
    Unknown,
}

fn resolve_ident(ident: &str) -> Resolved {
    if let Some(tag) = ident.strip_prefix("tags.") {
        if !tag.is_empty() {
            return Resolved::Tag(tag.to_string());
        }
        return Resolved::Unknown;
    }
    match ident {
        "role" => Resolved::Field(FieldKey::Role),
        "team" => Resolved::Field(FieldKey::Team),
        "priority" => Resolved::Field(FieldKey::Priority),
        _ => Resolved::Unknown,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
