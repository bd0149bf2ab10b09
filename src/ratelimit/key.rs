//! Window key generation and validation.

use std::fmt;

use serde_json::Value;

use crate::error::{Result, TollgateError};

/// Separator between key segments.
pub const SEPARATOR: char = ':';

/// Segment inserted between the namespace and the limiter name.
const LIMITER_SEGMENT: &str = "limiter";

/// Whether `segment` is a non-empty run of ASCII letters, digits, `.`, `_` or `-`.
pub fn is_valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}

/// One part of a caller identity: a string or a number.
///
/// Floats render in plain decimal notation (`1.5`, `100`). Values that other
/// clients would print in exponent form, and non-finite values, are rejected
/// so the same number always maps to the same key.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Text(String),
    Integer(i64),
    Float(f64),
}

/// Floats in this range print the same way in every common client.
const PLAIN_FLOAT_MIN: f64 = 1e-6;
const PLAIN_FLOAT_MAX: f64 = 1e21;

fn has_plain_rendering(n: f64) -> bool {
    let magnitude = n.abs();
    n.is_finite() && (magnitude == 0.0 || (PLAIN_FLOAT_MIN..PLAIN_FLOAT_MAX).contains(&magnitude))
}

impl Token {
    fn render(&self) -> String {
        match self {
            Token::Text(s) => s.clone(),
            Token::Integer(n) => n.to_string(),
            Token::Float(n) => n.to_string(),
        }
    }

    fn to_segment(&self) -> std::result::Result<String, String> {
        let rendered = self.render();
        match self {
            Token::Float(n) if !has_plain_rendering(*n) => Err(format!(
                "\"{}\" has no portable decimal form (allowed magnitude: 1e-6 to 1e21)",
                rendered
            )),
            _ if !is_valid_segment(&rendered) => Err(format!(
                "\"{}\" is not alphanumeric (allowed: a-z, 0-9, '.', '_', '-')",
                rendered
            )),
            _ => Ok(rendered),
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

impl From<&str> for Token {
    fn from(s: &str) -> Self {
        Token::Text(s.to_string())
    }
}

impl From<String> for Token {
    fn from(s: String) -> Self {
        Token::Text(s)
    }
}

impl From<i64> for Token {
    fn from(n: i64) -> Self {
        Token::Integer(n)
    }
}

impl From<i32> for Token {
    fn from(n: i32) -> Self {
        Token::Integer(n as i64)
    }
}

impl From<u32> for Token {
    fn from(n: u32) -> Self {
        Token::Integer(n as i64)
    }
}

impl From<f64> for Token {
    fn from(n: f64) -> Self {
        Token::Float(n)
    }
}

/// The caller-supplied identity a window is counted against.
#[derive(Debug, Clone, PartialEq)]
pub enum Identity {
    /// A single token, such as a user id or a client address.
    Single(Token),
    /// An ordered sequence of tokens, such as `[route, user]`.
    Composite(Vec<Token>),
}

impl Identity {
    /// Build a composite identity from anything that converts into tokens.
    pub fn composite<I, T>(parts: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Token>,
    {
        Identity::Composite(parts.into_iter().map(Into::into).collect())
    }

    /// Validate every token and render the identity as key segments.
    pub fn segments(&self) -> Result<Vec<String>> {
        match self {
            Identity::Single(token) => token
                .to_segment()
                .map(|segment| vec![segment])
                .map_err(|reason| TollgateError::InvalidKey(format!("key {}", reason))),
            Identity::Composite(tokens) => {
                if tokens.is_empty() {
                    return Err(TollgateError::InvalidKey(
                        "key sequence must not be empty".to_string(),
                    ));
                }
                tokens
                    .iter()
                    .enumerate()
                    .map(|(i, token)| {
                        token.to_segment().map_err(|reason| {
                            TollgateError::InvalidKey(format!("key[{}] {}", i, reason))
                        })
                    })
                    .collect()
            }
        }
    }
}

impl From<&str> for Identity {
    fn from(s: &str) -> Self {
        Identity::Single(s.into())
    }
}

impl From<String> for Identity {
    fn from(s: String) -> Self {
        Identity::Single(s.into())
    }
}

impl From<i64> for Identity {
    fn from(n: i64) -> Self {
        Identity::Single(n.into())
    }
}

impl From<Token> for Identity {
    fn from(token: Token) -> Self {
        Identity::Single(token)
    }
}

impl From<Vec<Token>> for Identity {
    fn from(tokens: Vec<Token>) -> Self {
        Identity::Composite(tokens)
    }
}

impl From<Vec<&str>> for Identity {
    fn from(parts: Vec<&str>) -> Self {
        Identity::composite(parts)
    }
}

fn token_from_value(value: &Value, position: Option<usize>) -> Result<Token> {
    let describe = |kind: &str| match position {
        Some(i) => format!("key[{}] has unsupported type {}", i, kind),
        None => format!("key has unsupported type {}", kind),
    };
    match value {
        Value::String(s) => Ok(Token::Text(s.clone())),
        Value::Number(n) => n
            .as_i64()
            .map(Token::Integer)
            .or_else(|| n.as_f64().map(Token::Float))
            .ok_or_else(|| TollgateError::InvalidKey(describe("number"))),
        Value::Null => Err(TollgateError::InvalidKey(describe("null"))),
        Value::Bool(_) => Err(TollgateError::InvalidKey(describe("boolean"))),
        Value::Array(_) => Err(TollgateError::InvalidKey(describe("array"))),
        Value::Object(_) => Err(TollgateError::InvalidKey(describe("object"))),
    }
}

/// Identities arriving as untyped JSON: strings, numbers or arrays of them.
impl TryFrom<&Value> for Identity {
    type Error = TollgateError;

    fn try_from(value: &Value) -> Result<Self> {
        match value {
            Value::Array(items) => items
                .iter()
                .enumerate()
                .map(|(i, item)| token_from_value(item, Some(i)))
                .collect::<Result<Vec<_>>>()
                .map(Identity::Composite),
            other => token_from_value(other, None).map(Identity::Single),
        }
    }
}

/// A fully namespaced key identifying one window in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WindowKey(String);

impl WindowKey {
    /// The key as sent to the store.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WindowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Builds window keys of the form `<namespace>:limiter:<name>:<part>[:<part>...]`.
///
/// The namespace segment is only present when a non-empty namespace is
/// configured. Name and namespace are checked once, at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyCodec {
    prefix: String,
}

impl KeyCodec {
    /// Create a codec for a limiter name and optional namespace.
    pub fn new(name: &str, namespace: Option<&str>) -> Result<Self> {
        if !is_valid_segment(name) {
            return Err(TollgateError::Config(format!(
                "name \"{}\" is not alphanumeric (allowed: a-z, 0-9, '.', '_', '-')",
                name
            )));
        }

        let namespace = namespace.filter(|ns| !ns.is_empty());
        if let Some(ns) = namespace {
            if !is_valid_segment(ns) {
                return Err(TollgateError::Config(format!(
                    "namespace \"{}\" is not alphanumeric (options.namespace)",
                    ns
                )));
            }
        }

        let mut prefix = String::new();
        if let Some(ns) = namespace {
            prefix.push_str(ns);
            prefix.push(SEPARATOR);
        }
        prefix.push_str(LIMITER_SEGMENT);
        prefix.push(SEPARATOR);
        prefix.push_str(name);

        Ok(Self { prefix })
    }

    /// The fixed part shared by every key of this limiter.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Validate `identity` and build its window key.
    pub fn encode(&self, identity: &Identity) -> Result<WindowKey> {
        let segments = identity.segments()?;
        let mut key = self.prefix.clone();
        for segment in segments {
            key.push(SEPARATOR);
            key.push_str(&segment);
        }
        Ok(WindowKey(key))
    }
}
