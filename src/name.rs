//! Hierarchical dotted identifiers.
//!
//! A [`Name`] is a non-empty sequence of [`Token`]s written as
//! `body[index].body.body[index]`. Dots and brackets inside a token body are
//! escaped with a backslash, so every name survives a trip through its string
//! form unchanged.

use std::fmt::{self, Display, Write};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::NameError;

/// A single segment of a [`Name`]. The body is never empty.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token {
    body: String,
    index: Option<usize>,
}

impl Token {
    pub fn new(body: impl Into<String>) -> Result<Self, NameError> {
        let body = body.into();
        if body.is_empty() {
            return Err(NameError::EmptyBody);
        }
        Ok(Self { body, index: None })
    }

    pub fn indexed(body: impl Into<String>, index: usize) -> Result<Self, NameError> {
        Ok(Self {
            index: Some(index),
            ..Self::new(body)?
        })
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn index(&self) -> Option<usize> {
        self.index
    }

    /// The same token without its index.
    pub fn without_index(&self) -> Token {
        Token {
            body: self.body.clone(),
            index: None,
        }
    }
}

impl Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in self.body.chars() {
            if matches!(c, '.' | '[' | ']' | '\\') {
                f.write_char('\\')?;
            }
            f.write_char(c)?;
        }

        if let Some(index) = self.index {
            write!(f, "[{index}]")?;
        }

        Ok(())
    }
}

/// Hierarchical identifier used to key DataSets and configuration nodes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Name {
    tokens: Vec<Token>,
}

impl Name {
    pub fn parse(text: &str) -> Result<Self, NameError> {
        if text.is_empty() {
            return Err(NameError::Empty);
        }

        let mut tokens = Vec::new();
        let mut body = String::new();
        let mut index: Option<usize> = None;
        let mut chars = text.chars();

        while let Some(c) = chars.next() {
            match c {
                '\\' => match chars.next() {
                    Some(escaped) if index.is_none() => body.push(escaped),
                    Some(_) => return Err(NameError::TrailingIndex(text.to_string())),
                    None => return Err(NameError::DanglingEscape(text.to_string())),
                },
                '.' => {
                    tokens.push(finish_token(text, tokens.len(), &mut body, index.take())?);
                }
                '[' => {
                    if index.is_some() {
                        return Err(NameError::TrailingIndex(text.to_string()));
                    }
                    let mut digits = String::new();
                    let mut closed = false;
                    for d in chars.by_ref() {
                        if d == ']' {
                            closed = true;
                            break;
                        }
                        digits.push(d);
                    }
                    if !closed {
                        return Err(NameError::UnterminatedIndex(text.to_string()));
                    }
                    let parsed = digits
                        .parse::<usize>()
                        .map_err(|_| NameError::InvalidIndex(digits.clone()))?;
                    index = Some(parsed);
                }
                other => {
                    if index.is_some() {
                        return Err(NameError::TrailingIndex(text.to_string()));
                    }
                    body.push(other);
                }
            }
        }

        tokens.push(finish_token(text, tokens.len(), &mut body, index)?);

        Ok(Self { tokens })
    }

    /// Builds a single-token name without parsing, so `body` may contain
    /// dots or brackets. Fails only for an empty body.
    pub fn of(body: impl Into<String>) -> Result<Self, NameError> {
        Ok(Self {
            tokens: vec![Token::new(body)?],
        })
    }

    pub fn from_tokens(tokens: impl IntoIterator<Item = Token>) -> Result<Self, NameError> {
        let tokens: Vec<Token> = tokens.into_iter().collect();
        if tokens.is_empty() {
            return Err(NameError::Empty);
        }
        Ok(Self { tokens })
    }

    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Always false, a name has at least one token.
    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn first(&self) -> &Token {
        &self.tokens[0]
    }

    pub fn last(&self) -> &Token {
        &self.tokens[self.tokens.len() - 1]
    }

    /// Everything after the first token, or `None` for a single-token name.
    pub fn cut_first(&self) -> Option<Name> {
        (self.tokens.len() > 1).then(|| Name {
            tokens: self.tokens[1..].to_vec(),
        })
    }

    /// Everything before the last token, or `None` for a single-token name.
    pub fn cut_last(&self) -> Option<Name> {
        (self.tokens.len() > 1).then(|| Name {
            tokens: self.tokens[..self.tokens.len() - 1].to_vec(),
        })
    }

    pub fn starts_with(&self, prefix: &Name) -> bool {
        self.tokens.starts_with(&prefix.tokens)
    }

    /// Strips `prefix`, returning `None` if the name does not start with it
    /// or nothing would remain.
    pub fn strip_prefix(&self, prefix: &Name) -> Option<Name> {
        if self.starts_with(prefix) && self.tokens.len() > prefix.tokens.len() {
            Some(Name {
                tokens: self.tokens[prefix.tokens.len()..].to_vec(),
            })
        } else {
            None
        }
    }

    pub fn join(&self, other: &Name) -> Name {
        let mut tokens = self.tokens.clone();
        tokens.extend(other.tokens.iter().cloned());
        Name { tokens }
    }

    pub fn child(&self, token: Token) -> Name {
        let mut tokens = self.tokens.clone();
        tokens.push(token);
        Name { tokens }
    }
}

fn finish_token(
    text: &str,
    position: usize,
    body: &mut String,
    index: Option<usize>,
) -> Result<Token, NameError> {
    if body.is_empty() {
        return Err(NameError::EmptyToken(position, text.to_string()));
    }
    Ok(Token {
        body: std::mem::take(body),
        index,
    })
}

impl Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, token) in self.tokens.iter().enumerate() {
            if i > 0 {
                f.write_char('.')?;
            }
            write!(f, "{token}")?;
        }
        Ok(())
    }
}

impl FromStr for Name {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Name::parse(s)
    }
}

impl From<Token> for Name {
    fn from(token: Token) -> Self {
        Name {
            tokens: vec![token],
        }
    }
}

impl Serialize for Name {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Name {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
        Name::parse(&text).map_err(serde::de::Error::custom)
    }
}

/// Anything that can be turned into a [`Name`], parsing strings on the way.
pub trait IntoName {
    fn into_name(self) -> Result<Name, NameError>;
}

impl IntoName for Name {
    fn into_name(self) -> Result<Name, NameError> {
        Ok(self)
    }
}

impl IntoName for &Name {
    fn into_name(self) -> Result<Name, NameError> {
        Ok(self.clone())
    }
}

impl IntoName for &str {
    fn into_name(self) -> Result<Name, NameError> {
        Name::parse(self)
    }
}

impl IntoName for String {
    fn into_name(self) -> Result<Name, NameError> {
        Name::parse(&self)
    }
}

impl IntoName for &String {
    fn into_name(self) -> Result<Name, NameError> {
        Name::parse(self)
    }
}

impl IntoName for Token {
    fn into_name(self) -> Result<Name, NameError> {
        Ok(Name::from(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(text: &str) {
        let name = Name::parse(text).unwrap();
        let again = Name::parse(&name.to_string()).unwrap();
        assert_eq!(name, again, "round trip of '{text}'");
    }

    #[test]
    fn test_parse_simple() {
        let name = Name::parse("a.b.c").unwrap();
        assert_eq!(name.len(), 3);
        assert_eq!(name.first().body(), "a");
        assert_eq!(name.last().body(), "c");
        assert_eq!(name.to_string(), "a.b.c");
    }

    #[test]
    fn test_parse_index() {
        let name = Name::parse("data[12].value").unwrap();
        assert_eq!(name.tokens()[0], Token::indexed("data", 12).unwrap());
        assert_eq!(name.tokens()[1], Token::new("value").unwrap());
        assert_eq!(name.tokens()[0].index(), Some(12));
    }

    #[test]
    fn test_round_trip() {
        for text in [
            "a",
            "a.b",
            "a[0].b[3]",
            r"dotted\.token.next",
            r"br\[ack\]et",
            r"back\\slash",
            "newName_4",
        ] {
            round_trip(text);
        }
    }

    #[test]
    fn test_round_trip_constructed() {
        let name = Name::of("with.dots[and]brackets")
            .unwrap()
            .child(Token::indexed("x", 2).unwrap());
        round_trip(&name.to_string());
        assert_eq!(Name::parse(&name.to_string()).unwrap(), name);
    }

    #[test]
    fn test_invalid() {
        assert_eq!(Name::parse(""), Err(NameError::Empty));
        assert!(matches!(Name::parse("a..b"), Err(NameError::EmptyToken(1, _))));
        assert!(matches!(Name::parse("a[1"), Err(NameError::UnterminatedIndex(_))));
        assert!(matches!(Name::parse("a[x]"), Err(NameError::InvalidIndex(_))));
        assert!(matches!(Name::parse("a[1]b"), Err(NameError::TrailingIndex(_))));
        assert!(matches!(Name::parse(r"a\"), Err(NameError::DanglingEscape(_))));
    }

    #[test]
    fn test_empty_body_rejected() {
        assert_eq!(Name::of(""), Err(NameError::EmptyBody));
        assert_eq!(Token::new(""), Err(NameError::EmptyBody));
        assert_eq!(Token::indexed("", 1), Err(NameError::EmptyBody));
        assert_eq!(Name::from_tokens(Vec::new()), Err(NameError::Empty));

        // Anything that can be built displays as a parseable string.
        for body in ["x[", "a..b", ".", "]", r"\", "1.5"] {
            let name = Name::of(body).unwrap();
            assert_eq!(Name::parse(&name.to_string()).unwrap(), name);
        }
    }

    #[test]
    fn test_prefix_ops() {
        let name = Name::parse("a.b.c").unwrap();
        let prefix = Name::parse("a.b").unwrap();

        assert!(name.starts_with(&prefix));
        assert_eq!(name.strip_prefix(&prefix).unwrap().to_string(), "c");
        assert_eq!(name.cut_first().unwrap().to_string(), "b.c");
        assert_eq!(name.cut_last().unwrap(), prefix);
        assert!(Name::of("a").unwrap().cut_first().is_none());
        assert_eq!(prefix.join(&Name::of("c").unwrap()), name);
    }

    #[test]
    fn test_serde_as_string() {
        let name = Name::parse("a[1].b").unwrap();
        let json = serde_json::to_string(&name).unwrap();
        assert_eq!(json, r#""a[1].b""#);
        let back: Name = serde_json::from_str(&json).unwrap();
        assert_eq!(back, name);
    }
}
