//! Tokenizer for the query expression language.

use chrono::{NaiveDate, NaiveDateTime};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::records::{timestamp_max, timestamp_min};

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Text(String),
    Uuid(Uuid),
    Timestamp(NaiveDateTime),
    Real(f64),
    Integer(i64),
    Boolean(bool),
    Name(String),
    Operator(String),
    End,
}

impl TokenKind {
    fn describe(&self) -> String {
        match self {
            TokenKind::Text(value) => format!("\"{}\"", value),
            TokenKind::Uuid(value) => format!("\"{}\"", value),
            TokenKind::Timestamp(value) => format!("\"{}\"", value),
            TokenKind::Real(value) => format!("\"{}\"", value),
            TokenKind::Integer(value) => format!("\"{}\"", value),
            TokenKind::Boolean(value) => format!("\"{}\"", value),
            TokenKind::Name(value) => format!("\"{}\"", value),
            TokenKind::Operator(value) => format!("\"{}\"", value),
            TokenKind::End => "end of input".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    /// Byte offset of the token in the expression text.
    pub position: usize,
}

/// One-token-lookahead stream over an expression string.
pub struct TokenStream<'a> {
    text: &'a str,
    offset: usize,
    token: Token,
}

impl<'a> TokenStream<'a> {
    pub fn new(text: &'a str) -> Result<Self> {
        let mut stream = TokenStream {
            text,
            offset: 0,
            token: Token {
                kind: TokenKind::End,
                position: 0,
            },
        };
        stream.token = stream.lex()?;
        Ok(stream)
    }

    pub fn current(&self) -> &Token {
        &self.token
    }

    pub fn at_end(&self) -> bool {
        self.token.kind == TokenKind::End
    }

    pub fn position(&self) -> usize {
        self.token.position
    }

    /// Remainder of the input from the current token onward.
    pub fn rest(&self) -> &str {
        &self.text[self.token.position.min(self.text.len())..]
    }

    pub fn advance(&mut self) -> Result<Token> {
        if self.at_end() {
            return Err(self.error_at("unexpected end of input"));
        }
        let next = self.lex()?;
        Ok(std::mem::replace(&mut self.token, next))
    }

    pub fn test_operator(&self, operators: &[&str]) -> bool {
        matches!(&self.token.kind, TokenKind::Operator(op) if operators.contains(&op.as_str()))
    }

    pub fn test_name(&self, name: &str) -> bool {
        matches!(&self.token.kind, TokenKind::Name(value) if value == name)
    }

    pub fn accept_operator(&mut self, operator: &str) -> Result<bool> {
        if self.test_operator(&[operator]) {
            self.advance()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub fn accept_name(&mut self, name: &str) -> Result<bool> {
        if self.test_name(name) {
            self.advance()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub fn expect_operator(&mut self, operators: &[&str]) -> Result<String> {
        if self.test_operator(operators) {
            match self.advance()?.kind {
                TokenKind::Operator(op) => Ok(op),
                _ => Err(Error::Internal("operator token expected".to_string())),
            }
        } else {
            Err(self.expectation_error(&operators
                .iter()
                .map(|op| format!("\"{}\"", op))
                .collect::<Vec<_>>()))
        }
    }

    pub fn expect_name(&mut self) -> Result<String> {
        match &self.token.kind {
            TokenKind::Name(_) => match self.advance()?.kind {
                TokenKind::Name(name) => Ok(name),
                _ => Err(Error::Internal("name token expected".to_string())),
            },
            _ => Err(self.expectation_error(&["NAME".to_string()])),
        }
    }

    /// Expect a numeric token and return it as a float (used by geometry
    /// coordinate parsing).
    pub fn expect_number(&mut self) -> Result<f64> {
        match self.token.kind {
            TokenKind::Integer(value) => {
                self.advance()?;
                Ok(value as f64)
            }
            TokenKind::Real(value) => {
                self.advance()?;
                Ok(value)
            }
            _ => Err(self.expectation_error(&["INTEGER".to_string(), "REAL".to_string()])),
        }
    }

    pub fn error_at(&self, message: &str) -> Error {
        Error::User(format!("char {}: {}", self.token.position + 1, message))
    }

    fn expectation_error(&self, expected: &[String]) -> Error {
        if self.at_end() {
            return self.error_at("unexpected end of input");
        }
        let expected = if expected.len() == 1 {
            expected[0].clone()
        } else {
            format!("one of: {}", expected.join(", "))
        };
        self.error_at(&format!(
            "expected {}, got {}",
            expected,
            self.token.kind.describe()
        ))
    }

    fn lex(&mut self) -> Result<Token> {
        let bytes = self.text.as_bytes();
        while self.offset < bytes.len() && bytes[self.offset].is_ascii_whitespace() {
            self.offset += 1;
        }
        let start = self.offset;

        if start == bytes.len() {
            return Ok(Token {
                kind: TokenKind::End,
                position: start,
            });
        }

        let rest = &self.text[start..];
        let first = bytes[start];

        let (kind, length) = if first == b'"' {
            self.lex_text(rest, start)?
        } else if first.is_ascii_digit() {
            if let Some(result) = lex_timestamp(rest, start)? {
                result
            } else if let Some(result) = lex_uuid(rest) {
                result
            } else if let Some(result) = lex_real(rest, start)? {
                result
            } else {
                lex_integer(rest, start)?
            }
        } else if first.is_ascii_alphabetic() {
            if let Some(result) = lex_uuid(rest) {
                result
            } else if rest.starts_with("not in") {
                (TokenKind::Operator("not in".to_string()), 6)
            } else {
                lex_name(rest)
            }
        } else if let Some(result) = lex_operator(rest) {
            result
        } else {
            return Err(Error::User(format!(
                "char {}: syntax error: \"{}\"",
                start + 1,
                rest
            )));
        };

        self.offset = start + length;
        Ok(Token {
            kind,
            position: start,
        })
    }

    fn lex_text(&self, rest: &str, start: usize) -> Result<(TokenKind, usize)> {
        let bytes = rest.as_bytes();
        let mut index = 1;
        while index < bytes.len() {
            match bytes[index] {
                b'"' => {
                    let raw = &rest[1..index];
                    return Ok((TokenKind::Text(string_unescape(raw)), index + 1));
                }
                b'\\' => index += 2,
                _ => index += 1,
            }
        }
        Err(Error::User(format!(
            "char {}: syntax error: \"{}\"",
            start + 1,
            rest
        )))
    }
}

/// Translate the C-style escape sequences of a text literal. Unknown escape
/// pairs are kept verbatim.
pub fn string_unescape(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            result.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => result.push('\\'),
            Some('\'') => result.push('\''),
            Some('"') => result.push('"'),
            Some('a') => result.push('\x07'),
            Some('b') => result.push('\x08'),
            Some('f') => result.push('\x0c'),
            Some('n') => result.push('\n'),
            Some('r') => result.push('\r'),
            Some('t') => result.push('\t'),
            Some('v') => result.push('\x0b'),
            Some(other) => {
                result.push('\\');
                result.push(other);
            }
            None => result.push('\\'),
        }
    }
    result
}

fn digits(bytes: &[u8], from: usize) -> usize {
    let mut index = from;
    while index < bytes.len() && bytes[index].is_ascii_digit() {
        index += 1;
    }
    index - from
}

fn match_exact_digits(bytes: &[u8], from: usize, count: usize) -> bool {
    bytes.len() >= from + count && bytes[from..from + count].iter().all(u8::is_ascii_digit)
}

/// Match `dddd-dd-dd` optionally followed by `Tdd:dd:dd` and up to six
/// fractional digits. Returns None when the shape does not fit.
fn lex_timestamp(rest: &str, start: usize) -> Result<Option<(TokenKind, usize)>> {
    let bytes = rest.as_bytes();
    let date_shape = match_exact_digits(bytes, 0, 4)
        && bytes.get(4) == Some(&b'-')
        && match_exact_digits(bytes, 5, 2)
        && bytes.get(7) == Some(&b'-')
        && match_exact_digits(bytes, 8, 2);
    if !date_shape {
        return Ok(None);
    }

    let mut length = 10;
    if bytes.get(10) == Some(&b'T')
        && match_exact_digits(bytes, 11, 2)
        && bytes.get(13) == Some(&b':')
        && match_exact_digits(bytes, 14, 2)
        && bytes.get(16) == Some(&b':')
        && match_exact_digits(bytes, 17, 2)
    {
        length = 19;
        if bytes.get(19) == Some(&b'.') {
            let fraction = digits(bytes, 20).min(6);
            length = 20 + fraction;
        }
    }

    let text = &rest[..length];
    Ok(Some((
        TokenKind::Timestamp(parse_timestamp(text, start)?),
        length,
    )))
}

pub fn parse_timestamp(text: &str, start: usize) -> Result<NaiveDateTime> {
    if is_min_timestamp(text) {
        return Ok(timestamp_min());
    }
    if is_max_timestamp(text) {
        return Ok(timestamp_max());
    }

    if text.len() == 10 {
        if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
            if let Some(datetime) = date.and_hms_opt(0, 0, 0) {
                return Ok(datetime);
            }
        }
    } else if let Ok(datetime) = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f") {
        return Ok(datetime);
    }

    Err(Error::User(format!(
        "char {}: invalid timestamp: \"{}\"",
        start + 1,
        text
    )))
}

fn is_min_timestamp(text: &str) -> bool {
    match text.strip_prefix("0000-00-00") {
        None => false,
        Some("") => true,
        Some(tail) => match tail.strip_prefix("T00:00:00") {
            None => false,
            Some("") => true,
            Some(fraction) => {
                fraction.starts_with('.')
                    && fraction.len() <= 7
                    && fraction[1..].bytes().all(|b| b == b'0')
            }
        },
    }
}

fn is_max_timestamp(text: &str) -> bool {
    match text.strip_prefix("9999-99-99") {
        None => false,
        Some("") => true,
        Some(tail) => match tail.strip_prefix("T99:99:99") {
            None => false,
            Some("") => true,
            Some(fraction) => {
                fraction.starts_with('.')
                    && fraction.len() <= 7
                    && fraction[1..].bytes().all(|b| b == b'9')
            }
        },
    }
}

fn lex_uuid(rest: &str) -> Option<(TokenKind, usize)> {
    let bytes = rest.as_bytes();
    let groups = [8usize, 4, 4, 4, 12];
    let mut index = 0;
    for (i, group) in groups.iter().enumerate() {
        if i > 0 {
            if bytes.get(index) != Some(&b'-') {
                return None;
            }
            index += 1;
        }
        for _ in 0..*group {
            if !bytes.get(index).is_some_and(u8::is_ascii_hexdigit) {
                return None;
            }
            index += 1;
        }
    }
    Uuid::parse_str(&rest[..index])
        .ok()
        .map(|uuid| (TokenKind::Uuid(uuid), index))
}

fn lex_real(rest: &str, start: usize) -> Result<Option<(TokenKind, usize)>> {
    let bytes = rest.as_bytes();
    let integral = digits(bytes, 0);
    let mut index = integral;
    let mut is_real = false;

    if bytes.get(index) == Some(&b'.') {
        is_real = true;
        index += 1;
        index += digits(bytes, index);
    }

    // optional exponent
    let exponent_start = index;
    if matches!(bytes.get(index), Some(b'e') | Some(b'E')) {
        let mut cursor = index + 1;
        if matches!(bytes.get(cursor), Some(b'+') | Some(b'-')) {
            cursor += 1;
        }
        let exponent_digits = digits(bytes, cursor);
        if exponent_digits > 0 {
            is_real = true;
            index = cursor + exponent_digits;
        } else {
            index = exponent_start;
        }
    }

    if !is_real {
        return Ok(None);
    }

    let text = &rest[..index];
    let value: f64 = text.parse().map_err(|_| {
        Error::User(format!("char {}: invalid real: \"{}\"", start + 1, text))
    })?;
    Ok(Some((TokenKind::Real(value), index)))
}

fn lex_integer(rest: &str, start: usize) -> Result<(TokenKind, usize)> {
    let bytes = rest.as_bytes();

    let (radix, prefix): (u32, usize) = if rest.starts_with("0x") || rest.starts_with("0X") {
        (16, 2)
    } else if rest.starts_with("0o") {
        (8, 2)
    } else if rest.starts_with("0b") {
        (2, 2)
    } else {
        (10, 0)
    };

    let mut index = prefix;
    while index < bytes.len() && (bytes[index] as char).is_digit(radix) {
        index += 1;
    }
    if index == prefix {
        // bare "0x" without digits: lex the leading zero as a decimal
        index = digits(bytes, 0);
    }

    let text = &rest[..index];
    let digits_text = &rest[if index > prefix { prefix } else { 0 }..index];
    let value = i64::from_str_radix(digits_text, if index > prefix { radix } else { 10 })
        .map_err(|_| Error::User(format!("char {}: invalid integer: \"{}\"", start + 1, text)))?;
    Ok((TokenKind::Integer(value), index))
}

fn lex_name(rest: &str) -> (TokenKind, usize) {
    let length = rest
        .bytes()
        .take_while(|b| b.is_ascii_alphanumeric() || *b == b'_')
        .count();
    let name = &rest[..length];
    let kind = match name {
        "true" => TokenKind::Boolean(true),
        "false" => TokenKind::Boolean(false),
        "in" => TokenKind::Operator("in".to_string()),
        _ => TokenKind::Name(name.to_string()),
    };
    (kind, length)
}

fn lex_operator(rest: &str) -> Option<(TokenKind, usize)> {
    for op in ["<=", ">=", "==", "!=", "~="] {
        if rest.starts_with(op) {
            return Some((TokenKind::Operator(op.to_string()), 2));
        }
    }
    let first = rest.as_bytes()[0];
    if b"*<>@()[],.+-/".contains(&first) {
        return Some((
            TokenKind::Operator((first as char).to_string()),
            1,
        ));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(text: &str) -> Vec<TokenKind> {
        let mut stream = TokenStream::new(text).unwrap();
        let mut result = Vec::new();
        while !stream.at_end() {
            result.push(stream.advance().unwrap().kind);
        }
        result
    }

    #[test]
    fn lexes_literals() {
        assert_eq!(
            kinds("42 0x1f 0o17 0b101 1.5 2e3 \"a\\tb\" true"),
            vec![
                TokenKind::Integer(42),
                TokenKind::Integer(31),
                TokenKind::Integer(15),
                TokenKind::Integer(5),
                TokenKind::Real(1.5),
                TokenKind::Real(2000.0),
                TokenKind::Text("a\tb".to_string()),
                TokenKind::Boolean(true),
            ]
        );
    }

    #[test]
    fn lexes_timestamps_and_uuids() {
        let tokens = kinds("2008-01-15T12:30:00.5 2008-01-15 32a61528-a712-427a-b28f-8ebd28cc1d44");
        match &tokens[0] {
            TokenKind::Timestamp(ts) => {
                assert_eq!(ts.format("%Y-%m-%dT%H:%M:%S%.f").to_string(), "2008-01-15T12:30:00.500")
            }
            other => panic!("unexpected token {:?}", other),
        }
        assert!(matches!(&tokens[1], TokenKind::Timestamp(_)));
        assert!(matches!(&tokens[2], TokenKind::Uuid(_)));
    }

    #[test]
    fn special_dates_map_to_extremes() {
        assert_eq!(
            kinds("0000-00-00"),
            vec![TokenKind::Timestamp(timestamp_min())]
        );
        assert_eq!(
            kinds("9999-99-99T99:99:99.999"),
            vec![TokenKind::Timestamp(timestamp_max())]
        );
    }

    #[test]
    fn not_in_is_one_operator() {
        assert_eq!(
            kinds("a not in b"),
            vec![
                TokenKind::Name("a".to_string()),
                TokenKind::Operator("not in".to_string()),
                TokenKind::Name("b".to_string()),
            ]
        );
        // "not" alone stays a name for the unary logical operator
        assert_eq!(
            kinds("not a"),
            vec![
                TokenKind::Name("not".to_string()),
                TokenKind::Name("a".to_string()),
            ]
        );
    }

    #[test]
    fn compound_operators_before_single() {
        assert_eq!(
            kinds("a<=1"),
            vec![
                TokenKind::Name("a".to_string()),
                TokenKind::Operator("<=".to_string()),
                TokenKind::Integer(1),
            ]
        );
    }

    #[test]
    fn rejects_garbage() {
        assert!(TokenStream::new("$").is_err());
        let mut stream = TokenStream::new("a $").unwrap();
        assert!(stream.advance().is_err());
    }
}
