//! Shell-style host patterns.
//!
//! # Syntax
//! - `*` matches any run of characters (including none)
//! - `?` matches exactly one character
//! - `[abc]`, `[a-z]`, `[^a-z]` / `[!a-z]` match one character from a class
//! - `\x` matches `x` literally
//!
//! No character acts as a separator: hostnames contain no `/`, so `*`
//! happily spans dots (`*.example.com` matches `a.b.example.com`).
//! Matching is case-sensitive.

use std::cmp::Reverse;
use std::fmt;

/// Error returned for syntactically invalid patterns.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatternError {
    #[error("pattern is empty")]
    Empty,
    #[error("unterminated character class")]
    UnclosedClass,
    #[error("dangling escape at end of pattern")]
    TrailingEscape,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(char),
    AnyChar,
    AnyRun,
    Class { negated: bool, ranges: Vec<(char, char)> },
}

impl Token {
    fn matches(&self, c: char) -> bool {
        match self {
            Token::Literal(l) => *l == c,
            Token::AnyChar => true,
            Token::AnyRun => false,
            Token::Class { negated, ranges } => {
                ranges.iter().any(|(lo, hi)| (*lo..=*hi).contains(&c)) != *negated
            }
        }
    }
}

/// A compiled vhost pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPattern {
    raw: String,
    tokens: Vec<Token>,
}

impl HostPattern {
    /// Compile a pattern, rejecting malformed classes and escapes.
    pub fn parse(raw: &str) -> Result<Self, PatternError> {
        if raw.is_empty() {
            return Err(PatternError::Empty);
        }

        let mut tokens = Vec::new();
        let mut chars = raw.chars().peekable();
        while let Some(c) = chars.next() {
            let token = match c {
                '*' => Token::AnyRun,
                '?' => Token::AnyChar,
                '\\' => Token::Literal(chars.next().ok_or(PatternError::TrailingEscape)?),
                '[' => {
                    let negated = matches!(chars.peek(), Some('^') | Some('!'));
                    if negated {
                        chars.next();
                    }
                    let mut ranges = Vec::new();
                    loop {
                        let lo = match chars.next() {
                            None => return Err(PatternError::UnclosedClass),
                            Some(']') if !ranges.is_empty() => break,
                            Some('\\') => chars.next().ok_or(PatternError::TrailingEscape)?,
                            Some(other) => other,
                        };
                        let hi = if chars.peek() == Some(&'-') {
                            chars.next();
                            match chars.next() {
                                None => return Err(PatternError::UnclosedClass),
                                Some('\\') => chars.next().ok_or(PatternError::TrailingEscape)?,
                                Some(other) => other,
                            }
                        } else {
                            lo
                        };
                        ranges.push((lo, hi));
                    }
                    Token::Class { negated, ranges }
                }
                other => Token::Literal(other),
            };
            // Consecutive stars are equivalent to one.
            if token == Token::AnyRun && tokens.last() == Some(&Token::AnyRun) {
                continue;
            }
            tokens.push(token);
        }

        Ok(Self {
            raw: raw.to_string(),
            tokens,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// True when the pattern contains no wildcard or class.
    pub fn is_literal(&self) -> bool {
        self.tokens.iter().all(|t| matches!(t, Token::Literal(_)))
    }

    /// Number of literal characters in the pattern.
    pub fn literal_len(&self) -> usize {
        self.tokens
            .iter()
            .filter(|t| matches!(t, Token::Literal(_)))
            .count()
    }

    /// Ordering key: literal patterns first, then more literal characters.
    /// Equal keys keep declaration order.
    pub fn precedence(&self) -> (bool, Reverse<usize>) {
        (!self.is_literal(), Reverse(self.literal_len()))
    }

    /// Match a whole hostname against the pattern.
    pub fn matches(&self, host: &str) -> bool {
        let text: Vec<char> = host.chars().collect();
        let mut t = 0;
        let mut s = 0;
        // Position of the last `*` and the text index it currently ends at.
        let mut star: Option<(usize, usize)> = None;

        while s < text.len() {
            match self.tokens.get(t) {
                Some(Token::AnyRun) => {
                    star = Some((t, s));
                    t += 1;
                    continue;
                }
                Some(token) if token.matches(text[s]) => {
                    t += 1;
                    s += 1;
                    continue;
                }
                _ => {}
            }
            match star {
                Some((star_t, star_s)) => {
                    t = star_t + 1;
                    s = star_s + 1;
                    star = Some((star_t, star_s + 1));
                }
                None => return false,
            }
        }

        self.tokens[t..].iter().all(|token| *token == Token::AnyRun)
    }
}

impl fmt::Display for HostPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
