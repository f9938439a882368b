//! Text analysis: turning field values and query text into position-tagged
//! terms. Analyzer libraries proper are external; the engine carries the two
//! built-in analyzers every index can rely on.

use serde::{Deserialize, Serialize};

/// A single analyzed token with its position in the source text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub term: String,
    pub position: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Analyzer {
    /// Lowercases and splits on any non-alphanumeric rune.
    Standard,
    /// Emits the input verbatim as a single token.
    Keyword,
}

impl Analyzer {
    /// Resolve an analyzer by its configured name. Unknown names fall back
    /// to the standard analyzer; the external analyzer registry owns real
    /// custom analyzers.
    pub fn by_name(name: Option<&str>) -> Analyzer {
        match name {
            Some("keyword") => Analyzer::Keyword,
            _ => Analyzer::Standard,
        }
    }

    pub fn analyze(&self, text: &str) -> Vec<Token> {
        match self {
            Analyzer::Keyword => {
                if text.is_empty() {
                    Vec::new()
                } else {
                    vec![Token {
                        term: text.to_string(),
                        position: 0,
                    }]
                }
            }
            Analyzer::Standard => {
                let mut tokens = Vec::new();
                let mut position = 0u32;
                let mut current = String::new();
                for ch in text.chars() {
                    if ch.is_alphanumeric() {
                        current.extend(ch.to_lowercase());
                    } else if !current.is_empty() {
                        tokens.push(Token {
                            term: std::mem::take(&mut current),
                            position,
                        });
                        position += 1;
                    }
                }
                if !current.is_empty() {
                    tokens.push(Token {
                        term: current,
                        position,
                    });
                }
                tokens
            }
        }
    }
}
