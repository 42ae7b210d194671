//! Peer identifier: the short human-shareable connection code.
//!
//! Six characters drawn from a 32-symbol alphabet that excludes visually
//! ambiguous glyphs (no `I`/`O`, no `0`/`1`). Not cryptographically
//! secured: the collision space is 32^6 (~1.07e9), which is enough
//! because the signaling registry rejects duplicate registrations and the
//! connection manager regenerates on that specific conflict.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// The 32-symbol code alphabet: uppercase letters minus `I`/`O`, digits
/// minus `0`/`1`.
pub const CODE_ALPHABET: &[u8; 32] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Exact length of a peer identifier.
pub const CODE_LENGTH: usize = 6;

/// Separator inserted by [`PeerId::formatted`] between the two halves.
const GROUP_SEPARATOR: char = '-';

/// Structured reasons a candidate code fails validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentifierError {
    #[error("code is empty")]
    Empty,
    #[error("code must be {CODE_LENGTH} characters, got {0}")]
    WrongLength(usize),
    #[error("code contains character {0:?} outside the allowed alphabet")]
    InvalidCharacter(char),
}

/// A validated 6-character peer identifier.
///
/// Always stored normalized to uppercase; immutable once assigned to a
/// session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerId(String);

impl PeerId {
    /// Generate a fresh identifier, uniform over the alphabet.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let code: String = (0..CODE_LENGTH)
            .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
            .collect();
        Self(code)
    }

    /// Validate and normalize a candidate code.
    ///
    /// Trims surrounding whitespace, strips group separators, and
    /// uppercases before checking length and alphabet membership, so
    /// `"abc-de2"` and `" ABCDE2 "` both parse to the same identifier.
    pub fn parse(input: &str) -> Result<Self, IdentifierError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(IdentifierError::Empty);
        }

        let normalized: String = trimmed
            .chars()
            .filter(|c| *c != GROUP_SEPARATOR && !c.is_whitespace())
            .map(|c| c.to_ascii_uppercase())
            .collect();

        if normalized.len() != CODE_LENGTH {
            return Err(IdentifierError::WrongLength(normalized.len()));
        }
        if let Some(bad) = normalized
            .chars()
            .find(|c| !c.is_ascii() || !CODE_ALPHABET.contains(&(*c as u8)))
        {
            return Err(IdentifierError::InvalidCharacter(bad));
        }

        Ok(Self(normalized))
    }

    /// The raw 6-character code.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Cosmetic grouping for display and QR payloads: `ABC-DE2`.
    /// [`PeerId::parse`] is its inverse.
    pub fn formatted(&self) -> String {
        let (head, tail) = self.0.split_at(CODE_LENGTH / 2);
        format!("{head}{GROUP_SEPARATOR}{tail}")
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for PeerId {
    type Error = IdentifierError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PeerId> for String {
    fn from(id: PeerId) -> Self {
        id.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_validate() {
        for _ in 0..200 {
            let id = PeerId::generate();
            assert_eq!(id.as_str().len(), CODE_LENGTH);
            assert!(id
                .as_str()
                .bytes()
                .all(|b| CODE_ALPHABET.contains(&b)));
            assert_eq!(PeerId::parse(id.as_str()).unwrap(), id);
        }
    }

    #[test]
    fn format_round_trips() {
        let id = PeerId::parse("ABCDE2").unwrap();
        assert_eq!(id.formatted(), "ABC-DE2");
        assert_eq!(PeerId::parse(&id.formatted()).unwrap(), id);
    }

    #[test]
    fn parse_normalizes_case_and_whitespace() {
        let id = PeerId::parse("  abc-de2 ").unwrap();
        assert_eq!(id.as_str(), "ABCDE2");
    }

    #[test]
    fn parse_rejects_bad_input() {
        assert_eq!(PeerId::parse(""), Err(IdentifierError::Empty));
        assert_eq!(PeerId::parse("   "), Err(IdentifierError::Empty));
        assert_eq!(PeerId::parse("ABC"), Err(IdentifierError::WrongLength(3)));
        assert_eq!(
            PeerId::parse("ABCDE0"),
            Err(IdentifierError::InvalidCharacter('0'))
        );
        assert_eq!(
            PeerId::parse("ABCDEI"),
            Err(IdentifierError::InvalidCharacter('I'))
        );
    }

    #[test]
    fn serde_round_trip() {
        let id = PeerId::parse("XYZ234").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"XYZ234\"");
        let back: PeerId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
