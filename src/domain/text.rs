//! Input text rules and the content-addressed key derived from them.
//!
//! Validation runs on the raw input before anything is hashed or touched on
//! disk. Normalization folds line breaks into spaces so that the same spoken
//! content always maps to the same [`ContentKey`], independent of how the
//! caller wrapped it.

use std::fmt;

use sha2::{Digest, Sha256};
use thiserror::Error;

/// File extension of every rendered artifact.
pub const ARTIFACT_EXTENSION: &str = "wav";

/// Reasons a submission is refused before any work is scheduled.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InputError {
    #[error("input text must be nonempty")]
    Empty,
    #[error("input text length {length} exceeds maximum {max}")]
    TooLong { length: usize, max: usize },
}

/// Check the raw input against the emptiness and length rules.
///
/// Length is counted in characters of the raw text; exactly `max_len` is
/// accepted.
pub fn validate(raw: &str, max_len: usize) -> Result<&str, InputError> {
    if raw.trim().is_empty() {
        return Err(InputError::Empty);
    }

    let length = raw.chars().count();
    if length > max_len {
        return Err(InputError::TooLong {
            length,
            max: max_len,
        });
    }

    Ok(raw)
}

/// Replace every carriage return and line feed with a space.
///
/// Each break maps to exactly one space, so wrapping text with `\n` where it
/// had a space never changes its key.
pub fn normalize(text: &str) -> String {
    text.chars()
        .map(|ch| if ch == '\r' || ch == '\n' { ' ' } else { ch })
        .collect()
}

/// Deterministic fingerprint of normalized text: lower-case hex SHA-256.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentKey(String);

impl ContentKey {
    pub fn from_normalized(text: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the artifact file stored for this key.
    pub fn file_name(&self) -> String {
        format!("{}.{ARTIFACT_EXTENSION}", self.0)
    }
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_and_blank_text() {
        assert_eq!(validate("", 10), Err(InputError::Empty));
        assert_eq!(validate("   \t\r\n ", 10), Err(InputError::Empty));
    }

    #[test]
    fn length_limit_is_inclusive() {
        assert!(validate("abcde", 5).is_ok());
        assert_eq!(
            validate("abcdef", 5),
            Err(InputError::TooLong { length: 6, max: 5 })
        );
    }

    #[test]
    fn length_counts_characters_not_bytes() {
        let text = "héllo";
        assert_eq!(text.len(), 6);
        assert!(validate(text, 5).is_ok());
    }

    #[test]
    fn normalize_replaces_each_line_break() {
        assert_eq!(normalize("one\ntwo"), "one two");
        assert_eq!(normalize("one\r\ntwo\n\nthree"), "one  two  three");
        assert_eq!(normalize("no breaks"), "no breaks");
    }

    #[test]
    fn normalize_is_idempotent() {
        let once = normalize("a\r\n\rb\nc");
        assert_eq!(normalize(&once), once);
    }

    #[test]
    fn newline_and_space_variants_share_a_key() {
        for text in ["hello\nworld", "a\n\nb", "x\r\ny\n"] {
            let wrapped = ContentKey::from_normalized(&normalize(text));
            let flat = ContentKey::from_normalized(&normalize(&text.replace('\n', " ")));
            assert_eq!(wrapped, flat, "{text:?}");
        }
    }

    #[test]
    fn key_is_hex_sha256() {
        let key = ContentKey::from_normalized("abc");
        assert_eq!(
            key.as_str(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(
            key.file_name(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad.wav"
        );
    }
}
