//! Wildcard byte patterns such as `"E8 ? ? ? ?"`.

use std::fmt;
use std::str::FromStr;

use crate::formats::pe::types::PeError;

/// A parsed byte pattern; `None` entries match any byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BytePattern {
    bytes: Vec<Option<u8>>,
}

impl BytePattern {
    /// Parse space separated hex pairs with `?` (or `??`) wildcards.
    pub fn parse(text: &str) -> Result<Self, PeError> {
        let mut bytes = Vec::new();
        for token in text.split_whitespace() {
            if token == "?" || token == "??" {
                bytes.push(None);
                continue;
            }
            let decoded = hex::decode(token)
                .map_err(|e| PeError::InvalidPattern(format!("{token}: {e}")))?;
            if decoded.len() != 1 {
                return Err(PeError::InvalidPattern(format!(
                    "{token}: expected a single byte"
                )));
            }
            bytes.push(Some(decoded[0]));
        }
        if bytes.is_empty() {
            return Err(PeError::InvalidPattern("empty pattern".to_string()));
        }
        Ok(Self { bytes })
    }

    /// Exact pattern for a run of one repeated byte
    pub fn repeated(value: u8, len: usize) -> Self {
        Self {
            bytes: vec![Some(value); len],
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[inline]
    pub fn matches_at(&self, haystack: &[u8], at: usize) -> bool {
        match haystack.get(at..at + self.bytes.len()) {
            Some(window) => self
                .bytes
                .iter()
                .zip(window)
                .all(|(p, b)| p.map_or(true, |v| v == *b)),
            None => false,
        }
    }

    /// Every non-overlapping match start, scanning left to right.
    pub fn find_all(&self, haystack: &[u8]) -> Vec<usize> {
        let mut out = Vec::new();
        let Some(last_start) = haystack.len().checked_sub(self.bytes.len()) else {
            return out;
        };

        // Anchor on the first concrete byte so memchr can skip ahead.
        let anchor = self
            .bytes
            .iter()
            .enumerate()
            .find_map(|(i, b)| b.map(|v| (i, v)));

        let mut pos = 0usize;
        while pos <= last_start {
            let candidate = match anchor {
                Some((idx, value)) => {
                    match memchr::memchr(value, &haystack[pos + idx..=last_start + idx]) {
                        Some(hit) => pos + hit,
                        None => break,
                    }
                }
                None => pos,
            };
            if self.matches_at(haystack, candidate) {
                out.push(candidate);
                pos = candidate + self.bytes.len();
            } else {
                pos = candidate + 1;
            }
        }
        out
    }
}

impl FromStr for BytePattern {
    type Err = PeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for BytePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.bytes.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            match b {
                Some(v) => write!(f, "{:02X}", v)?,
                None => f.write_str("?")?,
            }
        }
        Ok(())
    }
}
