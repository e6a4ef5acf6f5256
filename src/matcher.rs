// src/matcher.rs
//! Pluggable detection of structured tokens (addresses, mints, ...) in free text.
//!
//! The coordinator treats matcher output as an opaque set of candidates; each
//! distinct candidate becomes its own dedup key. Matchers are versioned so a
//! heuristic change is visible in logs and pinned in tests.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

pub trait MatcherPlugin: Send + Sync {
    /// Stable identifier of the heuristic, e.g. `base58-address/v1`.
    fn version(&self) -> &'static str;

    /// Distinct candidates in order of first appearance. False negatives are fine.
    fn detect_patterns(&self, text: &str) -> Vec<String>;
}

static BASE58_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[1-9A-HJ-NP-Za-km-z]{32,44}\b").expect("base58 regex"));

/// Solana-style base58 addresses (32–44 chars).
///
/// Requires at least one digit, one lowercase and one uppercase letter, which
/// rejects long words and plain numbers that happen to fit the alphabet.
#[derive(Debug, Default, Clone, Copy)]
pub struct Base58AddressMatcher;

impl Base58AddressMatcher {
    fn plausible(token: &str) -> bool {
        token.bytes().any(|b| b.is_ascii_digit())
            && token.bytes().any(|b| b.is_ascii_lowercase())
            && token.bytes().any(|b| b.is_ascii_uppercase())
    }
}

impl MatcherPlugin for Base58AddressMatcher {
    fn version(&self) -> &'static str {
        "base58-address/v1"
    }

    fn detect_patterns(&self, text: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        BASE58_TOKEN
            .find_iter(text)
            .map(|m| m.as_str())
            .filter(|t| Self::plausible(t))
            .filter(|t| seen.insert(t.to_string()))
            .map(str::to_string)
            .collect()
    }
}

/// Matches nothing. Useful for deployments that only run content streams.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMatcher;

impl MatcherPlugin for NoopMatcher {
    fn version(&self) -> &'static str {
        "noop/v1"
    }

    fn detect_patterns(&self, _text: &str) -> Vec<String> {
        Vec::new()
    }
}
