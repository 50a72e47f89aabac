//! Value types stored in [`RelayConfig`](super::RelayConfig).

use std::fmt;
use std::ops::Deref;

use glob::Pattern;

/// Capacity of every string setting, in bytes.
pub const MAX_STRING_LEN: usize = 1023;

/// An owned string that never exceeds [`MAX_STRING_LEN`] bytes.
///
/// Longer input is truncated at the last char boundary that fits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct BoundedString(String);

impl BoundedString {
    #[must_use]
    pub fn new(value: &str) -> Self {
        if value.len() <= MAX_STRING_LEN {
            return Self(value.to_string());
        }
        let mut end = MAX_STRING_LEN;
        while !value.is_char_boundary(end) {
            end -= 1;
        }
        Self(value[..end].to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether `value` would be truncated when stored.
    #[must_use]
    pub fn would_truncate(value: &str) -> bool {
        value.len() > MAX_STRING_LEN
    }
}

impl Deref for BoundedString {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for BoundedString {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl fmt::Display for BoundedString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ordered list of compiled glob patterns, e.g. the local hostgroups.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatternList(Vec<Pattern>);

impl PatternList {
    #[must_use]
    pub fn new(patterns: Vec<Pattern>) -> Self {
        Self(patterns)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Pattern> {
        self.0.iter()
    }

    /// Whether any pattern matches `name`.
    #[must_use]
    pub fn matches_any(&self, name: &str) -> bool {
        self.0.iter().any(|p| p.matches(name))
    }

    /// The source text of each pattern, in order.
    #[must_use]
    pub fn sources(&self) -> Vec<&str> {
        self.0.iter().map(Pattern::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_string_kept() {
        let s = BoundedString::new("localhost");
        assert_eq!(s.as_str(), "localhost");
        assert!(!BoundedString::would_truncate("localhost"));
    }

    #[test]
    fn test_long_string_truncated() {
        let long = "a".repeat(5000);
        let s = BoundedString::new(&long);
        assert_eq!(s.len(), MAX_STRING_LEN);
        assert!(BoundedString::would_truncate(&long));
    }

    #[test]
    fn test_truncation_respects_char_boundary() {
        // 'é' is two bytes; 1022 ASCII + 'é' is 1024 bytes.
        let value = format!("{}é", "a".repeat(MAX_STRING_LEN - 1));
        let s = BoundedString::new(&value);
        assert_eq!(s.len(), MAX_STRING_LEN - 1);
        assert!(s.chars().all(|c| c == 'a'));
    }

    #[test]
    fn test_pattern_list_matching() {
        let list = PatternList::new(vec![
            Pattern::new("web-*").unwrap(),
            Pattern::new("db?").unwrap(),
        ]);
        assert!(list.matches_any("web-frontend"));
        assert!(list.matches_any("db1"));
        assert!(!list.matches_any("db10"));
        assert_eq!(list.sources(), vec!["web-*", "db?"]);
    }

    #[test]
    fn test_empty_pattern_list_matches_nothing() {
        let list = PatternList::default();
        assert!(list.is_empty());
        assert!(!list.matches_any("anything"));
    }
}
