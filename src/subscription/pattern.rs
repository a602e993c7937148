//! Topic patterns and share names
//!
//! A pattern is a `/`-separated list of levels. `+` matches exactly one
//! level and `#` matches any number of trailing levels (including none).
//! Both wildcards must occupy a whole level, and `#` may only be the last
//! level.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicPattern(String);

impl TopicPattern {
    /// Validate `pattern`, returning the reason it is malformed on failure.
    pub fn parse(pattern: &str) -> Result<Self, String> {
        if pattern.is_empty() {
            return Err("topic pattern must not be empty".to_string());
        }
        if pattern.contains('\0') {
            return Err("topic pattern must not contain NUL characters".to_string());
        }

        let levels: Vec<&str> = pattern.split('/').collect();
        let last = levels.len() - 1;
        for (i, level) in levels.iter().enumerate() {
            if level.contains('#') && (*level != "#" || i != last) {
                return Err(format!(
                    "'#' must occupy the whole of the last level, found '{level}'"
                ));
            }
            if level.contains('+') && *level != "+" {
                return Err(format!("'+' must occupy a whole level, found '{level}'"));
            }
        }
        Ok(Self(pattern.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn has_wildcards(&self) -> bool {
        self.0.split('/').any(|l| l == "+" || l == "#")
    }

    /// Whether a concrete topic falls under this pattern.
    pub fn matches(&self, topic: &str) -> bool {
        let mut filter = self.0.split('/');
        let mut levels = topic.split('/');
        loop {
            match (filter.next(), levels.next()) {
                (Some("#"), _) => return true,
                (Some("+"), Some(_)) => {}
                (Some(f), Some(t)) if f == t => {}
                (None, None) => return true,
                _ => return false,
            }
        }
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Validate a share name, returning the reason it is rejected on failure.
pub fn validate_share(share: &str) -> Result<(), String> {
    if share.is_empty() {
        return Err("share name must not be empty".to_string());
    }
    if share.contains(':') {
        return Err(format!("share name '{share}' must not contain a colon (:)"));
    }
    if share.contains('\0') {
        return Err("share name must not contain NUL characters".to_string());
    }
    Ok(())
}
