use crate::error::ConfigurationError;
use regex::Regex;

/// Kind of pattern a matcher was built from
#[derive(Debug, Clone, PartialEq, Eq)]
enum MatcherKind {
  /// Case-insensitive exact name
  Literal,
  /// Glob over the full name, `*` matches any run of characters
  Wildcard,
  /// Explicit regular expression, `re:` prefix in config
  Regex,
}

#[derive(Debug, Clone)]
/// Predicate over a hostname, used by allow/block lists.
///
/// Pattern syntax: `re:<regex>` compiles the remainder as a regular expression;
/// a pattern containing `*` is a glob over the whole name; anything else is a
/// case-insensitive literal.
pub struct Matcher {
  /// Original pattern as written in the configuration
  pattern: String,
  kind: MatcherKind,
  /// Compiled form for Wildcard and Regex kinds
  regex: Option<Regex>,
}

impl Matcher {
  /// Build a matcher from its config pattern
  pub fn parse(pattern: &str) -> Result<Self, ConfigurationError> {
    let invalid = |_| ConfigurationError::InvalidMatcher {
      pattern: pattern.to_string(),
    };

    if let Some(raw) = pattern.strip_prefix("re:") {
      let regex = Regex::new(raw).map_err(invalid)?;
      return Ok(Self {
        pattern: pattern.to_string(),
        kind: MatcherKind::Regex,
        regex: Some(regex),
      });
    }

    if pattern.contains('*') {
      let mut translated = String::with_capacity(pattern.len() + 8);
      translated.push_str("(?i)^");
      for (i, part) in pattern.split('*').enumerate() {
        if i > 0 {
          translated.push_str(".*");
        }
        translated.push_str(&regex::escape(part));
      }
      translated.push('$');
      let regex = Regex::new(&translated).map_err(invalid)?;
      return Ok(Self {
        pattern: pattern.to_string(),
        kind: MatcherKind::Wildcard,
        regex: Some(regex),
      });
    }

    Ok(Self {
      pattern: pattern.to_string(),
      kind: MatcherKind::Literal,
      regex: None,
    })
  }

  /// Test a candidate name against this matcher
  pub fn matches(&self, name: &str) -> bool {
    match self.kind {
      MatcherKind::Literal => self.pattern.eq_ignore_ascii_case(name),
      MatcherKind::Wildcard | MatcherKind::Regex => self.regex.as_ref().is_some_and(|r| r.is_match(name)),
    }
  }

  /// The pattern as written in the configuration
  pub fn pattern(&self) -> &str {
    &self.pattern
  }
}

impl PartialEq for Matcher {
  fn eq(&self, other: &Self) -> bool {
    self.pattern == other.pattern && self.kind == other.kind
  }
}
impl Eq for Matcher {}

impl std::fmt::Display for Matcher {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.pattern)
  }
}

impl serde::Serialize for Matcher {
  fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&self.pattern)
  }
}

impl<'de> serde::Deserialize<'de> for Matcher {
  fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let pattern = String::deserialize(deserializer)?;
    Matcher::parse(&pattern).map_err(serde::de::Error::custom)
  }
}
