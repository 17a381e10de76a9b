use crate::error::GatewayError;
use std::fmt;

/// A route's path predicate.
///
/// `/users/**` matches `/users` and anything below `/users/`, but not
/// `/usersettings`. `/**` matches every path. A pattern without `**` is a
/// plain, case-sensitive string prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern {
    raw: String,
    prefix: String,
    segment_aware: bool,
}

impl PathPattern {
    pub fn parse(raw: &str) -> Result<Self, GatewayError> {
        if !raw.starts_with('/') {
            return Err(GatewayError::Config(format!(
                "path pattern '{}' must start with '/'",
                raw
            )));
        }
        let (prefix, segment_aware) = match raw.strip_suffix("/**") {
            Some(p) => (p, true),
            None => (raw, false),
        };
        if prefix.contains('*') {
            return Err(GatewayError::Config(format!(
                "path pattern '{}': '**' is only supported as the last segment",
                raw
            )));
        }
        Ok(Self {
            raw: raw.to_string(),
            prefix: prefix.to_string(),
            segment_aware,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Literal prefix length, used to rank overlapping patterns.
    pub fn specificity(&self) -> usize {
        self.prefix.len()
    }

    pub fn matches(&self, path: &str) -> bool {
        if !self.segment_aware {
            return path.starts_with(&self.prefix);
        }
        match path.strip_prefix(self.prefix.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }
}

impl fmt::Display for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
