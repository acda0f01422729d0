use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, ProtocolResult};

/// A pattern selecting which refs of a repository to watch.
///
/// Either an exact ref name or a pattern with a single `*` that matches any
/// (possibly empty) run of characters, e.g. `*`, `branch/*`, `*/wip`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RefSpec {
    pattern: String,
}

impl RefSpec {
    /// Matches every ref.
    pub fn all() -> Self {
        Self { pattern: "*".into() }
    }

    /// Parse "branch/*" or "main".
    pub fn parse(s: &str) -> ProtocolResult<Self> {
        if s.is_empty() {
            return Err(ProtocolError::InvalidRefSpec {
                spec: s.into(),
                reason: "refspec must not be empty".into(),
            });
        }
        if s.matches('*').count() > 1 {
            return Err(ProtocolError::InvalidRefSpec {
                spec: s.into(),
                reason: "at most one '*' is allowed".into(),
            });
        }
        Ok(Self { pattern: s.into() })
    }

    pub fn as_str(&self) -> &str {
        &self.pattern
    }

    pub fn matches(&self, ref_name: &str) -> bool {
        match self.pattern.split_once('*') {
            None => self.pattern == ref_name,
            Some((prefix, suffix)) => {
                ref_name.len() >= prefix.len() + suffix.len()
                    && ref_name.starts_with(prefix)
                    && ref_name.ends_with(suffix)
            }
        }
    }
}

impl Default for RefSpec {
    fn default() -> Self {
        Self::all()
    }
}

impl FromStr for RefSpec {
    type Err = ProtocolError;

    fn from_str(s: &str) -> ProtocolResult<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for RefSpec {
    type Error = ProtocolError;

    fn try_from(s: String) -> ProtocolResult<Self> {
        Self::parse(&s)
    }
}

impl From<RefSpec> for String {
    fn from(spec: RefSpec) -> Self {
        spec.pattern
    }
}

impl fmt::Display for RefSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pattern)
    }
}
