//! Core ref types.
//!
//! A ref is either direct (it carries a [`RefState`]) or symbolic (it names
//! another ref). Only direct refs are ever sent to a remote endpoint.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{RefError, Result};

/// The revision a ref's history is based on.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefBaseInfo {
    /// Base revision (commit id) the history applies on top of.
    pub git_base: String,
    /// Branch the base revision was taken from.
    pub git_branch: String,
}

/// One entry in a ref's operation history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Position in the history, starting at 0.
    pub seq: u64,
    /// Who produced the entry.
    pub author: String,
    /// When the entry was recorded.
    pub timestamp: DateTime<Utc>,
    /// Opaque operation body.
    pub payload: Value,
}

impl LogEntry {
    pub fn new(seq: u64, author: impl Into<String>, payload: Value) -> Self {
        Self {
            seq,
            author: author.into(),
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// The current value of a direct ref.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RefState {
    #[serde(flatten)]
    pub base: RefBaseInfo,
    pub history: Vec<LogEntry>,
}

impl RefState {
    /// A ref state with an empty history.
    pub fn new(git_base: impl Into<String>, git_branch: impl Into<String>) -> Self {
        Self {
            base: RefBaseInfo {
                git_base: git_base.into(),
                git_branch: git_branch.into(),
            },
            history: Vec::new(),
        }
    }

    /// Sequence number the next appended entry must carry.
    pub fn next_seq(&self) -> u64 {
        self.history.last().map(|e| e.seq + 1).unwrap_or(0)
    }

    /// Append an entry, rejecting it if it does not continue the history.
    pub fn append(&mut self, name: &str, entry: LogEntry) -> Result<()> {
        let expected = self.next_seq();
        if entry.seq != expected {
            return Err(RefError::HistoryGap {
                name: name.to_string(),
                expected,
                actual: entry.seq,
            });
        }
        self.history.push(entry);
        Ok(())
    }
}

/// A named ref as stored in a [`RefDb`](crate::RefDb).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Ref {
    /// A ref carrying its own state.
    Direct { name: String, state: RefState },
    /// A local-only alias for another ref.
    Symbolic { name: String, target: String },
}

impl Ref {
    pub fn name(&self) -> &str {
        match self {
            Ref::Direct { name, .. } | Ref::Symbolic { name, .. } => name,
        }
    }

    pub fn is_symbolic(&self) -> bool {
        matches!(self, Ref::Symbolic { .. })
    }

    /// The state of a direct ref, `None` for symbolic refs.
    pub fn state(&self) -> Option<&RefState> {
        match self {
            Ref::Direct { state, .. } => Some(state),
            Ref::Symbolic { .. } => None,
        }
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Ref::Direct { .. } => "direct",
            Ref::Symbolic { .. } => "symbolic",
        }
    }
}
