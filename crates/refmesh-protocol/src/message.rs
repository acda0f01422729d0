use std::fmt;

use refmesh_refs::RefState;
use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, ProtocolResult};
use crate::refspec::RefSpec;

pub const PROTOCOL_VERSION: u32 = 1;

/// Method names used on the wire.
pub mod methods {
    pub const REPO_WATCH: &str = "repo/watch";
    pub const REF_INFO: &str = "ref/info";
    pub const REF_UPDATE: &str = "ref/update";
    pub const REF_UPDATE_SYMBOLIC: &str = "ref/updateSymbolic";
}

/// Addresses one ref in one repository on a peer.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RefIdentifier {
    pub repo: String,
    #[serde(rename = "ref")]
    pub ref_name: String,
}

impl RefIdentifier {
    pub fn new(repo: impl Into<String>, ref_name: impl Into<String>) -> Self {
        Self { repo: repo.into(), ref_name: ref_name.into() }
    }
}

impl fmt::Display for RefIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repo, self.ref_name)
    }
}

/// Subscribe to ref changes in a remote repository.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoWatchParams {
    pub repo: String,
    pub refspec: RefSpec,
}

/// A ref update sent from this server to its upstream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RefUpdateUpstreamParams {
    #[serde(flatten)]
    pub ref_id: RefIdentifier,
    /// Replace the upstream's value unconditionally.
    #[serde(default)]
    pub force: bool,
    /// New value; `None` deletes the ref.
    pub state: Option<RefState>,
}

impl RefUpdateUpstreamParams {
    pub fn forced(ref_id: RefIdentifier, state: RefState) -> Self {
        Self { ref_id, force: true, state: Some(state) }
    }

    pub fn validate(&self) -> ProtocolResult<()> {
        if self.force && self.state.is_none() {
            return Err(ProtocolError::InvalidParams {
                method: methods::REF_UPDATE,
                reason: format!("forced update of {} carries no state", self.ref_id),
            });
        }
        Ok(())
    }
}

/// A ref update pushed to this server by an upstream it watches.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RefUpdateDownstreamParams {
    #[serde(flatten)]
    pub ref_id: RefIdentifier,
    /// New value; `None` means the ref was deleted upstream.
    pub state: Option<RefState>,
}

/// A symbolic ref change pushed by an upstream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefUpdateSymbolicParams {
    #[serde(flatten)]
    pub ref_id: RefIdentifier,
    pub target: String,
    pub old_target: Option<String>,
}

/// Answer to a ref info request.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RefInfoResult {
    /// State of a direct ref.
    pub state: Option<RefState>,
    /// Target of a symbolic ref.
    pub target: Option<String>,
}

impl RefInfoResult {
    pub fn exists(&self) -> bool {
        self.state.is_some() || self.target.is_some()
    }
}
