//! Per-repository ref database.
//!
//! [`RefDb`] keeps every ref of one repository in a `BTreeMap`. It does no
//! locking of its own: the owning repository's lock guards it together with
//! the repository configuration, so a reader sees refs and config from the
//! same instant.

use std::collections::BTreeMap;

use crate::error::{RefError, Result};
use crate::names::validate_ref_name;
use crate::types::{Ref, RefState};

/// Maximum symbolic indirections followed by [`RefDb::resolve`].
const MAX_SYMBOLIC_DEPTH: usize = 8;

/// In-memory ref database for a single repository.
#[derive(Clone, Debug, Default)]
pub struct RefDb {
    refs: BTreeMap<String, Ref>,
}

impl RefDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a ref by name without following symbolic refs.
    pub fn lookup(&self, name: &str) -> Option<&Ref> {
        self.refs.get(name)
    }

    /// The state of a direct ref, or `None` if it is missing or symbolic.
    pub fn state(&self, name: &str) -> Option<&RefState> {
        self.refs.get(name).and_then(Ref::state)
    }

    /// Create or replace a direct ref.
    pub fn write(&mut self, name: &str, state: RefState) -> Result<()> {
        validate_ref_name(name)?;
        if let Some(existing @ Ref::Symbolic { .. }) = self.refs.get(name) {
            return Err(RefError::KindConflict {
                name: name.to_string(),
                existing: existing.kind(),
            });
        }
        tracing::trace!(ref_name = name, history = state.history.len(), "write ref");
        self.refs.insert(
            name.to_string(),
            Ref::Direct {
                name: name.to_string(),
                state,
            },
        );
        Ok(())
    }

    /// Point a symbolic ref at `target`. The target must be a direct ref.
    pub fn set_symbolic(&mut self, name: &str, target: &str) -> Result<()> {
        validate_ref_name(name)?;
        if let Some(existing @ Ref::Direct { .. }) = self.refs.get(name) {
            return Err(RefError::KindConflict {
                name: name.to_string(),
                existing: existing.kind(),
            });
        }
        if self.state(target).is_none() {
            return Err(RefError::DanglingSymbolic {
                name: name.to_string(),
                target: target.to_string(),
            });
        }
        self.refs.insert(
            name.to_string(),
            Ref::Symbolic {
                name: name.to_string(),
                target: target.to_string(),
            },
        );
        Ok(())
    }

    /// Follow symbolic refs until a direct ref is reached.
    pub fn resolve(&self, name: &str) -> Result<(&str, &RefState)> {
        let mut current = name;
        for _ in 0..MAX_SYMBOLIC_DEPTH {
            match self.refs.get(current) {
                Some(Ref::Direct { name, state }) => return Ok((name.as_str(), state)),
                Some(Ref::Symbolic { target, .. }) => current = target,
                None if current == name => {
                    return Err(RefError::NotFound {
                        name: name.to_string(),
                    })
                }
                None => {
                    return Err(RefError::DanglingSymbolic {
                        name: name.to_string(),
                        target: current.to_string(),
                    })
                }
            }
        }
        Err(RefError::DanglingSymbolic {
            name: name.to_string(),
            target: current.to_string(),
        })
    }

    /// Delete a ref. Returns `true` if it existed.
    pub fn delete(&mut self, name: &str) -> bool {
        self.refs.remove(name).is_some()
    }

    /// All refs whose name starts with `prefix`, sorted by name.
    pub fn list(&self, prefix: &str) -> Vec<&Ref> {
        self.refs
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(_, v)| v)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }
}
