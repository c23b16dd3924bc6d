//! Hierarchical group resolution over parent-pointer forests.
//!
//! User groups and backend groups both form forests: a nullable
//! `parent_group_id` per node, cycles forbidden. Expansion walks the parent
//! chain with revisit detection so a corrupted store cannot hang a worker.

use std::collections::{HashMap, HashSet};

use thiserror::Error;

#[derive(Debug, Error, Eq, PartialEq)]
pub enum CycleError {
    #[error("group {0} is part of a parent cycle")]
    Detected(i64),
    #[error("setting parent {parent} on group {node} would create a cycle")]
    WouldCreate { node: i64, parent: i64 },
}

/// The set of `start_id` plus all its ancestors, following `parent_of`.
///
/// Fails with [`CycleError::Detected`] when a node is reached twice.
pub fn ancestor_closure(start_id: i64, parent_of: &HashMap<i64, Option<i64>>) -> Result<HashSet<i64>, CycleError> {
    let mut seen = HashSet::new();
    let mut current = Some(start_id);

    while let Some(id) = current {
        if !seen.insert(id) {
            return Err(CycleError::Detected(id));
        }
        current = parent_of.get(&id).copied().flatten();
    }

    Ok(seen)
}

/// Expands direct memberships into the transitive closure of groups.
pub fn expand_memberships(
    direct: &[i64],
    parent_of: &HashMap<i64, Option<i64>>,
) -> Result<HashSet<i64>, CycleError> {
    let mut all = HashSet::new();
    for &group_id in direct {
        all.extend(ancestor_closure(group_id, parent_of)?);
    }
    Ok(all)
}

/// Verifies that `parent_of[node] := new_parent` keeps the forest acyclic.
///
/// Meant for the edge-insert boundary: call before persisting a parent
/// change. `new_parent = None` always succeeds.
pub fn validate_no_cycle(
    node: i64,
    new_parent: Option<i64>,
    parent_of: &HashMap<i64, Option<i64>>,
) -> Result<(), CycleError> {
    let Some(parent) = new_parent else {
        return Ok(());
    };

    if parent == node {
        return Err(CycleError::WouldCreate { node, parent });
    }

    // Walk up from the candidate parent; hitting `node` means the new edge
    // would close a loop.
    let mut seen = HashSet::new();
    let mut current = Some(parent);

    while let Some(id) = current {
        if id == node {
            return Err(CycleError::WouldCreate { node, parent });
        }
        if !seen.insert(id) {
            return Err(CycleError::Detected(id));
        }
        current = parent_of.get(&id).copied().flatten();
    }

    Ok(())
}
