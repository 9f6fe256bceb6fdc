//! Reconciliation scopes.
//!
//! A scope is a container id plus every member reachable below it. Scopes
//! are rebuilt from scratch for each reconciliation run and never stored.
//!
//! Expansion walks the containment tree with an explicit work stack, so
//! deep hierarchies cost heap rather than call-stack depth, and the walk
//! can stop between any two nodes when shutdown is signalled.

use crate::error::{ReplicationError, Result};
use crate::replica::ReplicaStore;
use crate::source::ObjectSource;
use crate::BoxFuture;
use std::collections::{BTreeMap, HashSet};
use tokio::sync::watch;

/// One object inside a scope, as seen by one side of the comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeMember {
    pub object_type: String,
    pub object_id: String,
    pub etag: String,
    pub is_container: bool,
}

/// Anything that can list the direct children of a container.
pub trait ScopeTree: Send + Sync {
    fn children<'a>(&'a self, container_id: &'a str) -> BoxFuture<'a, Vec<ScopeMember>>;
}

/// The replica's view of the containment tree.
pub struct ReplicaSide<'a, R: ?Sized>(pub &'a R);

impl<R: ReplicaStore + ?Sized> ScopeTree for ReplicaSide<'_, R> {
    fn children<'a>(&'a self, container_id: &'a str) -> BoxFuture<'a, Vec<ScopeMember>> {
        self.0.list_children(container_id)
    }
}

/// The source of truth's view of the containment tree.
pub struct SourceSide<'a, S: ?Sized>(pub &'a S);

impl<S: ObjectSource + ?Sized> ScopeTree for SourceSide<'_, S> {
    fn children<'a>(&'a self, container_id: &'a str) -> BoxFuture<'a, Vec<ScopeMember>> {
        self.0.list_children(container_id)
    }
}

/// Limits applied while expanding a scope.
#[derive(Debug, Clone, Default)]
pub struct ExpandLimits<'a> {
    /// Abort once more than this many members were found.
    pub max_members: Option<usize>,
    /// Stop between nodes when this flips to `true`.
    pub cancel: Option<&'a watch::Receiver<bool>>,
}

/// Identity of a scope member: `(object_type, object_id)`.
pub type MemberKey = (String, String);

impl ScopeMember {
    pub fn key(&self) -> MemberKey {
        (self.object_type.clone(), self.object_id.clone())
    }
}

/// A container and its recursively expanded members.
///
/// Members are keyed by type and id, the same identity the replica uses,
/// so objects of different types sharing an id stay distinct.
#[derive(Debug, Clone, Default)]
pub struct ReconciliationScope {
    pub container_id: String,
    pub members: BTreeMap<MemberKey, ScopeMember>,
}

impl ReconciliationScope {
    /// Expand `container_id` on `tree` down to non-container leaves.
    ///
    /// The container itself is not a member. Each container id is listed
    /// at most once, so a cycle in the tree cannot loop forever.
    pub async fn expand<T: ScopeTree + ?Sized>(
        tree: &T,
        container_id: &str,
        limits: ExpandLimits<'_>,
    ) -> Result<Self> {
        let mut members: BTreeMap<MemberKey, ScopeMember> = BTreeMap::new();
        let mut expanded: HashSet<String> = HashSet::new();
        let mut stack = vec![container_id.to_string()];
        expanded.insert(container_id.to_string());

        while let Some(current) = stack.pop() {
            if let Some(cancel) = limits.cancel {
                if *cancel.borrow() {
                    return Err(ReplicationError::Shutdown);
                }
            }

            for child in tree.children(&current).await? {
                if child.object_id == container_id && child.is_container {
                    continue;
                }
                let key = child.key();
                if members.contains_key(&key) {
                    continue;
                }
                if child.is_container && expanded.insert(child.object_id.clone()) {
                    stack.push(child.object_id.clone());
                }
                members.insert(key, child);
            }

            if let Some(max) = limits.max_members {
                if members.len() > max {
                    return Err(ReplicationError::Internal(format!(
                        "scope {container_id} exceeds {max} members"
                    )));
                }
            }
        }

        Ok(Self {
            container_id: container_id.to_string(),
            members,
        })
    }

    /// Member ids in key order. Ids repeat when types share them.
    pub fn member_ids(&self) -> Vec<String> {
        self.members.keys().map(|(_, id)| id.clone()).collect()
    }

    pub fn contains(&self, object_type: &str, object_id: &str) -> bool {
        self.members
            .contains_key(&(object_type.to_string(), object_id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}
