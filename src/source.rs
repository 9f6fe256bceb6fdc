//! Source-of-truth access.
//!
//! The replica only ever holds what the source returns. Change records
//! carry identities, not content, so applying a CREATE/UPDATE means
//! fetching the object's current snapshot here first.

use crate::scope::ScopeMember;
use crate::BoxFuture;
use serde::{Deserialize, Serialize};

/// Current state of one object in the source of truth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectSnapshot {
    pub object_type: String,
    pub object_id: String,
    pub object_version: Option<i64>,
    pub etag: String,
    pub parent_id: Option<String>,
    pub is_container: bool,
    pub payload: serde_json::Value,
}

impl ObjectSnapshot {
    pub fn summary(&self) -> ScopeMember {
        ScopeMember {
            object_type: self.object_type.clone(),
            object_id: self.object_id.clone(),
            etag: self.etag.clone(),
            is_container: self.is_container,
        }
    }
}

/// Read-only view of the source of truth.
///
/// Errors must follow the crate taxonomy: a transient failure is
/// `RecoverableDelivery`, a record the source can never resolve is
/// `PermanentRecord`.
pub trait ObjectSource: Send + Sync + 'static {
    /// Fetch the current snapshot, `None` when the object no longer exists.
    fn fetch<'a>(&'a self, object_type: &'a str, object_id: &'a str)
        -> BoxFuture<'a, Option<ObjectSnapshot>>;

    /// Direct children of a container.
    fn list_children<'a>(&'a self, container_id: &'a str) -> BoxFuture<'a, Vec<ScopeMember>>;
}
