// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change records and the queue message format.
//!
//! A [`ChangeRecord`] is an immutable entry of the change ledger. Its
//! `change_number` is assigned by the ledger and is the only ordering
//! guarantee the pipeline relies on.
//!
//! # Wire Format
//!
//! Queue messages carry a JSON-encoded [`ChangeMessage`]:
//!
//! ```text
//! {"changes":[{"change_number":17,"object_id":"syn9","object_type":"entity",
//!              "object_version":3,"change_type":"UPDATE","timestamp":1718000000000}]}
//! ```
//!
//! A body that does not decode is a permanent failure: the message is
//! acknowledged and dropped rather than redelivered forever.

use crate::error::{ReplicationError, Result};
use serde::{Deserialize, Serialize};

/// Kind of mutation a change record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeType {
    Create,
    Update,
    Delete,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Create => "CREATE",
            ChangeType::Update => "UPDATE",
            ChangeType::Delete => "DELETE",
        }
    }

    pub fn is_upsert(&self) -> bool {
        matches!(self, ChangeType::Create | ChangeType::Update)
    }
}

impl std::fmt::Display for ChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ChangeType {
    type Err = ReplicationError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "CREATE" => Ok(ChangeType::Create),
            "UPDATE" => Ok(ChangeType::Update),
            "DELETE" => Ok(ChangeType::Delete),
            other => Err(ReplicationError::Codec(format!("unknown change type: {other}"))),
        }
    }
}

/// One entry of the change ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub change_number: i64,
    pub object_id: String,
    pub object_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_version: Option<i64>,
    pub change_type: ChangeType,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// Emitted by scope reconciliation rather than the ledger.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub synthetic: bool,
}

impl ChangeRecord {
    pub fn new(
        change_number: i64,
        object_type: impl Into<String>,
        object_id: impl Into<String>,
        change_type: ChangeType,
    ) -> Self {
        Self {
            change_number,
            object_id: object_id.into(),
            object_type: object_type.into(),
            object_version: None,
            change_type,
            timestamp: chrono::Utc::now().timestamp_millis(),
            synthetic: false,
        }
    }

    pub fn with_version(mut self, version: i64) -> Self {
        self.object_version = Some(version);
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// A reconciliation record, stamped with a ledger change number.
    pub fn synthetic(
        change_number: i64,
        object_type: impl Into<String>,
        object_id: impl Into<String>,
        change_type: ChangeType,
    ) -> Self {
        Self {
            synthetic: true,
            ..Self::new(change_number, object_type, object_id, change_type)
        }
    }

    /// Identity of the object this record mutates.
    pub fn object_key(&self) -> (&str, &str) {
        (&self.object_type, &self.object_id)
    }

    /// Reject records that can never be applied.
    pub fn validate(&self) -> Result<()> {
        if self.object_id.trim().is_empty() {
            return Err(ReplicationError::permanent(self.change_number, "empty object id"));
        }
        if self.object_type.trim().is_empty() {
            return Err(ReplicationError::permanent(self.change_number, "empty object type"));
        }
        if self.change_number < 0 {
            return Err(ReplicationError::permanent(
                self.change_number,
                "negative change number",
            ));
        }
        if let Some(v) = self.object_version {
            if v < 0 {
                return Err(ReplicationError::permanent(
                    self.change_number,
                    format!("negative object version {v}"),
                ));
            }
        }
        Ok(())
    }
}

/// Body of one queue message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeMessage {
    pub changes: Vec<ChangeRecord>,
}

impl ChangeMessage {
    pub fn single(record: ChangeRecord) -> Self {
        Self {
            changes: vec![record],
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(body: &str) -> Result<Self> {
        Ok(serde_json::from_str(body)?)
    }
}

/// Digest of a set of change numbers.
///
/// The sum of CRC32 over each big-endian change number, with wrapping
/// arithmetic so the result is independent of iteration order. `None`
/// means the set was empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Checksum(pub Option<u64>);

impl Checksum {
    pub fn of<I>(change_numbers: I) -> Self
    where
        I: IntoIterator<Item = i64>,
    {
        let mut sum: Option<u64> = None;
        for n in change_numbers {
            let crc = u64::from(crc32fast::hash(&n.to_be_bytes()));
            sum = Some(sum.unwrap_or(0).wrapping_add(crc));
        }
        Checksum(sum)
    }
}

impl std::fmt::Display for Checksum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Some(v) => write!(f, "{v}"),
            None => f.write_str("null"),
        }
    }
}

/// Ledger-side and sent-side digests for one window `[lo, hi]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RangeChecksum {
    pub ledger: Checksum,
    pub sent: Checksum,
}

impl RangeChecksum {
    pub fn is_in_sync(&self) -> bool {
        self.ledger == self.sent
    }
}
