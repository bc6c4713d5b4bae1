//! Core identifier types for minicloud.
//!
//! This module provides strongly-typed identifiers for instances, hosts and
//! workflow executions, plus the idempotency keys attached to activity calls.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A 16-byte instance identifier based on UUID v4.
///
/// Instance IDs are randomly generated when a provision request is accepted.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct InstanceId(uuid::Uuid);

impl InstanceId {
    /// Create a new `InstanceId` from a UUID.
    #[must_use]
    pub const fn from_uuid(uuid: uuid::Uuid) -> Self {
        Self(uuid)
    }

    /// Generate a new random `InstanceId`.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Return the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }

    /// Return the bytes of the UUID.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl FromStr for InstanceId {
    type Err = IdError;

    /// Parse an `InstanceId` from a UUID string.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid = uuid::Uuid::parse_str(s).map_err(|_| IdError::InvalidUuid)?;
        Ok(Self(uuid))
    }
}

impl fmt::Debug for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InstanceId({})", self.0)
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for InstanceId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<InstanceId> for String {
    fn from(id: InstanceId) -> Self {
        id.0.to_string()
    }
}

impl AsRef<[u8]> for InstanceId {
    fn as_ref(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

/// A host identifier such as `host-001`.
///
/// Host IDs are operator-assigned. They order lexicographically, which the
/// scheduler relies on to break score ties deterministically.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HostId(String);

impl HostId {
    /// Maximum accepted length of a host identifier.
    pub const MAX_LEN: usize = 64;

    /// Return the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for HostId {
    type Err = IdError;

    /// Parse a `HostId`, accepting ASCII alphanumerics, `-`, `_` and `.`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s.len() > Self::MAX_LEN {
            return Err(IdError::InvalidLength {
                expected: Self::MAX_LEN,
                got: s.len(),
            });
        }
        if !s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(IdError::InvalidCharacters(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

impl fmt::Debug for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostId({})", self.0)
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for HostId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<HostId> for String {
    fn from(id: HostId) -> Self {
        id.0
    }
}

impl AsRef<[u8]> for HostId {
    fn as_ref(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

/// Identifier of one workflow execution.
///
/// A provision execution shares the ID of the instance it creates; control
/// workflows (stop, start, terminate) get `<instance>-<kind>-<suffix>`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ExecutionId(String);

impl ExecutionId {
    /// The execution ID of the provision workflow for an instance.
    #[must_use]
    pub fn for_provision(instance_id: &InstanceId) -> Self {
        Self(instance_id.to_string())
    }

    /// Generate a fresh execution ID for a control operation on an instance.
    #[must_use]
    pub fn for_operation(instance_id: &InstanceId, kind: &str) -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("{instance_id}-{kind}-{}", &suffix[..12]))
    }

    /// Return the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The instance this execution operates on, if the ID was built by
    /// [`for_provision`](Self::for_provision) or
    /// [`for_operation`](Self::for_operation).
    #[must_use]
    pub fn instance_id(&self) -> Option<InstanceId> {
        self.0.get(..36)?.parse().ok()
    }
}

impl FromStr for ExecutionId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(IdError::InvalidLength {
                expected: 1,
                got: 0,
            });
        }
        // `:` and `#` are reserved by idempotency keys.
        if s.contains([':', '#']) {
            return Err(IdError::InvalidCharacters(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

impl fmt::Debug for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExecutionId({})", self.0)
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ExecutionId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ExecutionId> for String {
    fn from(id: ExecutionId) -> Self {
        id.0
    }
}

impl AsRef<[u8]> for ExecutionId {
    fn as_ref(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

/// Idempotency key carried by every activity call: `executionId:stepName`.
///
/// The n-th call (n > 0) made within the same step is suffixed with `#n`, so
/// a step that issues several activities still gets a distinct, replay-stable
/// key for each of them.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Build the key for the `seq`-th activity call of `step`.
    #[must_use]
    pub fn new(execution_id: &ExecutionId, step: &str, seq: u32) -> Self {
        if seq == 0 {
            Self(format!("{execution_id}:{step}"))
        } else {
            Self(format!("{execution_id}:{step}#{seq}"))
        }
    }

    /// Return the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// A stable, opaque command identifier derived from the key.
    ///
    /// External agents deduplicate commands on this value, so resending a
    /// command after a retry or a crash never creates a second resource.
    #[must_use]
    pub fn command_id(&self) -> String {
        let digest = blake3::hash(self.0.as_bytes());
        hex::encode(&digest.as_bytes()[..16])
    }
}

impl fmt::Debug for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdempotencyKey({})", self.0)
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Errors that can occur when parsing identifiers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    /// The input has an incorrect length.
    #[error("invalid length: expected at most {expected}, got {got}")]
    InvalidLength {
        /// The expected length bound.
        expected: usize,
        /// The actual length.
        got: usize,
    },

    /// The input contains characters that are not allowed.
    #[error("invalid characters in identifier: {0}")]
    InvalidCharacters(String),

    /// The input is not a valid UUID.
    #[error("invalid UUID format")]
    InvalidUuid,
}
