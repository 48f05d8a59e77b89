//! The closed family of CRDT value types and its type-tag registry.

use std::fmt;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::register::CRegister;
use crate::sequence::CString;
use crate::vector::VersionVector;

/// Errors from the CRDT value layer.
#[derive(Debug, Error)]
pub enum CrdtError {
    #[error("unknown dtype: {0}")]
    UnknownDType(String),

    /// The `delete` dtype is reserved: the intent is that a deletion
    /// trumps concurrent ops on the deleted object, which needs a
    /// tombstone with version-vector semantics that nothing defines yet.
    #[error("dtype {0} is reserved and not implemented")]
    ReservedDType(DType),

    #[error("invalid pid: {0}")]
    InvalidPid(String),

    #[error("invalid op: {0}")]
    InvalidOp(String),

    #[error("invalid patch: {0}")]
    Patch(#[from] serde_json::Error),

    #[error("cannot apply multiple ClientInsert ops in one patch")]
    MultipleClientInserts,

    #[error("client-only op in server patch")]
    ClientOnlyOp,

    #[error("unknown agent: {0}")]
    UnknownAgent(u32),
}

/// Type tag identifying a CRDT value type on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Cregister,
    Cstring,
    /// Reserved for object deletion; every code path meeting this tag
    /// returns [`CrdtError::ReservedDType`].
    Delete,
}

impl DType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            DType::Cregister => "cregister",
            DType::Cstring => "cstring",
            DType::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Result<DType, CrdtError> {
        match s {
            "cregister" => Ok(DType::Cregister),
            "cstring" => Ok(DType::Cstring),
            "delete" => Ok(DType::Delete),
            other => Err(CrdtError::UnknownDType(other.to_string())),
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored CRDT value: a tagged sum over the concrete types.
///
/// The store treats patches as opaque strings; this enum is the only
/// place they are parsed. Each variant supports three operations:
/// `encode` (the whole value, for snapshots), `apply_server_patch`
/// (a finalized patch from a peer), and `apply_client_patch` (a raw
/// client patch; returns the finalized patch to log, stripped of any
/// client-only ops).
#[derive(Debug, Clone, PartialEq)]
pub enum CValue {
    Register(CRegister),
    Sequence(CString),
}

impl CValue {
    /// Returns the empty value for the given dtype.
    pub fn new_zero(dtype: DType) -> Result<CValue, CrdtError> {
        match dtype {
            DType::Cregister => Ok(CValue::Register(CRegister::new())),
            DType::Cstring => Ok(CValue::Sequence(CString::new())),
            DType::Delete => Err(CrdtError::ReservedDType(dtype)),
        }
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        match self {
            CValue::Register(_) => DType::Cregister,
            CValue::Sequence(_) => DType::Cstring,
        }
    }

    /// Encodes the entire value, suitable for snapshots.
    pub fn encode(&self) -> Result<String, CrdtError> {
        match self {
            CValue::Register(r) => r.encode(),
            CValue::Sequence(s) => s.encode(),
        }
    }

    /// Merges a finalized patch received from a peer.
    pub fn apply_server_patch(&mut self, patch: &str) -> Result<(), CrdtError> {
        match self {
            CValue::Register(r) => r.apply_server_patch(patch),
            CValue::Sequence(s) => s.apply_server_patch(patch),
        }
    }

    /// Merges a client patch and returns the finalized patch.
    ///
    /// `vec` is the version vector at the write, already advanced to the
    /// patch's own agent-seq; `time` is the accepting agent's wallclock;
    /// `rng` feeds pid allocation. Clocks and randomness are injected so
    /// the value layer stays deterministic under test.
    pub fn apply_client_patch(
        &mut self,
        agent_id: u32,
        vec: &VersionVector,
        time: DateTime<Utc>,
        patch: &str,
        rng: &mut impl Rng,
    ) -> Result<String, CrdtError> {
        match self {
            CValue::Register(r) => r.apply_client_patch(agent_id, vec, time, patch),
            CValue::Sequence(s) => s.apply_client_patch(agent_id, vec, patch, rng),
        }
    }
}
