//! Last-writer-wins register.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::value::CrdtError;
use crate::vector::VersionVector;

/// A last-writer-wins register holding an arbitrary JSON value.
///
/// Each write is stamped with the writer's agent id, the version vector
/// observed at write time, and a wallclock timestamp. A candidate record
/// replaces the current one iff it *dominates* it:
///
/// 1. the candidate's vector is causally after the current one, or
/// 2. the vectors are concurrent (neither before the other) and the
///    candidate's `(time, agent_id)` pair is lexicographically greater.
///
/// Vector dominance captures causal order; the wallclock/agent-id pair
/// breaks ties between concurrent writes with a deterministic total order,
/// so replicas converge no matter which write they see first.
///
/// The full record is what travels between replicas: a finalized ("server")
/// patch is an encoded `CRegister`, never a bare value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CRegister {
    pub agent_id: u32,
    pub vec: VersionVector,
    pub time: DateTime<Utc>,
    pub val: serde_json::Value,
}

impl CRegister {
    /// Returns the zero register: no writer, empty vector, epoch time,
    /// null value. Any real write dominates it.
    #[must_use]
    pub fn new() -> Self {
        Self {
            agent_id: 0,
            vec: VersionVector::new(),
            time: DateTime::UNIX_EPOCH,
            val: serde_json::Value::Null,
        }
    }

    /// Returns the current value.
    #[must_use]
    pub fn value(&self) -> &serde_json::Value {
        &self.val
    }

    /// Encodes the full record as JSON (`{AgentId, Vec, Time, Val}` with an
    /// RFC-3339 `Time`).
    pub fn encode(&self) -> Result<String, CrdtError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Applies a finalized patch received from a peer: an encoded record,
    /// merged under the dominance rule.
    pub fn apply_server_patch(&mut self, patch: &str) -> Result<(), CrdtError> {
        let other: CRegister = serde_json::from_str(patch)?;
        self.merge(other);
        Ok(())
    }

    /// Applies a client patch: a raw JSON-encoded value. The candidate
    /// record is built from the caller's identity, vector, and wallclock,
    /// and the returned finalized patch is that record in full.
    pub fn apply_client_patch(
        &mut self,
        agent_id: u32,
        vec: &VersionVector,
        time: DateTime<Utc>,
        patch: &str,
    ) -> Result<String, CrdtError> {
        let val: serde_json::Value = serde_json::from_str(patch)?;
        let other = CRegister {
            agent_id,
            vec: vec.clone(),
            time,
            val,
        };
        let finalized = other.encode()?;
        self.merge(other);
        Ok(finalized)
    }

    fn merge(&mut self, other: CRegister) {
        if other.dominates(self) {
            *self = other;
        }
    }

    fn dominates(&self, current: &CRegister) -> bool {
        self.vec.after(&current.vec)
            || (!self.vec.before(&current.vec)
                && (self.time, self.agent_id) > (current.time, current.agent_id))
    }
}

impl Default for CRegister {
    fn default() -> Self {
        Self::new()
    }
}
