//! Version vectors for causal ordering of patches across agents.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A mapping from agent id to the highest agent sequence number accepted
/// from that agent. Agents absent from the vector read as zero.
///
/// Comparisons give the usual partial order on causal histories:
/// `a.before(b)` means every patch known to `a` is known to `b` and `b`
/// knows at least one more. Two vectors may be incomparable (concurrent),
/// in which case both `before` and `after` return `false`.
///
/// On the wire a version vector is a JSON object whose keys are *decimal
/// string* encodings of the agent ids, so consumers limited to
/// double-precision JSON numbers never lose key precision.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionVector {
    entries: BTreeMap<u32, u32>,
}

impl VersionVector {
    /// Returns an empty vector (all agents at zero).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the sequence number for the given agent, zero if absent.
    #[must_use]
    pub fn get(&self, agent_id: u32) -> u32 {
        self.entries.get(&agent_id).copied().unwrap_or(0)
    }

    /// Stores the given sequence number for the given agent, overwriting
    /// any previous value.
    pub fn put(&mut self, agent_id: u32, seq: u32) {
        self.entries.insert(agent_id, seq);
    }

    /// Returns true iff `self[x] <= other[x]` for all agents `x`.
    #[must_use]
    pub fn leq(&self, other: &VersionVector) -> bool {
        self.entries.iter().all(|(&k, &v)| v <= other.get(k))
    }

    /// Returns true iff `self.leq(other)` and `self[x] < other[x]` for
    /// some agent `x` (strict causal precedence).
    #[must_use]
    pub fn before(&self, other: &VersionVector) -> bool {
        let mut less = false;
        for (&k, &v) in &self.entries {
            let vo = other.get(k);
            if vo < v {
                return false;
            }
            if v < vo {
                less = true;
            }
        }
        less
    }

    /// Returns `other.before(self)`.
    #[must_use]
    pub fn after(&self, other: &VersionVector) -> bool {
        other.before(self)
    }

    /// Iterates over `(agent_id, seq)` pairs in agent-id order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.entries.iter().map(|(&k, &v)| (k, v))
    }

    /// Returns true iff no agent has a nonzero sequence number.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Serialize for VersionVector {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (agent_id, seq) in &self.entries {
            map.serialize_entry(&agent_id.to_string(), seq)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for VersionVector {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct VectorVisitor;

        impl<'de> Visitor<'de> for VectorVisitor {
            type Value = VersionVector;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map from decimal agent-id strings to sequence numbers")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut entries = BTreeMap::new();
                while let Some((key, seq)) = map.next_entry::<String, u32>()? {
                    let agent_id = key.parse::<u32>().map_err(serde::de::Error::custom)?;
                    entries.insert(agent_id, seq);
                }
                Ok(VersionVector { entries })
            }
        }

        deserializer.deserialize_map(VectorVisitor)
    }
}
