//! Protocol messages.
//!
//! Every message is a JSON object with a `"Type"` field naming the message
//! type; unknown types fail deserialization and are protocol errors. Agent
//! ids and sequence numbers are 32-bit unsigned so they survive consumers
//! that read JSON numbers as doubles; version vectors use decimal string
//! keys for the same reason.

use gossamer_crdt::{DType, VersionVector};
use serde::{Deserialize, Serialize};

/// The full message set, all directions.
///
/// `C2S`/`S2C` flow between a client and its agent; `I2R`/`R2I` flow
/// between a subscription initiator and responder in agent-to-agent
/// gossip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "Type", rename_all_fields = "PascalCase")]
pub enum WireMessage {
    /// Client subscription request; answered with a snapshot and a tail.
    SubscribeC2S,

    /// One snapshot value.
    ValueS2C {
        key: String,
        #[serde(rename = "DType")]
        dtype: DType,
        /// Encoded value (whole-value snapshot form).
        value: String,
    },

    /// End-of-snapshot sentinel; patches follow.
    ValuesDoneS2C,

    /// A client patch against one key.
    PatchC2S {
        key: String,
        #[serde(rename = "DType")]
        dtype: DType,
        patch: String,
    },

    /// One tailed patch. `IsLocal` is true iff the patch originated from
    /// this connection, so a client can recognize its own echo without
    /// matching opaque payloads.
    PatchS2C {
        agent_id: u32,
        is_local: bool,
        key: String,
        #[serde(rename = "DType")]
        dtype: DType,
        patch: String,
    },

    /// Peer subscription: the initiator announces its identity, its own
    /// listen address (so the responder can dial back), and the version
    /// vector to resume from.
    SubscribeI2R {
        agent_id: u32,
        addr: String,
        version_vector: VersionVector,
    },

    /// One gossiped patch, globally identified by `(AgentId, AgentSeq)`.
    PatchR2I {
        agent_id: u32,
        agent_seq: u32,
        key: String,
        #[serde(rename = "DType")]
        dtype: DType,
        patch: String,
    },
}
