//! The key-value store: a keyed map of CRDT value envelopes coupled to
//! the cross-agent patch log.

mod log;

pub use log::{Log, LogIterator, LogRecord, PatchEnvelope};

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use gossamer_crdt::{CValue, CrdtError, DType};
use rand::Rng;
use thiserror::Error;
use tokio::sync::watch;
use tracing::debug;

/// Store-level errors. Sequence gaps are protocol errors (the peer skipped
/// a patch); everything else comes up from the value layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Crdt(#[from] CrdtError),

    #[error("unexpected patch for agent {agent_id}: got {got}, want {want}")]
    SequenceGap { agent_id: u32, got: u32, want: u32 },

    #[error("key {key} holds a {have}, got a {got} patch")]
    DTypeMismatch { key: String, have: DType, got: DType },
}

/// A value and its type tag.
#[derive(Debug)]
pub struct ValueEnvelope {
    pub dtype: DType,
    pub value: CValue,
}

/// The store. All methods must be called with the hub mutex held; the
/// store itself is not synchronized. Patches are opaque strings here;
/// only the value layer parses them.
#[derive(Debug)]
pub struct Store {
    log: Log,
    values: BTreeMap<String, ValueEnvelope>,
}

impl Store {
    /// Returns an empty store and the wakeup channel for log tailers.
    pub fn open() -> (Store, watch::Receiver<u64>) {
        let (log, wakeup) = Log::new();
        (
            Store {
                log,
                values: BTreeMap::new(),
            },
            wakeup,
        )
    }

    pub fn log(&self) -> &Log {
        &self.log
    }

    /// Iterates key-value pairs in lexicographic key order. The store must
    /// not be mutated while the iterator is in use (the hub mutex covers
    /// the whole snapshot).
    pub fn iter(&self) -> impl Iterator<Item = (&String, &ValueEnvelope)> {
        self.values.iter()
    }

    fn envelope(&mut self, key: &str, dtype: DType) -> Result<&mut ValueEnvelope, StoreError> {
        use std::collections::btree_map::Entry;
        match self.values.entry(key.to_string()) {
            Entry::Occupied(e) => {
                let envelope = e.into_mut();
                if envelope.dtype != dtype {
                    return Err(StoreError::DTypeMismatch {
                        key: key.to_string(),
                        have: envelope.dtype,
                        got: dtype,
                    });
                }
                Ok(envelope)
            }
            Entry::Vacant(e) => Ok(e.insert(ValueEnvelope {
                dtype,
                value: CValue::new_zero(dtype).map_err(StoreError::Crdt)?,
            })),
        }
    }

    /// Applies a patch from one of this agent's own clients: advances the
    /// agent's seq in a head snapshot, lets the value finalize the patch,
    /// and appends the finalized patch to the log. Returns the local seq
    /// of the written log record.
    ///
    /// The wallclock and RNG are injected by the caller so the store stays
    /// deterministic under test.
    pub fn apply_client_patch(
        &mut self,
        agent_id: u32,
        key: &str,
        dtype: DType,
        patch: &str,
        now: DateTime<Utc>,
        rng: &mut impl Rng,
    ) -> Result<u32, StoreError> {
        if dtype == DType::Delete {
            return Err(CrdtError::ReservedDType(dtype).into());
        }
        let mut vec = self.log.head().clone();
        vec.put(agent_id, vec.get(agent_id) + 1);
        let created = !self.values.contains_key(key);
        let envelope = self.envelope(key, dtype)?;
        match envelope
            .value
            .apply_client_patch(agent_id, &vec, now, patch, rng)
        {
            Ok(finalized) => Ok(self.log.push(agent_id, key, dtype, finalized)),
            Err(e) => {
                // A rejected patch must not leave a freshly minted zero
                // value visible in snapshots.
                if created {
                    self.values.remove(key);
                }
                Err(e.into())
            }
        }
    }

    /// Applies a finalized patch received from a peer, if needed. A seq
    /// beyond the next expected one is a protocol error (the gossip
    /// channel is ordered, so a gap means the peer misbehaved); an already
    /// known seq is silently dropped, which makes redundant gossip paths
    /// harmless.
    pub fn apply_server_patch(
        &mut self,
        agent_id: u32,
        agent_seq: u32,
        key: &str,
        dtype: DType,
        patch: &str,
    ) -> Result<(), StoreError> {
        if dtype == DType::Delete {
            return Err(CrdtError::ReservedDType(dtype).into());
        }
        let want = self.log.head().get(agent_id) + 1;
        if agent_seq > want {
            return Err(StoreError::SequenceGap {
                agent_id,
                got: agent_seq,
                want,
            });
        }
        if agent_seq < want {
            debug!(agent_id, agent_seq, want, "dropping duplicate patch");
            return Ok(());
        }
        let created = !self.values.contains_key(key);
        let envelope = self.envelope(key, dtype)?;
        if let Err(e) = envelope.value.apply_server_patch(patch) {
            if created {
                self.values.remove(key);
            }
            return Err(e.into());
        }
        self.log.push(agent_id, key, dtype, patch.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use gossamer_crdt::VersionVector;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn client_patch(store: &mut Store, agent_id: u32, key: &str, dtype: DType, patch: &str) -> u32 {
        let mut rng = StdRng::seed_from_u64(u64::from(agent_id));
        store
            .apply_client_patch(agent_id, key, dtype, patch, at(10), &mut rng)
            .unwrap()
    }

    #[test]
    fn test_client_patch_creates_value_and_logs() {
        let (mut store, _rx) = Store::open();
        let seq = client_patch(&mut store, 1, "x", DType::Cregister, "\"v\"");
        assert_eq!(seq, 1);
        assert_eq!(store.log().head().get(1), 1);

        let (key, env) = store.iter().next().unwrap();
        assert_eq!(key, "x");
        assert_eq!(env.dtype, DType::Cregister);
    }

    #[test]
    fn test_delete_dtype_is_reserved() {
        let (mut store, _rx) = Store::open();
        let mut rng = StdRng::seed_from_u64(0);
        let err = store
            .apply_client_patch(1, "x", DType::Delete, "{}", at(0), &mut rng)
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::Crdt(CrdtError::ReservedDType(DType::Delete))
        ));
        let err = store
            .apply_server_patch(1, 1, "x", DType::Delete, "{}")
            .unwrap_err();
        assert!(matches!(err, StoreError::Crdt(_)));
        assert_eq!(store.log().head().get(1), 0);
    }

    #[test]
    fn test_server_patch_gap_rejected() {
        let (mut store, _rx) = Store::open();
        let err = store
            .apply_server_patch(3, 5, "x", DType::Cregister, "{}")
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::SequenceGap {
                agent_id: 3,
                got: 5,
                want: 1
            }
        ));
    }

    #[test]
    fn test_duplicate_server_patch_dropped() {
        let (mut origin, _rx) = Store::open();
        client_patch(&mut origin, 3, "x", DType::Cregister, "\"v\"");
        let patch = {
            let mut it = LogIterator::new(VersionVector::new());
            it.advance(origin.log()).unwrap().entry.patch.clone()
        };

        let (mut replica, _rx) = Store::open();
        replica
            .apply_server_patch(3, 1, "x", DType::Cregister, &patch)
            .unwrap();
        replica
            .apply_server_patch(3, 1, "x", DType::Cregister, &patch)
            .unwrap();
        assert_eq!(replica.log().head().get(3), 1);

        let (_, env) = replica.iter().next().unwrap();
        let (_, origin_env) = origin.iter().next().unwrap();
        assert_eq!(
            env.value.encode().unwrap(),
            origin_env.value.encode().unwrap()
        );
    }

    #[test]
    fn test_iteration_is_key_ordered() {
        let (mut store, _rx) = Store::open();
        client_patch(&mut store, 1, "b", DType::Cregister, "1");
        client_patch(&mut store, 1, "a", DType::Cregister, "2");
        client_patch(&mut store, 1, "c", DType::Cregister, "3");
        let keys: Vec<&String> = store.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["a", "b", "c"]);
    }

    #[test]
    fn test_log_replay_reproduces_store() {
        let (mut origin, _rx) = Store::open();
        client_patch(&mut origin, 1, "doc", DType::Cstring, r#"["ci,,,hello"]"#);
        client_patch(&mut origin, 1, "x", DType::Cregister, "\"a\"");
        client_patch(&mut origin, 2, "x", DType::Cregister, "\"b\"");
        client_patch(&mut origin, 2, "doc", DType::Cstring, r#"["ci,,,!"]"#);

        // Replaying the full log from an empty cursor into a fresh store
        // yields an equal state, with dense local seqs.
        let (mut replica, _rx) = Store::open();
        let mut it = LogIterator::new(VersionVector::new());
        let mut expected_local_seq = 1;
        while let Some(rec) = it.advance(origin.log()) {
            assert_eq!(rec.entry.local_seq, expected_local_seq);
            expected_local_seq += 1;
            replica
                .apply_server_patch(
                    rec.agent_id,
                    rec.agent_seq,
                    &rec.entry.key,
                    rec.entry.dtype,
                    &rec.entry.patch,
                )
                .unwrap();
        }
        assert_eq!(expected_local_seq, 5);
        assert_eq!(replica.log().head(), origin.log().head());

        let origin_state: Vec<(String, String)> = origin
            .iter()
            .map(|(k, env)| (k.clone(), env.value.encode().unwrap()))
            .collect();
        let replica_state: Vec<(String, String)> = replica
            .iter()
            .map(|(k, env)| (k.clone(), env.value.encode().unwrap()))
            .collect();
        assert_eq!(origin_state, replica_state);
    }

    #[test]
    fn test_rejected_patch_leaves_no_value_behind() {
        let (mut store, _rx) = Store::open();
        let mut rng = StdRng::seed_from_u64(0);
        let err = store
            .apply_client_patch(1, "doc", DType::Cstring, r#"["zz,bad"]"#, at(0), &mut rng)
            .unwrap_err();
        assert!(matches!(err, StoreError::Crdt(_)));
        assert_eq!(store.iter().count(), 0);
        assert_eq!(store.log().head().get(1), 0);
    }

    #[test]
    fn test_existing_envelope_keeps_its_type() {
        let (mut store, _rx) = Store::open();
        client_patch(&mut store, 1, "x", DType::Cregister, "\"v\"");
        let mut rng = StdRng::seed_from_u64(0);
        let err = store
            .apply_client_patch(1, "x", DType::Cstring, r#"["ci,,,a"]"#, at(0), &mut rng)
            .unwrap_err();
        assert!(matches!(err, StoreError::DTypeMismatch { .. }));
        assert_eq!(store.log().head().get(1), 1);
    }
}
