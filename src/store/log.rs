//! The append-only, cross-agent patch log.
//!
//! Patches from each agent are stored contiguously in agent-seq order;
//! a version vector (`head`) tracks how many patches are held per agent,
//! and a dense local sequence number records the arrival order across
//! agents on this replica. Tail readers resume from any version vector
//! and observe patches in local-seq order.

use std::collections::HashMap;
use std::sync::Arc;

use gossamer_crdt::{DType, VersionVector};
use tokio::sync::watch;

/// A patch and its position in the log. The owning agent id and agent seq
/// are encoded by the log's bucketing rather than stored here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchEnvelope {
    /// One-based position in the local, cross-agent patch log.
    pub local_seq: u32,
    pub key: String,
    pub dtype: DType,
    /// Finalized (server) patch, opaque to the log.
    pub patch: String,
}

/// The patch log. Invariant: `per_agent[a].len() == head.get(a)` for every
/// agent `a`, and local seqs are dense over all entries.
///
/// All methods must be called with the hub mutex held; waking tail readers
/// goes through the watch channel handed out by [`Log::new`], which plays
/// the role of a condition variable (the sender bumps a version, waiters
/// re-check `head` against their cursor on every change).
#[derive(Debug)]
pub struct Log {
    per_agent: HashMap<u32, Vec<Arc<PatchEnvelope>>>,
    head: VersionVector,
    next_local_seq: u32,
    wakeup: watch::Sender<u64>,
}

impl Log {
    pub fn new() -> (Log, watch::Receiver<u64>) {
        let (wakeup, rx) = watch::channel(0);
        let log = Log {
            per_agent: HashMap::new(),
            head: VersionVector::new(),
            next_local_seq: 1,
            wakeup,
        };
        (log, rx)
    }

    /// Current knowledge: highest agent seq held per agent.
    pub fn head(&self) -> &VersionVector {
        &self.head
    }

    /// Appends a patch from the given agent, assigns it the next local
    /// seq, and wakes tail readers. Returns the local seq.
    pub fn push(&mut self, agent_id: u32, key: &str, dtype: DType, patch: String) -> u32 {
        let local_seq = self.next_local_seq;
        self.next_local_seq += 1;
        let entries = self.per_agent.entry(agent_id).or_default();
        entries.push(Arc::new(PatchEnvelope {
            local_seq,
            key: key.to_string(),
            dtype,
            patch,
        }));
        self.head.put(agent_id, entries.len() as u32);
        self.wakeup.send_modify(|v| *v += 1);
        local_seq
    }
}

/// A staged log entry: the patch plus the identity of the agent that
/// originated it.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub agent_id: u32,
    pub agent_seq: u32,
    pub entry: Arc<PatchEnvelope>,
}

/// Iterates log entries strictly beyond a version vector, in local-seq
/// order. The iterator owns its cursor, so it is resumable: advancing
/// under the mutex, then releasing it while the staged entry is processed,
/// is the intended tailing pattern.
#[derive(Debug)]
pub struct LogIterator {
    cursor: VersionVector,
}

impl LogIterator {
    pub fn new(cursor: VersionVector) -> LogIterator {
        LogIterator { cursor }
    }

    /// The patches consumed so far, as a version vector.
    pub fn cursor(&self) -> &VersionVector {
        &self.cursor
    }

    /// Stages the entry with the smallest local seq among each agent's
    /// next unconsumed patch, advancing the cursor past it. Returns `None`
    /// when the log holds nothing beyond the cursor. Must be called with
    /// the hub mutex held; the returned record is valid after release.
    pub fn advance(&mut self, log: &Log) -> Option<LogRecord> {
        let mut best: Option<(u32, u32, &Arc<PatchEnvelope>)> = None;
        for (&agent_id, patches) in &log.per_agent {
            let next_seq = self.cursor.get(agent_id) + 1;
            let Some(entry) = patches.get(next_seq as usize - 1) else {
                continue;
            };
            if best.map_or(true, |(_, _, b)| entry.local_seq < b.local_seq) {
                best = Some((agent_id, next_seq, entry));
            }
        }
        let (agent_id, agent_seq, entry) = best?;
        let entry = Arc::clone(entry);
        self.cursor.put(agent_id, agent_seq);
        Some(LogRecord {
            agent_id,
            agent_seq,
            entry,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_n(log: &mut Log, agent_id: u32, n: usize) {
        for _ in 0..n {
            log.push(agent_id, "k", DType::Cregister, "{}".to_string());
        }
    }

    #[test]
    fn test_push_assigns_dense_local_seqs() {
        let (mut log, _rx) = Log::new();
        assert_eq!(log.push(1, "a", DType::Cregister, "p1".to_string()), 1);
        assert_eq!(log.push(2, "b", DType::Cregister, "p2".to_string()), 2);
        assert_eq!(log.push(1, "a", DType::Cregister, "p3".to_string()), 3);
    }

    #[test]
    fn test_head_tracks_per_agent_counts() {
        let (mut log, _rx) = Log::new();
        push_n(&mut log, 1, 3);
        push_n(&mut log, 2, 1);
        assert_eq!(log.head().get(1), 3);
        assert_eq!(log.head().get(2), 1);
        assert_eq!(log.head().get(3), 0);
    }

    #[test]
    fn test_iterator_replays_in_local_seq_order() {
        let (mut log, _rx) = Log::new();
        log.push(1, "a", DType::Cregister, "p1".to_string());
        log.push(2, "b", DType::Cregister, "p2".to_string());
        log.push(1, "c", DType::Cregister, "p3".to_string());
        log.push(3, "d", DType::Cregister, "p4".to_string());

        let mut it = LogIterator::new(VersionVector::new());
        let mut seen = Vec::new();
        while let Some(rec) = it.advance(&log) {
            seen.push((rec.agent_id, rec.agent_seq, rec.entry.local_seq));
        }
        assert_eq!(seen, vec![(1, 1, 1), (2, 1, 2), (1, 2, 3), (3, 1, 4)]);
        assert_eq!(it.cursor(), log.head());
    }

    #[test]
    fn test_iterator_resumes_from_cursor() {
        let (mut log, _rx) = Log::new();
        push_n(&mut log, 1, 2);
        push_n(&mut log, 2, 2);

        let mut it = LogIterator::new(VersionVector::new());
        let first = it.advance(&log).unwrap();
        assert_eq!(first.entry.local_seq, 1);

        // A fresh iterator over the advanced cursor sees only the suffix.
        let mut resumed = LogIterator::new(it.cursor().clone());
        let mut rest = Vec::new();
        while let Some(rec) = resumed.advance(&log) {
            rest.push(rec.entry.local_seq);
        }
        assert_eq!(rest, vec![2, 3, 4]);
    }

    #[test]
    fn test_iterator_beyond_head_yields_nothing() {
        let (mut log, _rx) = Log::new();
        push_n(&mut log, 1, 2);
        let mut it = LogIterator::new(log.head().clone());
        assert!(it.advance(&log).is_none());
    }

    #[test]
    fn test_push_wakes_watchers() {
        let (mut log, rx) = Log::new();
        let before = *rx.borrow();
        push_n(&mut log, 1, 1);
        assert!(*rx.borrow() > before);
    }
}
