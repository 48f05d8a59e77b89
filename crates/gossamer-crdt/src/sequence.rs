//! Logoot sequence of characters.
//!
//! Each atom carries a position identifier ([`Pid`]) drawn from a dense
//! total order, so concurrent inserts at the same place commute without
//! coordination. Deletes address atoms by pid and tombstone nothing: a
//! delete for an unknown pid is a no-op, which makes every op idempotent.

use std::cmp::Ordering;
use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::value::CrdtError;
use crate::vector::VersionVector;

/// One level of a position identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Id {
    pub pos: u32,
    pub agent_id: u32,
}

/// A Logoot position identifier: a list of `(pos, agent_id)` levels plus
/// the inserting agent's sequence number as the final tiebreak.
///
/// Pids are totally ordered: lexicographic on the levels comparing
/// `(pos, agent_id)`; a strict prefix sorts before its extensions; equal
/// level lists are ordered by `seq`. Pids never change after creation and
/// no two atoms share one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pid {
    pub ids: Vec<Id>,
    pub seq: u32,
}

impl Ord for Pid {
    fn cmp(&self, other: &Pid) -> Ordering {
        for (a, b) in self.ids.iter().zip(&other.ids) {
            let ord = a.pos.cmp(&b.pos).then(a.agent_id.cmp(&b.agent_id));
            if ord != Ordering::Equal {
                return ord;
            }
        }
        self.ids
            .len()
            .cmp(&other.ids.len())
            .then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for Pid {
    fn partial_cmp(&self, other: &Pid) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Pid {
    /// Encodes as `pos.agent:pos.agent~seq`, all decimal.
    #[must_use]
    pub fn encode(&self) -> String {
        let ids = self
            .ids
            .iter()
            .map(|id| format!("{}.{}", id.pos, id.agent_id))
            .collect::<Vec<_>>()
            .join(":");
        format!("{}~{}", ids, self.seq)
    }

    /// Decodes the wire form produced by [`Pid::encode`].
    pub fn decode(s: &str) -> Result<Pid, CrdtError> {
        let bad = || CrdtError::InvalidPid(s.to_string());
        let (ids_part, seq_part) = s.split_once('~').ok_or_else(bad)?;
        let seq = seq_part.parse::<u32>().map_err(|_| bad())?;
        let mut ids = Vec::new();
        for id_str in ids_part.split(':') {
            let (pos, agent_id) = id_str.split_once('.').ok_or_else(bad)?;
            ids.push(Id {
                pos: pos.parse::<u32>().map_err(|_| bad())?,
                agent_id: agent_id.parse::<u32>().map_err(|_| bad())?,
            });
        }
        Ok(Pid { ids, seq })
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// A sequence operation.
///
/// `ClientInsert` is client-only: it names two anchor pids and a string to
/// insert between them, and the server expands it into a run of `Insert`
/// ops with freshly minted pids. Finalized patches carry only `Insert` and
/// `Delete`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    ClientInsert {
        prev: Option<Pid>,
        next: Option<Pid>,
        value: String,
    },
    Insert {
        pid: Pid,
        value: char,
    },
    Delete {
        pid: Pid,
    },
}

impl Op {
    /// Encodes as the compact comma-separated wire form:
    /// `ci,<prev?>,<next?>,<string>`, `i,<pid>,<char>`, or `d,<pid>`.
    #[must_use]
    pub fn encode(&self) -> String {
        match self {
            Op::ClientInsert { prev, next, value } => {
                let prev = prev.as_ref().map(Pid::encode).unwrap_or_default();
                let next = next.as_ref().map(Pid::encode).unwrap_or_default();
                format!("ci,{},{},{}", prev, next, value)
            }
            Op::Insert { pid, value } => format!("i,{},{}", pid.encode(), value),
            Op::Delete { pid } => format!("d,{}", pid.encode()),
        }
    }

    /// Decodes a single op. Only the leading commas split fields, so a
    /// `ci` payload may itself contain commas.
    pub fn decode(s: &str) -> Result<Op, CrdtError> {
        let bad = || CrdtError::InvalidOp(s.to_string());
        let (tag, rest) = s.split_once(',').ok_or_else(bad)?;
        match tag {
            "ci" => {
                let mut parts = rest.splitn(3, ',');
                let prev = parts.next().ok_or_else(bad)?;
                let next = parts.next().ok_or_else(bad)?;
                let value = parts.next().ok_or_else(bad)?;
                let decode_anchor = |p: &str| -> Result<Option<Pid>, CrdtError> {
                    if p.is_empty() {
                        Ok(None)
                    } else {
                        Pid::decode(p).map(Some)
                    }
                };
                Ok(Op::ClientInsert {
                    prev: decode_anchor(prev)?,
                    next: decode_anchor(next)?,
                    value: value.to_string(),
                })
            }
            "i" => {
                let (pid, value) = rest.split_once(',').ok_or_else(bad)?;
                let mut chars = value.chars();
                let (Some(c), None) = (chars.next(), chars.next()) else {
                    return Err(bad());
                };
                Ok(Op::Insert {
                    pid: Pid::decode(pid)?,
                    value: c,
                })
            }
            "d" => Ok(Op::Delete {
                pid: Pid::decode(rest)?,
            }),
            _ => Err(bad()),
        }
    }
}

/// A patch is a JSON array of encoded op strings.
pub(crate) fn decode_patch(patch: &str) -> Result<Vec<Op>, CrdtError> {
    let strs: Vec<String> = serde_json::from_str(patch)?;
    strs.iter().map(|s| Op::decode(s)).collect()
}

pub(crate) fn encode_patch(ops: &[Op]) -> Result<String, CrdtError> {
    let strs: Vec<String> = ops.iter().map(Op::encode).collect();
    Ok(serde_json::to_string(&strs)?)
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Atom {
    pid: Pid,
    value: char,
}

/// Snapshot wire form of an atom: the pid as its encoded string.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AtomWire {
    pid: String,
    value: String,
}

/// A CRDT string: atoms in pid order, with the concatenated text cached.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CString {
    atoms: Vec<Atom>,
    text: String,
}

impl CString {
    /// Returns the empty sequence.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The current text: atom values concatenated in pid order.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Number of atoms (equivalently, characters).
    #[must_use]
    pub fn len(&self) -> usize {
        self.atoms.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.atoms.is_empty()
    }

    /// Encodes the whole sequence as a JSON array of `{Pid, Value}` atoms.
    pub fn encode(&self) -> Result<String, CrdtError> {
        let atoms: Vec<AtomWire> = self
            .atoms
            .iter()
            .map(|a| AtomWire {
                pid: a.pid.encode(),
                value: a.value.to_string(),
            })
            .collect();
        Ok(serde_json::to_string(&atoms)?)
    }

    /// Applies a finalized patch from a peer. Client-only ops are a
    /// protocol error here.
    pub fn apply_server_patch(&mut self, patch: &str) -> Result<(), CrdtError> {
        for op in decode_patch(patch)? {
            match op {
                Op::ClientInsert { .. } => return Err(CrdtError::ClientOnlyOp),
                Op::Insert { pid, value } => self.apply_insert(pid, value),
                Op::Delete { pid } => self.apply_delete(&pid),
            }
        }
        Ok(())
    }

    /// Applies a client patch and returns the finalized patch: the ops
    /// actually applied, with any `ClientInsert` expanded into `Insert`
    /// runs carrying freshly minted pids. At most one `ClientInsert` is
    /// allowed per patch.
    pub fn apply_client_patch(
        &mut self,
        agent_id: u32,
        vec: &VersionVector,
        patch: &str,
        rng: &mut impl Rng,
    ) -> Result<String, CrdtError> {
        let agent_seq = vec.get(agent_id);
        if agent_seq == 0 {
            return Err(CrdtError::UnknownAgent(agent_id));
        }
        let ops = decode_patch(patch)?;
        let mut applied = Vec::with_capacity(ops.len());
        let mut got_client_insert = false;
        for op in ops {
            match op {
                Op::ClientInsert { prev, next, value } => {
                    if got_client_insert {
                        return Err(CrdtError::MultipleClientInserts);
                    }
                    got_client_insert = true;
                    // Thread each minted pid as the prev anchor of the next
                    // character so the run stays contiguous.
                    let mut prev = prev;
                    for c in value.chars() {
                        let pid = gen_pid(agent_id, agent_seq, prev.as_ref(), next.as_ref(), rng);
                        self.apply_insert(pid.clone(), c);
                        applied.push(Op::Insert {
                            pid: pid.clone(),
                            value: c,
                        });
                        prev = Some(pid);
                    }
                }
                Op::Insert { pid, value } => {
                    self.apply_insert(pid.clone(), value);
                    applied.push(Op::Insert { pid, value });
                }
                Op::Delete { pid } => {
                    self.apply_delete(&pid);
                    applied.push(Op::Delete { pid });
                }
            }
        }
        encode_patch(&applied)
    }

    /// Position of the first atom with pid >= the given pid.
    fn search(&self, pid: &Pid) -> usize {
        self.atoms.partition_point(|a| a.pid < *pid)
    }

    fn apply_insert(&mut self, pid: Pid, value: char) {
        let p = self.search(&pid);
        if let Some(existing) = self.atoms.get(p) {
            if existing.pid == pid {
                assert_eq!(
                    existing.value, value,
                    "two atoms claim pid {} with different values",
                    pid
                );
                return;
            }
        }
        let offset = self.byte_offset(p);
        self.text.insert(offset, value);
        self.atoms.insert(p, Atom { pid, value });
    }

    fn apply_delete(&mut self, pid: &Pid) {
        let p = self.search(pid);
        match self.atoms.get(p) {
            Some(atom) if atom.pid == *pid => {}
            _ => return,
        }
        let offset = self.byte_offset(p);
        self.text.remove(offset);
        self.atoms.remove(p);
    }

    /// Byte offset of the `char_pos`-th character of the cached text.
    fn byte_offset(&self, char_pos: usize) -> usize {
        self.text
            .char_indices()
            .nth(char_pos)
            .map_or(self.text.len(), |(i, _)| i)
    }
}

/// Mints a pid strictly between the two anchors. Absent anchors stand for
/// the start and end of the document.
pub fn gen_pid(
    agent_id: u32,
    agent_seq: u32,
    prev: Option<&Pid>,
    next: Option<&Pid>,
    rng: &mut impl Rng,
) -> Pid {
    let prev_ids = prev.map_or(&[][..], |p| &p.ids);
    let next_ids = next.map_or(&[][..], |p| &p.ids);
    Pid {
        ids: gen_ids(agent_id, prev_ids, next_ids, rng),
        seq: agent_seq,
    }
}

fn gen_ids(agent_id: u32, prev: &[Id], next: &[Id], rng: &mut impl Rng) -> Vec<Id> {
    let prev0 = prev.first().copied().unwrap_or(Id { pos: 0, agent_id });
    let next0 = next.first().copied().unwrap_or(Id {
        pos: u32::MAX,
        agent_id,
    });
    if prev0.pos.saturating_add(1) < next0.pos {
        return vec![Id {
            pos: rng.gen_range(prev0.pos + 1..next0.pos),
            agent_id,
        }];
    }
    // No room at this depth: keep prev's id and descend.
    let mut ids = vec![prev0];
    ids.extend(gen_ids(
        agent_id,
        prev.get(1..).unwrap_or(&[]),
        next.get(1..).unwrap_or(&[]),
        rng,
    ));
    ids
}
