//! Conflict-free replicated value types for the gossamer key-value store.
//!
//! Every stored value is a CRDT: merging patches is deterministic,
//! commutative, associative, and idempotent, so replicas that see the same
//! set of patches converge regardless of delivery order or duplication.
//!
//! # Types
//!
//! - [`VersionVector`] - per-agent causal knowledge, used both for log
//!   cursors and for register dominance checks
//! - [`CRegister`] - last-writer-wins register (vector dominance, then
//!   wallclock, then agent id)
//! - [`CString`] - Logoot sequence of single-character atoms with totally
//!   ordered position identifiers
//! - [`CValue`] - the closed tagged sum over the concrete value types,
//!   keyed by [`DType`]
//!
//! This crate is pure data-structure code: no I/O, no async, no clocks.
//! Wallclock times and randomness are injected by the caller.
//!
//! # References
//!
//! - Shapiro et al., "A comprehensive study of Convergent and Commutative
//!   Replicated Data Types"
//! - Weiss et al., "Logoot: a scalable optimistic replication algorithm for
//!   collaborative editing on P2P networks"

mod register;
mod sequence;
mod value;
mod vector;

pub use register::CRegister;
pub use sequence::{CString, Id, Op, Pid};
pub use value::{CValue, CrdtError, DType};
pub use vector::VersionVector;
