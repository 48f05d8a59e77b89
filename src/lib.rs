//! gossamerd - a replicated, eventually-consistent CRDT key-value store.
//!
//! Clients subscribe over a WebSocket and receive a snapshot followed by
//! a never-ending patch stream; agents gossip patches to each other so
//! the whole set converges. The CRDT value types themselves live in the
//! `gossamer-crdt` crate.

pub mod config;
pub mod error;
pub mod hub;
pub mod store;

pub use config::Config;
pub use hub::{Hub, WireMessage};
