//! kvnode library: startup and recovery of a replicated key-value node.
//!
//! This crate decides, at process start, whether a node is forming a
//! cluster for the first time or resuming one it belonged to, brings the
//! consensus engine to the last durably persisted state, and then serves
//! the node to peers and clients.  Alternatively it runs a stateless
//! forwarding proxy in front of such nodes.

pub mod bootstrap;
pub mod cli;
pub mod cluster;
pub mod compose;
pub mod config;
pub mod consensus;
pub mod discovery;
pub mod errors;
pub mod handlers;
pub mod metrics;
pub mod node;
pub mod proxy;
pub mod server;
pub mod startup;
pub mod storage;
pub mod store;
pub mod transport;
