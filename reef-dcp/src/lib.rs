//! DCP streaming core: ordered, resumable per-vbucket replication streams.
//!
//! A producer node serves each replicated vbucket through an [`stream::ActiveStream`] that moves
//! through backfill, in-memory tailing, and an optional takeover handoff. A consumer node
//! receives through a [`stream::PassiveStream`] buffering snapshots before applying them. The
//! [`connmap::DcpConnMap`] registry owns every connection, enforces the one-stream-per-vbucket
//! rules, and sweeps dead connections.

pub mod backfill;
pub mod connection;
pub mod connmap;
pub mod message;
pub mod processor;
pub mod ready_queue;
pub mod stream;

#[cfg(test)]
pub(crate) mod testkit;
