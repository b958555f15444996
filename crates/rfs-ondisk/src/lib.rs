#![forbid(unsafe_code)]
//! On-disk format for RingFS node headers.
//!
//! Pure codec crate, no I/O. A region is a ring of nodes; each node is a
//! packed little-endian header followed by its payload bytes. This crate
//! encodes and decodes that header and converts its timestamps.

pub mod node;

pub use node::{NodeHeader, NodeKind, NodeTime};
