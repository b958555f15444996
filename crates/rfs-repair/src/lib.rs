#![forbid(unsafe_code)]
//! Consistency checking and compaction for RingFS images.
//!
//! [`check`] walks the ring once and classifies the first structural fault.
//! It never mutates the region and reports faults as data, not errors.
//! [`compact`] slides every Reserved node toward Root so that all free space
//! ends up in one node at the end of the region.

pub mod check;
pub mod compact;

pub use check::{CheckReport, Fault, FaultKind, check_image, check_ring};
pub use compact::{CompactionReport, compact};
