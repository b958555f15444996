//! Read-only structural check of a node ring.
//!
//! The walk starts at Root and follows `size` links until it lands back on
//! offset 0. Each node is checked in a fixed order and the first failing
//! check ends the walk:
//!
//! 1. `previous_size` matches the size of the node just visited
//!    ([`FaultKind::BrokenLink`]).
//! 2. The node's size is at least one header and its successor header lies
//!    inside the region ([`FaultKind::OutOfRange`]).
//! 3. The signature is intact ([`FaultKind::BadSignature`]).
//! 4. The type tag is known, Root sits at offset 0 and nowhere else
//!    ([`FaultKind::UnknownType`]).
//! 5. A Reserved node's `data_size` fits its capacity (out of range) and its
//!    `id` is the hash of its name (bad signature).
//!
//! A walk that steps past the region end without landing exactly on Root,
//! or whose Root back-link disagrees with the last node, is a broken link.

use rfs_alloc::Ring;
use rfs_block::Region;
use rfs_ondisk::{NodeHeader, NodeKind};
use rfs_types::{MIN_REGION_SIZE, NODE_HEADER_SIZE_U64, RFS_MAGIC, name_hash, u64_to_usize};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, trace, warn};

// ── Fault taxonomy ──────────────────────────────────────────────────────────

/// Class of structural fault, in check priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// A `previous_size` link disagrees with the ring's forward order.
    BrokenLink,
    /// A size or link leads outside the region.
    OutOfRange,
    /// The header signature is wrong.
    BadSignature,
    /// The type tag is unknown or Root is misplaced.
    UnknownType,
}

impl FaultKind {
    /// Process exit status used by `rfs fsck` for this fault.
    #[must_use]
    pub fn exit_code(self) -> i32 {
        match self {
            Self::BrokenLink => 10,
            Self::OutOfRange => 11,
            Self::BadSignature => 12,
            Self::UnknownType => 13,
        }
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BrokenLink => write!(f, "broken_link"),
            Self::OutOfRange => write!(f, "out_of_range"),
            Self::BadSignature => write!(f, "bad_signature"),
            Self::UnknownType => write!(f, "unknown_type"),
        }
    }
}

/// The first fault found by a check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    pub kind: FaultKind,
    /// Byte offset of the offending node header.
    pub offset: u64,
    pub detail: String,
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node at {} [{}]: {}", self.offset, self.kind, self.detail)
    }
}

// ── Report ──────────────────────────────────────────────────────────────────

/// Outcome of one check pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckReport {
    pub region_size: u64,
    /// Headers visited, the faulty one included.
    pub nodes_checked: u64,
    pub free_nodes: u64,
    pub reserved_nodes: u64,
    /// Payload bytes (size minus header) held by Free nodes.
    pub free_bytes: u64,
    /// Payload bytes (size minus header) held by Reserved nodes.
    pub reserved_bytes: u64,
    pub fault: Option<Fault>,
}

impl CheckReport {
    #[must_use]
    pub fn is_sound(&self) -> bool {
        self.fault.is_none()
    }

    /// 0 when sound, otherwise the fault's exit code.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        self.fault.as_ref().map_or(0, |fault| fault.kind.exit_code())
    }

    fn tally(&mut self, header: &NodeHeader) {
        match header.kind() {
            Some(NodeKind::Free) => {
                self.free_nodes += 1;
                self.free_bytes = self.free_bytes.saturating_add(header.capacity());
            }
            Some(NodeKind::Reserved) => {
                self.reserved_nodes += 1;
                self.reserved_bytes = self.reserved_bytes.saturating_add(header.capacity());
            }
            Some(NodeKind::Root) | None => {}
        }
    }
}

impl fmt::Display for CheckReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "checked {} nodes in {} bytes: {} reserved ({} bytes), {} free ({} bytes)",
            self.nodes_checked,
            self.region_size,
            self.reserved_nodes,
            self.reserved_bytes,
            self.free_nodes,
            self.free_bytes,
        )?;
        match &self.fault {
            Some(fault) => write!(f, "; fault: {fault}"),
            None => write!(f, "; ring is sound"),
        }
    }
}

// ── Walk ────────────────────────────────────────────────────────────────────

fn fault(kind: FaultKind, offset: u64, detail: impl Into<String>) -> Fault {
    Fault {
        kind,
        offset,
        detail: detail.into(),
    }
}

fn read_header(image: &[u8], offset: u64) -> Result<NodeHeader, Fault> {
    let start = u64_to_usize(offset, "node_offset")
        .map_err(|err| fault(FaultKind::OutOfRange, offset, err.to_string()))?;
    image
        .get(start..)
        .ok_or_else(|| fault(FaultKind::OutOfRange, offset, "header outside region"))
        .and_then(|rest| {
            NodeHeader::parse(rest)
                .map_err(|err| fault(FaultKind::OutOfRange, offset, err.to_string()))
        })
}

/// Check one node and return the offset where its successor starts
/// (before wrapping).
fn check_node(
    header: &NodeHeader,
    offset: u64,
    previous_size: Option<u64>,
    len: u64,
) -> Result<u64, Fault> {
    if let Some(expected) = previous_size {
        if header.previous_size != expected {
            return Err(fault(
                FaultKind::BrokenLink,
                offset,
                format!(
                    "previous size {} does not match predecessor size {expected}",
                    header.previous_size
                ),
            ));
        }
    }

    if header.size < NODE_HEADER_SIZE_U64 {
        return Err(fault(
            FaultKind::OutOfRange,
            offset,
            format!("size {} is smaller than a header", header.size),
        ));
    }
    let end = offset
        .checked_add(header.size)
        .filter(|end| *end < len.saturating_mul(2))
        .ok_or_else(|| {
            fault(
                FaultKind::OutOfRange,
                offset,
                format!("size {} leads outside the region", header.size),
            )
        })?;
    if end < len && end + NODE_HEADER_SIZE_U64 > len {
        return Err(fault(
            FaultKind::OutOfRange,
            offset,
            format!("next node at {end} has no room for a header"),
        ));
    }

    if header.magic != RFS_MAGIC {
        return Err(fault(
            FaultKind::BadSignature,
            offset,
            format!("signature {:#06x}, expected {RFS_MAGIC:#06x}", header.magic),
        ));
    }

    match (header.kind(), offset == 0) {
        (None, _) => Err(fault(
            FaultKind::UnknownType,
            offset,
            format!("type tag {}", header.node_type),
        )),
        (Some(NodeKind::Root), true) | (Some(NodeKind::Free | NodeKind::Reserved), false) => {
            check_contents(header, offset).map(|()| end)
        }
        (Some(kind), true) => Err(fault(
            FaultKind::UnknownType,
            offset,
            format!("{kind} node where Root belongs"),
        )),
        (Some(NodeKind::Root), false) => Err(fault(
            FaultKind::UnknownType,
            offset,
            "second Root node",
        )),
    }
}

/// A Reserved node must keep its payload inside the node and its `id` equal
/// to the hash of its name.
fn check_contents(header: &NodeHeader, offset: u64) -> Result<(), Fault> {
    if !header.is_reserved() {
        return Ok(());
    }
    if header.data_size > header.capacity() {
        return Err(fault(
            FaultKind::OutOfRange,
            offset,
            format!(
                "data size {} exceeds capacity {}",
                header.data_size,
                header.capacity()
            ),
        ));
    }
    if header.id != name_hash(header.name_bytes()) {
        return Err(fault(
            FaultKind::BadSignature,
            offset,
            format!("id {:#x} is not the hash of the node name", header.id),
        ));
    }
    Ok(())
}

fn walk(image: &[u8], report: &mut CheckReport) -> Result<(), Fault> {
    let len = report.region_size;
    if len < MIN_REGION_SIZE {
        return Err(fault(
            FaultKind::OutOfRange,
            0,
            format!("region of {len} bytes cannot hold Root and one node"),
        ));
    }

    let root = read_header(image, 0)?;
    let mut offset = 0_u64;
    let mut header = root.clone();
    let mut previous_size = None;
    loop {
        report.nodes_checked += 1;
        trace!(offset, size = header.size, kind = header.node_type, "checking node");
        let end = check_node(&header, offset, previous_size, len)?;
        report.tally(&header);

        if end == len {
            if root.previous_size != header.size {
                return Err(fault(
                    FaultKind::BrokenLink,
                    0,
                    format!(
                        "root previous size {} does not match last node size {}",
                        root.previous_size, header.size
                    ),
                ));
            }
            return Ok(());
        }
        if end > len {
            return Err(fault(
                FaultKind::BrokenLink,
                offset,
                format!("ring wraps to {} instead of Root", end - len),
            ));
        }

        previous_size = Some(header.size);
        offset = end;
        header = read_header(image, offset)?;
    }
}

/// Check the ring stored in `image`.
#[must_use]
pub fn check_image(image: &[u8]) -> CheckReport {
    let mut report = CheckReport {
        region_size: image.len() as u64,
        ..CheckReport::default()
    };
    if let Err(found) = walk(image, &mut report) {
        warn!(%found, "ring check found a fault");
        report.fault = Some(found);
    }
    info!(
        nodes = report.nodes_checked,
        sound = report.is_sound(),
        "ring check finished"
    );
    report
}

/// Check the ring held by `ring`.
#[must_use]
pub fn check_ring<R: Region>(ring: &Ring<R>) -> CheckReport {
    check_image(ring.bytes())
}
