//! Slide Reserved nodes toward Root so free space collects at the region end.
//!
//! The pass keeps a cursor on the first Free node. While its successor is
//! Reserved the two swap places: the Reserved node's bytes move down to the
//! cursor and the Free node is rewritten right behind it. A Free successor is
//! merged instead. The pass ends when the cursor's successor is Root.
//!
//! Each swap leaves a sound ring behind, so an interrupted compaction can be
//! resumed by running it again.

use crate::check::check_ring;
use rfs_alloc::Ring;
use rfs_block::Region;
use rfs_error::{Result, RfsError};
use rfs_ondisk::{NodeHeader, NodeKind};
use rfs_types::NodeOffset;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};

/// Summary of one compaction pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionReport {
    /// Reserved nodes relocated past a Free node.
    pub moves: u64,
    /// Free nodes absorbed into the travelling Free node.
    pub merges: u64,
    pub free_nodes_before: u64,
    pub free_nodes_after: u64,
    /// Payload bytes held by Free nodes once the pass is done.
    pub free_bytes: u64,
}

impl fmt::Display for CompactionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "moved {} nodes, merged {} free nodes; free nodes {} -> {}, {} bytes free",
            self.moves, self.merges, self.free_nodes_before, self.free_nodes_after, self.free_bytes
        )
    }
}

fn first_free<R: Region>(ring: &Ring<R>) -> Result<Option<NodeOffset>> {
    for entry in ring.nodes() {
        let (node, header) = entry?;
        if header.is_free() {
            return Ok(Some(node));
        }
    }
    Ok(None)
}

/// Absorb the Free node following `free_at`.
fn merge_next<R: Region>(
    ring: &mut Ring<R>,
    free_at: NodeOffset,
    mut free: NodeHeader,
    next: &NodeHeader,
) -> Result<()> {
    free.size = free
        .size
        .checked_add(next.size)
        .ok_or_else(|| RfsError::Corruption {
            offset: free_at.0,
            detail: format!("merged size {} + {} overflows u64", free.size, next.size),
        })?;
    ring.write_header(free_at, &free)?;
    let after = ring.step(free_at, free.size);
    ring.set_previous_size(after, free.size)
}

/// Swap the Free node at `free_at` with the Reserved node right after it.
/// Returns the Free node's new position.
fn swap_with_next<R: Region>(
    ring: &mut Ring<R>,
    free_at: NodeOffset,
    free: &NodeHeader,
    reserved_at: NodeOffset,
    reserved: &NodeHeader,
) -> Result<NodeOffset> {
    // Source and destination overlap whenever the Free node is smaller than
    // the Reserved one; `copy_within` handles that.
    ring.copy_within(reserved_at, reserved.size, free_at)?;
    let mut moved = reserved.clone();
    moved.previous_size = free.previous_size;
    ring.write_header(free_at, &moved)?;

    let new_free_at = ring.step(free_at, reserved.size);
    ring.write_header(new_free_at, &NodeHeader::free(free.size, reserved.size))?;
    let after = ring.step(new_free_at, free.size);
    ring.set_previous_size(after, free.size)?;
    debug!(
        from = reserved_at.0,
        to = free_at.0,
        free_at = new_free_at.0,
        "relocated reserved node"
    );
    Ok(new_free_at)
}

/// Compact `ring` in place.
///
/// Refuses to touch a ring the checker does not consider sound; the fault is
/// returned as [`RfsError::Corruption`].
pub fn compact<R: Region>(ring: &mut Ring<R>) -> Result<CompactionReport> {
    let check = check_ring(ring);
    if let Some(fault) = check.fault {
        return Err(RfsError::Corruption {
            offset: fault.offset,
            detail: format!("refusing to compact: {} ({})", fault.detail, fault.kind),
        });
    }

    let mut report = CompactionReport {
        free_nodes_before: check.free_nodes,
        ..CompactionReport::default()
    };

    if let Some(mut cursor) = first_free(ring)? {
        loop {
            let free = ring.header_of_kind(cursor, NodeKind::Free)?;
            let next_at = ring.step(cursor, free.size);
            if next_at.is_root() {
                break;
            }
            let next = ring.header(next_at)?;
            match next.kind() {
                Some(NodeKind::Free) => {
                    merge_next(ring, cursor, free, &next)?;
                    report.merges += 1;
                }
                Some(NodeKind::Reserved) => {
                    cursor = swap_with_next(ring, cursor, &free, next_at, &next)?;
                    report.moves += 1;
                }
                Some(NodeKind::Root) | None => {
                    return Err(RfsError::WrongNodeType {
                        offset: next_at.0,
                        expected: NodeKind::Reserved.name(),
                        actual: next.kind().map_or("unknown", NodeKind::name).to_owned(),
                    });
                }
            }
        }
    }

    report.free_nodes_after = ring.count(NodeKind::Free)?;
    report.free_bytes = ring.total_bytes(NodeKind::Free)?;
    info!(
        moves = report.moves,
        merges = report.merges,
        free_bytes = report.free_bytes,
        "compaction finished"
    );
    Ok(report)
}
