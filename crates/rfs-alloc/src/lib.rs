#![forbid(unsafe_code)]
//! Node allocation over the RingFS ring.
//!
//! The region is a circular heap: a Root node at offset 0 followed by Free
//! and Reserved nodes whose sizes add up to the region length. This crate
//! owns every structural mutation of that heap.
//!
//! ## Design
//!
//! 1. **Ring** ([`ring`]) wraps the region and is the only place that turns
//!    node offsets into byte ranges.
//! 2. **Allocator** (this module) implements first-fit [`Ring::allocate`],
//!    in-place or relocating [`Ring::resize`], and coalescing [`Ring::free`].
//!
//! After each allocator call returns `Ok`, no two ring-adjacent Free nodes
//! remain, every `previous_size` link matches its predecessor, and every
//! touched header has been synced.

pub mod ring;

pub use ring::{FormatOptions, Nodes, OpenOptions, Ring};

use rfs_block::Region;
use rfs_error::{Result, RfsError};
use rfs_ondisk::{NodeHeader, NodeKind};
use rfs_types::{NODE_HEADER_SIZE_U64, NodeOffset};
use tracing::{debug, trace};

fn total_size(data_size: u64) -> Result<u64> {
    data_size
        .checked_add(NODE_HEADER_SIZE_U64)
        .ok_or(RfsError::NoSpace)
}

impl<R: Region> Ring<R> {
    // ── allocate ────────────────────────────────────────────────────────────

    /// Reserve a node able to hold `data_size` payload bytes.
    ///
    /// First fit, scanning from Root. When `source` is given its metadata and
    /// up to `data_size` bytes of its payload are copied into the new node.
    /// On `NoSpace` the ring is left untouched.
    pub fn allocate(&mut self, data_size: u64, source: Option<NodeOffset>) -> Result<NodeOffset> {
        let needed = total_size(data_size)?;
        let source = match source {
            Some(node) => Some((node, self.header_of_kind(node, NodeKind::Reserved)?)),
            None => None,
        };

        let mut found = None;
        for entry in self.nodes() {
            let (node, header) = entry?;
            if header.is_free() && header.size >= needed {
                found = Some((node, header));
                break;
            }
        }
        let Some((node, free)) = found else {
            trace!(data_size, "no free node large enough");
            return Err(RfsError::NoSpace);
        };

        let remainder = free.size - needed;
        let size = if remainder >= NODE_HEADER_SIZE_U64 {
            let tail = self.step(node, needed);
            self.write_header(tail, &NodeHeader::free(remainder, needed))?;
            let after = self.step(tail, remainder);
            self.set_previous_size(after, remainder)?;
            debug!(
                offset = node.0,
                reserved = needed,
                remainder,
                "split free node"
            );
            needed
        } else {
            free.size
        };

        let mut reserved = NodeHeader::reserved(size, free.previous_size);
        reserved.data_size = data_size;
        if let Some((_, original)) = &source {
            reserved.copy_metadata_from(original);
        }
        self.write_header(node, &reserved)?;

        if let Some((from, original)) = source {
            let copied = original.data_size.min(data_size);
            let (Some(src), Some(dst)) = (from.payload(), node.payload()) else {
                return Err(RfsError::Corruption {
                    offset: node.0,
                    detail: "payload offset overflows u64".to_owned(),
                });
            };
            self.copy_within(NodeOffset(src), copied, NodeOffset(dst))?;
            debug!(from = from.0, to = node.0, copied, "copied node for relocation");
        }

        Ok(node)
    }

    // ── resize ──────────────────────────────────────────────────────────────

    /// Change the payload size of a Reserved node.
    ///
    /// Returns the node's offset afterwards, which differs from `node` when
    /// the node had to be relocated to grow.
    pub fn resize(&mut self, node: NodeOffset, data_size: u64) -> Result<NodeOffset> {
        let mut header = self.header_of_kind(node, NodeKind::Reserved)?;
        let needed = total_size(data_size)?;

        if needed == header.size {
            if header.data_size != data_size {
                header.data_size = data_size;
                self.write_header(node, &header)?;
            }
            return Ok(node);
        }

        let next = self.step(node, header.size);
        let next_header = self.header(next)?;

        if needed > header.size {
            let delta = needed - header.size;
            if !next.is_root() && next_header.is_free() && next_header.size >= delta {
                self.grow_in_place(node, &mut header, data_size, delta, &next_header)?;
                return Ok(node);
            }
            let moved = self.allocate(data_size, Some(node))?;
            self.free(node)?;
            debug!(from = node.0, to = moved.0, data_size, "relocated node to grow");
            return Ok(moved);
        }

        let delta = header.size - needed;
        if next_header.is_free() {
            header.size = needed;
            header.data_size = data_size;
            self.write_header(node, &header)?;
            let merged = merged_size(next, delta, next_header.size)?;
            let tail = self.step(node, needed);
            self.write_header(tail, &NodeHeader::free(merged, needed))?;
            let after = self.step(tail, merged);
            self.set_previous_size(after, merged)?;
            debug!(offset = node.0, released = delta, "shrunk into following free node");
        } else if delta < NODE_HEADER_SIZE_U64 {
            header.data_size = data_size;
            self.write_header(node, &header)?;
            trace!(offset = node.0, slack = delta, "kept shrink slack inside node");
        } else {
            header.size = needed;
            header.data_size = data_size;
            self.write_header(node, &header)?;
            let tail = self.step(node, needed);
            self.write_header(tail, &NodeHeader::free(delta, needed))?;
            self.set_previous_size(next, delta)?;
            debug!(offset = node.0, released = delta, "carved free node from shrink");
        }
        Ok(node)
    }

    fn grow_in_place(
        &mut self,
        node: NodeOffset,
        header: &mut NodeHeader,
        data_size: u64,
        delta: u64,
        next_header: &NodeHeader,
    ) -> Result<()> {
        let leftover = next_header.size - delta;
        header.size += delta;
        header.data_size = data_size;
        if leftover > 0 && leftover < NODE_HEADER_SIZE_U64 {
            header.size += leftover;
        }
        self.write_header(node, header)?;

        let mut last_size = header.size;
        let mut last = node;
        if leftover >= NODE_HEADER_SIZE_U64 {
            let tail = self.step(node, header.size);
            self.write_header(tail, &NodeHeader::free(leftover, header.size))?;
            last = tail;
            last_size = leftover;
        }
        let after = self.step(last, last_size);
        self.set_previous_size(after, last_size)?;
        debug!(offset = node.0, grown_by = delta, leftover, "grew node in place");
        Ok(())
    }

    // ── free ────────────────────────────────────────────────────────────────

    /// Release a Reserved node, merging it with Free neighbours.
    pub fn free(&mut self, node: NodeOffset) -> Result<()> {
        let header = self.header_of_kind(node, NodeKind::Reserved)?;
        let mut merged_at = node;
        let mut merged = NodeHeader::free(header.size, header.previous_size);

        let next = self.step(node, header.size);
        if !next.is_root() {
            let next_header = self.header(next)?;
            if next_header.is_free() {
                merged.size = merged_size(next, merged.size, next_header.size)?;
                trace!(offset = node.0, absorbed = next.0, "merged with next free node");
            }
        }

        if !node.is_root() {
            let previous = self.step_back(node, header.previous_size);
            let previous_header = self.header(previous)?;
            if previous_header.is_free() {
                merged = NodeHeader::free(
                    merged_size(previous, previous_header.size, merged.size)?,
                    previous_header.previous_size,
                );
                merged_at = previous;
                trace!(offset = node.0, into = previous.0, "merged into previous free node");
            }
        }

        self.write_header(merged_at, &merged)?;
        if merged.size != header.size {
            let after = self.step(merged_at, merged.size);
            self.set_previous_size(after, merged.size)?;
        }
        debug!(offset = merged_at.0, size = merged.size, "freed node");
        Ok(())
    }
}

/// Size of two adjacent nodes merged into one.
fn merged_size(node: NodeOffset, first: u64, second: u64) -> Result<u64> {
    first.checked_add(second).ok_or_else(|| RfsError::Corruption {
        offset: node.0,
        detail: format!("merged size {first} + {second} overflows u64"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rfs_block::MemRegion;
    use rfs_types::NODE_HEADER_SIZE;

    const H: u64 = NODE_HEADER_SIZE_U64;

    fn formatted(len: usize) -> Ring<MemRegion> {
        Ring::format(MemRegion::new(len), &FormatOptions::default()).expect("format")
    }

    fn layout(ring: &Ring<MemRegion>) -> Vec<(u64, NodeKind, u64)> {
        ring.nodes()
            .map(|entry| {
                let (node, header) = entry.expect("walk");
                (node.0, header.kind().expect("kind"), header.size)
            })
            .collect()
    }

    /// Structural invariants that must hold after every allocator call.
    fn assert_sound(ring: &Ring<MemRegion>) {
        let nodes: Vec<_> = ring.nodes().collect::<Result<_>>().expect("walk");
        let total: u64 = nodes.iter().map(|(_, h)| h.size).sum();
        assert_eq!(total, ring.len(), "sizes must cover the region");
        let roots = nodes.iter().filter(|(_, h)| h.is_root()).count();
        assert_eq!(roots, 1);
        assert!(nodes[0].0.is_root());
        for pair in nodes.windows(2) {
            assert_eq!(pair[1].1.previous_size, pair[0].1.size, "link at {}", pair[1].0);
            assert!(
                !(pair[0].1.is_free() && pair[1].1.is_free()),
                "adjacent free nodes at {} and {}",
                pair[0].0,
                pair[1].0
            );
        }
        let last = nodes.last().expect("nonempty");
        assert_eq!(nodes[0].1.previous_size, last.1.size);
        for (_, header) in &nodes {
            if header.is_reserved() {
                assert!(header.data_size <= header.capacity());
            }
        }
    }

    #[test]
    fn allocate_splits_first_fit() {
        let mut ring = formatted(1024 * 1024);
        let a = ring.allocate(100, None).expect("allocate");
        assert_eq!(a.0, H);
        let header = ring.header(a).expect("header");
        assert!(header.is_reserved());
        assert_eq!(header.size, H + 100);
        assert_eq!(header.data_size, 100);
        assert_eq!(ring.count(NodeKind::Reserved).expect("count"), 1);
        assert_eq!(ring.nodes().count(), 3);
        assert_sound(&ring);
    }

    #[test]
    fn allocate_takes_whole_node_when_remainder_is_too_small() {
        let mut ring = formatted(3 * NODE_HEADER_SIZE + 10);
        // Free node holds H + 10 payload bytes: a 20-byte request leaves a
        // remainder of H - 10, too small for a header.
        let a = ring.allocate(20, None).expect("allocate");
        let header = ring.header(a).expect("header");
        assert_eq!(header.size, 2 * H + 10);
        assert_eq!(header.data_size, 20);
        assert_eq!(ring.count(NodeKind::Free).expect("count"), 0);
        assert_sound(&ring);
    }

    #[test]
    fn allocate_exhaustion_leaves_ring_unchanged() {
        let mut ring = formatted(4096);
        ring.allocate(1000, None).expect("allocate");
        let before = ring.header_snapshot().expect("snapshot");
        let largest = ring.total_bytes(NodeKind::Free).expect("free");
        assert!(matches!(
            ring.allocate(largest + 1, None),
            Err(RfsError::NoSpace)
        ));
        assert!(matches!(ring.allocate(u64::MAX, None), Err(RfsError::NoSpace)));
        assert_eq!(ring.header_snapshot().expect("snapshot"), before);
    }

    #[test]
    fn allocate_exact_fit_uses_first_free_node() {
        let mut ring = formatted(8192);
        let a = ring.allocate(400, None).expect("a");
        let b = ring.allocate(400, None).expect("b");
        let _c = ring.allocate(400, None).expect("c");
        ring.free(a).expect("free a");
        ring.free(b).expect("free b");
        // a and b coalesced into one free span at a's position.
        let d = ring.allocate(400, None).expect("d");
        assert_eq!(d, a);
        assert_sound(&ring);
    }

    #[test]
    fn allocate_with_source_copies_metadata_and_payload() {
        let mut ring = formatted(8192);
        let a = ring.allocate(5, None).expect("a");
        let mut header = ring.header(a).expect("header");
        header.set_name(b"hello").expect("name");
        header.uid = 42;
        ring.write_header(a, &header).expect("write");
        ring.payload_mut(a).expect("payload")[..5].copy_from_slice(b"world");

        let copy = ring.allocate(50, Some(a)).expect("copy");
        let copied = ring.header(copy).expect("header");
        assert_eq!(copied.name_bytes(), b"hello");
        assert_eq!(copied.uid, 42);
        assert_eq!(copied.data_size, 50);
        assert_eq!(&ring.payload(copy).expect("payload")[..5], b"world");
    }

    #[test]
    fn allocate_rejects_non_reserved_source() {
        let mut ring = formatted(4096);
        assert!(matches!(
            ring.allocate(10, Some(NodeOffset::ROOT)),
            Err(RfsError::WrongNodeType { .. })
        ));
    }

    #[test]
    fn resize_grows_in_place_into_following_free_node() {
        let mut ring = formatted(4096);
        let a = ring.allocate(10, None).expect("a");
        let grown = ring.resize(a, 500).expect("grow");
        assert_eq!(grown, a);
        let header = ring.header(a).expect("header");
        assert_eq!(header.size, H + 500);
        assert_eq!(header.data_size, 500);
        assert_sound(&ring);
    }

    #[test]
    fn resize_absorbs_leftover_smaller_than_a_header() {
        let mut ring = formatted(4096);
        let a = ring.allocate(10, None).expect("a");
        let free_capacity = ring.total_bytes(NodeKind::Free).expect("free");
        // Leave H / 2 bytes in the free node: too small to stand alone.
        let target = 10 + free_capacity + H - H / 2;
        ring.resize(a, target).expect("grow");
        assert_eq!(ring.count(NodeKind::Free).expect("count"), 0);
        let header = ring.header(a).expect("header");
        assert_eq!(header.size, 4096 - H);
        assert_eq!(header.data_size, target);
        assert_sound(&ring);
    }

    #[test]
    fn resize_relocates_when_next_node_is_reserved() {
        let mut ring = formatted(8192);
        let a = ring.allocate(10, None).expect("a");
        let b = ring.allocate(10, None).expect("b");
        ring.payload_mut(a).expect("payload")[..10].copy_from_slice(b"0123456789");
        let moved = ring.resize(a, 600).expect("grow");
        assert_ne!(moved, a);
        assert!(moved.0 > b.0);
        let header = ring.header(moved).expect("header");
        assert_eq!(header.data_size, 600);
        assert_eq!(&ring.payload(moved).expect("payload")[..10], b"0123456789");
        assert!(ring.header(a).expect("old").is_free());
        assert_sound(&ring);
    }

    #[test]
    fn resize_relocation_failure_keeps_original() {
        let mut ring = formatted(2048);
        let a = ring.allocate(10, None).expect("a");
        let _b = ring.allocate(10, None).expect("b");
        let before = ring.header_snapshot().expect("snapshot");
        assert!(matches!(ring.resize(a, 4096), Err(RfsError::NoSpace)));
        assert_eq!(ring.header_snapshot().expect("snapshot"), before);
    }

    #[test]
    fn resize_shrink_merges_into_following_free_node() {
        let mut ring = formatted(4096);
        let a = ring.allocate(1000, None).expect("a");
        let free_before = ring.total_bytes(NodeKind::Free).expect("free");
        ring.resize(a, 100).expect("shrink");
        assert_eq!(
            ring.total_bytes(NodeKind::Free).expect("free"),
            free_before + 900
        );
        assert_eq!(ring.count(NodeKind::Free).expect("count"), 1);
        assert_sound(&ring);
    }

    #[test]
    fn resize_shrink_carves_free_node_before_reserved_neighbour() {
        let mut ring = formatted(8192);
        let a = ring.allocate(1000, None).expect("a");
        let _b = ring.allocate(10, None).expect("b");
        ring.resize(a, 100).expect("shrink");
        let kinds: Vec<_> = layout(&ring).into_iter().map(|(_, k, _)| k).collect();
        assert_eq!(
            kinds,
            vec![
                NodeKind::Root,
                NodeKind::Reserved,
                NodeKind::Free,
                NodeKind::Reserved,
                NodeKind::Free
            ]
        );
        assert_sound(&ring);
    }

    #[test]
    fn resize_small_shrink_keeps_slack() {
        let mut ring = formatted(8192);
        let a = ring.allocate(1000, None).expect("a");
        let _b = ring.allocate(10, None).expect("b");
        ring.resize(a, 990).expect("shrink");
        let header = ring.header(a).expect("header");
        assert_eq!(header.size, H + 1000);
        assert_eq!(header.data_size, 990);
        assert_sound(&ring);
    }

    #[test]
    fn resize_same_total_updates_data_size_only() {
        let mut ring = formatted(4096);
        let a = ring.allocate(100, None).expect("a");
        let before = ring.header(a).expect("header");
        assert_eq!(ring.resize(a, 100).expect("noop"), a);
        assert_eq!(ring.header(a).expect("header"), before);
    }

    #[test]
    fn free_coalesces_both_neighbours() {
        let mut ring = formatted(8192);
        let a = ring.allocate(100, None).expect("a");
        let b = ring.allocate(100, None).expect("b");
        let c = ring.allocate(100, None).expect("c");
        let _d = ring.allocate(100, None).expect("d");
        ring.free(a).expect("free a");
        ring.free(c).expect("free c");
        assert_eq!(ring.count(NodeKind::Free).expect("count"), 3);
        ring.free(b).expect("free b");
        assert_eq!(ring.count(NodeKind::Free).expect("count"), 2);
        let (_, first_free) = ring
            .nodes()
            .map(|entry| entry.expect("walk"))
            .find(|(_, h)| h.is_free())
            .expect("free node");
        assert_eq!(first_free.size, 3 * (H + 100));
        assert_sound(&ring);
    }

    #[test]
    fn free_reports_overflowing_neighbour_size() {
        let mut ring = formatted(4096);
        let a = ring.allocate(10, None).expect("a");
        let tail = ring.step(a, H + 10);
        let mut free = ring.header(tail).expect("tail");
        free.size = u64::MAX - 5;
        ring.write_header(tail, &free).expect("write");

        assert!(matches!(
            ring.free(a),
            Err(RfsError::Corruption { offset, .. }) if offset == tail.0
        ));
        assert!(ring.header(a).expect("a").is_reserved());
    }

    #[test]
    fn free_of_last_node_restores_formatted_layout() {
        let mut ring = formatted(4096);
        let a = ring.allocate(100, None).expect("a");
        ring.free(a).expect("free");
        assert_eq!(
            layout(&ring),
            vec![(0, NodeKind::Root, H), (H, NodeKind::Free, 4096 - H)]
        );
        assert_sound(&ring);
    }

    #[test]
    fn free_rejects_non_reserved_nodes() {
        let mut ring = formatted(4096);
        assert!(matches!(
            ring.free(NodeOffset::ROOT),
            Err(RfsError::WrongNodeType { .. })
        ));
        assert!(matches!(
            ring.free(NodeOffset(H)),
            Err(RfsError::WrongNodeType { .. })
        ));
    }

    #[test]
    fn free_of_node_spanning_region_end_links_to_root() {
        let mut ring = formatted(3 * NODE_HEADER_SIZE);
        let a = ring.allocate(H, None).expect("fills the region");
        assert_eq!(ring.count(NodeKind::Free).expect("count"), 0);
        ring.free(a).expect("free");
        let root = ring.header(NodeOffset::ROOT).expect("root");
        assert_eq!(root.previous_size, 2 * H);
        assert_sound(&ring);
    }
}
