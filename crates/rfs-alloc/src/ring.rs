#![forbid(unsafe_code)]
//! The node ring: handle, header access, and navigation.
//!
//! Every position is a [`NodeOffset`] into the region. All wraparound and
//! bounds logic lives in [`Ring::step`] and [`Ring::node_range`]; nothing
//! else in the workspace does offset arithmetic on raw positions.

use rfs_block::Region;
use rfs_error::{Result, RfsError};
use rfs_ondisk::{NodeHeader, NodeKind, NodeTime};
use rfs_types::{
    MIN_REGION_SIZE, NODE_HEADER_SIZE, NODE_HEADER_SIZE_U64, NodeOffset, ParseError, RFS_MAGIC,
    name_hash, read_le_u16, u64_to_usize,
};
use serde::{Deserialize, Serialize};
use std::ops::Range;
use tracing::{info, trace};

// ── Options ─────────────────────────────────────────────────────────────────

/// Parameters for [`Ring::format`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatOptions {
    /// Overwrite a region that already carries the RingFS signature.
    pub force: bool,
    /// Owner of the Root node.
    pub uid: u32,
    pub gid: u32,
}

/// Parameters for [`Ring::open`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenOptions {
    /// Skip the Root signature check. Used by diagnostics that must look at
    /// damaged images.
    pub skip_validation: bool,
}

pub(crate) fn corruption(node: NodeOffset, err: &ParseError) -> RfsError {
    RfsError::Corruption {
        offset: node.0,
        detail: err.to_string(),
    }
}

// ── Ring handle ─────────────────────────────────────────────────────────────

/// Handle over a formatted region.
///
/// Owns the region for its lifetime. Dropping the ring drops the region
/// (unmapping it for an [`rfs_block::MmapRegion`]).
#[derive(Debug)]
pub struct Ring<R: Region> {
    region: R,
}

impl<R: Region> Ring<R> {
    /// Write a fresh Root node followed by one Free node spanning the rest.
    pub fn format(mut region: R, options: &FormatOptions) -> Result<Self> {
        let len = region.len_bytes();
        if len < MIN_REGION_SIZE {
            return Err(RfsError::Format(format!(
                "region of {len} bytes is smaller than the minimum of {MIN_REGION_SIZE}"
            )));
        }
        if !options.force && read_le_u16(region.bytes(), 0).ok() == Some(RFS_MAGIC) {
            return Err(RfsError::Format(
                "region already holds a RingFS signature; format with force to overwrite"
                    .to_owned(),
            ));
        }

        let free_size = len - NODE_HEADER_SIZE_U64;
        let root = NodeHeader::root(
            NODE_HEADER_SIZE_U64,
            free_size,
            options.uid,
            options.gid,
            NodeTime::now(),
        );
        let free = NodeHeader::free(free_size, NODE_HEADER_SIZE_U64);

        let bytes = region.bytes_mut();
        root.write_to(&mut bytes[..NODE_HEADER_SIZE])
            .map_err(|err| corruption(NodeOffset::ROOT, &err))?;
        free.write_to(&mut bytes[NODE_HEADER_SIZE..])
            .map_err(|err| corruption(NodeOffset(NODE_HEADER_SIZE_U64), &err))?;
        region.sync_range(0, 2 * NODE_HEADER_SIZE_U64)?;

        info!(region_len = len, free_bytes = free.capacity(), "formatted region");
        Ok(Self { region })
    }

    /// Take over an already formatted region.
    pub fn open(region: R, options: &OpenOptions) -> Result<Self> {
        let ring = Self::new_unchecked(region);
        if options.skip_validation {
            return Ok(ring);
        }
        let len = ring.len();
        if len < MIN_REGION_SIZE {
            return Err(RfsError::Format(format!(
                "region of {len} bytes is smaller than the minimum of {MIN_REGION_SIZE}"
            )));
        }
        let root = ring
            .raw_header(NodeOffset::ROOT)
            .map_err(|err| RfsError::Format(err.to_string()))?;
        match root.validate() {
            Ok(NodeKind::Root) => {}
            Ok(other) => {
                return Err(RfsError::Format(format!(
                    "node at offset 0 is {other}, expected root"
                )));
            }
            Err(err) => return Err(RfsError::Format(err.to_string())),
        }
        trace!(region_len = len, "opened ring");
        Ok(ring)
    }

    /// Wrap a region without looking at its contents.
    #[must_use]
    pub fn new_unchecked(region: R) -> Self {
        Self { region }
    }

    #[must_use]
    pub fn region(&self) -> &R {
        &self.region
    }

    #[must_use]
    pub fn into_region(self) -> R {
        self.region
    }

    /// Region size in bytes.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.region.len_bytes()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        self.region.bytes()
    }

    // ── Navigation ──────────────────────────────────────────────────────────

    /// Reduce any position into `[0, len)`.
    #[must_use]
    pub fn wrap(&self, position: u64) -> NodeOffset {
        let len = self.len();
        if len == 0 {
            return NodeOffset::ROOT;
        }
        NodeOffset(position % len)
    }

    /// Move `delta` bytes forward from `node`, wrapping at the region end.
    #[must_use]
    pub fn step(&self, node: NodeOffset, delta: u64) -> NodeOffset {
        let len = u128::from(self.len());
        if len == 0 {
            return NodeOffset::ROOT;
        }
        let advanced = (u128::from(node.0) + u128::from(delta)) % len;
        // `advanced < len <= u64::MAX`.
        NodeOffset(u64::try_from(advanced).unwrap_or(0))
    }

    /// Move `delta` bytes backward from `node`, wrapping at the region start.
    #[must_use]
    pub fn step_back(&self, node: NodeOffset, delta: u64) -> NodeOffset {
        let len = self.len();
        if len == 0 {
            return NodeOffset::ROOT;
        }
        let delta = delta % len;
        let node = node.0 % len;
        if delta <= node {
            NodeOffset(node - delta)
        } else {
            NodeOffset(len - (delta - node))
        }
    }

    /// Node following `node` in ring order.
    pub fn next(&self, node: NodeOffset) -> Result<NodeOffset> {
        let header = self.header(node)?;
        Ok(self.step(node, header.size))
    }

    /// Node preceding `node` in ring order.
    pub fn previous(&self, node: NodeOffset) -> Result<NodeOffset> {
        let header = self.header(node)?;
        Ok(self.step_back(node, header.previous_size))
    }

    /// Byte position of `node` relative to the region start.
    #[must_use]
    pub fn position_of(&self, node: NodeOffset) -> u64 {
        node.0
    }

    /// Whether a full header fits at `node`.
    #[must_use]
    pub fn contains(&self, node: NodeOffset) -> bool {
        node.0
            .checked_add(NODE_HEADER_SIZE_U64)
            .is_some_and(|end| end <= self.len())
    }

    fn node_range(&self, node: NodeOffset, len: u64) -> Result<Range<usize>> {
        let out_of_range = || RfsError::Corruption {
            offset: node.0,
            detail: format!("{len} bytes at this offset exceed region of {}", self.len()),
        };
        let end = node.0.checked_add(len).ok_or_else(out_of_range)?;
        if end > self.len() {
            return Err(out_of_range());
        }
        let start = u64_to_usize(node.0, "node_offset").map_err(|err| corruption(node, &err))?;
        let end = u64_to_usize(end, "node_end").map_err(|err| corruption(node, &err))?;
        Ok(start..end)
    }

    // ── Header access ───────────────────────────────────────────────────────

    /// Decode the header at `node` without validating signature or type.
    pub fn raw_header(&self, node: NodeOffset) -> Result<NodeHeader> {
        let range = self.node_range(node, NODE_HEADER_SIZE_U64)?;
        NodeHeader::parse(&self.bytes()[range]).map_err(|err| corruption(node, &err))
    }

    /// Decode and validate the header at `node`.
    pub fn header(&self, node: NodeOffset) -> Result<NodeHeader> {
        let header = self.raw_header(node)?;
        header.validate().map_err(|err| corruption(node, &err))?;
        if header.size < NODE_HEADER_SIZE_U64 {
            return Err(RfsError::Corruption {
                offset: node.0,
                detail: format!("node size {} is smaller than a header", header.size),
            });
        }
        header
            .validate_contents()
            .map_err(|err| corruption(node, &err))?;
        Ok(header)
    }

    /// Decode the header at `node`, requiring it to be of `kind`.
    pub fn header_of_kind(&self, node: NodeOffset, kind: NodeKind) -> Result<NodeHeader> {
        let header = self.header(node)?;
        if header.kind() == Some(kind) {
            Ok(header)
        } else {
            Err(RfsError::WrongNodeType {
                offset: node.0,
                expected: kind.name(),
                actual: header.kind().map_or("unknown", NodeKind::name).to_owned(),
            })
        }
    }

    /// Encode `header` at `node` and sync the header range.
    pub fn write_header(&mut self, node: NodeOffset, header: &NodeHeader) -> Result<()> {
        let range = self.node_range(node, NODE_HEADER_SIZE_U64)?;
        header
            .write_to(&mut self.region.bytes_mut()[range])
            .map_err(|err| corruption(node, &err))?;
        self.region.sync_range(node.0, NODE_HEADER_SIZE_U64)
    }

    /// Rewrite the `previous_size` link of `node`.
    pub fn set_previous_size(&mut self, node: NodeOffset, previous_size: u64) -> Result<()> {
        let mut header = self.header(node)?;
        header.previous_size = previous_size;
        self.write_header(node, &header)
    }

    // ── Payload access ──────────────────────────────────────────────────────

    fn payload_range(&self, node: NodeOffset, header: &NodeHeader) -> Result<Range<usize>> {
        self.node_range(node, header.size.max(NODE_HEADER_SIZE_U64))
            .map(|range| range.start + NODE_HEADER_SIZE..range.end)
    }

    /// Payload bytes of `node` (its full capacity, not just `data_size`).
    pub fn payload(&self, node: NodeOffset) -> Result<&[u8]> {
        let header = self.header(node)?;
        let range = self.payload_range(node, &header)?;
        Ok(&self.bytes()[range])
    }

    pub fn payload_mut(&mut self, node: NodeOffset) -> Result<&mut [u8]> {
        let header = self.header(node)?;
        let range = self.payload_range(node, &header)?;
        Ok(&mut self.region.bytes_mut()[range])
    }

    /// Sync `len` payload bytes of `node` starting `start` bytes into the
    /// payload.
    pub fn sync_payload(&mut self, node: NodeOffset, start: u64, len: u64) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let offset = node
            .payload()
            .and_then(|payload| payload.checked_add(start))
            .ok_or_else(|| RfsError::Corruption {
                offset: node.0,
                detail: "payload offset overflows u64".to_owned(),
            })?;
        self.region.sync_range(offset, len)
    }

    /// Copy bytes within the region, as `slice::copy_within`.
    pub fn copy_within(&mut self, from: NodeOffset, len: u64, to: NodeOffset) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let source = self.node_range(from, len)?;
        self.node_range(to, len)?;
        let dest = u64_to_usize(to.0, "node_offset").map_err(|err| corruption(to, &err))?;
        self.region.bytes_mut().copy_within(source, dest);
        self.region.sync_range(to.0, len)
    }

    // ── Traversal ───────────────────────────────────────────────────────────

    /// Walk the ring once, starting at Root.
    ///
    /// Stops after returning to Root, after an unreadable header (yielded as
    /// `Err`), or after more steps than the region could hold nodes.
    #[must_use]
    pub fn nodes(&self) -> Nodes<'_, R> {
        Nodes {
            ring: self,
            current: Some(NodeOffset::ROOT),
            remaining: self.len() / NODE_HEADER_SIZE_U64 + 1,
        }
    }

    /// First node named `name`, scanning from Root.
    ///
    /// Matches Reserved nodes, and the Root node too when `include_root`.
    pub fn find_by_name(
        &self,
        name: &[u8],
        include_root: bool,
    ) -> Result<Option<(NodeOffset, NodeHeader)>> {
        let hash = name_hash(name);
        for entry in self.nodes() {
            let (node, header) = entry?;
            let wanted = header.is_reserved() || (include_root && header.is_root());
            if wanted && header.name_matches(name, hash) {
                trace!(offset = node.0, "name lookup hit");
                return Ok(Some((node, header)));
            }
        }
        trace!(name = %String::from_utf8_lossy(name), "name lookup miss");
        Ok(None)
    }

    /// Number of nodes of `kind`.
    pub fn count(&self, kind: NodeKind) -> Result<u64> {
        let mut count = 0_u64;
        for entry in self.nodes() {
            let (_, header) = entry?;
            if header.kind() == Some(kind) {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Payload bytes (size minus header) summed over nodes of `kind`.
    pub fn total_bytes(&self, kind: NodeKind) -> Result<u64> {
        let mut total = 0_u64;
        for entry in self.nodes() {
            let (_, header) = entry?;
            if header.kind() == Some(kind) {
                total = total.saturating_add(header.capacity());
            }
        }
        Ok(total)
    }

    /// Concatenated header bytes of every node, in ring order.
    ///
    /// Two snapshots compare equal iff no header was touched in between.
    pub fn header_snapshot(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for entry in self.nodes() {
            let (_, header) = entry?;
            out.extend_from_slice(&header.to_bytes());
        }
        Ok(out)
    }
}

/// Iterator returned by [`Ring::nodes`].
#[derive(Debug)]
pub struct Nodes<'a, R: Region> {
    ring: &'a Ring<R>,
    current: Option<NodeOffset>,
    remaining: u64,
}

impl<R: Region> Iterator for Nodes<'_, R> {
    type Item = Result<(NodeOffset, NodeHeader)>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.current.take()?;
        if self.remaining == 0 {
            return Some(Err(RfsError::Corruption {
                offset: node.0,
                detail: "ring does not close within the region".to_owned(),
            }));
        }
        self.remaining -= 1;
        match self.ring.header(node) {
            Ok(header) => {
                let next = self.ring.step(node, header.size);
                if !next.is_root() {
                    self.current = Some(next);
                }
                Some(Ok((node, header)))
            }
            Err(err) => Some(Err(err)),
        }
    }
}
