#![forbid(unsafe_code)]

use rfs_types::{
    NODE_HEADER_SIZE, NODE_HEADER_SIZE_U64, NODE_NAME_CAPACITY, NODE_NAME_MAX, ParseError,
    RFS_MAGIC, ROOT_NODE_PERMISSIONS, S_IFDIR, S_IFMT, S_IFREG, ensure_slice, name_hash,
    nul_terminated, read_fixed, read_le_i64, read_le_u16, read_le_u32, read_le_u64, write_bytes,
    write_le_i64, write_le_u16, write_le_u32, write_le_u64,
};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

// ── Field offsets (packed, little-endian) ───────────────────────────────────

const OFF_MAGIC: usize = 0;
const OFF_TYPE: usize = 2;
const OFF_ID: usize = 3;
const OFF_NAME: usize = 11;
const OFF_MODE: usize = OFF_NAME + NODE_NAME_CAPACITY;
const OFF_UID: usize = OFF_MODE + 2;
const OFF_GID: usize = OFF_UID + 4;
const OFF_ATIME: usize = OFF_GID + 4;
const OFF_MTIME: usize = OFF_ATIME + 16;
const OFF_CTIME: usize = OFF_MTIME + 16;
const OFF_SIZE: usize = OFF_CTIME + 16;
const OFF_PREVIOUS_SIZE: usize = OFF_SIZE + 8;
const OFF_DATA_SIZE: usize = OFF_PREVIOUS_SIZE + 8;

const _: () = assert!(OFF_DATA_SIZE + 8 == NODE_HEADER_SIZE);

const NANOS_PER_SEC: i64 = 1_000_000_000;

// ── Node kind ───────────────────────────────────────────────────────────────

/// Type tag stored in byte 2 of every header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum NodeKind {
    Root = 0,
    Free = 1,
    Reserved = 2,
}

impl NodeKind {
    #[must_use]
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Root),
            1 => Some(Self::Free),
            2 => Some(Self::Reserved),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_raw(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Root => "root",
            Self::Free => "free",
            Self::Reserved => "reserved",
        }
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ── Timestamps ──────────────────────────────────────────────────────────────

/// Seconds + nanoseconds since the Unix epoch, as stored on disk.
///
/// Times before the epoch have negative `seconds` and a `nanoseconds`
/// component in `0..1_000_000_000`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeTime {
    pub seconds: i64,
    pub nanoseconds: i64,
}

impl NodeTime {
    pub const EPOCH: Self = Self {
        seconds: 0,
        nanoseconds: 0,
    };

    #[must_use]
    pub fn now() -> Self {
        Self::from_system_time(SystemTime::now())
    }

    #[must_use]
    pub fn from_system_time(time: SystemTime) -> Self {
        match time.duration_since(UNIX_EPOCH) {
            Ok(after) => Self {
                seconds: i64::try_from(after.as_secs()).unwrap_or(i64::MAX),
                nanoseconds: i64::from(after.subsec_nanos()),
            },
            Err(err) => {
                let before = err.duration();
                let secs = i64::try_from(before.as_secs()).unwrap_or(i64::MAX);
                let nanos = i64::from(before.subsec_nanos());
                if nanos == 0 {
                    Self {
                        seconds: -secs,
                        nanoseconds: 0,
                    }
                } else {
                    Self {
                        seconds: -secs - 1,
                        nanoseconds: NANOS_PER_SEC - nanos,
                    }
                }
            }
        }
    }

    /// Convert to `SystemTime`, clamping out-of-range nanoseconds.
    #[must_use]
    pub fn to_system_time(self) -> SystemTime {
        let nanos = u32::try_from(self.nanoseconds.clamp(0, NANOS_PER_SEC - 1)).unwrap_or(0);
        if self.seconds >= 0 {
            let secs = self.seconds.unsigned_abs();
            UNIX_EPOCH
                .checked_add(Duration::new(secs, nanos))
                .unwrap_or(UNIX_EPOCH)
        } else {
            let secs = self.seconds.unsigned_abs();
            UNIX_EPOCH
                .checked_sub(Duration::from_secs(secs))
                .and_then(|t| t.checked_add(Duration::from_nanos(u64::from(nanos))))
                .unwrap_or(UNIX_EPOCH)
        }
    }

    fn read(data: &[u8], offset: usize) -> Result<Self, ParseError> {
        Ok(Self {
            seconds: read_le_i64(data, offset)?,
            nanoseconds: read_le_i64(data, offset + 8)?,
        })
    }

    fn write(self, data: &mut [u8], offset: usize) -> Result<(), ParseError> {
        write_le_i64(data, offset, self.seconds)?;
        write_le_i64(data, offset + 8, self.nanoseconds)
    }
}

// ── Node header ─────────────────────────────────────────────────────────────

/// Decoded node header.
///
/// `node_type` is kept raw so that headers with an unknown tag can still be
/// decoded and reported by the checker; use [`NodeHeader::kind`] for the typed
/// view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeHeader {
    pub magic: u16,
    pub node_type: u8,
    pub id: u64,
    pub name: [u8; NODE_NAME_CAPACITY],
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub atime: NodeTime,
    pub mtime: NodeTime,
    pub ctime: NodeTime,
    /// Total bytes of this node, header included.
    pub size: u64,
    /// `size` of the node immediately before this one in the ring.
    pub previous_size: u64,
    /// Payload bytes in use.
    pub data_size: u64,
}

impl NodeHeader {
    fn blank(kind: NodeKind, size: u64, previous_size: u64) -> Self {
        Self {
            magic: RFS_MAGIC,
            node_type: kind.as_raw(),
            id: name_hash(b""),
            name: [0; NODE_NAME_CAPACITY],
            mode: 0,
            uid: 0,
            gid: 0,
            atime: NodeTime::EPOCH,
            mtime: NodeTime::EPOCH,
            ctime: NodeTime::EPOCH,
            size,
            previous_size,
            data_size: 0,
        }
    }

    /// A Free node spanning `size` bytes.
    #[must_use]
    pub fn free(size: u64, previous_size: u64) -> Self {
        Self::blank(NodeKind::Free, size, previous_size)
    }

    /// A freshly reserved node with cleared metadata.
    #[must_use]
    pub fn reserved(size: u64, previous_size: u64) -> Self {
        Self::blank(NodeKind::Reserved, size, previous_size)
    }

    /// The Root node written at format time: empty name, `0755` directory.
    #[must_use]
    pub fn root(size: u64, previous_size: u64, uid: u32, gid: u32, now: NodeTime) -> Self {
        Self {
            mode: S_IFDIR | ROOT_NODE_PERMISSIONS,
            uid,
            gid,
            atime: now,
            mtime: now,
            ctime: now,
            ..Self::blank(NodeKind::Root, size, previous_size)
        }
    }

    /// Decode a header from the first `NODE_HEADER_SIZE` bytes of `data`.
    ///
    /// Only the length is checked here; magic and type are left to
    /// [`NodeHeader::validate`].
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let raw = ensure_slice(data, 0, NODE_HEADER_SIZE)?;
        Ok(Self {
            magic: read_le_u16(raw, OFF_MAGIC)?,
            node_type: raw[OFF_TYPE],
            id: read_le_u64(raw, OFF_ID)?,
            name: read_fixed::<NODE_NAME_CAPACITY>(raw, OFF_NAME)?,
            mode: read_le_u16(raw, OFF_MODE)?,
            uid: read_le_u32(raw, OFF_UID)?,
            gid: read_le_u32(raw, OFF_GID)?,
            atime: NodeTime::read(raw, OFF_ATIME)?,
            mtime: NodeTime::read(raw, OFF_MTIME)?,
            ctime: NodeTime::read(raw, OFF_CTIME)?,
            size: read_le_u64(raw, OFF_SIZE)?,
            previous_size: read_le_u64(raw, OFF_PREVIOUS_SIZE)?,
            data_size: read_le_u64(raw, OFF_DATA_SIZE)?,
        })
    }

    /// Encode into the first `NODE_HEADER_SIZE` bytes of `out`.
    pub fn write_to(&self, out: &mut [u8]) -> Result<(), ParseError> {
        if out.len() < NODE_HEADER_SIZE {
            return Err(ParseError::InsufficientData {
                needed: NODE_HEADER_SIZE,
                offset: 0,
                actual: out.len(),
            });
        }
        write_le_u16(out, OFF_MAGIC, self.magic)?;
        out[OFF_TYPE] = self.node_type;
        write_le_u64(out, OFF_ID, self.id)?;
        write_bytes(out, OFF_NAME, &self.name)?;
        write_le_u16(out, OFF_MODE, self.mode)?;
        write_le_u32(out, OFF_UID, self.uid)?;
        write_le_u32(out, OFF_GID, self.gid)?;
        self.atime.write(out, OFF_ATIME)?;
        self.mtime.write(out, OFF_MTIME)?;
        self.ctime.write(out, OFF_CTIME)?;
        write_le_u64(out, OFF_SIZE, self.size)?;
        write_le_u64(out, OFF_PREVIOUS_SIZE, self.previous_size)?;
        write_le_u64(out, OFF_DATA_SIZE, self.data_size)
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; NODE_HEADER_SIZE] {
        let mut out = [0_u8; NODE_HEADER_SIZE];
        // The buffer is exactly one header long, so encoding cannot fail.
        let _ = self.write_to(&mut out);
        out
    }

    /// Check the signature and type tag.
    pub fn validate(&self) -> Result<NodeKind, ParseError> {
        if self.magic != RFS_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(RFS_MAGIC),
                actual: u64::from(self.magic),
            });
        }
        self.kind().ok_or(ParseError::InvalidField {
            field: "type",
            reason: "unknown node type",
        })
    }

    /// Check the Reserved-node payload invariants: `data_size` fits the
    /// node and `id` is the hash of `name`. Other kinds always pass.
    pub fn validate_contents(&self) -> Result<(), ParseError> {
        if !self.is_reserved() {
            return Ok(());
        }
        if self.data_size > self.capacity() {
            return Err(ParseError::InvalidField {
                field: "data_size",
                reason: "larger than node capacity",
            });
        }
        if self.id != name_hash(self.name_bytes()) {
            return Err(ParseError::InvalidField {
                field: "id",
                reason: "does not match name hash",
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn kind(&self) -> Option<NodeKind> {
        NodeKind::from_raw(self.node_type)
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.kind() == Some(NodeKind::Root)
    }

    #[must_use]
    pub fn is_free(&self) -> bool {
        self.kind() == Some(NodeKind::Free)
    }

    #[must_use]
    pub fn is_reserved(&self) -> bool {
        self.kind() == Some(NodeKind::Reserved)
    }

    pub fn set_kind(&mut self, kind: NodeKind) {
        self.node_type = kind.as_raw();
    }

    /// Payload bytes this node can hold.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.size.saturating_sub(NODE_HEADER_SIZE_U64)
    }

    #[must_use]
    pub fn name_bytes(&self) -> &[u8] {
        nul_terminated(&self.name)
    }

    #[must_use]
    pub fn name_lossy(&self) -> String {
        String::from_utf8_lossy(self.name_bytes()).into_owned()
    }

    /// Store `name` NUL-padded and refresh `id`.
    pub fn set_name(&mut self, name: &[u8]) -> Result<(), ParseError> {
        if name.len() > NODE_NAME_MAX {
            return Err(ParseError::InvalidField {
                field: "name",
                reason: "longer than 255 bytes",
            });
        }
        if name.contains(&0) {
            return Err(ParseError::InvalidField {
                field: "name",
                reason: "contains NUL",
            });
        }
        self.name = [0; NODE_NAME_CAPACITY];
        self.name[..name.len()].copy_from_slice(name);
        self.id = name_hash(name);
        Ok(())
    }

    /// `id` comparison first, name bytes only on a hash hit.
    #[must_use]
    pub fn name_matches(&self, name: &[u8], hash: u64) -> bool {
        self.id == hash && self.name_bytes() == name
    }

    /// Copy identity and attributes (not geometry) from `other`.
    pub fn copy_metadata_from(&mut self, other: &Self) {
        self.id = other.id;
        self.name = other.name;
        self.mode = other.mode;
        self.uid = other.uid;
        self.gid = other.gid;
        self.atime = other.atime;
        self.mtime = other.mtime;
        self.ctime = other.ctime;
    }

    /// File type bits implied by the node kind.
    #[must_use]
    pub fn type_bits(&self) -> u16 {
        if self.is_root() { S_IFDIR } else { S_IFREG }
    }

    /// Replace the permission bits, retagging the file type.
    pub fn set_permissions(&mut self, mode: u16) {
        self.mode = self.type_bits() | (mode & !S_IFMT);
    }

    #[must_use]
    pub fn permissions(&self) -> u16 {
        self.mode & !S_IFMT
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rfs_types::{MIN_REGION_SIZE, NODE_NAME_MAX};

    fn sample() -> NodeHeader {
        let mut header = NodeHeader::reserved(4096, 349);
        header.set_name(b"notes.txt").expect("name");
        header.mode = S_IFREG | 0o644;
        header.uid = 1000;
        header.gid = 100;
        header.atime = NodeTime {
            seconds: 1_700_000_000,
            nanoseconds: 5,
        };
        header.mtime = NodeTime {
            seconds: -3,
            nanoseconds: 999_999_999,
        };
        header.ctime = NodeTime::EPOCH;
        header.data_size = 17;
        header
    }

    #[test]
    fn field_offsets_match_packed_layout() {
        assert_eq!(OFF_MODE, 267);
        assert_eq!(OFF_UID, 269);
        assert_eq!(OFF_GID, 273);
        assert_eq!(OFF_ATIME, 277);
        assert_eq!(OFF_MTIME, 293);
        assert_eq!(OFF_CTIME, 309);
        assert_eq!(OFF_SIZE, 325);
        assert_eq!(OFF_PREVIOUS_SIZE, 333);
        assert_eq!(OFF_DATA_SIZE, 341);
    }

    #[test]
    fn encode_places_fields_at_fixed_offsets() {
        let header = sample();
        let bytes = header.to_bytes();
        assert_eq!(&bytes[0..2], &[0x52, 0x4B]);
        assert_eq!(bytes[2], NodeKind::Reserved.as_raw());
        assert_eq!(&bytes[11..20], b"notes.txt");
        assert_eq!(bytes[20], 0);
        assert_eq!(read_le_u64(&bytes, 325).expect("size"), 4096);
        assert_eq!(read_le_u64(&bytes, 333).expect("prev"), 349);
        assert_eq!(read_le_u64(&bytes, 341).expect("data"), 17);

        let decoded = NodeHeader::parse(&bytes).expect("parse");
        assert_eq!(decoded, header);
    }

    #[test]
    fn parse_rejects_short_input() {
        let short = [0_u8; NODE_HEADER_SIZE - 1];
        assert!(matches!(
            NodeHeader::parse(&short),
            Err(ParseError::InsufficientData { .. })
        ));
        let mut out = [0_u8; 10];
        assert!(sample().write_to(&mut out).is_err());
    }

    #[test]
    fn parse_keeps_unknown_type_for_validation() {
        let mut bytes = sample().to_bytes();
        bytes[OFF_TYPE] = 7;
        let header = NodeHeader::parse(&bytes).expect("parse");
        assert_eq!(header.kind(), None);
        assert!(matches!(
            header.validate(),
            Err(ParseError::InvalidField { field: "type", .. })
        ));

        bytes[OFF_MAGIC] = 0;
        let header = NodeHeader::parse(&bytes).expect("parse");
        assert!(matches!(
            header.validate(),
            Err(ParseError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn validate_contents_checks_reserved_payload_and_id() {
        let mut header = sample();
        assert!(header.validate_contents().is_ok());

        header.data_size = header.capacity();
        assert!(header.validate_contents().is_ok());
        header.data_size = header.capacity() + 1;
        assert!(matches!(
            header.validate_contents(),
            Err(ParseError::InvalidField {
                field: "data_size",
                ..
            })
        ));

        let mut header = sample();
        header.id ^= 1;
        assert!(matches!(
            header.validate_contents(),
            Err(ParseError::InvalidField { field: "id", .. })
        ));

        let mut free = NodeHeader::free(NODE_HEADER_SIZE_U64, 349);
        free.data_size = 10_000;
        free.id = 0;
        assert!(free.validate_contents().is_ok());
    }

    #[test]
    fn root_header_is_directory_0755() {
        let now = NodeTime {
            seconds: 10,
            nanoseconds: 0,
        };
        let root = NodeHeader::root(349, MIN_REGION_SIZE, 0, 0, now);
        assert_eq!(root.validate().expect("valid"), NodeKind::Root);
        assert_eq!(root.mode, S_IFDIR | 0o755);
        assert_eq!(root.name_bytes(), b"");
        assert_eq!(root.id, 5381);
        assert_eq!(root.capacity(), 0);
        assert_eq!(root.mtime, now);
    }

    #[test]
    fn set_name_rejects_overlong_and_nul() {
        let mut header = NodeHeader::reserved(1000, 349);
        let max = vec![b'x'; NODE_NAME_MAX];
        header.set_name(&max).expect("255 bytes fits");
        assert_eq!(header.name_bytes().len(), NODE_NAME_MAX);

        let too_long = vec![b'x'; NODE_NAME_MAX + 1];
        assert!(header.set_name(&too_long).is_err());
        assert!(header.set_name(b"a\0b").is_err());
        // A failed rename leaves the old name in place.
        assert_eq!(header.name_bytes(), max.as_slice());
    }

    #[test]
    fn set_name_clears_previous_tail() {
        let mut header = NodeHeader::reserved(1000, 349);
        header.set_name(b"longer-name").expect("name");
        header.set_name(b"ab").expect("name");
        assert_eq!(header.name_bytes(), b"ab");
        assert_eq!(header.id, name_hash(b"ab"));
        assert!(header.name_matches(b"ab", name_hash(b"ab")));
        assert!(!header.name_matches(b"abc", name_hash(b"abc")));
    }

    #[test]
    fn copy_metadata_keeps_geometry() {
        let source = sample();
        let mut target = NodeHeader::reserved(9000, 123);
        target.copy_metadata_from(&source);
        assert_eq!(target.name_bytes(), b"notes.txt");
        assert_eq!(target.uid, 1000);
        assert_eq!(target.mtime, source.mtime);
        assert_eq!(target.size, 9000);
        assert_eq!(target.previous_size, 123);
        assert_eq!(target.data_size, 0);
    }

    #[test]
    fn set_permissions_retags_type() {
        let mut file = NodeHeader::reserved(1000, 349);
        file.set_permissions(0o600 | S_IFDIR);
        assert_eq!(file.mode, S_IFREG | 0o600);
        assert_eq!(file.permissions(), 0o600);

        let mut root = NodeHeader::root(349, 349, 0, 0, NodeTime::EPOCH);
        root.set_permissions(0o700);
        assert_eq!(root.mode, S_IFDIR | 0o700);
    }

    #[test]
    fn time_conversion_roundtrip() {
        let after = UNIX_EPOCH + Duration::new(1_700_000_000, 123_456_789);
        let stored = NodeTime::from_system_time(after);
        assert_eq!(stored.seconds, 1_700_000_000);
        assert_eq!(stored.nanoseconds, 123_456_789);
        assert_eq!(stored.to_system_time(), after);

        let before = UNIX_EPOCH - Duration::new(2, 250_000_000);
        let stored = NodeTime::from_system_time(before);
        assert_eq!(stored.seconds, -3);
        assert_eq!(stored.nanoseconds, 750_000_000);
        assert_eq!(stored.to_system_time(), before);
    }

    #[test]
    fn node_kind_raw_values() {
        assert_eq!(NodeKind::from_raw(0), Some(NodeKind::Root));
        assert_eq!(NodeKind::from_raw(1), Some(NodeKind::Free));
        assert_eq!(NodeKind::from_raw(2), Some(NodeKind::Reserved));
        assert_eq!(NodeKind::from_raw(3), None);
        assert_eq!(NodeKind::Reserved.to_string(), "reserved");
    }
}
