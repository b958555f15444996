#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Signature carried by every node header ("KR").
pub const RFS_MAGIC: u16 = 0x4B52;

/// Bytes reserved for a node name, including the terminating NUL.
pub const NODE_NAME_CAPACITY: usize = 256;

/// Longest name that fits in the name buffer.
pub const NODE_NAME_MAX: usize = NODE_NAME_CAPACITY - 1;

/// Packed size of a node header on disk.
pub const NODE_HEADER_SIZE: usize = 349;

/// `NODE_HEADER_SIZE` as a `u64`, for offset arithmetic.
pub const NODE_HEADER_SIZE_U64: u64 = NODE_HEADER_SIZE as u64;

/// Smallest region that can hold a Root header followed by a Free header.
pub const MIN_REGION_SIZE: u64 = 2 * NODE_HEADER_SIZE_U64;

pub const ROOT_NODE_PERMISSIONS: u16 = 0o755;

/// Block size reported through statfs.
pub const STATFS_BLOCK_SIZE: u32 = 1024;

pub const S_IFMT: u16 = 0o170_000;
pub const S_IFDIR: u16 = 0o040_000;
pub const S_IFREG: u16 = 0o100_000;

/// Byte offset of a node header inside the mapped region.
///
/// Offset 0 is always the Root node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeOffset(pub u64);

impl NodeOffset {
    pub const ROOT: Self = Self(0);

    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }

    #[must_use]
    pub fn is_root(self) -> bool {
        self.0 == 0
    }

    /// Offset of the first payload byte following this header.
    #[must_use]
    pub fn payload(self) -> Option<u64> {
        self.0.checked_add(NODE_HEADER_SIZE_U64)
    }
}

impl fmt::Display for NodeOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 64-bit name hash stored in each node's `id` field.
///
/// Seed 5381, then `hash = hash * 33 ^ byte` for every byte up to the first
/// NUL. Arithmetic wraps.
#[must_use]
pub fn name_hash(name: &[u8]) -> u64 {
    name.iter()
        .take_while(|b| **b != 0)
        .fold(5381_u64, |hash, b| {
            (hash << 5).wrapping_add(hash) ^ u64::from(*b)
        })
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed for field: {field}")]
    IntegerConversion { field: &'static str },
}

pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

fn ensure_slice_mut(data: &mut [u8], offset: usize, len: usize) -> Result<&mut [u8], ParseError> {
    let available = data.len();
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };
    if end > available {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: available.saturating_sub(offset),
        });
    }
    Ok(&mut data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    read_fixed::<2>(data, offset).map(u16::from_le_bytes)
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    read_fixed::<4>(data, offset).map(u32::from_le_bytes)
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    read_fixed::<8>(data, offset).map(u64::from_le_bytes)
}

#[inline]
pub fn read_le_i64(data: &[u8], offset: usize) -> Result<i64, ParseError> {
    read_fixed::<8>(data, offset).map(i64::from_le_bytes)
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

/// Copy `bytes` into `data` at `offset`.
#[inline]
pub fn write_bytes(data: &mut [u8], offset: usize, bytes: &[u8]) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, bytes.len())?.copy_from_slice(bytes);
    Ok(())
}

#[inline]
pub fn write_le_u16(data: &mut [u8], offset: usize, value: u16) -> Result<(), ParseError> {
    write_bytes(data, offset, &value.to_le_bytes())
}

#[inline]
pub fn write_le_u32(data: &mut [u8], offset: usize, value: u32) -> Result<(), ParseError> {
    write_bytes(data, offset, &value.to_le_bytes())
}

#[inline]
pub fn write_le_u64(data: &mut [u8], offset: usize, value: u64) -> Result<(), ParseError> {
    write_bytes(data, offset, &value.to_le_bytes())
}

#[inline]
pub fn write_le_i64(data: &mut [u8], offset: usize, value: i64) -> Result<(), ParseError> {
    write_bytes(data, offset, &value.to_le_bytes())
}

/// Bytes of a NUL-padded buffer up to (not including) the first NUL.
#[must_use]
pub fn nul_terminated(bytes: &[u8]) -> &[u8] {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    &bytes[..end]
}

/// Narrow a `u64` to `usize`, naming the field on failure.
pub fn u64_to_usize(value: u64, field: &'static str) -> Result<usize, ParseError> {
    usize::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

/// Number of `block_size` blocks needed to hold `bytes`.
#[must_use]
pub fn blocks_for(bytes: u64, block_size: u32) -> u64 {
    if block_size == 0 {
        return 0;
    }
    bytes.div_ceil(u64::from(block_size))
}
