//! Wire formats exchanged with the kernel transport over the transact ioctl
//!
//! Every struct here is `#[repr(C)]` and zerocopy-derived so it can be read from or written
//! directly into the fixed-size buffers the transact ioctl operates on, mirroring the way the
//! kernel ABI structs are modeled elsewhere in this codebase's lineage.

use num_enum::{IntoPrimitive, TryFromPrimitive};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::params::Btl;
use crate::sense::SenseData;

/// The operation a [`RequestHeader`] is carrying.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
pub enum Kind {
    /// Read `block_count` blocks starting at `lba` into the response data buffer.
    Read = 1,
    /// Write `block_count` blocks starting at `lba` from the request data buffer.
    Write = 2,
    /// Flush any cached data to the backing medium.
    Flush = 3,
    /// Deallocate (TRIM) the block ranges described by the request data buffer.
    Unmap = 4,
}

/// Per-block-range descriptor used in the data buffer of an [`Kind::Unmap`] request.
#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct UnmapDescriptor {
    /// First logical block to deallocate.
    pub lba: u64,
    /// Number of contiguous blocks to deallocate.
    pub block_count: u32,
    reserved: u32,
}

impl UnmapDescriptor {
    /// Construct a descriptor for `block_count` blocks starting at `lba`.
    pub fn new(lba: u64, block_count: u32) -> Self {
        Self {
            lba,
            block_count,
            reserved: 0,
        }
    }
}

/// Parse an Unmap request's trailing data buffer into descriptors. Trailing bytes that don't
/// make up a whole descriptor are ignored.
pub fn parse_unmap_descriptors(data: &[u8]) -> Vec<UnmapDescriptor> {
    data.chunks_exact(std::mem::size_of::<UnmapDescriptor>())
        .filter_map(|chunk| UnmapDescriptor::read_from_bytes(chunk).ok())
        .collect()
}

/// Fixed-size header of every request the kernel transport relays to user mode. Followed, for
/// `Write` and `Unmap`, by a variable-length data buffer.
#[repr(C)]
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RequestHeader {
    /// Correlation token; echoed back in the matching [`ResponseHeader`].
    pub hint: u64,
    /// Logical unit this request targets.
    pub btl: Btl,
    /// Which operation this is. Stored raw; use [`RequestHeader::kind`] to decode.
    kind: u8,
    _reserved0: [u8; 3],
    /// Starting logical block address (Read/Write/first Unmap descriptor, otherwise 0).
    pub lba: u64,
    /// Number of logical blocks covered (Read/Write), or number of [`UnmapDescriptor`] entries
    /// in the trailing data buffer (Unmap).
    pub block_count: u32,
    /// Length, in bytes, of the data buffer trailing this header.
    pub data_length: u32,
}

impl RequestHeader {
    /// Build a header carrying a known, valid [`Kind`].
    pub fn new(hint: u64, btl: Btl, kind: Kind, lba: u64, block_count: u32, data_length: u32) -> Self {
        Self {
            hint,
            btl,
            kind: kind.into(),
            _reserved0: [0; 3],
            lba,
            block_count,
            data_length,
        }
    }

    /// Build a header carrying a raw opcode byte that may not correspond to any [`Kind`], as
    /// the kernel transport could send after a version skew.
    pub fn with_raw_kind(hint: u64, btl: Btl, raw_kind: u8, lba: u64, block_count: u32, data_length: u32) -> Self {
        Self {
            hint,
            btl,
            kind: raw_kind,
            _reserved0: [0; 3],
            lba,
            block_count,
            data_length,
        }
    }

    /// Decode the raw `kind` byte. Unknown values surface as a dispatcher error rather than a
    /// panic — the kernel transport and this crate must agree on opcode numbering, but a
    /// version skew should degrade to an error, not undefined behavior.
    pub fn kind(&self) -> Result<Kind, u8> {
        Kind::try_from(self.kind).map_err(|e| e.number)
    }
}

/// Fixed-size header of every response sent back across the transact ioctl. Followed, for
/// `Read`, by the data buffer filled in by the handler.
#[repr(C)]
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct ResponseHeader {
    /// Echoes the originating [`RequestHeader::hint`].
    pub hint: u64,
    /// Echoes the originating request's [`Kind`] (spec.md §8 #1: the paired response must carry
    /// the same `Hint` and matching `Kind`). Stored raw; use [`ResponseHeader::kind`] to decode.
    kind: u8,
    /// SCSI status byte, or [`crate::sense::status::PENDING`] for a deferred completion.
    pub status: u8,
    _reserved0: [u8; 2],
    /// Sense data, meaningful when `status == CHECK_CONDITION`.
    pub sense: SenseData,
    /// Length, in bytes, of the data buffer trailing this header (Read only).
    pub data_length: u32,
}

impl ResponseHeader {
    /// Decode the raw `kind` byte this response echoes back.
    pub fn kind(&self) -> Result<Kind, u8> {
        Kind::try_from(self.kind).map_err(|e| e.number)
    }

    /// Shared constructor taking the wire `kind` byte directly, so a response can echo back an
    /// opcode the request carried even when it didn't decode to a known [`Kind`] (see
    /// [`Self::check_condition_with_raw_kind`]).
    fn raw(hint: u64, raw_kind: u8, status: u8, sense: SenseData, data_length: u32) -> Self {
        Self {
            hint,
            kind: raw_kind,
            status,
            _reserved0: [0; 2],
            sense,
            data_length,
        }
    }

    /// Build a `GOOD` response with no sense data and no trailing payload.
    pub fn good(hint: u64, kind: Kind) -> Self {
        Self::raw(hint, kind.into(), crate::sense::status::GOOD, SenseData::new(0, (0, 0)), 0)
    }

    /// Build a `GOOD` response carrying `data_length` bytes of trailing payload (Read).
    pub fn good_with_data(hint: u64, kind: Kind, data_length: u32) -> Self {
        Self {
            data_length,
            ..Self::good(hint, kind)
        }
    }

    /// Build a `CHECK CONDITION` response carrying the given sense data.
    pub fn check_condition(hint: u64, kind: Kind, sense: SenseData) -> Self {
        Self::raw(hint, kind.into(), crate::sense::status::CHECK_CONDITION, sense, 0)
    }

    /// Build a `CHECK CONDITION` response echoing back a raw opcode byte that didn't decode to
    /// any known [`Kind`] — used for the "unknown opcode" rejection, where there is no valid
    /// `Kind` to report but the response should still echo what the request carried.
    pub fn check_condition_with_raw_kind(hint: u64, raw_kind: u8, sense: SenseData) -> Self {
        Self::raw(hint, raw_kind, crate::sense::status::CHECK_CONDITION, sense, 0)
    }

    /// Build a `PENDING` response: the handler will complete this request later via
    /// [`crate::context::OperationContext::send_response`].
    pub fn pending(hint: u64, kind: Kind) -> Self {
        Self::raw(hint, kind.into(), crate::sense::status::PENDING, SenseData::new(0, (0, 0)), 0)
    }
}
