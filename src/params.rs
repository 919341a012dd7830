//! Storage unit provisioning parameters
//!
//! A [`StorageUnitParams`] value is submitted to [`crate::transport::Transport::provision`] and
//! is immutable for the lifetime of the resulting logical unit. Validation happens once, at
//! [`crate::unit::StorageUnit::create`] time, before the transport is ever touched.

use std::fmt;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::Error;

/// Largest payload the kernel transport will ever hand to a single Read/Write.
pub const MAX_TRANSFER_LENGTH_LIMIT: u32 = 16 * 1024 * 1024;

/// 128-bit client-supplied identity for a logical unit. Should be persisted alongside the
/// backing store so re-provisioning after a restart produces the same identity.
#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct Guid(pub [u8; 16]);

impl Guid {
    /// Construct a GUID from raw bytes.
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7], b[8], b[9], b[10], b[11], b[12], b[13], b[14], b[15]
        )
    }
}

/// Bus/target/LUN identity assigned by the kernel transport at provision time.
#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct Btl(pub u32);

impl Btl {
    /// The bus number (low byte).
    pub fn bus(self) -> u8 {
        self.0 as u8
    }

    /// The target number (second byte).
    pub fn target(self) -> u8 {
        (self.0 >> 8) as u8
    }

    /// The LUN number (third byte).
    pub fn lun(self) -> u8 {
        (self.0 >> 16) as u8
    }
}

impl fmt::Display for Btl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.bus(), self.target(), self.lun())
    }
}

/// A fixed-width, space-padded ASCII field as used in SCSI INQUIRY data.
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct AsciiField<const N: usize>(pub [u8; N]);

impl<const N: usize> AsciiField<N> {
    /// Build a space-padded field from a string, failing if it doesn't fit or contains a
    /// leading NUL.
    pub fn new(s: &str) -> Result<Self, Error> {
        if s.len() > N {
            return Err(Error::InvalidParameter(format!(
                "field {s:?} exceeds {N} bytes"
            )));
        }
        if s.as_bytes().first() == Some(&0) {
            return Err(Error::InvalidParameter("field starts with NUL".into()));
        }
        let mut bytes = [b' '; N];
        bytes[..s.len()].copy_from_slice(s.as_bytes());
        Ok(Self(bytes))
    }

    /// View the field as a string slice, trimming trailing padding.
    pub fn as_str(&self) -> &str {
        let end = self.0.iter().rposition(|&b| b != b' ').map_or(0, |i| i + 1);
        std::str::from_utf8(&self.0[..end]).unwrap_or("")
    }
}

impl<const N: usize> fmt::Debug for AsciiField<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

/// `ProductId` — 16-byte ASCII, space-padded.
pub type ProductId = AsciiField<16>;
/// `ProductRevisionLevel` — 4-byte ASCII, space-padded.
pub type ProductRevisionLevel = AsciiField<4>;

/// Fixed parameters of a provisioned logical unit, supplied to
/// [`crate::unit::StorageUnit::create`] and frozen for the unit's life.
#[derive(Clone, Debug)]
pub struct StorageUnitParams {
    /// Client-supplied identity; should be persisted with the backing store.
    pub guid: Guid,
    /// Logical block count.
    pub block_count: u64,
    /// Bytes per block; a power of two, typically in `[512, 4096]`.
    pub block_length: u32,
    /// Upper bound in bytes for a single Read/Write payload.
    pub max_transfer_length: u32,
    /// Upper bound on the number of descriptors in a single Unmap request.
    pub max_unmap_descriptor_count: u32,
    /// SCSI INQUIRY product id.
    pub product_id: ProductId,
    /// SCSI INQUIRY product revision level.
    pub product_revision_level: ProductRevisionLevel,
    /// Whether the unit rejects Write/Unmap with `WRITE PROTECTED` sense.
    pub write_protected: bool,
    /// Whether the unit advertises a writeback cache (enables Flush semantics on the wire).
    pub cache_supported: bool,
    /// Whether the unit advertises Unmap support.
    pub unmap_supported: bool,
    /// Whether medium removal (eject) is disabled for this unit.
    pub eject_disabled: bool,
}

impl StorageUnitParams {
    /// Validate the invariants from the data model: block geometry fits in 64 bits, transfer
    /// length is a multiple of the block length and within the hard ceiling, and ASCII fields
    /// are well-formed (enforced at construction by [`AsciiField::new`]).
    pub fn validate(&self) -> Result<(), Error> {
        if self.block_length == 0 {
            return Err(Error::InvalidParameter("block_length must be nonzero".into()));
        }
        if !self.block_length.is_power_of_two() {
            return Err(Error::InvalidParameter(
                "block_length must be a power of two".into(),
            ));
        }
        if self
            .block_count
            .checked_mul(u64::from(self.block_length))
            .is_none()
        {
            return Err(Error::InvalidParameter(
                "block_count * block_length overflows u64".into(),
            ));
        }
        if self.max_transfer_length == 0 || self.max_transfer_length % self.block_length != 0 {
            return Err(Error::InvalidParameter(
                "max_transfer_length must be a nonzero multiple of block_length".into(),
            ));
        }
        if self.max_transfer_length > MAX_TRANSFER_LENGTH_LIMIT {
            return Err(Error::InvalidParameter(format!(
                "max_transfer_length {} exceeds the {} byte ceiling",
                self.max_transfer_length, MAX_TRANSFER_LENGTH_LIMIT
            )));
        }
        Ok(())
    }
}
