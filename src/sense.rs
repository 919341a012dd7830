//! SCSI fixed-format sense data
//!
//! Handlers that fail a request build a [`SenseData`] and return it as
//! [`crate::interface::Completion::CheckCondition`]; the dispatcher serializes it into the wire
//! response alongside `CHECK CONDITION` status.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Sentinel status values used on the wire in addition to the standard SCSI status codes.
pub mod status {
    /// Request completed synchronously with a data phase or GOOD status.
    pub const GOOD: u8 = 0x00;
    /// Request completed synchronously with sense data attached.
    pub const CHECK_CONDITION: u8 = 0x02;
    /// The handler has not yet completed the request; completion will arrive later via
    /// [`crate::context::OperationContext::send_response`].
    pub const PENDING: u8 = 0xFF;
}

/// Sense key, ASC and ASCQ triples used throughout the framework's default handlers.
pub mod key {
    pub const ILLEGAL_REQUEST: u8 = 0x05;
    pub const MEDIUM_ERROR: u8 = 0x03;
    pub const HARDWARE_ERROR: u8 = 0x04;
    pub const DATA_PROTECT: u8 = 0x07;
}

/// Additional sense codes used by the default handlers and helpers.
pub mod asc {
    pub const INVALID_COMMAND_OPERATION_CODE: (u8, u8) = (0x20, 0x00);
    pub const LBA_OUT_OF_RANGE: (u8, u8) = (0x21, 0x00);
    pub const INVALID_FIELD_IN_CDB: (u8, u8) = (0x24, 0x00);
    pub const WRITE_PROTECTED: (u8, u8) = (0x27, 0x00);
    pub const UNRECOVERED_READ_ERROR: (u8, u8) = (0x11, 0x00);
}

/// Fixed-format (18-byte) SCSI sense data, as emitted in response to CHECK CONDITION status.
#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct SenseData {
    response_code: u8,
    segment_number: u8,
    sense_key: u8,
    information: [u8; 4],
    additional_sense_length: u8,
    command_specific_information: [u8; 4],
    additional_sense_code: u8,
    additional_sense_code_qualifier: u8,
    field_replaceable_unit_code: u8,
    sense_key_specific: [u8; 3],
}

const RESPONSE_CODE_CURRENT_FIXED: u8 = 0x70;
const VALID_BIT: u8 = 0x80;
const ADDITIONAL_SENSE_LENGTH: u8 = 10;

impl SenseData {
    /// Build sense data with no `Information` field set.
    pub fn new(sense_key: u8, asc: (u8, u8)) -> Self {
        Self {
            response_code: RESPONSE_CODE_CURRENT_FIXED,
            segment_number: 0,
            sense_key: sense_key & 0x0F,
            information: [0; 4],
            additional_sense_length: ADDITIONAL_SENSE_LENGTH,
            command_specific_information: [0; 4],
            additional_sense_code: asc.0,
            additional_sense_code_qualifier: asc.1,
            field_replaceable_unit_code: 0,
            sense_key_specific: [0; 3],
        }
    }

    /// Build sense data carrying a big-endian LBA in the `Information` field, with the `Valid`
    /// bit set, as used for medium errors and out-of-range addresses.
    pub fn with_lba(sense_key: u8, asc: (u8, u8), lba: u64) -> Self {
        let mut sense = Self::new(sense_key, asc);
        sense.response_code |= VALID_BIT;
        sense.information = (lba as u32).to_be_bytes();
        sense
    }

    /// The sense key (low nibble of the original byte).
    pub fn sense_key(&self) -> u8 {
        self.sense_key
    }

    /// Additional sense code / qualifier pair.
    pub fn asc(&self) -> (u8, u8) {
        (self.additional_sense_code, self.additional_sense_code_qualifier)
    }

    /// Whether the `Information` field is meaningful.
    pub fn is_valid(&self) -> bool {
        self.response_code & VALID_BIT != 0
    }

    /// The `Information` field interpreted as a big-endian LBA, when [`Self::is_valid`].
    pub fn lba(&self) -> Option<u32> {
        self.is_valid().then(|| u32::from_be_bytes(self.information))
    }
}

/// Convenience constructor: `ILLEGAL REQUEST` / `INVALID COMMAND OPERATION CODE`.
pub fn invalid_command_operation_code() -> SenseData {
    SenseData::new(key::ILLEGAL_REQUEST, asc::INVALID_COMMAND_OPERATION_CODE)
}

/// Convenience constructor: `ILLEGAL REQUEST` / `LOGICAL BLOCK ADDRESS OUT OF RANGE`.
pub fn lba_out_of_range(lba: u64) -> SenseData {
    SenseData::with_lba(key::ILLEGAL_REQUEST, asc::LBA_OUT_OF_RANGE, lba)
}

/// Convenience constructor: `DATA PROTECT` / `WRITE PROTECTED`.
pub fn write_protected() -> SenseData {
    SenseData::new(key::DATA_PROTECT, asc::WRITE_PROTECTED)
}

/// Convenience constructor: `MEDIUM ERROR` / `UNRECOVERED READ ERROR`.
pub fn unrecovered_read_error(lba: u64) -> SenseData {
    SenseData::with_lba(key::MEDIUM_ERROR, asc::UNRECOVERED_READ_ERROR, lba)
}
