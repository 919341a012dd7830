//! The handler trait storage unit implementations provide
//!
//! Mirrors the shape of a filesystem trait with one method per operation and a sensible
//! default for anything not implemented: log it and fail the request with
//! `ILLEGAL REQUEST`/`INVALID COMMAND OPERATION CODE`, the SCSI analogue of `ENOSYS`.

use crate::context::OperationContext;
use crate::sense::SenseData;
use crate::transport::Transport;
use crate::wire::UnmapDescriptor;

/// The outcome of a handler call.
pub enum Completion {
    /// The request succeeded with no payload (Write, Flush, Unmap).
    Ok,
    /// The request succeeded and returns `data` to the initiator (Read).
    OkWithData(Vec<u8>),
    /// The request failed; `sense` is reported as CHECK CONDITION.
    CheckCondition(SenseData),
    /// The handler has taken ownership of completing this request later via
    /// [`OperationContext::send_response`]; the dispatcher must not build a response now.
    Pending,
}

/// Implemented by the storage backend. Every method has a default that logs and rejects with
/// `INVALID COMMAND OPERATION CODE`; override only the operations your backend supports.
pub trait StorageUnitInterface<T: Transport + ?Sized>: Send + Sync {
    /// Read `block_count` logical blocks starting at `lba`.
    fn read(&self, ctx: &OperationContext<T>, lba: u64, block_count: u32) -> Completion {
        log::warn!(
            "[not implemented] read btl={} lba={lba} block_count={block_count}",
            ctx.btl()
        );
        Completion::CheckCondition(crate::sense::invalid_command_operation_code())
    }

    /// Write `data` starting at logical block `lba`.
    fn write(&self, ctx: &OperationContext<T>, lba: u64, data: &[u8]) -> Completion {
        log::warn!(
            "[not implemented] write btl={} lba={lba} len={}",
            ctx.btl(),
            data.len()
        );
        Completion::CheckCondition(crate::sense::invalid_command_operation_code())
    }

    /// Flush cached writes covering `block_count` logical blocks starting at `lba` to the
    /// backing medium. A backend with no partial-flush granularity may ignore the range and
    /// flush unconditionally.
    fn flush(&self, ctx: &OperationContext<T>, lba: u64, block_count: u32) -> Completion {
        log::warn!(
            "[not implemented] flush btl={} lba={lba} block_count={block_count}",
            ctx.btl()
        );
        Completion::CheckCondition(crate::sense::invalid_command_operation_code())
    }

    /// Deallocate the block ranges named by `descriptors`.
    fn unmap(&self, ctx: &OperationContext<T>, descriptors: &[UnmapDescriptor]) -> Completion {
        log::warn!(
            "[not implemented] unmap btl={} descriptors={}",
            ctx.btl(),
            descriptors.len()
        );
        Completion::CheckCondition(crate::sense::invalid_command_operation_code())
    }
}
