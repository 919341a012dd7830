//! Error types
//!
//! Two distinct failure domains exist: failures discovered while constructing or provisioning a
//! [`crate::unit::StorageUnit`] (returned synchronously, `Result<_, Error>`), and failures
//! discovered by a worker thread mid-dispatch, which are latched into a single
//! [`crate::dispatcher::DispatcherError`] cell rather than returned anywhere.

use std::io;

/// Failure constructing, provisioning, or tearing down a storage unit.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A [`crate::params::StorageUnitParams`] field violated an invariant.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// The kernel transport rejected provisioning, listing, or an ioctl.
    #[error("transport error: {0}")]
    Transport(#[source] io::Error),

    /// The unit was asked to perform an operation after `delete` was already called.
    #[error("storage unit already deleted")]
    AlreadyDeleted,

    /// A second concurrent provision/delete/shutdown raced with this one.
    #[error("storage unit busy")]
    Busy,
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Transport(err)
    }
}
