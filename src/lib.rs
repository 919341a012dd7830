//! User-mode storage device (SCSI logical unit) framework
//!
//! A kernel transport driver relays SCSI CDB-level requests for a provisioned logical unit to
//! user mode over an ioctl-based transact channel. This crate dispatches those requests to a
//! [`StorageUnitInterface`] implementation across a pool of worker threads, handles synchronous
//! and deferred completion, and provides the SCSI sense-data helpers a handler needs to report
//! failures.
//!
//! A minimal backend looks roughly like:
//!
//! ```ignore
//! use userspd::{StorageUnit, StorageUnitInterface, config::DispatcherConfig, transport::KernelTransport};
//!
//! struct RamDisk { /* ... */ }
//! impl StorageUnitInterface<KernelTransport> for RamDisk {
//!     // override read/write/flush/unmap as needed
//! }
//!
//! let transport = std::sync::Arc::new(KernelTransport::open_default()?);
//! let unit = StorageUnit::create(transport, &params, RamDisk { /* ... */ }, DispatcherConfig::default())?;
//! ```

pub mod config;
pub mod context;
pub mod debug_log;
pub mod dispatcher;
pub mod error;
pub mod guard;
pub mod interface;
pub mod params;
pub mod sense;
pub mod transport;
pub mod unit;
pub mod wire;

pub use config::DispatcherConfig;
pub use context::OperationContext;
pub use debug_log::DebugLogMask;
pub use dispatcher::{Dispatcher, DispatcherError};
pub use error::Error;
pub use guard::Guard;
pub use interface::{Completion, StorageUnitInterface};
pub use params::{Btl, Guid, ProductId, ProductRevisionLevel, StorageUnitParams};
pub use sense::SenseData;
pub use transport::{KernelTransport, Transport};
pub use unit::StorageUnit;
pub use wire::{Kind, RequestHeader, ResponseHeader, UnmapDescriptor};
