//! Kernel transport
//!
//! The kernel driver exposes a single character device. Provisioning, listing, and the
//! transact loop are all driven through ioctls on the fd returned by [`Transport::open`],
//! mirroring the way the FUSE kernel fd is opened once and then driven purely through
//! ioctl/read/write for the life of the session.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::time::Duration;

use crate::guard::Shutdown;
use crate::params::{Btl, StorageUnitParams};
use crate::wire::{RequestHeader, ResponseHeader};

/// Default path of the kernel transport's character device.
pub const DEFAULT_DEVICE_PATH: &str = "/dev/userspd";

#[repr(C)]
struct RawProvisionParams {
    guid: [u8; 16],
    block_count: u64,
    block_length: u32,
    max_transfer_length: u32,
    max_unmap_descriptor_count: u32,
    product_id: [u8; 16],
    product_revision_level: [u8; 4],
    flags: u32,
    /// Out parameter: the kernel driver fills in the assigned BTL on success.
    btl: u32,
}

const FLAG_WRITE_PROTECTED: u32 = 1 << 0;
const FLAG_CACHE_SUPPORTED: u32 = 1 << 1;
const FLAG_UNMAP_SUPPORTED: u32 = 1 << 2;
const FLAG_EJECT_DISABLED: u32 = 1 << 3;

impl From<&StorageUnitParams> for RawProvisionParams {
    fn from(p: &StorageUnitParams) -> Self {
        let mut flags = 0;
        if p.write_protected {
            flags |= FLAG_WRITE_PROTECTED;
        }
        if p.cache_supported {
            flags |= FLAG_CACHE_SUPPORTED;
        }
        if p.unmap_supported {
            flags |= FLAG_UNMAP_SUPPORTED;
        }
        if p.eject_disabled {
            flags |= FLAG_EJECT_DISABLED;
        }
        Self {
            guid: p.guid.0,
            block_count: p.block_count,
            block_length: p.block_length,
            max_transfer_length: p.max_transfer_length,
            max_unmap_descriptor_count: p.max_unmap_descriptor_count,
            product_id: p.product_id.0,
            product_revision_level: p.product_revision_level.0,
            flags,
            btl: 0,
        }
    }
}

#[repr(C)]
struct RawSetTimeout {
    btl: u32,
    timeout_ms: u32,
}

/// Largest number of live LUNs a single [`Transport::list`] call can report, bounding
/// [`RawList`]'s embedded array to a fixed, ioctl-friendly size.
const LIST_CAPACITY: usize = 256;

#[repr(C)]
struct RawList {
    /// In: capacity of `btls` (always [`LIST_CAPACITY`]). Out: number of entries filled in.
    count: u32,
    btls: [u32; LIST_CAPACITY],
}

/// The TRANSACT ioctl's fixed-size envelope. The variable-length data buffers that travel
/// alongside a `Write`/`Unmap` request or a `Read` response never fit in a fixed struct, so they
/// travel by pointer/capacity pair instead, the same way Linux passthrough ioctls (e.g. SCSI
/// generic `SG_IO`) carry a separately-pointed data buffer alongside a fixed command envelope.
#[repr(C)]
struct RawTransact {
    btl: u32,
    /// Set by [`KernelTransport::post_deferred`]: ask the kernel to post `response` without
    /// blocking for a new request. The kernel answers with `request.hint == 0`.
    no_wait: u32,
    response_present: u32,
    _reserved0: u32,
    /// In, meaningful iff `response_present != 0`.
    response: ResponseHeader,
    response_data_ptr: u64,
    /// Out: the next request's fixed header.
    request: RequestHeader,
    /// In: where the kernel should copy the request's trailing data buffer, and its capacity.
    request_data_ptr: u64,
    request_data_cap: u32,
    _reserved1: u32,
}

const IOCTL_MAGIC: u8 = b'U';

nix::ioctl_readwrite!(ioctl_provision, IOCTL_MAGIC, 1, RawProvisionParams);
nix::ioctl_write_ptr!(ioctl_unprovision, IOCTL_MAGIC, 2, u32);
nix::ioctl_readwrite!(ioctl_list, IOCTL_MAGIC, 3, RawList);
nix::ioctl_write_ptr!(ioctl_set_transact_timeout, IOCTL_MAGIC, 4, RawSetTimeout);
nix::ioctl_readwrite!(ioctl_transact, IOCTL_MAGIC, 5, RawTransact);
nix::ioctl_none!(ioctl_stop, IOCTL_MAGIC, 6);

/// A request pulled off the transact ioctl: a parsed [`RequestHeader`] plus its trailing data
/// buffer, if any (present for `Write` and `Unmap`).
pub struct TransactRequest {
    /// The fixed-size request header.
    pub header: RequestHeader,
    /// Trailing payload, `header.data_length` bytes, present for Write/Unmap.
    pub data: Vec<u8>,
}

/// A response to post back on the next transact call: a [`ResponseHeader`] plus trailing data
/// (present for `Read`).
pub struct TransactResponse {
    /// The fixed-size response header.
    pub header: ResponseHeader,
    /// Trailing payload, `header.data_length` bytes, present for Read.
    pub data: Vec<u8>,
}

/// Abstraction over the kernel transport, generic so the dispatcher and storage unit can be
/// exercised against an in-process fake without a real kernel module.
pub trait Transport: Send + Sync + 'static {
    /// Provision a new logical unit with the given parameters, returning its assigned BTL.
    fn provision(&self, params: &StorageUnitParams) -> io::Result<Btl>;

    /// Tear down a previously provisioned logical unit.
    fn unprovision(&self, btl: Btl) -> io::Result<()>;

    /// List the BTLs of all logical units currently provisioned through this transport.
    fn list(&self) -> io::Result<Vec<Btl>>;

    /// Post `response` (the completion of the previously received request, if any) and block
    /// for the next request. A worker thread calls this in a loop; `response` is `None` only
    /// on a worker's very first call.
    fn transact(
        &self,
        btl: Btl,
        response: Option<TransactResponse>,
    ) -> io::Result<TransactRequest>;

    /// Set the timeout the kernel driver waits for a transact response before treating the
    /// logical unit as stalled.
    fn set_transact_timeout(&self, btl: Btl, timeout: Duration) -> io::Result<()>;

    /// Interrupt any worker threads blocked in [`Self::transact`] and cause them to return a
    /// shutdown error, allowing the dispatcher pool to join cleanly. Safe to call from a
    /// signal handler context.
    fn shutdown(&self) -> io::Result<()>;

    /// Post a response for a request that was deferred (answered `PENDING` and completed later,
    /// possibly from a different thread than the one that received it). Unlike
    /// [`Self::transact`], this does not block waiting for a new request.
    fn post_deferred(&self, btl: Btl, response: TransactResponse) -> io::Result<()>;
}

/// Any transport can sit behind a [`crate::guard::Guard`]: `Guard::execute` calls
/// [`Shutdown::shutdown`] with the lock already dropped, so invoking
/// [`Transport::shutdown`] from there is safe to do from a signal or console-control handler.
impl<T: Transport + ?Sized> Shutdown for T {
    fn shutdown(&self) {
        let _ = Transport::shutdown(self);
    }
}

/// Default capacity reserved for a request's trailing data buffer on every
/// [`KernelTransport::transact`] call. Matches the 1 MiB `max_transfer_length` a typical backend
/// (see `demos/rawdisk`) provisions with; a backend provisioning a larger `max_transfer_length`
/// must open with [`KernelTransport::open_with_capacity`] instead.
pub const DEFAULT_REQUEST_BUFFER_CAPACITY: u32 = 1024 * 1024;

/// The real, ioctl-based transport, talking to [`DEFAULT_DEVICE_PATH`] or a caller-chosen path.
pub struct KernelTransport {
    device: File,
    request_buffer_capacity: u32,
}

impl KernelTransport {
    /// Open the kernel transport device at `path`, sizing each transact call's request data
    /// buffer at [`DEFAULT_REQUEST_BUFFER_CAPACITY`].
    pub fn open(path: &Path) -> io::Result<Self> {
        Self::open_with_capacity(path, DEFAULT_REQUEST_BUFFER_CAPACITY)
    }

    /// Open the kernel transport device at `path`, sizing each transact call's request data
    /// buffer at `request_buffer_capacity` bytes. Must be at least the `max_transfer_length`
    /// and `max_unmap_descriptor_count * size_of::<UnmapDescriptor>()` of every LUN provisioned
    /// through this handle.
    pub fn open_with_capacity(path: &Path, request_buffer_capacity: u32) -> io::Result<Self> {
        let device = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self {
            device,
            request_buffer_capacity,
        })
    }

    /// Open the kernel transport device at [`DEFAULT_DEVICE_PATH`].
    pub fn open_default() -> io::Result<Self> {
        Self::open(Path::new(DEFAULT_DEVICE_PATH))
    }

    /// Shared implementation of [`Transport::transact`] and [`Transport::post_deferred`]: both
    /// submit an optional response through the same TRANSACT ioctl, differing only in whether
    /// the kernel blocks for a new request (`no_wait` is set for `post_deferred`, which must
    /// return immediately since the calling thread isn't a dispatcher worker).
    fn raw_transact(
        &self,
        btl: Btl,
        response: Option<TransactResponse>,
        no_wait: bool,
    ) -> io::Result<TransactRequest> {
        let (response_present, response_header, response_data) = match response {
            Some(r) => (1u32, r.header, r.data),
            // `response_present == 0` tells the kernel to ignore this header entirely; the
            // `Kind` here is unread filler, not a real response.
            None => (0u32, ResponseHeader::good(0, crate::wire::Kind::Read), Vec::new()),
        };
        let mut request_buf = vec![0u8; self.request_buffer_capacity as usize];
        let mut raw = RawTransact {
            btl: btl.0,
            no_wait: no_wait as u32,
            response_present,
            _reserved0: 0,
            response: response_header,
            response_data_ptr: response_data.as_ptr() as u64,
            request: RequestHeader::with_raw_kind(0, btl, 0, 0, 0, 0),
            request_data_ptr: request_buf.as_mut_ptr() as u64,
            request_data_cap: request_buf.len() as u32,
            _reserved1: 0,
        };
        unsafe { ioctl_transact(self.device.as_raw_fd(), &mut raw)? };
        drop(response_data);
        let data_len = (raw.request.data_length as usize).min(request_buf.len());
        request_buf.truncate(data_len);
        Ok(TransactRequest {
            header: raw.request,
            data: request_buf,
        })
    }
}

impl Transport for KernelTransport {
    fn provision(&self, params: &StorageUnitParams) -> io::Result<Btl> {
        let mut raw = RawProvisionParams::from(params);
        unsafe { ioctl_provision(self.device.as_raw_fd(), &mut raw)? };
        Ok(Btl(raw.btl))
    }

    fn unprovision(&self, btl: Btl) -> io::Result<()> {
        unsafe { ioctl_unprovision(self.device.as_raw_fd(), &btl.0)? };
        Ok(())
    }

    fn list(&self) -> io::Result<Vec<Btl>> {
        let mut raw = RawList {
            count: LIST_CAPACITY as u32,
            btls: [0; LIST_CAPACITY],
        };
        unsafe { ioctl_list(self.device.as_raw_fd(), &mut raw)? };
        let n = (raw.count as usize).min(LIST_CAPACITY);
        Ok(raw.btls[..n].iter().map(|&b| Btl(b)).collect())
    }

    fn transact(
        &self,
        btl: Btl,
        response: Option<TransactResponse>,
    ) -> io::Result<TransactRequest> {
        self.raw_transact(btl, response, false)
    }

    fn set_transact_timeout(&self, btl: Btl, timeout: Duration) -> io::Result<()> {
        let raw = RawSetTimeout {
            btl: btl.0,
            timeout_ms: timeout.as_millis().min(u128::from(u32::MAX)) as u32,
        };
        unsafe { ioctl_set_transact_timeout(self.device.as_raw_fd(), &raw)? };
        Ok(())
    }

    fn shutdown(&self) -> io::Result<()> {
        unsafe { ioctl_stop(self.device.as_raw_fd())? };
        Ok(())
    }

    fn post_deferred(&self, btl: Btl, response: TransactResponse) -> io::Result<()> {
        self.raw_transact(btl, Some(response), true)?;
        Ok(())
    }
}
