//! Self-spawning worker pool
//!
//! Workers are pre-emptive OS threads, not an async runtime: each one blocks in the transport's
//! transact call, handles exactly one request, and loops. The pool reaches its configured size
//! through an eager self-spawn chain rather than an on-demand idle-triggered one: worker 0 is
//! spawned by [`Dispatcher::spawn`], and each worker's very first action is to claim a share of
//! the remaining thread budget and, if any remains, spawn exactly one sibling before entering
//! its own request loop. The budget is a shared counter, so the chain always settles on exactly
//! `thread_count` workers regardless of scheduling order.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;

use crate::config::DispatcherConfig;
use crate::context::{self, OperationContext};
use crate::debug_log::DebugLogMask;
use crate::interface::{Completion, StorageUnitInterface};
use crate::params::Btl;
use crate::transport::{TransactRequest, TransactResponse, Transport};
use crate::wire::{Kind, ResponseHeader};

/// A single-writer latch for the first error a worker thread observes. Later errors are
/// dropped: the first failure is almost always the one worth reporting, and a CAS-from-zero
/// latch is cheap enough to update from every worker without contention on the happy path.
#[derive(Default)]
pub struct DispatcherError {
    code: AtomicI32,
}

impl DispatcherError {
    const fn new() -> Self {
        Self {
            code: AtomicI32::new(0),
        }
    }

    /// Record `code` if no error has been latched yet. `code` must be nonzero.
    pub(crate) fn latch(&self, code: i32) {
        debug_assert_ne!(code, 0);
        let _ = self
            .code
            .compare_exchange(0, code, Ordering::SeqCst, Ordering::SeqCst);
    }

    /// The first latched error code, if any.
    pub fn get(&self) -> Option<i32> {
        match self.code.load(Ordering::SeqCst) {
            0 => None,
            code => Some(code),
        }
    }
}

struct Shared<T: Transport, I: StorageUnitInterface<T> + 'static> {
    transport: Arc<T>,
    interface: Arc<I>,
    btl: Btl,
    debug_log: AtomicU32,
    remaining_to_spawn: AtomicUsize,
    next_worker_id: AtomicUsize,
    error: Arc<DispatcherError>,
    exit: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// A running pool of worker threads servicing one logical unit's transact loop.
pub struct Dispatcher<T: Transport, I: StorageUnitInterface<T> + 'static> {
    shared: Arc<Shared<T, I>>,
}

impl<T, I> Dispatcher<T, I>
where
    T: Transport,
    I: StorageUnitInterface<T> + 'static,
{
    /// Start the pool: resolve `config`'s thread count, set the transact timeout on the
    /// transport, and spawn the first worker, which will chain-spawn the rest.
    pub fn spawn(
        transport: Arc<T>,
        interface: Arc<I>,
        btl: Btl,
        config: DispatcherConfig,
        debug_log: DebugLogMask,
    ) -> std::io::Result<Self> {
        let thread_count = config.resolved_thread_count().max(1);
        transport.set_transact_timeout(btl, config.transact_timeout)?;

        let shared = Arc::new(Shared {
            transport,
            interface,
            btl,
            debug_log: AtomicU32::new(debug_log.bits()),
            remaining_to_spawn: AtomicUsize::new(thread_count - 1),
            next_worker_id: AtomicUsize::new(0),
            error: Arc::new(DispatcherError::new()),
            exit: AtomicBool::new(false),
            workers: Mutex::new(Vec::with_capacity(thread_count)),
        });

        spawn_worker(shared.clone())?;
        Ok(Self { shared })
    }

    /// The first error latched by any worker thread, if any.
    pub fn error(&self) -> Option<i32> {
        self.shared.error.get()
    }

    /// Replace which opcode kinds produce per-request debug trace. Takes effect for the next
    /// request each worker dispatches.
    pub fn set_debug_log(&self, mask: DebugLogMask) {
        self.shared.debug_log.store(mask.bits(), Ordering::Relaxed);
    }

    /// Signal all workers to stop after their current request and join them. Safe to call more
    /// than once.
    pub fn shutdown(&self) {
        self.shared.exit.store(true, Ordering::SeqCst);
        let _ = self.shared.transport.shutdown();
        let handles = std::mem::take(&mut *self.shared.workers.lock());
        for handle in handles {
            let _ = handle.join();
        }
    }
}

impl<T: Transport, I: StorageUnitInterface<T> + 'static> crate::guard::Shutdown
    for Dispatcher<T, I>
{
    fn shutdown(&self) {
        Dispatcher::shutdown(self);
    }
}

fn spawn_worker<T, I>(shared: Arc<Shared<T, I>>) -> std::io::Result<()>
where
    T: Transport,
    I: StorageUnitInterface<T> + 'static,
{
    let id = shared.next_worker_id.fetch_add(1, Ordering::SeqCst);
    let for_thread = shared.clone();
    let handle = std::thread::Builder::new()
        .name(format!("userspd-worker-{id}"))
        .spawn(move || worker_main(id, for_thread))?;
    shared.workers.lock().push(handle);
    Ok(())
}

fn worker_main<T, I>(id: usize, shared: Arc<Shared<T, I>>)
where
    T: Transport,
    I: StorageUnitInterface<T> + 'static,
{
    let claimed = shared
        .remaining_to_spawn
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |r| {
            if r > 0 { Some(r - 1) } else { None }
        })
        .is_ok();
    if claimed {
        if let Err(err) = spawn_worker(shared.clone()) {
            log::error!("userspd-worker-{id}: failed to spawn sibling worker: {err}");
            shared.error.latch(err.raw_os_error().unwrap_or(libc::EIO));
        }
    }

    let mut pending_response: Option<TransactResponse> = None;
    loop {
        if shared.exit.load(Ordering::SeqCst) {
            break;
        }
        let request = match shared.transport.transact(shared.btl, pending_response.take()) {
            Ok(request) => request,
            Err(err) => {
                if !shared.exit.load(Ordering::SeqCst) {
                    log::error!("userspd-worker-{id}: transact failed: {err}");
                    shared.error.latch(err.raw_os_error().unwrap_or(libc::EIO));
                }
                break;
            }
        };
        if request.header.hint == 0 {
            // Spurious wakeup (used by the transport to unblock a worker during shutdown):
            // hint 0 is reserved and never dispatched or answered.
            pending_response = None;
            continue;
        }
        pending_response = handle_request(id, &shared, request);
    }
}

fn handle_request<T, I>(
    worker_id: usize,
    shared: &Shared<T, I>,
    request: TransactRequest,
) -> Option<TransactResponse>
where
    T: Transport,
    I: StorageUnitInterface<T> + 'static,
{
    let hint = request.header.hint;
    let kind = match request.header.kind() {
        Ok(kind) => kind,
        Err(raw) => {
            log::warn!("userspd-worker-{worker_id}: unknown opcode {raw} for hint {hint}");
            return Some(TransactResponse {
                header: ResponseHeader::check_condition_with_raw_kind(
                    hint,
                    raw,
                    crate::sense::invalid_command_operation_code(),
                ),
                data: Vec::new(),
            });
        }
    };

    context::set_current(shared.btl, hint);
    let ctx = OperationContext::new(
        shared.transport.clone(),
        shared.error.clone(),
        shared.btl,
        hint,
        kind,
    );

    let debug_log = DebugLogMask::from_bits_truncate(shared.debug_log.load(Ordering::Relaxed));
    crate::debug_log::trace_kind!(
        debug_log,
        kind,
        "userspd-worker-{worker_id}: dispatching {kind:?} hint={hint} lba={} block_count={}",
        request.header.lba,
        request.header.block_count,
    );

    let completion = match kind {
        Kind::Read => shared
            .interface
            .read(&ctx, request.header.lba, request.header.block_count),
        Kind::Write => shared
            .interface
            .write(&ctx, request.header.lba, &request.data),
        Kind::Flush => shared
            .interface
            .flush(&ctx, request.header.lba, request.header.block_count),
        Kind::Unmap => {
            let descriptors = crate::wire::parse_unmap_descriptors(&request.data);
            shared.interface.unmap(&ctx, &descriptors)
        }
    };

    context::clear_current();

    match completion {
        Completion::Ok => Some(TransactResponse {
            header: ResponseHeader::good(hint, kind),
            data: Vec::new(),
        }),
        Completion::OkWithData(data) => Some(TransactResponse {
            header: ResponseHeader::good_with_data(hint, kind, data.len() as u32),
            data,
        }),
        Completion::CheckCondition(sense) => Some(TransactResponse {
            header: ResponseHeader::check_condition(hint, kind, sense),
            data: Vec::new(),
        }),
        Completion::Pending => None,
    }
}
