//! Per-request operation context and deferred completion
//!
//! A handler is always called with an [`OperationContext`] identifying the request it must
//! answer. Answering synchronously is just the handler's return value; answering later — after
//! the handler has returned [`crate::sense::status::PENDING`] and handed the work off to
//! another thread — goes through [`OperationContext::send_response`], which may be called from
//! any thread, at most once.

use std::cell::Cell;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::dispatcher::DispatcherError;
use crate::params::Btl;
use crate::transport::{Transport, TransactResponse};
use crate::wire::{Kind, ResponseHeader};

thread_local! {
    /// The request a worker thread is currently inside a handler call for, if any. Used only
    /// for diagnostics (panic messages, debug logging) — never for completion, which always
    /// flows through the owned [`OperationContext`] handle instead.
    static CURRENT: Cell<Option<(Btl, u64)>> = const { Cell::new(None) };
}

/// Record that this worker thread is now handling `(btl, hint)`. Cleared by
/// [`clear_current`] when the handler call returns.
pub(crate) fn set_current(btl: Btl, hint: u64) {
    CURRENT.with(|c| c.set(Some((btl, hint))));
}

/// Clear the current-request marker for this worker thread.
pub(crate) fn clear_current() {
    CURRENT.with(|c| c.set(None));
}

/// The `(btl, hint)` of the request this worker thread is currently inside a handler call for,
/// if any.
pub fn current() -> Option<(Btl, u64)> {
    CURRENT.with(|c| c.get())
}

/// Handle identifying one in-flight request, given to a handler so it can either answer
/// synchronously (by returning a status from the handler) or defer and answer later from
/// elsewhere via [`Self::send_response`].
pub struct OperationContext<T: Transport + ?Sized> {
    transport: Arc<T>,
    error: Arc<DispatcherError>,
    btl: Btl,
    hint: u64,
    kind: Kind,
    completed: Arc<AtomicBool>,
}

impl<T: Transport + ?Sized> OperationContext<T> {
    pub(crate) fn new(
        transport: Arc<T>,
        error: Arc<DispatcherError>,
        btl: Btl,
        hint: u64,
        kind: Kind,
    ) -> Self {
        Self {
            transport,
            error,
            btl,
            hint,
            kind,
            completed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The logical unit this request targets.
    pub fn btl(&self) -> Btl {
        self.btl
    }

    /// The correlation token the kernel transport used for this request.
    pub fn hint(&self) -> u64 {
        self.hint
    }

    /// Which operation this request is.
    pub fn kind(&self) -> Kind {
        self.kind
    }

    /// Complete this request out of band: build a response with `header` and `data`, and post
    /// it through the transport's deferred-completion path.
    ///
    /// Calling this more than once for the same request is a programming error in the handler
    /// and returns [`io::ErrorKind::AlreadyExists`] without touching the transport a second
    /// time. A transport failure posting the response does not return an error: it latches
    /// into the owning [`crate::dispatcher::DispatcherError`] cell, exactly like a worker
    /// thread's own transact failures, since `send_response` may run long after its originating
    /// worker has moved on to another request.
    pub fn send_response(&self, header: ResponseHeader, data: Vec<u8>) -> io::Result<()> {
        if self.completed.swap(true, Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "response already sent for this request",
            ));
        }
        let result = self
            .transport
            .post_deferred(self.btl, TransactResponse { header, data });
        if let Err(ref err) = result {
            self.error.latch(err.raw_os_error().unwrap_or(libc::EIO));
        }
        result
    }
}

impl<T: Transport + ?Sized> Clone for OperationContext<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            error: self.error.clone(),
            btl: self.btl,
            hint: self.hint,
            kind: self.kind,
            completed: self.completed.clone(),
        }
    }
}
