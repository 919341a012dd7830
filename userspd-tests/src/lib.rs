//! In-process fake transport for exercising `userspd` without a real kernel module.
//!
//! Mirrors the shape of the kernel transact channel closely enough for the dispatcher pool to
//! behave the same way it would against the real driver: `transact` blocks until a request is
//! available or the fake is shut down, and `post_deferred` lets a handler complete a request
//! out of band from any thread.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use userspd::params::{Btl, StorageUnitParams};
use userspd::transport::{TransactRequest, TransactResponse, Transport};

struct State {
    queues: HashMap<Btl, VecDeque<TransactRequest>>,
    completions: HashMap<Btl, Vec<TransactResponse>>,
    provisioned: HashMap<Btl, StorageUnitParams>,
    shutdown: bool,
    /// Set by [`FakeTransport::fail_after`]: once this many requests have been handed out for a
    /// `btl`, every subsequent `transact` fails instead of blocking, simulating a transport that
    /// goes fatal mid-session (spec.md §8 S6).
    fail_after: HashMap<Btl, usize>,
    served: HashMap<Btl, usize>,
}

/// A [`Transport`] backed entirely by in-memory queues, driven by a test from the "kernel"
/// side via [`FakeTransport::enqueue_request`] and [`FakeTransport::take_completions`].
pub struct FakeTransport {
    state: Mutex<State>,
    cvar: Condvar,
    next_btl: AtomicU32,
}

impl FakeTransport {
    /// A fake transport with no units provisioned yet.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                queues: HashMap::new(),
                completions: HashMap::new(),
                provisioned: HashMap::new(),
                shutdown: false,
                fail_after: HashMap::new(),
                served: HashMap::new(),
            }),
            cvar: Condvar::new(),
            next_btl: AtomicU32::new(1),
        }
    }

    /// Push a request onto `btl`'s queue, waking any worker blocked in `transact`.
    pub fn enqueue_request(&self, btl: Btl, request: TransactRequest) {
        let mut state = self.state.lock().unwrap();
        state.queues.entry(btl).or_default().push_back(request);
        self.cvar.notify_all();
    }

    /// Drain and return every response posted for `btl` so far, in posting order (synchronous
    /// completions and [`Transport::post_deferred`] completions interleaved).
    pub fn take_completions(&self, btl: Btl) -> Vec<TransactResponse> {
        let mut state = self.state.lock().unwrap();
        state.completions.entry(btl).or_default().drain(..).collect()
    }

    /// Make the `count`-th-and-later `transact` call for `btl` fail with `ECANCELED` instead of
    /// waiting for a request, simulating the kernel transport going fatal mid-session.
    pub fn fail_after(&self, btl: Btl, count: usize) {
        self.state.lock().unwrap().fail_after.insert(btl, count);
    }
}

impl Default for FakeTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for FakeTransport {
    fn provision(&self, params: &StorageUnitParams) -> io::Result<Btl> {
        let btl = Btl(self.next_btl.fetch_add(1, Ordering::SeqCst));
        let mut state = self.state.lock().unwrap();
        state.provisioned.insert(btl, params.clone());
        state.queues.insert(btl, VecDeque::new());
        Ok(btl)
    }

    fn unprovision(&self, btl: Btl) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.provisioned.remove(&btl);
        state.queues.remove(&btl);
        Ok(())
    }

    fn list(&self) -> io::Result<Vec<Btl>> {
        Ok(self.state.lock().unwrap().provisioned.keys().copied().collect())
    }

    fn transact(
        &self,
        btl: Btl,
        response: Option<TransactResponse>,
    ) -> io::Result<TransactRequest> {
        let mut state = self.state.lock().unwrap();
        if let Some(response) = response {
            state.completions.entry(btl).or_default().push(response);
        }
        loop {
            if let Some(&limit) = state.fail_after.get(&btl) {
                if *state.served.get(&btl).unwrap_or(&0) >= limit {
                    return Err(io::Error::from_raw_os_error(libc::ECANCELED));
                }
            }
            if let Some(request) = state.queues.get_mut(&btl).and_then(|q| q.pop_front()) {
                *state.served.entry(btl).or_insert(0) += 1;
                return Ok(request);
            }
            if state.shutdown {
                return Err(io::Error::from(io::ErrorKind::Interrupted));
            }
            state = self.cvar.wait(state).unwrap();
        }
    }

    fn set_transact_timeout(&self, _btl: Btl, _timeout: Duration) -> io::Result<()> {
        Ok(())
    }

    fn shutdown(&self) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.shutdown = true;
        self.cvar.notify_all();
        Ok(())
    }

    fn post_deferred(&self, btl: Btl, response: TransactResponse) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.completions.entry(btl).or_default().push(response);
        Ok(())
    }
}
