//! The storage unit object
//!
//! [`StorageUnit`] ties a provisioned logical unit, its [`StorageUnitInterface`] handler, and
//! its [`Dispatcher`] worker pool together into the single object an application creates,
//! configures, and eventually deletes.

use std::any::Any;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::DispatcherConfig;
use crate::debug_log::DebugLogMask;
use crate::dispatcher::Dispatcher;
use crate::error::Error;
use crate::interface::StorageUnitInterface;
use crate::params::{Btl, StorageUnitParams};
use crate::transport::Transport;

/// A provisioned logical unit and the worker pool dispatching requests to it.
pub struct StorageUnit<T: Transport, I: StorageUnitInterface<T> + 'static> {
    transport: Arc<T>,
    btl: Btl,
    interface: Arc<I>,
    dispatcher: Dispatcher<T, I>,
    user_context: RwLock<Option<Box<dyn Any + Send + Sync>>>,
}

impl<T, I> StorageUnit<T, I>
where
    T: Transport,
    I: StorageUnitInterface<T> + 'static,
{
    /// Validate `params`, provision a logical unit through `transport`, and start its worker
    /// pool dispatching to `interface`.
    pub fn create(
        transport: Arc<T>,
        params: &StorageUnitParams,
        interface: I,
        config: DispatcherConfig,
    ) -> Result<Self, Error> {
        params.validate()?;
        let btl = transport.provision(params)?;
        let interface = Arc::new(interface);
        let dispatcher = match Dispatcher::spawn(
            transport.clone(),
            interface.clone(),
            btl,
            config,
            DebugLogMask::empty(),
        ) {
            Ok(dispatcher) => dispatcher,
            Err(err) => {
                let _ = transport.unprovision(btl);
                return Err(Error::Transport(err));
            }
        };
        Ok(Self {
            transport,
            btl,
            interface,
            dispatcher,
            user_context: RwLock::new(None),
        })
    }

    /// The BTL this unit was provisioned with.
    pub fn btl(&self) -> Btl {
        self.btl
    }

    /// The handler implementation backing this unit's requests.
    pub fn interface(&self) -> &I {
        &self.interface
    }

    /// Replace which opcode kinds produce per-request debug trace.
    pub fn set_debug_log(&self, mask: DebugLogMask) {
        self.dispatcher.set_debug_log(mask);
    }

    /// The first error any worker thread has latched, if any.
    pub fn dispatcher_error(&self) -> Option<i32> {
        self.dispatcher.error()
    }

    /// Attach an arbitrary, caller-owned value to this unit, replacing any previous one.
    pub fn set_user_context<C: Any + Send + Sync>(&self, context: C) {
        *self.user_context.write() = Some(Box::new(context));
    }

    /// Run `f` against the attached user context, if one of type `C` is present.
    pub fn with_user_context<C: Any + Send + Sync, R>(&self, f: impl FnOnce(&C) -> R) -> Option<R> {
        self.user_context
            .read()
            .as_ref()
            .and_then(|ctx| ctx.downcast_ref::<C>())
            .map(f)
    }

    /// Stop the worker pool and unprovision the logical unit. Idempotent: calling this more
    /// than once is a no-op after the first call.
    pub fn delete(&self) {
        self.dispatcher.shutdown();
        let _ = self.transport.unprovision(self.btl);
    }
}

impl<T: Transport, I: StorageUnitInterface<T> + 'static> Drop for StorageUnit<T, I> {
    fn drop(&mut self) {
        self.delete();
    }
}
