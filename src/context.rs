//! Accelerator contexts bound to one device.
//!
//! A context is made current with [`SessionContext::acquire`], which returns a
//! guard that pops it again on every exit path. Only one session context may
//! be current on a thread at a time.

use std::cell::Cell;
use std::sync::Arc;

use tracing::debug;

use crate::driver::{ContextHandle, Driver};
use crate::error::{CodecError, Result};
use crate::failure::{translate, translate_for_device, Operation};
use crate::registry::DeviceRegistry;

thread_local! {
    static CURRENT: Cell<Option<u64>> = const { Cell::new(None) };
}

/// Context current on the calling thread, if any.
#[must_use]
pub fn current_context() -> Option<u64> {
    CURRENT.with(Cell::get)
}

/// One accelerator context, owned by a single session.
pub struct SessionContext {
    registry: Arc<DeviceRegistry>,
    device: u32,
    handle: Option<ContextHandle>,
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("device", &self.device)
            .field("handle", &self.handle)
            .finish()
    }
}

impl SessionContext {
    /// Create a context on `device`.
    ///
    /// Running out of contexts is expected under load and only logged at
    /// debug level.
    pub fn create(registry: Arc<DeviceRegistry>, device: u32) -> Result<Self> {
        registry.device(device)?;
        let handle = match registry.driver().create_context(device) {
            Ok(handle) => handle,
            Err(status) => {
                let err = translate_for_device(device, status, Operation::CreateContext);
                if err.is_transient() {
                    debug!("cannot create context on device {}: {}", device, err);
                }
                return Err(err);
            }
        };
        registry.context_opened(device);
        debug!("created context {} on device {}", handle.0, device);
        Ok(Self {
            registry,
            device,
            handle: Some(handle),
        })
    }

    #[must_use]
    pub fn device(&self) -> u32 {
        self.device
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn driver(&self) -> &Arc<dyn Driver> {
        self.registry.driver()
    }

    pub fn handle(&self) -> Result<ContextHandle> {
        self.handle.ok_or(CodecError::SessionClosed)
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    /// Make the context current until the guard drops.
    pub fn acquire(&self) -> Result<ContextGuard<'_>> {
        let handle = self.handle()?;
        if let Some(current) = current_context() {
            return Err(CodecError::ContextAlreadyCurrent { current });
        }
        self.driver()
            .push_context(handle)
            .map_err(|s| translate(s, Operation::PushContext))?;
        CURRENT.with(|c| c.set(Some(handle.0)));
        Ok(ContextGuard {
            context: self,
            handle,
        })
    }

    /// Fails unless this context is current on the calling thread.
    pub fn ensure_current(&self) -> Result<ContextHandle> {
        let handle = self.handle()?;
        if current_context() == Some(handle.0) {
            Ok(handle)
        } else {
            Err(CodecError::ContextNotCurrent(handle.0))
        }
    }

    /// Destroy the context. Safe to call more than once.
    pub fn close(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        if current_context() == Some(handle.0) {
            CURRENT.with(|c| c.set(None));
        }
        if let Err(status) = self.driver().destroy_context(handle) {
            debug!(
                "destroying context {}: {}",
                handle.0,
                translate(status, Operation::DestroyContext)
            );
        }
        self.registry.context_closed(self.device);
        debug!("closed context {} on device {}", handle.0, self.device);
    }
}

impl Drop for SessionContext {
    fn drop(&mut self) {
        self.close();
    }
}

/// Keeps a context current; pops it on drop.
#[derive(Debug)]
pub struct ContextGuard<'a> {
    context: &'a SessionContext,
    handle: ContextHandle,
}

impl ContextGuard<'_> {
    #[must_use]
    pub fn handle(&self) -> ContextHandle {
        self.handle
    }

    #[must_use]
    pub fn context(&self) -> &SessionContext {
        self.context
    }
}

impl Drop for ContextGuard<'_> {
    fn drop(&mut self) {
        CURRENT.with(|c| c.set(None));
        if let Err(status) = self.context.driver().pop_context(self.handle) {
            debug!("pop context {}: {}", self.handle.0, translate(status, Operation::PopContext));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AccelConfig;
    use crate::driver::emulated::{EmulatedDevice, EmulatedDriver};

    fn setup(max_contexts: u32) -> (EmulatedDriver, Arc<DeviceRegistry>) {
        let driver = EmulatedDriver::new(vec![EmulatedDevice::new("a").max_contexts(max_contexts)]);
        let registry = Arc::new(DeviceRegistry::new(Arc::new(driver.clone()), AccelConfig::default()));
        (driver, registry)
    }

    #[test]
    fn test_acquire_and_release() {
        let (_, registry) = setup(4);
        let ctx = SessionContext::create(registry.clone(), 0).unwrap();
        assert_eq!(registry.open_contexts(0).unwrap(), 1);
        assert!(ctx.ensure_current().is_err());
        {
            let guard = ctx.acquire().unwrap();
            assert_eq!(ctx.ensure_current().unwrap(), guard.handle());
        }
        assert!(matches!(ctx.ensure_current(), Err(CodecError::ContextNotCurrent(_))));
    }

    #[test]
    fn test_one_context_per_thread() {
        let (_, registry) = setup(4);
        let a = SessionContext::create(registry.clone(), 0).unwrap();
        let b = SessionContext::create(registry, 0).unwrap();
        let _guard = a.acquire().unwrap();
        assert!(matches!(b.acquire(), Err(CodecError::ContextAlreadyCurrent { .. })));
    }

    #[test]
    fn test_exhaustion_is_transient() {
        let (driver, registry) = setup(1);
        let _a = SessionContext::create(registry.clone(), 0).unwrap();
        let err = SessionContext::create(registry.clone(), 0).unwrap_err();
        assert!(matches!(err, CodecError::ContextExhausted { device: 0 }));
        assert!(err.is_transient());
        assert_eq!(registry.open_contexts(0).unwrap(), 1);
        assert_eq!(driver.contexts_on(0), 1);
    }

    #[test]
    fn test_close_is_idempotent() {
        let (driver, registry) = setup(4);
        let mut ctx = SessionContext::create(registry.clone(), 0).unwrap();
        ctx.close();
        ctx.close();
        drop(ctx);
        assert_eq!(registry.open_contexts(0).unwrap(), 0);
        assert_eq!(driver.stats().contexts, 0);
    }
}
