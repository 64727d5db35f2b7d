//! Cancellable operation context.
//!
//! Every network or process operation takes a [`Context`]. Cancelling it sets
//! a flag that is checked at each read and write, and runs the hooks that
//! transports register to unblock calls already in flight (killing a
//! subprocess, for example).

use crate::{GitError, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

type Hook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Inner {
    cancelled: AtomicBool,
    next_hook: AtomicU64,
    hooks: Mutex<Vec<(u64, Hook)>>,
}

/// A cloneable cancellation handle shared by an operation and its caller.
#[derive(Clone, Default)]
pub struct Context {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl Context {
    /// Creates a context that has not been cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels the context and runs every registered hook once.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        let hooks = std::mem::take(&mut *self.inner.hooks.lock());
        tracing::debug!(hooks = hooks.len(), "operation cancelled");
        for (_, hook) in hooks {
            hook();
        }
    }

    /// Returns true if [`Context::cancel`] has been called.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Returns [`GitError::Cancelled`] if the context was cancelled.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(GitError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Registers a hook to run on cancellation.
    ///
    /// If the context is already cancelled the hook runs immediately. The hook
    /// is unregistered when the returned guard is dropped.
    pub fn on_cancel(&self, hook: impl FnOnce() + Send + 'static) -> CancelGuard {
        let id = self.inner.next_hook.fetch_add(1, Ordering::Relaxed);
        let mut hooks = self.inner.hooks.lock();
        if self.is_cancelled() {
            drop(hooks);
            hook();
        } else {
            hooks.push((id, Box::new(hook)));
        }
        CancelGuard {
            inner: Arc::clone(&self.inner),
            id,
        }
    }
}

/// Unregisters a cancellation hook on drop.
pub struct CancelGuard {
    inner: Arc<Inner>,
    id: u64,
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        self.inner.hooks.lock().retain(|(id, _)| *id != self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_check_after_cancel() {
        let ctx = Context::new();
        assert!(ctx.check().is_ok());
        ctx.clone().cancel();
        assert!(ctx.is_cancelled());
        assert!(matches!(ctx.check(), Err(GitError::Cancelled)));
    }

    #[test]
    fn test_hooks_run_once() {
        let ctx = Context::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let _guard = ctx.on_cancel(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        ctx.cancel();
        ctx.cancel();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dropped_guard_unregisters_hook() {
        let ctx = Context::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        drop(ctx.on_cancel(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        ctx.cancel();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_hook_registered_after_cancel_runs_immediately() {
        let ctx = Context::new();
        ctx.cancel();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let _guard = ctx.on_cancel(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
