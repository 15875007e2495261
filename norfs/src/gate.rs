//! Re-entrant concurrency gate serializing filesystem operations.
//!
//! Every top-level filesystem call runs under one process-wide gate, so
//! operations from different tasks are strictly serialized and no two
//! block-device calls ever overlap. The gate must be re-entrant: some
//! engine-internal call chains re-acquire it through the lock hooks while
//! the owning task already holds it, and a plain exclusive lock would
//! deadlock there.

use core::hint::spin_loop;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::error::{Error, Result};

/// Owner word value when the gate is free.
const NO_OWNER: usize = usize::MAX;

/// Supplies a stable identity for the currently running task.
///
/// Identities only need to be distinct between tasks that can run
/// concurrently, and must never equal `usize::MAX`.
pub trait TaskIdProvider: Send + Sync {
    /// Identity of the calling task.
    fn current_task(&self) -> usize;
}

/// Lock callbacks handed to the filesystem engine at mount.
///
/// The engine brackets its re-entrant internal call chains with these;
/// failures map to [`Error::Io`] per the error contract.
pub trait LockHooks: Send + Sync {
    /// Acquire the gate, blocking without bound.
    fn lock(&self) -> Result<()>;

    /// Release one level of the gate.
    fn unlock(&self) -> Result<()>;
}

/// A counting lock keyed by owner task identity.
///
/// Acquisition blocks (spins) indefinitely until the gate is free; there
/// is no timeout or cancellation path. Nested acquisition by the owning
/// task increments a depth counter instead of deadlocking. Ownership is
/// transient per call chain, never held across a return to caller code.
pub struct ReentrantGate<P> {
    owner: AtomicUsize,
    depth: AtomicU32,
    tasks: P,
}

impl<P: TaskIdProvider> ReentrantGate<P> {
    /// Create a free gate drawing task identities from `tasks`.
    pub const fn new(tasks: P) -> Self {
        Self {
            owner: AtomicUsize::new(NO_OWNER),
            depth: AtomicU32::new(0),
            tasks,
        }
    }

    /// Acquire the gate for the calling task, blocking without bound.
    pub fn lock(&self) -> Result<()> {
        let me = self.tasks.current_task();
        if me == NO_OWNER {
            return Err(Error::Io);
        }
        if self.owner.load(Ordering::Acquire) == me {
            // Re-entry: only the owner can observe itself as owner, so the
            // depth word is not contended here.
            let depth = self.depth.load(Ordering::Relaxed);
            self.depth.store(depth + 1, Ordering::Relaxed);
            return Ok(());
        }
        loop {
            if self
                .owner
                .compare_exchange(NO_OWNER, me, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                self.depth.store(1, Ordering::Relaxed);
                return Ok(());
            }
            spin_loop();
        }
    }

    /// Release one level of the gate.
    ///
    /// Fails with [`Error::Io`] when the calling task does not hold it.
    pub fn unlock(&self) -> Result<()> {
        let me = self.tasks.current_task();
        if self.owner.load(Ordering::Acquire) != me {
            return Err(Error::Io);
        }
        let depth = self.depth.load(Ordering::Relaxed);
        if depth == 0 {
            return Err(Error::Io);
        }
        if depth == 1 {
            self.depth.store(0, Ordering::Relaxed);
            self.owner.store(NO_OWNER, Ordering::Release);
        } else {
            self.depth.store(depth - 1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Acquire the gate and return a guard releasing it on drop.
    pub fn guard(&self) -> Result<GateGuard<'_, P>> {
        self.lock()?;
        Ok(GateGuard { gate: self })
    }

    /// Whether any task currently holds the gate.
    pub fn is_locked(&self) -> bool {
        self.owner.load(Ordering::Relaxed) != NO_OWNER
    }
}

impl<P: TaskIdProvider> LockHooks for ReentrantGate<P> {
    fn lock(&self) -> Result<()> {
        ReentrantGate::lock(self)
    }

    fn unlock(&self) -> Result<()> {
        ReentrantGate::unlock(self)
    }
}

/// RAII guard releasing one level of a [`ReentrantGate`] when dropped.
pub struct GateGuard<'a, P: TaskIdProvider> {
    gate: &'a ReentrantGate<P>,
}

impl<P: TaskIdProvider> Drop for GateGuard<'_, P> {
    fn drop(&mut self) {
        // The owning task constructed this guard, so release cannot fail.
        let _ = self.gate.unlock();
    }
}

/// Task identities drawn from host threads, for tests and host tooling.
#[cfg(feature = "std")]
#[derive(Debug, Default, Clone, Copy)]
pub struct StdThreads;

#[cfg(feature = "std")]
impl TaskIdProvider for StdThreads {
    fn current_task(&self) -> usize {
        use core::cell::Cell;

        static NEXT: AtomicUsize = AtomicUsize::new(1);
        std::thread_local! {
            static TASK_ID: Cell<usize> = const { Cell::new(0) };
        }
        TASK_ID.with(|id| {
            if id.get() == 0 {
                id.set(NEXT.fetch_add(1, Ordering::Relaxed));
            }
            id.get()
        })
    }
}
