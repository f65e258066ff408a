//! Mutual exclusion of background refresh loops

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use once_cell::sync::OnceCell;

static PROCESS_GUARD: OnceCell<SingletonGuard> = OnceCell::new();

const VACANT: u64 = 0;

struct GuardState {
    holder: AtomicU64,
    next_generation: AtomicU64,
}

/// A flag ensuring at most one background refresh loop runs at a time
///
/// Every scheduler sharing a guard competes for a single slot. The
/// [process-wide guard](Self::process) is shared by every scheduler that is
/// not given one explicitly, so constructing a second service in the same
/// process cannot start a second loop.
///
/// A successful acquisition yields a [`GuardLease`] carrying a generation
/// number. Releasing by generation only clears the slot if that lease still
/// holds it, so a late release can never free a slot that has since been
/// taken by someone else.
#[derive(Clone)]
pub struct SingletonGuard {
    state: Arc<GuardState>,
}

impl fmt::Debug for SingletonGuard {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SingletonGuard")
            .field("holder", &self.state.holder.load(Ordering::Acquire))
            .finish()
    }
}

impl SingletonGuard {
    /// The guard shared by the whole process
    pub fn process() -> Self {
        PROCESS_GUARD.get_or_init(Self::isolated).clone()
    }

    /// A new guard shared only with its clones
    pub fn isolated() -> Self {
        Self {
            state: Arc::new(GuardState {
                holder: AtomicU64::new(VACANT),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// Attempts to take the slot
    ///
    /// Returns `None` if another lease currently holds it.
    pub fn try_acquire(&self) -> Option<GuardLease> {
        let generation = self.state.next_generation.fetch_add(1, Ordering::Relaxed);
        self.state
            .holder
            .compare_exchange(VACANT, generation, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| {
                tracing::trace!(generation, "acquired refresh loop guard");
                GuardLease {
                    guard: self.clone(),
                    generation,
                }
            })
    }

    /// Whether the slot is currently held
    pub fn is_held(&self) -> bool {
        self.state.holder.load(Ordering::Acquire) != VACANT
    }

    /// Clears the slot if it is still held by `generation`
    ///
    /// Returns whether anything was released.
    pub fn release(&self, generation: u64) -> bool {
        let released = self
            .state
            .holder
            .compare_exchange(generation, VACANT, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if released {
            tracing::trace!(generation, "released refresh loop guard");
        }
        released
    }
}

/// Proof of holding a [`SingletonGuard`]'s slot
///
/// The slot is released when the lease is dropped.
#[derive(Debug)]
pub struct GuardLease {
    guard: SingletonGuard,
    generation: u64,
}

impl GuardLease {
    /// The generation of this acquisition
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Drop for GuardLease {
    fn drop(&mut self) {
        self.guard.release(self.generation);
    }
}
