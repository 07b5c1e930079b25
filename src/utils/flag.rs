use crossbeam::utils::CachePadded;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Cheaply clonable boolean signal shared between threads.
/// Wraps an `AtomicBool` in `Arc<CachePadded<...>>` to avoid false sharing
/// when the flag sits next to hot queue state.
#[derive(Clone, Default)]
#[repr(transparent)]
pub struct SharedFlag(Arc<CachePadded<AtomicBool>>);

impl SharedFlag {
    #[inline]
    pub fn new(initial: bool) -> Self {
        Self(Arc::new(CachePadded::new(AtomicBool::new(initial))))
    }

    /// Relaxed load; cheap enough for per-iteration polling.
    #[inline(always)]
    pub fn get(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn set(&self, v: bool) {
        self.0.store(v, Ordering::Relaxed)
    }

    /// Acquire load, paired with [`set_release`](Self::set_release) when the
    /// flag publishes state written by another thread.
    #[inline]
    pub fn get_acquire(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_release(&self, v: bool) {
        self.0.store(v, Ordering::Release)
    }
}

impl fmt::Debug for SharedFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SharedFlag").field(&self.get()).finish()
    }
}
