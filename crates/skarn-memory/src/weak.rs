//! ## Weak references
//!
//! A [Weak] watches a [Shared](crate::Shared) payload without keeping it
//! alive. The classic consumers are the event bus and the thread pool, which
//! must be able to reference task state without stopping the rest of the
//! engine from throwing it away.

use crate::block::{ControlBlock, MAX_REFCOUNT};
use crate::shared::Shared;
use std::fmt;
use std::process::abort;
use std::ptr::NonNull;
use std::sync::atomic::{Ordering, fence};

///Non-owning observer of a shared payload's lifetime.
///
/// Keeps the control block (and with it the whole co-allocation) alive, but
/// not the payload. [lock](Weak::lock) re-acquires shared ownership while the
/// payload still exists.
pub struct Weak<T: ?Sized> {
    ctrl: NonNull<ControlBlock>,
    raw: NonNull<T>,
}

//Safety: same reasoning as for Shared, a Weak is just a lazier owner.
unsafe impl<T: ?Sized + Send + Sync> Send for Weak<T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for Weak<T> {}

impl<T: ?Sized> Weak<T> {
    ///`raw` may already dangle, it is only ever handed back out through a
    /// successful [lock](Weak::lock), which proves the payload still exists.
    pub(crate) fn from_parts(ctrl: NonNull<ControlBlock>, raw: NonNull<T>) -> Self {
        Weak { ctrl, raw }
    }

    fn block(&self) -> &ControlBlock {
        //Safety: a live Weak keeps its control block allocated.
        unsafe { self.ctrl.as_ref() }
    }

    ///Attempts to re-acquire shared ownership.
    ///
    /// Returns `None` once the last strong owner is gone. The increment is a
    /// compare-and-swap loop conditioned on the strong count still being
    /// non-zero at the moment of the bump, a plain check-then-increment could
    /// race with the final release and resurrect a destroyed payload.
    pub fn lock(&self) -> Option<Shared<T>> {
        let mut strong = self.block().strong.load(Ordering::Acquire);
        loop {
            if strong == 0 {
                return None;
            }
            if strong > MAX_REFCOUNT {
                abort();
            }
            match self.block().strong.compare_exchange_weak(
                strong,
                strong + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(Shared::from_parts(self.ctrl, self.raw)),
                Err(current) => strong = current,
            }
        }
    }

    ///True once the payload has been destroyed. A `false` is stale the moment
    /// it is returned, use [lock](Weak::lock) to actually touch the payload.
    pub fn expired(&self) -> bool {
        self.block().strong.load(Ordering::Acquire) == 0
    }

    ///Current number of strong owners, zero once expired.
    pub fn use_count(&self) -> u32 {
        self.block().strong.load(Ordering::Acquire)
    }
}

impl<T: ?Sized> Clone for Weak<T> {
    fn clone(&self) -> Self {
        if self.block().weak.fetch_add(1, Ordering::Release) > MAX_REFCOUNT {
            abort();
        }
        Weak {
            ctrl: self.ctrl,
            raw: self.raw,
        }
    }
}

impl<T: ?Sized> Drop for Weak<T> {
    fn drop(&mut self) {
        //The strong owners collectively hold one weak slot, so the count can
        //only hit zero after the payload is already gone. Whoever observes
        //the zero frees the region, exactly once.
        if self.block().weak.fetch_sub(1, Ordering::Release) == 1 {
            fence(Ordering::Acquire);
            //Safety: last reference of any kind to the block.
            unsafe { ControlBlock::destroy(self.ctrl) };
        }
    }
}

impl<T: ?Sized> fmt::Debug for Weak<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(Weak)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::CountingBackend;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU32;

    struct Probe {
        drops: Arc<AtomicU32>,
    }

    impl Drop for Probe {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn probed() -> (Arc<AtomicU32>, Shared<Probe>) {
        let drops = Arc::new(AtomicU32::new(0));
        let shared = Shared::new(Probe {
            drops: drops.clone(),
        })
        .unwrap();
        (drops, shared)
    }

    #[test]
    fn assure_send_sync() {
        use static_assertions::assert_impl_all;
        assert_impl_all!(Weak<u32>: Send, Sync);
    }

    #[test]
    fn lock_while_alive_bumps_the_strong_count() {
        let (_, shared) = probed();
        let watcher = Shared::downgrade(&shared);
        assert!(!watcher.expired());
        assert_eq!(watcher.use_count(), 1);

        let locked = watcher.lock().unwrap();
        assert_eq!(Shared::use_count(&shared), 2);
        assert!(Shared::ptr_eq(&shared, &locked));
    }

    #[test]
    fn lock_after_release_is_none() {
        let (drops, shared) = probed();
        let watcher = Shared::downgrade(&shared);

        drop(shared);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert!(watcher.expired());
        assert_eq!(watcher.use_count(), 0);
        assert!(watcher.lock().is_none());
    }

    #[test]
    fn last_weak_frees_the_allocation_exactly_once() {
        let backend = CountingBackend::leaked();
        let shared = Shared::new_in(77u64, backend).unwrap();
        let first = Shared::downgrade(&shared);
        let second = first.clone();

        drop(shared);
        assert_eq!(backend.frees(), 0);
        drop(first);
        assert_eq!(backend.frees(), 0);
        drop(second);
        assert_eq!(backend.frees(), 1);
        assert_eq!(backend.allocations(), 1);
    }

    #[test]
    fn weak_count_is_visible_from_the_strong_side() {
        let (_, shared) = probed();
        assert_eq!(Shared::weak_count(&shared), 0);
        let watcher = Shared::downgrade(&shared);
        let another = watcher.clone();
        assert_eq!(Shared::weak_count(&shared), 2);
        drop(watcher);
        drop(another);
        assert_eq!(Shared::weak_count(&shared), 0);
    }

    #[test]
    fn lock_never_resurrects_a_destroyed_payload() {
        for _ in 0..200 {
            let (drops, shared) = probed();
            let watcher = Shared::downgrade(&shared);

            std::thread::scope(|s| {
                s.spawn(|| drop(shared));
                s.spawn(|| {
                    loop {
                        match watcher.lock() {
                            Some(locked) => {
                                //holding a lock means the payload cannot have
                                //died yet
                                assert_eq!(drops.load(Ordering::SeqCst), 0);
                                drop(locked);
                            }
                            None => {
                                assert!(watcher.expired());
                                break;
                            }
                        }
                        std::hint::spin_loop();
                    }
                });
            });

            assert_eq!(drops.load(Ordering::SeqCst), 1);
        }
    }
}
