//! ## Exclusive ownership
//!
//! A [Handle] is the sole owner of one heap object, the type the engine uses
//! for backend resources with a clear single owner: shader modules, windows,
//! swapchains. No reference counting, destruction happens deterministically
//! when the handle goes out of scope or is [reset](Handle::reset).
//!
//! Handles are move-only. Duplicating one would duplicate the destruction,
//! so there simply is no `Clone`. The only ways ownership leaves a handle are
//! a move, [release](Handle::release), or the one-shot
//! [to_shared](Handle::to_shared) conversion.

use crate::PolymorphicBase;
use crate::backend::{self, MemoryBackend};
use crate::block::ControlBlock;
use crate::error::MemoryError;
use crate::shared::Shared;
use std::alloc::Layout;
use std::fmt;
use std::ptr::{self, NonNull};

///Exclusive, move-only ownership of a heap object.
pub struct Handle<T: ?Sized> {
    raw: Option<NonNull<T>>,
    backend: &'static dyn MemoryBackend,
}

//Safety: a Handle is the unique owner, moving it across threads moves the
//payload with it. Sharing a &Handle only shares &T access.
unsafe impl<T: ?Sized + Send> Send for Handle<T> {}
unsafe impl<T: ?Sized + Sync> Sync for Handle<T> {}

impl<T> Handle<T> {
    ///Allocates on the default backend and takes ownership of `value`.
    pub fn new(value: T) -> Result<Self, MemoryError> {
        Self::new_in(value, backend::system())
    }

    ///Same as [new](Handle::new) with an explicit backend.
    pub fn new_in(value: T, backend: &'static dyn MemoryBackend) -> Result<Self, MemoryError> {
        let layout = Layout::new::<T>();
        let raw = if layout.size() == 0 {
            NonNull::<T>::dangling()
        } else {
            backend.allocate(layout)?.cast::<T>()
        };
        //Safety: fresh (or dangling-for-zero-size) storage, sized and aligned
        //for T.
        unsafe { raw.as_ptr().write(value) };
        Ok(Handle {
            raw: Some(raw),
            backend,
        })
    }

    ///One-shot conversion into shared ownership.
    ///
    /// Co-allocates a fresh control block, relocates the payload into it by
    /// bit copy (a move, the destructor does not run) and gives the old
    /// storage back. The handle is empty afterwards, the returned [Shared] is
    /// the one strong owner.
    ///
    /// Fails with [ReleasedHandle](MemoryError::ReleasedHandle) if ownership
    /// was already given up, and on allocation failure the handle keeps its
    /// object.
    pub fn to_shared(&mut self) -> Result<Shared<T>, MemoryError> {
        let raw = self.raw.take().ok_or(MemoryError::ReleasedHandle)?;
        let (ctrl, payload) = match ControlBlock::allocate_uninit::<T>(self.backend) {
            Ok(parts) => parts,
            Err(e) => {
                self.raw = Some(raw);
                return Err(e);
            }
        };

        //Safety: both regions are sized for T and cannot overlap. After the
        //copy the old storage holds dead bytes, so it is released without
        //running the destructor, ownership moved rather than duplicated.
        unsafe {
            ptr::copy_nonoverlapping(raw.as_ptr(), payload.as_ptr(), 1);
            let layout = Layout::new::<T>();
            if layout.size() != 0 {
                self.backend.deallocate(raw.cast::<u8>(), layout);
            }
        }

        Ok(Shared::from_parts(ctrl, payload))
    }

    ///Converts into a handle on the interface type `B`, declared via
    /// [polymorphic_base](crate::polymorphic_base). The concrete destructor
    /// still runs on drop. Conversions without the declared capability do not
    /// compile:
    ///
    /// ```compile_fail
    /// use skarn_memory::Handle;
    ///
    /// trait Iface {}
    /// struct Plain;
    ///
    /// let plain = Handle::new(Plain).unwrap();
    /// let _: Handle<dyn Iface> = plain.upcast();
    /// ```
    pub fn upcast<B: ?Sized>(mut self) -> Handle<B>
    where
        T: PolymorphicBase<B>,
    {
        let raw = self
            .raw
            .take()
            //Safety: as_base keeps address and provenance.
            .map(|raw| unsafe { NonNull::new_unchecked(T::as_base(raw.as_ptr())) });
        Handle {
            raw,
            backend: self.backend,
        }
    }
}

impl<T: ?Sized> Handle<T> {
    ///Wraps a raw owning pointer.
    ///
    /// # Safety
    ///
    /// `ptr` must point at a live object allocated from `backend` with
    /// `Layout::for_value` of that object (zero sized objects excepted, those
    /// never touched the backend), and nothing else may own it.
    pub unsafe fn from_raw(ptr: NonNull<T>, backend: &'static dyn MemoryBackend) -> Self {
        Handle {
            raw: Some(ptr),
            backend,
        }
    }

    ///True while the handle still owns its object.
    pub fn is_valid(&self) -> bool {
        self.raw.is_some()
    }

    pub fn get(&self) -> Option<&T> {
        //Safety: we own the object, the borrow pins the handle.
        self.raw.map(|raw| unsafe { &*raw.as_ptr() })
    }

    pub fn get_mut(&mut self) -> Option<&mut T> {
        //Safety: exclusive borrow of the sole owner.
        self.raw.map(|raw| unsafe { &mut *raw.as_ptr() })
    }

    ///Owned address, `None` once released.
    pub fn as_ptr(&self) -> Option<NonNull<T>> {
        self.raw
    }

    ///Destroys the owned object right now instead of at scope exit. Array
    /// payloads are taken apart element by element. A released handle stays
    /// a no-op.
    pub fn reset(&mut self) {
        if let Some(raw) = self.raw.take() {
            //Safety: sole owner, pointer satisfies the from_raw/new contract.
            unsafe { self.destroy(raw) };
        }
    }

    ///Destroys the currently owned object and takes ownership of `ptr`
    /// instead. Handing in the pointer the handle already owns is ignored,
    /// destroying it would leave the handle dangling.
    ///
    /// # Safety
    ///
    /// Same contract as [from_raw](Handle::from_raw), or null to just empty
    /// the handle.
    pub unsafe fn reset_raw(&mut self, ptr: *mut T) {
        if let Some(current) = self.raw {
            if ptr == current.as_ptr() {
                #[cfg(feature = "logging")]
                log::warn!("handle reset to the pointer it already owns, ignoring");
                return;
            }
            //Safety: sole owner of the outgoing object.
            unsafe { self.destroy(current) };
        }
        self.raw = NonNull::new(ptr);
    }

    ///Relinquishes ownership without destruction. The caller takes over the
    /// object and its storage (allocated from this handle's backend with
    /// `Layout::for_value`).
    pub fn release(&mut self) -> Option<NonNull<T>> {
        self.raw.take()
    }

    unsafe fn destroy(&self, raw: NonNull<T>) {
        //layout has to be captured while the object is still alive
        let layout = Layout::for_value(unsafe { raw.as_ref() });
        unsafe { ptr::drop_in_place(raw.as_ptr()) };
        if layout.size() != 0 {
            unsafe { self.backend.deallocate(raw.cast::<u8>(), layout) };
        }
    }
}

impl<T: ?Sized> Drop for Handle<T> {
    fn drop(&mut self) {
        self.reset();
    }
}

impl<T: ?Sized> From<Box<T>> for Handle<T> {
    ///Adopts a boxed object. `Box` and [SystemBackend](crate::SystemBackend)
    /// share the global allocator, so the handle can free it later.
    fn from(value: Box<T>) -> Self {
        //Safety: Box::into_raw is never null.
        let raw = unsafe { NonNull::new_unchecked(Box::into_raw(value)) };
        Handle {
            raw: Some(raw),
            backend: backend::system(),
        }
    }
}

///Handles compare by owned address, two valid handles can never be equal.
impl<T: ?Sized> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        match (self.raw, other.raw) {
            (Some(a), Some(b)) => a == b,
            (None, None) => true,
            _ => false,
        }
    }
}

impl<T: ?Sized> Eq for Handle<T> {}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get() {
            Some(value) => f.debug_tuple("Handle").field(&value).finish(),
            None => f.write_str("Handle(released)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::{CountingBackend, FAILING};
    use crate::polymorphic_base;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Probe {
        drops: Arc<AtomicU32>,
    }

    impl Drop for Probe {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn assure_send_sync() {
        use static_assertions::assert_impl_all;
        assert_impl_all!(Handle<u32>: Send, Sync);
    }

    #[test]
    fn scope_exit_destroys_and_frees_once() {
        let backend = CountingBackend::leaked();
        let drops = Arc::new(AtomicU32::new(0));
        {
            let handle = Handle::new_in(
                Probe {
                    drops: drops.clone(),
                },
                backend,
            )
            .unwrap();
            assert!(handle.is_valid());
            assert_eq!(drops.load(Ordering::SeqCst), 0);
        }
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert_eq!(backend.allocations(), 1);
        assert_eq!(backend.frees(), 1);
    }

    #[test]
    fn reset_destroys_early_and_empties() {
        let drops = Arc::new(AtomicU32::new(0));
        let mut handle = Handle::new(Probe {
            drops: drops.clone(),
        })
        .unwrap();

        handle.reset();
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert!(!handle.is_valid());
        assert!(handle.get().is_none());

        //resetting again stays a no-op
        handle.reset();
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn release_skips_destruction() {
        let backend = CountingBackend::leaked();
        let drops = Arc::new(AtomicU32::new(0));
        let mut handle = Handle::new_in(
            Probe {
                drops: drops.clone(),
            },
            backend,
        )
        .unwrap();

        let raw = handle.release().unwrap();
        drop(handle);
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        assert_eq!(backend.frees(), 0);

        //the caller became responsible, give it back to a handle to clean up
        let adopted = unsafe { Handle::from_raw(raw, backend) };
        drop(adopted);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert_eq!(backend.frees(), 1);
    }

    #[test]
    fn reset_raw_swaps_ownership() {
        let backend = CountingBackend::leaked();
        let drops = Arc::new(AtomicU32::new(0));
        let mk = || {
            Handle::new_in(
                Probe {
                    drops: drops.clone(),
                },
                backend,
            )
            .unwrap()
        };

        let mut first = mk();
        let mut second = mk();
        let incoming = second.release().unwrap();

        unsafe { first.reset_raw(incoming.as_ptr()) };
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert_eq!(first.as_ptr(), Some(incoming));

        //handing the owned pointer back in must not destroy it
        unsafe { first.reset_raw(incoming.as_ptr()) };
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert!(first.is_valid());

        drop(first);
        assert_eq!(drops.load(Ordering::SeqCst), 2);
        assert_eq!(backend.frees(), 2);
    }

    #[derive(PartialEq, Debug)]
    struct Named {
        name: String,
    }

    #[test]
    fn to_shared_moves_the_payload() {
        let backend = CountingBackend::leaked();
        let mut handle = Handle::new_in(
            Named {
                name: String::from("albedo"),
            },
            backend,
        )
        .unwrap();

        let shared = handle.to_shared().unwrap();
        assert!(!handle.is_valid());
        assert_eq!(Shared::use_count(&shared), 1);
        assert_eq!(
            *shared,
            Named {
                name: String::from("albedo")
            }
        );
        //handle storage went back, the co-allocation is still out
        assert_eq!(backend.allocations(), 2);
        assert_eq!(backend.frees(), 1);
    }

    #[test]
    fn to_shared_never_runs_the_destructor_during_transfer() {
        let drops = Arc::new(AtomicU32::new(0));
        let mut handle = Handle::new(Probe {
            drops: drops.clone(),
        })
        .unwrap();

        let shared = handle.to_shared().unwrap();
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        drop(handle);
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        drop(shared);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn to_shared_on_a_released_handle_fails() {
        let mut handle = Handle::new(4u32).unwrap();
        let raw = handle.release().unwrap();
        assert_eq!(handle.to_shared().unwrap_err(), MemoryError::ReleasedHandle);

        let cleanup = unsafe { Handle::from_raw(raw, backend::system()) };
        drop(cleanup);
    }

    #[test]
    fn to_shared_keeps_the_object_on_allocation_failure() {
        let drops = Arc::new(AtomicU32::new(0));
        //allocate the handle itself on the system heap, then force the
        //co-allocation through a failing backend
        let mut handle = Handle::new(Probe {
            drops: drops.clone(),
        })
        .unwrap();
        handle.backend = &FAILING;

        assert!(handle.to_shared().is_err());
        assert!(handle.is_valid());
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        //put the real backend back so the drop can free the storage
        handle.backend = backend::system();
        drop(handle);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn array_payloads_destroy_element_wise() {
        let drops = Arc::new(AtomicU32::new(0));
        let p = || Probe {
            drops: drops.clone(),
        };
        let handle = Handle::new([p(), p(), p()]).unwrap();
        drop(handle);
        assert_eq!(drops.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn boxed_objects_can_be_adopted() {
        let drops = Arc::new(AtomicU32::new(0));
        let handle: Handle<Probe> = Box::new(Probe {
            drops: drops.clone(),
        })
        .into();
        assert!(handle.is_valid());
        drop(handle);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn zero_sized_payloads_never_touch_the_backend() {
        let backend = CountingBackend::leaked();
        let handle = Handle::new_in((), backend).unwrap();
        drop(handle);
        assert_eq!(backend.allocations(), 0);
        assert_eq!(backend.frees(), 0);
    }

    trait Resource {
        fn name(&self) -> &str;
    }

    struct ShaderProbe {
        name: String,
        _probe: Probe,
    }

    impl Resource for ShaderProbe {
        fn name(&self) -> &str {
            &self.name
        }
    }

    polymorphic_base!(ShaderProbe => dyn Resource);

    #[test]
    fn upcast_keeps_destruction_through_the_base() {
        let drops = Arc::new(AtomicU32::new(0));
        let concrete = Handle::new(ShaderProbe {
            name: String::from("tonemap"),
            _probe: Probe {
                drops: drops.clone(),
            },
        })
        .unwrap();

        let base: Handle<dyn Resource> = concrete.upcast();
        assert_eq!(base.get().unwrap().name(), "tonemap");

        drop(base);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handles_compare_by_address() {
        let a = Handle::new(5u32).unwrap();
        let b = Handle::new(5u32).unwrap();
        assert_ne!(a, b);
        assert_eq!(a, a);
    }
}
