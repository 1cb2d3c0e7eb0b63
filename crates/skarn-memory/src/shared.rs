//! ## Shared ownership
//!
//! [Shared] is the vocabulary type for everything with more than one owner,
//! cached assets mostly. Cloning is an atomic count bump, the payload and its
//! counts share one co-allocated region (see [block](crate::block)), and the
//! payload is destroyed the instant the last clone goes away, on whichever
//! thread that happens.

use crate::PolymorphicBase;
use crate::backend::{self, MemoryBackend};
use crate::block::{ControlBlock, MAX_REFCOUNT};
use crate::error::MemoryError;
use crate::weak::Weak;
use bytemuck::Zeroable;
use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::ops::Deref;
use std::process::abort;
use std::ptr::{self, NonNull};
use std::sync::atomic::{Ordering, fence};

///Reference counted shared ownership of a co-allocated payload.
///
/// Clones of one `Shared` (including upcast clones of a different payload
/// type) reference the same control block and may live on any thread. The
/// payload is dropped exactly once, strictly before its allocation is handed
/// back to the backend.
///
/// A `Shared` always points at a live payload. "Maybe there, maybe not" only
/// exists on the [Weak](crate::Weak) side, which is why [Weak::lock] returns
/// an `Option` instead of a pointer that must be null-checked before use.
pub struct Shared<T: ?Sized> {
    ctrl: NonNull<ControlBlock>,
    raw: NonNull<T>,
    _owns: PhantomData<T>,
}

//Safety: clones act like independent owners on their threads, so sending or
//sharing one is sound exactly when T itself can be sent and shared.
unsafe impl<T: ?Sized + Send + Sync> Send for Shared<T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for Shared<T> {}

impl<T> Shared<T> {
    ///Co-allocates a control block plus payload on the default backend.
    pub fn new(value: T) -> Result<Self, MemoryError> {
        Self::new_in(value, backend::system())
    }

    ///Same as [new](Shared::new) with an explicit backend. The backend also
    /// receives the free once the last strong and weak reference are gone.
    pub fn new_in(value: T, backend: &'static dyn MemoryBackend) -> Result<Self, MemoryError> {
        let (ctrl, raw) = ControlBlock::allocate_with(backend, value)?;
        Ok(Shared {
            ctrl,
            raw,
            _owns: PhantomData,
        })
    }

    ///Co-allocates a zero filled payload. Handy for the big plain-data blobs
    /// the renderer streams into later.
    pub fn new_zeroed() -> Result<Self, MemoryError>
    where
        T: Zeroable,
    {
        let (ctrl, raw) = ControlBlock::allocate_uninit::<T>(backend::system())?;
        //Safety: all zeroes is a valid T, that is what Zeroable promises.
        unsafe { raw.as_ptr().write_bytes(0, 1) };
        Ok(Shared {
            ctrl,
            raw,
            _owns: PhantomData,
        })
    }

    ///Converts into a view through the interface type `B`.
    ///
    /// The clone being upcast keeps its place in the reference count and the
    /// concrete destructor still runs when the count hits zero. Only
    /// conversions declared via [polymorphic_base](crate::polymorphic_base)
    /// (or a manual [PolymorphicBase] impl) compile:
    ///
    /// ```compile_fail
    /// use skarn_memory::Shared;
    ///
    /// trait Iface {}
    /// struct Plain;
    ///
    /// let plain = Shared::new(Plain).unwrap();
    /// // Plain never declared Iface as a base, this must not build
    /// let _: Shared<dyn Iface> = Shared::upcast(plain);
    /// ```
    pub fn upcast<B: ?Sized>(this: Self) -> Shared<B>
    where
        T: PolymorphicBase<B>,
    {
        let this = ManuallyDrop::new(this);
        //Safety: as_base keeps address and provenance, see PolymorphicBase.
        let raw = unsafe { NonNull::new_unchecked(T::as_base(this.raw.as_ptr())) };
        Shared {
            ctrl: this.ctrl,
            raw,
            _owns: PhantomData,
        }
    }
}

impl<T: ?Sized> Shared<T> {
    pub(crate) fn from_parts(ctrl: NonNull<ControlBlock>, raw: NonNull<T>) -> Self {
        Shared {
            ctrl,
            raw,
            _owns: PhantomData,
        }
    }

    fn block(&self) -> &ControlBlock {
        //Safety: a live Shared keeps its control block allocated.
        unsafe { self.ctrl.as_ref() }
    }

    ///Current number of strong owners. Only a snapshot of course, other
    /// threads may clone or drop at any time.
    pub fn use_count(this: &Self) -> u32 {
        this.block().strong.load(Ordering::Acquire)
    }

    ///Current number of weak observers, without the slot the strong owners
    /// hold among themselves.
    pub fn weak_count(this: &Self) -> u32 {
        this.block().weak.load(Ordering::Acquire).saturating_sub(1)
    }

    ///True if both point at the same control block.
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        this.ctrl == other.ctrl
    }

    ///Raw payload address, mainly useful as a map key or for logging.
    pub fn as_ptr(this: &Self) -> *const T {
        this.raw.as_ptr()
    }

    ///Registers a new weak observer of this payload.
    pub fn downgrade(this: &Self) -> Weak<T> {
        if this.block().weak.fetch_add(1, Ordering::Release) > MAX_REFCOUNT {
            abort();
        }
        Weak::from_parts(this.ctrl, this.raw)
    }

    ///Mutable access, only while this is the one and only reference (no other
    /// strong owners, no weak observers).
    pub fn get_mut(this: &mut Self) -> Option<&mut T> {
        let unique = this.block().strong.load(Ordering::Acquire) == 1
            && this.block().weak.load(Ordering::Acquire) == 1;
        if unique {
            //Safety: nobody else can reach the payload, both counts are at
            //their floor and we hold the only strong reference.
            Some(unsafe { this.raw.as_mut() })
        } else {
            None
        }
    }
}

impl Shared<dyn Any + Send + Sync> {
    ///Attempts to get the concrete payload type back after an upcast to
    /// `dyn Any`. Returns the untouched input on a type mismatch.
    pub fn downcast<T: Any + Send + Sync>(this: Self) -> Result<Shared<T>, Self> {
        if (*this).is::<T>() {
            let this = ManuallyDrop::new(this);
            Ok(Shared {
                ctrl: this.ctrl,
                raw: this.raw.cast::<T>(),
                _owns: PhantomData,
            })
        } else {
            Err(this)
        }
    }
}

impl<T: ?Sized> Clone for Shared<T> {
    fn clone(&self) -> Self {
        //The new owner must see the payload fully initialized before it can
        //touch it, so this is not a relaxed bump.
        if self.block().strong.fetch_add(1, Ordering::Release) > MAX_REFCOUNT {
            abort();
        }
        Shared {
            ctrl: self.ctrl,
            raw: self.raw,
            _owns: PhantomData,
        }
    }
}

impl<T: ?Sized> Drop for Shared<T> {
    fn drop(&mut self) {
        if self.block().strong.fetch_sub(1, Ordering::Release) != 1 {
            return;
        }
        //all writes of the other owners happen before the destructor runs
        fence(Ordering::Acquire);
        debug_assert!(self.block().payload_alive());

        //Safety: we observed the count hit zero, the payload is ours to
        //destroy. Nested array payloads are taken apart depth first, element
        //by element, the allocation itself stays untouched.
        unsafe { ptr::drop_in_place(self.raw.as_ptr()) };
        self.block().raw.store(ptr::null_mut(), Ordering::Release);

        //give up the weak slot the strong owners were sharing
        if self.block().weak.fetch_sub(1, Ordering::Release) == 1 {
            fence(Ordering::Acquire);
            //Safety: last reference of any kind, nobody can observe the
            //block anymore.
            unsafe { ControlBlock::destroy(self.ctrl) };
        }
    }
}

impl<T: ?Sized> Deref for Shared<T> {
    type Target = T;

    fn deref(&self) -> &T {
        //Safety: a live Shared implies a live payload.
        unsafe { self.raw.as_ref() }
    }
}

impl<T: ?Sized> AsRef<T> for Shared<T> {
    fn as_ref(&self) -> &T {
        self
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Shared<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}
