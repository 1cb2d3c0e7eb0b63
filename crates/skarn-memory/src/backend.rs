//! ## Memory backend
//!
//! The ownership types themselves never call the global allocator directly.
//! All raw memory goes through the `MemoryBackend` trait, so the engine (or a
//! test) can substitute its own allocator and observe every allocation and
//! free that the library performs.
//!
//! The default backend is [SystemBackend], a thin layer over the process heap.

use crate::error::MemoryError;
use std::alloc::{self, Layout};
use std::ptr::NonNull;

///Trait for anything that can hand out raw, aligned memory regions.
///
/// Backends are shared by reference from every control block and handle they
/// served, which is why implementations must be `Sync` and are usually kept in
/// a `static`.
pub trait MemoryBackend: Sync {
    ///Allocates one contiguous region for `layout`.
    ///
    /// The returned pointer is non-null and aligned to `layout.align()`.
    /// `layout` always has a non-zero size, zero sized payloads are handled
    /// before the backend is involved.
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, MemoryError>;

    ///Returns a region previously obtained from [allocate](MemoryBackend::allocate)
    /// on this backend.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `self` with exactly this `layout`, and must not be
    /// used afterwards.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

///Process heap backend.
pub struct SystemBackend;

impl MemoryBackend for SystemBackend {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, MemoryError> {
        debug_assert!(layout.size() != 0);

        //Safety: the layout is non zero sized.
        let ptr = unsafe { alloc::alloc(layout) };
        match NonNull::new(ptr) {
            Some(ptr) => Ok(ptr),
            None => {
                #[cfg(feature = "logging")]
                log::error!(
                    "system allocation of {}b (align {}) failed",
                    layout.size(),
                    layout.align()
                );
                Err(MemoryError::OutOfMemory {
                    size: layout.size(),
                    align: layout.align(),
                })
            }
        }
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { alloc::dealloc(ptr.as_ptr(), layout) }
    }
}

static SYSTEM: SystemBackend = SystemBackend;

///The default backend used whenever no backend is injected explicitly.
pub fn system() -> &'static SystemBackend {
    &SYSTEM
}
