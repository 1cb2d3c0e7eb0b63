//! ## Control block
//!
//! Every [Shared](crate::Shared) payload is tracked by a control block that
//! carries the strong and weak counts. Instead of spending a second heap
//! allocation on it, the block is *co-allocated*: one region holds both the
//! block and the payload, with whichever of the two has the stricter
//! alignment sitting at the front and the other following at a padded offset.
//! That saves an allocation per shared object and keeps the counts on the
//! same cache lines as small payloads.
//!
//! The payload dies the moment the last strong reference goes away. The
//! region itself stays alive until the weak count also drops to zero, so
//! outstanding [Weak](crate::Weak) references always have a valid block to
//! look at.

use crate::backend::MemoryBackend;
use crate::error::MemoryError;
use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

///Soft limit on the number of references to one control block. Running past
/// it aborts, a wrapped count would free live objects.
pub(crate) const MAX_REFCOUNT: u32 = i32::MAX as u32;

///Shared bookkeeping for one co-allocated payload.
///
/// The block must never be moved or copied, all parties reference it through
/// the pointer handed out at allocation time.
#[repr(C)]
pub struct ControlBlock {
    ///Payload address. Null once the payload has been destroyed.
    pub(crate) raw: AtomicPtr<u8>,
    ///Strong owners. The payload lives exactly as long as this is non-zero.
    pub(crate) strong: AtomicU32,
    ///Weak owners, plus one slot held collectively by all strong owners.
    pub(crate) weak: AtomicU32,
    ///Start of the allocation, the block itself usually sits somewhere inside.
    base: *mut u8,
    ///Size and alignment the allocation was made with.
    layout: Layout,
    ///Whoever produced the allocation also has to take it back.
    backend: &'static dyn MemoryBackend,
}

///Placement of a control block and its payload inside a single region.
pub(crate) struct BlockLayout {
    pub(crate) layout: Layout,
    pub(crate) ctrl_offset: usize,
    pub(crate) payload_offset: usize,
}

impl BlockLayout {
    ///Computes the packed placement for a payload of `payload` layout.
    ///
    /// The region is aligned to the stricter of the two alignments. If the
    /// control block is the stricter one it leads and the payload follows at
    /// the next offset aligned for it, otherwise the payload leads and the
    /// block trails.
    pub(crate) fn for_payload(payload: Layout) -> Result<BlockLayout, MemoryError> {
        let ctrl = Layout::new::<ControlBlock>();
        let align = ctrl.align().max(payload.align());

        let (ctrl_offset, payload_offset) = if ctrl.align() > payload.align() {
            let payload_offset = ctrl
                .size()
                .checked_next_multiple_of(payload.align())
                .ok_or(MemoryError::LayoutOverflow)?;
            (0, payload_offset)
        } else {
            let ctrl_offset = payload
                .size()
                .checked_next_multiple_of(ctrl.align())
                .ok_or(MemoryError::LayoutOverflow)?;
            (ctrl_offset, 0)
        };

        let size = ctrl_offset
            .checked_add(ctrl.size())
            .and_then(|c| payload_offset.checked_add(payload.size()).map(|p| c.max(p)))
            .ok_or(MemoryError::LayoutOverflow)?;
        let layout = Layout::from_size_align(size, align).map_err(|_| MemoryError::LayoutOverflow)?;

        Ok(BlockLayout {
            layout,
            ctrl_offset,
            payload_offset,
        })
    }
}

impl ControlBlock {
    ///Allocates one region holding a fresh control block plus *uninitialized*
    /// storage for a `T`, and returns both pointers.
    ///
    /// Counts start at one strong and one weak (the slot the strong owners
    /// share). The payload storage must be initialized before the block is
    /// handed to anyone else, [allocate_with](ControlBlock::allocate_with)
    /// does that in one go.
    ///
    /// On allocation failure nothing is left behind.
    pub(crate) fn allocate_uninit<T>(
        backend: &'static dyn MemoryBackend,
    ) -> Result<(NonNull<ControlBlock>, NonNull<T>), MemoryError> {
        let spot = BlockLayout::for_payload(Layout::new::<T>())?;
        let base = backend.allocate(spot.layout)?;

        #[cfg(feature = "logging")]
        log::trace!(
            "co-allocated {}b (align {}) for a shared payload",
            spot.layout.size(),
            spot.layout.align()
        );

        //Safety: both offsets are inside the fresh region and aligned for
        //what they hold, see BlockLayout::for_payload.
        unsafe {
            let ctrl = base.as_ptr().add(spot.ctrl_offset).cast::<ControlBlock>();
            let payload = base.as_ptr().add(spot.payload_offset).cast::<T>();
            ctrl.write(ControlBlock {
                raw: AtomicPtr::new(payload.cast::<u8>()),
                strong: AtomicU32::new(1),
                weak: AtomicU32::new(1),
                base: base.as_ptr(),
                layout: spot.layout,
                backend,
            });

            Ok((NonNull::new_unchecked(ctrl), NonNull::new_unchecked(payload)))
        }
    }

    ///Allocates and initializes in one step, so no observer can ever see the
    /// block with an uninitialized payload.
    pub(crate) fn allocate_with<T>(
        backend: &'static dyn MemoryBackend,
        value: T,
    ) -> Result<(NonNull<ControlBlock>, NonNull<T>), MemoryError> {
        let (ctrl, payload) = Self::allocate_uninit::<T>(backend)?;
        //Safety: the storage is ours alone and sized/aligned for T.
        unsafe { payload.as_ptr().write(value) };
        Ok((ctrl, payload))
    }

    ///Hands the whole region back to the backend that produced it.
    ///
    /// # Safety
    ///
    /// Both counts must be zero and the payload must already be destroyed.
    /// `ctrl` is dangling afterwards.
    pub(crate) unsafe fn destroy(ctrl: NonNull<ControlBlock>) {
        let (base, layout, backend) = {
            let block = unsafe { ctrl.as_ref() };
            (block.base, block.layout, block.backend)
        };
        //Nothing in the block itself needs dropping, releasing the region
        //takes the block with it.
        unsafe { backend.deallocate(NonNull::new_unchecked(base), layout) };
    }

    ///True while the payload has not been destroyed yet.
    pub(crate) fn payload_alive(&self) -> bool {
        !self.raw.load(Ordering::Acquire).is_null()
    }
}
