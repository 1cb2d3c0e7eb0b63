//! # Skarn memory
//!
//! Ownership vocabulary for the engine. Everything that outlives a single call
//! gets wrapped in one of four types, depending on who is responsible for
//! destroying it:
//!
//! - [Handle](Handle): exactly one owner. Destruction happens when the handle
//!   goes out of scope (or on [reset](Handle::reset)). Backend resources like
//!   shader modules or windows use this.
//! - [Shared](Shared): atomically reference counted ownership for resources
//!   with more than one (or an ambiguous) owner, cached assets mostly. The
//!   reference counts and the payload live in a *single* allocation.
//! - [Weak](Weak): observes a [Shared](Shared) payload without keeping it
//!   alive. The thread pool and event bus hold these to task state.
//! - [Observer](Observer): a raw, non counted alias. Only for places where
//!   some other owner already guarantees the lifetime.
//!
//! ```
//! use skarn_memory::{Handle, Shared, polymorphic_base};
//!
//! trait Asset {
//!     fn footprint(&self) -> usize;
//! }
//!
//! struct Mesh {
//!     indices: Vec<u32>,
//! }
//! impl Asset for Mesh {
//!     fn footprint(&self) -> usize {
//!         self.indices.len() * 4
//!     }
//! }
//! polymorphic_base!(Mesh => dyn Asset);
//!
//! # fn main() -> Result<(), skarn_memory::MemoryError> {
//! // sole ownership while loading, shared once the cache takes over
//! let mut loading = Handle::new(Mesh { indices: vec![0, 1, 2] })?;
//! let cached = loading.to_shared()?;
//! assert!(!loading.is_valid());
//!
//! let watcher = Shared::downgrade(&cached);
//! let as_asset: Shared<dyn Asset> = Shared::upcast(cached);
//! assert_eq!(as_asset.footprint(), 12);
//!
//! drop(as_asset);
//! assert!(watcher.lock().is_none());
//! # Ok(())
//! # }
//! ```

///Backend abstraction for the process heap. Allows substituting an
/// instrumented allocator, the default is [SystemBackend](backend::SystemBackend).
pub mod backend;

///The control block and the co-allocation scheme that packs it together with
/// its payload into one allocation.
pub mod block;

///Exclusive, move-only ownership. See [Handle](handle::Handle).
pub mod handle;

///Non-owning, non-counted alias pointers. See [Observer](observer::Observer).
pub mod observer;

///Reference counted shared ownership. See [Shared](shared::Shared).
pub mod shared;

///Lifetime observation without ownership. See [Weak](weak::Weak).
pub mod weak;

mod error;
pub use error::MemoryError;

pub use backend::{MemoryBackend, SystemBackend};
pub use block::ControlBlock;
pub use handle::Handle;
pub use observer::Observer;
pub use shared::Shared;
pub use weak::Weak;

///Capability for viewing a concrete payload through an interface type while
/// still destroying it correctly.
///
/// [Shared::upcast](Shared::upcast), [Handle::upcast](Handle::upcast) and
/// [Observer::upcast](Observer::upcast) are bounded on this trait, which makes
/// unsafe conversions (unrelated types, interfaces that could not run the
/// concrete destructor) a compile error instead of a runtime surprise. Trait
/// objects always carry their drop glue, so any plain `Type => dyn Trait`
/// unsizing qualifies. Use [polymorphic_base](crate::polymorphic_base) instead
/// of implementing this by hand.
///
/// # Safety
///
/// `as_base` must be a pure unsizing step: same address, same provenance, and
/// destroying the returned `B` must destroy the full `Self`.
pub unsafe trait PolymorphicBase<B: ?Sized> {
    ///Reinterprets `ptr` as a pointer to the interface type.
    fn as_base(ptr: *mut Self) -> *mut B;
}

///Declares a payload type safely viewable through an interface type.
///
/// ```
/// use skarn_memory::{polymorphic_base, Shared};
///
/// trait Drawable {
///     fn layer(&self) -> i32;
/// }
///
/// struct Sprite(i32);
/// impl Drawable for Sprite {
///     fn layer(&self) -> i32 {
///         self.0
///     }
/// }
/// polymorphic_base!(Sprite => dyn Drawable);
///
/// let sprite = Shared::new(Sprite(7)).unwrap();
/// let drawable: Shared<dyn Drawable> = Shared::upcast(sprite);
/// assert_eq!(drawable.layer(), 7);
/// ```
#[macro_export]
macro_rules! polymorphic_base {
    ($ty:ty => $base:ty) => {
        unsafe impl $crate::PolymorphicBase<$base> for $ty {
            fn as_base(ptr: *mut $ty) -> *mut $base {
                ptr
            }
        }
    };
}
