use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    #[error("allocation of {size} bytes (align {align}) failed")]
    OutOfMemory { size: usize, align: usize },
    #[error("combined control block and payload layout exceeds the address space")]
    LayoutOverflow,
    #[error("handle does not own an object anymore")]
    ReleasedHandle,
}
