use thiserror::Error;

use crate::virtual_memory::Status;

/// A failed call into the driver capability surface.
///
/// `status` is the raw status code reported by the driver for the
/// operation named by `op`.
#[derive(Debug, Error)]
#[error("driver call {op} failed with status {status}")]
pub struct DriverError {
    pub op: &'static str,
    pub status: i32,
}

#[derive(Debug, Error)]
pub enum VirtualMemoryError {
    #[error(transparent)]
    Driver(#[from] DriverError),

    /// The operation was called while the memory is in a status it is not
    /// defined for, e.g. `materialize` on a non-released memory.
    #[error("operation requires status {expected:?}, but the memory is {actual:?}")]
    InvalidStatus { expected: Status, actual: Status },

    /// `add` was called with an id that is already registered.
    #[error("id {0:#x} is already registered")]
    DuplicateId(u64),

    /// The id does not reference a registered memory.
    #[error("id {0:#x} is not registered")]
    UnknownId(u64),

    #[error("pop on an empty allocator stack")]
    EmptyAllocatorStack,
}

pub type Result<T> = core::result::Result<T, VirtualMemoryError>;
