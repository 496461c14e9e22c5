mod allocator;
mod configurators;
mod creators;
mod error;
mod manager;
mod memory_counters;
mod virtual_memory;

pub mod modules;

#[cfg(test)]
mod test;

pub use crate::allocator::{
    AllocatorConfig, AllocatorScope, AllocatorStack, BackingMode, VirtualAddressAllocator,
};
pub use crate::configurators::{
    BackedConfigurator, FixedAddressConfigurator, MemsetConfigurator, MulticastConfigurator,
};
pub use crate::creators::LocalCreator;
pub use crate::error::{DriverError, Result, VirtualMemoryError};
pub use crate::manager::{
    materialize_with_marks, release_with_marks, BatchError, BatchResult, VirtualMemoryManager,
};
pub use crate::memory_counters::MemoryCounters;
pub use crate::virtual_memory::{Configurator, Creator, Status, VirtualMemory};

use static_assertions::assert_impl_all;

assert_impl_all!(VirtualMemoryManager: Send, Sync);
assert_impl_all!(AllocatorConfig: Send, Sync);
assert_impl_all!(AllocatorStack: Send, Sync);
assert_impl_all!(VirtualMemory: Send);
