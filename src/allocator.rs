//! Allocate/deallocate façade over the virtual memory manager.
//!
//! Every allocation reserves a virtual address range, builds a local
//! creator plus the configurator chain selected by the backing mode,
//! materializes the memory and registers it with the shared manager
//! under the shared mark. External reclaim policy then works purely in
//! terms of `release_with_mark`/`materialize_with_mark`; `deallocate`
//! is the only way a reservation goes away for good.

use std::sync::{Arc, Mutex, MutexGuard};

use log::{error, trace, warn};

use crate::configurators::{BackedConfigurator, FixedAddressConfigurator, MemsetConfigurator};
use crate::creators::LocalCreator;
use crate::error::{Result, VirtualMemoryError};
use crate::manager::VirtualMemoryManager;
use crate::memory_counters::MemoryCounters;
use crate::modules::driver::{
    AccessDescriptor, AllocationProp, DeviceId, DevicePtr, DriverModule, MemoryKind, Stream,
};
use crate::virtual_memory::{Configurator, Status};

/// Policy for whether and how a released region's content is preserved
/// across a release/materialize cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackingMode {
    /// Rematerialized memory has uninitialized content.
    None,
    /// Rematerialized memory is zero-filled.
    Memset,
    /// Content is staged in host memory and restored.
    Cpu,
    /// Content is staged in pinned host memory and restored.
    Pinned,
}

/// Immutable configuration shared by every allocator built from it.
pub struct AllocatorConfig {
    manager: Arc<VirtualMemoryManager>,
    driver: Arc<dyn DriverModule>,
    counters: Option<Arc<MemoryCounters>>,
    mark: String,
    mode: BackingMode,
    /// Stream ordering backup and restore copies. Allocation itself is
    /// synchronous and does not use it.
    restore_stream: Stream,
    page_size: usize,
}

impl AllocatorConfig {
    /// The page size defaults to the driver's allocation granularity.
    pub fn new(
        manager: Arc<VirtualMemoryManager>,
        driver: Arc<dyn DriverModule>,
        mark: impl Into<String>,
        mode: BackingMode,
        restore_stream: Stream,
    ) -> Result<Self> {
        let page_size = driver.allocation_granularity()?;
        Ok(Self {
            manager,
            driver,
            counters: None,
            mark: mark.into(),
            mode,
            restore_stream,
            page_size,
        })
    }

    pub fn with_counters(mut self, counters: Arc<MemoryCounters>) -> Self {
        self.counters = Some(counters);
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn mark(&self) -> &str {
        &self.mark
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    fn padded(&self, size: usize) -> usize {
        size.max(1).div_ceil(self.page_size) * self.page_size
    }
}

/// Allocator handing out reservations that can be released and
/// rematerialized through the shared manager.
#[derive(Clone)]
pub struct VirtualAddressAllocator {
    config: Arc<AllocatorConfig>,
}

impl VirtualAddressAllocator {
    pub fn new(config: Arc<AllocatorConfig>) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    /// Reserves an address range of at least `size` bytes (padded to the
    /// page size), materializes physical backing for it on `device` and
    /// registers it under the configured mark. The registry id is the
    /// resulting address.
    pub fn allocate(&self, size: usize, device: DeviceId) -> Result<DevicePtr> {
        let config = &*self.config;
        let padded = config.padded(size);
        let address = config.driver.reserve_address(padded, config.page_size)?;
        trace!(
            "allocating {padded} bytes at {:#x} (mark {:?}, mode {:?})",
            address.0,
            config.mark,
            config.mode
        );

        let creator = Box::new(LocalCreator::new(
            config.driver.clone(),
            AllocationProp {
                kind: MemoryKind::Device,
                device,
            },
            padded,
            config.counters.clone(),
        ));
        let access = AccessDescriptor {
            device,
            writable: true,
        };
        let mut configurators: Vec<Box<dyn Configurator>> = vec![Box::new(
            FixedAddressConfigurator::new(config.driver.clone(), address, padded, access),
        )];
        match config.mode {
            BackingMode::None => {}
            BackingMode::Memset => configurators.push(Box::new(MemsetConfigurator::new(
                config.driver.clone(),
                address,
                padded,
                0,
                config.restore_stream,
            ))),
            BackingMode::Cpu => configurators.push(Box::new(BackedConfigurator::new(
                config.driver.clone(),
                address,
                padded,
                MemoryKind::Host,
                config.restore_stream,
                false,
            ))),
            BackingMode::Pinned => configurators.push(Box::new(BackedConfigurator::new(
                config.driver.clone(),
                address,
                padded,
                MemoryKind::PinnedHost,
                config.restore_stream,
                false,
            ))),
        }

        if let Err(failure) =
            config
                .manager
                .add_materialized(address.0, config.mark.clone(), creator, configurators)
        {
            if let Err(free_failure) = config.driver.free_address(address, padded) {
                warn!("freeing reservation of failed allocation also failed: {free_failure}");
            }
            return Err(failure);
        }
        Ok(address)
    }

    /// Fully tears down the reservation at `address`: removes it from
    /// the manager, releases it and returns the address range.
    ///
    /// Unlike `release_with_mark`, the reservation does not survive. An
    /// address this allocator's manager does not know is a contract
    /// violation and leaves the range untouched.
    pub fn deallocate(&self, address: DevicePtr, size: usize) -> Result<()> {
        let config = &*self.config;
        let padded = config.padded(size);
        let mut memory = config.manager.remove(address.0);
        if memory.status() == Status::Invalid {
            return Err(VirtualMemoryError::UnknownId(address.0));
        }
        trace!("deallocating {padded} bytes at {:#x}", address.0);

        // Unwind completely even when a step fails; surface the last
        // failure and log the rest.
        let mut last_failure = memory.release().err();
        drop(memory);
        if let Err(failure) = config.driver.free_address(address, padded) {
            if let Some(superseded) = last_failure.replace(failure.into()) {
                warn!("release during deallocate failed: {superseded}");
            }
        }
        match last_failure {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }
}

/// Explicit stack of allocator configurations; the top is the ambient
/// allocator for the innermost active scope.
///
/// `push` hands back a guard that pops on drop, so a scope can install a
/// differently marked or backed allocator and is guaranteed to restore
/// the previous one on exit. Popping an empty stack through `pop` is a
/// caller contract violation.
#[derive(Default)]
pub struct AllocatorStack {
    stack: Mutex<Vec<Arc<AllocatorConfig>>>,
}

impl AllocatorStack {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<AllocatorConfig>>> {
        self.stack.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push(&self, config: Arc<AllocatorConfig>) -> AllocatorScope<'_> {
        self.lock().push(config.clone());
        AllocatorScope {
            stack: self,
            config,
        }
    }

    pub fn pop(&self) -> Result<Arc<AllocatorConfig>> {
        self.lock().pop().ok_or(VirtualMemoryError::EmptyAllocatorStack)
    }

    /// The allocator of the innermost scope, if any.
    pub fn current(&self) -> Option<VirtualAddressAllocator> {
        self.lock().last().cloned().map(VirtualAddressAllocator::new)
    }
}

/// Scope guard returned by [`AllocatorStack::push`].
pub struct AllocatorScope<'a> {
    stack: &'a AllocatorStack,
    config: Arc<AllocatorConfig>,
}

impl AllocatorScope<'_> {
    /// The allocator installed by this scope.
    pub fn allocator(&self) -> VirtualAddressAllocator {
        VirtualAddressAllocator::new(self.config.clone())
    }
}

impl Drop for AllocatorScope<'_> {
    fn drop(&mut self) {
        match self.stack.pop() {
            Ok(popped) => {
                if !Arc::ptr_eq(&popped, &self.config) {
                    warn!("allocator stack popped out of order");
                }
            }
            Err(failure) => error!("allocator scope dropped on an empty stack: {failure}"),
        }
    }
}
