use std::sync::Arc;

use crate::error::Result;
use crate::memory_counters::MemoryCounters;
use crate::modules::driver::{AllocationProp, DriverModule, PhysicalHandle};
use crate::virtual_memory::Creator;

/// Creates the physical allocation locally, sized and placed per a
/// property descriptor.
///
/// When counters are supplied, every create/release pair is reported as a
/// byte delta keyed by the memory kind. Pass `None` for imported or
/// aliased allocations that are already accounted elsewhere.
pub struct LocalCreator {
    driver: Arc<dyn DriverModule>,
    prop: AllocationProp,
    size: usize,
    counters: Option<Arc<MemoryCounters>>,
}

impl LocalCreator {
    pub fn new(
        driver: Arc<dyn DriverModule>,
        prop: AllocationProp,
        size: usize,
        counters: Option<Arc<MemoryCounters>>,
    ) -> Self {
        Self {
            driver,
            prop,
            size,
            counters,
        }
    }
}

impl Creator for LocalCreator {
    fn create(&mut self) -> Result<PhysicalHandle> {
        let handle = self.driver.create_physical(&self.prop, self.size)?;
        if let Some(counters) = &self.counters {
            counters.allocate(self.prop.kind, self.size);
        }
        Ok(handle)
    }

    fn release(&mut self, handle: PhysicalHandle) -> Result<()> {
        self.driver.release_physical(handle)?;
        if let Some(counters) = &self.counters {
            counters.deallocate(self.prop.kind, self.size);
        }
        Ok(())
    }
}
