use std::sync::Arc;

use crate::modules::driver::{
    AccessDescriptor, AllocationProp, DeviceId, DevicePtr, DriverModule, MemoryKind,
    MockDriverModule,
};
use crate::{Configurator, FixedAddressConfigurator, LocalCreator, VirtualMemory};

mod allocator;
mod handle;

pub(crate) const TEST_SIZE: usize = 8192;

pub(crate) fn get_test_driver() -> Arc<MockDriverModule> {
    let _ = env_logger::builder().is_test(true).try_init();
    Arc::new(MockDriverModule::new())
}

/// Reserves an address range and builds a memory that maps a fresh local
/// allocation there, with `extra` configurators appended after the
/// mapping one. Returns the memory (still `Released`) and its address.
pub(crate) fn get_test_memory(
    driver: &Arc<MockDriverModule>,
    size: usize,
    extra: impl FnOnce(Arc<dyn DriverModule>, DevicePtr) -> Vec<Box<dyn Configurator>>,
) -> (VirtualMemory, DevicePtr) {
    let dyn_driver: Arc<dyn DriverModule> = driver.clone();
    let address = driver.reserve_address(size, 4096).unwrap();
    let creator = Box::new(LocalCreator::new(
        dyn_driver.clone(),
        AllocationProp {
            kind: MemoryKind::Device,
            device: DeviceId(0),
        },
        size,
        None,
    ));
    let mut configurators: Vec<Box<dyn Configurator>> = vec![Box::new(
        FixedAddressConfigurator::new(
            dyn_driver.clone(),
            address,
            size,
            AccessDescriptor {
                device: DeviceId(0),
                writable: true,
            },
        ),
    )];
    configurators.extend(extra(dyn_driver, address));
    (VirtualMemory::new(creator, configurators), address)
}

pub(crate) fn no_extra(
    _driver: Arc<dyn DriverModule>,
    _address: DevicePtr,
) -> Vec<Box<dyn Configurator>> {
    Vec::new()
}
