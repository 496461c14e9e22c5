use rand::{rngs::SmallRng, RngCore, SeedableRng};
use std::sync::Arc;

use super::get_test_driver;
use crate::modules::driver::{
    DeviceId, DevicePtr, DriverModule, MemoryKind, MockDriverModule, Stream,
};
use crate::{
    AllocatorConfig, AllocatorStack, BackingMode, MemoryCounters, Status, VirtualAddressAllocator,
    VirtualMemoryError, VirtualMemoryManager,
};

const MIB: usize = 1 << 20;

struct TestAllocator {
    driver: Arc<MockDriverModule>,
    manager: Arc<VirtualMemoryManager>,
    counters: Arc<MemoryCounters>,
    config: Arc<AllocatorConfig>,
}

fn get_test_allocator(mark: &str, mode: BackingMode) -> TestAllocator {
    let driver = get_test_driver();
    let dyn_driver: Arc<dyn DriverModule> = driver.clone();
    let manager = Arc::new(VirtualMemoryManager::new());
    let counters = Arc::new(MemoryCounters::new());
    let config = Arc::new(
        AllocatorConfig::new(manager.clone(), dyn_driver, mark, mode, Stream(1))
            .unwrap()
            .with_counters(counters.clone()),
    );
    TestAllocator {
        driver,
        manager,
        counters,
        config,
    }
}

#[test]
fn test_allocate_and_deallocate() {
    let test = get_test_allocator("alloc", BackingMode::None);
    let allocator = VirtualAddressAllocator::new(test.config.clone());

    let address = allocator.allocate(MIB, DeviceId(0)).unwrap();
    assert_eq!(address.0 % test.config.page_size() as u64, 0);
    assert_eq!(test.counters.current(MemoryKind::Device), MIB);
    assert_eq!(test.driver.live_reservations(), 1);
    assert_eq!(test.driver.live_allocations(), 1);

    allocator.deallocate(address, MIB).unwrap();
    assert_eq!(test.counters.current(MemoryKind::Device), 0);
    assert_eq!(test.driver.live_reservations(), 0);
    assert_eq!(test.driver.live_allocations(), 0);
    assert_eq!(test.manager.remove(address.0).status(), Status::Invalid);
}

#[test]
fn test_sizes_are_padded_to_the_page_size() {
    let test = get_test_allocator("pad", BackingMode::None);
    let allocator = VirtualAddressAllocator::new(test.config.clone());
    let page_size = test.config.page_size();

    let address = allocator.allocate(100, DeviceId(0)).unwrap();
    assert_eq!(test.counters.current(MemoryKind::Device), page_size);
    // Deallocate derives the same padded range from the raw size.
    allocator.deallocate(address, 100).unwrap();
    assert_eq!(test.driver.live_reservations(), 0);
}

#[test]
fn test_memset_reallocation_reads_zero() {
    let test = get_test_allocator("scratch", BackingMode::Memset);
    let allocator = VirtualAddressAllocator::new(test.config.clone());

    let first = allocator.allocate(MIB, DeviceId(0)).unwrap();
    test.driver.write_device(first, &[0xEEu8; 4096]).unwrap();
    allocator.deallocate(first, MIB).unwrap();

    // The freed range is reused, and the region reads as zero before
    // any write.
    let second = allocator.allocate(MIB, DeviceId(0)).unwrap();
    assert_eq!(second, first);
    assert_eq!(
        test.driver.read_device(second, 4096).unwrap(),
        vec![0u8; 4096]
    );
    allocator.deallocate(second, MIB).unwrap();
}

#[test]
fn test_release_keeps_reservation_until_deallocate() {
    let test = get_test_allocator("weights", BackingMode::None);
    let allocator = VirtualAddressAllocator::new(test.config.clone());

    let address = allocator.allocate(MIB, DeviceId(0)).unwrap();
    assert_eq!(test.manager.release_with_mark("weights").unwrap(), 1);

    // Physical backing is gone, the reservation is not.
    assert_eq!(test.driver.live_allocations(), 0);
    assert_eq!(test.driver.live_reservations(), 1);
    assert_eq!(test.counters.current(MemoryKind::Device), 0);

    assert_eq!(test.manager.materialize_with_mark("weights").unwrap(), 1);
    assert_eq!(test.driver.live_allocations(), 1);

    allocator.deallocate(address, MIB).unwrap();
    assert_eq!(test.driver.live_reservations(), 0);
}

#[test]
fn test_cpu_backing_survives_release_cycle() {
    let test = get_test_allocator("kv_cache", BackingMode::Cpu);
    let allocator = VirtualAddressAllocator::new(test.config.clone());
    let mut rand = SmallRng::seed_from_u64(4242424242424242);

    let address = allocator.allocate(MIB, DeviceId(0)).unwrap();
    let mut pattern = vec![0u8; MIB];
    rand.fill_bytes(&mut pattern);
    test.driver.write_device(address, &pattern).unwrap();

    assert_eq!(test.manager.release_with_mark("kv_cache").unwrap(), 1);
    assert_eq!(test.manager.materialize_with_mark("kv_cache").unwrap(), 1);
    assert_eq!(test.driver.read_device(address, MIB).unwrap(), pattern);

    allocator.deallocate(address, MIB).unwrap();
}

#[test]
fn test_deallocate_unknown_address_fails_loudly() {
    let test = get_test_allocator("alloc", BackingMode::None);
    let allocator = VirtualAddressAllocator::new(test.config.clone());

    let address = allocator.allocate(MIB, DeviceId(0)).unwrap();
    let bogus = DevicePtr(address.0 + 1);
    assert!(matches!(
        allocator.deallocate(bogus, MIB),
        Err(VirtualMemoryError::UnknownId(_))
    ));
    // The real reservation is untouched.
    assert_eq!(test.driver.live_reservations(), 1);
    allocator.deallocate(address, MIB).unwrap();
}

#[test]
fn test_failed_allocation_unwinds_completely() {
    let test = get_test_allocator("alloc", BackingMode::None);
    let allocator = VirtualAddressAllocator::new(test.config.clone());
    test.driver.push_failure("create_physical", 2);

    assert!(allocator.allocate(MIB, DeviceId(0)).is_err());
    assert_eq!(test.driver.live_reservations(), 0);
    assert_eq!(test.driver.live_allocations(), 0);
    assert_eq!(test.counters.current(MemoryKind::Device), 0);
}

#[test]
fn test_allocator_stack_scopes() {
    let outer = get_test_allocator("outer", BackingMode::None);
    let inner = get_test_allocator("inner", BackingMode::Cpu);
    let stack = AllocatorStack::new();

    assert!(stack.current().is_none());
    let outer_scope = stack.push(outer.config.clone());
    assert_eq!(stack.current().unwrap().config().mark(), "outer");
    {
        let inner_scope = stack.push(inner.config.clone());
        assert_eq!(stack.current().unwrap().config().mark(), "inner");
        assert_eq!(inner_scope.allocator().config().mark(), "inner");
    }
    // Dropping the inner scope restored the outer allocator.
    assert_eq!(stack.current().unwrap().config().mark(), "outer");
    drop(outer_scope);
    assert!(stack.current().is_none());
}

#[test]
fn test_pop_on_empty_stack_is_contract_violation() {
    let stack = AllocatorStack::new();
    assert!(matches!(
        stack.pop(),
        Err(VirtualMemoryError::EmptyAllocatorStack)
    ));
}
