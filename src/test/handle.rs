use super::{get_test_driver, get_test_memory, no_extra, TEST_SIZE};
use crate::modules::driver::{DeviceId, PhysicalHandle};
use crate::{MulticastConfigurator, Status, VirtualMemory, VirtualMemoryError};

#[test]
fn test_materialize_release_round_trip() {
    let driver = get_test_driver();
    let (mut memory, address) = get_test_memory(&driver, TEST_SIZE, no_extra);

    assert_eq!(memory.status(), Status::Released);
    assert_eq!(memory.derived_status(), Status::Released);

    memory.materialize().unwrap();
    assert_eq!(memory.status(), Status::Materialized);
    assert_eq!(memory.derived_status(), Status::Materialized);
    assert_eq!(driver.live_allocations(), 1);
    assert_eq!(driver.live_mappings(), 1);
    driver.write_device(address, &[42u8; 16]).unwrap();

    memory.release().unwrap();
    assert_eq!(memory.status(), Status::Released);
    assert_eq!(memory.derived_status(), Status::Released);
    assert_eq!(driver.live_allocations(), 0);
    assert_eq!(driver.live_mappings(), 0);
    assert_eq!(driver.create_count(), driver.release_count());
}

#[test]
fn test_repeated_cycles_use_stable_address() {
    let driver = get_test_driver();
    let (mut memory, address) = get_test_memory(&driver, TEST_SIZE, no_extra);

    for _ in 0..5 {
        memory.materialize().unwrap();
        // The mapping is live at the exact same reserved address, and a
        // fresh physical allocation reads as zero.
        assert_eq!(driver.read_device(address, 64).unwrap(), vec![0u8; 64]);
        driver.write_device(address, &[7u8; 64]).unwrap();
        memory.release().unwrap();
    }
    assert_eq!(driver.create_count(), 5);
    assert_eq!(driver.release_count(), 5);
}

#[test]
fn test_failed_create_stays_released() {
    let driver = get_test_driver();
    let (mut memory, _) = get_test_memory(&driver, TEST_SIZE, no_extra);
    driver.push_failure("create_physical", 2);

    assert!(matches!(
        memory.materialize(),
        Err(VirtualMemoryError::Driver(_))
    ));
    // Nothing was allocated, so the memory is still usable as Released.
    assert_eq!(memory.status(), Status::Released);
    assert_eq!(memory.derived_status(), Status::Released);
    assert_eq!(driver.live_allocations(), 0);

    memory.materialize().unwrap();
    assert_eq!(memory.status(), Status::Materialized);
    memory.release().unwrap();
}

#[test]
fn test_failed_setup_requires_explicit_release() {
    let driver = get_test_driver();
    let (mut memory, _) = get_test_memory(&driver, TEST_SIZE, no_extra);
    driver.push_failure("map", 100);

    assert!(memory.materialize().is_err());
    // The physical allocation is still live and must be unwound.
    assert_eq!(memory.status(), Status::Errored);
    assert_eq!(memory.derived_status(), Status::Errored);
    assert_eq!(driver.live_allocations(), 1);

    memory.release().unwrap();
    assert_eq!(memory.status(), Status::Released);
    assert_eq!(driver.live_allocations(), 0);

    // The cycle works again afterwards.
    memory.materialize().unwrap();
    memory.release().unwrap();
}

#[test]
fn test_partial_setup_only_tears_down_successful_prefix() {
    let driver = get_test_driver();
    let multicast = PhysicalHandle(424242);
    let (mut memory, _) = get_test_memory(&driver, TEST_SIZE, |dyn_driver, _| {
        vec![Box::new(MulticastConfigurator::new(
            dyn_driver,
            multicast,
            DeviceId(0),
            0,
            TEST_SIZE,
        ))]
    });
    driver.push_failure("bind_multicast", 100);

    assert!(memory.materialize().is_err());
    assert_eq!(memory.status(), Status::Errored);

    memory.release().unwrap();
    // The failed configurator's teardown must not have run.
    assert_eq!(driver.call_count("unbind_multicast"), 0);
    assert_eq!(driver.call_count("unmap"), 1);
    assert_eq!(driver.create_count(), driver.release_count());
}

#[test]
fn test_release_attempts_every_teardown_and_raises_the_last() {
    let driver = get_test_driver();
    let multicast = PhysicalHandle(99);
    let (mut memory, _) = get_test_memory(&driver, TEST_SIZE, |dyn_driver, _| {
        vec![Box::new(MulticastConfigurator::new(
            dyn_driver,
            multicast,
            DeviceId(0),
            0,
            TEST_SIZE,
        ))]
    });
    memory.materialize().unwrap();

    // Teardown order is reversed: unbind first, then unmap. Both fail;
    // the unmap failure is the last one and must be the one raised.
    driver.push_failure("unbind_multicast", 701);
    driver.push_failure("unmap", 702);

    let failure = memory.release().unwrap_err();
    match failure {
        VirtualMemoryError::Driver(driver_failure) => {
            assert_eq!(driver_failure.op, "unmap");
            assert_eq!(driver_failure.status, 702);
        }
        other => panic!("unexpected failure: {other:?}"),
    }

    // The creator release ran regardless, and the memory ends Released.
    assert_eq!(driver.release_count(), 1);
    assert_eq!(memory.status(), Status::Released);
    assert_eq!(memory.derived_status(), Status::Released);
}

#[test]
fn test_release_on_released_is_noop() {
    let driver = get_test_driver();
    let (mut memory, _) = get_test_memory(&driver, TEST_SIZE, no_extra);

    memory.release().unwrap();
    memory.materialize().unwrap();
    memory.release().unwrap();
    memory.release().unwrap();
    assert_eq!(driver.release_count(), 1);
}

#[test]
fn test_materialize_on_materialized_is_contract_violation() {
    let driver = get_test_driver();
    let (mut memory, _) = get_test_memory(&driver, TEST_SIZE, no_extra);
    memory.materialize().unwrap();

    assert!(matches!(
        memory.materialize(),
        Err(VirtualMemoryError::InvalidStatus {
            expected: Status::Released,
            actual: Status::Materialized,
        })
    ));

    memory.release().unwrap();
}

#[test]
fn test_default_memory_is_invalid() {
    let mut memory = VirtualMemory::default();
    assert_eq!(memory.status(), Status::Invalid);
    assert_eq!(memory.derived_status(), Status::Invalid);
    assert!(matches!(
        memory.materialize(),
        Err(VirtualMemoryError::InvalidStatus { .. })
    ));
    assert!(matches!(
        memory.release(),
        Err(VirtualMemoryError::InvalidStatus { .. })
    ));
}

#[test]
fn test_drop_releases_implicitly() {
    let driver = get_test_driver();
    let (mut memory, _) = get_test_memory(&driver, TEST_SIZE, no_extra);
    memory.materialize().unwrap();
    drop(memory);

    assert_eq!(driver.live_allocations(), 0);
    assert_eq!(driver.live_mappings(), 0);
    assert_eq!(driver.create_count(), driver.release_count());
}

#[test]
fn test_drop_contains_release_failures() {
    let driver = get_test_driver();
    let (mut memory, _) = get_test_memory(&driver, TEST_SIZE, no_extra);
    memory.materialize().unwrap();

    driver.push_failure("unmap", 703);
    // Must not panic; the creator release still runs.
    drop(memory);
    assert_eq!(driver.release_count(), 1);
}
