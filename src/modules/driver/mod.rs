/*
 *  Copyright (C) 2025  Markus Elias Gerber
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU General Public License for more details.
 *
 *  You should have received a copy of the GNU General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! The driver capability surface consumed by this crate.
//!
//! Everything the core needs from the GPU driver is expressed through the
//! [`DriverModule`] trait: physical allocations, virtual address ranges,
//! fixed-address mapping, multicast binding, stream-ordered fills and
//! copies, host staging buffers and ordering events. The crate only
//! consumes this surface, it never defines driver behavior.

mod mock;

pub use mock::MockDriverModule;

use crate::error::DriverError;

pub type DriverResult<T> = Result<T, DriverError>;

/// Opaque reference to a block of physical device or pinned-host memory,
/// independent of any virtual-address mapping. The zero value is reserved
/// as "no allocation".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PhysicalHandle(pub u64);

impl PhysicalHandle {
    pub const NULL: PhysicalHandle = PhysicalHandle(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// A device virtual address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DevicePtr(pub u64);

impl DevicePtr {
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Opaque ordering stream. Fills, copies and event operations are ordered
/// with respect to other work on the same stream; the crate itself never
/// waits for stream completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Stream(pub u64);

/// Opaque ordering token recorded into and waited on through a [`Stream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Event(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DeviceId(pub i32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    Device,
    PinnedHost,
    Host,
}

/// Placement properties for a physical allocation.
#[derive(Debug, Clone, Copy)]
pub struct AllocationProp {
    pub kind: MemoryKind,
    pub device: DeviceId,
}

/// Access rights applied when mapping an allocation at a virtual address.
#[derive(Debug, Clone, Copy)]
pub struct AccessDescriptor {
    pub device: DeviceId,
    pub writable: bool,
}

/// Host or pinned-host byte storage owned by the driver layer, used as
/// staging space for backup/restore.
pub trait HostBuffer: Send {
    fn kind(&self) -> MemoryKind;

    fn len(&self) -> usize;

    fn bytes(&self) -> &[u8];

    fn bytes_mut(&mut self) -> &mut [u8];
}

pub trait DriverModule: Send + Sync {
    /// Creates a physical allocation of `size` bytes placed per `prop`.
    ///
    /// Must not leak the allocation when failing.
    fn create_physical(&self, prop: &AllocationProp, size: usize) -> DriverResult<PhysicalHandle>;

    /// Destroys a physical allocation. Must be called exactly once per
    /// successful `create_physical`.
    fn release_physical(&self, handle: PhysicalHandle) -> DriverResult<()>;

    /// Reserves a virtual address range of `size` bytes aligned to
    /// `alignment`. The reservation is stable until `free_address`.
    fn reserve_address(&self, size: usize, alignment: usize) -> DriverResult<DevicePtr>;

    /// Returns a reserved range. `ptr` and `size` must match the
    /// reservation exactly.
    fn free_address(&self, ptr: DevicePtr, size: usize) -> DriverResult<()>;

    /// Maps `handle` at the fixed address `ptr` with the given access
    /// rights. The range must lie within a reservation.
    fn map(
        &self,
        ptr: DevicePtr,
        size: usize,
        handle: PhysicalHandle,
        access: &AccessDescriptor,
    ) -> DriverResult<()>;

    /// Unmaps the exact range previously mapped at `ptr`.
    fn unmap(&self, ptr: DevicePtr, size: usize) -> DriverResult<()>;

    /// Binds `handle` into the multicast object at the given offset.
    fn bind_multicast(
        &self,
        multicast: PhysicalHandle,
        offset: usize,
        handle: PhysicalHandle,
        size: usize,
    ) -> DriverResult<()>;

    /// Reverts a `bind_multicast` for `device`.
    fn unbind_multicast(
        &self,
        multicast: PhysicalHandle,
        device: DeviceId,
        size: usize,
    ) -> DriverResult<()>;

    /// Fills `[dst, dst+size)` with `value`, ordered on `stream`.
    fn fill_async(&self, dst: DevicePtr, value: u8, size: usize, stream: Stream)
        -> DriverResult<()>;

    /// Copies `dst.len()` bytes from device memory at `src` into `dst`,
    /// ordered on `stream`.
    fn copy_to_host_async(&self, dst: &mut [u8], src: DevicePtr, stream: Stream)
        -> DriverResult<()>;

    /// Copies `src` into device memory at `dst`, ordered on `stream`.
    fn copy_to_device_async(&self, dst: DevicePtr, src: &[u8], stream: Stream)
        -> DriverResult<()>;

    /// Allocates a host (`MemoryKind::Host`) or pinned-host
    /// (`MemoryKind::PinnedHost`) staging buffer of `size` bytes.
    fn alloc_host(&self, kind: MemoryKind, size: usize) -> DriverResult<Box<dyn HostBuffer>>;

    fn create_event(&self) -> DriverResult<Event>;

    fn record_event(&self, event: Event, stream: Stream) -> DriverResult<()>;

    /// Makes later work on `stream` wait until `event` completes.
    fn wait_event(&self, stream: Stream, event: Event) -> DriverResult<()>;

    fn destroy_event(&self, event: Event) -> DriverResult<()>;

    /// The minimum size and alignment granularity for physical
    /// allocations and address reservations.
    fn allocation_granularity(&self) -> DriverResult<usize>;
}
