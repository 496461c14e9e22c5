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

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

use crate::error::DriverError;

use super::{
    AccessDescriptor, AllocationProp, DeviceId, DevicePtr, DriverModule, DriverResult, Event,
    HostBuffer, MemoryKind, PhysicalHandle, Stream,
};

const STATUS_INVALID_VALUE: i32 = 1;
const STATUS_NOT_FOUND: i32 = 2;
const STATUS_NOT_MAPPED: i32 = 3;
const STATUS_ALREADY_IN_USE: i32 = 4;

/// In-memory stand-in for the real driver.
///
/// Physical allocations are byte vectors (zero-initialized, like fresh
/// driver pages), address reservations come from a bump allocator with a
/// free list so a freed range can be handed out again, and fills/copies
/// resolve through the mapping table synchronously. Every operation is
/// counted and can be scripted to fail, which is what the crate's tests
/// are built on.
pub struct MockDriverModule {
    granularity: usize,
    state: Mutex<MockState>,
}

#[derive(Default)]
struct MockState {
    next_physical: u64,
    next_address: u64,
    next_event: u64,
    allocations: HashMap<u64, Vec<u8>>,
    reservations: HashMap<u64, usize>,
    free_ranges: Vec<(u64, usize)>,
    mappings: HashMap<u64, (u64, usize)>,
    bindings: HashMap<u64, (u64, usize, usize)>,
    events: HashSet<u64>,
    created: usize,
    released: usize,
    script: HashMap<&'static str, VecDeque<i32>>,
    calls: HashMap<&'static str, usize>,
}

impl MockState {
    /// Counts the call and pops the next scripted outcome for `op`
    /// (status 0 means success).
    fn enter(&mut self, op: &'static str) -> DriverResult<()> {
        *self.calls.entry(op).or_insert(0) += 1;
        if let Some(queue) = self.script.get_mut(op) {
            if let Some(status) = queue.pop_front() {
                if status != 0 {
                    return Err(DriverError { op, status });
                }
            }
        }
        Ok(())
    }

    /// Resolves a device pointer range to (allocation id, offset) through
    /// the mapping table.
    fn resolve(&self, op: &'static str, ptr: DevicePtr, len: usize) -> DriverResult<(u64, usize)> {
        for (&address, &(handle, size)) in &self.mappings {
            if ptr.0 >= address && ptr.0 + len as u64 <= address + size as u64 {
                return Ok((handle, (ptr.0 - address) as usize));
            }
        }
        Err(DriverError {
            op,
            status: STATUS_NOT_MAPPED,
        })
    }

    fn content_mut(&mut self, op: &'static str, handle: u64) -> DriverResult<&mut Vec<u8>> {
        match self.allocations.get_mut(&handle) {
            Some(content) => Ok(content),
            None => Err(DriverError {
                op,
                status: STATUS_NOT_FOUND,
            }),
        }
    }
}

struct MockHostBuffer {
    kind: MemoryKind,
    data: Vec<u8>,
}

impl HostBuffer for MockHostBuffer {
    fn kind(&self) -> MemoryKind {
        self.kind
    }

    fn len(&self) -> usize {
        self.data.len()
    }

    fn bytes(&self) -> &[u8] {
        &self.data
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl MockDriverModule {
    pub fn new() -> Self {
        Self::with_granularity(4096)
    }

    pub fn with_granularity(granularity: usize) -> Self {
        Self {
            granularity,
            state: Mutex::new(MockState {
                next_physical: 1,
                // Arbitrary base so mock device addresses look nothing
                // like host pointers.
                next_address: 0x1_0000_0000,
                next_event: 1,
                ..MockState::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Scripts the next unscripted call of `op` to fail with `status`.
    pub fn push_failure(&self, op: &'static str, status: i32) {
        self.state().script.entry(op).or_default().push_back(status);
    }

    /// Scripts the next unscripted call of `op` to succeed. Useful to let
    /// the k-th call fail: push k-1 successes, then the failure.
    pub fn push_success(&self, op: &'static str) {
        self.state().script.entry(op).or_default().push_back(0);
    }

    pub fn call_count(&self, op: &'static str) -> usize {
        self.state().calls.get(op).copied().unwrap_or(0)
    }

    pub fn create_count(&self) -> usize {
        self.state().created
    }

    pub fn release_count(&self) -> usize {
        self.state().released
    }

    pub fn live_allocations(&self) -> usize {
        self.state().allocations.len()
    }

    pub fn live_reservations(&self) -> usize {
        self.state().reservations.len()
    }

    pub fn live_mappings(&self) -> usize {
        self.state().mappings.len()
    }

    pub fn live_events(&self) -> usize {
        self.state().events.len()
    }

    pub fn is_bound(&self, multicast: PhysicalHandle) -> bool {
        self.state().bindings.contains_key(&multicast.0)
    }

    /// Reads mapped device memory, bypassing the stream model.
    pub fn read_device(&self, ptr: DevicePtr, len: usize) -> DriverResult<Vec<u8>> {
        let state = self.state();
        let (handle, offset) = state.resolve("read_device", ptr, len)?;
        match state.allocations.get(&handle) {
            Some(content) => Ok(content[offset..offset + len].to_vec()),
            None => Err(DriverError {
                op: "read_device",
                status: STATUS_NOT_FOUND,
            }),
        }
    }

    /// Writes mapped device memory, bypassing the stream model.
    pub fn write_device(&self, ptr: DevicePtr, data: &[u8]) -> DriverResult<()> {
        let mut state = self.state();
        let (handle, offset) = state.resolve("write_device", ptr, data.len())?;
        let content = state.content_mut("write_device", handle)?;
        content[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }
}

impl Default for MockDriverModule {
    fn default() -> Self {
        Self::new()
    }
}

impl DriverModule for MockDriverModule {
    fn create_physical(&self, prop: &AllocationProp, size: usize) -> DriverResult<PhysicalHandle> {
        let mut state = self.state();
        state.enter("create_physical")?;
        if size == 0 || prop.kind == MemoryKind::Host {
            return Err(DriverError {
                op: "create_physical",
                status: STATUS_INVALID_VALUE,
            });
        }
        let handle = state.next_physical;
        state.next_physical += 1;
        // Fresh physical pages read as zero, like the driver's.
        state.allocations.insert(handle, vec![0u8; size]);
        state.created += 1;
        Ok(PhysicalHandle(handle))
    }

    fn release_physical(&self, handle: PhysicalHandle) -> DriverResult<()> {
        let mut state = self.state();
        state.enter("release_physical")?;
        if state.allocations.remove(&handle.0).is_none() {
            return Err(DriverError {
                op: "release_physical",
                status: STATUS_NOT_FOUND,
            });
        }
        state.released += 1;
        Ok(())
    }

    fn reserve_address(&self, size: usize, alignment: usize) -> DriverResult<DevicePtr> {
        let mut state = self.state();
        state.enter("reserve_address")?;
        if size == 0 || alignment == 0 {
            return Err(DriverError {
                op: "reserve_address",
                status: STATUS_INVALID_VALUE,
            });
        }
        // Prefer handing out a previously freed range again, so a
        // deallocate/reallocate pair can observe a stable address.
        if let Some(index) = state
            .free_ranges
            .iter()
            .position(|&(address, range)| range == size && address % alignment as u64 == 0)
        {
            let (address, range) = state.free_ranges.swap_remove(index);
            state.reservations.insert(address, range);
            return Ok(DevicePtr(address));
        }
        let alignment = alignment as u64;
        let address = state.next_address.next_multiple_of(alignment);
        state.next_address = address + size as u64;
        state.reservations.insert(address, size);
        Ok(DevicePtr(address))
    }

    fn free_address(&self, ptr: DevicePtr, size: usize) -> DriverResult<()> {
        let mut state = self.state();
        state.enter("free_address")?;
        match state.reservations.get(&ptr.0) {
            Some(&range) if range == size => {
                state.reservations.remove(&ptr.0);
                state.free_ranges.push((ptr.0, size));
                Ok(())
            }
            _ => Err(DriverError {
                op: "free_address",
                status: STATUS_NOT_FOUND,
            }),
        }
    }

    fn map(
        &self,
        ptr: DevicePtr,
        size: usize,
        handle: PhysicalHandle,
        _access: &AccessDescriptor,
    ) -> DriverResult<()> {
        let mut state = self.state();
        state.enter("map")?;
        let reserved = state.reservations.iter().any(|(&address, &range)| {
            ptr.0 >= address && ptr.0 + size as u64 <= address + range as u64
        });
        if !reserved {
            return Err(DriverError {
                op: "map",
                status: STATUS_INVALID_VALUE,
            });
        }
        match state.allocations.get(&handle.0) {
            Some(content) if content.len() >= size => {}
            _ => {
                return Err(DriverError {
                    op: "map",
                    status: STATUS_NOT_FOUND,
                })
            }
        }
        if state.mappings.contains_key(&ptr.0) {
            return Err(DriverError {
                op: "map",
                status: STATUS_ALREADY_IN_USE,
            });
        }
        state.mappings.insert(ptr.0, (handle.0, size));
        Ok(())
    }

    fn unmap(&self, ptr: DevicePtr, size: usize) -> DriverResult<()> {
        let mut state = self.state();
        state.enter("unmap")?;
        match state.mappings.get(&ptr.0) {
            Some(&(_, mapped)) if mapped == size => {
                state.mappings.remove(&ptr.0);
                Ok(())
            }
            _ => Err(DriverError {
                op: "unmap",
                status: STATUS_NOT_MAPPED,
            }),
        }
    }

    fn bind_multicast(
        &self,
        multicast: PhysicalHandle,
        offset: usize,
        handle: PhysicalHandle,
        size: usize,
    ) -> DriverResult<()> {
        let mut state = self.state();
        state.enter("bind_multicast")?;
        if !state.allocations.contains_key(&handle.0) {
            return Err(DriverError {
                op: "bind_multicast",
                status: STATUS_NOT_FOUND,
            });
        }
        if state.bindings.contains_key(&multicast.0) {
            return Err(DriverError {
                op: "bind_multicast",
                status: STATUS_ALREADY_IN_USE,
            });
        }
        state.bindings.insert(multicast.0, (handle.0, offset, size));
        Ok(())
    }

    fn unbind_multicast(
        &self,
        multicast: PhysicalHandle,
        _device: DeviceId,
        size: usize,
    ) -> DriverResult<()> {
        let mut state = self.state();
        state.enter("unbind_multicast")?;
        match state.bindings.get(&multicast.0) {
            Some(&(_, _, bound)) if bound == size => {
                state.bindings.remove(&multicast.0);
                Ok(())
            }
            _ => Err(DriverError {
                op: "unbind_multicast",
                status: STATUS_NOT_FOUND,
            }),
        }
    }

    fn fill_async(
        &self,
        dst: DevicePtr,
        value: u8,
        size: usize,
        _stream: Stream,
    ) -> DriverResult<()> {
        let mut state = self.state();
        state.enter("fill_async")?;
        let (handle, offset) = state.resolve("fill_async", dst, size)?;
        let content = state.content_mut("fill_async", handle)?;
        content[offset..offset + size].fill(value);
        Ok(())
    }

    fn copy_to_host_async(
        &self,
        dst: &mut [u8],
        src: DevicePtr,
        _stream: Stream,
    ) -> DriverResult<()> {
        let mut state = self.state();
        state.enter("copy_to_host_async")?;
        let (handle, offset) = state.resolve("copy_to_host_async", src, dst.len())?;
        match state.allocations.get(&handle) {
            Some(content) => {
                dst.copy_from_slice(&content[offset..offset + dst.len()]);
                Ok(())
            }
            None => Err(DriverError {
                op: "copy_to_host_async",
                status: STATUS_NOT_FOUND,
            }),
        }
    }

    fn copy_to_device_async(
        &self,
        dst: DevicePtr,
        src: &[u8],
        _stream: Stream,
    ) -> DriverResult<()> {
        let mut state = self.state();
        state.enter("copy_to_device_async")?;
        let (handle, offset) = state.resolve("copy_to_device_async", dst, src.len())?;
        let content = state.content_mut("copy_to_device_async", handle)?;
        content[offset..offset + src.len()].copy_from_slice(src);
        Ok(())
    }

    fn alloc_host(&self, kind: MemoryKind, size: usize) -> DriverResult<Box<dyn HostBuffer>> {
        let mut state = self.state();
        state.enter("alloc_host")?;
        if kind == MemoryKind::Device {
            return Err(DriverError {
                op: "alloc_host",
                status: STATUS_INVALID_VALUE,
            });
        }
        Ok(Box::new(MockHostBuffer {
            kind,
            data: vec![0u8; size],
        }))
    }

    fn create_event(&self) -> DriverResult<Event> {
        let mut state = self.state();
        state.enter("create_event")?;
        let event = state.next_event;
        state.next_event += 1;
        state.events.insert(event);
        Ok(Event(event))
    }

    fn record_event(&self, event: Event, _stream: Stream) -> DriverResult<()> {
        let mut state = self.state();
        state.enter("record_event")?;
        if !state.events.contains(&event.0) {
            return Err(DriverError {
                op: "record_event",
                status: STATUS_NOT_FOUND,
            });
        }
        Ok(())
    }

    fn wait_event(&self, _stream: Stream, event: Event) -> DriverResult<()> {
        let mut state = self.state();
        state.enter("wait_event")?;
        if !state.events.contains(&event.0) {
            return Err(DriverError {
                op: "wait_event",
                status: STATUS_NOT_FOUND,
            });
        }
        Ok(())
    }

    fn destroy_event(&self, event: Event) -> DriverResult<()> {
        let mut state = self.state();
        state.enter("destroy_event")?;
        if !state.events.remove(&event.0) {
            return Err(DriverError {
                op: "destroy_event",
                status: STATUS_NOT_FOUND,
            });
        }
        Ok(())
    }

    fn allocation_granularity(&self) -> DriverResult<usize> {
        Ok(self.granularity)
    }
}
