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

use std::sync::Arc;

use log::warn;

use crate::error::Result;
use crate::modules::driver::{
    AccessDescriptor, DeviceId, DevicePtr, DriverModule, Event, HostBuffer, MemoryKind,
    PhysicalHandle, Stream,
};
use crate::virtual_memory::Configurator;

/// Maps the allocation at a pre-reserved virtual address with the given
/// access rights; unmaps exactly that range on teardown. The address is
/// stable across any number of release/materialize cycles.
pub struct FixedAddressConfigurator {
    driver: Arc<dyn DriverModule>,
    address: DevicePtr,
    size: usize,
    access: AccessDescriptor,
}

impl FixedAddressConfigurator {
    pub fn new(
        driver: Arc<dyn DriverModule>,
        address: DevicePtr,
        size: usize,
        access: AccessDescriptor,
    ) -> Self {
        Self {
            driver,
            address,
            size,
            access,
        }
    }

    pub fn address(&self) -> DevicePtr {
        self.address
    }
}

impl Configurator for FixedAddressConfigurator {
    fn setup(&mut self, handle: PhysicalHandle) -> Result<()> {
        self.driver.map(self.address, self.size, handle, &self.access)?;
        Ok(())
    }

    fn teardown(&mut self, _handle: PhysicalHandle) -> Result<()> {
        self.driver.unmap(self.address, self.size)?;
        Ok(())
    }
}

/// Binds the allocation into a multicast object at a device/offset.
pub struct MulticastConfigurator {
    driver: Arc<dyn DriverModule>,
    multicast: PhysicalHandle,
    device: DeviceId,
    offset: usize,
    size: usize,
}

impl MulticastConfigurator {
    pub fn new(
        driver: Arc<dyn DriverModule>,
        multicast: PhysicalHandle,
        device: DeviceId,
        offset: usize,
        size: usize,
    ) -> Self {
        Self {
            driver,
            multicast,
            device,
            offset,
            size,
        }
    }
}

impl Configurator for MulticastConfigurator {
    fn setup(&mut self, handle: PhysicalHandle) -> Result<()> {
        self.driver
            .bind_multicast(self.multicast, self.offset, handle, self.size)?;
        Ok(())
    }

    fn teardown(&mut self, _handle: PhysicalHandle) -> Result<()> {
        self.driver
            .unbind_multicast(self.multicast, self.device, self.size)?;
        Ok(())
    }
}

/// Fills the mapped region with a fixed byte on every rematerialize.
///
/// The very first setup of an instance's lifetime is skipped: a fresh
/// physical allocation carries driver-default content anyway. Teardown
/// only flips that first-time flag, there is no device action.
pub struct MemsetConfigurator {
    driver: Arc<dyn DriverModule>,
    address: DevicePtr,
    size: usize,
    value: u8,
    stream: Stream,
    first_time: bool,
}

impl MemsetConfigurator {
    pub fn new(
        driver: Arc<dyn DriverModule>,
        address: DevicePtr,
        size: usize,
        value: u8,
        stream: Stream,
    ) -> Self {
        Self {
            driver,
            address,
            size,
            value,
            stream,
            first_time: true,
        }
    }
}

impl Configurator for MemsetConfigurator {
    fn setup(&mut self, _handle: PhysicalHandle) -> Result<()> {
        if !self.first_time {
            self.driver
                .fill_async(self.address, self.value, self.size, self.stream)?;
        }
        Ok(())
    }

    fn teardown(&mut self, _handle: PhysicalHandle) -> Result<()> {
        self.first_time = false;
        Ok(())
    }
}

/// Backs up the mapped region into an owned staging buffer on teardown
/// and restores it on the following setup.
///
/// The staging buffer (host or pinned host) is allocated lazily on the
/// first teardown and reused across cycles. Completion of the backup copy
/// is recorded via an ordering event which the restore waits on, so the
/// two are sequenced even across streams.
///
/// With `on_demand`, setup leaves the staged content in place instead of
/// restoring it; the following teardown then skips its backup copy so the
/// staged bytes stay authoritative.
pub struct BackedConfigurator {
    driver: Arc<dyn DriverModule>,
    address: DevicePtr,
    size: usize,
    kind: MemoryKind,
    stream: Stream,
    on_demand: bool,
    staging: Option<Box<dyn HostBuffer>>,
    token: Option<Event>,
    /// The staging buffer holds content that has not been restored to the
    /// device yet.
    staged: bool,
}

impl BackedConfigurator {
    pub fn new(
        driver: Arc<dyn DriverModule>,
        address: DevicePtr,
        size: usize,
        kind: MemoryKind,
        stream: Stream,
        on_demand: bool,
    ) -> Self {
        Self {
            driver,
            address,
            size,
            kind,
            stream,
            on_demand,
            staging: None,
            token: None,
            staged: false,
        }
    }
}

impl Configurator for BackedConfigurator {
    fn setup(&mut self, _handle: PhysicalHandle) -> Result<()> {
        if !self.staged || self.on_demand {
            // Nothing backed up yet, or restoration is deferred.
            return Ok(());
        }
        let Some(staging) = self.staging.as_ref() else {
            return Ok(());
        };
        if let Some(token) = self.token {
            self.driver.wait_event(self.stream, token)?;
        }
        self.driver
            .copy_to_device_async(self.address, staging.bytes(), self.stream)?;
        self.staged = false;
        Ok(())
    }

    fn teardown(&mut self, _handle: PhysicalHandle) -> Result<()> {
        if self.staged {
            // The previous backup was never restored; keep it.
            return Ok(());
        }
        let staging = match &mut self.staging {
            Some(buffer) => buffer,
            empty => empty.insert(self.driver.alloc_host(self.kind, self.size)?),
        };
        let token = match self.token {
            Some(token) => token,
            None => {
                let token = self.driver.create_event()?;
                self.token = Some(token);
                token
            }
        };
        self.driver
            .copy_to_host_async(staging.bytes_mut(), self.address, self.stream)?;
        self.driver.record_event(token, self.stream)?;
        self.staged = true;
        Ok(())
    }
}

impl Drop for BackedConfigurator {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            if let Err(failure) = self.driver.destroy_event(token) {
                warn!("destroying backup ordering event failed: {failure}");
            }
        }
    }
}
