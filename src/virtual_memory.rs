//! The release/rematerialize handle for one piece of GPU memory.
//!
//! A [`VirtualMemory`] owns one physical allocation handle, the
//! [`Creator`] that obtains it and an ordered list of [`Configurator`]s
//! that wire it into usable memory (mapping, multicast binding,
//! zero-fill, backup/restore). `materialize` builds everything up in
//! order, `release` tears it down again in reverse while the logical
//! reservation (address, binding, backed-up content) survives in the
//! strategy objects for the next cycle.

use log::{error, warn};

use crate::error::{Result, VirtualMemoryError};
use crate::modules::driver::PhysicalHandle;

/// Obtains and destroys the physical allocation handle, either by
/// creating one locally or importing one.
pub trait Creator: Send {
    /// Must not leak resources when failing.
    fn create(&mut self) -> Result<PhysicalHandle>;

    /// Called exactly once for every successful `create`.
    fn release(&mut self, handle: PhysicalHandle) -> Result<()>;
}

/// Wires a physical allocation into usable memory.
pub trait Configurator: Send {
    /// Must not leak resources when failing.
    fn setup(&mut self, handle: PhysicalHandle) -> Result<()>;

    /// Only called if the matching `setup` succeeded, in reverse setup
    /// order.
    fn teardown(&mut self, handle: PhysicalHandle) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Status {
    /// Default constructed, no creator bound. Unusable.
    #[default]
    Invalid,
    /// The memory is not physically allocated.
    Released,
    /// The memory is allocated and fully configured.
    Materialized,
    /// A `materialize` failed partway. The memory cannot be used, but
    /// still holds resources: it requires an explicit `release`.
    Errored,
}

/// Handle to a piece of GPU memory whose physical backing can be dropped
/// and later rematerialized.
#[derive(Default)]
pub struct VirtualMemory {
    status: Status,
    handle: PhysicalHandle,
    /// Number of configurators whose setup succeeded.
    configured: usize,
    creator: Option<Box<dyn Creator>>,
    configurators: Vec<Box<dyn Configurator>>,
}

impl VirtualMemory {
    /// Binds a creator and an ordered configurator list. The memory
    /// starts out `Released`.
    pub fn new(creator: Box<dyn Creator>, configurators: Vec<Box<dyn Configurator>>) -> Self {
        Self {
            status: Status::Released,
            handle: PhysicalHandle::NULL,
            configured: 0,
            creator: Some(creator),
            configurators,
        }
    }

    pub fn status(&self) -> Status {
        self.status
    }

    /// Allocates the physical backing and runs every configurator setup
    /// in list order. Valid only when `Released`.
    ///
    /// Stops at the first failure and propagates it. A failed `create`
    /// leaves the memory `Released`; a failed setup leaves it `Errored`
    /// with the physical allocation live, and the caller must still call
    /// [`release`](Self::release) to unwind.
    pub fn materialize(&mut self) -> Result<()> {
        if self.status != Status::Released {
            return Err(VirtualMemoryError::InvalidStatus {
                expected: Status::Released,
                actual: self.status,
            });
        }
        let Some(creator) = self.creator.as_mut() else {
            return Err(VirtualMemoryError::InvalidStatus {
                expected: Status::Released,
                actual: Status::Invalid,
            });
        };

        self.handle = creator.create()?;
        while self.configured < self.configurators.len() {
            if let Err(failure) = self.configurators[self.configured].setup(self.handle) {
                self.status = Status::Errored;
                return Err(failure);
            }
            self.configured += 1;
        }
        self.status = Status::Materialized;
        Ok(())
    }

    /// Tears down every configurator whose setup succeeded, strictly in
    /// reverse order, then destroys the physical allocation.
    ///
    /// Never stops early: every teardown is attempted even when earlier
    /// ones fail, because leaking physical memory is worse than losing a
    /// secondary error. Only the last failure is propagated, the others
    /// are logged. The memory always ends up `Released`.
    ///
    /// Releasing an already `Released` memory is a no-op.
    pub fn release(&mut self) -> Result<()> {
        match self.status {
            Status::Materialized | Status::Errored => {}
            Status::Released => return Ok(()),
            Status::Invalid => {
                return Err(VirtualMemoryError::InvalidStatus {
                    expected: Status::Materialized,
                    actual: Status::Invalid,
                })
            }
        }
        let Some(creator) = self.creator.as_mut() else {
            return Err(VirtualMemoryError::InvalidStatus {
                expected: Status::Materialized,
                actual: Status::Invalid,
            });
        };

        let mut last_failure: Option<VirtualMemoryError> = None;
        for configurator in self.configurators[..self.configured].iter_mut().rev() {
            if let Err(failure) = configurator.teardown(self.handle) {
                if let Some(superseded) = last_failure.replace(failure) {
                    warn!("teardown failure superseded by a later one: {superseded}");
                }
            }
        }
        if !self.handle.is_null() {
            if let Err(failure) = creator.release(self.handle) {
                if let Some(superseded) = last_failure.replace(failure) {
                    warn!("teardown failure superseded by a later one: {superseded}");
                }
            }
        }

        self.handle = PhysicalHandle::NULL;
        self.configured = 0;
        self.status = Status::Released;
        match last_failure {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }

    /// Consistency check: derives the status from the success counter and
    /// handle the way the tag is supposed to track them.
    #[cfg(test)]
    pub(crate) fn derived_status(&self) -> Status {
        if self.creator.is_none() {
            Status::Invalid
        } else if self.configured == 0 && self.handle.is_null() {
            Status::Released
        } else if self.configured == self.configurators.len() && !self.handle.is_null() {
            Status::Materialized
        } else {
            Status::Errored
        }
    }
}

impl Drop for VirtualMemory {
    fn drop(&mut self) {
        // A live handle means materialize succeeded (or failed partway)
        // and nobody released since.
        if !self.handle.is_null() {
            if let Err(failure) = self.release() {
                error!("implicit release while dropping virtual memory failed: {failure}");
            }
        }
    }
}
