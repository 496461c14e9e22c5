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

use std::collections::hash_map::Entry as MapEntry;
use std::collections::HashMap;
use std::mem;
use std::sync::{Mutex, MutexGuard};

use log::{debug, warn};
use thiserror::Error;

use crate::error::{Result, VirtualMemoryError};
use crate::virtual_memory::{Configurator, Creator, Status, VirtualMemory};

/// A batch operation that failed partway.
///
/// `visited` is the number of matching memories that had been visited
/// when the failure struck; for a release batch this is the full match
/// count, since release never stops early.
#[derive(Debug, Error)]
#[error("batch {op} failed after visiting {visited} memories: {source}")]
pub struct BatchError {
    pub op: &'static str,
    pub visited: usize,
    #[source]
    pub source: VirtualMemoryError,
}

pub type BatchResult = std::result::Result<usize, BatchError>;

struct Entry {
    memory: VirtualMemory,
    mark: String,
}

#[derive(Default)]
struct Registry {
    memories: HashMap<u64, Entry>,
    /// Mark to ids, in registration order. Kept mutually consistent with
    /// `memories` inside every critical section.
    marks: HashMap<String, Vec<u64>>,
    bad_handles: Vec<u64>,
}

impl Registry {
    fn detach(&mut self, id: u64) -> Option<VirtualMemory> {
        let entry = self.memories.remove(&id)?;
        if let Some(ids) = self.marks.get_mut(&entry.mark) {
            ids.retain(|&other| other != id);
            if ids.is_empty() {
                self.marks.remove(&entry.mark);
            }
        }
        Some(entry.memory)
    }

    /// Evicts a memory that failed, remembering its id for
    /// `retrieve_bad_handles`. Dropping the memory performs the implicit
    /// release of whatever it still holds, with failures logged.
    fn quarantine(&mut self, id: u64) {
        if let Some(memory) = self.detach(id) {
            debug!("evicting memory {id:#x} after failure (status {:?})", memory.status());
            self.bad_handles.push(id);
            drop(memory);
        }
    }
}

/// Registry of [`VirtualMemory`] objects keyed by a caller-chosen id,
/// each tagged with a mark for batch selection.
///
/// One exclusive lock guards the whole registry; every public operation
/// holds it for its full duration. Batch operations therefore appear
/// atomic to other threads, at the price of blocking unrelated calls
/// while a long batch executes driver work.
#[derive(Default)]
pub struct VirtualMemoryManager {
    registry: Mutex<Registry>,
}

impl VirtualMemoryManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        // A poisoning panic cannot leave the two indices inconsistent:
        // they are only changed together, before any fallible call.
        self.registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers a memory under `id`, tagged with `mark`.
    ///
    /// A duplicate id is a caller contract violation: the registry is
    /// left untouched and the passed memory is dropped, which performs
    /// its implicit release.
    pub fn add(&self, id: u64, mark: impl Into<String>, memory: VirtualMemory) -> Result<()> {
        let mark = mark.into();
        let mut guard = self.lock();
        let registry = &mut *guard;
        match registry.memories.entry(id) {
            MapEntry::Occupied(_) => Err(VirtualMemoryError::DuplicateId(id)),
            MapEntry::Vacant(slot) => {
                slot.insert(Entry {
                    memory,
                    mark: mark.clone(),
                });
                registry.marks.entry(mark).or_default().push(id);
                Ok(())
            }
        }
    }

    /// Builds a memory from the given strategies, materializes it and
    /// registers it under `id`.
    ///
    /// On any failure nothing stays registered and everything already
    /// built up is released again (secondary failures logged).
    pub fn add_materialized(
        &self,
        id: u64,
        mark: impl Into<String>,
        creator: Box<dyn Creator>,
        configurators: Vec<Box<dyn Configurator>>,
    ) -> Result<()> {
        let mut memory = VirtualMemory::new(creator, configurators);
        if let Err(failure) = memory.materialize() {
            if memory.status() == Status::Errored {
                if let Err(release_failure) = memory.release() {
                    warn!("unwinding failed materialize also failed: {release_failure}");
                }
            }
            return Err(failure);
        }
        self.add(id, mark, memory)
    }

    /// Unregisters and returns the memory. An unknown id yields an
    /// `Invalid` memory, not a failure.
    pub fn remove(&self, id: u64) -> VirtualMemory {
        self.lock().detach(id).unwrap_or_default()
    }

    /// Releases every memory currently tagged with `mark`.
    ///
    /// Every match is visited even when some fail; only the last failure
    /// is returned, earlier ones are logged. A memory whose release
    /// failed is evicted and its id recorded as a bad handle. Returns the
    /// number of matches (also carried in the error).
    pub fn release_with_mark(&self, mark: &str) -> BatchResult {
        let mut registry = self.lock();
        let ids = registry.marks.get(mark).cloned().unwrap_or_default();
        let mut last_failure: Option<VirtualMemoryError> = None;
        for &id in &ids {
            let Some(entry) = registry.memories.get_mut(&id) else {
                continue;
            };
            if let Err(failure) = entry.memory.release() {
                if let Some(superseded) = last_failure.replace(failure) {
                    warn!("release of {id:#x} failed after an earlier failure: {superseded}");
                }
                registry.quarantine(id);
            }
        }
        match last_failure {
            None => Ok(ids.len()),
            Some(source) => Err(BatchError {
                op: "release",
                visited: ids.len(),
                source,
            }),
        }
    }

    /// Materializes every memory currently tagged with `mark`, in
    /// registration order.
    ///
    /// Stops at the first failure, evicts the failing memory and rolls
    /// back every memory already materialized in this batch by releasing
    /// it again (rollback failures are logged and also evict). Cleanly
    /// rolled back memories stay registered as `Released`. The error
    /// carries the number of memories visited before stopping.
    pub fn materialize_with_mark(&self, mark: &str) -> BatchResult {
        let mut registry = self.lock();
        let ids = registry.marks.get(mark).cloned().unwrap_or_default();
        let mut materialized: Vec<u64> = Vec::new();
        for (index, &id) in ids.iter().enumerate() {
            let Some(entry) = registry.memories.get_mut(&id) else {
                continue;
            };
            match entry.memory.materialize() {
                Ok(()) => materialized.push(id),
                Err(source) => {
                    registry.quarantine(id);
                    for &done in materialized.iter().rev() {
                        let Some(entry) = registry.memories.get_mut(&done) else {
                            continue;
                        };
                        if let Err(failure) = entry.memory.release() {
                            warn!("rollback release of {done:#x} failed: {failure}");
                            registry.quarantine(done);
                        }
                    }
                    return Err(BatchError {
                        op: "materialize",
                        visited: index + 1,
                        source,
                    });
                }
            }
        }
        Ok(ids.len())
    }

    /// Drains the ids of all memories evicted due to failure since the
    /// last call. The list may be incomplete if recording an eviction hit
    /// resource exhaustion.
    pub fn retrieve_bad_handles(&self) -> Vec<u64> {
        mem::take(&mut self.lock().bad_handles)
    }
}

/// Releases the memories tagged with any of `marks` against one manager,
/// summing the match counts.
pub fn release_with_marks(manager: &VirtualMemoryManager, marks: &[&str]) -> BatchResult {
    let mut total = 0;
    for mark in marks {
        total += manager.release_with_mark(mark).map_err(|mut failure| {
            failure.visited += total;
            failure
        })?;
    }
    Ok(total)
}

/// Materializes the memories tagged with any of `marks` against one
/// manager, summing the match counts.
pub fn materialize_with_marks(manager: &VirtualMemoryManager, marks: &[&str]) -> BatchResult {
    let mut total = 0;
    for mark in marks {
        total += manager.materialize_with_mark(mark).map_err(|mut failure| {
            failure.visited += total;
            failure
        })?;
    }
    Ok(total)
}
