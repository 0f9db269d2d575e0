//! Wait-list rendezvous keyed by hardware wait ids.
//!
//! `event(id)` marks an id as arrived and wakes the registered waiter;
//! `wait_event(id, stream)` consumes an arrival or parks the stream. Nothing
//! blocks here: "parking" only records which stream must be resumed when
//! the event fires.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, error, info};

use crate::constants::resources::WAIT_LIST_CAPACITY;
use crate::error::{Result, SchedError};

#[derive(Debug, Clone, Copy, Default)]
struct WaitEntry {
    arrived: bool,
    waiter: Option<u32>,
}

/// Outcome of [`WaitList::event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Wake {
    pub has_wait: bool,
    pub wait_stream: Option<u32>,
}

/// One named wait-list instance.
pub struct WaitList {
    name: &'static str,
    capacity: usize,
    entries: Mutex<Vec<WaitEntry>>,
    wait_count: AtomicUsize,
}

impl WaitList {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            capacity,
            entries: Mutex::new(Vec::new()),
            wait_count: AtomicUsize::new(0),
        }
    }

    fn check(&self, id: usize) -> Result<()> {
        if id >= self.capacity {
            error!("{} wait id {} out of range [0, {})", self.name, id, self.capacity);
            return Err(SchedError::ParameterInvalid(format!(
                "{} wait id {} out of range",
                self.name, id
            )));
        }
        Ok(())
    }

    fn with_entry<R>(&self, id: usize, f: impl FnOnce(&mut WaitEntry) -> R) -> Result<R> {
        self.check(id)?;
        let mut entries = self.entries.lock();
        if entries.is_empty() {
            entries.resize(self.capacity, WaitEntry::default());
        }
        Ok(f(&mut entries[id]))
    }

    /// Mark `id` as arrived. If a stream waits on it, the arrival is
    /// consumed and that stream is returned for resumption.
    pub fn event(&self, id: usize) -> Result<Wake> {
        let waiter = self.with_entry(id, |entry| match entry.waiter.take() {
            Some(stream) => {
                entry.arrived = false;
                Some(stream)
            }
            None => {
                entry.arrived = true;
                None
            }
        })?;
        if let Some(stream) = waiter {
            self.wait_count.fetch_sub(1, Ordering::AcqRel);
            debug!("{} event {} wakes stream {}", self.name, id, stream);
        }
        Ok(Wake {
            has_wait: waiter.is_some(),
            wait_stream: waiter,
        })
    }

    /// Consume an arrival on `id` or register `stream` as its waiter.
    /// Returns whether the stream must wait.
    ///
    /// A second waiter on an occupied id is rejected with
    /// [`SchedError::WaitConflict`]; the first waiter stays registered.
    pub fn wait_event(&self, id: usize, stream: u32) -> Result<bool> {
        let outcome = self.with_entry(id, |entry| {
            if entry.arrived {
                entry.arrived = false;
                return Ok(false);
            }
            match entry.waiter {
                Some(existing) if existing != stream => Err(SchedError::WaitConflict {
                    id,
                    existing,
                    requested: stream,
                }),
                Some(_) => Ok(true),
                None => {
                    entry.waiter = Some(stream);
                    self.wait_count.fetch_add(1, Ordering::AcqRel);
                    Ok(true)
                }
            }
        })?;
        match &outcome {
            Err(e) => error!("{} {}", self.name, e),
            Ok(true) => debug!("{} stream {} waits on {}", self.name, stream, id),
            Ok(false) => debug!("{} stream {} consumed arrival on {}", self.name, stream, id),
        }
        outcome
    }

    /// Stream waiting on `id`, if any.
    pub fn waiting_stream(&self, id: usize) -> Result<Option<u32>> {
        self.with_entry(id, |entry| entry.waiter)
    }

    /// Clear arrival and waiter of `id`.
    pub fn reset(&self, id: usize) -> Result<()> {
        let had_waiter = self.with_entry(id, |entry| {
            let had = entry.waiter.is_some();
            *entry = WaitEntry::default();
            had
        })?;
        if had_waiter {
            self.wait_count.fetch_sub(1, Ordering::AcqRel);
        }
        Ok(())
    }

    /// Reset a set of ids under one lock. All ids are validated first, so
    /// either every id is reset or none is.
    pub fn clear_batch(&self, ids: &[usize]) -> Result<()> {
        for &id in ids {
            self.check(id)?;
        }
        let mut released = 0;
        {
            let mut entries = self.entries.lock();
            if entries.is_empty() {
                return Ok(());
            }
            for &id in ids {
                if entries[id].waiter.is_some() {
                    released += 1;
                }
                entries[id] = WaitEntry::default();
            }
        }
        self.wait_count.fetch_sub(released, Ordering::AcqRel);
        info!("{} cleared {} ids", self.name, ids.len());
        Ok(())
    }

    /// Number of registered waiters.
    pub fn wait_count(&self) -> usize {
        self.wait_count.load(Ordering::Acquire)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Number of addressable ids.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// The named wait-list instances used by the handlers.
pub struct WaitManagers {
    pub notify: WaitList,
    pub end_graph: WaitList,
    pub queue_not_empty: WaitList,
    pub queue_not_full: WaitList,
    pub prepare_mem: WaitList,
    pub any_queue_not_empty: WaitList,
    pub table_unlock: WaitList,
}

impl WaitManagers {
    pub fn new() -> Self {
        Self::with_capacity(WAIT_LIST_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            notify: WaitList::new("Notify", capacity),
            end_graph: WaitList::new("EndGraph", capacity),
            queue_not_empty: WaitList::new("QueueNotEmpty", capacity),
            queue_not_full: WaitList::new("QueueNotFull", capacity),
            prepare_mem: WaitList::new("PrepareMem", capacity),
            any_queue_not_empty: WaitList::new("AnyQueueNotEmpty", capacity),
            table_unlock: WaitList::new("TableUnlock", capacity),
        }
    }

    /// Total registered waiters across all instances.
    pub fn total_waiting(&self) -> usize {
        [
            &self.notify,
            &self.end_graph,
            &self.queue_not_empty,
            &self.queue_not_full,
            &self.prepare_mem,
            &self.any_queue_not_empty,
            &self.table_unlock,
        ]
        .iter()
        .map(|w| w.wait_count())
        .sum()
    }
}

impl Default for WaitManagers {
    fn default() -> Self {
        Self::new()
    }
}
