//! Advisory per-table reader/writer locks.
//!
//! Locks never block: an incompatible request fails immediately and the
//! caller is expected to park on the TableUnlock wait list and retry once
//! the holder unlocks.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct LockState {
    readers: u32,
    writer: bool,
}

/// Which side was released by [`TableLockManager::unlock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Released {
    Writer,
    Reader,
    Nothing,
}

/// Reader/writer lock table keyed by table id.
#[derive(Default)]
pub struct TableLockManager {
    tables: Mutex<HashMap<u32, Arc<Mutex<LockState>>>>,
}

impl TableLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self, table_id: u32) -> Arc<Mutex<LockState>> {
        Arc::clone(self.tables.lock().entry(table_id).or_default())
    }

    /// Take a read lock; fails while a writer holds the table.
    pub fn rd_lock(&self, table_id: u32) -> bool {
        let table = self.table(table_id);
        let mut state = table.lock();
        if state.writer {
            debug!("Table {} read lock refused: writer active", table_id);
            return false;
        }
        state.readers += 1;
        true
    }

    /// Take the write lock; fails while anyone holds the table.
    pub fn wr_lock(&self, table_id: u32) -> bool {
        let table = self.table(table_id);
        let mut state = table.lock();
        if state.writer || state.readers > 0 {
            debug!(
                "Table {} write lock refused: writer={} readers={}",
                table_id, state.writer, state.readers
            );
            return false;
        }
        state.writer = true;
        true
    }

    /// Release the writer if present, else one reader.
    pub fn unlock(&self, table_id: u32) -> Released {
        let table = self.table(table_id);
        let mut state = table.lock();
        if state.writer {
            state.writer = false;
            Released::Writer
        } else if state.readers > 0 {
            state.readers -= 1;
            Released::Reader
        } else {
            warn!("Table {} unlocked while not held", table_id);
            Released::Nothing
        }
    }
}
