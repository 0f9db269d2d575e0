//! Stream ↔ model registry.

use dashmap::DashMap;
use tracing::{error, info, warn};

use crate::error::{Result, SchedError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StreamEntry {
    model_id: u32,
    flag: u32,
}

/// Bidirectional map of streams and the models that own them.
#[derive(Default)]
pub struct StreamRegistry {
    streams: DashMap<u32, StreamEntry>,
    by_model: DashMap<u32, Vec<u32>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `stream_id` to `model_id`. A duplicate registration is
    /// logged and ignored; the first owner is kept.
    pub fn register(&self, stream_id: u32, model_id: u32, flag: u32) {
        if let Some(existing) = self.streams.get(&stream_id) {
            error!(
                "Stream {} already registered to model {}, ignoring model {}",
                stream_id, existing.model_id, model_id
            );
            return;
        }
        self.streams.insert(stream_id, StreamEntry { model_id, flag });
        self.by_model.entry(model_id).or_default().push(stream_id);
        info!("Registered stream {} to model {} (flag {:#x})", stream_id, model_id, flag);
    }

    /// Remove `stream_id` if it belongs to `model_id`.
    pub fn unregister(&self, stream_id: u32, model_id: u32) {
        let removed = self
            .streams
            .remove_if(&stream_id, |_, entry| entry.model_id == model_id);
        if removed.is_none() {
            warn!("Stream {} not registered to model {}, skip unregister", stream_id, model_id);
            return;
        }
        if let Some(mut streams) = self.by_model.get_mut(&model_id) {
            streams.retain(|s| *s != stream_id);
        }
        self.by_model.remove_if(&model_id, |_, streams| streams.is_empty());
    }

    pub fn model_of(&self, stream_id: u32) -> Result<u32> {
        self.streams
            .get(&stream_id)
            .map(|e| e.model_id)
            .ok_or(SchedError::StreamNotFound(stream_id))
    }

    pub fn flag_of(&self, stream_id: u32) -> Result<u32> {
        self.streams
            .get(&stream_id)
            .map(|e| e.flag)
            .ok_or(SchedError::StreamNotFound(stream_id))
    }

    /// Streams owned by `model_id`.
    pub fn streams_of(&self, model_id: u32) -> Vec<u32> {
        self.by_model
            .get(&model_id)
            .map(|s| s.clone())
            .unwrap_or_default()
    }
}
