//! Model lifecycle.
//!
//! ```text
//!  Load ──► Loaded ◄──── EndGraph ────┐
//!             │                       │
//!          Execute ──────────────► Running
//!             │                       │
//!           Abort ◄───────────────────┘
//!             ▼
//!          Aborted ── Destroy ──► Destroyed (removed)
//! ```
//!
//! A model owns its streams, its queue subscriptions, every buffer allocated
//! on its behalf and the wait-list ids keyed by its id or its queues.
//! Destroy releases all of them.

use bytes::{Buf, BufMut, BytesMut};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::constants::resources::MAX_MODEL_COUNT;
use crate::driver::{DeviceDriver, QueueEvent};
use crate::error::{Result, SchedError};
use crate::resources::{BufferTracker, StreamRegistry, WaitManagers};
use crate::topology::DeviceTopology;

/// Lifecycle state of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelStatus {
    Loaded,
    Running,
    Aborted,
    Destroyed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSpec {
    pub stream_id: u32,
    pub flag: u32,
}

/// Body of a model-load command:
/// `u32 ts_context, u16 stream_count, u16 queue_count, u8 repeat, 3 pad,
/// (u32 stream_id, u32 flag) * streams, u32 queue_id * queues`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadSpec {
    pub ts_context: u32,
    pub streams: Vec<StreamSpec>,
    pub queues: Vec<u32>,
    /// Re-submit the model after every successful run.
    pub repeat: bool,
}

impl LoadSpec {
    pub fn decode(buf: &mut &[u8]) -> Result<Self> {
        let truncated = || SchedError::ParameterInvalid("model load body truncated".to_string());
        if buf.remaining() < 12 {
            return Err(truncated());
        }
        let ts_context = buf.get_u32_le();
        let stream_count = buf.get_u16_le() as usize;
        let queue_count = buf.get_u16_le() as usize;
        let repeat = buf.get_u8() != 0;
        buf.advance(3);
        if buf.remaining() < stream_count * 8 + queue_count * 4 {
            return Err(truncated());
        }
        let streams = (0..stream_count)
            .map(|_| StreamSpec {
                stream_id: buf.get_u32_le(),
                flag: buf.get_u32_le(),
            })
            .collect();
        let queues = (0..queue_count).map(|_| buf.get_u32_le()).collect();
        Ok(Self {
            ts_context,
            streams,
            queues,
            repeat,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.ts_context);
        buf.put_u16_le(self.streams.len() as u16);
        buf.put_u16_le(self.queues.len() as u16);
        buf.put_u8(u8::from(self.repeat));
        buf.put_bytes(0, 3);
        for s in &self.streams {
            buf.put_u32_le(s.stream_id);
            buf.put_u32_le(s.flag);
        }
        for q in &self.queues {
            buf.put_u32_le(*q);
        }
    }
}

#[derive(Debug, Clone)]
pub struct Model {
    pub id: u32,
    pub device: u32,
    pub ts_context: u32,
    pub status: ModelStatus,
    pub streams: Vec<StreamSpec>,
    pub queues: Vec<u32>,
    pub repeat: bool,
    /// Last non-zero task result reported for this model.
    pub return_code: u32,
}

/// Services a lifecycle transition touches.
pub struct ModelDeps<'a> {
    pub driver: &'a dyn DeviceDriver,
    pub topology: &'a DeviceTopology,
    pub streams: &'a StreamRegistry,
    pub waits: &'a WaitManagers,
    pub buffers: Option<&'a BufferTracker>,
}

/// Loaded models keyed by id.
#[derive(Default)]
pub struct ModelManager {
    models: DashMap<u32, Model>,
}

impl ModelManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self, deps: &ModelDeps<'_>, model_id: u32, device: u32, spec: LoadSpec) -> Result<()> {
        if model_id >= MAX_MODEL_COUNT {
            return Err(SchedError::ParameterInvalid(format!(
                "model id {} must be below {}",
                model_id, MAX_MODEL_COUNT
            )));
        }
        let capacity = deps.waits.queue_not_empty.capacity();
        if let Some(bad) = spec.queues.iter().find(|&&q| q as usize >= capacity) {
            return Err(SchedError::ParameterInvalid(format!(
                "model {} queue {} must be below {}",
                model_id, bad, capacity
            )));
        }
        // The vacant entry keeps the id reserved until the model is in place.
        let Entry::Vacant(slot) = self.models.entry(model_id) else {
            return Err(SchedError::ParameterInvalid(format!(
                "model {} already loaded",
                model_id
            )));
        };

        for s in &spec.streams {
            deps.streams.register(s.stream_id, model_id, s.flag);
        }
        for (i, &queue) in spec.queues.iter().enumerate() {
            if let Err(e) = deps.topology.subscribe_queue(deps.driver, queue, QueueEvent::NotEmpty) {
                for &done in &spec.queues[..i] {
                    let _ = deps.topology.unsubscribe_queue(deps.driver, done, QueueEvent::NotEmpty);
                }
                for s in &spec.streams {
                    deps.streams.unregister(s.stream_id, model_id);
                }
                return Err(e);
            }
        }

        info!(
            "Loaded model {} on device {}: ts context {}, {} streams, {} queues, repeat={}",
            model_id,
            device,
            spec.ts_context,
            spec.streams.len(),
            spec.queues.len(),
            spec.repeat
        );
        slot.insert(Model {
            id: model_id,
            device,
            ts_context: spec.ts_context,
            status: ModelStatus::Loaded,
            streams: spec.streams,
            queues: spec.queues,
            repeat: spec.repeat,
            return_code: 0,
        });
        Ok(())
    }

    fn transition(&self, model_id: u32, f: impl FnOnce(&mut Model) -> Result<()>) -> Result<()> {
        let mut model = self
            .models
            .get_mut(&model_id)
            .ok_or(SchedError::ModelNotFound(model_id))?;
        f(&mut model)
    }

    /// Loaded | Running → Running.
    pub fn execute(&self, model_id: u32) -> Result<()> {
        self.transition(model_id, |m| match m.status {
            ModelStatus::Loaded | ModelStatus::Running => {
                m.status = ModelStatus::Running;
                debug!("Model {} running", model_id);
                Ok(())
            }
            other => Err(SchedError::ParameterInvalid(format!(
                "model {} cannot execute from {:?}",
                model_id, other
            ))),
        })
    }

    /// Running → Loaded at the end of one graph run.
    pub fn end_graph(&self, model_id: u32) -> Result<()> {
        self.transition(model_id, |m| {
            if m.status == ModelStatus::Running {
                m.status = ModelStatus::Loaded;
            } else {
                warn!("End of graph for model {} in state {:?}", model_id, m.status);
            }
            Ok(())
        })
    }

    pub fn abort(&self, model_id: u32) -> Result<()> {
        self.transition(model_id, |m| {
            info!("Aborting model {} from {:?}", model_id, m.status);
            m.status = ModelStatus::Aborted;
            Ok(())
        })
    }

    /// Abort if running, then release everything the model owns. Release
    /// failures are logged and the remaining steps still run; the model is
    /// removed last.
    pub fn destroy(&self, deps: &ModelDeps<'_>, model_id: u32) -> Result<()> {
        let model = {
            let mut model = self
                .models
                .get_mut(&model_id)
                .ok_or(SchedError::ModelNotFound(model_id))?;
            match model.status {
                ModelStatus::Destroyed => return Err(SchedError::ModelNotFound(model_id)),
                ModelStatus::Running => {
                    info!("Model {} still running, aborting before destroy", model_id);
                }
                _ => {}
            }
            model.status = ModelStatus::Destroyed;
            model.clone()
        };

        for s in &model.streams {
            deps.streams.unregister(s.stream_id, model_id);
        }
        for &queue in &model.queues {
            if let Err(e) = deps.topology.unsubscribe_queue(deps.driver, queue, QueueEvent::NotEmpty) {
                warn!("Model {} queue {} unsubscribe failed: {}", model_id, queue, e);
            }
        }
        if let Some(buffers) = deps.buffers {
            if let Err(e) = buffers.free_all(model_id) {
                warn!("Model {} buffer release failed: {}", model_id, e);
            }
        }

        let model_ids = [model_id as usize];
        let queue_ids: Vec<usize> = model.queues.iter().map(|q| *q as usize).collect();
        let clears = [
            (&deps.waits.end_graph, &model_ids[..]),
            (&deps.waits.any_queue_not_empty, &model_ids[..]),
            (&deps.waits.queue_not_empty, &queue_ids[..]),
            (&deps.waits.queue_not_full, &queue_ids[..]),
        ];
        for (list, ids) in clears {
            if let Err(e) = list.clear_batch(ids) {
                warn!("Model {} {} clear failed: {}", model_id, list.name(), e);
            }
        }

        self.models.remove(&model_id);
        info!("Destroyed model {}", model_id);
        Ok(())
    }

    pub fn status(&self, model_id: u32) -> Option<ModelStatus> {
        self.models.get(&model_id).map(|m| m.status)
    }

    pub fn get(&self, model_id: u32) -> Result<Model> {
        self.models
            .get(&model_id)
            .map(|m| m.clone())
            .ok_or(SchedError::ModelNotFound(model_id))
    }

    pub fn set_return_code(&self, model_id: u32, code: u32) -> Result<()> {
        self.transition(model_id, |m| {
            m.return_code = code;
            Ok(())
        })
    }

    /// Model that consumes `queue_id`.
    pub fn model_of_queue(&self, queue_id: u32) -> Option<u32> {
        self.models
            .iter()
            .find(|m| m.queues.contains(&queue_id))
            .map(|m| m.id)
    }

    pub fn any_running(&self) -> bool {
        self.models.iter().any(|m| m.status == ModelStatus::Running)
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Ids of every loaded model.
    pub fn ids(&self) -> Vec<u32> {
        self.models.iter().map(|m| m.id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{DeviceSpec, SimDriver};
    use crate::topology::TopologyParams;
    use crate::types::{DeployContext, RunMode};
    use std::sync::Arc;

    struct Fixture {
        driver: Arc<SimDriver>,
        topology: DeviceTopology,
        streams: StreamRegistry,
        waits: WaitManagers,
        buffers: BufferTracker,
    }

    impl Fixture {
        fn new() -> Self {
            let driver = Arc::new(SimDriver::new(DeviceSpec::with_aicpus(2)));
            let topology = DeviceTopology::init(
                driver.as_ref(),
                &TopologyParams {
                    device_ids: vec![0],
                    host_pid: 1,
                    vf_id: 0,
                    run_mode: RunMode::Process,
                    deploy: DeployContext::Device,
                },
            )
            .unwrap();
            Self {
                buffers: BufferTracker::new(driver.clone(), 0),
                driver,
                topology,
                streams: StreamRegistry::new(),
                waits: WaitManagers::with_capacity(64),
            }
        }

        fn deps(&self) -> ModelDeps<'_> {
            ModelDeps {
                driver: self.driver.as_ref(),
                topology: &self.topology,
                streams: &self.streams,
                waits: &self.waits,
                buffers: Some(&self.buffers),
            }
        }
    }

    fn spec() -> LoadSpec {
        LoadSpec {
            ts_context: 3,
            streams: vec![StreamSpec { stream_id: 10, flag: 0 }, StreamSpec { stream_id: 11, flag: 1 }],
            queues: vec![4],
            repeat: false,
        }
    }

    #[test]
    fn test_lifecycle() {
        let fx = Fixture::new();
        let models = ModelManager::new();
        models.load(&fx.deps(), 1, 0, spec()).unwrap();
        assert_eq!(models.status(1), Some(ModelStatus::Loaded));
        assert_eq!(fx.streams.model_of(11).unwrap(), 1);
        assert_eq!(models.model_of_queue(4), Some(1));
        assert_eq!(fx.driver.queue_subscriptions(0), vec![(4, QueueEvent::NotEmpty)]);

        models.execute(1).unwrap();
        assert!(models.any_running());
        models.end_graph(1).unwrap();
        assert_eq!(models.status(1), Some(ModelStatus::Loaded));

        models.execute(1).unwrap();
        models.abort(1).unwrap();
        assert!(models.execute(1).is_err());
        assert!(!models.any_running());
    }

    #[test]
    fn test_duplicate_and_out_of_range() {
        let fx = Fixture::new();
        let models = ModelManager::new();
        models.load(&fx.deps(), 1, 0, spec()).unwrap();
        assert!(matches!(
            models.load(&fx.deps(), 1, 0, spec()),
            Err(SchedError::ParameterInvalid(_))
        ));
        assert!(models.load(&fx.deps(), MAX_MODEL_COUNT, 0, spec()).is_err());
        assert!(matches!(models.execute(2), Err(SchedError::ModelNotFound(2))));
    }

    #[test]
    fn test_destroy_releases_everything() {
        let fx = Fixture::new();
        let models = ModelManager::new();
        models.load(&fx.deps(), 2, 0, spec()).unwrap();
        models.execute(2).unwrap();
        fx.buffers.malloc_and_guard(2, 128).unwrap();
        fx.waits.end_graph.wait_event(2, 10).unwrap();
        fx.waits.queue_not_empty.wait_event(4, 11).unwrap();

        models.destroy(&fx.deps(), 2).unwrap();
        assert_eq!(models.status(2), None);
        assert!(fx.streams.model_of(10).is_err());
        assert!(fx.driver.queue_subscriptions(0).is_empty());
        assert_eq!(fx.buffers.guarded(2), 0);
        assert_eq!(fx.driver.live_buffers(), 0);
        assert_eq!(fx.waits.total_waiting(), 0);
        assert!(matches!(
            models.destroy(&fx.deps(), 2),
            Err(SchedError::ModelNotFound(2))
        ));
    }

    #[test]
    fn test_queue_outside_wait_range_rejected() {
        let fx = Fixture::new();
        let models = ModelManager::new();
        let mut bad = spec();
        bad.queues = vec![4, 64];
        assert!(matches!(
            models.load(&fx.deps(), 1, 0, bad),
            Err(SchedError::ParameterInvalid(_))
        ));
        assert!(models.is_empty());
        assert!(fx.driver.queue_subscriptions(0).is_empty());
        assert!(fx.streams.model_of(10).is_err());
    }

    #[test]
    fn test_concurrent_load_of_same_id() {
        let fx = Fixture::new();
        let models = ModelManager::new();
        let loaded = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| models.load(&fx.deps(), 5, 0, spec()).is_ok()))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|ok| *ok)
                .count()
        });
        assert_eq!(loaded, 1);
        assert_eq!(models.len(), 1);
        assert_eq!(fx.driver.queue_subscriptions(0), vec![(4, QueueEvent::NotEmpty)]);
    }

    #[test]
    fn test_destroy_finishes_despite_release_failures() {
        let fx = Fixture::new();
        let models = ModelManager::new();
        models.load(&fx.deps(), 3, 0, spec()).unwrap();
        fx.buffers.malloc_and_guard(3, 64).unwrap();
        fx.waits.queue_not_full.wait_event(4, 10).unwrap();
        fx.driver.fail_buffer_free(true);

        models.destroy(&fx.deps(), 3).unwrap();
        assert_eq!(models.status(3), None);
        assert_eq!(fx.buffers.guarded(3), 0);
        assert_eq!(fx.waits.total_waiting(), 0);
        assert!(fx.driver.queue_subscriptions(0).is_empty());
    }

    #[test]
    fn test_load_spec_truncated() {
        let mut buf = BytesMut::new();
        spec().encode(&mut buf);
        let mut short = &buf[..buf.len() - 2];
        assert!(LoadSpec::decode(&mut short).is_err());
        let mut full = &buf[..];
        assert_eq!(LoadSpec::decode(&mut full).unwrap(), spec());
    }
}
