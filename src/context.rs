//! Contexts: independent audio-processing universes.
//!
//! A context owns a listener, a pool of sources, the per-context mixing
//! parameters, and a bound output device. All mutation of context-owned
//! state happens under the context lock; queue operations additionally take
//! the shared buffer-store lock, always in that order.

use crate::buffer::{BufferId, BufferStore};
use crate::device::Device;
use crate::error::{ErrorCode, ResonaError, Result};
use crate::events::EngineEvent;
use crate::filter::{DistanceModel, FilterChain, TimeFilter};
use crate::format::PcmFormat;
use crate::listener::Listener;
use crate::math::{Orientation, Vec3};
use crate::mixer::{self, MixPhase};
use crate::source::{Source, SourceId, SourceState};
use crossbeam_channel::Sender;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Stable handle for a context within its engine.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ContextId(pub(crate) u64);

impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ContextId({})", self.0)
    }
}

/// Creation attributes for a context.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextAttrs {
    /// Synchronous contexts are never touched by the background mixer
    /// thread; the application drives them through [`Context::process`].
    pub synchronous: bool,
}

/// Context-global mixing parameters consumed by the filter pipeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContextParams {
    pub doppler_factor: f32,
    pub speed_of_sound: f32,
    pub distance_model: DistanceModel,
}

impl Default for ContextParams {
    fn default() -> Self {
        Self {
            doppler_factor: 1.0,
            speed_of_sound: 343.3,
            distance_model: DistanceModel::default(),
        }
    }
}

/// Where to splice an extension filter into the chain.
#[derive(Debug, Clone)]
pub enum FilterPosition {
    Before(String),
    After(String),
    End,
}

pub(crate) struct ContextState {
    pub params: ContextParams,
    pub listener: Listener,
    pub sources: HashMap<SourceId, Source>,
    pub next_source_id: u64,
    pub chain: FilterChain,
    /// Lazily derived speaker geometry; `None` after listener mutation.
    pub speakers: Option<Vec<Vec3>>,
    pub suspended: bool,
    pub phase: MixPhase,
    /// Copies of the negotiated device attributes, fixed once bound.
    pub stream: PcmFormat,
    pub quantum_frames: usize,
}

/// One independent audio-processing session bound to an output device.
pub struct Context {
    pub(crate) id: ContextId,
    pub(crate) synchronous: bool,
    pub(crate) state: Mutex<ContextState>,
    pub(crate) device: Mutex<Device>,
    /// Optional capture endpoint; contexts may bind a read device as well.
    input: Mutex<Option<Device>>,
    pub(crate) buffers: Arc<Mutex<BufferStore>>,
    pub(crate) events: Sender<EngineEvent>,
    last_error: Mutex<Option<ErrorCode>>,
}

impl Context {
    pub(crate) fn new(
        id: ContextId,
        device: Device,
        attrs: ContextAttrs,
        buffers: Arc<Mutex<BufferStore>>,
        events: Sender<EngineEvent>,
    ) -> Self {
        let stream = device.attrs().format;
        let quantum_frames = device.quantum_frames();
        Self {
            id,
            synchronous: attrs.synchronous,
            state: Mutex::new(ContextState {
                params: ContextParams::default(),
                listener: Listener::default(),
                sources: HashMap::new(),
                next_source_id: 1,
                chain: FilterChain::standard(),
                speakers: None,
                suspended: false,
                phase: MixPhase::Idle,
                stream,
                quantum_frames,
            }),
            device: Mutex::new(device),
            input: Mutex::new(None),
            buffers,
            events,
            last_error: Mutex::new(None),
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn is_synchronous(&self) -> bool {
        self.synchronous
    }

    /// Reads and clears the last recorded error code.
    pub fn poll_error(&self) -> Option<ErrorCode> {
        self.last_error.lock().unwrap().take()
    }

    /// Records the error code of a failed operation, then passes it on.
    fn finish<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(error) = &result {
            if let Some(code) = error.code() {
                *self.last_error.lock().unwrap() = Some(code);
            }
        }
        result
    }

    fn with_source<T>(&self, sid: SourceId, f: impl FnOnce(&mut Source) -> Result<T>) -> Result<T> {
        let result = (|| {
            let mut state = self.state.lock().unwrap();
            let source = state
                .sources
                .get_mut(&sid)
                .ok_or_else(|| ResonaError::invalid_handle(format!("{} does not exist", sid)))?;
            f(source)
        })();
        self.finish(result)
    }

    /// Context lock first, then the shared buffer-store lock.
    fn with_source_and_store<T>(
        &self,
        sid: SourceId,
        f: impl FnOnce(&mut Source, &mut BufferStore) -> Result<T>,
    ) -> Result<T> {
        let result = (|| {
            let mut state = self.state.lock().unwrap();
            let source = state
                .sources
                .get_mut(&sid)
                .ok_or_else(|| ResonaError::invalid_handle(format!("{} does not exist", sid)))?;
            let mut store = self.buffers.lock().unwrap();
            f(source, &mut store)
        })();
        self.finish(result)
    }

    // --- source lifecycle ---------------------------------------------------

    pub fn create_source(&self) -> SourceId {
        let mut state = self.state.lock().unwrap();
        let id = SourceId(state.next_source_id);
        state.next_source_id += 1;
        state.sources.insert(id, Source::new(id));
        log::debug!("{}: created {}", self.id, id);
        id
    }

    /// Destroys a source, releasing every buffer reference it holds.
    pub fn destroy_source(&self, sid: SourceId) -> Result<()> {
        let result = (|| {
            let mut state = self.state.lock().unwrap();
            let mut source = state.sources.remove(&sid).ok_or_else(|| {
                ResonaError::invalid_handle(format!("{} does not exist", sid))
            })?;
            let mut store = self.buffers.lock().unwrap();
            source.clear_queue(&mut store);
            log::debug!("{}: destroyed {}", self.id, sid);
            Ok(())
        })();
        self.finish(result)
    }

    pub fn source_state(&self, sid: SourceId) -> Result<SourceState> {
        self.with_source(sid, |source| Ok(source.state()))
    }

    pub fn source_ids(&self) -> Vec<SourceId> {
        self.state.lock().unwrap().sources.keys().copied().collect()
    }

    // --- playback control ---------------------------------------------------

    pub fn play(&self, sid: SourceId) -> Result<()> {
        let context = self.id;
        let events = self.events.clone();
        self.with_source_and_store(sid, move |source, store| {
            source.play(store);
            if source.state() == SourceState::Playing {
                let _ = events.send(EngineEvent::SourceStarted {
                    context,
                    source: sid,
                });
            }
            Ok(())
        })
    }

    pub fn pause(&self, sid: SourceId) -> Result<()> {
        self.with_source(sid, |source| {
            source.pause();
            Ok(())
        })
    }

    pub fn stop(&self, sid: SourceId) -> Result<()> {
        let context = self.id;
        let events = self.events.clone();
        self.with_source_and_store(sid, move |source, store| {
            source.stop(store);
            let _ = events.send(EngineEvent::SourceStopped {
                context,
                source: sid,
            });
            Ok(())
        })
    }

    pub fn rewind(&self, sid: SourceId) -> Result<()> {
        self.with_source_and_store(sid, |source, store| {
            source.rewind(store);
            Ok(())
        })
    }

    // --- queue operations ---------------------------------------------------

    pub fn enqueue_buffers(&self, sid: SourceId, bids: &[BufferId]) -> Result<()> {
        self.with_source_and_store(sid, |source, store| source.enqueue(store, bids))
    }

    /// Dequeues up to `count` processed buffers from the front of the queue.
    pub fn unqueue_buffers(&self, sid: SourceId, count: usize) -> Result<Vec<BufferId>> {
        self.with_source_and_store(sid, |source, store| source.unqueue(store, count))
    }

    /// Directly attaches one buffer (static mode), or detaches with `None`.
    pub fn attach_buffer(&self, sid: SourceId, bid: Option<BufferId>) -> Result<()> {
        self.with_source_and_store(sid, |source, store| source.attach_buffer(store, bid))
    }

    pub fn processed_buffer_count(&self, sid: SourceId) -> Result<usize> {
        self.with_source(sid, |source| Ok(source.processed_count()))
    }

    pub fn queued_buffer_count(&self, sid: SourceId) -> Result<usize> {
        self.with_source(sid, |source| Ok(source.queued_count()))
    }

    // --- source attributes --------------------------------------------------

    pub fn set_source_gain(&self, sid: SourceId, gain: f32) -> Result<()> {
        self.with_source(sid, |source| {
            if !gain.is_finite() || gain < 0.0 {
                return Err(ResonaError::invalid_value("gain must be non-negative"));
            }
            source.gain = gain;
            Ok(())
        })
    }

    pub fn set_source_gain_bounds(&self, sid: SourceId, min: f32, max: f32) -> Result<()> {
        self.with_source(sid, |source| {
            if !(min.is_finite() && max.is_finite()) || min < 0.0 || max < min {
                return Err(ResonaError::invalid_value(
                    "gain bounds must satisfy 0 <= min <= max",
                ));
            }
            source.min_gain = min;
            source.max_gain = max;
            Ok(())
        })
    }

    pub fn set_source_pitch(&self, sid: SourceId, pitch: f32) -> Result<()> {
        self.with_source(sid, |source| {
            if !pitch.is_finite() || pitch <= 0.0 {
                return Err(ResonaError::invalid_value("pitch must be positive"));
            }
            source.pitch = pitch;
            Ok(())
        })
    }

    pub fn set_source_position(&self, sid: SourceId, position: Vec3) -> Result<()> {
        self.with_source(sid, |source| {
            if !position.is_finite() {
                return Err(ResonaError::invalid_value("position must be finite"));
            }
            source.position = position;
            Ok(())
        })
    }

    pub fn set_source_velocity(&self, sid: SourceId, velocity: Vec3) -> Result<()> {
        self.with_source(sid, |source| {
            if !velocity.is_finite() {
                return Err(ResonaError::invalid_value("velocity must be finite"));
            }
            source.velocity = velocity;
            Ok(())
        })
    }

    /// Sets the source direction; zero means omnidirectional.
    pub fn set_source_direction(&self, sid: SourceId, direction: Vec3) -> Result<()> {
        self.with_source(sid, |source| {
            if !direction.is_finite() {
                return Err(ResonaError::invalid_value("direction must be finite"));
            }
            source.direction = direction;
            Ok(())
        })
    }

    pub fn set_source_looping(&self, sid: SourceId, looping: bool) -> Result<()> {
        self.with_source(sid, |source| {
            source.looping = looping;
            Ok(())
        })
    }

    pub fn set_source_relative(&self, sid: SourceId, relative: bool) -> Result<()> {
        self.with_source(sid, |source| {
            source.relative = relative;
            Ok(())
        })
    }

    pub fn set_source_cone(
        &self,
        sid: SourceId,
        inner_angle: f32,
        outer_angle: f32,
        outer_gain: f32,
    ) -> Result<()> {
        self.with_source(sid, |source| {
            let angles_valid = (0.0..=360.0).contains(&inner_angle)
                && (0.0..=360.0).contains(&outer_angle)
                && inner_angle <= outer_angle;
            if !angles_valid {
                return Err(ResonaError::invalid_value(
                    "cone angles must satisfy 0 <= inner <= outer <= 360",
                ));
            }
            if !(0.0..=1.0).contains(&outer_gain) {
                return Err(ResonaError::invalid_value(
                    "cone outer gain must be within [0, 1]",
                ));
            }
            source.cone_inner_angle = inner_angle;
            source.cone_outer_angle = outer_angle;
            source.cone_outer_gain = outer_gain;
            Ok(())
        })
    }

    pub fn set_source_distance_params(
        &self,
        sid: SourceId,
        reference_distance: f32,
        max_distance: f32,
        rolloff: f32,
    ) -> Result<()> {
        self.with_source(sid, |source| {
            if reference_distance < 0.0 || max_distance < reference_distance || rolloff < 0.0 {
                return Err(ResonaError::invalid_value(
                    "distance parameters must satisfy 0 <= reference <= max, rolloff >= 0",
                ));
            }
            source.reference_distance = reference_distance;
            source.max_distance = max_distance;
            source.rolloff = rolloff;
            Ok(())
        })
    }

    // --- listener -----------------------------------------------------------

    pub fn listener(&self) -> Listener {
        self.state.lock().unwrap().listener.clone()
    }

    pub fn set_listener_position(&self, position: Vec3) -> Result<()> {
        let result = (|| {
            if !position.is_finite() {
                return Err(ResonaError::invalid_value("position must be finite"));
            }
            let mut state = self.state.lock().unwrap();
            state.listener.position = position;
            state.speakers = None;
            Ok(())
        })();
        self.finish(result)
    }

    pub fn set_listener_velocity(&self, velocity: Vec3) -> Result<()> {
        let result = (|| {
            if !velocity.is_finite() {
                return Err(ResonaError::invalid_value("velocity must be finite"));
            }
            self.state.lock().unwrap().listener.velocity = velocity;
            Ok(())
        })();
        self.finish(result)
    }

    /// Sets the listener orientation from an at/up pair.
    ///
    /// # Errors
    ///
    /// Invalid-value if the pair cannot form an orthogonal basis.
    pub fn set_listener_orientation(&self, at: Vec3, up: Vec3) -> Result<()> {
        let result = (|| {
            let orientation = Orientation::new(at, up);
            orientation.basis()?;
            let mut state = self.state.lock().unwrap();
            state.listener.orientation = orientation;
            state.speakers = None;
            Ok(())
        })();
        self.finish(result)
    }

    pub fn set_listener_gain(&self, gain: f32) -> Result<()> {
        let result = (|| {
            if !gain.is_finite() || gain < 0.0 {
                return Err(ResonaError::invalid_value("gain must be non-negative"));
            }
            self.state.lock().unwrap().listener.gain = gain;
            Ok(())
        })();
        self.finish(result)
    }

    // --- context parameters -------------------------------------------------

    pub fn params(&self) -> ContextParams {
        self.state.lock().unwrap().params
    }

    pub fn set_doppler_factor(&self, factor: f32) -> Result<()> {
        let result = (|| {
            if !factor.is_finite() || factor < 0.0 {
                return Err(ResonaError::invalid_value(
                    "doppler factor must be non-negative",
                ));
            }
            self.state.lock().unwrap().params.doppler_factor = factor;
            Ok(())
        })();
        self.finish(result)
    }

    pub fn set_speed_of_sound(&self, speed: f32) -> Result<()> {
        let result = (|| {
            if !speed.is_finite() || speed <= 0.0 {
                return Err(ResonaError::invalid_value("speed of sound must be positive"));
            }
            self.state.lock().unwrap().params.speed_of_sound = speed;
            Ok(())
        })();
        self.finish(result)
    }

    /// Sets the distance model, applied uniformly to every source on the
    /// next mix quantum.
    pub fn set_distance_model(&self, model: DistanceModel) {
        self.state.lock().unwrap().params.distance_model = model;
    }

    // --- filter chain -------------------------------------------------------

    /// Splices a filter stage into the chain at the given position.
    pub fn install_filter(
        &self,
        position: FilterPosition,
        stage: Box<dyn TimeFilter>,
    ) -> Result<()> {
        let result = {
            let mut state = self.state.lock().unwrap();
            match position {
                FilterPosition::Before(slot) => state.chain.insert_before(&slot, stage),
                FilterPosition::After(slot) => state.chain.insert_after(&slot, stage),
                FilterPosition::End => state.chain.push(stage),
            }
        };
        self.finish(result)
    }

    pub fn replace_filter(&self, slot: &str, stage: Box<dyn TimeFilter>) -> Result<()> {
        let result = self.state.lock().unwrap().chain.replace(slot, stage);
        self.finish(result)
    }

    pub fn remove_filter(&self, slot: &str) -> Result<()> {
        let result = self.state.lock().unwrap().chain.remove(slot);
        self.finish(result)
    }

    pub fn filter_names(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .chain
            .stage_names()
            .into_iter()
            .map(str::to_owned)
            .collect()
    }

    // --- capture ------------------------------------------------------------

    /// Binds a read device for capture alongside the write device.
    pub fn bind_input_device(&self, device: Device) -> Result<()> {
        let result = (|| {
            if device.mode() != crate::device::OpenMode::Input {
                return Err(ResonaError::invalid_operation(
                    "capture requires a device opened for input",
                ));
            }
            *self.input.lock().unwrap() = Some(device);
            Ok(())
        })();
        self.finish(result)
    }

    /// Reads captured PCM from the bound input device.
    ///
    /// # Errors
    ///
    /// Invalid-operation if no input device is bound.
    pub fn capture(&self, out: &mut [u8]) -> Result<usize> {
        let result = (|| {
            let mut input = self.input.lock().unwrap();
            let device = input.as_mut().ok_or_else(|| {
                ResonaError::invalid_operation("no input device is bound to this context")
            })?;
            device.read(out)
        })();
        self.finish(result)
    }

    // --- scheduling ---------------------------------------------------------

    /// Suspends mixing for this context; the mixer skips it until resumed.
    pub fn suspend(&self) {
        self.state.lock().unwrap().suspended = true;
        log::debug!("{} suspended", self.id);
    }

    pub fn resume(&self) {
        self.state.lock().unwrap().suspended = false;
        log::debug!("{} resumed", self.id);
    }

    pub fn is_suspended(&self) -> bool {
        self.state.lock().unwrap().suspended
    }

    /// Runs exactly one mix iteration on the calling thread.
    ///
    /// This is how synchronous contexts make progress; it is also legal on
    /// asynchronous contexts, where it interleaves with the mixer thread
    /// under the same locks.
    pub fn process(&self) {
        mixer::mix_quantum(self);
    }

    /// Pipeline position after the most recent iteration.
    pub fn mix_phase(&self) -> MixPhase {
        self.state.lock().unwrap().phase
    }
}
