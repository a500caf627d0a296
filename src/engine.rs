//! The engine: explicit process-wide mixing state.
//!
//! [`ResonaEngine`] owns everything that the mixing machinery shares across
//! contexts: the context table behind the coarse lock, the buffer store, the
//! extension registry, the event channel, and the single background mixer
//! thread. It is an ordinary value, created and dropped explicitly, so tests
//! can run several independent engines side by side.
//!
//! Lock order, outermost first: context table, per-context state, buffer
//! store. The mixer-pause gate is independent and only ever touched at
//! iteration boundaries.

use crate::buffer::{BufferId, BufferState, BufferStore, DestroyCallback, FillCallback};
use crate::config::{Bindings, Value};
use crate::context::{Context, ContextAttrs, ContextId, FilterPosition};
use crate::device::{Backend, Device, DeviceAttrs, NullBackend, OpenMode};
use crate::error::{ErrorCode, ResonaError, Result};
use crate::events::EngineEvent;
use crate::extensions::ExtensionRegistry;
use crate::format::{PcmFormat, SampleFormat};
use crossbeam_channel::{Receiver, Sender, unbounded};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// How long to wait for the mixer thread before giving up on the join.
const JOIN_TIMEOUT: Duration = Duration::from_millis(500);

struct ContextTable {
    map: HashMap<ContextId, Arc<Context>>,
    next_id: u64,
}

/// Blocks the mixer thread at iteration boundaries while suspended.
struct PauseGate {
    paused: Mutex<bool>,
    unpaused: Condvar,
}

impl PauseGate {
    fn new() -> Self {
        Self {
            paused: Mutex::new(false),
            unpaused: Condvar::new(),
        }
    }

    fn suspend(&self) {
        *self.paused.lock().unwrap() = true;
    }

    fn resume(&self) {
        *self.paused.lock().unwrap() = false;
        self.unpaused.notify_all();
    }

    fn wait_if_paused(&self) {
        let mut paused = self.paused.lock().unwrap();
        while *paused {
            paused = self.unpaused.wait(paused).unwrap();
        }
    }
}

struct EngineShared {
    contexts: Mutex<ContextTable>,
    buffers: Arc<Mutex<BufferStore>>,
    pause: PauseGate,
    shutdown: AtomicBool,
    events_tx: Sender<EngineEvent>,
}

/// A software 3D positional-audio mixing engine instance.
///
/// Typical setup: open a device, create a context on it, create sources and
/// buffers, queue and play. Asynchronous contexts are serviced by one shared
/// background thread per engine; synchronous contexts are driven by
/// [`Context::process`].
pub struct ResonaEngine {
    shared: Arc<EngineShared>,
    events_rx: Receiver<EngineEvent>,
    extensions: Mutex<ExtensionRegistry>,
    mixer_thread: Mutex<Option<JoinHandle<()>>>,
    last_error: Mutex<Option<ErrorCode>>,
}

impl ResonaEngine {
    pub fn new() -> Self {
        let (events_tx, events_rx) = unbounded();
        log::info!("engine created");
        Self {
            shared: Arc::new(EngineShared {
                contexts: Mutex::new(ContextTable {
                    map: HashMap::new(),
                    next_id: 1,
                }),
                buffers: Arc::new(Mutex::new(BufferStore::new())),
                pause: PauseGate::new(),
                shutdown: AtomicBool::new(false),
                events_tx,
            }),
            events_rx,
            extensions: Mutex::new(ExtensionRegistry::new()),
            mixer_thread: Mutex::new(None),
            last_error: Mutex::new(None),
        }
    }

    /// Reads and clears the engine-level last error code.
    pub fn poll_error(&self) -> Option<ErrorCode> {
        self.last_error.lock().unwrap().take()
    }

    fn finish<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(error) = &result {
            if let Some(code) = error.code() {
                *self.last_error.lock().unwrap() = Some(code);
            }
        }
        result
    }

    // --- devices ------------------------------------------------------------

    /// Opens a backend and negotiates stream attributes.
    pub fn open_device(
        &self,
        backend: Box<dyn Backend>,
        mode: OpenMode,
        desired: &DeviceAttrs,
    ) -> Result<Device> {
        self.finish(Device::open(backend, mode, desired))
    }

    /// Opens an output device as described by evaluated config bindings.
    ///
    /// Recognized bindings: `devices` (backend name or list of names, first
    /// one that opens wins), `sampling-rate`, `speaker-channels`, and
    /// `device-buffer-bytes`. Anything absent falls back to defaults.
    pub fn open_device_from_config(&self, bindings: &Bindings) -> Result<Device> {
        let result = (|| {
            let names = match bindings.get("devices") {
                Some(Value::Sym(name)) | Some(Value::Str(name)) => vec![name.clone()],
                Some(Value::List(items)) => items
                    .iter()
                    .filter_map(|item| match item {
                        Value::Sym(name) | Value::Str(name) => Some(name.clone()),
                        _ => None,
                    })
                    .collect(),
                None => vec!["null".to_string()],
                Some(other) => {
                    return Err(ResonaError::invalid_enum(format!(
                        "devices binding has unusable shape: {:?}",
                        other
                    )));
                }
            };

            let sample_rate = bindings.number("sampling-rate").unwrap_or(44_100.0) as u32;
            let channels = bindings.number("speaker-channels").unwrap_or(2.0) as u16;
            let buffer_bytes = bindings.number("device-buffer-bytes").unwrap_or(4096.0) as usize;
            let desired = DeviceAttrs {
                format: PcmFormat::new(SampleFormat::I16, channels, sample_rate),
                buffer_bytes,
            };

            let mut last_failure = None;
            for name in &names {
                let backend = backend_by_name(name)?;
                match Device::open(backend, OpenMode::Output, &desired) {
                    Ok(device) => return Ok(device),
                    Err(e) => {
                        log::warn!("backend {:?} failed to open: {}", name, e);
                        last_failure = Some(e);
                    }
                }
            }
            Err(last_failure
                .unwrap_or_else(|| ResonaError::Device("no backends configured".into())))
        })();
        self.finish(result)
    }

    // --- buffers ------------------------------------------------------------

    /// Creates an empty buffer in the shared store.
    pub fn create_buffer(&self) -> BufferId {
        // Pool resizing happens under the coarse lock, then the store lock.
        let _table = self.shared.contexts.lock().unwrap();
        self.shared.buffers.lock().unwrap().create()
    }

    /// Fills a buffer with interleaved PCM data.
    pub fn fill_buffer(&self, id: BufferId, bytes: &[u8], pcm: PcmFormat) -> Result<()> {
        let result = self.shared.buffers.lock().unwrap().fill(id, bytes, pcm);
        self.finish(result)
    }

    /// Attaches a streaming pull callback to a buffer.
    pub fn set_buffer_callback(
        &self,
        id: BufferId,
        pcm: PcmFormat,
        fill: FillCallback,
        destroy: Option<DestroyCallback>,
    ) -> Result<()> {
        let result = self
            .shared
            .buffers
            .lock()
            .unwrap()
            .set_callback(id, pcm, fill, destroy);
        self.finish(result)
    }

    /// Derived usage state of a buffer.
    pub fn buffer_state(&self, id: BufferId) -> Result<BufferState> {
        let result = self.shared.buffers.lock().unwrap().state(id);
        self.finish(result)
    }

    /// Deletes an unreferenced buffer.
    pub fn delete_buffer(&self, id: BufferId) -> Result<()> {
        let _table = self.shared.contexts.lock().unwrap();
        let result = self.shared.buffers.lock().unwrap().delete(id);
        self.finish(result)
    }

    // --- contexts -----------------------------------------------------------

    /// Creates a context bound to `device`.
    ///
    /// The first asynchronous context starts the shared mixer thread.
    pub fn create_context(&self, device: Device, attrs: ContextAttrs) -> Arc<Context> {
        let context = {
            let mut table = self.shared.contexts.lock().unwrap();
            let id = ContextId(table.next_id);
            table.next_id += 1;
            let context = Arc::new(Context::new(
                id,
                device,
                attrs,
                self.shared.buffers.clone(),
                self.shared.events_tx.clone(),
            ));
            table.map.insert(id, context.clone());
            log::info!("created {} (synchronous: {})", id, attrs.synchronous);
            context
        };

        if !attrs.synchronous {
            self.ensure_mixer_thread();
        }
        context
    }

    pub fn context(&self, id: ContextId) -> Option<Arc<Context>> {
        self.shared.contexts.lock().unwrap().map.get(&id).cloned()
    }

    pub fn context_ids(&self) -> Vec<ContextId> {
        self.shared
            .contexts
            .lock()
            .unwrap()
            .map
            .keys()
            .copied()
            .collect()
    }

    /// Destroys a context. Destroying the last one tears the mixer thread
    /// down, blocking until it confirms termination.
    pub fn destroy_context(&self, id: ContextId) -> Result<()> {
        let result = (|| {
            let remaining = {
                let mut table = self.shared.contexts.lock().unwrap();
                if table.map.remove(&id).is_none() {
                    return Err(ResonaError::invalid_handle(format!(
                        "{} does not exist",
                        id
                    )));
                }
                log::info!("destroyed {}", id);
                table.map.len()
            };
            if remaining == 0 {
                self.stop_mixer_thread();
            }
            Ok(())
        })();
        self.finish(result)
    }

    // --- mixer scheduling ---------------------------------------------------

    /// Atomically suspends the mixer thread at its next iteration boundary.
    pub fn suspend_mixer(&self) {
        self.shared.pause.suspend();
        log::debug!("mixer suspended");
    }

    pub fn resume_mixer(&self) {
        self.shared.pause.resume();
        log::debug!("mixer resumed");
    }

    /// Drains pending engine events.
    pub fn poll_events(&self) -> Vec<EngineEvent> {
        self.events_rx.try_iter().collect()
    }

    // --- extensions ---------------------------------------------------------

    /// Registers a named filter factory for later installation.
    pub fn register_extension_filter(
        &self,
        name: &str,
        factory: crate::extensions::FilterFactory,
    ) -> Result<()> {
        let result = self
            .extensions
            .lock()
            .unwrap()
            .register_filter(name, factory);
        self.finish(result)
    }

    /// Instantiates a registered extension filter and splices it into a
    /// context's chain.
    pub fn install_extension_filter(
        &self,
        context: ContextId,
        filter: &str,
        position: FilterPosition,
    ) -> Result<()> {
        let result = (|| {
            let context = self.context(context).ok_or_else(|| {
                ResonaError::invalid_handle(format!("{} does not exist", context))
            })?;
            let stage = self.extensions.lock().unwrap().instantiate(filter)?;
            context.install_filter(position, stage)
        })();
        self.finish(result)
    }

    /// Runs `f` with the extension registry, e.g. to let a plugin loader
    /// register filters.
    pub fn with_extensions<T>(&self, f: impl FnOnce(&mut ExtensionRegistry) -> T) -> T {
        f(&mut self.extensions.lock().unwrap())
    }

    // --- mixer thread -------------------------------------------------------

    fn ensure_mixer_thread(&self) {
        let mut slot = self.mixer_thread.lock().unwrap();
        if slot.is_some() {
            return;
        }
        self.shared.shutdown.store(false, Ordering::SeqCst);
        let shared = self.shared.clone();
        let handle = std::thread::Builder::new()
            .name("resona-mixer".into())
            .spawn(move || mixer_loop(shared))
            .expect("failed to spawn the mixer thread");
        *slot = Some(handle);
        let _ = self.shared.events_tx.send(EngineEvent::MixerStarted);
        log::info!("mixer thread started");
    }

    fn stop_mixer_thread(&self) {
        let mut slot = self.mixer_thread.lock().unwrap();
        let Some(handle) = slot.take() else {
            return;
        };
        self.shared.shutdown.store(true, Ordering::SeqCst);
        // Wake it if it is parked on the pause gate.
        self.shared.pause.resume();

        // Bounded poll/backoff, then join; a non-responsive thread is
        // detached rather than deadlocking the destroyer.
        let deadline = Instant::now() + JOIN_TIMEOUT;
        while !handle.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        if handle.is_finished() {
            let _ = handle.join();
            log::info!("mixer thread joined");
        } else {
            log::error!("mixer thread did not exit in time; detaching");
        }
        self.shared.shutdown.store(false, Ordering::SeqCst);
        let _ = self.shared.events_tx.send(EngineEvent::MixerStopped);
    }
}

impl Default for ResonaEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ResonaEngine {
    fn drop(&mut self) {
        self.stop_mixer_thread();
        self.shared.contexts.lock().unwrap().map.clear();
        // Run outstanding streaming-buffer destroy hooks.
        self.shared.buffers.lock().unwrap().destroy_all();
        log::info!("engine destroyed");
    }
}

/// Resolves a config-named backend.
fn backend_by_name(name: &str) -> Result<Box<dyn Backend>> {
    match name {
        "null" => Ok(Box::new(NullBackend::new())),
        #[cfg(feature = "cpal")]
        "cpal" => Ok(Box::new(crate::backends::CpalBackend::new())),
        other => Err(ResonaError::invalid_enum(format!(
            "unknown backend {:?}",
            other
        ))),
    }
}

fn mixer_loop(shared: Arc<EngineShared>) {
    log::debug!("mixer loop running");
    while !shared.shutdown.load(Ordering::SeqCst) {
        shared.pause.wait_if_paused();
        if shared.shutdown.load(Ordering::SeqCst) {
            break;
        }

        // Snapshot under the coarse lock, mix without it.
        let contexts: Vec<Arc<Context>> = {
            let table = shared.contexts.lock().unwrap();
            table
                .map
                .values()
                .filter(|context| !context.is_synchronous())
                .cloned()
                .collect()
        };

        let mut any_active = false;
        for context in &contexts {
            if crate::mixer::mix_quantum(context) {
                any_active = true;
            }
        }

        if !any_active {
            // Nothing playing: idle instead of spinning. Device
            // backpressure paces the active case.
            std::thread::sleep(Duration::from_millis(2));
        }
    }
    log::debug!("mixer loop exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{MixParams, StageCtx, TimeFilter};

    fn null_device(engine: &ResonaEngine) -> Device {
        engine
            .open_device(
                Box::new(NullBackend::new()),
                OpenMode::Output,
                &DeviceAttrs::default(),
            )
            .unwrap()
    }

    #[test]
    fn last_context_tears_the_mixer_thread_down() {
        let engine = ResonaEngine::new();
        let context = engine.create_context(null_device(&engine), ContextAttrs::default());
        let events = engine.poll_events();
        assert!(events.contains(&EngineEvent::MixerStarted));

        engine.destroy_context(context.id()).unwrap();
        let events = engine.poll_events();
        assert!(events.contains(&EngineEvent::MixerStopped));
        assert!(engine.context_ids().is_empty());
    }

    #[test]
    fn synchronous_contexts_do_not_start_the_thread() {
        let engine = ResonaEngine::new();
        let context = engine.create_context(
            null_device(&engine),
            ContextAttrs { synchronous: true },
        );
        assert!(engine.poll_events().is_empty());
        engine.destroy_context(context.id()).unwrap();
    }

    #[test]
    fn destroying_an_unknown_context_records_the_error() {
        let engine = ResonaEngine::new();
        assert!(engine.destroy_context(ContextId(99)).is_err());
        assert_eq!(engine.poll_error(), Some(ErrorCode::InvalidHandle));
        // Cleared on read.
        assert_eq!(engine.poll_error(), None);
    }

    #[test]
    fn config_bindings_select_the_backend() {
        let engine = ResonaEngine::new();
        let bindings = Bindings::eval_source(
            "(define devices '(null)) (define sampling-rate 22050) (define speaker-channels 1)",
        )
        .unwrap();
        let device = engine.open_device_from_config(&bindings).unwrap();
        assert_eq!(device.backend_name(), "null");
        assert_eq!(device.attrs().format.sample_rate, 22_050);
        assert_eq!(device.attrs().format.channels, 1);
    }

    #[test]
    fn unknown_backend_names_are_invalid_enums() {
        let engine = ResonaEngine::new();
        let bindings = Bindings::eval_source("(define devices '(winmm))").unwrap();
        let err = engine.open_device_from_config(&bindings).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::InvalidEnum));
        assert_eq!(engine.poll_error(), Some(ErrorCode::InvalidEnum));
    }

    #[test]
    fn extension_filters_install_into_context_chains() {
        struct Reverb;
        impl TimeFilter for Reverb {
            fn name(&self) -> &str {
                "reverb"
            }
            fn apply(&self, _: &StageCtx<'_>, out: &mut MixParams) {
                out.gain *= 0.9;
            }
        }

        let engine = ResonaEngine::new();
        let context = engine.create_context(
            null_device(&engine),
            ContextAttrs { synchronous: true },
        );
        engine
            .register_extension_filter("reverb", Box::new(|| Box::new(Reverb)))
            .unwrap();
        engine
            .install_extension_filter(
                context.id(),
                "reverb",
                FilterPosition::After("panning".into()),
            )
            .unwrap();
        assert!(context.filter_names().contains(&"reverb".to_string()));

        let err = engine
            .install_extension_filter(context.id(), "chorus", FilterPosition::End)
            .unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::InvalidEnum));
        engine.destroy_context(context.id()).unwrap();
    }

    #[test]
    fn buffer_lifecycle_goes_through_the_shared_store() {
        let engine = ResonaEngine::new();
        let pcm = PcmFormat::new(SampleFormat::F32, 1, 44_100);
        let bid = engine.create_buffer();
        engine
            .fill_buffer(bid, &crate::format::encode_mono_frames(&[0.5; 8], &pcm), pcm)
            .unwrap();
        assert_eq!(engine.buffer_state(bid).unwrap(), BufferState::Unused);

        let context = engine.create_context(
            null_device(&engine),
            ContextAttrs { synchronous: true },
        );
        let sid = context.create_source();
        context.enqueue_buffers(sid, &[bid]).unwrap();
        assert_eq!(engine.buffer_state(bid).unwrap(), BufferState::Pending);

        // Referenced buffers refuse deletion.
        assert!(engine.delete_buffer(bid).is_err());
        context.destroy_source(sid).unwrap();
        engine.delete_buffer(bid).unwrap();
        engine.destroy_context(context.id()).unwrap();
    }

    #[test]
    fn suspend_gates_the_mixer_at_iteration_boundaries() {
        let engine = ResonaEngine::new();
        let context = engine.create_context(null_device(&engine), ContextAttrs::default());

        engine.suspend_mixer();
        // The gate itself must not deadlock resume.
        engine.resume_mixer();
        engine.destroy_context(context.id()).unwrap();
    }
}
