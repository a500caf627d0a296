//! # Resona
//!
//! A software 3D positional-audio mixing engine: independently controlled
//! sources (position, velocity, pitch, gain, a queue of PCM buffers) are
//! mixed into one interleaved stream for an output device, continuously and
//! in real time.
//!
//! ## Quick start
//!
//! ```no_run
//! use resona::{
//!     ContextAttrs, DeviceAttrs, NullBackend, OpenMode, PcmFormat, ResonaEngine, SampleFormat,
//!     Vec3,
//! };
//!
//! let engine = ResonaEngine::new();
//!
//! // Bind a context to an output device.
//! let device = engine.open_device(
//!     Box::new(NullBackend::new()),
//!     OpenMode::Output,
//!     &DeviceAttrs::default(),
//! )?;
//! let context = engine.create_context(device, ContextAttrs::default());
//!
//! // Fill a buffer and queue it on a source.
//! let pcm = PcmFormat::new(SampleFormat::F32, 1, 44_100);
//! let samples: Vec<f32> = (0..44_100)
//!     .map(|i| (i as f32 * 440.0 * std::f32::consts::TAU / 44_100.0).sin())
//!     .collect();
//! let bytes = resona::format::encode_mono_frames(&samples, &pcm);
//! let buffer = engine.create_buffer();
//! engine.fill_buffer(buffer, &bytes, pcm)?;
//!
//! let source = context.create_source();
//! context.set_source_position(source, Vec3::new(5.0, 0.0, 0.0))?;
//! context.enqueue_buffers(source, &[buffer])?;
//! context.play(source)?;
//!
//! // Poll completion events while the mixer thread runs.
//! for event in engine.poll_events() {
//!     println!("{:?}", event);
//! }
//! # Ok::<(), resona::ResonaError>(())
//! ```
//!
//! ## Architecture
//!
//! - **[`ResonaEngine`]**: process-wide state: context table, shared buffer
//!   store, extension registry, and the background mixer thread.
//! - **[`Context`]**: one audio universe: a listener, a source pool, mixing
//!   parameters, a filter chain, and a bound [`Device`].
//! - **Buffer store**: PCM containers whose usage state (unused, pending,
//!   processed) is derived from current/queue reference sets.
//! - **Filter pipeline**: distance, cone, pitch, doppler, gain clamp,
//!   panning, and listener gain stages in a name-addressable chain.
//! - **Mixer**: per-quantum iteration, either on the shared background
//!   thread (asynchronous contexts) or inside [`Context::process`]
//!   (synchronous contexts).
//!
//! Application threads mutate context state under the context lock; the
//! mixer takes the same lock per quantum, so mix iterations for one context
//! never overlap.

pub mod backends;
pub mod buffer;
pub mod config;
pub mod context;
pub mod device;
pub mod engine;
pub mod error;
pub mod events;
pub mod extensions;
pub mod filter;
pub mod format;
pub mod listener;
pub mod loader;
pub mod math;
mod mixer;
pub mod source;

#[cfg(feature = "cpal")]
pub use backends::CpalBackend;
pub use buffer::{BufferId, BufferState, DestroyCallback, FillCallback};
pub use config::{Bindings, Value};
pub use context::{Context, ContextAttrs, ContextId, ContextParams, FilterPosition};
pub use device::{Backend, Device, DeviceAttrs, NullBackend, OpenMode};
pub use engine::ResonaEngine;
pub use error::{ErrorCode, ResonaError, Result};
pub use events::EngineEvent;
pub use extensions::{ExtensionRegistry, FilterFactory, PluginLoader, StaticLoader};
pub use filter::{DistanceModel, FilterChain, MixParams, StageCtx, TimeFilter};
pub use format::{PcmFormat, SampleFormat};
pub use listener::Listener;
pub use loader::{LoadedAudio, load_audio_file};
pub use math::{Orientation, Quat, Vec3};
pub use mixer::MixPhase;
pub use source::{SourceId, SourceState};
