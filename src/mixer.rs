//! Mixer engine: one quantum at a time.
//!
//! For each non-suspended context, a mix quantum walks every playing source,
//! folds the filter chain into mixing parameters, pulls source data through
//! the fractional-step resampler into a mono window, accumulates the window
//! into the interleaved channel buffer, then encodes and writes the result
//! to the bound device. The context lock is held while iterating and
//! released before the device write; partial writes are retried and write
//! failures never stop the loop.

use crate::buffer::{BufferData, BufferId, BufferStore};
use crate::context::{Context, ContextId, ContextState};
use crate::events::EngineEvent;
use crate::filter::StageCtx;
use crate::format::encode_samples;
use crate::listener::speaker_geometry;
use crate::math::lerp;
use crate::source::{Advance, Source, SourceId, SourceState};
use std::sync::Arc;
use std::time::Duration;

/// Per-context mixer pipeline position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixPhase {
    /// No playing sources.
    Idle,
    /// Walking sources and accumulating.
    Iterating,
    /// The accumulated quantum was handed to the device.
    Flushed,
}

/// Source data for the current queue entry, detached from the store borrow.
enum Window {
    Empty,
    Static(Arc<[f32]>),
    Streaming,
}

/// Runs one mix quantum for `ctx`. Returns true if any source produced
/// audio (used by the mixer thread for idle pacing).
pub(crate) fn mix_quantum(ctx: &Context) -> bool {
    let mut events: Vec<EngineEvent> = Vec::new();
    let mut bytes = Vec::new();

    let mixed = {
        let mut state = ctx.state.lock().unwrap();
        if state.suspended || state.quantum_frames == 0 {
            return false;
        }

        if state.speakers.is_none() {
            match speaker_geometry(&state.listener, state.stream.channels) {
                Ok(speakers) => state.speakers = Some(speakers),
                Err(e) => {
                    log::error!("{}: speaker geometry failed: {}", ctx.id, e);
                    return false;
                }
            }
        }

        let playing: Vec<SourceId> = state
            .sources
            .iter()
            .filter(|(_, source)| source.state() == SourceState::Playing)
            .map(|(&sid, _)| sid)
            .collect();
        if playing.is_empty() {
            state.phase = MixPhase::Idle;
            return false;
        }
        state.phase = MixPhase::Iterating;

        let channels = state.stream.channels as usize;
        let frames = state.quantum_frames;
        let device_rate = state.stream.sample_rate;
        let sample_format = state.stream.sample_format;
        let mut acc = vec![0.0f32; frames * channels];
        let mut mono = vec![0.0f32; frames];

        let mut store = ctx.buffers.lock().unwrap();
        let ContextState {
            params,
            listener,
            sources,
            chain,
            speakers,
            ..
        } = &mut *state;
        let speakers = speakers.as_ref().expect("computed above");

        for sid in playing {
            let Some(source) = sources.get_mut(&sid) else {
                continue;
            };

            let base_step = base_step_for(source, &store, device_rate);
            let mix = chain.run(&StageCtx {
                source: &*source,
                listener,
                params,
                speakers,
                channels: channels as u16,
                base_step,
            });

            mono.fill(0.0);
            let produced =
                fill_mono_window(ctx.id, source, &mut store, &mut mono, mix.step, &mut events);

            for frame in 0..produced {
                let sample = mono[frame] * mix.gain;
                for (channel, &channel_gain) in
                    mix.channel_gains.iter().enumerate().take(channels)
                {
                    acc[frame * channels + channel] += sample * channel_gain;
                }
            }
        }
        drop(store);

        encode_samples(&acc, sample_format, &mut bytes);
        true
    };

    if mixed {
        write_quantum(ctx, &bytes, &mut events);
        ctx.state.lock().unwrap().phase = MixPhase::Flushed;
    }

    for event in events {
        let _ = ctx.events.send(event);
    }
    mixed
}

/// Source frames per output frame before pitch and doppler: the current
/// buffer's rate over the device rate. Queue members are format-identical,
/// so the ratio is stable across the quantum.
fn base_step_for(source: &Source, store: &BufferStore, device_rate: u32) -> f64 {
    source
        .current_buffer()
        .and_then(|bid| store.get(bid))
        .and_then(|buffer| buffer.sample_rate())
        .map(|rate| rate as f64 / device_rate as f64)
        .unwrap_or(1.0)
}

/// Pulls up to `out.len()` mono frames out of the source's queue, advancing
/// the buffer state machine across entry boundaries. Returns the number of
/// frames produced.
fn fill_mono_window(
    cid: ContextId,
    source: &mut Source,
    store: &mut BufferStore,
    out: &mut [f32],
    step: f64,
    events: &mut Vec<EngineEvent>,
) -> usize {
    let mut produced = 0;
    let mut fruitless_wraps = 0u32;

    while produced < out.len() && source.state() == SourceState::Playing {
        let Some(bid) = source.current_buffer() else {
            // The queue invariant broke; fatal to this source only.
            log::error!("{}: {} is playing without a current buffer", cid, source.id);
            force_stop(cid, source, store, events);
            break;
        };
        let window = match store.get(bid) {
            Some(buffer) => match &buffer.data {
                BufferData::Empty => Window::Empty,
                BufferData::Static(samples) => Window::Static(samples.clone()),
                BufferData::Callback { .. } => Window::Streaming,
            },
            None => {
                log::error!("{}: current buffer {} vanished from {}", cid, bid, source.id);
                force_stop(cid, source, store, events);
                break;
            }
        };

        let before = produced;
        let finished = match window {
            Window::Empty => Some(0.0),
            Window::Static(samples) => {
                consume_static(source, &samples, out, &mut produced, step)
            }
            Window::Streaming => consume_streaming(source, store, bid, out, &mut produced, step),
        };

        let Some(leftover) = finished else {
            break;
        };
        match source.advance(store, leftover) {
            Advance::Promoted => {}
            Advance::Looped => {
                events.push(EngineEvent::SourceLooped {
                    context: cid,
                    source: source.id,
                });
                if produced == before {
                    fruitless_wraps += 1;
                    // A looping queue with no data would spin forever.
                    if fruitless_wraps > 2 {
                        break;
                    }
                } else {
                    fruitless_wraps = 0;
                }
            }
            Advance::Exhausted => {
                events.push(EngineEvent::SourceCompleted {
                    context: cid,
                    source: source.id,
                });
            }
        }
    }

    produced
}

/// Interpolates static samples into `out` starting at the source cursor.
/// Returns the fractional overrun past the buffer end once it is reached,
/// carried into the next entry so resampling stays continuous.
fn consume_static(
    source: &mut Source,
    samples: &[f32],
    out: &mut [f32],
    produced: &mut usize,
    step: f64,
) -> Option<f64> {
    let len = samples.len();
    if len == 0 {
        return Some(0.0);
    }

    while *produced < out.len() {
        let position = source.cursor;
        let index = position as usize;
        if index >= len {
            break;
        }
        let fraction = (position - index as f64) as f32;
        let a = samples[index];
        let b = samples[(index + 1).min(len - 1)];
        out[*produced] = lerp(a, b, fraction);
        *produced += 1;
        source.cursor += step;
    }

    if source.cursor as usize >= len {
        Some(source.cursor - len as f64)
    } else {
        None
    }
}

/// Pulls from the streaming callback into the source's carry window and
/// interpolates from there. Returns the leftover fraction once the callback
/// signalled end-of-data and the carry is drained.
fn consume_streaming(
    source: &mut Source,
    store: &mut BufferStore,
    bid: BufferId,
    out: &mut [f32],
    produced: &mut usize,
    step: f64,
) -> Option<f64> {
    let remaining = out.len() - *produced;
    if remaining == 0 {
        return None;
    }

    // Frames needed in the carry to interpolate the whole remainder.
    let needed = (source.stream_frac + (remaining as f64 - 1.0) * step) as usize + 2;
    if !source.stream_ended && source.stream_carry.len() < needed {
        let mut chunk = vec![0.0f32; needed - source.stream_carry.len()];
        let got = match store.get_mut_data(bid) {
            Some(BufferData::Callback { fill, .. }) => fill(source.id, bid, &mut chunk),
            _ => 0,
        };
        let got = got.min(chunk.len());
        source.stream_carry.extend_from_slice(&chunk[..got]);
        if got < chunk.len() {
            source.stream_ended = true;
        }
    }

    let carry_len = source.stream_carry.len();
    let mut position = source.stream_frac;
    while *produced < out.len() {
        let index = position as usize;
        if index >= carry_len {
            break;
        }
        if !source.stream_ended && index + 1 >= carry_len {
            break;
        }
        let fraction = (position - index as f64) as f32;
        let a = source.stream_carry[index];
        let b = source.stream_carry[(index + 1).min(carry_len - 1)];
        out[*produced] = lerp(a, b, fraction);
        *produced += 1;
        position += step;
    }

    let consumed = (position as usize).min(source.stream_carry.len());
    source.stream_carry.drain(..consumed);
    source.stream_frac = position - consumed as f64;

    if source.stream_ended && source.stream_carry.is_empty() {
        Some(0.0)
    } else {
        None
    }
}

fn force_stop(
    cid: ContextId,
    source: &mut Source,
    store: &mut BufferStore,
    events: &mut Vec<EngineEvent>,
) {
    source.stop(store);
    events.push(EngineEvent::SourceStopped {
        context: cid,
        source: source.id,
    });
}

/// Writes a quantum to the bound device, retrying partial writes. Failures
/// are reported as events; dropped audio is preferred over a dead mixer.
fn write_quantum(ctx: &Context, bytes: &[u8], events: &mut Vec<EngineEvent>) {
    let mut device = ctx.device.lock().unwrap();
    let mut written = 0;
    while written < bytes.len() {
        match device.write(&bytes[written..]) {
            Ok(0) => {
                // Backend full: backpressure from the device buffer.
                std::thread::sleep(Duration::from_micros(500));
            }
            Ok(count) => written += count,
            Err(e) => {
                log::warn!("{}: device write failed: {}", ctx.id, e);
                events.push(EngineEvent::DeviceError {
                    context: ctx.id,
                    message: e.to_string(),
                });
                break;
            }
        }
    }
}
