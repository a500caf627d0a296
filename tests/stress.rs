//! Cross-component scenarios: the full queue/play/unqueue cycle against a
//! running mixer, and the state-machine round trips the engine guarantees.

use anyhow::Result;
use resona::{
    Backend, BufferId, BufferState, Context, ContextAttrs, Device, DeviceAttrs, EngineEvent,
    OpenMode, PcmFormat, ResonaEngine, SampleFormat, SourceState, format,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Output backend that accepts everything immediately, so the mixer thread
/// free-runs and contention with the application threads is maximal.
struct SinkBackend;

impl Backend for SinkBackend {
    fn name(&self) -> &str {
        "sink"
    }
    fn open(&mut self, _mode: OpenMode) -> resona::Result<()> {
        Ok(())
    }
    fn close(&mut self) {}
    fn set_attributes(&mut self, desired: &DeviceAttrs) -> resona::Result<DeviceAttrs> {
        Ok(*desired)
    }
    fn write(&mut self, bytes: &[u8]) -> resona::Result<usize> {
        Ok(bytes.len())
    }
    fn read(&mut self, _out: &mut [u8]) -> resona::Result<usize> {
        Ok(0)
    }
}

fn sink_device(engine: &ResonaEngine) -> Device {
    engine
        .open_device(
            Box::new(SinkBackend),
            OpenMode::Output,
            &DeviceAttrs {
                format: PcmFormat::new(SampleFormat::F32, 2, 44_100),
                buffer_bytes: 256 * 8,
            },
        )
        .unwrap()
}

fn filled_buffer(engine: &ResonaEngine, seed: usize, frames: usize) -> BufferId {
    let pcm = PcmFormat::new(SampleFormat::F32, 1, 44_100);
    let samples: Vec<f32> = (0..frames)
        .map(|i| ((seed * frames + i) as f32 * 0.001).sin() * 0.1)
        .collect();
    let bid = engine.create_buffer();
    engine
        .fill_buffer(bid, &format::encode_mono_frames(&samples, &pcm), pcm)
        .unwrap();
    bid
}

fn drain_queue(context: &Context, sid: resona::SourceId) {
    context.stop(sid).unwrap();
    let processed = context.processed_buffer_count(sid).unwrap();
    context.unqueue_buffers(sid, processed).unwrap();
}

#[test]
fn concurrent_queue_and_mix_stress() -> Result<()> {
    init_logging();
    const SOURCES: usize = 8;
    const CYCLES: usize = 1_250;
    const BUFFERS_PER_SOURCE: usize = 4;

    let engine = ResonaEngine::new();
    let context = engine.create_context(sink_device(&engine), ContextAttrs::default());

    let mut all_buffers = Vec::new();
    let mut workers = Vec::new();
    for worker in 0..SOURCES {
        let bids: Vec<BufferId> = (0..BUFFERS_PER_SOURCE)
            .map(|n| filled_buffer(&engine, worker * BUFFERS_PER_SOURCE + n, 64))
            .collect();
        all_buffers.extend_from_slice(&bids);

        let context: Arc<Context> = context.clone();
        workers.push(std::thread::spawn(move || {
            let sid = context.create_source();
            for cycle in 0..CYCLES {
                context
                    .enqueue_buffers(sid, &[bids[cycle % BUFFERS_PER_SOURCE]])
                    .unwrap();
                if context.source_state(sid).unwrap() != SourceState::Playing {
                    context.play(sid).unwrap();
                }
                // Unqueue whatever the mixer has consumed so far; the count
                // can only grow between the read and the call.
                let processed = context.processed_buffer_count(sid).unwrap();
                if processed > 0 {
                    context.unqueue_buffers(sid, processed).unwrap();
                }
                if cycle % 64 == 0 {
                    std::thread::yield_now();
                }
            }
            drain_queue(&context, sid);
            context.destroy_source(sid).unwrap();
        }));
    }

    for worker in workers {
        worker.join().expect("worker panicked");
    }

    // Every reference was released, so the derived state is Unused and
    // deletion succeeds for every buffer.
    for bid in all_buffers {
        assert_eq!(engine.buffer_state(bid)?, BufferState::Unused);
        engine.delete_buffer(bid)?;
    }

    engine.destroy_context(context.id())?;
    Ok(())
}

#[test]
fn play_pause_play_round_trip_keeps_position() -> Result<()> {
    init_logging();
    let engine = ResonaEngine::new();
    let context = engine.create_context(
        sink_device(&engine),
        ContextAttrs { synchronous: true },
    );

    let first = filled_buffer(&engine, 1, 256);
    let second = filled_buffer(&engine, 2, 256);
    let sid = context.create_source();
    context.enqueue_buffers(sid, &[first, second])?;

    context.play(sid)?;
    context.process(); // consumes the 256-frame quantum: first buffer done
    assert_eq!(context.processed_buffer_count(sid)?, 1);

    context.pause(sid)?;
    assert_eq!(context.source_state(sid)?, SourceState::Paused);
    context.play(sid)?;
    assert_eq!(context.source_state(sid)?, SourceState::Playing);
    // Resume did not rewind: the first buffer stays consumed.
    assert_eq!(context.processed_buffer_count(sid)?, 1);

    context.process();
    assert_eq!(context.source_state(sid)?, SourceState::Stopped);

    engine.destroy_context(context.id())?;
    Ok(())
}

#[test]
fn stop_always_wins_regardless_of_looping() -> Result<()> {
    init_logging();
    let engine = ResonaEngine::new();
    let context = engine.create_context(
        sink_device(&engine),
        ContextAttrs { synchronous: true },
    );

    let bid = filled_buffer(&engine, 3, 64);
    let sid = context.create_source();
    context.enqueue_buffers(sid, &[bid])?;
    context.set_source_looping(sid, true)?;

    context.play(sid)?;
    context.process();
    assert_eq!(context.source_state(sid)?, SourceState::Playing);

    context.stop(sid)?;
    assert_eq!(context.source_state(sid)?, SourceState::Stopped);

    engine.destroy_context(context.id())?;
    Ok(())
}

#[test]
fn completion_events_reach_the_application() -> Result<()> {
    init_logging();
    let engine = ResonaEngine::new();
    let context = engine.create_context(sink_device(&engine), ContextAttrs::default());

    let bid = filled_buffer(&engine, 4, 64);
    let sid = context.create_source();
    context.enqueue_buffers(sid, &[bid])?;
    context.play(sid)?;

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut completed = false;
    while Instant::now() < deadline && !completed {
        completed = engine.poll_events().iter().any(|event| {
            matches!(event, EngineEvent::SourceCompleted { source, .. } if *source == sid)
        });
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(completed, "no completion event within the deadline");
    assert_eq!(context.source_state(sid)?, SourceState::Stopped);

    engine.destroy_context(context.id())?;
    Ok(())
}

#[test]
fn capture_reads_through_the_bound_input_device() -> Result<()> {
    init_logging();
    let engine = ResonaEngine::new();
    let context = engine.create_context(
        sink_device(&engine),
        ContextAttrs { synchronous: true },
    );

    // No input bound yet.
    let mut captured = [0xffu8; 32];
    assert!(context.capture(&mut captured).is_err());

    let input = engine.open_device(
        Box::new(resona::NullBackend::new()),
        OpenMode::Input,
        &DeviceAttrs::default(),
    )?;
    context.bind_input_device(input)?;
    let read = context.capture(&mut captured)?;
    assert_eq!(read, captured.len());
    assert!(captured.iter().all(|&b| b == 0));

    engine.destroy_context(context.id())?;
    Ok(())
}

#[test]
fn dequeue_precondition_holds_under_the_public_api() -> Result<()> {
    init_logging();
    let engine = ResonaEngine::new();
    let context = engine.create_context(
        sink_device(&engine),
        ContextAttrs { synchronous: true },
    );

    let bid = filled_buffer(&engine, 5, 512);
    let sid = context.create_source();
    context.enqueue_buffers(sid, &[bid])?;
    context.play(sid)?;

    // Still pending consumption: dequeue must fail and leave the queue.
    assert!(context.unqueue_buffers(sid, 1).is_err());
    assert_eq!(context.poll_error(), Some(resona::ErrorCode::InvalidOperation));
    assert_eq!(context.queued_buffer_count(sid)?, 1);
    assert_eq!(engine.buffer_state(bid)?, BufferState::Processed);

    engine.destroy_context(context.id())?;
    Ok(())
}
