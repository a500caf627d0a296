//! cpal output adapter.
//!
//! Bridges the engine's blocking write model to cpal's pull callback with a
//! lock-free ring: `write` pushes f32 samples, the stream callback pops them
//! and converts to the device sample type, filling silence on underrun. A
//! full ring is the backpressure signal the mixer paces itself on.
//!
//! `cpal::Stream` is not `Send`, so the stream lives on a small holder
//! thread that builds it, keeps it alive, and services pause/resume
//! commands.

use crate::device::{Backend, DeviceAttrs, OpenMode};
use crate::error::{ResonaError, Result};
use crate::format::{PcmFormat, SampleFormat};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SizedSample};
use crossbeam_channel::{Receiver, Sender, bounded};
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::thread::JoinHandle;

enum StreamCommand {
    Pause,
    Resume,
    Shutdown,
}

/// Output backend driving the host's default cpal device.
pub struct CpalBackend {
    opened: bool,
    producer: Option<HeapProd<f32>>,
    control: Option<Sender<StreamCommand>>,
    holder: Option<JoinHandle<()>>,
}

impl CpalBackend {
    pub fn new() -> Self {
        Self {
            opened: false,
            producer: None,
            control: None,
            holder: None,
        }
    }

    fn shutdown_stream(&mut self) {
        if let Some(control) = self.control.take() {
            let _ = control.send(StreamCommand::Shutdown);
        }
        if let Some(holder) = self.holder.take() {
            let _ = holder.join();
        }
        self.producer = None;
    }
}

impl Default for CpalBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for CpalBackend {
    fn name(&self) -> &str {
        "cpal"
    }

    fn open(&mut self, mode: OpenMode) -> Result<()> {
        if mode != OpenMode::Output {
            return Err(ResonaError::Device(
                "cpal backend only supports output".into(),
            ));
        }
        self.opened = true;
        Ok(())
    }

    fn close(&mut self) {
        self.shutdown_stream();
        self.opened = false;
    }

    fn set_attributes(&mut self, desired: &DeviceAttrs) -> Result<DeviceAttrs> {
        if !self.opened {
            return Err(ResonaError::Device("cpal backend is not open".into()));
        }
        self.shutdown_stream();

        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| ResonaError::Device("no default output device available".into()))?;
        let default_config = device
            .default_output_config()
            .map_err(|e| ResonaError::Device(format!("failed to get default config: {}", e)))?;

        // Meet-or-exceed: the device keeps its native rate and channel
        // count; the caller re-checks what it got. The engine always feeds
        // f32 and the callback converts to the device sample type.
        let actual_format = PcmFormat::new(
            SampleFormat::F32,
            default_config.channels(),
            default_config.sample_rate().0,
        );
        let frame_bytes = actual_format.bytes_per_frame();
        let buffer_bytes = (desired.buffer_bytes.max(frame_bytes) / frame_bytes) * frame_bytes;
        let quantum_samples = buffer_bytes / SampleFormat::F32.bytes_per_sample();

        let config = cpal::StreamConfig {
            channels: actual_format.channels,
            sample_rate: cpal::SampleRate(actual_format.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        // Room for a few quanta so the mixer can run ahead of the callback.
        let ring = HeapRb::<f32>::new(quantum_samples * 4);
        let (producer, consumer) = ring.split();

        let (control_tx, control_rx) = bounded::<StreamCommand>(4);
        let (ready_tx, ready_rx) = bounded::<std::result::Result<(), String>>(1);
        let sample_format = default_config.sample_format();

        let holder = std::thread::Builder::new()
            .name("resona-cpal".into())
            .spawn(move || {
                stream_holder(device, config, sample_format, consumer, control_rx, ready_tx);
            })
            .map_err(|e| ResonaError::Device(format!("failed to spawn stream thread: {}", e)))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(message)) => {
                let _ = holder.join();
                return Err(ResonaError::Device(message));
            }
            Err(_) => {
                let _ = holder.join();
                return Err(ResonaError::Device("stream thread died during setup".into()));
            }
        }

        self.producer = Some(producer);
        self.control = Some(control_tx);
        self.holder = Some(holder);

        Ok(DeviceAttrs {
            format: actual_format,
            buffer_bytes,
        })
    }

    fn write(&mut self, bytes: &[u8]) -> Result<usize> {
        let producer = self
            .producer
            .as_mut()
            .ok_or_else(|| ResonaError::Device("cpal stream is not configured".into()))?;
        if bytes.len() % 4 != 0 {
            return Err(ResonaError::invalid_value(
                "cpal write requires whole f32 samples",
            ));
        }

        let samples: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|quad| f32::from_le_bytes([quad[0], quad[1], quad[2], quad[3]]))
            .collect();
        let pushed = producer.push_slice(&samples);
        Ok(pushed * 4)
    }

    fn read(&mut self, _out: &mut [u8]) -> Result<usize> {
        Err(ResonaError::Device(
            "cpal backend does not support capture".into(),
        ))
    }

    fn pause(&mut self) {
        if let Some(control) = &self.control {
            let _ = control.send(StreamCommand::Pause);
        }
    }

    fn resume(&mut self) {
        if let Some(control) = &self.control {
            let _ = control.send(StreamCommand::Resume);
        }
    }
}

impl Drop for CpalBackend {
    fn drop(&mut self) {
        self.shutdown_stream();
    }
}

fn stream_holder(
    device: cpal::Device,
    config: cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    consumer: HeapCons<f32>,
    control: Receiver<StreamCommand>,
    ready: Sender<std::result::Result<(), String>>,
) {
    let stream = match sample_format {
        cpal::SampleFormat::F32 => build_stream::<f32>(&device, &config, consumer),
        cpal::SampleFormat::I16 => build_stream::<i16>(&device, &config, consumer),
        cpal::SampleFormat::U16 => build_stream::<u16>(&device, &config, consumer),
        other => Err(format!("unsupported sample format {:?}", other)),
    };

    let stream = match stream {
        Ok(stream) => stream,
        Err(message) => {
            let _ = ready.send(Err(message));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = ready.send(Err(format!("failed to start stream: {}", e)));
        return;
    }
    let _ = ready.send(Ok(()));

    // Keep the stream alive and service control commands until shutdown.
    while let Ok(command) = control.recv() {
        match command {
            StreamCommand::Pause => {
                if let Err(e) = stream.pause() {
                    log::warn!("cpal pause failed: {}", e);
                }
            }
            StreamCommand::Resume => {
                if let Err(e) = stream.play() {
                    log::warn!("cpal resume failed: {}", e);
                }
            }
            StreamCommand::Shutdown => break,
        }
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut consumer: HeapCons<f32>,
) -> std::result::Result<cpal::Stream, String>
where
    T: SizedSample + FromSample<f32>,
{
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                for sample in data.iter_mut() {
                    // Underrun plays silence rather than stalling the device.
                    let value = consumer.try_pop().unwrap_or(0.0);
                    *sample = T::from_sample(value);
                }
            },
            move |err| {
                log::error!("cpal stream error: {}", err);
            },
            None,
        )
        .map_err(|e| format!("failed to build stream: {}", e))
}
