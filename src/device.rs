//! Device boundary: the narrow interface toward hardware backends.
//!
//! Backends are thin I/O shims. Attribute negotiation is meet-or-exceed:
//! the backend may return looser or stricter values than requested and the
//! caller re-checks the actual values. Partial writes are legal and the
//! mixer never assumes a write succeeded.

use crate::error::{ResonaError, Result};
use crate::format::PcmFormat;
use std::time::{Duration, Instant};

/// Whether a device is opened for playback or capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Output,
    Input,
}

/// Negotiated (or desired) device attributes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceAttrs {
    pub format: PcmFormat,
    /// Size of one device quantum in bytes.
    pub buffer_bytes: usize,
}

impl Default for DeviceAttrs {
    fn default() -> Self {
        Self {
            format: PcmFormat::default(),
            buffer_bytes: 4096,
        }
    }
}

/// Operations a hardware or virtual audio endpoint must provide.
pub trait Backend: Send {
    fn name(&self) -> &str;

    fn open(&mut self, mode: OpenMode) -> Result<()>;

    fn close(&mut self);

    /// Negotiates stream attributes. The returned values are what the
    /// backend actually configured and may differ from the request.
    fn set_attributes(&mut self, desired: &DeviceAttrs) -> Result<DeviceAttrs>;

    /// Writes interleaved PCM bytes; returns how many bytes were accepted.
    /// Zero means the backend is full right now (backpressure).
    fn write(&mut self, bytes: &[u8]) -> Result<usize>;

    /// Reads up to `out.len()` bytes of captured PCM; returns the count.
    fn read(&mut self, out: &mut [u8]) -> Result<usize>;

    fn pause(&mut self) {}

    fn resume(&mut self) {}

    /// Optional per-channel analog volume.
    fn channel_volume(&self, _channel: u16) -> Option<f32> {
        None
    }

    fn set_channel_volume(&mut self, _channel: u16, _gain: f32) -> Result<()> {
        Err(ResonaError::invalid_operation(
            "backend has no analog volume control",
        ))
    }
}

/// A bound endpoint: an opened backend plus its negotiated attributes.
pub struct Device {
    backend: Box<dyn Backend>,
    attrs: DeviceAttrs,
    mode: OpenMode,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("attrs", &self.attrs)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl Device {
    /// Opens `backend` in `mode` and negotiates `desired` attributes.
    pub fn open(mut backend: Box<dyn Backend>, mode: OpenMode, desired: &DeviceAttrs) -> Result<Self> {
        desired.format.validate()?;
        backend.open(mode)?;
        let attrs = match backend.set_attributes(desired) {
            Ok(attrs) => attrs,
            Err(e) => {
                backend.close();
                return Err(e);
            }
        };
        log::info!(
            "opened device {:?} ({:?}): {:?}, {} byte quantum",
            backend.name(),
            mode,
            attrs.format,
            attrs.buffer_bytes
        );
        Ok(Self {
            backend,
            attrs,
            mode,
        })
    }

    pub fn attrs(&self) -> DeviceAttrs {
        self.attrs
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Frames of one mix quantum under the negotiated attributes.
    pub fn quantum_frames(&self) -> usize {
        self.attrs.format.frames_in(self.attrs.buffer_bytes)
    }

    pub fn write(&mut self, bytes: &[u8]) -> Result<usize> {
        self.backend.write(bytes)
    }

    pub fn read(&mut self, out: &mut [u8]) -> Result<usize> {
        self.backend.read(out)
    }

    pub fn pause(&mut self) {
        self.backend.pause();
    }

    pub fn resume(&mut self) {
        self.backend.resume();
    }

    /// Per-channel analog volume, if the backend has one.
    pub fn channel_volume(&self, channel: u16) -> Option<f32> {
        self.backend.channel_volume(channel)
    }

    pub fn set_channel_volume(&mut self, channel: u16, gain: f32) -> Result<()> {
        self.backend.set_channel_volume(channel, gain)
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.backend.close();
    }
}

/// A device that consumes audio at wall-clock rate and discards it.
///
/// Accepts whatever attributes are requested and paces `write` so a full
/// quantum takes roughly its real-time duration, which gives the async
/// mixer the same backpressure shape as a real device.
pub struct NullBackend {
    opened: bool,
    paused: bool,
    /// Wall-clock time the device has "played" up to.
    played_until: Option<Instant>,
    format: PcmFormat,
}

impl NullBackend {
    pub fn new() -> Self {
        Self {
            opened: false,
            paused: false,
            played_until: None,
            format: PcmFormat::default(),
        }
    }
}

impl Default for NullBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for NullBackend {
    fn name(&self) -> &str {
        "null"
    }

    fn open(&mut self, _mode: OpenMode) -> Result<()> {
        self.opened = true;
        Ok(())
    }

    fn close(&mut self) {
        self.opened = false;
        self.played_until = None;
    }

    fn set_attributes(&mut self, desired: &DeviceAttrs) -> Result<DeviceAttrs> {
        desired.format.validate()?;
        // Round the quantum down to whole frames, minimum one frame.
        let frame = desired.format.bytes_per_frame();
        let buffer_bytes = (desired.buffer_bytes / frame).max(1) * frame;
        self.format = desired.format;
        Ok(DeviceAttrs {
            format: desired.format,
            buffer_bytes,
        })
    }

    fn write(&mut self, bytes: &[u8]) -> Result<usize> {
        if !self.opened {
            return Err(ResonaError::Device("null device is not open".into()));
        }
        if self.paused {
            return Ok(0);
        }

        let frames = self.format.frames_in(bytes.len());
        let duration = Duration::from_secs_f64(frames as f64 / self.format.sample_rate as f64);
        let now = Instant::now();
        let played_until = self.played_until.get_or_insert(now);
        if *played_until > now {
            std::thread::sleep(*played_until - now);
        }
        *played_until += duration;
        Ok(bytes.len())
    }

    fn read(&mut self, out: &mut [u8]) -> Result<usize> {
        if !self.opened {
            return Err(ResonaError::Device("null device is not open".into()));
        }
        out.fill(0);
        Ok(out.len())
    }

    fn pause(&mut self) {
        self.paused = true;
    }

    fn resume(&mut self) {
        self.paused = false;
        self.played_until = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::SampleFormat;

    #[test]
    fn null_device_negotiates_whole_frames() {
        let desired = DeviceAttrs {
            format: PcmFormat::new(SampleFormat::I16, 2, 44_100),
            buffer_bytes: 1001,
        };
        let device = Device::open(Box::new(NullBackend::new()), OpenMode::Output, &desired).unwrap();
        assert_eq!(device.attrs().buffer_bytes, 1000);
        assert_eq!(device.quantum_frames(), 250);
    }

    #[test]
    fn null_device_accepts_writes_and_reads_silence() {
        let mut device = Device::open(
            Box::new(NullBackend::new()),
            OpenMode::Output,
            &DeviceAttrs::default(),
        )
        .unwrap();
        let written = device.write(&[0u8; 64]).unwrap();
        assert_eq!(written, 64);

        let mut capture = [1u8; 16];
        let read = device.read(&mut capture).unwrap();
        assert_eq!(read, 16);
        assert!(capture.iter().all(|&b| b == 0));
    }

    #[test]
    fn paused_null_device_applies_backpressure() {
        let mut device = Device::open(
            Box::new(NullBackend::new()),
            OpenMode::Output,
            &DeviceAttrs::default(),
        )
        .unwrap();
        device.pause();
        assert_eq!(device.write(&[0u8; 64]).unwrap(), 0);
        device.resume();
        assert_eq!(device.write(&[0u8; 64]).unwrap(), 64);
    }
}
