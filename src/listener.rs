//! Listener state: the "ears" of a context.

use crate::error::{ResonaError, Result};
use crate::math::{Orientation, Vec3};

/// Position, velocity, orientation and master gain of a context's listener.
///
/// Mutated only through the owning context (under its lock). Position and
/// orientation changes invalidate the context's cached speaker geometry,
/// which is recomputed lazily on the next mix quantum.
#[derive(Debug, Clone, PartialEq)]
pub struct Listener {
    pub(crate) position: Vec3,
    pub(crate) velocity: Vec3,
    pub(crate) orientation: Orientation,
    pub(crate) gain: f32,
}

impl Listener {
    pub fn position(&self) -> Vec3 {
        self.position
    }

    pub fn velocity(&self) -> Vec3 {
        self.velocity
    }

    pub fn orientation(&self) -> Orientation {
        self.orientation
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }
}

impl Default for Listener {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            velocity: Vec3::ZERO,
            orientation: Orientation::default(),
            gain: 1.0,
        }
    }
}

/// Unit vectors toward each speaker of the output layout, in world space,
/// derived from the listener orientation. Supported layouts: mono, stereo,
/// quad.
pub(crate) fn speaker_geometry(listener: &Listener, channels: u16) -> Result<Vec<Vec3>> {
    let (at, _up, right) = listener.orientation.basis()?;
    match channels {
        1 => Ok(vec![at]),
        2 => Ok(vec![-right, right]),
        4 => Ok(vec![
            (at - right).normalize(),
            (at + right).normalize(),
            (-at - right).normalize(),
            (-at + right).normalize(),
        ]),
        n => Err(ResonaError::invalid_value(format!(
            "unsupported speaker layout with {} channels",
            n
        ))),
    }
}
