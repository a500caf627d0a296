//! Math types for Resona

use crate::error::{ResonaError, Result};

pub use glam::{Quat, Vec3};

const DEGENERATE_EPSILON: f32 = 1e-6;

/// Listener orientation expressed as an "at" vector and an "up" vector.
///
/// The pair must be representable as an orthogonal basis once normalized:
/// neither vector may be zero-length and they may not be collinear.
/// [`Orientation::basis`] performs the Gram-Schmidt step and reports
/// degenerate input as an invalid-value error.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Orientation {
    pub at: Vec3,
    pub up: Vec3,
}

impl Orientation {
    pub fn new(at: Vec3, up: Vec3) -> Self {
        Self { at, up }
    }

    /// Returns the orthonormal (at, up, right) basis for this orientation.
    ///
    /// # Errors
    ///
    /// Returns an invalid-value error if either vector is (near) zero length
    /// or the two are collinear.
    pub fn basis(&self) -> Result<(Vec3, Vec3, Vec3)> {
        if self.at.length_squared() < DEGENERATE_EPSILON
            || self.up.length_squared() < DEGENERATE_EPSILON
        {
            return Err(ResonaError::invalid_value(
                "orientation vectors must be non-zero",
            ));
        }

        let at = self.at.normalize();
        let right = at.cross(self.up);
        if right.length_squared() < DEGENERATE_EPSILON {
            return Err(ResonaError::invalid_value(
                "orientation at/up vectors are collinear",
            ));
        }
        let right = right.normalize();
        let up = right.cross(at).normalize();

        Ok((at, up, right))
    }

    /// Returns true if [`Orientation::basis`] would succeed.
    pub fn is_valid(&self) -> bool {
        self.basis().is_ok()
    }
}

impl Default for Orientation {
    fn default() -> Self {
        // Facing -Z with +Y up, the conventional listener frame.
        Self {
            at: -Vec3::Z,
            up: Vec3::Y,
        }
    }
}

/// Linear interpolation between two samples.
#[inline]
pub(crate) fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}
