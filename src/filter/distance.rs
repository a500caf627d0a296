//! Distance attenuation models and the distance stage.

use super::{MixParams, StageCtx, TimeFilter, slots};

const EPSILON: f32 = 1e-6;

/// The formula family mapping source/listener distance to attenuation gain.
///
/// Clamped variants clamp the distance into [reference, max] before applying
/// the unclamped formula. `None` yields gain 1.0 unconditionally. Distance 0
/// is special-cased to gain 1.0 so the unclamped inverse and exponential
/// models never divide by zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistanceModel {
    None,
    InverseDistance,
    InverseDistanceClamped,
    LinearDistance,
    LinearDistanceClamped,
    ExponentDistance,
    ExponentDistanceClamped,
}

impl DistanceModel {
    /// Parses a model name as used by config bindings.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "none" => Some(Self::None),
            "inverse" => Some(Self::InverseDistance),
            "inverse-clamped" => Some(Self::InverseDistanceClamped),
            "linear" => Some(Self::LinearDistance),
            "linear-clamped" => Some(Self::LinearDistanceClamped),
            "exponent" => Some(Self::ExponentDistance),
            "exponent-clamped" => Some(Self::ExponentDistanceClamped),
            _ => None,
        }
    }

    /// Computes the attenuation gain for a source at `distance`.
    ///
    /// The result is clamped into [0, 1]; at `distance == reference` every
    /// model yields exactly 1.0.
    pub fn gain(self, distance: f32, rolloff: f32, reference: f32, max: f32) -> f32 {
        let gain = match self {
            Self::None => 1.0,
            Self::InverseDistance => inverse(distance, rolloff, reference),
            Self::InverseDistanceClamped => {
                inverse(distance.clamp(reference, max), rolloff, reference)
            }
            Self::LinearDistance => linear(distance, rolloff, reference, max),
            Self::LinearDistanceClamped => {
                linear(distance.clamp(reference, max), rolloff, reference, max)
            }
            Self::ExponentDistance => exponent(distance, rolloff, reference),
            Self::ExponentDistanceClamped => {
                exponent(distance.clamp(reference, max), rolloff, reference)
            }
        };
        gain.clamp(0.0, 1.0)
    }
}

impl Default for DistanceModel {
    fn default() -> Self {
        Self::InverseDistanceClamped
    }
}

fn inverse(distance: f32, rolloff: f32, reference: f32) -> f32 {
    if distance < EPSILON {
        return 1.0;
    }
    let denominator = reference + rolloff * (distance - reference);
    if denominator.abs() < EPSILON {
        return 1.0;
    }
    reference / denominator
}

fn linear(distance: f32, rolloff: f32, reference: f32, max: f32) -> f32 {
    if distance < EPSILON {
        return 1.0;
    }
    let span = max - reference;
    if span.abs() < EPSILON {
        return 1.0;
    }
    1.0 - rolloff * (distance - reference) / span
}

fn exponent(distance: f32, rolloff: f32, reference: f32) -> f32 {
    if distance < EPSILON || reference < EPSILON {
        return 1.0;
    }
    (distance / reference).powf(-rolloff)
}

/// Applies distance-model attenuation together with the source gain.
///
/// Inert for directional sources; the cone stage owns attenuation for those,
/// the two are mutually exclusive in effect.
pub struct DistanceStage;

impl TimeFilter for DistanceStage {
    fn name(&self) -> &str {
        slots::DISTANCE
    }

    fn apply(&self, ctx: &StageCtx<'_>, out: &mut MixParams) {
        if ctx.source.direction.length_squared() > EPSILON {
            return;
        }
        let source = ctx.source;
        let attenuation = ctx.params.distance_model.gain(
            ctx.distance(),
            source.rolloff,
            source.reference_distance,
            source.max_distance,
        );
        out.gain *= source.gain * attenuation;
    }
}
