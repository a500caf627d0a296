//! Directional cone attenuation.

use super::{MixParams, StageCtx, TimeFilter, slots};

const EPSILON: f32 = 1e-6;

/// Cone attenuation for directional sources.
///
/// Takes over from the plain distance stage when a source direction is set:
/// the gain interpolates from 1.0 inside the inner cone, through a linear
/// blend, down to the outer gain beyond the outer cone, and the distance
/// model attenuation is folded in here instead.
pub struct ConeStage;

impl ConeStage {
    /// Angular gain factor for an off-axis angle in degrees.
    fn angular_gain(angle: f32, inner: f32, outer: f32, outer_gain: f32) -> f32 {
        let inner_half = inner * 0.5;
        let outer_half = outer * 0.5;
        if angle <= inner_half {
            1.0
        } else if angle >= outer_half {
            outer_gain
        } else if (outer_half - inner_half).abs() < EPSILON {
            outer_gain
        } else {
            let blend = (angle - inner_half) / (outer_half - inner_half);
            1.0 + blend * (outer_gain - 1.0)
        }
    }
}

impl TimeFilter for ConeStage {
    fn name(&self) -> &str {
        slots::CONE
    }

    fn apply(&self, ctx: &StageCtx<'_>, out: &mut MixParams) {
        let source = ctx.source;
        if source.direction.length_squared() <= EPSILON {
            return;
        }

        let to_listener = ctx.listener.position - ctx.source_position();
        let angle = if to_listener.length_squared() <= EPSILON {
            // Listener inside the source: treat as on-axis.
            0.0
        } else {
            source
                .direction
                .normalize()
                .dot(to_listener.normalize())
                .clamp(-1.0, 1.0)
                .acos()
                .to_degrees()
        };

        let angular = Self::angular_gain(
            angle,
            source.cone_inner_angle,
            source.cone_outer_angle,
            source.cone_outer_gain,
        );
        let attenuation = ctx.params.distance_model.gain(
            ctx.distance(),
            source.rolloff,
            source.reference_distance,
            source.max_distance,
        );
        out.gain *= source.gain * attenuation * angular;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextParams;
    use crate::listener::Listener;
    use crate::math::Vec3;
    use crate::source::{Source, SourceId};

    fn directional_source(direction: Vec3) -> Source {
        let mut source = Source::new(SourceId(1));
        source.position = Vec3::new(0.0, 0.0, -1.0);
        source.direction = direction;
        source.cone_inner_angle = 60.0;
        source.cone_outer_angle = 270.0;
        source.cone_outer_gain = 0.25;
        source
    }

    fn run_cone(source: &Source) -> f32 {
        let listener = Listener::default();
        let params = ContextParams::default();
        let speakers = [Vec3::X];
        let ctx = StageCtx {
            source,
            listener: &listener,
            params: &params,
            speakers: &speakers,
            channels: 1,
            base_step: 1.0,
        };
        let mut out = MixParams {
            gain: 1.0,
            step: 1.0,
            channel_gains: vec![1.0],
        };
        ConeStage.apply(&ctx, &mut out);
        out.gain
    }

    #[test]
    fn on_axis_listener_gets_full_gain() {
        // Source one unit in front, pointing straight at the listener.
        let source = directional_source(Vec3::Z);
        let gain = run_cone(&source);
        assert!((gain - 1.0).abs() < 1e-5);
    }

    #[test]
    fn listener_behind_gets_outer_gain() {
        let source = directional_source(-Vec3::Z);
        let gain = run_cone(&source);
        assert!((gain - 0.25).abs() < 1e-5);
    }

    #[test]
    fn side_listener_blends_between_cones() {
        // 90 degrees off axis: between inner half (30) and outer half (90).
        let source = directional_source(Vec3::X);
        let gain = run_cone(&source);
        assert!(gain < 1.0 && gain > 0.25);
    }

    #[test]
    fn omnidirectional_sources_are_untouched() {
        let mut source = directional_source(Vec3::Z);
        source.direction = Vec3::ZERO;
        let gain = run_cone(&source);
        assert_eq!(gain, 1.0);
    }
}
