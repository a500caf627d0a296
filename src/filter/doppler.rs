//! Doppler shift stage.

use super::{MixParams, StageCtx, TimeFilter, slots};

const EPSILON: f32 = 1e-6;

/// Scales the effective pitch by the classic Doppler formula.
///
/// Velocities are projected onto the source-to-listener line of sight and
/// capped just below `speed_of_sound / doppler_factor`, so the shift stays
/// finite and never inverts direction.
pub struct DopplerStage;

impl TimeFilter for DopplerStage {
    fn name(&self) -> &str {
        slots::DOPPLER
    }

    fn apply(&self, ctx: &StageCtx<'_>, out: &mut MixParams) {
        let factor = ctx.params.doppler_factor;
        if factor <= EPSILON {
            return;
        }
        let speed_of_sound = ctx.params.speed_of_sound;

        let to_listener = ctx.listener.position - ctx.source_position();
        let magnitude = to_listener.length();
        if magnitude <= EPSILON {
            return;
        }
        let line = to_listener / magnitude;

        // Projected closing speeds, capped below the propagation speed.
        let limit = speed_of_sound / factor * (1.0 - EPSILON);
        let listener_speed = ctx.listener.velocity.dot(line).min(limit);
        let source_speed = ctx.source.velocity.dot(line).min(limit);

        let numerator = speed_of_sound - factor * listener_speed;
        let denominator = speed_of_sound - factor * source_speed;
        if denominator.abs() <= EPSILON {
            log::warn!("degenerate doppler denominator for {}", ctx.source.id);
            return;
        }

        out.step *= (numerator / denominator).max(0.0) as f64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextParams;
    use crate::listener::Listener;
    use crate::math::Vec3;
    use crate::source::{Source, SourceId};

    fn shift_for(source_velocity: Vec3) -> f64 {
        let mut source = Source::new(SourceId(1));
        source.position = Vec3::new(0.0, 0.0, -10.0);
        source.velocity = source_velocity;
        let listener = Listener::default();
        let params = ContextParams::default();
        let speakers = [Vec3::X];
        let ctx = StageCtx {
            source: &source,
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
        DopplerStage.apply(&ctx, &mut out);
        out.step
    }

    #[test]
    fn receding_source_lowers_pitch() {
        // Listener at origin, source in front of it moving further away.
        let shift = shift_for(Vec3::new(0.0, 0.0, -50.0));
        assert!(shift < 1.0);
        assert!(shift > 0.0);
    }

    #[test]
    fn shift_approaches_unity_as_velocity_vanishes() {
        let slow = shift_for(Vec3::new(0.0, 0.0, -0.1));
        let slower = shift_for(Vec3::new(0.0, 0.0, -0.01));
        assert!((slow - 1.0).abs() > (slower - 1.0).abs());
        assert!((slower - 1.0).abs() < 1e-3);
    }

    #[test]
    fn shift_is_clamped_near_the_speed_of_sound() {
        // Receding at and beyond the speed of sound: finite, not inverted.
        let at_sos = shift_for(Vec3::new(0.0, 0.0, -343.3));
        let beyond = shift_for(Vec3::new(0.0, 0.0, -1000.0));
        assert!(at_sos > 0.0 && at_sos < 1.0);
        assert!(beyond > 0.0 && beyond < 1.0);
    }

    #[test]
    fn approaching_source_raises_pitch_without_inverting() {
        let shift = shift_for(Vec3::new(0.0, 0.0, 343.0));
        assert!(shift > 1.0);
        assert!(shift.is_finite());
    }

    #[test]
    fn stationary_scene_is_untouched() {
        let shift = shift_for(Vec3::ZERO);
        assert!((shift - 1.0).abs() < 1e-6);
    }
}
