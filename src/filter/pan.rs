//! Speaker panning stage.

use super::{MixParams, StageCtx, TimeFilter, slots};

const EPSILON: f32 = 1e-6;

/// Distributes the attenuated mono signal across the output channel layout.
///
/// Each speaker's share follows the dot product between the normalized
/// listener-to-source offset and the speaker's direction vector (derived
/// lazily from the listener orientation), renormalized to constant power. A
/// source sitting on the listener is spread equally across all speakers.
pub struct PanStage;

impl TimeFilter for PanStage {
    fn name(&self) -> &str {
        slots::PANNING
    }

    fn apply(&self, ctx: &StageCtx<'_>, out: &mut MixParams) {
        let speakers = ctx.speakers;
        if speakers.len() <= 1 {
            for gain in out.channel_gains.iter_mut() {
                *gain = 1.0;
            }
            return;
        }

        let offset = ctx.source_position() - ctx.listener.position;
        if offset.length_squared() <= EPSILON {
            let equal = 1.0 / (speakers.len() as f32).sqrt();
            for gain in out.channel_gains.iter_mut() {
                *gain = equal;
            }
            return;
        }

        let direction = offset.normalize();
        let mut power = 0.0f32;
        for (gain, speaker) in out.channel_gains.iter_mut().zip(speakers) {
            *gain = (1.0 + direction.dot(*speaker)) * 0.5;
            power += *gain * *gain;
        }

        if power > EPSILON {
            let scale = power.sqrt().recip();
            for gain in out.channel_gains.iter_mut() {
                *gain *= scale;
            }
        } else {
            let equal = 1.0 / (speakers.len() as f32).sqrt();
            for gain in out.channel_gains.iter_mut() {
                *gain = equal;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextParams;
    use crate::listener::{Listener, speaker_geometry};
    use crate::math::Vec3;
    use crate::source::{Source, SourceId};

    fn pan_gains(position: Vec3) -> Vec<f32> {
        let mut source = Source::new(SourceId(1));
        source.position = position;
        let listener = Listener::default();
        let params = ContextParams::default();
        let speakers = speaker_geometry(&listener, 2).unwrap();
        let ctx = StageCtx {
            source: &source,
            listener: &listener,
            params: &params,
            speakers: &speakers,
            channels: 2,
            base_step: 1.0,
        };
        let mut out = MixParams {
            gain: 1.0,
            step: 1.0,
            channel_gains: vec![1.0, 1.0],
        };
        PanStage.apply(&ctx, &mut out);
        out.channel_gains
    }

    #[test]
    fn source_on_the_right_favors_the_right_speaker() {
        let gains = pan_gains(Vec3::new(5.0, 0.0, 0.0));
        assert!(gains[1] > gains[0]);
        assert!(gains[0].abs() < 1e-5);
    }

    #[test]
    fn centered_source_is_spread_equally() {
        let gains = pan_gains(Vec3::ZERO);
        assert!((gains[0] - gains[1]).abs() < 1e-6);
    }

    #[test]
    fn panning_preserves_power() {
        for position in [
            Vec3::new(1.0, 0.0, -1.0),
            Vec3::new(-3.0, 1.0, 0.5),
            Vec3::new(0.0, 0.0, -2.0),
        ] {
            let gains = pan_gains(position);
            let power: f32 = gains.iter().map(|g| g * g).sum();
            assert!((power - 1.0).abs() < 1e-4, "power {} at {:?}", power, position);
        }
    }
}
