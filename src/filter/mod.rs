//! Per-source filter pipeline.
//!
//! Once per mix quantum the mixer folds every stage of a context's
//! [`FilterChain`] over a [`MixParams`] accumulator for each playing source.
//! Stages are pure: they read source/listener/context attributes and adjust
//! the gain scalar, the resampling step, or the per-channel gain
//! distribution. The chain is a slot-addressable ordered list keyed by stage
//! name, not a hardcoded call sequence, so extension filters can be spliced
//! in without touching the mixer.

mod cone;
mod distance;
mod doppler;
mod pan;

pub use cone::ConeStage;
pub use distance::{DistanceModel, DistanceStage};
pub use doppler::DopplerStage;
pub use pan::PanStage;

use crate::context::ContextParams;
use crate::error::{ResonaError, Result};
use crate::listener::Listener;
use crate::math::Vec3;
use crate::source::Source;

/// Read-only inputs to a filter stage.
pub struct StageCtx<'a> {
    pub source: &'a Source,
    pub listener: &'a Listener,
    pub params: &'a ContextParams,
    /// World-space unit vectors toward each output speaker.
    pub speakers: &'a [Vec3],
    pub channels: u16,
    /// Buffer rate divided by device rate, before pitch and doppler.
    pub base_step: f64,
}

impl StageCtx<'_> {
    /// World-space position of the source, resolving the relative flag.
    pub fn source_position(&self) -> Vec3 {
        if self.source.relative {
            self.listener.position + self.source.position
        } else {
            self.source.position
        }
    }

    pub fn distance(&self) -> f32 {
        (self.source_position() - self.listener.position).length()
    }
}

/// Accumulated mixing parameters for one source in one quantum.
#[derive(Debug, Clone, PartialEq)]
pub struct MixParams {
    /// Combined scalar gain applied to every channel.
    pub gain: f32,
    /// Source frames consumed per output frame.
    pub step: f64,
    /// Per-output-channel gain distribution.
    pub channel_gains: Vec<f32>,
}

impl MixParams {
    fn new(channels: u16, base_step: f64) -> Self {
        Self {
            gain: 1.0,
            step: base_step,
            channel_gains: vec![1.0; channels as usize],
        }
    }
}

/// One stage of the pipeline.
pub trait TimeFilter: Send {
    /// Slot name the stage is addressed by in the chain.
    fn name(&self) -> &str;

    fn apply(&self, ctx: &StageCtx<'_>, out: &mut MixParams);
}

impl std::fmt::Debug for dyn TimeFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeFilter").field("name", &self.name()).finish()
    }
}

/// Slot names of the built-in stages, in default order.
pub mod slots {
    pub const DISTANCE: &str = "distance";
    pub const CONE: &str = "cone";
    pub const PITCH: &str = "pitch";
    pub const DOPPLER: &str = "doppler";
    pub const MINMAX: &str = "minmax";
    pub const PANNING: &str = "panning";
    pub const LISTENER_GAIN: &str = "listener-gain";
}

/// Ordered, name-addressable list of filter stages.
pub struct FilterChain {
    stages: Vec<Box<dyn TimeFilter>>,
}

impl FilterChain {
    /// The default seven-stage pipeline.
    pub fn standard() -> Self {
        Self {
            stages: vec![
                Box::new(DistanceStage),
                Box::new(ConeStage),
                Box::new(PitchStage),
                Box::new(DopplerStage),
                Box::new(GainClampStage),
                Box::new(PanStage),
                Box::new(ListenerGainStage),
            ],
        }
    }

    /// Runs every stage in order and returns the folded parameters.
    pub fn run(&self, ctx: &StageCtx<'_>) -> MixParams {
        let mut params = MixParams::new(ctx.channels, ctx.base_step);
        for stage in &self.stages {
            stage.apply(ctx, &mut params);
        }
        params
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    fn position_of(&self, name: &str) -> Result<usize> {
        self.stages
            .iter()
            .position(|s| s.name() == name)
            .ok_or_else(|| ResonaError::invalid_enum(format!("no filter slot named {:?}", name)))
    }

    fn check_new_name(&self, stage: &dyn TimeFilter) -> Result<()> {
        if self.stages.iter().any(|s| s.name() == stage.name()) {
            return Err(ResonaError::invalid_operation(format!(
                "a filter slot named {:?} already exists",
                stage.name()
            )));
        }
        Ok(())
    }

    /// Splices `stage` in directly before the named slot.
    pub fn insert_before(&mut self, name: &str, stage: Box<dyn TimeFilter>) -> Result<()> {
        self.check_new_name(stage.as_ref())?;
        let position = self.position_of(name)?;
        self.stages.insert(position, stage);
        Ok(())
    }

    /// Splices `stage` in directly after the named slot.
    pub fn insert_after(&mut self, name: &str, stage: Box<dyn TimeFilter>) -> Result<()> {
        self.check_new_name(stage.as_ref())?;
        let position = self.position_of(name)?;
        self.stages.insert(position + 1, stage);
        Ok(())
    }

    /// Appends `stage` at the end of the chain.
    pub fn push(&mut self, stage: Box<dyn TimeFilter>) -> Result<()> {
        self.check_new_name(stage.as_ref())?;
        self.stages.push(stage);
        Ok(())
    }

    /// Replaces the named slot, keeping its position.
    pub fn replace(&mut self, name: &str, stage: Box<dyn TimeFilter>) -> Result<()> {
        let position = self.position_of(name)?;
        self.stages[position] = stage;
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Result<()> {
        let position = self.position_of(name)?;
        self.stages.remove(position);
        Ok(())
    }
}

/// Applies the source's pitch multiplier to the resampling step.
pub struct PitchStage;

impl TimeFilter for PitchStage {
    fn name(&self) -> &str {
        slots::PITCH
    }

    fn apply(&self, ctx: &StageCtx<'_>, out: &mut MixParams) {
        out.step *= ctx.source.pitch as f64;
    }
}

/// Clamps the combined gain into [min gain, max gain] before listener gain.
pub struct GainClampStage;

impl TimeFilter for GainClampStage {
    fn name(&self) -> &str {
        slots::MINMAX
    }

    fn apply(&self, ctx: &StageCtx<'_>, out: &mut MixParams) {
        out.gain = out.gain.clamp(ctx.source.min_gain, ctx.source.max_gain);
    }
}

/// Final master gain multiply.
pub struct ListenerGainStage;

impl TimeFilter for ListenerGainStage {
    fn name(&self) -> &str {
        slots::LISTENER_GAIN
    }

    fn apply(&self, ctx: &StageCtx<'_>, out: &mut MixParams) {
        out.gain *= ctx.listener.gain;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextParams;
    use crate::source::SourceId;

    fn ctx_fixture<'a>(
        source: &'a Source,
        listener: &'a Listener,
        params: &'a ContextParams,
        speakers: &'a [Vec3],
    ) -> StageCtx<'a> {
        StageCtx {
            source,
            listener,
            params,
            speakers,
            channels: speakers.len() as u16,
            base_step: 1.0,
        }
    }

    #[test]
    fn standard_chain_has_the_documented_order() {
        let chain = FilterChain::standard();
        assert_eq!(
            chain.stage_names(),
            vec![
                slots::DISTANCE,
                slots::CONE,
                slots::PITCH,
                slots::DOPPLER,
                slots::MINMAX,
                slots::PANNING,
                slots::LISTENER_GAIN,
            ]
        );
    }

    #[test]
    fn chain_slots_are_addressable_by_name() {
        struct Inert(&'static str);
        impl TimeFilter for Inert {
            fn name(&self) -> &str {
                self.0
            }
            fn apply(&self, _: &StageCtx<'_>, _: &mut MixParams) {}
        }

        let mut chain = FilterChain::standard();
        chain
            .insert_after(slots::DOPPLER, Box::new(Inert("reverb")))
            .unwrap();
        assert_eq!(chain.stage_names()[4], "reverb");

        chain.remove("reverb").unwrap();
        assert!(chain.insert_before("no-such-slot", Box::new(Inert("x"))).is_err());
        assert!(chain.push(Box::new(Inert(slots::PITCH))).is_err());
    }

    #[test]
    fn minmax_clamps_before_listener_gain() {
        let mut source = Source::new(SourceId(1));
        source.gain = 4.0;
        source.min_gain = 0.0;
        source.max_gain = 0.5;
        let mut listener = Listener::default();
        listener.gain = 2.0;
        let params = ContextParams::default();
        let speakers = [Vec3::X];
        let ctx = ctx_fixture(&source, &listener, &params, &speakers);

        let out = FilterChain::standard().run(&ctx);
        // Combined gain capped at max_gain, then scaled by listener gain.
        assert!((out.gain - 1.0).abs() < 1e-6);
    }

    #[test]
    fn pitch_scales_the_step() {
        let mut source = Source::new(SourceId(1));
        source.pitch = 2.0;
        let listener = Listener::default();
        let params = ContextParams::default();
        let speakers = [Vec3::X];
        let ctx = ctx_fixture(&source, &listener, &params, &speakers);

        let out = FilterChain::standard().run(&ctx);
        assert!((out.step - 2.0).abs() < 1e-9);
    }
}
