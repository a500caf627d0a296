//! Event types for Resona

use crate::context::ContextId;
use crate::source::SourceId;

/// Events emitted by the mixer and the context API, polled from the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    SourceStarted {
        context: ContextId,
        source: SourceId,
    },
    /// A non-looping source consumed its whole queue.
    SourceCompleted {
        context: ContextId,
        source: SourceId,
    },
    /// A looping source wrapped around its queue.
    SourceLooped {
        context: ContextId,
        source: SourceId,
    },
    SourceStopped {
        context: ContextId,
        source: SourceId,
    },
    /// A backend write failed; the mixer dropped the quantum and carried on.
    DeviceError {
        context: ContextId,
        message: String,
    },
    MixerStarted,
    MixerStopped,
}

impl EngineEvent {
    pub fn source_id(&self) -> Option<SourceId> {
        match self {
            Self::SourceStarted { source, .. }
            | Self::SourceCompleted { source, .. }
            | Self::SourceLooped { source, .. }
            | Self::SourceStopped { source, .. } => Some(*source),
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::DeviceError { .. })
    }
}
