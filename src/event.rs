//! Runtime events for observing stream health.
//!
//! Events are informational. Streams never wait on observers: an event
//! channel that is full or closed simply loses the event.

use std::sync::Arc;

use crate::state::StreamPhase;

/// Something observable happened on one stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// The stream moved between lifecycle phases.
    PhaseChanged {
        stream: Arc<str>,
        from: StreamPhase,
        to: StreamPhase,
        /// Retry counter at the moment of the transition.
        retry_count: u32,
    },

    /// A face was matched to a known identity.
    Recognized {
        stream: Arc<str>,
        name: String,
        /// `round(100 - distance)`.
        confidence: i64,
    },
}

impl StreamEvent {
    pub fn stream(&self) -> &str {
        match self {
            Self::PhaseChanged { stream, .. } | Self::Recognized { stream, .. } => stream,
        }
    }
}
