use thiserror::Error;

use crate::time::StreamTime;

/// Errors raised by the composition engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum EngineError {
    /// No object covers the playhead inside the composition's real
    /// interval. The application is responsible for filling gaps.
    #[error("gap in the composition at {position}: no object covers the playhead")]
    TimelineGap { position: StreamTime },

    /// An operation's child count cannot satisfy its sink requirements.
    #[error(
        "invalid composition structure: operation `{operation}` got {children} children for {sinks} sinks"
    )]
    InvalidStructure {
        operation: String,
        children: usize,
        sinks: usize,
    },

    /// A translated seek fell outside the object's validity window. The
    /// external value was clamped; the caller decides whether to propagate.
    #[error("seek outside the object window, clamped to {clamped}")]
    SeekRejected { clamped: StreamTime },

    /// Stop was requested from the update task's own thread. The task was
    /// reinstalled; retry from another thread.
    #[error("cannot join the update task from its own thread")]
    JoinFromOwnThread,

    /// A wrapped element refused to reach the requested state.
    #[error("child element `{element}` failed to reach {target} state")]
    ChildStateChange { element: String, target: String },
}

pub type Result<T> = std::result::Result<T, EngineError>;
