//! Error types for the CAN queue engine.
//!
//! Failures fall into four groups: resource exhaustion while an edge is being
//! set up, transient capacity conditions a producer answers with
//! backpressure, timeouts of the blocking wait calls, and misuse of handles.
//! A busy disconnect is not an error; see [`crate::Detach`].

use crate::edge::EdgeHandle;
use crate::ends::EndsId;
use thiserror::Error;

/// Main error type for queue operations.
#[derive(Error, Debug)]
pub enum QueueError {
    /// Configuration-related errors (parsing, validation, missing files)
    #[error("Configuration error: {0}")]
    Config(String),

    /// A queue or edge parameter is outside its allowed range
    #[error("Invalid queue parameter: {0}")]
    InvalidParam(String),

    /// Slot storage for a new FIFO could not be allocated
    #[error("Out of memory allocating {slots} slots")]
    OutOfMemory {
        /// Number of slots requested
        slots: usize,
    },

    /// The handle does not name a live edge
    #[error("Unknown edge {0}")]
    UnknownEdge(EdgeHandle),

    /// The handle does not name a live ends
    #[error("Unknown ends {0}")]
    UnknownEnds(EndsId),

    /// The ends is being disposed and accepts no new edges
    #[error("Ends {0} is dead")]
    EndsDead(EndsId),

    /// The edge has already been connected once
    #[error("Edge {0} is already connected")]
    AlreadyConnected(EdgeHandle),

    /// No outgoing edge is able to take the frame
    #[error("No usable edge")]
    NoEdge,

    /// The selected edge has no free slot
    #[error("FIFO of {edge} is full")]
    Overrun {
        /// Edge whose FIFO overflowed
        edge: EdgeHandle,
    },

    /// The selected edge refuses new slots
    #[error("{edge} is blocked")]
    Blocked {
        /// Edge in the blocked state
        edge: EdgeHandle,
    },

    /// The frame carries more data than the edge slots can hold
    #[error("Frame data length {dlen} exceeds slot capacity {max}")]
    FrameTooLong {
        /// Data length of the frame
        dlen: usize,
        /// Maximum data length of the edge
        max: usize,
    },

    /// A blocking wait reached its deadline
    #[error("Timed out waiting for queue to drain")]
    Timeout,
}

/// Type alias for Results that use QueueError
pub type Result<T> = std::result::Result<T, QueueError>;

impl QueueError {
    /// Create a new invalid parameter error
    pub fn invalid_param(msg: impl Into<String>) -> Self {
        Self::InvalidParam(msg.into())
    }

    /// Returns `true` for conditions a producer may retry after backpressure
    /// (no usable edge, full or blocked FIFO, timeout).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::NoEdge | Self::Overrun { .. } | Self::Blocked { .. } | Self::Timeout
        )
    }
}

/// Convert from anyhow::Error (configuration loading uses anyhow)
impl From<anyhow::Error> for QueueError {
    fn from(err: anyhow::Error) -> Self {
        Self::Config(format!("{:#}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(QueueError::NoEdge.is_transient());
        assert!(QueueError::Timeout.is_transient());
        assert!(!QueueError::OutOfMemory { slots: 4 }.is_transient());
        assert!(!QueueError::invalid_param("bad").is_transient());
    }

    #[test]
    fn test_config_errors_from_anyhow() {
        let err = QueueError::from(anyhow::anyhow!("missing [general]"));
        assert!(matches!(&err, QueueError::Config(msg) if msg == "missing [general]"));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_display_messages() {
        let err = QueueError::FrameTooLong { dlen: 12, max: 8 };
        assert_eq!(
            err.to_string(),
            "Frame data length 12 exceeds slot capacity 8"
        );
    }
}
