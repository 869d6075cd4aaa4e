//! Errors reported by the scheduler.
//!
//! A task's handle resolves with at most one of these. Errors that originate from a
//! span carry the index of that span so that callers can tell which part of the input
//! triggered the failure.

use std::io;

/// The error type unit-of-work functions can return, through `Into<BoxError>`.
///
/// `String`, `&str` and any `std::error::Error + Send + Sync` convert into it.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A unit of work could not be delivered to, or reported back from, its worker.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct TransportError(String);

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        TransportError(message.into())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The unit of work returned an error.
    #[error("span #{span} failed: {source}")]
    WorkerExecution {
        span: u32,
        #[source]
        source: BoxError,
    },

    /// The unit of work panicked.
    #[error("worker panicked while executing span #{span}: {message}")]
    Panicked {
        span: u32,
        message: String,
    },

    /// Outside of aggregate mode, a span must produce exactly one item per input item.
    #[error("span #{span} produced {actual} items but covers {expected}")]
    OutputMismatch {
        span: u32,
        expected: usize,
        actual: usize,
    },

    #[error("span #{span} could not be delivered: {source}")]
    Transport {
        span: u32,
        #[source]
        source: TransportError,
    },

    /// Only returned by the strict `try_partition`. Scheduling normalizes instead.
    #[error("cannot split {length} items into {threads} spans")]
    Partition {
        length: usize,
        threads: usize,
    },

    #[error("failed to spawn the scheduling thread")]
    Spawn(#[source] io::Error),

    #[error("the scheduler is shutting down")]
    ShutDown,
}

impl Error {
    /// The index of the span the error originates from, if any.
    pub fn span(&self) -> Option<u32> {
        match self {
            Error::WorkerExecution { span, .. }
            | Error::Panicked { span, .. }
            | Error::OutputMismatch { span, .. }
            | Error::Transport { span, .. } => Some(*span),
            Error::Partition { .. } | Error::Spawn(_) | Error::ShutDown => None,
        }
    }
}

#[test]
fn error_origin_span() {
    let err = Error::WorkerExecution { span: 2, source: "boom".into() };
    assert_eq!(err.span(), Some(2));
    assert_eq!(err.to_string(), "span #2 failed: boom");

    let err = Error::Transport { span: 0, source: TransportError::new("mailbox closed") };
    assert_eq!(err.span(), Some(0));
    assert!(std::error::Error::source(&err).is_some());

    assert_eq!(Error::ShutDown.span(), None);
}
