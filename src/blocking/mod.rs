//! Blocking detection and attempt classification.

pub mod detectors;
pub mod outcome;

pub use detectors::BlockDetector;
pub use outcome::{
    AttemptOutcome, BlockReason, FailureClass, ProductPayload, TransientCause, TransientFailure,
};
