#![forbid(unsafe_code)]

//! Verification orchestration: one file through instrument-then-verify
//! ([`JobRunner`]), or a whole tree ([`BatchOrchestrator`]).

mod batch;
mod job;
mod observer;
mod verifier;

pub use batch::{BatchOrchestrator, BatchSummary, DEFAULT_EXCLUDE_DIRS, DiscoveryError, DiscoveryOptions};
pub use job::{
    DEFAULT_SUFFIX, InstrumentError, InstrumentedSource, JobError, JobOutcome, JobRunner, Stage,
    VerificationJob, instrument_source, instrumented_path,
};
pub use observer::{JobObserver, NullObserver, TracingObserver};
pub use verifier::{CommandVerifier, DEFAULT_ARGS, DEFAULT_PROGRAM, Verifier, VerifierOutput, VerifyError};
