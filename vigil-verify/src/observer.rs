#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};

use vigil_instrument::Insertion;

use crate::batch::BatchSummary;
use crate::job::{JobError, JobOutcome, VerificationJob};
use crate::verifier::VerifierOutput;

/// Sink for per-file and per-batch progress. Every hook defaults to a no-op.
pub trait JobObserver {
    fn batch_started(&mut self, _root: &Path, _files: &[PathBuf]) {}

    fn job_started(&mut self, _path: &Path) {}

    /// `location` is the 1-based line and column of the node the guard derives from.
    fn insertion(&mut self, _path: &Path, _insertion: &Insertion, _location: (usize, usize)) {}

    fn persisted(&mut self, _source: &Path, _instrumented: &Path) {}

    fn verifier_output(&mut self, _path: &Path, _output: &VerifierOutput) {}

    fn job_failed(&mut self, _path: &Path, _error: &JobError) {}

    fn job_finished(&mut self, _job: &VerificationJob) {}

    fn batch_finished(&mut self, _summary: &BatchSummary) {}
}

/// Discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullObserver;

impl JobObserver for NullObserver {}

/// Forwards progress to `tracing`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingObserver;

impl JobObserver for TracingObserver {
    fn batch_started(&mut self, root: &Path, files: &[PathBuf]) {
        tracing::info!(root = %root.display(), files = files.len(), "discovered source files");
    }

    fn job_started(&mut self, path: &Path) {
        tracing::info!(path = %path.display(), "instrumenting");
    }

    fn insertion(&mut self, path: &Path, insertion: &Insertion, (line, column): (usize, usize)) {
        tracing::debug!(
            path = %path.display(),
            kind = %insertion.kind,
            scope = insertion.scope.as_deref().unwrap_or("<module>"),
            line,
            column,
            message = %insertion.message,
            "inserted guard"
        );
    }

    fn persisted(&mut self, source: &Path, instrumented: &Path) {
        tracing::debug!(
            path = %source.display(),
            output = %instrumented.display(),
            "wrote instrumented file"
        );
    }

    fn verifier_output(&mut self, path: &Path, output: &VerifierOutput) {
        let stdout = output.stdout.trim_end();
        let stderr = output.stderr.trim_end();
        if output.success() {
            if !stdout.is_empty() {
                tracing::info!(path = %path.display(), "verifier output:\n{stdout}");
            }
            if !stderr.is_empty() {
                tracing::warn!(path = %path.display(), "verifier stderr:\n{stderr}");
            }
        } else {
            tracing::warn!(
                path = %path.display(),
                status = ?output.status,
                "verifier reported findings:\n{stdout}{}{stderr}",
                if stdout.is_empty() || stderr.is_empty() { "" } else { "\n" }
            );
        }
    }

    fn job_failed(&mut self, path: &Path, error: &JobError) {
        tracing::error!(path = %path.display(), stage = %error.stage(), "{error}");
    }

    fn job_finished(&mut self, job: &VerificationJob) {
        if job.outcome == JobOutcome::Verified {
            tracing::info!(
                path = %job.source.display(),
                guards = job.insertions.len(),
                findings = job.has_findings(),
                "verification finished"
            );
        }
    }

    fn batch_finished(&mut self, summary: &BatchSummary) {
        tracing::info!(
            root = %summary.root.display(),
            discovered = summary.discovered(),
            completed = summary.completed(),
            failed = summary.failed(),
            with_findings = summary.with_findings(),
            "batch finished"
        );
    }
}
