#![forbid(unsafe_code)]

use std::path::Path;

use miette::IntoDiagnostic;
use serde::Serialize;
use vigil_ast::LineIndex;
use vigil_verify::{BatchSummary, JobOutcome, Stage, VerificationJob};

pub const SCHEMA: &str = "vigil.batch/v1";

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub schema: &'static str,
    pub root: String,
    pub discovered: usize,
    pub completed: usize,
    pub failed: usize,
    pub with_findings: usize,
    pub failures_by_stage: Vec<CountBy>,
    pub jobs: Vec<JobReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CountBy {
    pub key: String,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instrumented: Option<String>,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub guards: Vec<GuardReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verifier: Option<VerifierReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GuardReport {
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Byte offset of the node the guard was derived from, in the original source.
    pub offset: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<usize>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifierReport {
    pub status: Option<i32>,
    pub findings: bool,
    pub stdout: String,
    pub stderr: String,
}

impl BatchReport {
    /// Line and column are filled in by re-reading each source; a file that
    /// changed or vanished since the run only loses them.
    pub fn from_summary(summary: &BatchSummary) -> Self {
        let failures_by_stage = summary
            .failures_by_stage()
            .into_iter()
            .map(|(stage, count): (Stage, usize)| CountBy {
                key: stage.to_string(),
                count,
            })
            .collect();

        Self {
            schema: SCHEMA,
            root: summary.root.display().to_string(),
            discovered: summary.discovered(),
            completed: summary.completed(),
            failed: summary.failed(),
            with_findings: summary.with_findings(),
            failures_by_stage,
            jobs: summary.jobs.iter().map(JobReport::from_job).collect(),
        }
    }
}

impl JobReport {
    pub fn from_job(job: &VerificationJob) -> Self {
        let (failed_stage, error) = match &job.outcome {
            JobOutcome::Verified => (None, None),
            JobOutcome::Failed { stage, reason } => (Some(stage.as_str()), Some(reason.clone())),
        };

        let src = std::fs::read_to_string(&job.source).ok();
        let lines = src.as_deref().map(LineIndex::new);
        let guards = job
            .insertions
            .iter()
            .map(|ins| {
                let offset = ins.anchor.offset();
                let location = lines.as_ref().map(|l| l.span_start(ins.anchor));
                GuardReport {
                    kind: ins.kind.as_str(),
                    scope: ins.scope.clone(),
                    offset,
                    line: location.map(|(line, _)| line),
                    column: location.map(|(_, column)| column),
                    message: ins.message.clone(),
                }
            })
            .collect();

        Self {
            source: job.source.display().to_string(),
            instrumented: job.instrumented.as_ref().map(|p| p.display().to_string()),
            ok: failed_stage.is_none(),
            failed_stage,
            error,
            guards,
            verifier: job.verifier.as_ref().map(|o| VerifierReport {
                status: o.status,
                findings: !o.success(),
                stdout: o.stdout.clone(),
                stderr: o.stderr.clone(),
            }),
        }
    }
}

pub fn write_batch_report(summary: &BatchSummary, out_path: &Path) -> miette::Result<()> {
    let report = BatchReport::from_summary(summary);
    let json = serde_json::to_string_pretty(&report).into_diagnostic()?;
    std::fs::write(out_path, json).into_diagnostic()?;
    Ok(())
}
