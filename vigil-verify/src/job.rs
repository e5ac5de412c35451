#![forbid(unsafe_code)]
#![allow(unused_assignments)]

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use miette::Diagnostic;
use thiserror::Error;
use vigil_ast::LineIndex;
use vigil_instrument::{Insertion, RuleSet, Transformer};
use vigil_parse::{ParseError, parse_module, render_module};

use crate::observer::JobObserver;
use crate::verifier::{Verifier, VerifierOutput, VerifyError};

pub const DEFAULT_SUFFIX: &str = "_instrumented";

/// Pipeline step at which a job stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    Read,
    Parse,
    Transform,
    Render,
    Persist,
    Invoke,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Read,
        Stage::Parse,
        Stage::Transform,
        Stage::Render,
        Stage::Persist,
        Stage::Invoke,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Read => "read",
            Stage::Parse => "parse",
            Stage::Transform => "transform",
            Stage::Render => "render",
            Stage::Persist => "persist",
            Stage::Invoke => "invoke",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum InstrumentError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Parse(ParseError),

    /// The rendered text failed to parse back; a renderer bug, never the input's fault.
    #[error("instrumented output does not parse: {0}")]
    #[diagnostic(code(vigil::render))]
    Render(ParseError),
}

#[derive(Debug, Error, Diagnostic)]
pub enum JobError {
    #[error("cannot read {}: {source}", .path.display())]
    #[diagnostic(code(vigil::job::read))]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{}:{line}:{column}: {message}", .path.display())]
    #[diagnostic(code(vigil::job::parse))]
    Parse {
        path: PathBuf,
        line: usize,
        column: usize,
        message: String,
    },

    #[error("{}: instrumented output does not parse ({message})", .path.display())]
    #[diagnostic(code(vigil::job::render))]
    Render { path: PathBuf, message: String },

    #[error("cannot write {}: {source}", .path.display())]
    #[diagnostic(code(vigil::job::persist))]
    Persist {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("instrumented file for {} would overwrite the input; use a non-empty suffix", .path.display())]
    #[diagnostic(code(vigil::job::persist))]
    OutputCollision { path: PathBuf },

    #[error("verifier failed on {}: {source}", .path.display())]
    #[diagnostic(code(vigil::job::invoke))]
    VerifierInvocation {
        path: PathBuf,
        #[source]
        source: VerifyError,
    },
}

impl JobError {
    pub fn stage(&self) -> Stage {
        match self {
            JobError::Read { .. } => Stage::Read,
            JobError::Parse { .. } => Stage::Parse,
            JobError::Render { .. } => Stage::Render,
            JobError::Persist { .. } | JobError::OutputCollision { .. } => Stage::Persist,
            JobError::VerifierInvocation { .. } => Stage::Invoke,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    /// Every stage ran. The verifier may still have reported findings.
    Verified,
    Failed { stage: Stage, reason: String },
}

/// Everything one file went through.
#[derive(Clone, Debug, PartialEq)]
pub struct VerificationJob {
    pub source: PathBuf,
    pub instrumented: Option<PathBuf>,
    pub insertions: Vec<Insertion>,
    pub verifier: Option<VerifierOutput>,
    pub outcome: JobOutcome,
}

impl VerificationJob {
    fn new(source: &Path) -> Self {
        Self {
            source: source.to_path_buf(),
            instrumented: None,
            insertions: Vec::new(),
            verifier: None,
            outcome: JobOutcome::Verified,
        }
    }

    pub fn failed_stage(&self) -> Option<Stage> {
        match &self.outcome {
            JobOutcome::Verified => None,
            JobOutcome::Failed { stage, .. } => Some(*stage),
        }
    }

    /// The verifier ran and exited non-zero.
    pub fn has_findings(&self) -> bool {
        self.verifier.as_ref().is_some_and(|o| !o.success())
    }
}

/// Instrumented text plus the guards that went into it.
#[derive(Clone, Debug, PartialEq)]
pub struct InstrumentedSource {
    pub text: String,
    pub insertions: Vec<Insertion>,
}

/// Parse, transform, render, and check that the rendering parses again.
pub fn instrument_source(src: &str, rules: &RuleSet) -> Result<InstrumentedSource, InstrumentError> {
    let module = parse_module(src).map_err(InstrumentError::Parse)?;
    let instrumented = Transformer::new(rules).transform_module(module);
    let text = render_module(&instrumented.module);
    parse_module(&text).map_err(InstrumentError::Render)?;
    Ok(InstrumentedSource {
        text,
        insertions: instrumented.insertions,
    })
}

/// `dir/stem.ext` -> `dir/stem<suffix>.ext`; `None` if that is `path` itself.
pub fn instrumented_path(path: &Path, suffix: &str) -> Option<PathBuf> {
    let stem = path.file_stem()?.to_string_lossy();
    let mut name = format!("{stem}{suffix}");
    if let Some(ext) = path.extension() {
        name.push('.');
        name.push_str(&ext.to_string_lossy());
    }
    let out = path.with_file_name(name);
    if out == path { None } else { Some(out) }
}

/// Runs one file through read, instrument, persist, and verify. Never fails as a whole:
/// stage failures are reported to the observer and recorded in the returned job.
pub struct JobRunner<V> {
    rules: RuleSet,
    suffix: String,
    verifier: V,
}

impl<V: Verifier> JobRunner<V> {
    pub fn new(rules: RuleSet, verifier: V) -> Self {
        Self {
            rules,
            suffix: DEFAULT_SUFFIX.to_string(),
            verifier,
        }
    }

    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = suffix.into();
        self
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    pub fn run(&self, path: &Path, observer: &mut dyn JobObserver) -> VerificationJob {
        observer.job_started(path);
        let mut job = VerificationJob::new(path);
        if let Err(err) = self.run_stages(path, &mut job, observer) {
            observer.job_failed(path, &err);
            job.outcome = JobOutcome::Failed {
                stage: err.stage(),
                reason: err.to_string(),
            };
        }
        observer.job_finished(&job);
        job
    }

    fn run_stages(
        &self,
        path: &Path,
        job: &mut VerificationJob,
        observer: &mut dyn JobObserver,
    ) -> Result<(), JobError> {
        let src = fs::read_to_string(path).map_err(|source| JobError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let instrumented = instrument_source(&src, &self.rules).map_err(|err| match err {
            InstrumentError::Parse(e) => {
                let (line, column) = LineIndex::new(&src).span_start(e.span);
                JobError::Parse {
                    path: path.to_path_buf(),
                    line,
                    column,
                    message: e.message,
                }
            }
            InstrumentError::Render(e) => JobError::Render {
                path: path.to_path_buf(),
                message: e.message,
            },
        })?;

        let lines = LineIndex::new(&src);
        for insertion in &instrumented.insertions {
            observer.insertion(path, insertion, lines.span_start(insertion.anchor));
        }
        job.insertions = instrumented.insertions;

        let out = instrumented_path(path, &self.suffix).ok_or_else(|| JobError::OutputCollision {
            path: path.to_path_buf(),
        })?;
        fs::write(&out, &instrumented.text).map_err(|source| JobError::Persist {
            path: out.clone(),
            source,
        })?;
        observer.persisted(path, &out);
        job.instrumented = Some(out.clone());

        let output = self
            .verifier
            .verify(&out)
            .map_err(|source| JobError::VerifierInvocation { path: out, source })?;
        observer.verifier_output(path, &output);
        job.verifier = Some(output);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instrumented_path_appends_suffix_to_stem() {
        assert_eq!(
            instrumented_path(Path::new("pkg/mod.py"), "_instrumented"),
            Some(PathBuf::from("pkg/mod_instrumented.py"))
        );
        assert_eq!(
            instrumented_path(Path::new("script"), ".checked"),
            Some(PathBuf::from("script.checked"))
        );
    }

    #[test]
    fn empty_suffix_would_overwrite_input() {
        assert_eq!(instrumented_path(Path::new("pkg/mod.py"), ""), None);
    }

    #[test]
    fn instrument_source_reports_parse_errors() {
        let err = instrument_source("def f(:\n", &RuleSet::default()).unwrap_err();
        assert!(matches!(err, InstrumentError::Parse(_)));
    }

    #[test]
    fn instrument_source_returns_insertions() {
        let out = instrument_source("x = f()\n", &RuleSet::default()).unwrap();
        assert_eq!(out.text, "x = f()\nassert x is not None, 'x should not be None after assignment'\n");
        assert_eq!(out.insertions.len(), 1);
    }

    #[test]
    fn byte_order_mark_stays_out_of_guards() {
        let out = instrument_source("\u{feff}x = 1\n", &RuleSet::default()).unwrap();
        assert_eq!(out.text, "x = 1\nassert x is not None, 'x should not be None after assignment'\n");
        assert_eq!(out.insertions[0].anchor.offset(), 3);
        assert_eq!(LineIndex::new("\u{feff}x = 1\n").span_start(out.insertions[0].anchor), (1, 1));
    }

    #[test]
    fn stage_of_each_error() {
        let err = JobError::OutputCollision {
            path: PathBuf::from("a.py"),
        };
        assert_eq!(err.stage(), Stage::Persist);
        assert_eq!(Stage::Invoke.to_string(), "invoke");
    }
}
