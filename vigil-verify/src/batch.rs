#![forbid(unsafe_code)]
#![allow(unused_assignments)]

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use miette::Diagnostic;
use thiserror::Error;

use crate::job::{JobRunner, Stage, VerificationJob};
use crate::observer::JobObserver;
use crate::verifier::Verifier;

pub const DEFAULT_EXCLUDE_DIRS: [&str; 5] = ["__pycache__", ".git", ".venv", "venv", "node_modules"];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveryOptions {
    /// File extension without the dot.
    pub extension: String,
    /// Directory names never descended into.
    pub exclude_dirs: Vec<String>,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            extension: "py".to_string(),
            exclude_dirs: DEFAULT_EXCLUDE_DIRS.iter().map(|d| d.to_string()).collect(),
        }
    }
}

#[derive(Debug, Error, Diagnostic)]
#[error("cannot read directory {}: {source}", .path.display())]
#[diagnostic(code(vigil::discovery))]
pub struct DiscoveryError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

/// Per-file results of one directory run, in discovery order.
#[derive(Clone, Debug, PartialEq)]
pub struct BatchSummary {
    pub root: PathBuf,
    pub jobs: Vec<VerificationJob>,
}

impl BatchSummary {
    pub fn discovered(&self) -> usize {
        self.jobs.len()
    }

    /// Jobs that ran every stage.
    pub fn completed(&self) -> usize {
        self.jobs.iter().filter(|j| j.failed_stage().is_none()).count()
    }

    pub fn failed(&self) -> usize {
        self.discovered() - self.completed()
    }

    pub fn failures_by_stage(&self) -> BTreeMap<Stage, usize> {
        let mut counts = BTreeMap::new();
        for stage in self.jobs.iter().filter_map(VerificationJob::failed_stage) {
            *counts.entry(stage).or_insert(0) += 1;
        }
        counts
    }

    /// Jobs whose verifier exited non-zero.
    pub fn with_findings(&self) -> usize {
        self.jobs.iter().filter(|j| j.has_findings()).count()
    }

    pub fn is_clean(&self) -> bool {
        self.failed() == 0
    }
}

/// Sequential driver over a directory tree.
pub struct BatchOrchestrator<V> {
    runner: JobRunner<V>,
    discovery: DiscoveryOptions,
}

impl<V: Verifier> BatchOrchestrator<V> {
    pub fn new(runner: JobRunner<V>, discovery: DiscoveryOptions) -> Self {
        Self { runner, discovery }
    }

    pub fn runner(&self) -> &JobRunner<V> {
        &self.runner
    }

    /// Source files under `dir`, sorted by path. Previously generated
    /// instrumented files and excluded directories are skipped. Symlinked
    /// files are included; symlinked directories are not followed.
    pub fn discover(&self, dir: &Path) -> Result<Vec<PathBuf>, DiscoveryError> {
        let mut out = Vec::new();
        self.collect_files(dir, &mut out)?;
        out.sort();
        Ok(out)
    }

    pub fn run(&self, dir: &Path, observer: &mut dyn JobObserver) -> Result<BatchSummary, DiscoveryError> {
        let files = self.discover(dir)?;
        observer.batch_started(dir, &files);

        let jobs = files
            .iter()
            .map(|path| self.runner.run(path, observer))
            .collect();
        let summary = BatchSummary {
            root: dir.to_path_buf(),
            jobs,
        };
        observer.batch_finished(&summary);
        Ok(summary)
    }

    /// Only `root` has to be readable. Anything unreadable below it is logged and skipped.
    fn collect_files(&self, root: &Path, out: &mut Vec<PathBuf>) -> Result<(), DiscoveryError> {
        let entries = fs::read_dir(root).map_err(|source| DiscoveryError {
            path: root.to_path_buf(),
            source,
        })?;
        self.collect_entries(root, entries, out);
        Ok(())
    }

    fn collect_entries(&self, dir: &Path, entries: fs::ReadDir, out: &mut Vec<PathBuf>) {
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(dir = %dir.display(), error = %e, "skipping unreadable directory entry");
                    continue;
                }
            };
            let p = entry.path();
            let file_type = match entry.file_type() {
                Ok(t) => t,
                Err(e) => {
                    tracing::warn!(path = %p.display(), error = %e, "skipping entry of unknown type");
                    continue;
                }
            };

            if file_type.is_dir() {
                if self.is_excluded(&p) {
                    continue;
                }
                match fs::read_dir(&p) {
                    Ok(sub) => self.collect_entries(&p, sub, out),
                    Err(e) => tracing::warn!(dir = %p.display(), error = %e, "skipping unreadable directory"),
                }
            } else if file_type.is_symlink() {
                // Linked files are sources like any other; linked directories are not followed.
                match fs::metadata(&p) {
                    Ok(meta) if meta.is_file() && self.is_source(&p) => out.push(p),
                    Ok(meta) if meta.is_dir() => {
                        tracing::debug!(path = %p.display(), "not following symlinked directory")
                    }
                    Ok(_) => {}
                    Err(e) if self.is_source(&p) => {
                        tracing::warn!(path = %p.display(), error = %e, "skipping broken symlink")
                    }
                    Err(_) => {}
                }
            } else if file_type.is_file() && self.is_source(&p) {
                out.push(p);
            }
        }
    }

    fn is_excluded(&self, dir: &Path) -> bool {
        dir.file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| self.discovery.exclude_dirs.iter().any(|d| d == n))
    }

    fn is_source(&self, p: &Path) -> bool {
        if p.extension().and_then(|e| e.to_str()) != Some(self.discovery.extension.as_str()) {
            return false;
        }
        let suffix = self.runner.suffix();
        let generated = !suffix.is_empty()
            && p.file_stem()
                .and_then(|s| s.to_str())
                .is_some_and(|s| s.ends_with(suffix));
        !generated
    }
}
