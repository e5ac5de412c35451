#![forbid(unsafe_code)]
#![allow(unused_assignments)]

use std::io::{self, Read};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use miette::Diagnostic;
use thiserror::Error;

/// Captured result of one verifier run. A non-zero status is the verifier
/// reporting findings, not a failure to run it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerifierOutput {
    /// Exit code; `None` when the process was terminated by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl VerifierOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum VerifyError {
    #[error("failed to launch verifier `{program}`: {source}")]
    #[diagnostic(
        code(vigil::verify::spawn),
        help("check that the verifier is installed and on PATH (CrossHair: `pip install crosshair-tool`)")
    )]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("verifier `{program}` did not finish within {}s", .timeout.as_secs_f64())]
    #[diagnostic(code(vigil::verify::timeout))]
    Timeout { program: String, timeout: Duration },

    #[error("lost track of verifier `{program}`: {source}")]
    #[diagnostic(code(vigil::verify::wait))]
    Wait {
        program: String,
        #[source]
        source: io::Error,
    },
}

/// Runs an external checker over one instrumented file.
pub trait Verifier {
    fn verify(&self, path: &Path) -> Result<VerifierOutput, VerifyError>;
}

impl<V: Verifier + ?Sized> Verifier for &V {
    fn verify(&self, path: &Path) -> Result<VerifierOutput, VerifyError> {
        (**self).verify(path)
    }
}

impl<V: Verifier + ?Sized> Verifier for Box<V> {
    fn verify(&self, path: &Path) -> Result<VerifierOutput, VerifyError> {
        (**self).verify(path)
    }
}

/// `program args... <path>` as a child process.
///
/// Without a timeout the wait is unbounded: a verifier that never exits
/// blocks the caller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandVerifier {
    program: String,
    args: Vec<String>,
    timeout: Option<Duration>,
}

pub const DEFAULT_PROGRAM: &str = "crosshair";
pub const DEFAULT_ARGS: [&str; 2] = ["check", "--analysis_kind=asserts"];

const POLL_INTERVAL: Duration = Duration::from_millis(20);

impl Default for CommandVerifier {
    fn default() -> Self {
        Self::crosshair()
    }
}

impl CommandVerifier {
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            timeout: None,
        }
    }

    /// `crosshair check --analysis_kind=asserts`
    pub fn crosshair() -> Self {
        Self::new(DEFAULT_PROGRAM, DEFAULT_ARGS)
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn wait(&self, child: &mut Child) -> Result<ExitStatus, VerifyError> {
        let wait_err = |source| VerifyError::Wait {
            program: self.program.clone(),
            source,
        };

        let Some(timeout) = self.timeout else {
            return child.wait().map_err(wait_err);
        };

        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = child.try_wait().map_err(wait_err)? {
                return Ok(status);
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                return Err(VerifyError::Timeout {
                    program: self.program.clone(),
                    timeout,
                });
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

impl Verifier for CommandVerifier {
    fn verify(&self, path: &Path) -> Result<VerifierOutput, VerifyError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = cmd.spawn().map_err(|source| VerifyError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        // Drain both pipes while waiting so a chatty verifier cannot fill one and stall.
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        // On timeout the readers are detached; a surviving grandchild may still hold the pipes.
        let status = self.wait(&mut child)?;
        let stdout = collect(stdout);
        let stderr = collect(stderr);

        Ok(VerifierOutput {
            status: status.code(),
            stdout,
            stderr,
        })
    }
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}

fn collect(handle: Option<JoinHandle<Vec<u8>>>) -> String {
    let bytes = handle.and_then(|h| h.join().ok()).unwrap_or_default();
    String::from_utf8_lossy(&bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_crosshair_asserts_mode() {
        let v = CommandVerifier::default();
        assert_eq!(v.program(), "crosshair");
        assert_eq!(v.args(), ["check", "--analysis_kind=asserts"]);
        assert_eq!(v.timeout(), None);
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let v = CommandVerifier::new("vigil-no-such-verifier-binary", Vec::<String>::new());
        let err = v.verify(Path::new("x.py")).unwrap_err();
        assert!(matches!(err, VerifyError::Spawn { .. }));
        assert!(err.to_string().contains("vigil-no-such-verifier-binary"));
    }

    #[cfg(unix)]
    #[test]
    fn captures_output_and_exit_code() {
        let v = CommandVerifier::new("sh", ["-c", "echo \"checked $1\"; echo finding >&2; exit 3", "sh"]);
        let out = v.verify(Path::new("mod_instrumented.py")).unwrap();
        assert_eq!(out.status, Some(3));
        assert!(!out.success());
        assert_eq!(out.stdout, "checked mod_instrumented.py\n");
        assert_eq!(out.stderr, "finding\n");
    }

    #[cfg(unix)]
    #[test]
    fn timeout_kills_a_hung_verifier() {
        let v = CommandVerifier::new("sh", ["-c", "exec sleep 5", "sh"])
            .with_timeout(Some(Duration::from_millis(100)));
        let started = Instant::now();
        let err = v.verify(Path::new("x.py")).unwrap_err();
        assert!(matches!(err, VerifyError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(4));
    }
}
