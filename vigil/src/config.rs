#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use miette::Diagnostic;
use serde::Deserialize;
use thiserror::Error;
use vigil_instrument::RuleConfig;
use vigil_verify::{CommandVerifier, DEFAULT_ARGS, DEFAULT_PROGRAM, DEFAULT_SUFFIX, DiscoveryOptions};

pub const CONFIG_FILE: &str = "vigil.toml";

#[derive(Debug, Error, Diagnostic)]
#[error("config error: {message}")]
#[diagnostic(code(vigil::config))]
pub struct ConfigError {
    pub message: String,
}

impl ConfigError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub instrument: InstrumentSection,
    pub verifier: VerifierSection,
    pub discovery: DiscoverySection,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InstrumentSection {
    pub suffix: String,
    pub catch_all: Vec<String>,
    pub bare_except_is_catch_all: bool,
    pub opaque_types: Vec<String>,
}

impl Default for InstrumentSection {
    fn default() -> Self {
        let rules = RuleConfig::default();
        Self {
            suffix: DEFAULT_SUFFIX.to_string(),
            catch_all: rules.catch_all,
            bare_except_is_catch_all: rules.bare_except_is_catch_all,
            opaque_types: rules.opaque_types,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VerifierSection {
    pub program: String,
    pub args: Vec<String>,
    /// Omitted means wait for the verifier indefinitely.
    pub timeout_secs: Option<u64>,
}

impl Default for VerifierSection {
    fn default() -> Self {
        Self {
            program: DEFAULT_PROGRAM.to_string(),
            args: DEFAULT_ARGS.iter().map(|a| a.to_string()).collect(),
            timeout_secs: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DiscoverySection {
    pub extension: String,
    pub exclude_dirs: Vec<String>,
}

impl Default for DiscoverySection {
    fn default() -> Self {
        let d = DiscoveryOptions::default();
        Self {
            extension: d.extension,
            exclude_dirs: d.exclude_dirs,
        }
    }
}

/// Command-line values that win over the config file.
#[derive(clap::Args, Clone, Debug, Default, PartialEq, Eq)]
pub struct Overrides {
    /// Verifier program (default: `crosshair`)
    #[arg(long, global = true)]
    pub verifier: Option<String>,

    /// Verifier argument placed before the file path (repeatable; replaces the configured list)
    #[arg(long = "verifier-arg", global = true, allow_hyphen_values = true)]
    pub verifier_args: Vec<String>,

    /// Kill the verifier after this many seconds
    #[arg(long, global = true, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Appended to the file stem of every instrumented file
    #[arg(long, global = true)]
    pub suffix: Option<String>,
}

/// A loaded config plus where it came from.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolved {
    pub path: Option<PathBuf>,
    pub config: Config,
}

/// Walks up from `start` (or its parent, for a file) looking for `vigil.toml`.
pub fn find_config(start: &Path) -> Option<PathBuf> {
    let mut cur = if start.is_file() {
        start.parent()?.to_path_buf()
    } else {
        start.to_path_buf()
    };

    loop {
        let candidate = cur.join(CONFIG_FILE);
        if candidate.is_file() {
            return Some(candidate);
        }
        cur = cur.parent()?.to_path_buf();
    }
}

pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|e| ConfigError::new(format!("failed to read {}: {e}", path.display())))?;
    toml::from_str(&raw).map_err(|e| ConfigError::new(format!("failed to parse {}: {e}", path.display())))
}

/// An explicit `--config` must exist; otherwise the nearest `vigil.toml` above
/// `start` is used, and defaults when there is none.
pub fn resolve_config(explicit: Option<&Path>, start: &Path) -> Result<Resolved, ConfigError> {
    let path = match explicit {
        Some(p) => Some(p.to_path_buf()),
        None => find_config(&absolutize(start)),
    };
    let config = match &path {
        Some(p) => load_config(p)?,
        None => Config::default(),
    };
    Ok(Resolved { path, config })
}

fn absolutize(p: &Path) -> PathBuf {
    if p.is_absolute() {
        return p.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(p))
        .unwrap_or_else(|_| p.to_path_buf())
}

impl Config {
    pub fn apply(&mut self, o: &Overrides) {
        if let Some(program) = &o.verifier {
            self.verifier.program = program.clone();
        }
        if !o.verifier_args.is_empty() {
            self.verifier.args = o.verifier_args.clone();
        }
        if let Some(secs) = o.timeout {
            self.verifier.timeout_secs = Some(secs);
        }
        if let Some(suffix) = &o.suffix {
            self.instrument.suffix = suffix.clone();
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.instrument.suffix.is_empty() {
            return Err(ConfigError::new(
                "instrument.suffix must not be empty (the instrumented file would replace its input)",
            ));
        }
        if self.instrument.suffix.contains(['/', '\\']) {
            return Err(ConfigError::new("instrument.suffix must not contain a path separator"));
        }
        if self.verifier.program.trim().is_empty() {
            return Err(ConfigError::new("verifier.program must not be empty"));
        }
        if self.verifier.timeout_secs == Some(0) {
            return Err(ConfigError::new("verifier.timeout_secs must be positive"));
        }
        if self.discovery.extension.is_empty() || self.discovery.extension.starts_with('.') {
            return Err(ConfigError::new("discovery.extension must be a bare extension such as \"py\""));
        }
        Ok(())
    }

    pub fn rule_config(&self) -> RuleConfig {
        RuleConfig {
            catch_all: self.instrument.catch_all.clone(),
            bare_except_is_catch_all: self.instrument.bare_except_is_catch_all,
            opaque_types: self.instrument.opaque_types.clone(),
        }
    }

    pub fn command_verifier(&self) -> CommandVerifier {
        CommandVerifier::new(self.verifier.program.clone(), self.verifier.args.clone())
            .with_timeout(self.verifier.timeout_secs.map(Duration::from_secs))
    }

    pub fn discovery_options(&self) -> DiscoveryOptions {
        DiscoveryOptions {
            extension: self.discovery.extension.clone(),
            exclude_dirs: self.discovery.exclude_dirs.clone(),
        }
    }
}
