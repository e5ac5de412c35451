#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, NamedSource};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use vigil_ast::LineIndex;
use vigil_instrument::RuleSet;
use vigil_verify::{
    BatchOrchestrator, CommandVerifier, JobRunner, TracingObserver, instrument_source, instrumented_path,
};

mod config;
mod report;

use config::{Config, Overrides};

#[derive(Parser, Debug)]
#[command(name = "vigil", version, about = "Insert runtime contract guards into Python sources and check them with CrossHair")]
struct Cli {
    /// Config file. Defaults to the nearest `vigil.toml` above the input.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log every inserted guard (same as `RUST_LOG=debug`)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Instrument one file, write `<stem>_instrumented.py`, and run the verifier on it
    File {
        /// Input .py file
        path: PathBuf,
    },

    /// Instrument and verify every source file under a directory, one at a time
    Dir {
        /// Root directory
        path: PathBuf,

        /// Write a JSON summary of every job to this path
        #[arg(long, value_name = "JSON")]
        report: Option<PathBuf>,
    },

    /// Print the instrumented source without running the verifier
    Instrument {
        /// Input .py file
        path: PathBuf,

        /// Write `<stem>_instrumented.py` instead of printing to stdout
        #[arg(long)]
        write: bool,
    },
}

impl Cmd {
    fn path(&self) -> &Path {
        match self {
            Cmd::File { path } | Cmd::Dir { path, .. } | Cmd::Instrument { path, .. } => path,
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    // A second init (only possible in tests) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with(tracing_subscriber::fmt::layer().without_time().with_writer(std::io::stderr))
        .try_init();
}

fn load_config(cli: &Cli) -> miette::Result<Config> {
    let resolved = config::resolve_config(cli.config.as_deref(), cli.cmd.path())?;
    if let Some(p) = &resolved.path {
        tracing::debug!(config = %p.display(), "loaded config");
    }
    let mut cfg = resolved.config;
    cfg.apply(&cli.overrides);
    cfg.validate()?;
    Ok(cfg)
}

fn main() -> miette::Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let cfg = load_config(&cli)?;

    match &cli.cmd {
        Cmd::File { path } => verify_file(path, &cfg),
        Cmd::Dir { path, report } => verify_dir(path, report.as_deref(), &cfg),
        Cmd::Instrument { path, write } => instrument_file(path, *write, &cfg),
    }
}

fn runner(cfg: &Config) -> JobRunner<CommandVerifier> {
    let verifier = cfg.command_verifier();
    tracing::debug!(
        program = verifier.program(),
        args = ?verifier.args(),
        timeout = ?verifier.timeout(),
        "verifier"
    );
    JobRunner::new(RuleSet::new(cfg.rule_config()), verifier).with_suffix(cfg.instrument.suffix.clone())
}

fn verify_file(path: &Path, cfg: &Config) -> miette::Result<ExitCode> {
    let job = runner(cfg).run(path, &mut TracingObserver);
    Ok(if job.failed_stage().is_some() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

fn verify_dir(path: &Path, report_out: Option<&Path>, cfg: &Config) -> miette::Result<ExitCode> {
    let batch = BatchOrchestrator::new(runner(cfg), cfg.discovery_options());
    let summary = batch.run(path, &mut TracingObserver)?;

    for (stage, count) in summary.failures_by_stage() {
        tracing::warn!(stage = %stage, count, "jobs failed");
    }
    if let Some(out) = report_out {
        report::write_batch_report(&summary, out)?;
        tracing::info!(report = %out.display(), "wrote report");
    }

    Ok(if summary.is_clean() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn instrument_file(path: &Path, write: bool, cfg: &Config) -> miette::Result<ExitCode> {
    let src = fs::read_to_string(path).into_diagnostic()?;
    let source = NamedSource::new(path.display().to_string(), src.clone());
    let rules = RuleSet::new(cfg.rule_config());
    let out = instrument_source(&src, &rules).map_err(|e| miette::Report::new(e).with_source_code(source))?;

    let lines = LineIndex::new(&src);
    for ins in &out.insertions {
        let (line, column) = lines.span_start(ins.anchor);
        tracing::debug!(
            kind = %ins.kind,
            scope = ins.scope.as_deref().unwrap_or("<module>"),
            line,
            column,
            "{}",
            ins.message
        );
    }

    if write {
        let target = instrumented_path(path, &cfg.instrument.suffix)
            .ok_or_else(|| miette::miette!("instrumented file for {} would overwrite the input", path.display()))?;
        fs::write(&target, &out.text).into_diagnostic()?;
        tracing::info!(output = %target.display(), guards = out.insertions.len(), "wrote instrumented file");
    } else {
        print!("{}", out.text);
    }
    Ok(ExitCode::SUCCESS)
}
