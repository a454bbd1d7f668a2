//! CLI command definitions and run orchestration for orbitforge.
//!
//! Wires the subsystems together: parameter loading, discovery or
//! resume, collaborator pre-flight checks, pool dispatch, and the
//! checkpoint reports.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use crate::config::ParameterSet;
use crate::discover::{discover_jobs, OrbitRanges, Workspace};
use crate::error::EnvironmentError;
use crate::imaging::{CommandRenderer, CommandScorer};
use crate::job::Job;
use crate::pool::{Dispatch, WorkerPool, WorkerPoolConfig};
use crate::report::{
    parse_report, write_failed_report, write_summary, RunReport, FAILED_REPORT_FILE, SUMMARY_FILE,
};
use crate::stage::StageRunner;

/// Distribute orbit-keyed data fusion runs across a worker pool.
#[derive(Parser)]
#[command(name = "orbitforge")]
#[command(about = "Distribute orbit-keyed data fusion runs across a worker pool")]
#[command(version)]
#[command(
    long_about = "orbitforge walks an input tree for orbit granules, fans the conversion \
pipeline (convert, validate, image, compare) out across a bounded worker pool, and writes \
a resumable report of every job that did not fully succeed.\n\nExample usage:\n  \
orbitforge run ./bf-data ./af-out --orbits 37650-37670 -p AFconfig.txt --tool AFtool"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Discover granules for the requested orbits and run the pipeline.
    Run(RunArgs),

    /// Re-run only the jobs recorded in a failed-jobs report.
    ///
    /// Discovery is bypassed entirely; each job re-enters the pipeline
    /// at the stage it last reached.
    Resume(ResumeArgs),
}

/// Arguments for `orbitforge run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Directory of input Basic Fusion granules. Only give the
    /// top-level directory (the search is recursive).
    pub input_dir: PathBuf,

    /// Output root. Created if it doesn't exist.
    pub out_root: PathBuf,

    /// Inclusive orbit ranges, e.g. "37650-37670,38000".
    #[arg(long)]
    pub orbits: String,

    /// Conversion parameter-set file. Repeat for multiple
    /// configurations; each produces one job per discovered orbit.
    #[arg(short = 'p', long = "parameters", required = true)]
    pub parameters: Vec<PathBuf>,

    #[command(flatten)]
    pub exec: ExecArgs,
}

/// Arguments for `orbitforge resume`.
#[derive(Parser, Debug)]
pub struct ResumeArgs {
    /// Failed-jobs report written by a previous run.
    pub failed_report: PathBuf,

    /// Output root of the original run. A fresh run directory is
    /// allocated under it for this run's reports.
    pub out_root: PathBuf,

    #[command(flatten)]
    pub exec: ExecArgs,
}

/// Tooling and parallelism options shared by `run` and `resume`.
#[derive(Parser, Debug)]
pub struct ExecArgs {
    /// Worker pool size, including the coordinator's slot.
    #[arg(short = 'w', long, default_value = "4")]
    pub parallelism: usize,

    /// Conversion executable, invoked as `<tool> <config-file>`.
    #[arg(long, env = "AF_TOOL")]
    pub tool: PathBuf,

    /// Header-dump validator, invoked as `<dump-tool> -H <artifact>`.
    #[arg(long, env = "AF_DUMP_TOOL", default_value = "h5dump")]
    pub dump_tool: PathBuf,

    /// Image renderer, invoked as `<render-tool> <artifact> <dataset>
    /// <out> <index>...`. Required when a parameter set requests images.
    #[arg(long, env = "AF_RENDER_TOOL")]
    pub render_tool: Option<PathBuf>,

    /// Similarity scorer, invoked as `<score-tool> <left> <right>`.
    /// Required when a parameter set requests comparisons.
    #[arg(long, env = "AF_SCORE_TOOL")]
    pub score_tool: Option<PathBuf>,
}

/// Parses command-line arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Parses arguments and runs the selected command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Runs the selected command with already-parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_fresh(args).await,
        Commands::Resume(args) => run_resume(args).await,
    }
}

async fn run_fresh(args: RunArgs) -> anyhow::Result<()> {
    let mut sets = Vec::with_capacity(args.parameters.len());
    for path in &args.parameters {
        let set = ParameterSet::from_file(path)
            .with_context(|| format!("loading parameter set {}", path.display()))?;
        sets.push(set);
    }

    let ranges = OrbitRanges::parse(&args.orbits)?;
    let mut workspace = Workspace::create(&args.out_root)?;
    let jobs = discover_jobs(&args.input_dir, &ranges, &sets, &mut workspace)?;
    execute(jobs, &workspace, &args.exec).await
}

async fn run_resume(args: ResumeArgs) -> anyhow::Result<()> {
    let jobs = parse_report(&args.failed_report)
        .with_context(|| format!("parsing failed report {}", args.failed_report.display()))?;
    info!(
        jobs = jobs.len(),
        report = %args.failed_report.display(),
        "Resuming failed jobs"
    );
    let workspace = Workspace::create(&args.out_root)?;
    execute(jobs, &workspace, &args.exec).await
}

async fn execute(jobs: Vec<Job>, workspace: &Workspace, exec: &ExecArgs) -> anyhow::Result<()> {
    // Pre-flight: every collaborator must resolve before any dispatch.
    let tool = resolve_tool(&exec.tool)?;
    let dump_tool = resolve_tool(&exec.dump_tool)?;

    let wants_images = jobs.iter().any(|job| job.workflow.requests_images());
    let wants_compare = jobs.iter().any(|job| !job.workflow.compare.is_empty());

    let mut runner = StageRunner::new(tool, dump_tool);
    match (&exec.render_tool, wants_images) {
        (Some(path), _) => {
            runner = runner.with_renderer(Arc::new(CommandRenderer::new(resolve_tool(path)?)));
        }
        (None, true) => {
            anyhow::bail!("a parameter set requests images but no --render-tool is configured")
        }
        (None, false) => {}
    }
    match (&exec.score_tool, wants_compare) {
        (Some(path), _) => {
            runner = runner.with_scorer(Arc::new(CommandScorer::new(resolve_tool(path)?)));
        }
        (None, true) => {
            anyhow::bail!("a parameter set requests comparisons but no --score-tool is configured")
        }
        (None, false) => {}
    }

    let pool = WorkerPool::new(WorkerPoolConfig::new(exec.parallelism), Arc::new(runner));
    let (outcomes, _stats) = pool.dispatch(jobs).await?;

    let summary_path = workspace.run_dir().join(SUMMARY_FILE);
    write_summary(&summary_path, &outcomes)?;
    let failed_path = workspace.run_dir().join(FAILED_REPORT_FILE);
    let failed_records = write_failed_report(&failed_path, &outcomes)?;

    let report = RunReport::from_outcomes(&outcomes);
    info!(
        failed = report.failed,
        total = report.total,
        failure_pct = format!("{:.1}%", report.failure_pct()),
        summary = %summary_path.display(),
        failed_report = %failed_path.display(),
        failed_records,
        "Run complete"
    );
    Ok(())
}

/// Resolves a collaborator executable: explicit paths must exist, bare
/// names are searched on PATH.
fn resolve_tool(tool: &Path) -> Result<PathBuf, EnvironmentError> {
    if tool.components().count() > 1 {
        return if tool.is_file() {
            Ok(tool.to_path_buf())
        } else {
            Err(EnvironmentError::ToolMissing(tool.to_path_buf()))
        };
    }
    let name = tool.to_string_lossy().to_string();
    let path_var = std::env::var_os("PATH").unwrap_or_default();
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(&name);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    Err(EnvironmentError::ToolNotFound(name))
}
