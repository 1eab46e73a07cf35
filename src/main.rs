use std::process::ExitCode;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use clap::{Parser, Subcommand};
use console::style;

use hicflow::graph::shell_quote;
use hicflow::{
    BuildConfig, BuildReport, CommandPopulator, CommandSimulator, DEFAULT_CONCURRENCY, Workflow,
};

#[derive(Parser, Debug, Clone)]
#[command(version, about = "Incremental builds of Hi-C structure projects")]
struct Args {
    /// Root of all generated output [default: <DIR>/.build]
    #[arg(long, global = true)]
    output: Option<Utf8PathBuf>,

    /// Number of simulations allowed to run at the same time
    #[arg(short, long, global = true, default_value_t = DEFAULT_CONCURRENCY)]
    jobs: usize,

    /// Program run once per stale dataset
    #[arg(long, global = true, default_value = "hic2structure")]
    simulator: String,

    /// Program loading the finished manifest into the catalog
    #[arg(long, global = true)]
    populator: Option<String>,

    /// Directory passed to the populator after the output root
    #[arg(long, global = true)]
    server_dir: Option<Utf8PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Create a new project with a documented project file
    Template {
        #[arg(default_value = "hicflow_project")]
        dir: Utf8PathBuf,
    },
    /// Run the full pipeline, recomputing only stale datasets
    Build { dir: Utf8PathBuf },
    /// Rebuild incrementally; identical to `build` when nothing changed
    Run { dir: Utf8PathBuf },
    /// Write a ninja build description into the output root
    Configure {
        dir: Utf8PathBuf,
        /// File that must exist before populating, without triggering it
        #[arg(long)]
        version_marker: Option<Utf8PathBuf>,
    },
    /// Rewrite the settings stamp if the settings changed
    #[command(hide = true)]
    Stamp { dir: Utf8PathBuf },
    /// Run the simulation of a single dataset unconditionally
    #[command(hide = true)]
    Compute { dir: Utf8PathBuf, index: usize },
    /// Assemble the manifest from outputs on disk
    #[command(hide = true)]
    Assemble { dir: Utf8PathBuf },
    /// Populate the catalog from the manifest
    #[command(hide = true)]
    Populate { dir: Utf8PathBuf },
}

fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(err) = hicflow::init_logging() {
        eprintln!("Couldn't initialize logging: {err}");
    }

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err}", style("error:").red().bold());
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> anyhow::Result<()> {
    match &args.command {
        Command::Template { dir } => {
            let file = hicflow::scaffold(dir)?;
            eprintln!("Created project file {}", style(file).yellow());
        }
        Command::Build { dir } => build(args, dir, "build")?,
        Command::Run { dir } => build(args, dir, "run")?,
        Command::Configure {
            dir,
            version_marker,
        } => {
            let workflow = load(args, dir)?;
            let path = workflow.configure(&invocation(args)?, version_marker.as_deref())?;
            eprintln!("Wrote build description to {}", style(path).yellow());
        }
        Command::Stamp { dir } => {
            load(args, dir)?.stamp()?;
        }
        Command::Compute { dir, index } => {
            load(args, dir)?.compute(*index)?;
        }
        Command::Assemble { dir } => {
            load(args, dir)?.assemble()?;
        }
        Command::Populate { dir } => {
            let workflow = load(args, dir)?;
            if !workflow.populate()? {
                anyhow::bail!("No catalog populator configured, pass --populator");
            }
        }
    }

    Ok(())
}

fn build(args: &Args, dir: &Utf8Path, mode: &str) -> anyhow::Result<()> {
    eprintln!(
        "Running {} in {} mode.",
        style("hicflow").red(),
        style(mode).blue()
    );

    let report = load(args, dir)?.build()?;
    print_report(&report);

    Ok(())
}

fn load(args: &Args, dir: &Utf8Path) -> anyhow::Result<Workflow> {
    let dir = dir
        .canonicalize_utf8()
        .with_context(|| format!("Couldn't open project directory '{dir}'"))?;

    let mut config = BuildConfig::new(dir).with_concurrency(args.jobs);
    if let Some(output) = &args.output {
        config = config.with_output_root(absolute(output)?);
    }

    let workflow = Workflow::load(config, CommandSimulator::new(&args.simulator))?;

    Ok(match &args.populator {
        Some(program) => {
            let mut populator = CommandPopulator::new(program);
            if let Some(server_dir) = &args.server_dir {
                populator = populator.with_server_dir(absolute(server_dir)?);
            }
            workflow.with_populator(populator)
        }
        None => workflow,
    })
}

fn absolute(path: &Utf8Path) -> anyhow::Result<Utf8PathBuf> {
    Ok(camino::absolute_utf8(path)?)
}

/// Command line the generated build rules use to call back into this binary.
fn invocation(args: &Args) -> anyhow::Result<String> {
    let exe = std::env::current_exe().context("Couldn't locate the hicflow executable")?;
    let exe = Utf8PathBuf::try_from(exe)?;

    let mut words = vec![
        exe.to_string(),
        "--jobs".into(),
        args.jobs.to_string(),
        "--simulator".into(),
        args.simulator.clone(),
    ];

    if let Some(output) = &args.output {
        words.extend(["--output".into(), absolute(output)?.to_string()]);
    }
    if let Some(populator) = &args.populator {
        words.extend(["--populator".into(), populator.clone()]);
    }
    if let Some(server_dir) = &args.server_dir {
        words.extend(["--server-dir".into(), absolute(server_dir)?.to_string()]);
    }

    Ok(words
        .iter()
        .map(|word| shell_quote(word))
        .collect::<Vec<_>>()
        .join(" "))
}

fn print_report(report: &BuildReport) {
    eprintln!(
        "Simulated {} dataset(s), reused {}.",
        style(report.dispatched.len()).green(),
        style(report.fresh.len()).green()
    );
    if report.populated {
        eprintln!("Catalog populated.");
    }
    eprintln!("Manifest written to {}", style(&report.manifest).yellow());
}
