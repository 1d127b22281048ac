//! The `pipewright` command-line front-end.
//!
//! Thin glue over the library: load a description, bind inputs, run a goal
//! (or an explicit invalidation), write outputs. Errors print the specific
//! error kind to stderr and the process exits non-zero.

use std::fs::{self, File};
use std::process::ExitCode;

use anyhow::{Context as _, bail};
use camino::Utf8PathBuf;
use clap::Parser;
use console::style;
use tracing::info;

use crate::blueprint::Blueprint;
use crate::context::Context;
use crate::registry::Registry;
use crate::runner::{Goal, GoalEntry, Runner};
use crate::storage::Storage;
use crate::target::{Target, TargetSet};

#[derive(Debug, Parser)]
#[command(name = "pipewright", version, about = "Declarative pipeline runner")]
pub struct Cli {
    /// Pipeline description file.
    #[arg(short = 'P', long = "pipeline", value_name = "FILE")]
    pipeline: Utf8PathBuf,

    /// Input binding: read FILE into a container (`step:container:file`).
    #[arg(short = 'i', long = "input", value_name = "BINDING")]
    inputs: Vec<String>,

    /// Output binding: write a container to FILE (`step:container:file`).
    #[arg(short = 'o', long = "output", value_name = "BINDING")]
    outputs: Vec<String>,

    /// Default step for goal targets written without one.
    #[arg(long = "step", value_name = "NAME")]
    step: Option<String>,

    /// Activate a flag for `EnabledWhen` gating. Repeatable.
    #[arg(short = 'f', long = "flag", value_name = "FLAG")]
    flags: Vec<String>,

    /// Persistent working directory for artifacts.
    #[arg(short = 'p', long = "persist", value_name = "DIR")]
    persist: Option<Utf8PathBuf>,

    /// Invalidate targets (`step:container:path:Kind`) instead of running.
    #[arg(long = "invalidate", value_name = "TARGET")]
    invalidate: Vec<String>,

    /// Goal targets: `step:container:path:Kind` (or `container:path:Kind`
    /// with `--step`). Path components are `/`-separated, `*` is a wildcard.
    #[arg(value_name = "TARGET")]
    targets: Vec<String>,
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    match execute(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("{} {error:#}", style("error:").red().bold());
            ExitCode::FAILURE
        }
    }
}

fn execute(cli: Cli) -> anyhow::Result<()> {
    let mut ctx = Context::new(Registry::with_defaults()?);
    for flag in &cli.flags {
        ctx.set_flag(flag.clone());
    }

    let text = fs::read_to_string(&cli.pipeline)
        .with_context(|| format!("reading pipeline description `{}`", cli.pipeline))?;
    let steps = Blueprint::from_yaml(&text)?.resolve(ctx.registry())?;
    let mut runner = Runner::new(steps)?;

    if let Some(dir) = &cli.persist {
        let storage = Storage::open(dir.clone())?;
        storage.load_globals(&mut ctx)?;
        runner.set_storage(storage);
    }

    for binding in &cli.inputs {
        let (step, container, file) = parse_binding(binding)?;
        let bytes =
            fs::read(&file).with_context(|| format!("reading input `{file}`"))?;
        runner.bind_input(step, container, bytes)?;
    }

    if !cli.invalidate.is_empty() {
        for spec in &cli.invalidate {
            let (step, container, targets) = parse_target(spec, cli.step.as_deref(), &ctx)?;
            let report = runner.invalidate(&ctx, step, container, &targets)?;
            for entry in &report.entries {
                info!(
                    step = entry.step.as_str(),
                    container = entry.container.as_str(),
                    targets = %entry.removed.display(ctx.registry().taxonomy()),
                    "invalidated"
                );
            }
        }
        return Ok(());
    }

    let mut goal: Goal = Vec::new();
    for spec in &cli.targets {
        let (step, container, targets) = parse_target(spec, cli.step.as_deref(), &ctx)?;
        goal.push(GoalEntry::new(step, container, targets));
    }
    if goal.is_empty() {
        bail!("no goal targets given");
    }

    let report = runner.run(&mut ctx, &goal)?;
    for (entry, satisfied) in &report.satisfied {
        info!(
            step = entry.step.as_str(),
            container = entry.container.as_str(),
            targets = %satisfied.display(ctx.registry().taxonomy()),
            "materialized"
        );
    }

    for binding in &cli.outputs {
        let (step, container, file) = parse_binding(binding)?;
        let mut sink = File::create(file)
            .with_context(|| format!("creating output `{file}`"))?;
        runner.export(&ctx, step, container, &mut sink)?;
    }

    Ok(())
}

/// Parses `step:container:file`.
fn parse_binding(text: &str) -> anyhow::Result<(&str, &str, &str)> {
    let mut parts = text.splitn(3, ':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(step), Some(container), Some(file)) if !file.is_empty() => {
            Ok((step, container, file))
        }
        _ => bail!("malformed binding `{text}`, expected `step:container:file`"),
    }
}

/// Parses `step:container:path:Kind`, or `container:path:Kind` when a
/// default step is given.
fn parse_target<'a>(
    text: &'a str,
    default_step: Option<&'a str>,
    ctx: &Context,
) -> anyhow::Result<(&'a str, &'a str, TargetSet)> {
    let parts: Vec<&str> = text.split(':').collect();

    let (step, container, path, kind) = match (parts.as_slice(), default_step) {
        ([step, container, path, kind], _) => (*step, *container, *path, *kind),
        ([container, path, kind], Some(step)) => (step, *container, *path, *kind),
        _ => bail!("malformed target `{text}`, expected `step:container:path:Kind`"),
    };

    let tax = ctx.registry().taxonomy();
    let kind = tax.kind_named(kind)?;
    let target = Target::parse(kind, path, tax)?;

    Ok((step, container, [target].into_iter().collect()))
}

/// Installs the fmt + indicatif tracing stack. `RUST_LOG` filters as usual.
#[cfg(feature = "logging")]
pub fn init_tracing() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let indicatif_layer = tracing_indicatif::IndicatifLayer::new();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(indicatif_layer.get_stderr_writer()),
        )
        .with(indicatif_layer)
        .init();
}
