use std::sync::Arc;

use anyhow::Context;
use camino::Utf8PathBuf;
use clap::{ArgAction, Parser};
use console::style;
use shippy::{Config, Environment, Mode, Step};
use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Build the assets of a static site, or serve them with live reload.
#[derive(Parser, Debug)]
#[command(name = "shippy", version, about)]
struct Args {
    /// Task or sequence to run.
    #[arg(default_value = "default")]
    task: String,

    /// Configuration file, `Shippy.toml` in the working directory by default.
    #[arg(long, short)]
    config: Option<Utf8PathBuf>,

    /// Print the available tasks and sequences.
    #[arg(long)]
    list: bool,

    /// Print the task graph as a Mermaid diagram.
    #[arg(long)]
    graph: bool,

    /// More output, repeat for even more.
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(verbose: u8) {
    let filter = match verbose {
        0 => "shippy=info",
        1 => "shippy=debug",
        _ => "shippy=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    let indicatif_layer = IndicatifLayer::new();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(indicatif_layer.get_stderr_writer()),
        )
        .with(indicatif_layer)
        .init();
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let config = Arc::new(Config::load(args.config.as_deref())?);
    let graph = shippy::tasks::registry(config.clone()).validate()?;

    if args.list {
        for name in graph.tasks() {
            println!("{name}");
        }
        for (name, sequence) in graph.sequences() {
            let steps: Vec<String> = sequence
                .steps()
                .iter()
                .map(|step| match step {
                    Step::Task(name) => name.clone(),
                    Step::Group(names) => format!("{{{}}}", names.join(", ")),
                })
                .collect();
            println!("{name}: {}", steps.join(" -> "));
        }
        return Ok(());
    }

    if args.graph {
        print!("{graph}");
        return Ok(());
    }

    let mode = graph.mode_for(&args.task)?;
    let env = match mode {
        Mode::Build => Environment::build(),
        Mode::Watch => Environment::watch(config.server.reload_port)
            .context("couldn't reserve the live reload port")?,
    };

    eprintln!(
        "Running {} {} in {} mode.",
        style("Shippy").red(),
        style(&args.task).bold(),
        style(match mode {
            Mode::Build => "build",
            Mode::Watch => "watch",
        })
        .blue()
    );

    graph.run_entry(&args.task, &env)?;

    Ok(())
}
