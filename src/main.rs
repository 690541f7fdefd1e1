use anyhow::Context;
use clap::Parser;
use llmdocs::{Config, HttpModel, Pipeline, Stage};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "llmdocs",
    version,
    author,
    about = "Condense a documentation corpus into one compact LLM reference",
    long_about = "Condense a documentation corpus into one compact LLM reference.\n\n\
    Documents are split into topic fragments, merged per topic, tree-reduced into a \
    single document, formatted and minified, then published as the next versioned \
    release candidate.\n\n\
    USAGE EXAMPLES:\n  \
      # Full run with config.yaml\n  \
      llmdocs\n\n  \
      # Re-run only the reduction with a wider tree\n  \
      llmdocs --stage reduce --ratio 6\n\n  \
      # Full run without publishing a release\n  \
      llmdocs --config jac.yaml --no-release -vv"
)]
struct Cli {
    /// Pipeline configuration file
    #[arg(short, long, default_value = "config.yaml", value_name = "FILE")]
    config: PathBuf,

    /// Run a single stage on the artifacts of a previous run
    #[arg(short, long, value_enum)]
    stage: Option<CliStage>,

    /// Branching factor of the reduction tree (overrides the config)
    #[arg(long)]
    ratio: Option<usize>,

    /// Size of every worker pool (overrides the config)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Skip the release stage of a full run
    #[arg(long)]
    no_release: bool,

    /// Verbose output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum CliStage {
    /// Split documents into topic fragments
    Extract,
    /// Merge fragments per topic
    Merge,
    /// Tree-reduce topics into one document
    Reduce,
    /// Format and minify the unified document
    Compress,
    /// Publish the final document
    Release,
}

impl From<CliStage> for Stage {
    fn from(s: CliStage) -> Self {
        match s {
            CliStage::Extract => Self::Extract,
            CliStage::Merge => Self::Merge,
            CliStage::Reduce => Self::Reduce,
            CliStage::Compress => Self::Compress,
            CliStage::Release => Self::Release,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_tracing(cli.verbose)?;

    let mut config = Config::load(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;

    if let Some(ratio) = cli.ratio {
        config.hierarchical_merge.ratio = Some(ratio);
    }
    if let Some(workers) = cli.workers {
        config.processing.max_workers = workers;
        config.merge.max_workers = workers;
        config.merge.chunk_workers = workers;
        config.hierarchical_merge.max_workers = workers;
    }
    config.validate().context("Invalid command line overrides")?;

    let model = HttpModel::from_config(&config.llm).context("Failed to create model client")?;

    let pipeline = Pipeline::new(config, Arc::new(model))
        .context("Failed to create pipeline")?
        .with_release(!cli.no_release);

    let stats = match cli.stage {
        Some(stage) => {
            let stage = Stage::from(stage);
            pipeline
                .run_stage(stage)
                .with_context(|| format!("Stage {stage} failed"))?
        }
        None => pipeline.run().context("Pipeline execution failed")?,
    };

    stats.print_summary();
    Ok(())
}

fn setup_tracing(verbosity: u8) -> anyhow::Result<()> {
    let filter = match verbosity {
        0 => EnvFilter::new("llmdocs=info"),
        1 => EnvFilter::new("llmdocs=debug"),
        _ => EnvFilter::new("llmdocs=trace"),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_thread_ids(false))
        .try_init()
        .context("Failed to initialize logging")?;

    Ok(())
}
