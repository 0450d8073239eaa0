#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use metric_pipeline::catalog::CatalogOptions;
use metric_pipeline::dataloader::{
    available_producers, wall_clock_seed, DimensionPolicy, PipelineConfig,
    DEFAULT_MIN_LEARNING_RATE, DEFAULT_QUEUE_CAPACITY,
};
use metric_pipeline::logging::init_tracing;
use metric_pipeline::{EngineConfig, Trainer};
use tracing::info;

const DEFAULT_SYNC_FILE: &str = "face_metric_sync";

#[derive(Debug, Parser)]
#[command(name = "metric-train", version, about = "Train a metric-learning embedding from per-identity image folders")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Train on `<dir>/<identity>/<image>` and write the final model to `out_file`.
    Train(TrainArgs),
}

#[derive(Debug, Args)]
struct TrainArgs {
    /// Corpus root with one sub-directory per identity.
    dir: PathBuf,

    /// Distinct identities per mini-batch.
    num_people: usize,

    /// Images drawn per identity.
    samples_per_id: usize,

    /// Steps without progress before the learning rate shrinks.
    threshold: u64,

    /// Where the final model is written.
    out_file: PathBuf,

    /// Base seed for the producer RNGs. Defaults to wall-clock seconds.
    #[arg(long, env = "METRIC_PIPELINE_SEED")]
    seed: Option<u64>,

    /// Producer threads. Defaults to the number of processing units.
    #[arg(long, env = "METRIC_PIPELINE_PRODUCERS")]
    producers: Option<usize>,

    #[arg(long, env = "METRIC_PIPELINE_QUEUE_CAPACITY", default_value_t = DEFAULT_QUEUE_CAPACITY)]
    queue_capacity: usize,

    /// Resize every image to WxH after decoding, e.g. `150x150`.
    #[arg(long, env = "METRIC_PIPELINE_RESIZE", value_parser = parse_dimensions)]
    resize: Option<(u32, u32)>,

    /// Discard and resample batches with mixed image sizes instead of stopping.
    #[arg(long, env = "METRIC_PIPELINE_RETRY_ON_DIMENSION_MISMATCH", default_value_t = false)]
    retry_on_dimension_mismatch: bool,

    #[arg(long, env = "METRIC_PIPELINE_MIN_LEARNING_RATE", default_value_t = DEFAULT_MIN_LEARNING_RATE)]
    min_learning_rate: f64,

    /// Checkpoint written periodically and resumed from on start.
    #[arg(long, env = "METRIC_PIPELINE_SYNC_FILE", default_value = DEFAULT_SYNC_FILE)]
    sync_file: PathBuf,

    /// Neither resume from nor write a checkpoint.
    #[arg(long, env = "METRIC_PIPELINE_NO_SYNC_FILE", default_value_t = false)]
    no_sync_file: bool,

    #[arg(long, env = "METRIC_PIPELINE_SYNC_INTERVAL_SECS", default_value_t = 300)]
    sync_interval_secs: u64,

    /// Give up when no batch arrives for this long.
    #[arg(long, env = "METRIC_PIPELINE_DEQUEUE_TIMEOUT_SECS")]
    dequeue_timeout_secs: Option<u64>,

    /// Image extensions to keep. Every file is kept when omitted.
    #[arg(long, env = "METRIC_PIPELINE_EXTENSIONS", value_delimiter = ',')]
    extensions: Vec<String>,

    #[arg(long, env = "METRIC_PIPELINE_LEARNING_RATE", default_value_t = 0.1)]
    learning_rate: f64,
}

fn parse_dimensions(s: &str) -> Result<(u32, u32), String> {
    let (w, h) = s
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got {s:?}"))?;
    let parse = |v: &str| {
        v.trim()
            .parse::<u32>()
            .map_err(|e| format!("bad dimension {v:?}: {e}"))
    };
    Ok((parse(w)?, parse(h)?))
}

impl TrainArgs {
    fn pipeline_config(&self) -> PipelineConfig {
        let extensions: Vec<&str> = self.extensions.iter().map(String::as_str).collect();
        let policy = if self.retry_on_dimension_mismatch {
            DimensionPolicy::Retry
        } else {
            DimensionPolicy::Strict
        };

        let mut builder = PipelineConfig::builder()
            .num_people(self.num_people)
            .samples_per_id(self.samples_per_id)
            .queue_capacity(self.queue_capacity)
            .num_producers(self.producers.unwrap_or_else(available_producers))
            .seed(self.seed.unwrap_or_else(wall_clock_seed))
            .dimension_policy(policy)
            .min_learning_rate(self.min_learning_rate)
            .sync_interval(Duration::from_secs(self.sync_interval_secs))
            .catalog_options(CatalogOptions::default().with_extensions(&extensions));
        if let Some((w, h)) = self.resize {
            builder = builder.resize(w, h);
        }
        if !self.no_sync_file {
            builder = builder.sync_file(self.sync_file.clone());
        }
        if let Some(secs) = self.dequeue_timeout_secs {
            builder = builder.dequeue_timeout(Duration::from_secs(secs));
        }
        builder.build()
    }

    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            learning_rate: self.learning_rate,
            ..EngineConfig::default()
        }
        .with_patience(self.threshold)
    }
}

fn train(args: TrainArgs) -> Result<()> {
    let config = args.pipeline_config();
    info!(
        producers = config.num_producers,
        queue_capacity = config.queue_capacity,
        seed = config.base_seed,
        "starting metric-train"
    );

    let trainer = Trainer::new(config, args.engine_config())?;
    let outcome = trainer
        .train(&args.dir)
        .with_context(|| format!("training on {} failed", args.dir.display()))?;

    outcome
        .model
        .save(&args.out_file)
        .with_context(|| format!("could not write model to {}", args.out_file.display()))?;
    info!(
        out_file = %args.out_file.display(),
        steps = outcome.steps,
        learning_rate = outcome.final_learning_rate,
        reason = ?outcome.stop_reason,
        batches = outcome.pool.batches_produced,
        "model saved"
    );
    Ok(())
}

fn main() -> Result<()> {
    init_tracing();
    match Cli::parse().command {
        Command::Train(args) => train(args),
    }
}
