use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use tch::Device;

use wrn_verif::configs::{Config, VAL_FREQ};
use wrn_verif::data::Omniglot;
use wrn_verif::metadata::persist_run;
use wrn_verif::runner::{request_stop, Trainer};


/// Train a wide residual network as a siamese verifier on Omniglot.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Experiment name, used to name the result files.
    #[arg(short = 'n', long, default_value = "w_o_test")]
    expt_name: String,
    /// Global learning rate.
    #[arg(short = 'l', long, default_value_t = 1e-3)]
    learning_rate: f64,
    /// Side of the square input image.
    #[arg(short = 'i', long, default_value_t = 32)]
    image_size: i64,
    /// Number of pairs per training batch.
    #[arg(short = 'b', long, default_value_t = 32)]
    batch_size: i64,
    /// Report test set results with the best parameters.
    #[arg(short = 't', long, default_value_t = false)]
    testing: bool,
    /// Number of iterations to train for.
    #[arg(short = 'm', long, default_value_t = 100_000)]
    max_iter: u64,
    /// Residual blocks per stage; the network is 3d+4 blocks deep.
    #[arg(short = 'd', long, default_value_t = 16)]
    depth: i64,
    /// Width multiplier of every stage.
    #[arg(short = 'k', long, default_value_t = 4)]
    width: i64,
    /// Validate every N iterations.
    #[arg(long, default_value_t = VAL_FREQ)]
    val_freq: u64,
    /// Omniglot array shaped (classes, drawers, height, width).
    #[arg(long, default_value = "data/omniglot.npy")]
    data: PathBuf,
    /// Directory receiving the .mtd and .params files.
    #[arg(long, default_value = "results")]
    results_dir: PathBuf,
    /// Seed for weight init, dropout and batch sampling.
    #[arg(long)]
    seed: Option<u64>,
}

impl From<&Args> for Config {
    fn from(args: &Args) -> Self {
        Config {
            expt_name: args.expt_name.clone(),
            learning_rate: args.learning_rate,
            image_size: args.image_size,
            batch_size: args.batch_size,
            testing: args.testing,
            max_iter: args.max_iter,
            depth: args.depth,
            width: args.width,
            val_freq: args.val_freq,
            seed: args.seed,
            ..Default::default()
        }
    }
}


fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let cfg = Config::from(&args);
    if let serde_json::Value::Object(fields) = serde_json::to_value(&cfg)? {
        for (name, value) in fields.iter() {
            info!("{} {}", name, value);
        }
    }

    // The first Ctrl-C ends training gracefully and results are still written.
    // Outside the training loop it aborts the test phase. A second one exits.
    let stop = Arc::new(AtomicBool::new(false));
    let handler_stop = stop.clone();
    ctrlc::set_handler(move || {
        if request_stop(&handler_stop) {
            warn!("interrupt received, finishing up");
        } else {
            warn!("interrupt received again, exiting");
            std::process::exit(130);
        }
    })
    .context("installing interrupt handler")?;

    info!("... loading dataset from {}", args.data.display());
    let worker = Omniglot::load(&args.data, cfg.image_size, cfg.data_split, cfg.seed)
        .with_context(|| format!("loading {}", args.data.display()))?;

    info!("... setting up the network");
    let device = Device::cuda_if_available();
    info!("using device {:?}", device);
    let mut trainer = Trainer::new(cfg, device, worker, stop)?;

    let state = trainer.run()?;

    let paths = persist_run(&args.results_dir, &state.metadata, &state.best.params)?;
    info!("... wrote {} and {}", paths.metadata.display(), paths.params.display());
    info!("... exiting ...");
    Ok(())
}
