//! FCN8 training entry point.
//!
//! ```bash
//! # Defaults: FCN8, RMSprop, CVC-612 for training and CVC-300 for validation
//! cargo run --release --bin fcn8-train
//!
//! # JSON config with command line overrides
//! cargo run --release --bin fcn8-train -- --config polyp.json --optimizer adam --patience 20
//!
//! # GPU backend
//! cargo run --release --bin fcn8-train --features wgpu
//! ```
//!
//! Log verbosity follows `RUST_LOG` and defaults to `info`.

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use burn::config::Config;
use clap::Parser;
use fcn8_burn::{
    backend::{backend_name, create_device, TrainingBackend},
    run_training, ModelName, OptimizerName, TrainingConfig,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Train an FCN8 segmentation network", long_about = None)]
struct Args {
    /// JSON training configuration; defaults are used when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Dataset label used in logs
    #[arg(long)]
    dataset: Option<String>,

    /// Model name (fcn8, fcn8_bn)
    #[arg(long)]
    model: Option<ModelName>,

    /// Optimizer name (rmsprop, adam, adamw, sgd)
    #[arg(long)]
    optimizer: Option<OptimizerName>,

    #[arg(long)]
    learning_rate: Option<f64>,

    #[arg(long)]
    weight_decay: Option<f64>,

    #[arg(long)]
    num_epochs: Option<usize>,

    /// Epochs without validation improvement before stopping
    #[arg(long)]
    patience: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,

    /// Channels of the fc6/fc7 layers
    #[arg(long)]
    fc_channels: Option<usize>,

    /// Root of the training split
    #[arg(long)]
    train_path: Option<PathBuf>,

    /// Root of the validation split
    #[arg(long)]
    val_path: Option<PathBuf>,

    /// Crop size as HEIGHT WIDTH
    #[arg(long, num_args = 2, value_names = ["HEIGHT", "WIDTH"])]
    crop_size: Option<Vec<u32>>,

    /// Label values ignored by the loss, comma separated
    #[arg(long, value_delimiter = ',', allow_negative_numbers = true)]
    void_classes: Option<Vec<i64>>,

    /// Output directory for the checkpoint, history and config
    #[arg(long)]
    savepath: Option<PathBuf>,

    /// Model record to start from
    #[arg(long)]
    load_weights: Option<PathBuf>,
}

impl Args {
    fn apply(self, config: &mut TrainingConfig) {
        if let Some(dataset) = self.dataset {
            config.dataset_name = dataset;
        }
        if let Some(model) = self.model {
            config.model = model;
        }
        if let Some(optimizer) = self.optimizer {
            config.optimizer = optimizer;
        }
        if let Some(learning_rate) = self.learning_rate {
            config.learning_rate = learning_rate;
        }
        if let Some(weight_decay) = self.weight_decay {
            config.weight_decay = weight_decay;
        }
        if let Some(num_epochs) = self.num_epochs {
            config.num_epochs = num_epochs;
        }
        if let Some(patience) = self.patience {
            config.patience = patience;
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(fc_channels) = self.fc_channels {
            config.fc_channels = fc_channels;
        }
        if let Some(train_path) = self.train_path {
            config.dataset.train_path = train_path;
        }
        if let Some(val_path) = self.val_path {
            config.dataset.val_path = val_path;
        }
        if let Some(&[height, width]) = self.crop_size.as_deref() {
            config.dataset.crop_size = [height, width];
        }
        if let Some(void_classes) = self.void_classes {
            config.void_classes = void_classes;
        }
        if let Some(savepath) = self.savepath {
            config.savepath = savepath;
        }
        if self.load_weights.is_some() {
            config.load_weights = self.load_weights;
        }
    }
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => TrainingConfig::load(path).map_err(|err| {
            anyhow!("Failed to load config file {}: {err}", path.display())
        })?,
        None => TrainingConfig::new(),
    };
    args.apply(&mut config);

    tracing::info!(backend = backend_name(), "selected backend");
    let outcome = run_training::<TrainingBackend>(&config, create_device())
        .context("Training failed")?;

    if let Some(best) = outcome.history.best_valid_loss {
        tracing::info!(
            best_valid_loss = best,
            savepath = %config.savepath.display(),
            "best model saved"
        );
    }
    Ok(())
}
