//! Training loop with early stopping and best-model checkpointing.
//!
//! [`Trainer::fit`] alternates one optimization pass over the training loader
//! with one evaluation pass over the validation loader. The validation loss
//! drives both early stopping and checkpointing: every improvement writes
//! `best_model.mpk` to the checkpoint directory, and the best model is what
//! `fit` hands back.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use burn::{
    data::dataloader::{DataLoader, DataLoaderBuilder},
    grad_clipping::GradientClippingConfig,
    module::AutodiffModule,
    optim::{
        decay::WeightDecayConfig, AdamConfig, AdamWConfig, GradientsParams, Optimizer,
        RmsPropConfig, SgdConfig,
    },
    prelude::*,
    record::CompactRecorder,
    tensor::{backend::AutodiffBackend, cast::ToElement},
};
use serde::{Deserialize, Serialize};

use crate::{
    config::{OptimizerName, TrainingConfig},
    dataset::{
        SegmentationBatch, SegmentationBatcher, SegmentationDataset, SegmentationItem, Split,
    },
    error::{Fcn8Result, TrainingError},
    losses::{FlatCrossEntropyLoss, FlatCrossEntropyLossConfig},
    models::{build_model, Fcn8},
};

/// File name of the best checkpoint inside the checkpoint directory.
pub const BEST_MODEL_FILE: &str = "best_model.mpk";
pub const HISTORY_FILE: &str = "history.json";
pub const CONFIG_FILE: &str = "config.json";

/// A model that maps NCHW images to NCHW class scores.
pub trait SegmentationModel<B: Backend>: Module<B> {
    /// # Shapes
    ///
    /// - images: `[batch, 3, height, width]`
    /// - output: `[batch, num_classes, height, width]`
    fn logits(&self, images: Tensor<B, 4>) -> Tensor<B, 4>;

    /// Run the model on a channels-last batch and score it with `loss`.
    fn forward_loss(
        &self,
        batch: SegmentationBatch<B>,
        loss: &FlatCrossEntropyLoss,
    ) -> Fcn8Result<SegmentationOutput<B>> {
        let logits = self
            .logits(batch.images.permute([0, 3, 1, 2]))
            .permute([0, 2, 3, 1]);
        let value = loss.forward(logits.clone(), batch.labels.clone())?;

        Ok(SegmentationOutput {
            loss: value,
            logits,
            labels: batch.labels,
        })
    }
}

impl<B: Backend> SegmentationModel<B> for Fcn8<B> {
    fn logits(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        self.forward(images)
    }
}

/// Result of one forward pass with loss.
#[derive(Debug, Clone)]
pub struct SegmentationOutput<B: Backend> {
    pub loss: Tensor<B, 1>,
    /// Class scores, `[batch, height, width, num_classes]`.
    pub logits: Tensor<B, 4>,
    pub labels: Tensor<B, 3, Int>,
}

/// Outcome of an early-stopping check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoppingDecision {
    Improved,
    Stalled,
    Stop,
}

/// Stops training once the monitored loss has not improved by more than
/// `min_delta` for `patience` consecutive epochs.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    min_delta: f64,
    best_loss: f64,
    epochs_without_improvement: usize,
}

impl EarlyStopping {
    pub fn new(patience: usize, min_delta: f64) -> Self {
        Self {
            patience,
            min_delta,
            best_loss: f64::INFINITY,
            epochs_without_improvement: 0,
        }
    }

    pub fn best_loss(&self) -> f64 {
        self.best_loss
    }

    pub fn update(&mut self, loss: f64) -> StoppingDecision {
        if loss < self.best_loss - self.min_delta {
            self.best_loss = loss;
            self.epochs_without_improvement = 0;
            return StoppingDecision::Improved;
        }

        self.epochs_without_improvement += 1;
        if self.epochs_without_improvement >= self.patience {
            StoppingDecision::Stop
        } else {
            StoppingDecision::Stalled
        }
    }
}

/// Losses of one finished epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    /// 1-based epoch number.
    pub epoch: usize,
    pub train_loss: f64,
    pub valid_loss: f64,
    pub improved: bool,
}

/// Per-epoch losses and the best validation result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub epochs: Vec<EpochRecord>,
    pub best_epoch: Option<usize>,
    pub best_valid_loss: Option<f64>,
    pub stopped_early: bool,
}

impl TrainingHistory {
    /// Write the history as pretty-printed JSON.
    pub fn save(&self, path: &Path) -> Result<(), TrainingError> {
        let json = serde_json::to_string_pretty(self).map_err(|err| TrainingError::Io {
            path: path.to_path_buf(),
            source: err.into(),
        })?;
        fs::write(path, json).map_err(|source| TrainingError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// A trained model and how it got there.
#[derive(Debug)]
pub struct FitOutcome<M> {
    /// The model with the lowest validation loss.
    pub model: M,
    pub history: TrainingHistory,
}

/// Settings of the fit loop.
#[derive(Config, Debug)]
pub struct TrainerConfig {
    pub max_epochs: usize,
    pub patience: usize,
    pub learning_rate: f64,
    /// Directory receiving `best_model.mpk`.
    pub checkpoint_dir: PathBuf,
    #[config(default = 0.0)]
    pub min_delta: f64,
}

impl TrainerConfig {
    pub fn init(&self, loss: FlatCrossEntropyLoss) -> Trainer {
        Trainer {
            config: self.clone(),
            loss,
        }
    }
}

/// Epoch loop over a train and a validation loader.
#[derive(Debug, Clone)]
pub struct Trainer {
    config: TrainerConfig,
    loss: FlatCrossEntropyLoss,
}

#[derive(Debug, Default)]
struct RunningLoss {
    total: f64,
    items: usize,
}

impl RunningLoss {
    fn push(&mut self, loss: f64, items: usize) {
        self.total += loss * items as f64;
        self.items += items;
    }

    /// Epoch mean, provided the loader delivered all `expected` items.
    fn finish(&self, split: &'static str, expected: usize) -> Result<f64, TrainingError> {
        if self.items == 0 {
            return Err(TrainingError::EmptyLoader { split });
        }
        if self.items != expected {
            return Err(TrainingError::IncompleteEpoch {
                split,
                seen: self.items,
                expected,
            });
        }
        Ok(self.total / self.items as f64)
    }
}

fn scalar<B: Backend>(loss: Tensor<B, 1>) -> f64 {
    loss.into_scalar().to_f64()
}

impl Trainer {
    pub fn best_model_path(&self) -> PathBuf {
        self.config.checkpoint_dir.join(BEST_MODEL_FILE)
    }

    /// Train until the epoch budget runs out or validation stalls.
    ///
    /// # Errors
    ///
    /// Aborts on a non-finite batch loss, an empty loader, a loader that stops
    /// short of its dataset, a loss error or a failed checkpoint write.
    pub fn fit<B, M, O>(
        &self,
        mut model: M,
        mut optim: O,
        train_loader: Arc<dyn DataLoader<B, SegmentationBatch<B>>>,
        valid_loader: Arc<dyn DataLoader<B::InnerBackend, SegmentationBatch<B::InnerBackend>>>,
    ) -> Fcn8Result<FitOutcome<M>>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B> + SegmentationModel<B>,
        M::InnerModule: SegmentationModel<B::InnerBackend>,
        O: Optimizer<M, B>,
    {
        let mut history = TrainingHistory::default();
        if self.config.max_epochs == 0 {
            return Ok(FitOutcome { model, history });
        }

        fs::create_dir_all(&self.config.checkpoint_dir).map_err(|source| TrainingError::Io {
            path: self.config.checkpoint_dir.clone(),
            source,
        })?;

        let mut early_stopping = EarlyStopping::new(self.config.patience, self.config.min_delta);
        let mut best_model = None;

        for epoch in 1..=self.config.max_epochs {
            let (trained, train_loss) = self.train_epoch(model, &mut optim, &*train_loader, epoch)?;
            model = trained;
            let valid_loss = self.valid_epoch(&model.valid(), &*valid_loader, epoch)?;

            let decision = early_stopping.update(valid_loss);
            let improved = decision == StoppingDecision::Improved;
            if improved {
                self.save_checkpoint::<B, M>(&model)?;
                best_model = Some(model.clone());
                history.best_epoch = Some(epoch);
                history.best_valid_loss = Some(valid_loss);
            }

            tracing::info!(
                epoch,
                max_epochs = self.config.max_epochs,
                train_loss,
                valid_loss,
                best_valid_loss = early_stopping.best_loss(),
                improved,
                "epoch finished"
            );
            history.epochs.push(EpochRecord {
                epoch,
                train_loss,
                valid_loss,
                improved,
            });

            if decision == StoppingDecision::Stop {
                tracing::info!(
                    epoch,
                    patience = self.config.patience,
                    best_epoch = history.best_epoch,
                    "validation loss stopped improving, stopping early"
                );
                history.stopped_early = true;
                break;
            }
        }

        Ok(FitOutcome {
            model: best_model.unwrap_or(model),
            history,
        })
    }

    fn train_epoch<B, M, O>(
        &self,
        mut model: M,
        optim: &mut O,
        loader: &dyn DataLoader<B, SegmentationBatch<B>>,
        epoch: usize,
    ) -> Fcn8Result<(M, f64)>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B> + SegmentationModel<B>,
        O: Optimizer<M, B>,
    {
        let mut running = RunningLoss::default();

        for (index, batch) in loader.iter().enumerate() {
            let batch_size = batch.images.dims()[0];
            let output = model.forward_loss(batch, &self.loss)?;

            let value = scalar(output.loss.clone().detach());
            if !value.is_finite() {
                return Err(TrainingError::NonFiniteLoss {
                    epoch,
                    batch: index + 1,
                    value,
                }
                .into());
            }

            let grads = GradientsParams::from_grads(output.loss.backward(), &model);
            model = optim.step(self.config.learning_rate, model, grads);
            running.push(value, batch_size);
        }

        let mean = running.finish("train", loader.num_items())?;
        Ok((model, mean))
    }

    fn valid_epoch<B, M>(
        &self,
        model: &M,
        loader: &dyn DataLoader<B, SegmentationBatch<B>>,
        epoch: usize,
    ) -> Fcn8Result<f64>
    where
        B: Backend,
        M: SegmentationModel<B>,
    {
        let mut running = RunningLoss::default();

        for (index, batch) in loader.iter().enumerate() {
            let batch_size = batch.images.dims()[0];
            let value = scalar(model.forward_loss(batch, &self.loss)?.loss);
            if !value.is_finite() {
                return Err(TrainingError::NonFiniteLoss {
                    epoch,
                    batch: index + 1,
                    value,
                }
                .into());
            }
            running.push(value, batch_size);
        }

        Ok(running.finish("valid", loader.num_items())?)
    }

    fn save_checkpoint<B: Backend, M: Module<B>>(&self, model: &M) -> Result<(), TrainingError> {
        let path = self.best_model_path();
        model
            .clone()
            .save_file(path.clone(), &CompactRecorder::new())
            .map_err(|err| TrainingError::CheckpointFailed {
                path,
                reason: err.to_string(),
            })
    }
}

fn weight_decay(config: &TrainingConfig) -> Option<WeightDecayConfig> {
    (config.weight_decay > 0.0).then(|| WeightDecayConfig::new(config.weight_decay as f32))
}

fn gradient_clipping(config: &TrainingConfig) -> Option<GradientClippingConfig> {
    (config.clip_norm > 0.0).then_some(GradientClippingConfig::Norm(config.clip_norm))
}

/// Plain RMSprop without momentum, `rho = 0.9`, `epsilon = 1e-8`.
fn rmsprop(config: &TrainingConfig) -> RmsPropConfig {
    RmsPropConfig::new()
        .with_alpha(0.9)
        .with_momentum(0.0)
        .with_epsilon(1e-8)
        .with_weight_decay(weight_decay(config))
        .with_grad_clipping(gradient_clipping(config))
}

fn adam(config: &TrainingConfig) -> AdamConfig {
    AdamConfig::new()
        .with_weight_decay(weight_decay(config))
        .with_grad_clipping(gradient_clipping(config))
}

fn adamw(config: &TrainingConfig) -> AdamWConfig {
    AdamWConfig::new()
        .with_weight_decay(config.weight_decay as f32)
        .with_grad_clipping(gradient_clipping(config))
}

fn sgd(config: &TrainingConfig) -> SgdConfig {
    SgdConfig::new()
        .with_weight_decay(weight_decay(config))
        .with_gradient_clipping(gradient_clipping(config))
}

fn loader_builder<B: Backend>(
    config: &TrainingConfig,
    device: &B::Device,
) -> DataLoaderBuilder<B, SegmentationItem, SegmentationBatch<B>> {
    let builder = DataLoaderBuilder::new(SegmentationBatcher::<B>::new())
        .batch_size(config.batch_size)
        .set_device(device.clone());
    // Zero workers means loading on the training thread.
    if config.num_workers > 0 {
        builder.num_workers(config.num_workers)
    } else {
        builder
    }
}

/// Build the loaders, the model and the optimizer named in `config`, then
/// train. The best model, the history and the config land in
/// `config.savepath`.
///
/// # Errors
///
/// Fails on an invalid config, an unreadable dataset, an unloadable warm-start
/// record or any error of [`Trainer::fit`].
pub fn run_training<B: AutodiffBackend>(
    config: &TrainingConfig,
    device: B::Device,
) -> Fcn8Result<FitOutcome<Fcn8<B>>> {
    config.validate()?;
    B::seed(config.seed);

    tracing::info!(
        dataset = %config.dataset_name,
        model = config.model.as_str(),
        optimizer = config.optimizer.as_str(),
        learning_rate = config.learning_rate,
        weight_decay = config.weight_decay,
        batch_size = config.batch_size,
        epochs = config.num_epochs,
        patience = config.patience,
        num_classes = config.num_classes,
        effective_classes = config.effective_class_count(),
        void_classes = ?config.void_classes,
        "starting training"
    );

    fs::create_dir_all(&config.savepath).map_err(|source| TrainingError::Io {
        path: config.savepath.clone(),
        source,
    })?;
    let config_path = config.savepath.join(CONFIG_FILE);
    config.save(&config_path).map_err(|source| TrainingError::Io {
        path: config_path,
        source,
    })?;

    let mut model = build_model::<B>(
        config.model.as_str(),
        config.num_classes,
        config.fc_channels,
        &device,
    )?;
    if let Some(weights) = &config.load_weights {
        tracing::info!(weights = %weights.display(), "loading initial weights");
        model = model
            .load_file(weights.clone(), &CompactRecorder::new(), &device)
            .map_err(|err| TrainingError::CheckpointFailed {
                path: weights.clone(),
                reason: err.to_string(),
            })?;
    }

    let train_dataset = SegmentationDataset::new(&config.dataset, Split::Train, config.seed)?;
    let valid_dataset = SegmentationDataset::new(&config.dataset, Split::Valid, config.seed)?;

    let train_loader = loader_builder::<B>(config, &device)
        .shuffle(config.seed)
        .build(train_dataset);
    let valid_loader = loader_builder::<B::InnerBackend>(config, &device).build(valid_dataset);

    let loss = FlatCrossEntropyLossConfig::new()
        .with_void_classes(config.void_classes.clone())
        .init();
    let trainer = TrainerConfig::new(
        config.num_epochs,
        config.patience,
        config.learning_rate,
        config.savepath.clone(),
    )
    .init(loss);

    let outcome = match config.optimizer {
        OptimizerName::RmsProp => {
            trainer.fit(model, rmsprop(config).init(), train_loader, valid_loader)?
        }
        OptimizerName::Adam => trainer.fit(model, adam(config).init(), train_loader, valid_loader)?,
        OptimizerName::AdamW => {
            trainer.fit(model, adamw(config).init(), train_loader, valid_loader)?
        }
        OptimizerName::Sgd => trainer.fit(model, sgd(config).init(), train_loader, valid_loader)?,
    };

    outcome.history.save(&config.savepath.join(HISTORY_FILE))?;

    tracing::info!(
        epochs_run = outcome.history.epochs.len(),
        best_epoch = outcome.history.best_epoch,
        best_valid_loss = outcome.history.best_valid_loss,
        stopped_early = outcome.history.stopped_early,
        checkpoint = %trainer.best_model_path().display(),
        "training finished"
    );

    Ok(outcome)
}
