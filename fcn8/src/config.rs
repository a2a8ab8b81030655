//! Training configuration.
//!
//! Everything the training entry point needs travels in [`TrainingConfig`];
//! there are no process-wide defaults. Model and optimizer names are closed
//! enumerations resolved through lookup tables.

use std::{path::PathBuf, str::FromStr};

use burn::prelude::*;

use crate::{
    error::{Fcn8Error, Fcn8Result},
    losses::VoidClasses,
};

/// Segmentation architectures that can be built by name.
#[derive(Config, Debug, PartialEq, Eq)]
pub enum ModelName {
    /// FCN8 on a plain VGG16 encoder.
    Fcn8,
    /// FCN8 on a VGG16 encoder with batch normalization.
    Fcn8Bn,
}

const MODEL_TABLE: [(&str, ModelName); 2] =
    [("fcn8", ModelName::Fcn8), ("fcn8_bn", ModelName::Fcn8Bn)];

impl ModelName {
    /// The canonical name used on the command line.
    pub fn as_str(&self) -> &'static str {
        MODEL_TABLE
            .iter()
            .find(|(_, model)| model == self)
            .map_or("fcn8", |(name, _)| name)
    }
}

impl FromStr for ModelName {
    type Err = Fcn8Error;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        let key = name.trim().to_ascii_lowercase().replace('-', "_");
        MODEL_TABLE
            .iter()
            .find(|(candidate, _)| *candidate == key)
            .map(|(_, model)| model.clone())
            .ok_or_else(|| Fcn8Error::UnknownModel {
                name: name.to_owned(),
            })
    }
}

/// Optimizers available to the training loop.
#[derive(Config, Debug, PartialEq, Eq)]
pub enum OptimizerName {
    RmsProp,
    Adam,
    AdamW,
    Sgd,
}

const OPTIMIZER_TABLE: [(&str, OptimizerName); 4] = [
    ("rmsprop", OptimizerName::RmsProp),
    ("adam", OptimizerName::Adam),
    ("adamw", OptimizerName::AdamW),
    ("sgd", OptimizerName::Sgd),
];

impl OptimizerName {
    /// The canonical name used on the command line.
    pub fn as_str(&self) -> &'static str {
        OPTIMIZER_TABLE
            .iter()
            .find(|(_, optimizer)| optimizer == self)
            .map_or("rmsprop", |(name, _)| name)
    }
}

impl FromStr for OptimizerName {
    type Err = Fcn8Error;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        let key = name.trim().to_ascii_lowercase().replace(['-', '_'], "");
        OPTIMIZER_TABLE
            .iter()
            .find(|(candidate, _)| *candidate == key)
            .map(|(_, optimizer)| optimizer.clone())
            .ok_or_else(|| Fcn8Error::UnknownOptimizer {
                name: name.to_owned(),
            })
    }
}

/// Paired image/mask directory layout and crop settings.
#[derive(Config, Debug)]
pub struct DatasetConfig {
    /// Root of the training split.
    #[config(default = "PathBuf::from(\"datasets/CVC-612\")")]
    pub train_path: PathBuf,
    /// Root of the validation split.
    #[config(default = "PathBuf::from(\"datasets/CVC-300\")")]
    pub val_path: PathBuf,
    /// Image subdirectory below each split root.
    #[config(default = "String::from(\"images\")")]
    pub images_dir: String,
    /// Mask subdirectory below each split root.
    #[config(default = "String::from(\"masks\")")]
    pub masks_dir: String,
    /// Crop size as `[height, width]`.
    #[config(default = "[224, 224]")]
    pub crop_size: [u32; 2],
    /// Randomly mirror training pairs.
    #[config(default = false)]
    pub horizontal_flip: bool,
}

/// Full training configuration, loadable from JSON.
#[derive(Config, Debug)]
pub struct TrainingConfig {
    /// Free-form dataset label used in logs.
    #[config(default = "String::from(\"polyp\")")]
    pub dataset_name: String,

    #[config(default = "ModelName::Fcn8")]
    pub model: ModelName,

    /// Channels of the fc6/fc7 convolutions.
    #[config(default = 4096)]
    pub fc_channels: usize,

    #[config(default = "OptimizerName::RmsProp")]
    pub optimizer: OptimizerName,

    #[config(default = 1e-4)]
    pub learning_rate: f64,

    /// L2 penalty applied through the optimizer.
    #[config(default = 0.0)]
    pub weight_decay: f64,

    /// Gradient norm clipping threshold.
    #[config(default = 10.0)]
    pub clip_norm: f32,

    #[config(default = 1000)]
    pub num_epochs: usize,

    /// Epochs without validation improvement before stopping.
    #[config(default = 100)]
    pub patience: usize,

    #[config(default = 10)]
    pub batch_size: usize,

    #[config(default = 4)]
    pub num_workers: usize,

    #[config(default = 42)]
    pub seed: u64,

    /// Size of the model output class dimension, void classes included.
    #[config(default = 5)]
    pub num_classes: usize,

    /// Labels ignored by the loss.
    #[config(default = "vec![4]")]
    pub void_classes: Vec<i64>,

    #[config(default = "DatasetConfig::new()")]
    pub dataset: DatasetConfig,

    /// Directory receiving the best checkpoint, history and config.
    #[config(default = "PathBuf::from(\"artifacts\")")]
    pub savepath: PathBuf,

    /// Optional model record to start from.
    #[config(default = "None")]
    pub load_weights: Option<PathBuf>,
}

impl TrainingConfig {
    /// The void set as used by the loss.
    pub fn void_set(&self) -> VoidClasses {
        VoidClasses::new(self.void_classes.iter().copied())
    }

    /// Number of classes that contribute to the loss.
    pub fn effective_class_count(&self) -> usize {
        self.void_set().effective_class_count(self.num_classes)
    }

    /// Reject values the training loop cannot work with.
    pub fn validate(&self) -> Fcn8Result<()> {
        let invalid = |reason: String| Err(Fcn8Error::InvalidConfiguration { reason });

        if self.batch_size == 0 {
            return invalid("batch size must be greater than 0".into());
        }
        if !(self.learning_rate > 0.0) {
            return invalid(format!(
                "learning rate must be positive, got {}",
                self.learning_rate
            ));
        }
        if self.weight_decay < 0.0 {
            return invalid(format!(
                "weight decay must not be negative, got {}",
                self.weight_decay
            ));
        }
        if self.fc_channels == 0 {
            return invalid("fc channels must be greater than 0".into());
        }
        if self.num_classes == 0 {
            return invalid("number of classes must be greater than 0".into());
        }
        if self.effective_class_count() == 0 {
            return invalid(format!(
                "every one of the {} classes is void",
                self.num_classes
            ));
        }
        let [height, width] = self.dataset.crop_size;
        if height == 0 || width == 0 || height % 32 != 0 || width % 32 != 0 {
            return invalid(format!(
                "crop size must be a non-zero multiple of 32, got {height}x{width}"
            ));
        }
        Ok(())
    }
}
