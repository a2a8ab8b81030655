//! # FCN8 Burn
//!
//! Training of FCN8 semantic-segmentation networks with a void-aware,
//! flattened pixel-wise cross-entropy loss.
//!
//! ## Modules
//!
//! - [`losses`]: the masked cross-entropy loss and void-class encoding
//! - [`dataset`] and [`augmentation`]: paired image/mask directories, crops and batching
//! - [`models`]: FCN8 on a VGG16 encoder, built by name
//! - [`training`]: the epoch loop with early stopping and checkpointing
//! - [`config`]: the JSON-loadable training configuration
//! - [`backend`]: backend selection through cargo features

pub mod augmentation;
pub mod backend;
pub mod config;
pub mod dataset;
pub mod error;
pub mod losses;
pub mod models;
pub mod training;

pub use config::{DatasetConfig, ModelName, OptimizerName, TrainingConfig};
pub use dataset::{
    SegmentationBatch, SegmentationBatcher, SegmentationDataset, SegmentationItem, Split,
};
pub use error::{DatasetError, DatasetResult, Fcn8Error, Fcn8Result, TrainingError};
pub use losses::{FlatCrossEntropyLoss, FlatCrossEntropyLossConfig, VoidClasses};
pub use models::{build_model, Fcn8, Fcn8Config};
pub use training::{
    run_training, EarlyStopping, FitOutcome, SegmentationModel, Trainer, TrainerConfig,
    TrainingHistory,
};
