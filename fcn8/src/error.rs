//! Error types for FCN8 training.
//!
//! Dataset and training-loop failures have their own enums so that callers can
//! match on them without pulling in the whole library error.

use std::path::PathBuf;

use thiserror::Error;

/// The error type for `fcn8-burn` operations.
#[derive(Error, Debug)]
pub enum Fcn8Error {
    /// Predictions and labels disagree on batch or spatial dimensions.
    #[error("Shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch {
        /// The shape implied by the predictions.
        expected: String,
        /// The shape of the labels.
        actual: String,
    },

    /// A non-void label lies outside `[0, num_classes)`.
    #[error("Invalid class id {class_id}: expected a value in [0, {num_classes}) or a void class")]
    InvalidClassId {
        /// The offending label value.
        class_id: i64,
        /// Size of the prediction class dimension.
        num_classes: usize,
    },

    /// A model name that is not in the model table.
    #[error("Unknown model: {name}")]
    UnknownModel {
        /// The name that failed to resolve.
        name: String,
    },

    /// An optimizer name that is not in the optimizer table.
    #[error("Unknown optimizer: {name}")]
    UnknownOptimizer {
        /// The name that failed to resolve.
        name: String,
    },

    /// Configuration values are logically inconsistent.
    #[error("Invalid configuration: {reason}")]
    InvalidConfiguration {
        /// Why the configuration was rejected.
        reason: String,
    },

    #[error(transparent)]
    Dataset(#[from] DatasetError),

    #[error(transparent)]
    Training(#[from] TrainingError),
}

/// A specialized `Result` type for `fcn8-burn` operations.
pub type Fcn8Result<T> = Result<T, Fcn8Error>;

/// Errors raised while indexing or decoding the image/mask directories.
#[derive(Error, Debug)]
pub enum DatasetError {
    /// The image directory does not exist.
    #[error("Image directory not found: {path}")]
    ImageDirectoryNotFound { path: PathBuf },

    /// The mask directory does not exist.
    #[error("Mask directory not found: {path}")]
    MaskDirectoryNotFound { path: PathBuf },

    /// Walking a directory tree failed.
    #[error("Failed to read directory: {path}")]
    DirectoryReadFailed {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },

    /// No image had a matching mask.
    #[error("No valid image/mask pairs found in: {path}")]
    NoValidPairs { path: PathBuf },

    /// Decoding an image or mask failed.
    #[error("Failed to open image: {path}")]
    ImageOpenFailed {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// An image and its mask have different dimensions.
    #[error("Image {image} is {image_size:?} but its mask is {mask_size:?}")]
    SizeMismatch {
        image: PathBuf,
        image_size: (u32, u32),
        mask_size: (u32, u32),
    },

    /// A path component is not valid UTF-8.
    #[error("Path contains invalid UTF-8: {path}")]
    InvalidUtf8Path { path: PathBuf },
}

/// A specialized `Result` type for dataset operations.
pub type DatasetResult<T> = Result<T, DatasetError>;

/// Fatal conditions of the training loop.
#[derive(Error, Debug)]
pub enum TrainingError {
    /// The loss became NaN or infinite.
    #[error("Non-finite loss {value} at epoch {epoch}, batch {batch}")]
    NonFiniteLoss {
        epoch: usize,
        batch: usize,
        value: f64,
    },

    /// A data loader produced no batch for a whole epoch.
    #[error("The {split} loader produced no batches")]
    EmptyLoader { split: &'static str },

    /// A data loader ended before yielding every item of its dataset.
    #[error("The {split} loader yielded {seen} of {expected} items")]
    IncompleteEpoch {
        split: &'static str,
        seen: usize,
        expected: usize,
    },

    /// Saving or loading a model record failed.
    #[error("Checkpoint operation failed for {path}: {reason}")]
    CheckpointFailed { path: PathBuf, reason: String },

    /// Writing training artifacts failed.
    #[error("I/O error on {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
