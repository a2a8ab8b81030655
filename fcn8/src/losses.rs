//! Loss functions for FCN8 training.
//!
//! The segmentation loss is a pixel-wise categorical cross-entropy computed on
//! flattened `[batch * height * width, classes]` scores. Pixels whose label is
//! a void class are excluded from both the sum and the averaging denominator.

mod flat_cross_entropy;
mod void_mask;

pub use flat_cross_entropy::{flatten_pixels, FlatCrossEntropyLoss, FlatCrossEntropyLossConfig};
pub use void_mask::{EncodedLabels, VoidClasses};
