//! Segmentation models and name-based construction.

mod fcn8;

use burn::prelude::*;
pub use fcn8::{Fcn8, Fcn8Config};

use crate::{config::ModelName, error::Fcn8Result};

impl ModelName {
    /// Model configuration for this architecture.
    pub fn config(&self, num_classes: usize) -> Fcn8Config {
        match self {
            Self::Fcn8 => Fcn8Config::new().with_num_classes(num_classes),
            Self::Fcn8Bn => Fcn8Config::new()
                .with_num_classes(num_classes)
                .with_batch_norm(true),
        }
    }
}

/// Build a model from its table name with `fc_channels` wide fc6/fc7 layers.
///
/// # Errors
///
/// Returns [`crate::Fcn8Error::UnknownModel`] when `name` is not a known
/// architecture.
pub fn build_model<B: Backend>(
    name: &str,
    num_classes: usize,
    fc_channels: usize,
    device: &B::Device,
) -> Fcn8Result<Fcn8<B>> {
    let model: ModelName = name.parse()?;
    tracing::debug!(model = model.as_str(), num_classes, fc_channels, "building model");
    Ok(model
        .config(num_classes)
        .with_fc_channels(fc_channels)
        .init(device))
}

#[cfg(test)]
mod tests {
    use burn::backend::NdArray;

    use super::*;
    use crate::error::Fcn8Error;

    type TestBackend = NdArray;

    #[test]
    fn model_table_maps_batch_norm_variant() {
        assert!(!ModelName::Fcn8.config(5).batch_norm);
        assert!(ModelName::Fcn8Bn.config(5).batch_norm);
        assert_eq!(ModelName::Fcn8Bn.config(3).num_classes, 3);
    }

    #[test]
    fn build_model_rejects_unknown_names() {
        let device = Default::default();
        let result = build_model::<TestBackend>("segnet", 5, 8, &device);

        assert!(matches!(result, Err(Fcn8Error::UnknownModel { ref name }) if name == "segnet"));
    }

    #[test]
    fn build_model_uses_the_requested_variant_and_width() {
        let device = Default::default();
        let model = build_model::<TestBackend>("fcn8-bn", 3, 8, &device).unwrap();

        assert_eq!(model.num_classes(), 3);
        let output = model.forward(Tensor::zeros([1, 3, 32, 32], &device));
        assert_eq!(output.dims(), [1, 3, 32, 32]);
    }
}
