//! Flattened categorical cross-entropy with void-class masking.
//!
//! Predictions `[B, H, W, C]` and labels `[B, H, W]` are flattened row-major
//! (batch first) to `[B*H*W, C]` and `[B*H*W]`, so row `i` of one matches
//! entry `i` of the other. The per-pixel loss is
//!
//! `l_i = -log softmax(x_i)[y_i]`
//!
//! and the reduction is `sum(l_i * m_i) / max(sum(m_i), 1)` where `m_i` is zero
//! on void pixels. Void classes keep their channel in the prediction tensor;
//! they are only removed from the average.

use burn::{
    prelude::*,
    tensor::{activation::log_softmax, backend::Backend, cast::ToElement, Bool, Int, Tensor},
};

use super::void_mask::VoidClasses;
use crate::error::{Fcn8Error, Fcn8Result};

/// Configuration for [`FlatCrossEntropyLoss`].
#[derive(Config, Debug)]
pub struct FlatCrossEntropyLossConfig {
    /// Label values excluded from the loss.
    #[config(default = "Vec::new()")]
    pub void_classes: Vec<i64>,
    /// Treat predictions as unnormalized logits. When false they are read as
    /// probabilities and clipped to `[epsilon, 1]` before the logarithm.
    #[config(default = true)]
    pub logits: bool,
    #[config(default = 1e-7)]
    pub epsilon: f64,
}

impl FlatCrossEntropyLossConfig {
    /// Initialize the loss.
    pub fn init(&self) -> FlatCrossEntropyLoss {
        self.assertions();
        FlatCrossEntropyLoss {
            void_classes: VoidClasses::new(self.void_classes.iter().copied()),
            logits: self.logits,
            epsilon: self.epsilon,
        }
    }

    fn assertions(&self) {
        assert!(
            self.epsilon > 0.0 && self.epsilon < 1.0,
            "Epsilon of FlatCrossEntropyLoss must be in (0, 1), got {}",
            self.epsilon
        );
    }
}

/// Pixel-wise cross-entropy that ignores void labels.
#[derive(Debug, Clone)]
pub struct FlatCrossEntropyLoss {
    void_classes: VoidClasses,
    logits: bool,
    epsilon: f64,
}

impl Default for FlatCrossEntropyLoss {
    fn default() -> Self {
        FlatCrossEntropyLossConfig::new().init()
    }
}

impl FlatCrossEntropyLoss {
    pub fn void_classes(&self) -> &VoidClasses {
        &self.void_classes
    }

    /// Mean cross-entropy over the non-void pixels of the batch.
    ///
    /// A batch whose pixels are all void yields `0` and logs a warning.
    ///
    /// # Shapes
    ///
    /// - predictions: `[batch, height, width, num_classes]`
    /// - labels: `[batch, height, width]`
    /// - output: `[1]`
    pub fn forward<B: Backend>(
        &self,
        predictions: Tensor<B, 4>,
        labels: Tensor<B, 3, Int>,
    ) -> Fcn8Result<Tensor<B, 1>> {
        let (losses, void) = self.masked_pixel_losses(predictions, labels)?;
        let pixels = void.dims()[0];
        let valid = void.bool_not().float().sum();

        // Reading the count back is a device sync.
        if tracing::enabled!(tracing::Level::WARN)
            && valid.clone().into_scalar().to_f64() == 0.0
        {
            tracing::warn!(pixels, "every pixel in the batch is void, loss is zero");
        }

        Ok(losses.sum() / valid.clamp_min(1.0))
    }

    /// Per-pixel loss, `[batch * height * width]`, zero on void pixels.
    pub fn forward_no_reduction<B: Backend>(
        &self,
        predictions: Tensor<B, 4>,
        labels: Tensor<B, 3, Int>,
    ) -> Fcn8Result<Tensor<B, 1>> {
        self.masked_pixel_losses(predictions, labels)
            .map(|(losses, _)| losses)
    }

    /// Number of labels that are not void.
    pub fn valid_pixel_count<B: Backend, const D: usize>(&self, labels: Tensor<B, D, Int>) -> usize {
        let void = self.void_classes.void_mask(labels);
        void.bool_not().int().sum().into_scalar().to_i64() as usize
    }

    fn masked_pixel_losses<B: Backend>(
        &self,
        predictions: Tensor<B, 4>,
        labels: Tensor<B, 3, Int>,
    ) -> Fcn8Result<(Tensor<B, 1>, Tensor<B, 1, Bool>)> {
        let (predictions, labels) = flatten_pixels(predictions, labels)?;
        let [pixels, num_classes] = predictions.dims();

        self.check_class_ids(labels.clone(), num_classes)?;
        let encoded = self.void_classes.encode(labels);

        let log_probs = if self.logits {
            log_softmax(predictions, 1)
        } else {
            predictions.clamp(self.epsilon, 1.0).log()
        };

        let losses = log_probs
            .gather(1, encoded.labels.reshape([pixels, 1]))
            .reshape([pixels])
            .neg()
            .mask_fill(encoded.void.clone(), 0.0);

        Ok((losses, encoded.void))
    }

    fn check_class_ids<B: Backend>(
        &self,
        labels: Tensor<B, 1, Int>,
        num_classes: usize,
    ) -> Fcn8Result<()> {
        let below = labels.clone().lower_elem(0).int();
        let above = labels.clone().greater_equal_elem(num_classes as i64).int();
        let not_void = self.void_classes.void_mask(labels.clone()).bool_not().int();
        let invalid = (below + above) * not_void;

        if invalid.sum().into_scalar().to_i64() == 0 {
            return Ok(());
        }

        let class_id = labels
            .into_data()
            .iter::<i64>()
            .find(|&id| !self.void_classes.contains(id) && (id < 0 || id >= num_classes as i64))
            .unwrap_or(-1);

        Err(Fcn8Error::InvalidClassId {
            class_id,
            num_classes,
        })
    }
}

/// Flatten `[B, H, W, C]` scores and `[B, H, W]` labels to per-pixel rows.
///
/// Fails with [`Fcn8Error::ShapeMismatch`] when the batch or spatial
/// dimensions disagree or the class dimension is empty.
pub fn flatten_pixels<B: Backend>(
    predictions: Tensor<B, 4>,
    labels: Tensor<B, 3, Int>,
) -> Fcn8Result<(Tensor<B, 2>, Tensor<B, 1, Int>)> {
    let [batch, height, width, num_classes] = predictions.dims();
    let label_dims = labels.dims();

    if label_dims != [batch, height, width] {
        return Err(Fcn8Error::ShapeMismatch {
            expected: format!("{:?}", [batch, height, width]),
            actual: format!("{label_dims:?}"),
        });
    }
    if num_classes == 0 {
        return Err(Fcn8Error::ShapeMismatch {
            expected: "a non-empty class dimension".to_owned(),
            actual: format!("{:?}", [batch, height, width, num_classes]),
        });
    }

    let pixels = batch * height * width;
    Ok((
        predictions.reshape([pixels, num_classes]),
        labels.reshape([pixels]),
    ))
}

#[cfg(test)]
mod tests {
    use burn::{
        backend::{Autodiff, NdArray},
        nn::loss::CrossEntropyLossConfig,
        tensor::{ops::FloatElem, Distribution, TensorData, Tolerance},
    };

    use super::*;

    type TestBackend = NdArray;
    type FT = FloatElem<TestBackend>;

    fn scalar(loss: Tensor<TestBackend, 1>) -> f64 {
        loss.into_scalar().to_f64()
    }

    fn void_loss(ids: &[i64]) -> FlatCrossEntropyLoss {
        FlatCrossEntropyLossConfig::new()
            .with_void_classes(ids.to_vec())
            .init()
    }

    #[test]
    fn without_void_pixels_matches_standard_cross_entropy() {
        let device = Default::default();
        let predictions = Tensor::<TestBackend, 4>::random(
            [2, 3, 3, 5],
            Distribution::Normal(0.0, 2.0),
            &device,
        );
        let labels = Tensor::<TestBackend, 3, Int>::from_data(
            TensorData::from([
                [[0, 1, 2], [3, 0, 1], [2, 3, 0]],
                [[1, 1, 0], [2, 2, 3], [0, 3, 1]],
            ]),
            &device,
        );

        let masked = void_loss(&[4])
            .forward(predictions.clone(), labels.clone())
            .unwrap();
        let reference = CrossEntropyLossConfig::new()
            .init(&device)
            .forward(predictions.reshape([18, 5]), labels.reshape([18]));

        masked
            .into_data()
            .assert_approx_eq::<FT>(&reference.into_data(), Tolerance::default());
    }

    #[test]
    fn uniform_scores_on_two_by_two_grid_average_over_non_void_pixels() {
        let device = Default::default();
        let predictions = Tensor::<TestBackend, 4>::zeros([1, 2, 2, 4], &device);
        let labels =
            Tensor::<TestBackend, 3, Int>::from_data(TensorData::from([[[0, 4], [1, 4]]]), &device);

        let loss = scalar(void_loss(&[4]).forward(predictions, labels).unwrap());

        assert!((loss - 4f64.ln()).abs() < 1e-6, "loss = {loss}");
    }

    #[test]
    fn entirely_void_batch_gives_zero_not_nan() {
        let device = Default::default();
        let predictions = Tensor::<TestBackend, 4>::random(
            [2, 2, 2, 5],
            Distribution::Normal(0.0, 1.0),
            &device,
        );
        let labels = Tensor::<TestBackend, 3, Int>::full([2, 2, 2], 4, &device);

        let loss = scalar(void_loss(&[4]).forward(predictions, labels).unwrap());

        assert_eq!(loss, 0.0);
    }

    #[test]
    fn all_void_result_does_not_depend_on_the_log_level() {
        let device = Default::default();
        let predictions = Tensor::<TestBackend, 4>::random(
            [1, 2, 2, 3],
            Distribution::Normal(0.0, 1.0),
            &device,
        );
        let labels = Tensor::<TestBackend, 3, Int>::full([1, 2, 2], 2, &device);
        let loss = void_loss(&[2]);

        let at_level = |level: tracing::Level| {
            let subscriber = tracing_subscriber::fmt()
                .with_max_level(level)
                .with_test_writer()
                .finish();
            tracing::subscriber::with_default(subscriber, || {
                scalar(loss.forward(predictions.clone(), labels.clone()).unwrap())
            })
        };

        assert_eq!(at_level(tracing::Level::WARN), 0.0);
        assert_eq!(at_level(tracing::Level::ERROR), 0.0);
    }

    #[test]
    fn perfect_one_hot_predictions_give_zero_loss() {
        let device = Default::default();
        let labels = [[[0, 2], [4, 1]]];
        let mut logits = [[[[0.0f32; 5]; 2]; 2]; 1];
        for (h, row) in labels[0].iter().enumerate() {
            for (w, &class) in row.iter().enumerate() {
                logits[0][h][w][class as usize] = 100.0;
            }
        }
        let predictions = Tensor::<TestBackend, 4>::from_data(TensorData::from(logits), &device);
        let labels = Tensor::<TestBackend, 3, Int>::from_data(TensorData::from(labels), &device);

        let loss = scalar(void_loss(&[4]).forward(predictions, labels).unwrap());

        assert!(loss.abs() < 1e-6, "loss = {loss}");
    }

    #[test]
    fn probability_inputs_are_clipped_before_the_logarithm() {
        let device = Default::default();
        let loss = FlatCrossEntropyLossConfig::new()
            .with_logits(false)
            .with_void_classes(vec![2])
            .init();

        // Pixel 0 is a perfect match, pixel 1 puts zero mass on its label.
        let predictions = Tensor::<TestBackend, 4>::from_data(
            TensorData::from([[[[1.0f32, 0.0, 0.0], [1.0, 0.0, 0.0]]]]),
            &device,
        );
        let labels = Tensor::<TestBackend, 3, Int>::from_data(TensorData::from([[[0, 1]]]), &device);

        let value = scalar(loss.forward(predictions, labels).unwrap());
        let expected = -(1e-7f64).ln() / 2.0;

        assert!(value.is_finite());
        assert!((value - expected).abs() < 1e-2, "loss = {value}");
    }

    #[test]
    fn average_is_invariant_to_extra_void_pixels() {
        let device = Default::default();
        let loss = void_loss(&[4]);
        let row = [[0.3f32, -1.2, 2.0, 0.5, 0.1], [1.5, 0.2, -0.7, 0.0, 3.0]];

        let small = Tensor::<TestBackend, 4>::from_data(TensorData::from([[row]]), &device);
        let small_labels =
            Tensor::<TestBackend, 3, Int>::from_data(TensorData::from([[[2, 0]]]), &device);

        let noise = [[9.0f32, -3.0, 0.0, 4.0, 1.0], [0.0, 0.0, 7.0, 0.0, -2.0]];
        let large = Tensor::<TestBackend, 4>::from_data(TensorData::from([[row, noise]]), &device);
        let large_labels =
            Tensor::<TestBackend, 3, Int>::from_data(TensorData::from([[[2, 0], [4, 4]]]), &device);

        let small = loss.forward(small, small_labels).unwrap();
        let large = loss.forward(large, large_labels).unwrap();

        small
            .into_data()
            .assert_approx_eq::<FT>(&large.into_data(), Tolerance::default());
    }

    #[test]
    fn flattening_keeps_pixels_aligned() {
        let device = Default::default();
        let [batch, height, width, classes] = [2, 3, 4, 2];
        let pixels = batch * height * width;

        // Every score encodes its own pixel index and class, every label its pixel index.
        let scores: Vec<f32> = (0..pixels * classes).map(|i| i as f32).collect();
        let ids: Vec<i64> = (0..pixels as i64).collect();
        let predictions = Tensor::<TestBackend, 4>::from_data(
            TensorData::new(scores, [batch, height, width, classes]),
            &device,
        );
        let labels =
            Tensor::<TestBackend, 3, Int>::from_data(TensorData::new(ids, [batch, height, width]), &device);

        let (flat_predictions, flat_labels) =
            flatten_pixels(predictions.clone(), labels.clone()).unwrap();

        let expected_rows: Vec<f32> = (0..pixels)
            .flat_map(|i| (0..classes).map(move |c| (i * classes + c) as f32))
            .collect();
        flat_predictions
            .clone()
            .into_data()
            .assert_eq(&TensorData::new(expected_rows, [pixels, classes]), false);
        flat_labels
            .clone()
            .into_data()
            .assert_eq(&TensorData::new((0..pixels as i64).collect::<Vec<_>>(), [pixels]), false);

        flat_predictions
            .reshape([batch, height, width, classes])
            .into_data()
            .assert_eq(&predictions.into_data(), true);
        flat_labels
            .reshape([batch, height, width])
            .into_data()
            .assert_eq(&labels.into_data(), true);
    }

    #[test]
    fn label_out_of_range_is_an_invalid_class_id() {
        let device = Default::default();
        let predictions = Tensor::<TestBackend, 4>::zeros([1, 1, 3, 5], &device);
        let labels =
            Tensor::<TestBackend, 3, Int>::from_data(TensorData::from([[[0, 99, 4]]]), &device);

        let err = void_loss(&[4]).forward(predictions, labels).unwrap_err();

        assert!(matches!(
            err,
            Fcn8Error::InvalidClassId {
                class_id: 99,
                num_classes: 5
            }
        ));
    }

    #[test]
    fn negative_label_is_invalid_unless_void() {
        let device = Default::default();
        let predictions = Tensor::<TestBackend, 4>::zeros([1, 1, 2, 3], &device);
        let labels = || Tensor::<TestBackend, 3, Int>::from_data(TensorData::from([[[-1, 2]]]), &device);

        let err = void_loss(&[]).forward(predictions.clone(), labels()).unwrap_err();
        assert!(matches!(err, Fcn8Error::InvalidClassId { class_id: -1, .. }));

        let loss = scalar(void_loss(&[-1]).forward(predictions, labels()).unwrap());
        assert!((loss - 3f64.ln()).abs() < 1e-6);
    }

    #[test]
    fn void_id_outside_the_class_range_is_accepted() {
        let device = Default::default();
        let predictions = Tensor::<TestBackend, 4>::zeros([1, 1, 2, 4], &device);
        let labels =
            Tensor::<TestBackend, 3, Int>::from_data(TensorData::from([[[255, 3]]]), &device);

        let loss = scalar(void_loss(&[255]).forward(predictions, labels).unwrap());

        assert!((loss - 4f64.ln()).abs() < 1e-6);
    }

    #[test]
    fn mismatched_spatial_dimensions_are_rejected() {
        let device = Default::default();
        let predictions = Tensor::<TestBackend, 4>::zeros([2, 4, 4, 5], &device);
        let labels = Tensor::<TestBackend, 3, Int>::zeros([2, 4, 3], &device);

        let err = void_loss(&[4]).forward(predictions, labels).unwrap_err();

        assert!(matches!(err, Fcn8Error::ShapeMismatch { .. }));
    }

    #[test]
    fn mismatched_batch_dimension_is_rejected() {
        let device = Default::default();
        let predictions = Tensor::<TestBackend, 4>::zeros([2, 4, 4, 5], &device);
        let labels = Tensor::<TestBackend, 3, Int>::zeros([1, 4, 4], &device);

        assert!(matches!(
            flatten_pixels(predictions, labels),
            Err(Fcn8Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn unreduced_loss_is_zero_on_void_pixels() {
        let device = Default::default();
        let predictions = Tensor::<TestBackend, 4>::zeros([1, 2, 2, 4], &device);
        let labels =
            Tensor::<TestBackend, 3, Int>::from_data(TensorData::from([[[0, 4], [1, 4]]]), &device);

        let losses = void_loss(&[4])
            .forward_no_reduction(predictions, labels.clone())
            .unwrap();
        let ln4 = 4f32.ln();

        losses.into_data().assert_approx_eq::<FT>(
            &TensorData::from([ln4, 0.0, ln4, 0.0]),
            Tolerance::default(),
        );
        assert_eq!(void_loss(&[4]).valid_pixel_count(labels), 2);
    }

    #[test]
    fn void_pixels_receive_no_gradient() {
        type AutodiffBackend = Autodiff<NdArray>;
        let device = Default::default();

        let predictions = Tensor::<AutodiffBackend, 4>::random(
            [1, 1, 3, 3],
            Distribution::Normal(0.0, 1.0),
            &device,
        )
        .require_grad();
        let labels =
            Tensor::<AutodiffBackend, 3, Int>::from_data(TensorData::from([[[0, 3, 2]]]), &device);

        let loss = void_loss(&[3]).forward(predictions.clone(), labels).unwrap();
        let grads = loss.backward();
        let grad = predictions.grad(&grads).expect("predictions require grad");

        let void_row = grad.clone().slice([0..1, 0..1, 1..2, 0..3]);
        void_row
            .into_data()
            .assert_eq(&TensorData::from([[[[0.0f32, 0.0, 0.0]]]]), false);

        let valid_row_sum = grad.slice([0..1, 0..1, 0..1, 0..3]).abs().sum();
        assert!(valid_row_sum.into_scalar().to_f64() > 0.0);
    }

    #[test]
    #[should_panic = "Epsilon of FlatCrossEntropyLoss"]
    fn config_rejects_non_positive_epsilon() {
        let _loss = FlatCrossEntropyLossConfig::new().with_epsilon(0.0).init();
    }
}
