//! Void-class masking of integer label maps.

use burn::{
    prelude::*,
    tensor::{backend::Backend, Bool, Int, Tensor},
};

/// Label value substituted for void pixels so they stay valid gather indices.
pub const VOID_PLACEHOLDER: i64 = 0;

/// Set of label values ignored by the loss.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VoidClasses {
    ids: Vec<i64>,
}

/// Labels split into a loss-safe index map and a per-pixel weight mask.
#[derive(Debug, Clone)]
pub struct EncodedLabels<B: Backend, const D: usize> {
    /// Labels with every void value replaced by [`VOID_PLACEHOLDER`].
    pub labels: Tensor<B, D, Int>,
    /// `0.0` on void pixels, `1.0` elsewhere.
    pub weights: Tensor<B, D>,
    /// `true` on void pixels.
    pub void: Tensor<B, D, Bool>,
}

impl VoidClasses {
    /// Build a void set; duplicates are dropped.
    pub fn new(ids: impl IntoIterator<Item = i64>) -> Self {
        let mut ids: Vec<i64> = ids.into_iter().collect();
        ids.sort_unstable();
        ids.dedup();
        Self { ids }
    }

    /// The empty void set.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn ids(&self) -> &[i64] {
        &self.ids
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, class_id: i64) -> bool {
        self.ids.binary_search(&class_id).is_ok()
    }

    /// Classes of `[0, num_classes)` that are not void.
    pub fn effective_class_count(&self, num_classes: usize) -> usize {
        let voided = self
            .ids
            .iter()
            .filter(|&&id| id >= 0 && (id as u64) < num_classes as u64)
            .count();
        num_classes - voided
    }

    /// Boolean map that is `true` where the label is void.
    pub fn void_mask<B: Backend, const D: usize>(
        &self,
        labels: Tensor<B, D, Int>,
    ) -> Tensor<B, D, Bool> {
        let mut hits = labels.zeros_like();
        for &id in &self.ids {
            hits = hits + labels.clone().equal_elem(id).int();
        }
        hits.greater_elem(0)
    }

    /// Split `labels` into safe indices and a weight mask.
    ///
    /// With an empty set the weights are all ones and the labels are returned
    /// unchanged.
    pub fn encode<B: Backend, const D: usize>(
        &self,
        labels: Tensor<B, D, Int>,
    ) -> EncodedLabels<B, D> {
        let void = self.void_mask(labels.clone());
        let weights = void.clone().bool_not().float();
        let labels = labels.mask_fill(void.clone(), VOID_PLACEHOLDER);

        EncodedLabels {
            labels,
            weights,
            void,
        }
    }
}
