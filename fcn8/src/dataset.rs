//! Paired image/mask dataset for segmentation training.
//!
//! A split root holds an image tree and a mask tree with the same relative
//! layout. Images are paired with the mask that has the same relative path
//! and stem, whatever the extension. Mask grey values are class ids.
//!
//! The dataset returns raw pixel buffers; [`SegmentationBatcher`] builds the
//! tensors, applies ImageNet normalization and places them on the device.

use std::{
    collections::HashMap,
    marker::PhantomData,
    path::{Path, PathBuf},
};

use burn::{
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    prelude::*,
    tensor::{backend::Backend, Int, Tensor, TensorData},
};
use image::{DynamicImage, GenericImageView, ImageFormat};
use walkdir::WalkDir;

use crate::{
    augmentation::PairAugmentor,
    config::DatasetConfig,
    error::{DatasetError, DatasetResult},
};

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Which half of the data a dataset serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Valid,
}

impl Split {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Valid => "valid",
        }
    }

    fn root(self, config: &DatasetConfig) -> &Path {
        match self {
            Self::Train => &config.train_path,
            Self::Valid => &config.val_path,
        }
    }
}

/// One cropped image/mask pair as raw buffers.
#[derive(Debug, Clone)]
pub struct SegmentationItem {
    /// RGB values in `[0, 1]`, HWC order.
    pub image: Vec<f32>,
    /// Class id per pixel, row-major.
    pub labels: Vec<i64>,
    pub height: usize,
    pub width: usize,
}

/// A batch of images and their label maps.
#[derive(Debug, Clone)]
pub struct SegmentationBatch<B: Backend> {
    /// ImageNet-normalized images, `[batch, height, width, 3]`.
    pub images: Tensor<B, 4>,
    /// Class ids, `[batch, height, width]`.
    pub labels: Tensor<B, 3, Int>,
}

/// Stacks [`SegmentationItem`]s into a [`SegmentationBatch`].
#[derive(Clone, Default)]
pub struct SegmentationBatcher<B: Backend> {
    _phantom: PhantomData<B>,
}

impl<B: Backend> SegmentationBatcher<B> {
    pub const fn new() -> Self {
        Self {
            _phantom: PhantomData,
        }
    }
}

impl<B: Backend> Batcher<B, SegmentationItem, SegmentationBatch<B>> for SegmentationBatcher<B> {
    fn batch(&self, items: Vec<SegmentationItem>, device: &B::Device) -> SegmentationBatch<B> {
        let mut images = Vec::with_capacity(items.len());
        let mut labels = Vec::with_capacity(items.len());

        for item in items {
            images.push(Tensor::<B, 3>::from_data(
                TensorData::new(item.image, [item.height, item.width, 3]),
                device,
            ));
            labels.push(Tensor::<B, 2, Int>::from_data(
                TensorData::new(item.labels, [item.height, item.width]),
                device,
            ));
        }

        let mean = Tensor::<B, 1>::from_floats(IMAGENET_MEAN, device).reshape([1, 1, 1, 3]);
        let std = Tensor::<B, 1>::from_floats(IMAGENET_STD, device).reshape([1, 1, 1, 3]);
        let images = (Tensor::stack(images, 0) - mean) / std;

        SegmentationBatch {
            images,
            labels: Tensor::stack(labels, 0),
        }
    }
}

/// Image/mask pairs of one split with the crop policy of that split.
#[derive(Debug)]
pub struct SegmentationDataset {
    pairs: Vec<(PathBuf, PathBuf)>,
    split: Split,
    augmentor: PairAugmentor,
}

impl SegmentationDataset {
    /// Index the split's image and mask trees.
    ///
    /// # Errors
    ///
    /// Fails when a directory is missing or unreadable, or when no image has
    /// a readable mask of the same size.
    pub fn new(config: &DatasetConfig, split: Split, seed: u64) -> DatasetResult<Self> {
        let root = split.root(config);
        let image_root = root.join(&config.images_dir);
        let pairs = collect_pairs(&image_root, &root.join(&config.masks_dir))?;
        let pairs = retain_readable_pairs(pairs);
        if pairs.is_empty() {
            return Err(DatasetError::NoValidPairs { path: image_root });
        }

        tracing::info!(
            split = split.as_str(),
            pairs = pairs.len(),
            root = %root.display(),
            "indexed segmentation pairs"
        );

        Ok(Self {
            pairs,
            split,
            augmentor: PairAugmentor::new(config.crop_size, config.horizontal_flip, seed),
        })
    }

    pub fn split(&self) -> Split {
        self.split
    }

    /// The `(image, mask)` paths in index order.
    pub fn pairs(&self) -> &[(PathBuf, PathBuf)] {
        &self.pairs
    }

    /// Decode, crop and convert the pair at `index`.
    pub fn load(&self, index: usize) -> DatasetResult<Option<SegmentationItem>> {
        let Some((image_path, mask_path)) = self.pairs.get(index) else {
            return Ok(None);
        };

        let image = open(image_path)?;
        let mask = open(mask_path)?;
        if image.dimensions() != mask.dimensions() {
            return Err(DatasetError::SizeMismatch {
                image: image_path.clone(),
                image_size: image.dimensions(),
                mask_size: mask.dimensions(),
            });
        }

        let (image, mask) = self
            .augmentor
            .apply(image, mask, self.split == Split::Train);
        let (width, height) = image.dimensions();

        Ok(Some(SegmentationItem {
            image: image.to_rgb32f().into_raw(),
            labels: mask
                .to_luma8()
                .into_raw()
                .into_iter()
                .map(i64::from)
                .collect(),
            height: height as usize,
            width: width as usize,
        }))
    }
}

// The loader stops at the first `None`; unreadable pairs are filtered out in
// `SegmentationDataset::new` so only late decode failures reach this path.
impl Dataset<SegmentationItem> for SegmentationDataset {
    fn get(&self, index: usize) -> Option<SegmentationItem> {
        match self.load(index) {
            Ok(item) => item,
            Err(err) => {
                tracing::error!(index, error = %err, "failed to load segmentation pair");
                None
            }
        }
    }

    fn len(&self) -> usize {
        self.pairs.len()
    }
}

/// Keep the pairs whose image and mask headers decode to the same size.
fn retain_readable_pairs(pairs: Vec<(PathBuf, PathBuf)>) -> Vec<(PathBuf, PathBuf)> {
    let total = pairs.len();
    let kept: Vec<_> = pairs
        .into_iter()
        .filter(|(image_path, mask_path)| match check_pair(image_path, mask_path) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(
                    image = %image_path.display(),
                    error = %err,
                    "skipping unreadable pair"
                );
                false
            }
        })
        .collect();

    if kept.len() < total {
        tracing::warn!(
            skipped = total - kept.len(),
            kept = kept.len(),
            "dropped unreadable pairs"
        );
    }
    kept
}

fn check_pair(image_path: &Path, mask_path: &Path) -> DatasetResult<()> {
    let image_size = dimensions(image_path)?;
    let mask_size = dimensions(mask_path)?;
    if image_size != mask_size {
        return Err(DatasetError::SizeMismatch {
            image: image_path.to_path_buf(),
            image_size,
            mask_size,
        });
    }
    Ok(())
}

fn dimensions(path: &Path) -> DatasetResult<(u32, u32)> {
    image::image_dimensions(path).map_err(|source| DatasetError::ImageOpenFailed {
        path: path.to_path_buf(),
        source,
    })
}

fn open(path: &Path) -> DatasetResult<DynamicImage> {
    image::open(path).map_err(|source| DatasetError::ImageOpenFailed {
        path: path.to_path_buf(),
        source,
    })
}

/// Pair every image under `image_root` with the mask at the same relative
/// path stem under `mask_root`. Images without a mask are skipped.
pub fn collect_pairs(image_root: &Path, mask_root: &Path) -> DatasetResult<Vec<(PathBuf, PathBuf)>> {
    if !image_root.is_dir() {
        return Err(DatasetError::ImageDirectoryNotFound {
            path: image_root.to_path_buf(),
        });
    }
    if !mask_root.is_dir() {
        return Err(DatasetError::MaskDirectoryNotFound {
            path: mask_root.to_path_buf(),
        });
    }

    let masks: HashMap<String, PathBuf> = image_files(mask_root)?.into_iter().collect();

    let mut pairs = Vec::new();
    for (key, image_path) in image_files(image_root)? {
        match masks.get(&key) {
            Some(mask_path) => pairs.push((image_path, mask_path.clone())),
            None => tracing::warn!(image = %image_path.display(), "no mask found, skipping"),
        }
    }

    if pairs.is_empty() {
        return Err(DatasetError::NoValidPairs {
            path: image_root.to_path_buf(),
        });
    }
    Ok(pairs)
}

/// Decodable image files below `root`, keyed by relative path without
/// extension, in file-name order.
fn image_files(root: &Path) -> DatasetResult<Vec<(String, PathBuf)>> {
    let mut files = Vec::new();

    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|source| DatasetError::DirectoryReadFailed {
            path: root.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if !entry.file_type().is_file() || !is_supported_image(path) {
            continue;
        }

        let relative = path.strip_prefix(root).unwrap_or(path).with_extension("");
        let key = relative
            .to_str()
            .ok_or_else(|| DatasetError::InvalidUtf8Path {
                path: path.to_path_buf(),
            })?
            .replace('\\', "/");

        files.push((key, path.to_path_buf()));
    }

    Ok(files)
}

fn is_supported_image(path: &Path) -> bool {
    ImageFormat::from_path(path).is_ok_and(|format| format.reading_enabled())
}
