//! Geometric augmentation shared by an image and its mask.
//!
//! Every transform is applied to both members of a pair with the same
//! parameters, so label pixels stay aligned with image pixels:
//! 1. Upscale when the pair is smaller than the crop (Lanczos3 for the image,
//!    Nearest for the mask so class ids are never blended)
//! 2. Crop to the target size, random for training and centred for validation
//! 3. Horizontal flip with 50% probability (training only, optional)

use std::sync::atomic::{AtomicU64, Ordering};

use image::{imageops::FilterType, DynamicImage, GenericImageView};
use rand::{rngs::StdRng, Rng, SeedableRng};

/// Applies identical crops and flips to image/mask pairs.
#[derive(Debug)]
pub struct PairAugmentor {
    /// Target size as `(height, width)`.
    crop_size: (u32, u32),
    horizontal_flip: bool,
    seed: u64,
    // One RNG stream per call, so concurrent loader workers never share state.
    draws: AtomicU64,
}

impl PairAugmentor {
    pub fn new(crop_size: [u32; 2], horizontal_flip: bool, seed: u64) -> Self {
        Self {
            crop_size: (crop_size[0], crop_size[1]),
            horizontal_flip,
            seed,
            draws: AtomicU64::new(0),
        }
    }

    /// Target size as `(height, width)`.
    pub fn crop_size(&self) -> (u32, u32) {
        self.crop_size
    }

    fn next_rng(&self) -> StdRng {
        let draw = self.draws.fetch_add(1, Ordering::Relaxed);
        StdRng::seed_from_u64(self.seed.wrapping_add(draw.wrapping_mul(0x9E37_79B9_7F4A_7C15)))
    }

    /// Produce a `crop_size` pair.
    ///
    /// Training pairs get a random window and an optional flip; validation
    /// pairs always get the centre window.
    pub fn apply(
        &self,
        image: DynamicImage,
        mask: DynamicImage,
        is_training: bool,
    ) -> (DynamicImage, DynamicImage) {
        let (image, mask) = self.ensure_min_size(image, mask);

        if !is_training {
            return self.center_crop(image, mask);
        }

        let mut rng = self.next_rng();
        let (image, mask) = self.random_crop(image, mask, &mut rng);
        if self.horizontal_flip && rng.random_bool(0.5) {
            (image.fliph(), mask.fliph())
        } else {
            (image, mask)
        }
    }

    /// Scale the pair up, keeping the aspect ratio, until it covers the crop.
    fn ensure_min_size(
        &self,
        image: DynamicImage,
        mask: DynamicImage,
    ) -> (DynamicImage, DynamicImage) {
        let (width, height) = image.dimensions();
        let (crop_height, crop_width) = self.crop_size;

        if width >= crop_width && height >= crop_height {
            return (image, mask);
        }

        let scale = f64::max(
            f64::from(crop_width) / f64::from(width.max(1)),
            f64::from(crop_height) / f64::from(height.max(1)),
        );
        let new_width = ((f64::from(width) * scale).ceil() as u32).max(crop_width);
        let new_height = ((f64::from(height) * scale).ceil() as u32).max(crop_height);

        tracing::debug!(
            width,
            height,
            new_width,
            new_height,
            "upscaling pair smaller than the crop"
        );

        (
            image.resize_exact(new_width, new_height, FilterType::Lanczos3),
            mask.resize_exact(new_width, new_height, FilterType::Nearest),
        )
    }

    fn random_crop(
        &self,
        image: DynamicImage,
        mask: DynamicImage,
        rng: &mut StdRng,
    ) -> (DynamicImage, DynamicImage) {
        let (width, height) = image.dimensions();
        let (crop_height, crop_width) = self.crop_size;

        let x = rng.random_range(0..=width - crop_width);
        let y = rng.random_range(0..=height - crop_height);

        (
            image.crop_imm(x, y, crop_width, crop_height),
            mask.crop_imm(x, y, crop_width, crop_height),
        )
    }

    fn center_crop(&self, image: DynamicImage, mask: DynamicImage) -> (DynamicImage, DynamicImage) {
        let (width, height) = image.dimensions();
        let (crop_height, crop_width) = self.crop_size;

        let x = (width - crop_width) / 2;
        let y = (height - crop_height) / 2;

        (
            image.crop_imm(x, y, crop_width, crop_height),
            mask.crop_imm(x, y, crop_width, crop_height),
        )
    }
}

#[cfg(test)]
mod tests {
    use image::{GrayImage, Luma, Rgb, RgbImage};

    use super::*;

    /// Image whose red channel and mask luma both encode the column index.
    fn column_coded_pair(width: u32, height: u32) -> (DynamicImage, DynamicImage) {
        let image = RgbImage::from_fn(width, height, |x, y| Rgb([x as u8, y as u8, 0]));
        let mask = GrayImage::from_fn(width, height, |x, _| Luma([x as u8]));
        (DynamicImage::ImageRgb8(image), DynamicImage::ImageLuma8(mask))
    }

    fn assert_co_registered(image: &DynamicImage, mask: &DynamicImage) {
        let image = image.to_rgb8();
        let mask = mask.to_luma8();
        assert_eq!(image.dimensions(), mask.dimensions());
        for (x, y, pixel) in image.enumerate_pixels() {
            assert_eq!(pixel[0], mask.get_pixel(x, y)[0], "misaligned at ({x}, {y})");
        }
    }

    #[test]
    fn training_crop_has_target_size_and_stays_aligned() {
        let augmentor = PairAugmentor::new([16, 24], true, 7);

        for _ in 0..8 {
            let (image, mask) = column_coded_pair(64, 40);
            let (image, mask) = augmentor.apply(image, mask, true);

            assert_eq!(image.dimensions(), (24, 16));
            assert_co_registered(&image, &mask);
        }
    }

    #[test]
    fn validation_uses_the_centre_window() {
        let augmentor = PairAugmentor::new([4, 4], true, 0);
        let (image, mask) = column_coded_pair(10, 8);

        let (image, mask) = augmentor.apply(image, mask, false);

        let image = image.to_rgb8();
        assert_eq!(image.get_pixel(0, 0).0, [3, 2, 0]);
        assert_eq!(mask.to_luma8().get_pixel(3, 0)[0], 6);
    }

    #[test]
    fn validation_is_deterministic() {
        let augmentor = PairAugmentor::new([8, 8], true, 3);

        let (a, _) = augmentor.apply(column_coded_pair(30, 30).0, column_coded_pair(30, 30).1, false);
        let (b, _) = augmentor.apply(column_coded_pair(30, 30).0, column_coded_pair(30, 30).1, false);

        assert_eq!(a.to_rgb8().into_raw(), b.to_rgb8().into_raw());
    }

    #[test]
    fn small_pairs_are_upscaled_before_cropping() {
        let augmentor = PairAugmentor::new([32, 32], false, 1);
        let image = DynamicImage::ImageRgb8(RgbImage::new(20, 10));
        let mask = DynamicImage::ImageLuma8(GrayImage::from_pixel(20, 10, Luma([3])));

        let (image, mask) = augmentor.apply(image, mask, true);

        assert_eq!(image.dimensions(), (32, 32));
        assert_eq!(mask.dimensions(), (32, 32));
        // Nearest-neighbour resampling keeps class ids intact.
        assert!(mask.to_luma8().pixels().all(|p| p[0] == 3));
    }

    #[test]
    fn same_seed_gives_the_same_crop_sequence() {
        let first = PairAugmentor::new([8, 8], true, 11);
        let second = PairAugmentor::new([8, 8], true, 11);

        for _ in 0..4 {
            let (a, _) = first.apply(column_coded_pair(40, 40).0, column_coded_pair(40, 40).1, true);
            let (b, _) =
                second.apply(column_coded_pair(40, 40).0, column_coded_pair(40, 40).1, true);
            assert_eq!(a.to_rgb8().into_raw(), b.to_rgb8().into_raw());
        }
    }
}
