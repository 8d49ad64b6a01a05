//! Image decoding and normalization ahead of the encoder.
//!
//! 1. Decode the image file and convert it to RGB
//! 2. Optionally crop it to a bounding box
//! 3. Resize to a fixed square with bilinear interpolation
//! 4. Normalize each channel with ImageNet mean/std into a `(3, S, S)` tensor

use std::path::Path;

use candle_core::{Device, Tensor};
use image::{DynamicImage, GenericImageView, imageops::FilterType};

use crate::{
    error::{Error, Result},
    sampler::BoundingBox,
};

pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Turns page and snippet images into normalized encoder input.
#[derive(Debug, Clone)]
pub struct ImageProcessor {
    size: u32,
    mean: [f32; 3],
    std: [f32; 3],
}

impl ImageProcessor {
    pub fn new(size: u32) -> Self {
        Self {
            size,
            mean: IMAGENET_MEAN,
            std: IMAGENET_STD,
        }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Decode an image file.
    pub fn open(&self, path: &Path) -> Result<DynamicImage> {
        let img = image::open(path).map_err(|e| match e {
            image::ImageError::IoError(io) => Error::Io(io),
            other => invalid(path, other),
        })?;
        let (width, height) = img.dimensions();
        if width == 0 || height == 0 {
            return Err(invalid(path, "image has zero dimensions"));
        }
        Ok(img)
    }

    /// Decode and normalize an image file into a `(3, S, S)` tensor.
    pub fn load(&self, path: &Path, device: &Device) -> Result<Tensor> {
        let img = self.open(path)?;
        self.to_tensor(&img, device)
    }

    /// Decode an image file, cut out `bbox`, and normalize the crop.
    pub fn load_crop(
        &self,
        path: &Path,
        bbox: &BoundingBox,
        device: &Device,
    ) -> Result<Tensor> {
        let img = self.open(path)?;
        let crop = crop_checked(path, &img, bbox)?;
        self.to_tensor(&crop, device)
    }

    /// Decode a page once and return `(crop, page)` tensors for a training
    /// pair.
    pub fn load_pair(
        &self,
        path: &Path,
        bbox: &BoundingBox,
        device: &Device,
    ) -> Result<(Tensor, Tensor)> {
        let img = self.open(path)?;
        let crop = crop_checked(path, &img, bbox)?;
        Ok((self.to_tensor(&crop, device)?, self.to_tensor(&img, device)?))
    }

    /// Resize and normalize a decoded image into a channel-first tensor.
    pub fn to_tensor(&self, img: &DynamicImage, device: &Device) -> Result<Tensor> {
        let size = self.size as usize;
        let rgb = img
            .resize_exact(self.size, self.size, FilterType::Triangle)
            .to_rgb8();

        let plane = size * size;
        let mut data = vec![0f32; 3 * plane];
        for (i, pixel) in rgb.pixels().enumerate() {
            for c in 0..3 {
                data[c * plane + i] =
                    (f32::from(pixel[c]) / 255.0 - self.mean[c]) / self.std[c];
            }
        }

        Ok(Tensor::from_vec(data, (3, size, size), device)?)
    }
}

fn crop_checked(
    path: &Path,
    img: &DynamicImage,
    bbox: &BoundingBox,
) -> Result<DynamicImage> {
    let (width, height) = img.dimensions();
    if !bbox.fits(width, height) {
        return Err(invalid(
            path,
            format!(
                "crop {:?} does not fit a {width}x{height} page",
                <[u32; 4]>::from(*bbox)
            ),
        ));
    }
    Ok(img.crop_imm(bbox.x, bbox.y, bbox.width, bbox.height))
}

fn invalid(path: &Path, reason: impl ToString) -> Error {
    Error::InvalidInput {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}
