//! Random crop generation for crop/page training pairs.
//!
//! Every sampled box lies fully inside its page and covers a fraction of
//! the page area drawn from a configurable range. The random generator is
//! always passed in, so a fixed seed reproduces the same crops.

use std::path::Path;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    page::Page,
};

/// Tries per requested crop before it is given up.
pub const MAX_ATTEMPTS: usize = 10;

/// Aspect ratios (width / height) drawn for crops.
pub const ASPECT_RANGE: (f64, f64) = (0.4, 2.5);

/// A crop rectangle in pixel coordinates, serialized as `[x, y, w, h]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "[u32; 4]", into = "[u32; 4]")]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    /// Whether the box has positive size and lies within a
    /// `page_width × page_height` page.
    pub fn fits(&self, page_width: u32, page_height: u32) -> bool {
        self.width > 0
            && self.height > 0
            && u64::from(self.x) + u64::from(self.width)
                <= u64::from(page_width)
            && u64::from(self.y) + u64::from(self.height)
                <= u64::from(page_height)
    }
}

impl From<[u32; 4]> for BoundingBox {
    fn from([x, y, width, height]: [u32; 4]) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

impl From<BoundingBox> for [u32; 4] {
    fn from(b: BoundingBox) -> Self {
        [b.x, b.y, b.width, b.height]
    }
}

/// Crop sampling parameters.
#[derive(Debug, Clone, Copy)]
pub struct CropConfig {
    /// Crops requested per page.
    pub count: usize,
    /// Smallest crop area as a fraction of the page area.
    pub min_area_frac: f64,
    /// Largest crop area as a fraction of the page area.
    pub max_area_frac: f64,
}

impl Default for CropConfig {
    fn default() -> Self {
        Self {
            count: 6,
            min_area_frac: 0.03,
            max_area_frac: 0.5,
        }
    }
}

impl CropConfig {
    pub fn validate(&self) -> Result<()> {
        let (lo, hi) = (self.min_area_frac, self.max_area_frac);
        if !(lo > 0.0 && lo <= hi && hi <= 1.0) {
            return Err(Error::Config(format!(
                "crop area fractions must satisfy 0 < min <= max <= 1, got [{lo}, {hi}]"
            )));
        }
        Ok(())
    }
}

/// Sample up to `config.count` crops on a `page_width × page_height` page.
///
/// Crops whose attempts all fail are skipped, so the result may be shorter
/// than requested (and is empty for pages too small to hold any crop).
pub fn sample_crops<R: Rng + ?Sized>(
    page_width: u32,
    page_height: u32,
    config: &CropConfig,
    rng: &mut R,
) -> Vec<BoundingBox> {
    let page_area = f64::from(page_width) * f64::from(page_height);
    let mut boxes = Vec::with_capacity(config.count);

    for _ in 0..config.count {
        for _ in 0..MAX_ATTEMPTS {
            let area_frac =
                rng.gen_range(config.min_area_frac..=config.max_area_frac);
            let aspect = rng.gen_range(ASPECT_RANGE.0..=ASPECT_RANGE.1);
            let target_area = area_frac * page_area;

            let width = (target_area * aspect).sqrt().round() as u32;
            let height = (target_area / aspect).sqrt().round() as u32;
            if width == 0
                || height == 0
                || width >= page_width
                || height >= page_height
            {
                continue;
            }

            let x = rng.gen_range(0..=page_width - width);
            let y = rng.gen_range(0..=page_height - height);
            boxes.push(BoundingBox {
                x,
                y,
                width,
                height,
            });
            break;
        }
    }

    boxes
}

/// Sample crops for the page image at `path`, reading only its header.
pub fn sample_crops_for_image<R: Rng + ?Sized>(
    path: &Path,
    config: &CropConfig,
    rng: &mut R,
) -> Result<Vec<BoundingBox>> {
    let (width, height) =
        image::image_dimensions(path).map_err(|e| Error::InvalidInput {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
    Ok(sample_crops(width, height, config, rng))
}

/// A crop of a page together with the page it was cut from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingPair {
    #[serde(flatten)]
    pub page: Page,
    pub bbox: BoundingBox,
}

/// Generate training pairs for every page.
///
/// Pages whose image cannot be read are skipped with a warning; the rest
/// of the corpus still produces pairs.
pub fn make_training_pairs<R: Rng + ?Sized>(
    pages: &[Page],
    config: &CropConfig,
    rng: &mut R,
) -> Result<Vec<TrainingPair>> {
    config.validate()?;

    let mut pairs = Vec::with_capacity(pages.len() * config.count);
    for page in pages {
        match sample_crops_for_image(&page.image_path, config, rng) {
            Ok(boxes) => {
                tracing::debug!(%page, crops = boxes.len(), "sampled crops");
                pairs.extend(boxes.into_iter().map(|bbox| TrainingPair {
                    page: page.clone(),
                    bbox,
                }));
            }
            Err(e) => tracing::warn!(%page, "skipping page: {e}"),
        }
    }

    Ok(pairs)
}

/// Read training-pair records written by [`write_training_pairs`].
pub fn load_training_pairs(path: &Path) -> Result<Vec<TrainingPair>> {
    let file = std::fs::File::open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => Error::NotFound {
            kind: "training pairs",
            path: path.to_path_buf(),
        },
        _ => Error::Io(e),
    })?;
    Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
}

pub fn write_training_pairs(path: &Path, pairs: &[TrainingPair]) -> Result<()> {
    let file = std::fs::File::create(path)?;
    serde_json::to_writer_pretty(std::io::BufWriter::new(file), pairs)?;
    Ok(())
}
