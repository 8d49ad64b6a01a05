//! Embedding a page corpus into a searchable [`PageIndex`].

use std::path::Path;

use candle_core::Device;
use kdam::BarExt;
use rayon::prelude::*;
use tracing::{debug, info};

use crate::{
    artifacts::new_build_id,
    error::{Error, Result},
    flat_index::FlatIndex,
    model_manager::ModelManager,
    page::{Page, dedupe_pages, load_page_records},
    page_index::PageIndex,
    walker::discover_pages,
};

/// Pages decoded and embedded together.
pub const DEFAULT_BATCH_SIZE: usize = 8;

#[derive(Debug, Clone, Copy)]
pub struct BuildOptions {
    pub batch_size: usize,
    /// Draw a progress bar on stderr.
    pub progress: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            progress: true,
        }
    }
}

/// Read the corpus from a page-records JSON file or a directory of page
/// images.
pub fn load_pages(source: &Path) -> Result<Vec<Page>> {
    if source.is_dir() {
        discover_pages(source)
    } else {
        load_page_records(source)
    }
}

/// Embed every distinct page and collect the vectors into a fresh index.
///
/// Duplicate records collapse to one row each. Any page that cannot be
/// decoded aborts the build with an error naming that page.
pub fn build_index(
    pages: impl IntoIterator<Item = Page>,
    model: &mut ModelManager,
    options: &BuildOptions,
) -> Result<PageIndex> {
    if options.batch_size == 0 {
        return Err(Error::Config("batch size must be positive".into()));
    }
    let pages = dedupe_pages(pages);
    if pages.is_empty() {
        return Err(Error::Config("cannot build an index from an empty corpus".into()));
    }
    info!(pages = pages.len(), "embedding pages");

    let processor = model.processor()?;
    let mut pb = kdam::tqdm!(
        total = pages.len(),
        desc = "embedding",
        disable = !options.progress
    );

    let mut data = Vec::new();
    let mut dimension = 0;
    for chunk in pages.chunks(options.batch_size) {
        let images = chunk
            .par_iter()
            .map(|page| {
                processor
                    .load(&page.image_path, &Device::Cpu)
                    .map_err(|e| e.for_page(page))
            })
            .collect::<Result<Vec<_>>>()?;

        for (page, mut vector) in chunk.iter().zip(model.embed_images(&images)?) {
            normalize(&mut vector);
            dimension = vector.len();
            debug!(%page, "embedded page");
            data.extend(vector);
        }
        pb.update(chunk.len())?;
    }

    let vectors = FlatIndex::new(dimension, data)?;
    let index = PageIndex::new(new_build_id(), vectors, pages)?;
    info!(
        rows = index.len(),
        dimension = index.dimension(),
        build_id = index.build_id(),
        "built page index"
    );
    Ok(index)
}

/// Rescale to unit length in place; a zero vector is left as is.
fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        vector.iter_mut().for_each(|v| *v /= norm);
    }
}
