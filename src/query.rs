use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use candle_core::Device;
use serde::Serialize;
use tracing::{debug, info};

use crate::{
    encoder::HybridEncoder,
    error::{Error, Result},
    ocr::{self, OcrEngine},
    page_index::IndexHandle,
    preprocess::ImageProcessor,
};

pub const DEFAULT_TOP_K: usize = 5;

#[derive(Debug, Clone, Copy)]
pub struct QueryOptions {
    pub top_k: usize,
    /// OCR the snippet and candidates to confirm matches.
    pub verify: bool,
    /// Upper bound for each OCR call.
    pub ocr_timeout: Duration,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            top_k: DEFAULT_TOP_K,
            verify: true,
            ocr_timeout: ocr::DEFAULT_TIMEOUT,
        }
    }
}

/// One ranked candidate page.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    pub score: f32,
    pub pdf_id: String,
    pub page_number: i64,
    pub image_path: PathBuf,
    /// The snippet's OCR text was found verbatim on this page.
    pub ocr_match: bool,
}

/// Answers snippet queries against the current index.
///
/// Holds no mutable state, so one service can serve concurrent queries.
pub struct QueryService<E> {
    encoder: HybridEncoder,
    processor: ImageProcessor,
    device: Device,
    index: IndexHandle,
    ocr: E,
}

impl<E: OcrEngine> QueryService<E> {
    pub fn new(
        encoder: HybridEncoder,
        device: Device,
        index: IndexHandle,
        ocr: E,
    ) -> Result<Self> {
        let embed_dim = encoder.config().embed_dim;
        let index_dim = index.snapshot().dimension();
        if embed_dim != index_dim {
            return Err(Error::ArtifactMismatch(format!(
                "encoder produces {embed_dim}-dimensional vectors, index holds {index_dim}"
            )));
        }
        Ok(Self {
            processor: ImageProcessor::new(encoder.config().image_size),
            encoder,
            device,
            index,
            ocr,
        })
    }

    pub fn index(&self) -> &IndexHandle {
        &self.index
    }

    /// Embed a snippet image into a unit query vector.
    pub fn embed_snippet(&self, snippet: &Path) -> Result<Vec<f32>> {
        let image = self.processor.load(snippet, &self.device)?.unsqueeze(0)?;
        let embedding = self.encoder.forward(&image)?.detach();
        let mut rows = embedding.to_vec2::<f32>()?;
        let mut vector = rows
            .pop()
            .ok_or_else(|| Error::Config("encoder returned no embedding".into()))?;
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        Ok(vector)
    }

    /// Find the pages most similar to `snippet`.
    ///
    /// Returns `min(top_k, N)` results by descending score. OCR problems
    /// only clear `ocr_match`; they never fail the query.
    pub async fn query(
        &self,
        snippet: &Path,
        options: &QueryOptions,
    ) -> Result<Vec<QueryResult>> {
        let query = self.embed_snippet(snippet)?;
        let index = self.index.snapshot();

        let mut results: Vec<QueryResult> = index
            .search(&query, options.top_k)?
            .into_iter()
            .map(|(hit, page)| QueryResult {
                score: hit.score,
                pdf_id: page.pdf_id.clone(),
                page_number: page.page_number,
                image_path: page.image_path.clone(),
                ocr_match: false,
            })
            .collect();
        info!(
            snippet = %snippet.display(),
            candidates = results.len(),
            build_id = index.build_id(),
            "ranked pages"
        );

        if options.verify && !results.is_empty() {
            self.verify(snippet, &mut results, options.ocr_timeout).await;
        }
        Ok(results)
    }

    async fn verify(
        &self,
        snippet: &Path,
        results: &mut [QueryResult],
        timeout: Duration,
    ) {
        let snippet_text = ocr::extract_or_empty(&self.ocr, snippet, timeout).await;
        if snippet_text.trim().is_empty() {
            debug!("snippet has no text, skipping page OCR");
            return;
        }

        for result in results.iter_mut() {
            let page_text =
                ocr::extract_or_empty(&self.ocr, &result.image_path, timeout).await;
            result.ocr_match = ocr::text_matches(&snippet_text, &page_text);
            debug!(
                pdf_id = %result.pdf_id,
                page = result.page_number,
                ocr_match = result.ocr_match,
                "verified candidate"
            );
        }
    }
}

/// Format results for human-readable terminal output.
pub fn format_human(results: &[QueryResult], verified: bool) {
    if results.is_empty() {
        println!("No results found.");
        return;
    }

    for (i, r) in results.iter().enumerate() {
        let check = match (verified, r.ocr_match) {
            (false, _) => "",
            (true, true) => "  [text match]",
            (true, false) => "  [no text match]",
        };
        println!(
            "{:>3}. [{:.3}] {} p.{}{check}",
            i + 1,
            r.score,
            r.pdf_id,
            r.page_number
        );
        println!("     {}", r.image_path.display());
    }
    println!("\n{} result(s)", results.len());
}

#[derive(Serialize)]
struct JsonOutput<'a> {
    snippet: &'a Path,
    results: &'a [QueryResult],
}

/// Format results as JSON output.
pub fn format_json(results: &[QueryResult], snippet: &Path) -> Result<()> {
    let out = serde_json::to_string_pretty(&JsonOutput { snippet, results })?;
    println!("{out}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use candle_core::DType;
    use candle_nn::{VarBuilder, VarMap};

    use super::*;
    use crate::{
        encoder::tests::tiny_config,
        index_builder::{BuildOptions, build_index},
        model_manager::ModelManager,
        page::Page,
    };

    /// Returns canned text per file name; unknown files fail.
    struct CannedOcr(HashMap<String, String>);

    impl CannedOcr {
        fn new(entries: &[(&str, &str)]) -> Self {
            Self(
                entries
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            )
        }
    }

    impl OcrEngine for CannedOcr {
        async fn extract_text(&self, image: &Path) -> Result<String> {
            let name = image
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            self.0
                .get(&name)
                .cloned()
                .ok_or_else(|| Error::Ocr(format!("no text for {name}")))
        }
    }

    fn encoder() -> HybridEncoder {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        HybridEncoder::new(&tiny_config(), vb).unwrap()
    }

    fn setup(dir: &Path, ocr: CannedOcr) -> QueryService<CannedOcr> {
        let colors = [[220, 20, 20], [20, 20, 220], [20, 220, 20]];
        let pages: Vec<Page> = colors
            .iter()
            .enumerate()
            .map(|(i, rgb)| {
                let path = dir.join(format!("doc_page_{i}.png"));
                image::RgbImage::from_pixel(64, 80, image::Rgb(*rgb))
                    .save(&path)
                    .unwrap();
                Page::new("doc", i as i64, path)
            })
            .collect();

        let encoder = encoder();
        let mut model = ModelManager::from_encoder(encoder.clone(), Device::Cpu);
        let index = build_index(
            pages,
            &mut model,
            &BuildOptions {
                batch_size: 2,
                progress: false,
            },
        )
        .unwrap();
        QueryService::new(encoder, Device::Cpu, IndexHandle::new(index), ocr).unwrap()
    }

    #[tokio::test]
    async fn result_count_is_min_of_k_and_corpus() {
        let tmp = tempfile::tempdir().unwrap();
        let service = setup(tmp.path(), CannedOcr::new(&[]));
        let snippet = tmp.path().join("doc_page_1.png");

        for (k, expected) in [(0, 0), (1, 1), (2, 2), (3, 3), (10, 3)] {
            let options = QueryOptions {
                top_k: k,
                verify: false,
                ..Default::default()
            };
            let results = service.query(&snippet, &options).await.unwrap();
            assert_eq!(results.len(), expected);
            assert!(results.windows(2).all(|w| w[0].score >= w[1].score));
        }
    }

    #[tokio::test]
    async fn verbatim_text_marks_a_match() {
        let tmp = tempfile::tempdir().unwrap();
        let ocr = CannedOcr::new(&[
            ("snippet.png", "  quarterly results \n"),
            ("doc_page_0.png", "nothing relevant"),
            ("doc_page_1.png", "the quarterly results are in"),
        ]);
        let service = setup(tmp.path(), ocr);
        let snippet = tmp.path().join("snippet.png");
        std::fs::copy(tmp.path().join("doc_page_1.png"), &snippet).unwrap();

        let results = service
            .query(&snippet, &QueryOptions { top_k: 3, ..Default::default() })
            .await
            .unwrap();
        for r in &results {
            assert_eq!(r.ocr_match, r.page_number == 1, "page {}", r.page_number);
        }
    }

    #[tokio::test]
    async fn empty_snippet_text_matches_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let ocr = CannedOcr::new(&[
            ("snippet.png", " \n\t"),
            ("doc_page_0.png", "anything"),
            ("doc_page_1.png", "anything"),
            ("doc_page_2.png", "anything"),
        ]);
        let service = setup(tmp.path(), ocr);
        let snippet = tmp.path().join("snippet.png");
        std::fs::copy(tmp.path().join("doc_page_0.png"), &snippet).unwrap();

        let results = service
            .query(&snippet, &QueryOptions { top_k: 3, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| !r.ocr_match));
    }

    #[tokio::test]
    async fn disabled_verification_leaves_matches_false() {
        let tmp = tempfile::tempdir().unwrap();
        let ocr = CannedOcr::new(&[
            ("snippet.png", "same"),
            ("doc_page_0.png", "same"),
            ("doc_page_1.png", "same"),
            ("doc_page_2.png", "same"),
        ]);
        let service = setup(tmp.path(), ocr);
        let snippet = tmp.path().join("snippet.png");
        std::fs::copy(tmp.path().join("doc_page_2.png"), &snippet).unwrap();

        let options = QueryOptions {
            top_k: 3,
            verify: false,
            ..Default::default()
        };
        let results = service.query(&snippet, &options).await.unwrap();
        assert!(results.iter().all(|r| !r.ocr_match));
    }

    #[test]
    fn mismatched_dimensions_are_rejected() {
        let index = crate::page_index::PageIndex::new(
            1,
            crate::flat_index::FlatIndex::new(3, vec![1.0, 0.0, 0.0]).unwrap(),
            vec![Page::new("a", 1, "a.png")],
        )
        .unwrap();
        let err = QueryService::new(
            encoder(),
            Device::Cpu,
            IndexHandle::new(index),
            CannedOcr::new(&[]),
        )
        .err()
        .unwrap();
        assert!(matches!(err, Error::ArtifactMismatch(_)));
    }
}
