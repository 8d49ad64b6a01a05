//! snipseek - find the document page a screenshot snippet was cut from.
//!
//! Pages rasterized from PDFs are embedded by a hybrid CNN + transformer
//! encoder into unit vectors. A snippet is embedded the same way and
//! matched against the pages by exact inner-product search; the top
//! candidates are then double-checked by comparing OCR text.
//!
//! The encoder is fine-tuned contrastively on random crops of the pages
//! themselves, so no labelled data is needed.
//!
//! # Quick start
//!
//! ```no_run
//! use std::path::Path;
//!
//! use candle_core::Device;
//! use snipseek::{
//!     DataDir, IndexHandle, ModelManager, QueryService,
//!     index_builder::{self, BuildOptions},
//!     model_manager,
//!     ocr::TesseractOcr,
//!     query::QueryOptions,
//! };
//!
//! # async fn run() -> snipseek::Result<()> {
//! let data_dir = DataDir::resolve(None)?;
//! let mut model = ModelManager::new(data_dir.weights(), Device::Cpu);
//!
//! let pages = index_builder::load_pages(Path::new("pages/"))?;
//! let index = index_builder::build_index(pages, &mut model, &BuildOptions::default())?;
//! index.save(&data_dir.artifacts(None, None, None))?;
//!
//! let encoder = model_manager::load_encoder(&data_dir.weights(), None, &Device::Cpu)?;
//! let service = QueryService::new(
//!     encoder,
//!     Device::Cpu,
//!     IndexHandle::new(index),
//!     TesseractOcr::default(),
//! )?;
//! for r in service.query(Path::new("snippet.png"), &QueryOptions::default()).await? {
//!     println!("{} p.{} ({:.3}, text match: {})", r.pdf_id, r.page_number, r.score, r.ocr_match);
//! }
//! # Ok(())
//! # }
//! ```

pub mod artifacts;
pub mod cli;
pub mod data_dir;
pub mod dataset;
pub mod encoder;
pub mod error;
pub mod flat_index;
pub mod index_builder;
pub mod index_db;
pub mod loss;
pub mod model_manager;
pub mod ocr;
pub mod page;
pub mod page_index;
pub mod preprocess;
pub mod query;
pub mod sampler;
pub mod trainer;
pub mod walker;

pub use data_dir::DataDir;
pub use encoder::{EncoderConfig, HybridEncoder};
pub use error::{Error, Result};
pub use model_manager::ModelManager;
pub use page::Page;
pub use page_index::{IndexHandle, PageIndex};
pub use query::QueryService;
