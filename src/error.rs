use std::path::PathBuf;

use crate::page::Page;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tensor error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Redb(#[from] redb::Error),

    #[error("database open error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("database storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("database transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("database table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("database commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("invalid input {}: {reason}", path.display())]
    InvalidInput { path: PathBuf, reason: String },

    #[error(
        "encoder configuration mismatch on {field}: expected {expected}, found {found}"
    )]
    ConfigMismatch {
        field: &'static str,
        expected: String,
        found: String,
    },

    #[error("page {page}: {source}")]
    Corpus {
        page: Page,
        #[source]
        source: Box<Error>,
    },

    #[error("index artifacts disagree: {0}")]
    ArtifactMismatch(String),

    #[error("OCR failed: {0}")]
    Ocr(String),

    #[error("model download failed: {0}")]
    Hub(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{kind} not found: {}", path.display())]
    NotFound { kind: &'static str, path: PathBuf },

    #[error("data directory does not exist and could not be created: {0}")]
    DataDir(PathBuf),
}

impl Error {
    /// Attach the identity of the page being processed.
    pub fn for_page(self, page: &Page) -> Self {
        Self::Corpus {
            page: page.clone(),
            source: Box::new(self),
        }
    }
}
