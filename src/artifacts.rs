//! On-disk form of a built page index.
//!
//! A build produces three files that share one build id:
//!
//! - the embedding matrix, a flat binary file:
//!   - 4 bytes: magic `SNPE`
//!   - 4 bytes: format version (u32 LE)
//!   - 8 bytes: row count N (u64 LE)
//!   - 4 bytes: dimension D (u32 LE)
//!   - 8 bytes: build id (u64 LE)
//!   - N * D * 4 bytes: f32 LE values in row-major order
//! - the page metadata list, JSON `{build_id, pages: [...]}` in row order
//! - the similarity index ([`IndexDb`])
//!
//! Files are first written next to their destination under a temporary
//! name and only renamed into place once all three were written.

use std::{
    io::{BufReader, BufWriter, Read, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    error::{Error, Result},
    flat_index::FlatIndex,
    index_db::IndexDb,
    page::Page,
};

pub const EMBEDDINGS_MAGIC: [u8; 4] = *b"SNPE";
pub const EMBEDDINGS_VERSION: u32 = 1;

/// magic + version + N + D + build id
const HEADER_SIZE: usize = 4 + 4 + 8 + 4 + 8;

/// Locations of the three artifacts of one index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub embeddings: PathBuf,
    pub metadata: PathBuf,
    pub index: PathBuf,
}

/// Page metadata list, aligned with the embedding matrix rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageMetadata {
    pub build_id: u64,
    pub pages: Vec<Page>,
}

/// A fresh identifier tying together the artifacts of one build.
pub fn new_build_id() -> u64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    nanos ^ rand::random::<u64>()
}

pub fn write_embeddings(path: &Path, build_id: u64, matrix: &FlatIndex) -> Result<()> {
    let dimension = u32::try_from(matrix.dimension()).map_err(|_| {
        Error::Config(format!("dimension {} does not fit u32", matrix.dimension()))
    })?;

    let mut out = BufWriter::new(std::fs::File::create(path)?);
    out.write_all(&EMBEDDINGS_MAGIC)?;
    out.write_all(&EMBEDDINGS_VERSION.to_le_bytes())?;
    out.write_all(&(matrix.len() as u64).to_le_bytes())?;
    out.write_all(&dimension.to_le_bytes())?;
    out.write_all(&build_id.to_le_bytes())?;
    for value in matrix.as_slice() {
        out.write_all(&value.to_le_bytes())?;
    }
    out.flush()?;
    Ok(())
}

/// Read an embedding matrix file, returning its build id and rows.
pub fn read_embeddings(path: &Path) -> Result<(u64, FlatIndex)> {
    let file = open_artifact(path, "embedding matrix")?;
    let mut bytes = Vec::new();
    BufReader::new(file).read_to_end(&mut bytes)?;

    let mismatch = |reason: String| {
        Error::ArtifactMismatch(format!("{}: {reason}", path.display()))
    };
    if bytes.len() < HEADER_SIZE || bytes[0..4] != EMBEDDINGS_MAGIC {
        return Err(mismatch("not an embedding matrix file".into()));
    }
    let version = u32::from_le(bytemuck::pod_read_unaligned(&bytes[4..8]));
    if version != EMBEDDINGS_VERSION {
        return Err(mismatch(format!("unsupported format version {version}")));
    }
    let count = u64::from_le(bytemuck::pod_read_unaligned(&bytes[8..16])) as usize;
    let dimension = u32::from_le(bytemuck::pod_read_unaligned(&bytes[16..20])) as usize;
    let build_id = u64::from_le(bytemuck::pod_read_unaligned(&bytes[20..28]));

    let body = &bytes[HEADER_SIZE..];
    let expected = count
        .checked_mul(dimension)
        .and_then(|n| n.checked_mul(4))
        .ok_or_else(|| mismatch("header sizes overflow".into()))?;
    if body.len() != expected {
        return Err(mismatch(format!(
            "{count} x {dimension} matrix needs {expected} bytes, found {}",
            body.len()
        )));
    }

    let data = body
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    Ok((build_id, FlatIndex::new(dimension, data)?))
}

pub fn write_metadata(path: &Path, metadata: &PageMetadata) -> Result<()> {
    let file = std::fs::File::create(path)?;
    serde_json::to_writer_pretty(BufWriter::new(file), metadata)?;
    Ok(())
}

pub fn read_metadata(path: &Path) -> Result<PageMetadata> {
    let file = open_artifact(path, "page metadata")?;
    Ok(serde_json::from_reader(BufReader::new(file))?)
}

fn open_artifact(path: &Path, kind: &'static str) -> Result<std::fs::File> {
    std::fs::File::open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => Error::NotFound {
            kind,
            path: path.to_path_buf(),
        },
        _ => Error::Io(e),
    })
}

/// `dir/name` -> `dir/.name.tmp`
fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.tmp"))
}

/// Write all three artifacts, replacing previous ones only once every new
/// file is complete.
pub fn persist(
    paths: &ArtifactPaths,
    build_id: u64,
    matrix: &FlatIndex,
    pages: &[Page],
) -> Result<()> {
    if matrix.len() != pages.len() {
        return Err(Error::ArtifactMismatch(format!(
            "{} embedding rows for {} pages",
            matrix.len(),
            pages.len()
        )));
    }
    for path in [&paths.embeddings, &paths.metadata, &paths.index] {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
    }

    let staged = [
        (temp_sibling(&paths.embeddings), &paths.embeddings),
        (temp_sibling(&paths.metadata), &paths.metadata),
        (temp_sibling(&paths.index), &paths.index),
    ];

    let written = (|| -> Result<()> {
        write_embeddings(&staged[0].0, build_id, matrix)?;
        write_metadata(
            &staged[1].0,
            &PageMetadata {
                build_id,
                pages: pages.to_vec(),
            },
        )?;
        IndexDb::create(&staged[2].0)?.store(build_id, matrix)?;
        Ok(())
    })();
    if let Err(e) = written {
        for (tmp, _) in &staged {
            let _ = std::fs::remove_file(tmp);
        }
        return Err(e);
    }

    for (tmp, dest) in &staged {
        std::fs::rename(tmp, dest)?;
    }
    debug!(build_id, rows = pages.len(), "persisted index artifacts");
    Ok(())
}

/// Everything a query needs, read back and cross-checked.
#[derive(Debug, Clone)]
pub struct LoadedArtifacts {
    pub build_id: u64,
    pub vectors: FlatIndex,
    pub pages: Vec<Page>,
}

/// Load the similarity index and metadata list, and the embedding matrix
/// when given, rejecting artifacts from different builds.
pub fn load(
    index: &Path,
    metadata: &Path,
    embeddings: Option<&Path>,
) -> Result<LoadedArtifacts> {
    let (info, vectors) = IndexDb::open(index)?.load()?;
    let meta = read_metadata(metadata)?;

    if meta.build_id != info.build_id {
        return Err(Error::ArtifactMismatch(format!(
            "metadata belongs to build {}, index to build {}",
            meta.build_id, info.build_id
        )));
    }
    if meta.pages.len() != info.count {
        return Err(Error::ArtifactMismatch(format!(
            "metadata lists {} pages, index holds {} vectors",
            meta.pages.len(),
            info.count
        )));
    }

    if let Some(path) = embeddings {
        let (build_id, matrix) = read_embeddings(path)?;
        if build_id != info.build_id {
            return Err(Error::ArtifactMismatch(format!(
                "embedding matrix belongs to build {build_id}, index to build {}",
                info.build_id
            )));
        }
        if matrix.dimension() != info.dimension || matrix.len() != info.count {
            return Err(Error::ArtifactMismatch(format!(
                "embedding matrix is {} x {}, index is {} x {}",
                matrix.len(),
                matrix.dimension(),
                info.count,
                info.dimension
            )));
        }
    }

    Ok(LoadedArtifacts {
        build_id: info.build_id,
        vectors,
        pages: meta.pages,
    })
}
