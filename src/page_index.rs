use std::sync::{Arc, RwLock};

use crate::{
    artifacts::{self, ArtifactPaths, LoadedArtifacts},
    error::{Error, Result},
    flat_index::{FlatIndex, Hit},
    page::Page,
};

/// An immutable, searchable set of page embeddings.
///
/// Row `i` of the vectors and entry `i` of the page list describe the same
/// page.
#[derive(Debug, Clone)]
pub struct PageIndex {
    build_id: u64,
    vectors: FlatIndex,
    pages: Vec<Page>,
}

impl PageIndex {
    pub fn new(build_id: u64, vectors: FlatIndex, pages: Vec<Page>) -> Result<Self> {
        if vectors.len() != pages.len() {
            return Err(Error::ArtifactMismatch(format!(
                "{} vectors for {} pages",
                vectors.len(),
                pages.len()
            )));
        }
        Ok(Self {
            build_id,
            vectors,
            pages,
        })
    }

    /// Load a persisted index; see [`artifacts::load`].
    pub fn open(paths: &ArtifactPaths, verify_embeddings: bool) -> Result<Self> {
        let LoadedArtifacts {
            build_id,
            vectors,
            pages,
        } = artifacts::load(
            &paths.index,
            &paths.metadata,
            verify_embeddings.then_some(paths.embeddings.as_path()),
        )?;
        Self::new(build_id, vectors, pages)
    }

    pub fn save(&self, paths: &ArtifactPaths) -> Result<()> {
        artifacts::persist(paths, self.build_id, &self.vectors, &self.pages)
    }

    pub fn build_id(&self) -> u64 {
        self.build_id
    }

    pub fn dimension(&self) -> usize {
        self.vectors.dimension()
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn pages(&self) -> &[Page] {
        &self.pages
    }

    pub fn vectors(&self) -> &FlatIndex {
        &self.vectors
    }

    /// The `min(k, len)` best pages for a unit query vector.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(Hit, &Page)>> {
        self.vectors
            .search(query, k)?
            .into_iter()
            .map(|hit| {
                self.pages
                    .get(hit.row)
                    .map(|page| (hit, page))
                    .ok_or_else(|| {
                        Error::ArtifactMismatch(format!("no page for row {}", hit.row))
                    })
            })
            .collect()
    }
}

/// Shared handle to the current index.
///
/// Readers take a snapshot and keep using it even if a rebuild swaps in a
/// new index meanwhile.
#[derive(Debug, Clone)]
pub struct IndexHandle {
    current: Arc<RwLock<Arc<PageIndex>>>,
}

impl IndexHandle {
    pub fn new(index: PageIndex) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(index))),
        }
    }

    pub fn snapshot(&self) -> Arc<PageIndex> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Replace the index; returns the previous one.
    pub fn swap(&self, index: PageIndex) -> Arc<PageIndex> {
        let next = Arc::new(index);
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        std::mem::replace(&mut *guard, next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index(build_id: u64, rows: &[[f32; 2]]) -> PageIndex {
        let pages = (0..rows.len())
            .map(|i| Page::new("doc", i as i64, format!("/p/doc_page_{i}.png")))
            .collect();
        let vectors = FlatIndex::new(2, rows.iter().flatten().copied().collect()).unwrap();
        PageIndex::new(build_id, vectors, pages).unwrap()
    }

    #[test]
    fn search_resolves_pages() {
        let idx = index(1, &[[1.0, 0.0], [0.0, 1.0]]);
        let hits = idx.search(&[0.0, 1.0], 5).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].1.page_number, 1);
    }

    #[test]
    fn misaligned_pages_are_rejected() {
        let vectors = FlatIndex::new(1, vec![1.0, 2.0]).unwrap();
        let pages = vec![Page::new("a", 1, "/a.png")];
        assert!(PageIndex::new(1, vectors, pages).is_err());
    }

    #[test]
    fn snapshots_survive_a_swap() {
        let handle = IndexHandle::new(index(1, &[[1.0, 0.0]]));
        let before = handle.snapshot();

        let old = handle.swap(index(2, &[[1.0, 0.0], [0.0, 1.0]]));
        assert_eq!(old.build_id(), 1);
        assert_eq!(before.len(), 1);
        assert_eq!(handle.snapshot().build_id(), 2);
    }

    #[test]
    fn save_and_open() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = ArtifactPaths {
            embeddings: tmp.path().join("e.bin"),
            metadata: tmp.path().join("m.json"),
            index: tmp.path().join("i.redb"),
        };
        let idx = index(3, &[[0.6, 0.8]]);
        idx.save(&paths).unwrap();

        let opened = PageIndex::open(&paths, true).unwrap();
        assert_eq!(opened.build_id(), 3);
        assert_eq!(opened.pages(), idx.pages());
    }
}
