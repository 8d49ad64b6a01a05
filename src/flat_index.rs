use rayon::prelude::*;

use crate::error::{Error, Result};

/// One search hit: the matrix row and its inner product with the query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hit {
    pub row: usize,
    pub score: f32,
}

/// Exact maximum inner product search over a row-major `N × D` matrix.
///
/// Every query is scored against every row; there is no approximation.
#[derive(Debug, Clone, PartialEq)]
pub struct FlatIndex {
    dimension: usize,
    data: Vec<f32>,
}

impl FlatIndex {
    /// Wrap a row-major matrix of `data.len() / dimension` vectors.
    ///
    /// # Examples
    ///
    /// ```
    /// use snipseek::flat_index::FlatIndex;
    ///
    /// let index = FlatIndex::new(2, vec![1.0, 0.0, 0.0, 1.0]).unwrap();
    /// let hits = index.search(&[0.0, 1.0], 1).unwrap();
    /// assert_eq!(hits[0].row, 1);
    /// ```
    pub fn new(dimension: usize, data: Vec<f32>) -> Result<Self> {
        if dimension == 0 || data.len() % dimension != 0 {
            return Err(Error::ArtifactMismatch(format!(
                "{} values do not form rows of dimension {dimension}",
                data.len()
            )));
        }
        Ok(Self { dimension, data })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Number of indexed vectors.
    pub fn len(&self) -> usize {
        self.data.len() / self.dimension
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn row(&self, i: usize) -> Option<&[f32]> {
        let start = i.checked_mul(self.dimension)?;
        self.data.get(start..start + self.dimension)
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// The `min(k, len)` rows with the highest inner product with `query`,
    /// by descending score; equal scores keep ascending row order.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Hit>> {
        if query.len() != self.dimension {
            return Err(Error::ArtifactMismatch(format!(
                "query has dimension {}, index has {}",
                query.len(),
                self.dimension
            )));
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        let mut hits: Vec<Hit> = self
            .data
            .par_chunks_exact(self.dimension)
            .enumerate()
            .map(|(row, vector)| Hit {
                row,
                score: dot(query, vector),
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.row.cmp(&b.row))
        });
        hits.truncate(k);
        Ok(hits)
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn ranks_by_inner_product() {
        let index = FlatIndex::new(
            2,
            vec![
                1.0, 0.0, //
                0.6, 0.8, //
                0.0, 1.0,
            ],
        )
        .unwrap();
        let hits = index.search(&[0.0, 1.0], 3).unwrap();
        let rows: Vec<usize> = hits.iter().map(|h| h.row).collect();
        assert_eq!(rows, vec![2, 1, 0]);
        assert!((hits[0].score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn ties_keep_row_order() {
        let index = FlatIndex::new(1, vec![0.5, 1.0, 0.5, 1.0]).unwrap();
        let rows: Vec<usize> = index
            .search(&[1.0], 4)
            .unwrap()
            .iter()
            .map(|h| h.row)
            .collect();
        assert_eq!(rows, vec![1, 3, 0, 2]);
    }

    #[test]
    fn zero_k_is_empty() {
        let index = FlatIndex::new(1, vec![1.0]).unwrap();
        assert!(index.search(&[1.0], 0).unwrap().is_empty());
    }

    #[test]
    fn wrong_query_dimension_is_rejected() {
        let index = FlatIndex::new(2, vec![1.0, 0.0]).unwrap();
        assert!(index.search(&[1.0], 1).is_err());
    }

    #[test]
    fn ragged_data_is_rejected() {
        assert!(FlatIndex::new(3, vec![1.0; 4]).is_err());
    }

    proptest! {
        #[test]
        fn returns_min_k_n_sorted(
            rows in proptest::collection::vec(
                proptest::collection::vec(-1.0f32..1.0, 4),
                1..20,
            ),
            query in proptest::collection::vec(-1.0f32..1.0, 4),
            k in 0usize..30,
        ) {
            let n = rows.len();
            let index = FlatIndex::new(4, rows.into_iter().flatten().collect()).unwrap();
            let hits = index.search(&query, k).unwrap();
            prop_assert_eq!(hits.len(), k.min(n));
            for pair in hits.windows(2) {
                prop_assert!(pair[0].score >= pair[1].score);
            }
        }
    }
}
