use std::path::Path;

use redb::{
    Database, ReadableDatabase, ReadableTable, ReadableTableMetadata,
    TableDefinition,
};

use crate::{
    error::{Error, Result},
    flat_index::FlatIndex,
};

/// Row number -> f32 LE vector bytes.
const VECTORS: TableDefinition<u64, &[u8]> = TableDefinition::new("vectors");

/// Scalar facts about the stored vectors.
const INFO: TableDefinition<&str, u64> = TableDefinition::new("info");

const INFO_DIMENSION: &str = "dimension";
const INFO_COUNT: &str = "count";
const INFO_BUILD_ID: &str = "build_id";

/// Header facts of a stored similarity index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexInfo {
    pub dimension: usize,
    pub count: usize,
    pub build_id: u64,
}

/// The persisted similarity index: one vector per page row.
///
/// Each row is stored as `dimension` little-endian f32 values, keyed by its
/// position in the embedding matrix.
pub struct IndexDb {
    db: Database,
}

impl IndexDb {
    /// Create a new database at `path`, replacing any existing file.
    pub fn create(path: &Path) -> Result<Self> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let db = Database::create(path)?;

        let txn = db.begin_write()?;
        txn.open_table(VECTORS)?;
        txn.open_table(INFO)?;
        txn.commit()?;

        Ok(Self { db })
    }

    /// Open an existing database.
    ///
    /// # Examples
    ///
    /// ```
    /// # let tmp = tempfile::tempdir().unwrap();
    /// use snipseek::{flat_index::FlatIndex, index_db::IndexDb};
    ///
    /// let path = tmp.path().join("index.redb");
    /// let vectors = FlatIndex::new(2, vec![1.0, 0.0]).unwrap();
    /// IndexDb::create(&path).unwrap().store(7, &vectors).unwrap();
    ///
    /// let (info, loaded) = IndexDb::open(&path).unwrap().load().unwrap();
    /// assert_eq!(info.build_id, 7);
    /// assert_eq!(loaded, vectors);
    /// ```
    pub fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::NotFound {
                kind: "similarity index",
                path: path.to_path_buf(),
            });
        }
        Ok(Self {
            db: Database::open(path)?,
        })
    }

    /// Store every vector and the index facts in a single transaction.
    ///
    /// Uses `insert_reserve` for zero-copy writes.
    pub fn store(&self, build_id: u64, vectors: &FlatIndex) -> Result<()> {
        let dimension = vectors.dimension();
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(VECTORS)?;
            table.retain(|_, _| false)?;
            for (row, vector) in vectors.as_slice().chunks_exact(dimension).enumerate()
            {
                let mut guard = table
                    .insert_reserve(row as u64, std::mem::size_of_val(vector))?;
                guard.as_mut().copy_from_slice(bytemuck::cast_slice(vector));
            }

            let mut info = txn.open_table(INFO)?;
            info.insert(INFO_DIMENSION, dimension as u64)?;
            info.insert(INFO_COUNT, vectors.len() as u64)?;
            info.insert(INFO_BUILD_ID, build_id)?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn info(&self) -> Result<IndexInfo> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(INFO)?;
        let get = |key: &'static str| -> Result<u64> {
            table
                .get(key)?
                .map(|v| v.value())
                .ok_or_else(|| Error::ArtifactMismatch(format!("index has no {key} entry")))
        };
        Ok(IndexInfo {
            dimension: get(INFO_DIMENSION)? as usize,
            count: get(INFO_COUNT)? as usize,
            build_id: get(INFO_BUILD_ID)?,
        })
    }

    /// Read back all vectors in row order.
    pub fn load(&self) -> Result<(IndexInfo, FlatIndex)> {
        let info = self.info()?;
        let txn = self.db.begin_read()?;
        let table = txn.open_table(VECTORS)?;

        let row_bytes = info.dimension * std::mem::size_of::<f32>();
        let mut data = Vec::with_capacity(info.count * info.dimension);
        for row in 0..info.count {
            let guard = table.get(row as u64)?.ok_or_else(|| {
                Error::ArtifactMismatch(format!("index is missing row {row}"))
            })?;
            let bytes = guard.value();
            if bytes.len() != row_bytes {
                return Err(Error::ArtifactMismatch(format!(
                    "index row {row} holds {} bytes, expected {row_bytes}",
                    bytes.len()
                )));
            }
            data.extend(
                bytes
                    .chunks_exact(4)
                    .map(bytemuck::pod_read_unaligned::<f32>),
            );
        }
        if table.len()? != info.count as u64 {
            return Err(Error::ArtifactMismatch(format!(
                "index holds {} rows, header says {}",
                table.len()?,
                info.count
            )));
        }

        Ok((info, FlatIndex::new(info.dimension, data)?))
    }
}

impl std::fmt::Debug for IndexDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexDb").finish_non_exhaustive()
    }
}
