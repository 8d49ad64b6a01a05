use std::path::{Path, PathBuf};

use crate::{
    artifacts::ArtifactPaths,
    error::{Error, Result},
};

pub const DATA_DIR_ENV_VAR: &str = "SNIPSEEK_DATA_DIR";

/// Default home of the weights and index artifacts.
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// Resolve the data directory from, in order of priority:
    /// 1. An explicit path (from --data-dir)
    /// 2. The SNIPSEEK_DATA_DIR environment variable
    /// 3. The XDG data directory (~/.local/share/snipseek/)
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let root = if let Some(path) = explicit {
            path.to_path_buf()
        } else if let Ok(val) = std::env::var(DATA_DIR_ENV_VAR) {
            PathBuf::from(val)
        } else {
            xdg::BaseDirectories::with_prefix("snipseek")
                .get_data_home()
                .ok_or_else(|| {
                    Error::Config(
                        "could not determine XDG data home directory".into(),
                    )
                })?
        };

        std::fs::create_dir_all(&root)
            .map_err(|_| Error::DataDir(root.clone()))?;

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn weights(&self) -> PathBuf {
        self.root.join("encoder.safetensors")
    }

    pub fn training_pairs(&self) -> PathBuf {
        self.root.join("training_pairs.json")
    }

    pub fn index(&self) -> PathBuf {
        self.root.join("index.redb")
    }

    pub fn embeddings(&self) -> PathBuf {
        self.root.join("embeddings.bin")
    }

    pub fn metadata(&self) -> PathBuf {
        self.root.join("pages_meta.json")
    }

    /// Artifact paths, each overridable.
    pub fn artifacts(
        &self,
        index: Option<&Path>,
        embeddings: Option<&Path>,
        metadata: Option<&Path>,
    ) -> ArtifactPaths {
        ArtifactPaths {
            index: index.map_or_else(|| self.index(), Path::to_path_buf),
            embeddings: embeddings.map_or_else(|| self.embeddings(), Path::to_path_buf),
            metadata: metadata.map_or_else(|| self.metadata(), Path::to_path_buf),
        }
    }
}
