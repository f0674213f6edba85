//! Weight files on disk: burn's binary recorder at full precision.

use std::path::{Path, PathBuf};

use burn::module::Module;
use burn::record::{BinFileRecorder, FullPrecisionSettings};
use burn::tensor::backend::Backend;

use crate::{ModelError, ModelResult};

pub type WeightRecorder = BinFileRecorder<FullPrecisionSettings>;

/// Path the recorder actually writes for `path` (it owns the extension).
pub fn weights_file(path: &Path) -> PathBuf {
    path.with_extension("bin")
}

pub fn save_weights<B: Backend, M: Module<B>>(module: M, path: &Path) -> ModelResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| ModelError::SaveWeights {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        }
    }
    module
        .save_file(path.to_path_buf(), &WeightRecorder::new())
        .map_err(|e| ModelError::SaveWeights {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

/// Loads `path` into `module`; a missing file is reported as [`ModelError::MissingArtifact`].
pub fn load_weights<B: Backend, M: Module<B>>(
    module: M,
    path: &Path,
    device: &B::Device,
) -> ModelResult<M> {
    let file = weights_file(path);
    if !file.is_file() {
        return Err(ModelError::MissingArtifact { path: file });
    }
    module
        .load_file(path.to_path_buf(), &WeightRecorder::new(), device)
        .map_err(|e| ModelError::LoadWeights {
            path: file,
            message: e.to_string(),
        })
}
