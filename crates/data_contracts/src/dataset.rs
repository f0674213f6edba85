use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::labels::{ImageRecord, ValidationError};

/// JSON list of labelled images for one split.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DatasetManifest {
    pub images: Vec<ImageRecord>,
}

impl DatasetManifest {
    pub fn validate(&self, nc: usize) -> Result<(), ValidationError> {
        if self.images.is_empty() {
            return Err(ValidationError::EmptyManifest);
        }
        for record in &self.images {
            record.validate(nc)?;
        }
        Ok(())
    }

    pub fn label_count(&self) -> usize {
        self.images.iter().map(|r| r.labels.len()).sum()
    }
}

/// Dataset descriptor (TOML): manifest paths for both splits and the class list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatasetDescriptor {
    pub train: PathBuf,
    pub val: PathBuf,
    pub nc: usize,
    #[serde(default)]
    pub names: Vec<String>,
}

impl DatasetDescriptor {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.nc == 0 {
            return Err(ValidationError::NoClasses);
        }
        if !self.names.is_empty() && self.names.len() != self.nc {
            return Err(ValidationError::NameCountMismatch {
                names: self.names.len(),
                nc: self.nc,
            });
        }
        Ok(())
    }

    /// Display name for a class id, falling back to the id itself.
    pub fn class_name(&self, class_id: usize) -> String {
        self.names
            .get(class_id)
            .cloned()
            .unwrap_or_else(|| class_id.to_string())
    }
}
