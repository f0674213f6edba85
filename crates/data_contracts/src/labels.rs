use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One ground-truth box in normalized `x0, y0, x1, y1` image coordinates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BoxLabel {
    pub class_id: usize,
    pub bbox_norm: [f32; 4],
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageRecord {
    /// Image path, relative to the manifest's directory unless absolute.
    pub image: String,
    #[serde(default)]
    pub labels: Vec<BoxLabel>,
}

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("bbox_norm out of range or inverted: {0:?}")]
    InvalidBboxNorm([f32; 4]),
    #[error("label class {class_id} exceeds nc={nc} in {image}")]
    ClassOutOfRange {
        image: String,
        class_id: usize,
        nc: usize,
    },
    #[error("missing image path")]
    MissingImage,
    #[error("dataset needs at least one class")]
    NoClasses,
    #[error("{names} class names given for nc={nc}")]
    NameCountMismatch { names: usize, nc: usize },
    #[error("manifest has no images")]
    EmptyManifest,
}

impl BoxLabel {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let norm = self.bbox_norm;
        let in_range = norm.iter().all(|v| !v.is_nan() && *v >= 0.0 && *v <= 1.0);
        if !in_range || norm[0] > norm[2] || norm[1] > norm[3] {
            return Err(ValidationError::InvalidBboxNorm(norm));
        }
        Ok(())
    }
}

impl ImageRecord {
    /// Checks the path and every label; classes must be below `nc`.
    pub fn validate(&self, nc: usize) -> Result<(), ValidationError> {
        if self.image.trim().is_empty() {
            return Err(ValidationError::MissingImage);
        }
        for label in &self.labels {
            label.validate()?;
            if label.class_id >= nc {
                return Err(ValidationError::ClassOutOfRange {
                    image: self.image.clone(),
                    class_id: label.class_id,
                    nc,
                });
            }
        }
        Ok(())
    }
}
