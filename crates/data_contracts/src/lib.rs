//! Shared data contracts for detection datasets: box labels, image manifests and
//! the dataset descriptor a training run points at.

pub mod dataset;
pub mod labels;

pub use dataset::{DatasetDescriptor, DatasetManifest};
pub use labels::{BoxLabel, ImageRecord, ValidationError};
