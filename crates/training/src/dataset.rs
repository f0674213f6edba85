//! Detection samples from a JSON manifest, decoded in parallel by a producer
//! thread that stays a couple of batches ahead of the training step.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

use burn::tensor::{backend::Backend, Tensor, TensorData};
use crossbeam_channel::{bounded, Receiver};
use data_contracts::{DatasetDescriptor, DatasetManifest};
use image::imageops::FilterType;
use image::RgbImage;
use models::{DetectionTargets, TargetBox};
use rand::{seq::SliceRandom, SeedableRng};
use rayon::prelude::*;

use crate::{TrainError, TrainResult};

/// Reads a TOML dataset descriptor; `train` and `val` resolve against its directory.
pub fn load_descriptor(path: &Path) -> TrainResult<DatasetDescriptor> {
    let raw = std::fs::read_to_string(path).map_err(|e| TrainError::io(path, e))?;
    let mut descriptor: DatasetDescriptor = toml::from_str(&raw).map_err(|source| TrainError::Toml {
        path: path.to_path_buf(),
        source,
    })?;
    descriptor
        .validate()
        .map_err(|source| TrainError::Validation {
            path: path.to_path_buf(),
            source,
        })?;
    let root = path.parent().unwrap_or_else(|| Path::new("."));
    descriptor.train = root.join(&descriptor.train);
    descriptor.val = root.join(&descriptor.val);
    Ok(descriptor)
}

#[derive(Debug, Clone)]
pub enum ImageSource {
    File(PathBuf),
    Memory(Arc<RgbImage>),
}

#[derive(Debug, Clone)]
pub struct Sample {
    pub name: String,
    pub source: ImageSource,
    pub labels: Vec<TargetBox>,
}

impl Sample {
    pub fn in_memory(name: impl Into<String>, image: RgbImage, labels: Vec<TargetBox>) -> Self {
        Self {
            name: name.into(),
            source: ImageSource::Memory(Arc::new(image)),
            labels,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DetectionDataset {
    samples: Vec<Sample>,
    imgsz: usize,
}

impl DetectionDataset {
    pub fn from_samples(samples: Vec<Sample>, imgsz: usize) -> Self {
        Self { samples, imgsz }
    }

    /// Reads and validates a manifest; image paths resolve against its directory.
    pub fn from_manifest(path: &Path, nc: usize, imgsz: usize) -> TrainResult<Self> {
        let raw = std::fs::read(path).map_err(|e| TrainError::io(path, e))?;
        let manifest: DatasetManifest =
            serde_json::from_slice(&raw).map_err(|source| TrainError::Json {
                path: path.to_path_buf(),
                source,
            })?;
        manifest
            .validate(nc)
            .map_err(|source| TrainError::Validation {
                path: path.to_path_buf(),
                source,
            })?;
        let root = path.parent().unwrap_or_else(|| Path::new("."));
        let samples = manifest
            .images
            .into_iter()
            .map(|record| Sample {
                source: ImageSource::File(root.join(&record.image)),
                labels: record
                    .labels
                    .iter()
                    .map(|l| TargetBox {
                        bbox: l.bbox_norm,
                        class_id: l.class_id,
                    })
                    .collect(),
                name: record.image,
            })
            .collect::<Vec<_>>();
        log::info!(
            "loaded {} images ({} labels) from {}",
            samples.len(),
            samples.iter().map(|s| s.labels.len()).sum::<usize>(),
            path.display()
        );
        Ok(Self::from_samples(samples, imgsz))
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn imgsz(&self) -> usize {
        self.imgsz
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// CHW floats in [0, 1], force-resized to `imgsz x imgsz`.
    fn decode(&self, index: usize) -> TrainResult<Vec<f32>> {
        let sample = &self.samples[index];
        let rgb = match &sample.source {
            ImageSource::File(path) => image::open(path)
                .map_err(|source| TrainError::Image {
                    path: path.clone(),
                    source,
                })?
                .to_rgb8(),
            ImageSource::Memory(img) => img.as_ref().clone(),
        };
        let size = self.imgsz as u32;
        let rgb = if rgb.dimensions() == (size, size) {
            rgb
        } else {
            image::imageops::resize(&rgb, size, size, FilterType::Triangle)
        };
        let plane = self.imgsz * self.imgsz;
        let mut chw = vec![0.0f32; 3 * plane];
        for (i, px) in rgb.pixels().enumerate() {
            chw[i] = px[0] as f32 / 255.0;
            chw[plane + i] = px[1] as f32 / 255.0;
            chw[2 * plane + i] = px[2] as f32 / 255.0;
        }
        Ok(chw)
    }
}

/// A decoded batch still on the host.
#[derive(Debug, Clone)]
pub struct HostBatch {
    pub pixels: Vec<f32>,
    pub imgsz: usize,
    pub targets: Vec<Vec<TargetBox>>,
    pub names: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct DetectionBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets: DetectionTargets<B>,
    pub names: Vec<String>,
}

impl HostBatch {
    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn to_device<B: Backend>(self, max_boxes: usize, device: &B::Device) -> DetectionBatch<B> {
        let n = self.names.len();
        let images = Tensor::from_data(
            TensorData::new(self.pixels, [n, 3, self.imgsz, self.imgsz]),
            device,
        );
        DetectionBatch {
            images,
            targets: DetectionTargets::from_host(&self.targets, max_boxes, device),
            names: self.names,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub batch_size: usize,
    pub shuffle: bool,
    pub seed: u64,
    pub rank: usize,
    pub world_size: usize,
    /// Batches decoded ahead of the consumer.
    pub prefetch: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 16,
            shuffle: true,
            seed: 0,
            rank: 0,
            world_size: 1,
            prefetch: 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DataLoader {
    dataset: Arc<DetectionDataset>,
    cfg: LoaderConfig,
}

impl DataLoader {
    pub fn new(dataset: Arc<DetectionDataset>, cfg: LoaderConfig) -> Self {
        Self { dataset, cfg }
    }

    pub fn dataset(&self) -> &DetectionDataset {
        &self.dataset
    }

    /// Indices this rank sees in `epoch`, in order.
    pub fn epoch_indices(&self, epoch: usize) -> Vec<usize> {
        let mut indices: Vec<usize> = (0..self.dataset.len()).collect();
        if self.cfg.shuffle {
            let mut rng = rand::rngs::StdRng::seed_from_u64(self.cfg.seed.wrapping_add(epoch as u64));
            indices.shuffle(&mut rng);
        }
        indices
            .into_iter()
            .skip(self.cfg.rank)
            .step_by(self.cfg.world_size.max(1))
            .collect()
    }

    pub fn num_batches(&self) -> usize {
        let per_rank = self.epoch_indices(0).len();
        per_rank.div_ceil(self.cfg.batch_size.max(1))
    }

    /// Starts the producer for one epoch.
    pub fn epoch(&self, epoch: usize) -> EpochBatches {
        let (tx, rx) = bounded(self.cfg.prefetch.max(1));
        let dataset = self.dataset.clone();
        let batch_size = self.cfg.batch_size.max(1);
        let indices = self.epoch_indices(epoch);
        let handle = std::thread::spawn(move || {
            for chunk in indices.chunks(batch_size) {
                let batch = decode_batch(&dataset, chunk);
                let failed = batch.is_err();
                if tx.send(batch).is_err() || failed {
                    break;
                }
            }
        });
        EpochBatches {
            rx: Some(rx),
            handle: Some(handle),
        }
    }
}

fn decode_batch(dataset: &DetectionDataset, chunk: &[usize]) -> TrainResult<HostBatch> {
    let decoded: Vec<TrainResult<Vec<f32>>> = chunk.par_iter().map(|&i| dataset.decode(i)).collect();
    let imgsz = dataset.imgsz();
    let mut pixels = Vec::with_capacity(chunk.len() * 3 * imgsz * imgsz);
    for image in decoded {
        pixels.extend_from_slice(&image?);
    }
    let samples = dataset.samples();
    Ok(HostBatch {
        pixels,
        imgsz,
        targets: chunk.iter().map(|&i| samples[i].labels.clone()).collect(),
        names: chunk.iter().map(|&i| samples[i].name.clone()).collect(),
    })
}

pub struct EpochBatches {
    rx: Option<Receiver<TrainResult<HostBatch>>>,
    handle: Option<JoinHandle<()>>,
}

impl Iterator for EpochBatches {
    type Item = TrainResult<HostBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rx.as_ref()?.recv().ok()
    }
}

impl Drop for EpochBatches {
    fn drop(&mut self) {
        // closing the channel unblocks a producer waiting on a full buffer
        self.rx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::warn!("data loader thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    fn synthetic(n: usize, size: u32) -> DetectionDataset {
        let samples = (0..n)
            .map(|i| {
                let img = RgbImage::from_fn(size, size, |x, y| {
                    image::Rgb([(x * 4) as u8, (y * 4) as u8, (i * 10) as u8])
                });
                Sample::in_memory(
                    format!("img{i}"),
                    img,
                    vec![TargetBox {
                        bbox: [0.25, 0.25, 0.75, 0.75],
                        class_id: 0,
                    }],
                )
            })
            .collect();
        DetectionDataset::from_samples(samples, 32)
    }

    #[test]
    fn batches_cover_the_dataset_once() {
        let loader = DataLoader::new(
            Arc::new(synthetic(5, 48)),
            LoaderConfig {
                batch_size: 2,
                ..Default::default()
            },
        );
        assert_eq!(loader.num_batches(), 3);
        let batches: Vec<HostBatch> = loader.epoch(0).map(|b| b.unwrap()).collect();
        assert_eq!(batches.iter().map(|b| b.len()).collect::<Vec<_>>(), vec![2, 2, 1]);
        let mut names: Vec<String> = batches.iter().flat_map(|b| b.names.clone()).collect();
        names.sort();
        assert_eq!(names, vec!["img0", "img1", "img2", "img3", "img4"]);
        assert_eq!(batches[0].pixels.len(), 2 * 3 * 32 * 32);
    }

    #[test]
    fn shuffle_is_seeded_and_ranks_are_disjoint() {
        let ds = Arc::new(synthetic(10, 8));
        let cfg = |rank| LoaderConfig {
            batch_size: 4,
            seed: 7,
            rank,
            world_size: 2,
            ..Default::default()
        };
        let a = DataLoader::new(ds.clone(), cfg(0));
        let b = DataLoader::new(ds, cfg(1));
        assert_eq!(a.epoch_indices(3), a.epoch_indices(3));
        let mut all = a.epoch_indices(1);
        all.extend(b.epoch_indices(1));
        all.sort();
        assert_eq!(all, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn dropping_an_epoch_early_releases_the_producer() {
        let loader = DataLoader::new(
            Arc::new(synthetic(12, 16)),
            LoaderConfig {
                batch_size: 1,
                shuffle: false,
                prefetch: 1,
                ..Default::default()
            },
        );
        let mut epoch = loader.epoch(0);
        let first = epoch.next().unwrap().unwrap();
        assert_eq!(first.names, vec!["img0"]);
        // producer is blocked on the bounded channel; drop must not hang
        drop(epoch);
        assert_eq!(loader.epoch(1).count(), 12);
    }

    #[test]
    fn host_batch_moves_to_device() {
        let loader = DataLoader::new(
            Arc::new(synthetic(2, 32)),
            LoaderConfig {
                batch_size: 2,
                shuffle: false,
                ..Default::default()
            },
        );
        let host = loader.epoch(0).next().unwrap().unwrap();
        let batch = host.to_device::<NdArray<f32>>(4, &Default::default());
        assert_eq!(batch.images.dims(), [2, 3, 32, 32]);
        assert_eq!(batch.targets.boxes.dims(), [2, 4, 4]);
        let max = batch.images.max().into_scalar();
        assert!(max <= 1.0);
    }

    #[test]
    fn descriptor_paths_resolve_next_to_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.toml");
        std::fs::write(&path, "train = \"train.json\"\nval = \"val.json\"\nnc = 2\nnames = [\"a\", \"b\"]\n").unwrap();
        let d = load_descriptor(&path).unwrap();
        assert_eq!(d.train, dir.path().join("train.json"));
        assert_eq!(d.nc, 2);

        std::fs::write(&path, "train = \"t.json\"\nval = \"v.json\"\nnc = 0\n").unwrap();
        assert!(matches!(load_descriptor(&path), Err(TrainError::Validation { .. })));
    }

    #[test]
    fn manifest_with_bad_class_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.json");
        std::fs::write(
            &path,
            r#"{"images":[{"image":"a.png","labels":[{"class_id":2,"bbox_norm":[0.1,0.1,0.2,0.2]}]}]}"#,
        )
        .unwrap();
        let err = DetectionDataset::from_manifest(&path, 2, 64).unwrap_err();
        assert!(matches!(err, TrainError::Validation { .. }));
    }
}
