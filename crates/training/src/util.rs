use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use burn::backend::Autodiff;
use burn::module::AutodiffModule;
use burn::optim::AdamConfig;
use burn::tensor::backend::Backend;
use clap::Parser;
use data_contracts::DatasetDescriptor;
use indicatif::{ProgressBar, ProgressStyle};
use models::{
    BitEstimator, BitEstimatorConfig, ControlKind, ControlModule, DetectionModel, DownscaleNet,
    FeatureExtractor, GridDetector, GridDetectorConfig, LuminanceBlurNet,
};
use serde::Serialize;
use transforms::CodecSurrogate;

use crate::checkpoint::{
    checkpoint_dir, epoch_marker, load_module, strip_optimizer, CheckpointState, CONTROL_EMA,
    DETECTOR_EMA, STATE_FILE,
};
use crate::collective::{
    Collective, LocalGroup, LocalHub, SingleProcess, DEFAULT_HANDSHAKE_TIMEOUT,
};
use crate::dataset::{load_descriptor, DataLoader, DetectionDataset, LoaderConfig};
use crate::state::TrainingState;
use crate::step::{train_step, LossItems, RunningMeans, StepContext, StepSettings};
use crate::validate::{validate, ValidationReport, ValidationSettings};
use crate::{TrainBackend, TrainConfig};

type ADBackend = Autodiff<TrainBackend>;

#[derive(Parser, Debug)]
#[command(
    name = "train",
    about = "Jointly train a detector and an image control network against a bit-rate estimate"
)]
pub struct TrainArgs {
    /// TOML run config (falls back to $JOINT_TRAIN_CONFIG, then defaults).
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Dataset descriptor (TOML with train/val manifests, nc, names).
    #[arg(long)]
    pub data: Option<PathBuf>,
    /// Number of epochs.
    #[arg(long)]
    pub epochs: Option<usize>,
    /// Batch size.
    #[arg(long)]
    pub batch_size: Option<usize>,
    /// Square training image size (multiple of 8 unless padding is on).
    #[arg(long)]
    pub imgsz: Option<usize>,
    /// Control network: `downscale` or `luminance_blur`.
    #[arg(long)]
    pub variant: Option<ControlKind>,
    /// Output directory for checkpoints and results.jsonl.
    #[arg(long)]
    pub run_dir: Option<PathBuf>,
    /// Pretrained bit estimator record.
    #[arg(long)]
    pub bit_estimator: Option<PathBuf>,
    /// RNG seed for initialisation and shuffling.
    #[arg(long)]
    pub seed: Option<u64>,
    /// Number of local replicas.
    #[arg(long)]
    pub world_size: Option<usize>,
    /// Resume from `<run_dir>/weights/last`.
    #[arg(long)]
    pub resume: bool,
    /// Resume from a specific checkpoint directory.
    #[arg(long)]
    pub resume_from: Option<PathBuf>,
    /// Hide the progress bar.
    #[arg(long)]
    pub no_progress: bool,
}

impl TrainArgs {
    /// CLI flags win over file values.
    pub fn apply(&self, cfg: &mut TrainConfig) {
        if let Some(v) = &self.data {
            cfg.data = v.clone();
        }
        if let Some(v) = self.epochs {
            cfg.epochs = v;
        }
        if let Some(v) = self.batch_size {
            cfg.batch_size = v;
        }
        if let Some(v) = self.imgsz {
            cfg.imgsz = v;
        }
        if let Some(v) = self.variant {
            cfg.variant = v;
        }
        if let Some(v) = &self.run_dir {
            cfg.run_dir = v.clone();
        }
        if let Some(v) = &self.bit_estimator {
            cfg.bit_estimator = v.clone();
        }
        if let Some(v) = self.seed {
            cfg.seed = v;
        }
        if let Some(v) = self.world_size {
            cfg.world_size = v;
        }
        if self.no_progress {
            cfg.show_progress = false;
        }
    }

    fn resume_dir(&self, cfg: &TrainConfig) -> Option<PathBuf> {
        self.resume_from
            .clone()
            .or_else(|| self.resume.then(|| checkpoint_dir(&cfg.run_dir, "last")))
    }
}

/// How a finished (or stopped) run went.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub epochs_run: usize,
    pub best_fitness: f64,
    pub best_epoch: usize,
    pub stopped_early: bool,
}

pub fn run_train(args: TrainArgs) -> anyhow::Result<()> {
    let mut cfg = TrainConfig::load(args.config.as_deref()).context("loading run config")?;
    args.apply(&mut cfg);
    cfg.validate().context("invalid run config")?;
    let descriptor = load_descriptor(&cfg.data)
        .with_context(|| format!("loading dataset descriptor {}", cfg.data.display()))?;
    let resume = args.resume_dir(&cfg);
    if let Some(dir) = &resume {
        if !dir.join(STATE_FILE).is_file() {
            anyhow::bail!("nothing to resume at {}", dir.display());
        }
    }
    std::fs::create_dir_all(&cfg.run_dir)
        .with_context(|| format!("creating run dir {}", cfg.run_dir.display()))?;

    if cfg.workers > 0 {
        if let Err(e) = rayon::ThreadPoolBuilder::new()
            .num_threads(cfg.workers)
            .build_global()
        {
            log::debug!("rayon pool already configured: {e}");
        }
    }

    let summary = if cfg.world_size > 1 {
        run_replicas(&cfg, &descriptor, resume.as_deref())?
    } else {
        train_replica(&cfg, &descriptor, resume.as_deref(), &SingleProcess)?
    };
    log::info!(
        "{} epochs complete; best fitness {:.5} at epoch {}{}",
        summary.epochs_run,
        summary.best_fitness,
        summary.best_epoch,
        if summary.stopped_early { " (stopped early)" } else { "" }
    );
    println!(
        "Results saved to {}",
        checkpoint_dir(&cfg.run_dir, "best").display()
    );
    Ok(())
}

/// One thread per rank over a [`LocalHub`]; rank 0's summary is returned.
fn run_replicas(
    cfg: &TrainConfig,
    descriptor: &DatasetDescriptor,
    resume: Option<&Path>,
) -> anyhow::Result<RunSummary> {
    let hub = LocalHub::new(cfg.world_size);
    let handles: Vec<_> = (0..cfg.world_size)
        .map(|rank| {
            let hub = Arc::clone(&hub);
            let cfg = cfg.clone();
            let descriptor = descriptor.clone();
            let resume = resume.map(Path::to_path_buf);
            std::thread::spawn(move || -> anyhow::Result<RunSummary> {
                let group = LocalGroup::join(hub, rank, DEFAULT_HANDSHAKE_TIMEOUT)?;
                train_replica(&cfg, &descriptor, resume.as_deref(), &group)
            })
        })
        .collect();
    let mut main = None;
    for (rank, handle) in handles.into_iter().enumerate() {
        let summary = handle
            .join()
            .map_err(|_| anyhow::anyhow!("replica {rank} panicked"))??;
        if rank == 0 {
            main = Some(summary);
        }
    }
    main.context("no replica ran")
}

/// Builds the networks for the configured variant and trains them. A failing
/// replica aborts the group so its peers return an error instead of waiting.
pub fn train_replica(
    cfg: &TrainConfig,
    descriptor: &DatasetDescriptor,
    resume: Option<&Path>,
    collective: &dyn Collective,
) -> anyhow::Result<RunSummary> {
    let result = build_and_train(cfg, descriptor, resume, collective);
    if let Err(e) = &result {
        collective.abort(&format!("{e:#}"));
    }
    result
}

fn build_and_train(
    cfg: &TrainConfig,
    descriptor: &DatasetDescriptor,
    resume: Option<&Path>,
    collective: &dyn Collective,
) -> anyhow::Result<RunSummary> {
    let device = <ADBackend as Backend>::Device::default();
    <ADBackend as Backend>::seed(cfg.seed);

    let detector = GridDetector::<ADBackend>::new(
        GridDetectorConfig {
            num_classes: descriptor.nc,
            ..cfg.detector.clone()
        },
        &device,
    )?;
    let extractor = match &cfg.backbone_weights {
        Some(path) => Some(
            FeatureExtractor::new(&cfg.control.backbone, &device)
                .with_pretrained(path, &device)
                .with_context(|| format!("loading backbone weights {}", path.display()))?,
        ),
        None => None,
    };

    match cfg.variant {
        ControlKind::Downscale => {
            let mut control = DownscaleNet::<ADBackend>::new(&cfg.control, &device)?;
            if let Some(extractor) = extractor {
                control = control.with_extractor(extractor);
            }
            train_with(cfg, descriptor, detector, control, resume, collective, &device)
        }
        ControlKind::LuminanceBlur => {
            let mut control = LuminanceBlurNet::<ADBackend>::new(&cfg.control, &device)?;
            if let Some(extractor) = extractor {
                control = control.with_extractor(extractor);
            }
            train_with(cfg, descriptor, detector, control, resume, collective, &device)
        }
    }
}

#[derive(Serialize)]
struct EpochRecord<'a> {
    epoch: usize,
    train: LossItems,
    val: &'a ValidationReport,
    fitness: f64,
    detector_lr: f64,
    control_lr: f64,
    timestamp: String,
}

fn append_results(path: &Path, record: &EpochRecord<'_>) -> anyhow::Result<()> {
    let line = serde_json::to_string(record)?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening {}", path.display()))?;
    writeln!(file, "{line}").with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

fn progress_bar(len: usize, visible: bool, epoch: usize, epochs: usize) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(len as u64);
    let style = ProgressStyle::default_bar()
        .template(&format!(
            "  Epoch {}/{} [{{bar:30.cyan/blue}}] {{pos}}/{{len}} {{msg}}",
            epoch + 1,
            epochs
        ))
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-");
    pb.set_style(style);
    pb
}

fn train_with<D, C>(
    cfg: &TrainConfig,
    descriptor: &DatasetDescriptor,
    detector: D,
    control: C,
    resume: Option<&Path>,
    collective: &dyn Collective,
    device: &<ADBackend as Backend>::Device,
) -> anyhow::Result<RunSummary>
where
    D: DetectionModel<ADBackend> + AutodiffModule<ADBackend>,
    D::InnerModule: DetectionModel<TrainBackend>,
    C: ControlModule<ADBackend> + AutodiffModule<ADBackend>,
    C::InnerModule: ControlModule<TrainBackend>,
{
    let is_main = collective.is_main();
    let estimator =
        BitEstimator::<ADBackend>::load(BitEstimatorConfig::default(), &cfg.bit_estimator, device)
            .with_context(|| format!("loading bit estimator {}", cfg.bit_estimator.display()))?;
    let estimator_eval = estimator.valid();
    let codec =
        CodecSurrogate::<ADBackend>::new(cfg.quality, device)?.with_padding(cfg.pad_to_block);
    let codec_eval =
        CodecSurrogate::<TrainBackend>::new(cfg.quality, device)?.with_padding(cfg.pad_to_block);

    let train_set = DetectionDataset::from_manifest(&descriptor.train, descriptor.nc, cfg.imgsz)?;
    let val_set = DetectionDataset::from_manifest(&descriptor.val, descriptor.nc, cfg.imgsz)?;
    if train_set.is_empty() {
        anyhow::bail!("training manifest {} has no images", descriptor.train.display());
    }
    let loader = DataLoader::new(
        Arc::new(train_set),
        LoaderConfig {
            batch_size: cfg.batch_size,
            shuffle: true,
            seed: cfg.seed,
            rank: collective.rank(),
            world_size: collective.world_size(),
            ..Default::default()
        },
    );
    let val_loader = DataLoader::new(
        Arc::new(val_set),
        LoaderConfig {
            batch_size: cfg.batch_size * 2,
            shuffle: false,
            ..Default::default()
        },
    );

    let mut state = TrainingState::new(detector, control, AdamConfig::new().init(), cfg);
    let mut end_epoch = cfg.epochs;
    if let Some(dir) = resume {
        let (restored, _) = state.resume(dir, cfg, device)?;
        state = restored;
        if cfg.epochs < state.epoch {
            log::info!(
                "checkpoint already trained {} epochs; fine-tuning {} more",
                state.epoch,
                cfg.epochs
            );
            end_epoch = state.epoch + cfg.epochs;
        }
    }

    if state.scaler.is_enabled() {
        log::info!("gradient scaling on (initial scale {})", state.scaler.scale());
    }

    let nb = loader.num_batches();
    let ctx = StepContext {
        estimator: &estimator,
        codec: &codec,
        settings: StepSettings::from_config(cfg, nb, is_main),
    };
    let val_settings = ValidationSettings::from_config(cfg);
    let results = cfg.run_dir.join("results.jsonl");
    log::info!(
        "training {} ({} images, {} batches/epoch, accumulate {}) on rank {}/{}",
        cfg.variant,
        loader.dataset().len(),
        nb,
        cfg.accumulate(),
        collective.rank(),
        collective.world_size()
    );

    let mut epochs_run = 0;
    let mut stopped_early = false;
    for epoch in state.epoch..end_epoch {
        state.epoch = epoch;
        epochs_run += 1;
        let pb = progress_bar(nb, cfg.show_progress && is_main, epoch, end_epoch);
        let mut means = RunningMeans::default();
        for (i, host) in loader.epoch(epoch).enumerate() {
            let batch = host?.to_device::<ADBackend>(cfg.max_boxes, device);
            let outcome = train_step(&mut state, &ctx, batch, i + nb * epoch)?;
            if !outcome.skipped {
                means.push(&outcome.items);
            }
            let m = means.means();
            pb.set_message(format!(
                "box {:.4} obj {:.4} cls {:.4} total {:.4} bpp {:.4}",
                m.box_loss, m.obj_loss, m.cls_loss, m.total, m.bpp
            ));
            pb.inc(1);
        }
        pb.finish_and_clear();
        let detector_lr = state.detector_schedule.lr();
        let control_lr = state.control_schedule.lr();
        state.end_epoch();

        let mut stop = false;
        if is_main {
            let report = validate(
                state.detector_ema.module(),
                state.control_ema.module(),
                &estimator_eval,
                &codec_eval,
                &val_loader,
                &val_settings,
                device,
            )?;
            let fitness = report.fitness();
            if fitness > state.best_fitness {
                state.best_fitness = fitness;
            }
            stop = state.early_stop.step(epoch, fitness);
            append_results(
                &results,
                &EpochRecord {
                    epoch,
                    train: means.means(),
                    val: &report,
                    fitness,
                    detector_lr,
                    control_lr,
                    timestamp: crate::checkpoint::timestamp(),
                },
            )?;

            state.save(&checkpoint_dir(&cfg.run_dir, "last"), cfg, false)?;
            if fitness == state.best_fitness {
                state.save(&checkpoint_dir(&cfg.run_dir, "best"), cfg, false)?;
            }
            if cfg.save_period > 0 && (epoch + 1) % cfg.save_period == 0 {
                state.save(&checkpoint_dir(&cfg.run_dir, &epoch_marker(epoch)), cfg, false)?;
            }
        }
        if collective.broadcast_stop(stop)? {
            stopped_early = epoch + 1 < end_epoch;
            break;
        }
    }

    if is_main {
        for marker in ["last", "best"] {
            let dir = checkpoint_dir(&cfg.run_dir, marker);
            if dir.join(STATE_FILE).is_file() {
                let mut finished = CheckpointState::read(&dir)?;
                finished.finished = true;
                finished.write(&dir)?;
                strip_optimizer(&dir)?;
            }
        }
    }

    Ok(RunSummary {
        epochs_run,
        best_fitness: state.best_fitness,
        best_epoch: state.early_stop.best_epoch(),
        stopped_early,
    })
}

/// Validates the EMA networks stored in a checkpoint directory against the
/// validation manifest of `data` (or the one recorded in the checkpoint).
pub fn evaluate_checkpoint(
    dir: &Path,
    data: Option<&Path>,
    bit_estimator: Option<&Path>,
) -> anyhow::Result<ValidationReport> {
    let state = CheckpointState::read(dir)
        .with_context(|| format!("reading checkpoint {}", dir.display()))?;
    let mut cfg = state.config;
    if let Some(path) = data {
        cfg.data = path.to_path_buf();
    }
    if let Some(path) = bit_estimator {
        cfg.bit_estimator = path.to_path_buf();
    }
    let descriptor = load_descriptor(&cfg.data)
        .with_context(|| format!("loading dataset descriptor {}", cfg.data.display()))?;
    let device = <TrainBackend as Backend>::Device::default();
    let precision = cfg.checkpoint_precision;

    let detector = GridDetector::<TrainBackend>::new(
        GridDetectorConfig {
            num_classes: descriptor.nc,
            ..cfg.detector.clone()
        },
        &device,
    )?;
    let detector = load_module(detector, &dir.join(DETECTOR_EMA), precision, &device)?;
    match cfg.variant {
        ControlKind::Downscale => {
            let control = DownscaleNet::<TrainBackend>::new(&cfg.control, &device)?;
            let control = load_module(control, &dir.join(CONTROL_EMA), precision, &device)?;
            evaluate_with(&cfg, &descriptor, &detector, &control, &device)
        }
        ControlKind::LuminanceBlur => {
            let control = LuminanceBlurNet::<TrainBackend>::new(&cfg.control, &device)?;
            let control = load_module(control, &dir.join(CONTROL_EMA), precision, &device)?;
            evaluate_with(&cfg, &descriptor, &detector, &control, &device)
        }
    }
}

fn evaluate_with<D, C>(
    cfg: &TrainConfig,
    descriptor: &DatasetDescriptor,
    detector: &D,
    control: &C,
    device: &<TrainBackend as Backend>::Device,
) -> anyhow::Result<ValidationReport>
where
    D: DetectionModel<TrainBackend>,
    C: ControlModule<TrainBackend>,
{
    let estimator =
        BitEstimator::<TrainBackend>::load(BitEstimatorConfig::default(), &cfg.bit_estimator, device)
            .with_context(|| format!("loading bit estimator {}", cfg.bit_estimator.display()))?;
    let codec =
        CodecSurrogate::<TrainBackend>::new(cfg.quality, device)?.with_padding(cfg.pad_to_block);
    let val_set = DetectionDataset::from_manifest(&descriptor.val, descriptor.nc, cfg.imgsz)?;
    let loader = DataLoader::new(
        Arc::new(val_set),
        LoaderConfig {
            batch_size: cfg.batch_size * 2,
            shuffle: false,
            ..Default::default()
        },
    );
    let report = validate(
        detector,
        control,
        &estimator,
        &codec,
        &loader,
        &ValidationSettings::from_config(cfg),
        device,
    )?;
    Ok(report)
}
