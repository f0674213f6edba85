mod common;

use burn::optim::{AdamConfig, Optimizer};
use burn::tensor::backend::Backend;
use common::{frozen_estimator, small_config, synthetic_batch, values, AD};
use models::{GridDetector, LuminanceBlurNet};
use training::checkpoint::{record_file, CONTROL, CONTROL_OPTIM, DETECTOR_OPTIM};
use training::{
    strip_optimizer, train_step, CheckpointState, StepContext, StepSettings, TrainConfig,
    TrainError, TrainingState,
};
use transforms::CodecSurrogate;

fn fresh_state(
    cfg: &TrainConfig,
) -> TrainingState<AD, GridDetector<AD>, LuminanceBlurNet<AD>, impl Optimizer<LuminanceBlurNet<AD>, AD>> {
    let device = <AD as Backend>::Device::default();
    let detector = GridDetector::<AD>::new(cfg.detector.clone(), &device).unwrap();
    let control = LuminanceBlurNet::<AD>::new(&cfg.control, &device).unwrap();
    TrainingState::new(detector, control, AdamConfig::new().init(), cfg)
}

fn bits(values: Vec<(burn::module::ParamId, bool, Vec<f32>)>) -> Vec<Vec<u32>> {
    values
        .into_iter()
        .map(|(_, _, v)| v.into_iter().map(f32::to_bits).collect())
        .collect()
}

fn trained_state(cfg: &TrainConfig) -> TrainingState<AD, GridDetector<AD>, LuminanceBlurNet<AD>, impl Optimizer<LuminanceBlurNet<AD>, AD>> {
    let device = <AD as Backend>::Device::default();
    let estimator = frozen_estimator(&device);
    let codec = CodecSurrogate::<AD>::new(cfg.quality, &device).unwrap();
    let mut state = fresh_state(cfg);
    let ctx = StepContext {
        estimator: &estimator,
        codec: &codec,
        settings: StepSettings::from_config(cfg, 2, true),
    };
    for ni in 0..2 {
        let outcome = train_step(&mut state, &ctx, synthetic_batch(&device), ni).unwrap();
        assert!(outcome.stepped);
    }
    state.best_fitness = 0.25;
    state
}

#[test]
fn full_precision_round_trip_is_bit_identical() {
    let dir = tempfile::tempdir().unwrap();
    let ckpt = dir.path().join("weights").join("last");
    let cfg = small_config();
    let device = <AD as Backend>::Device::default();

    let mut saved = trained_state(&cfg);
    saved.end_epoch();
    saved.save(&ckpt, &cfg, false).unwrap();

    let (restored, state) = fresh_state(&cfg).resume(&ckpt, &cfg, &device).unwrap();
    assert_eq!(state.epoch, 0);
    assert_eq!(restored.epoch, 1);
    assert_eq!(restored.best_fitness, 0.25);
    assert_eq!(restored.iteration, 1);
    assert_eq!(restored.detector_ema.updates(), 2);
    assert_eq!(restored.detector_schedule, saved.detector_schedule);
    assert_eq!(restored.control_schedule.epoch(), 1);

    assert_eq!(bits(values(&saved.detector)), bits(values(&restored.detector)));
    assert_eq!(bits(values(&saved.control)), bits(values(&restored.control)));
    assert_eq!(
        bits(values(saved.detector_ema.module())),
        bits(values(restored.detector_ema.module()))
    );

    let before = saved.detector_optim.to_record();
    let after = restored.detector_optim.to_record();
    assert!(!before.entries.is_empty());
    assert_eq!(before.momentum, after.momentum);
    assert_eq!(before.entries.len(), after.entries.len());
    for (a, b) in before.entries.into_iter().zip(after.entries) {
        assert_eq!(a.id, b.id);
        let a: Vec<u32> = a.buffer.into_data().to_vec::<f32>().unwrap().into_iter().map(f32::to_bits).collect();
        let b: Vec<u32> = b.buffer.into_data().to_vec::<f32>().unwrap().into_iter().map(f32::to_bits).collect();
        assert_eq!(a, b);
    }

    // extractor stays frozen after a resume
    assert!(values(restored.control.extractor()).iter().all(|(_, req, _)| !req));
}

#[test]
fn missing_control_record_falls_back_to_fresh_weights() {
    let dir = tempfile::tempdir().unwrap();
    let ckpt = dir.path().join("last");
    let cfg = small_config();
    let device = <AD as Backend>::Device::default();

    let saved = trained_state(&cfg);
    saved.save(&ckpt, &cfg, false).unwrap();
    std::fs::remove_file(record_file(&ckpt.join(CONTROL))).unwrap();

    let fresh = fresh_state(&cfg);
    let fresh_control = bits(values(&fresh.control));
    let (restored, _) = fresh.resume(&ckpt, &cfg, &device).unwrap();
    assert_eq!(bits(values(&restored.control)), fresh_control);
    assert_eq!(restored.control_ema.updates(), 0);
    assert_eq!(bits(values(&saved.detector)), bits(values(&restored.detector)));
}

#[test]
fn finished_run_cannot_be_resumed() {
    let dir = tempfile::tempdir().unwrap();
    let ckpt = dir.path().join("best");
    let cfg = small_config();
    let device = <AD as Backend>::Device::default();

    fresh_state(&cfg).save(&ckpt, &cfg, true).unwrap();
    let err = fresh_state(&cfg).resume(&ckpt, &cfg, &device).err().unwrap();
    assert!(matches!(err, TrainError::Config(_)), "{err}");
}

#[test]
fn stripping_drops_optimizer_records() {
    let dir = tempfile::tempdir().unwrap();
    let ckpt = dir.path().join("last");
    let cfg = small_config();

    fresh_state(&cfg).save(&ckpt, &cfg, false).unwrap();
    assert!(record_file(&ckpt.join(DETECTOR_OPTIM)).is_file());
    assert!(record_file(&ckpt.join(CONTROL_OPTIM)).is_file());
    strip_optimizer(&ckpt).unwrap();
    assert!(!record_file(&ckpt.join(DETECTOR_OPTIM)).exists());
    assert!(!record_file(&ckpt.join(CONTROL_OPTIM)).exists());
    assert!(CheckpointState::read(&ckpt).unwrap().optimizer_stripped);
}
