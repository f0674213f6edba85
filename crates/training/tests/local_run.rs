mod common;

use std::path::Path;

use clap::Parser;
use common::{write_dataset, write_estimator};
use training::checkpoint::{record_file, CONTROL_OPTIM, DETECTOR, DETECTOR_OPTIM};
use training::collective::DEFAULT_HANDSHAKE_TIMEOUT;
use training::dataset::load_descriptor;
use training::util::{evaluate_checkpoint, train_replica};
use training::{
    checkpoint_dir, run_train, CheckpointState, LocalGroup, LocalHub, TrainArgs, TrainConfig,
};

fn write_config(root: &Path, world_size: usize) -> std::path::PathBuf {
    let data = write_dataset(&root.join("data"), 4, (48, 40));
    let estimator = write_estimator(root);
    let config = format!(
        r#"
epochs = 1
batch_size = 2
nbs = 2
imgsz = 32
show_progress = false
world_size = {world_size}
run_dir = {run_dir:?}
data = {data:?}
bit_estimator = {estimator:?}

[hyp]
warmup_epochs = 0.0
control_lr = 0.001

[control]
input_size = 32
dropout = 0.0

[control.backbone]
channels = [4, 8]

[detector]
num_classes = 1
width = 8
"#,
        run_dir = root.join("run").display().to_string(),
        data = data.display().to_string(),
        estimator = estimator.display().to_string(),
    );
    let path = root.join("train.toml");
    std::fs::write(&path, config).unwrap();
    path
}

fn args(extra: &[&str], config: &Path) -> TrainArgs {
    let config = config.display().to_string();
    let mut argv = vec!["train", "--config", config.as_str()];
    argv.extend_from_slice(extra);
    TrainArgs::parse_from(argv)
}

#[test]
fn one_epoch_run_leaves_finished_checkpoints() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), 1);
    let run_dir = dir.path().join("run");

    run_train(args(&[], &config)).unwrap();

    let results = std::fs::read_to_string(run_dir.join("results.jsonl")).unwrap();
    let lines: Vec<_> = results.lines().collect();
    assert_eq!(lines.len(), 1);
    let record: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(record["epoch"], 0);
    assert!(record["val"]["map50"].is_number());
    assert!(record["train"]["bpp"].as_f64().unwrap().is_finite());

    for marker in ["last", "best"] {
        let ckpt = checkpoint_dir(&run_dir, marker);
        let state = CheckpointState::read(&ckpt).unwrap();
        assert!(state.finished, "{marker} not marked finished");
        assert!(state.optimizer_stripped);
        assert_eq!(state.epoch, 0);
        assert!(record_file(&ckpt.join(DETECTOR)).is_file());
        assert!(!record_file(&ckpt.join(DETECTOR_OPTIM)).exists());
        assert!(!record_file(&ckpt.join(CONTROL_OPTIM)).exists());
    }

    // a finished run is not resumable
    assert!(run_train(args(&["--resume"], &config)).is_err());

    let report = evaluate_checkpoint(&checkpoint_dir(&run_dir, "best"), None, None).unwrap();
    assert_eq!(report.images, 4);
    assert!(report.bpp.is_finite());
    assert!((0.0..=1.0).contains(&report.fitness()));
}

#[test]
fn resume_without_a_checkpoint_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), 1);
    let err = run_train(args(&["--resume"], &config)).unwrap_err();
    assert!(err.to_string().contains("nothing to resume"), "{err}");
}

#[test]
fn local_replicas_train_one_epoch() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), 2);
    let run_dir = dir.path().join("run");

    run_train(args(&["--seed", "3"], &config)).unwrap();

    // only rank 0 validates and writes
    let results = std::fs::read_to_string(run_dir.join("results.jsonl")).unwrap();
    assert_eq!(results.lines().count(), 1);
    let state = CheckpointState::read(&checkpoint_dir(&run_dir, "last")).unwrap();
    assert_eq!(state.config.world_size, 2);
    assert_eq!(state.config.seed, 3);
    assert!(state.finished);
}

#[test]
fn failing_replica_releases_its_peer() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), 2);
    let cfg = TrainConfig::from_path(&config).unwrap();
    let descriptor = load_descriptor(&cfg.data).unwrap();
    let broken = TrainConfig {
        bit_estimator: dir.path().join("missing_estimator"),
        ..cfg.clone()
    };

    let hub = LocalHub::new(2);
    let peer = {
        let hub = hub.clone();
        let cfg = cfg.clone();
        let descriptor = descriptor.clone();
        std::thread::spawn(move || {
            let group = LocalGroup::join(hub, 1, DEFAULT_HANDSHAKE_TIMEOUT).unwrap();
            train_replica(&cfg, &descriptor, None, &group)
        })
    };
    let group = LocalGroup::join(hub, 0, DEFAULT_HANDSHAKE_TIMEOUT).unwrap();
    let main = train_replica(&broken, &descriptor, None, &group).unwrap_err();
    assert!(format!("{main:#}").contains("bit estimator"), "{main:#}");

    let err = peer.join().unwrap().unwrap_err();
    assert!(format!("{err:#}").contains("aborted"), "{err:#}");
}
