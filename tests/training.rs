use std::{fs, num::NonZeroUsize, path::Path};

use rand::{rngs::StdRng, Rng, SeedableRng};

use volume_classifier::{
    arch::{layers::Mode, ArchitectureSpec, Cnn},
    config::{ArchitectureConfig, ModelConfig, TrainingConfig},
    data::{write_volume, LabeledVolumes, VolumeEntry},
    optimization::{Adam, AdamConfig},
    snapshot::Snapshot,
    training::{AdaptiveController, Decision, ModelTrainer},
    NetErr,
};

const SIZE: usize = 8;

/// Writes `per_class` volumes of each class: class 0 is bright at the front, class 1 at the back.
fn write_dataset(dir: &Path, per_class: usize, rng: &mut StdRng) -> Vec<VolumeEntry> {
    let mut entries = Vec::new();

    for label in 0..2 {
        for i in 0..per_class {
            let voxels: Vec<f32> = (0..SIZE * SIZE * SIZE)
                .map(|v| {
                    let front = v < SIZE * SIZE * SIZE / 2;
                    let bright = if front == (label == 0) { 0.5 } else { 0. };
                    bright + rng.random::<f32>() * 0.05
                })
                .collect();

            let path = dir.join(format!("{label}-{i}.raw"));
            write_volume(&path, &voxels).unwrap();
            entries.push(VolumeEntry { path, label });
        }
    }

    entries
}

fn tiny_model(seed: u64) -> ModelConfig {
    ModelConfig {
        architecture: ArchitectureConfig {
            input_size: SIZE,
            padding: 3,
            hidden_features: Some(vec![(2, 1)]),
        },
        batch_size: NonZeroUsize::new(4).unwrap(),
        seed: Some(seed),
        ..Default::default()
    }
}

#[test]
fn training_run_reports_every_epoch() {
    let dir = tempfile::tempdir().unwrap();
    let mut rng = StdRng::seed_from_u64(0);
    let dataset = write_dataset(dir.path(), 4, &mut rng);

    let config = TrainingConfig {
        number_of_classes: NonZeroUsize::new(2).unwrap(),
        epochs: NonZeroUsize::new(3).unwrap(),
        model: tiny_model(5),
        dataset,
        validation: Vec::new(),
    };
    config.validate().unwrap();

    let mut trainer = ModelTrainer::from_config(config).unwrap();
    let stats = trainer.train().unwrap();

    assert_eq!(stats.len(), 3);
    assert_eq!(stats[0].decision, Decision::FirstAccepted);
    assert_eq!(stats[0].learning_rate, 1e-2);
    assert_eq!(stats[0].momentum, 0.5);

    for s in &stats {
        assert!(s.validation.is_none());
        assert!(s.avg_loss.is_finite());
        assert!((0. ..=1.).contains(&s.accuracy));
    }

    let controller = trainer.classifier().controller();
    assert!(controller.accepted_epochs() >= 1);
    assert!(controller.learning_rate() > 0.);
}

#[test]
fn config_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let mut rng = StdRng::seed_from_u64(1);
    let dataset = write_dataset(dir.path(), 1, &mut rng);
    let validation = dataset[..1].to_vec();

    let config = TrainingConfig {
        number_of_classes: NonZeroUsize::new(2).unwrap(),
        epochs: NonZeroUsize::new(1).unwrap(),
        model: tiny_model(9),
        dataset,
        validation,
    };

    let path = dir.path().join("config.json");
    fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();

    assert_eq!(TrainingConfig::from_file(&path).unwrap(), config);
}

#[test]
fn validation_is_scored_without_touching_the_network() {
    let dir = tempfile::tempdir().unwrap();
    let mut rng = StdRng::seed_from_u64(2);
    let dataset = write_dataset(dir.path(), 3, &mut rng);
    let held_out_dir = dir.path().join("held-out");
    fs::create_dir(&held_out_dir).unwrap();
    let held_out = write_dataset(&held_out_dir, 1, &mut rng);

    let config = TrainingConfig {
        number_of_classes: NonZeroUsize::new(2).unwrap(),
        epochs: NonZeroUsize::new(2).unwrap(),
        model: tiny_model(6),
        dataset,
        validation: held_out.clone(),
    };
    config.validate().unwrap();

    let mut trainer = ModelTrainer::from_config(config).unwrap();
    let stats = trainer.train().unwrap();

    for s in &stats {
        let validation = s.validation.unwrap();
        assert!(validation.avg_loss.is_finite());
        assert!((0. ..=1.).contains(&validation.accuracy));
    }

    let saved = trainer.classifier().cnn().unwrap().snapshot();
    let held_out = LabeledVolumes::new(held_out, 2).unwrap();
    let first = trainer.evaluate(&held_out).unwrap();
    let second = trainer.evaluate(&held_out).unwrap();

    assert_eq!(first, second);
    assert_eq!(trainer.classifier().cnn().unwrap().snapshot(), saved);
}

#[test]
fn malformed_volume_stops_training() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("short.raw");
    write_volume(&path, &[0.; 10]).unwrap();

    let config = TrainingConfig {
        number_of_classes: NonZeroUsize::new(2).unwrap(),
        epochs: NonZeroUsize::new(1).unwrap(),
        model: tiny_model(3),
        dataset: vec![VolumeEntry { path, label: 1 }],
        validation: Vec::new(),
    };

    let mut trainer = ModelTrainer::from_config(config).unwrap();
    assert!(matches!(
        trainer.train(),
        Err(NetErr::MalformedVolume { .. })
    ));
}

#[test]
fn rejected_epoch_rolls_back_network_and_optimizer() {
    let spec = ArchitectureSpec::with_hidden(2, SIZE, 3, &[(2, 1)]);
    let mut cnn = Cnn::new(&spec, StdRng::seed_from_u64(4)).unwrap();
    let mut adam = Adam::new(cnn.size(), 1e-2, AdamConfig::default());
    let mut controller = AdaptiveController::default();

    let mut rng = StdRng::seed_from_u64(8);
    let mut train_step = |cnn: &mut Cnn, adam: &mut Adam| {
        let x = ndarray::Array5::from_shape_simple_fn((2, 1, SIZE, SIZE, SIZE), || {
            rng.random::<f32>()
        });
        let y = cnn.forward(x, Mode::Train).unwrap();
        cnn.backward(y).unwrap();
        cnn.step(adam).unwrap();
    };

    train_step(&mut cnn, &mut adam);
    controller
        .record_epoch_result(&mut cnn, &mut adam, 1.0, 0.5)
        .unwrap();
    let (saved_cnn, saved_adam) = (cnn.snapshot(), adam.snapshot());

    train_step(&mut cnn, &mut adam);
    train_step(&mut cnn, &mut adam);
    assert_ne!(cnn.snapshot(), saved_cnn);
    assert_ne!(adam.snapshot(), saved_adam);

    let decision = controller
        .record_epoch_result(&mut cnn, &mut adam, 10.0, 0.1)
        .unwrap();

    assert_eq!(decision, Decision::Rejected);
    assert_eq!(cnn.snapshot(), saved_cnn);
    assert_eq!(adam.snapshot(), saved_adam);
    assert_eq!(adam.steps(), 1);
}
