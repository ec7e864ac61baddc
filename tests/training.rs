use std::fs;
use std::path::Path;

use burn::backend::{Autodiff, NdArray};
use egsc_burn::TrainError;
use egsc_burn::data::build_loaders;
use egsc_burn::model::{LossConfig, ModelConfig};
use egsc_burn::training::{Solver, TrainingConfig};
use image::{Rgb, RgbImage};

type TestBackend = Autodiff<NdArray<f32>>;

fn write_image(path: &Path, value: u8) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    RgbImage::from_pixel(20, 20, Rgb([value, 255 - value, value / 2]))
        .save(path)
        .unwrap();
}

/// Two domains with two classes each, in both splits.
fn dataset(root: &Path) {
    for split in ["train", "test"] {
        for (domain, base) in [("real", 40u8), ("synthetic", 160u8)] {
            for (class, offset) in [("car", 0u8), ("plane", 20u8)] {
                for idx in 0..2u8 {
                    let name = format!("{split}/{domain}/{class}/{idx}.png");
                    write_image(&root.join(name), base + offset + idx);
                }
            }
        }
    }
}

fn config(root: &Path) -> TrainingConfig {
    let model = ModelConfig::new()
        .with_img_size(16)
        .with_num_domains(2)
        .with_num_classes(2)
        .with_latent_dim(4)
        .with_hidden_dim(8)
        .with_style_dim(4)
        .with_bottleneck_size(8)
        .with_bottleneck_blocks(1)
        .with_max_conv_dim(8)
        .with_feature_layers(2);
    TrainingConfig::new(model, LossConfig::new())
        .with_total_iters(2)
        .with_batch_size(2)
        .with_val_batch_size(2)
        .with_num_workers(0)
        .with_print_every(1)
        .with_sample_every(2)
        .with_save_every(1)
        .with_num_outs_per_domain(1)
        .with_dataset_loc(root.join("data").display().to_string())
        .with_model_path(root.join("checkpoints").display().to_string())
        .with_save_path(root.join("samples").display().to_string())
}

fn checkpoint_files(dir: &Path) -> Vec<String> {
    let mut names: Vec<_> = fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[test]
fn trains_saves_and_resumes() {
    let root = tempfile::tempdir().unwrap();
    dataset(&root.path().join("data"));
    let device = Default::default();
    let config = config(root.path());
    let loaders = build_loaders::<TestBackend>(&config, &device).unwrap();

    let mut solver = Solver::<TestBackend>::new(config.clone(), device).unwrap();
    solver.train(&loaders).unwrap();

    let checkpoints = root.path().join("checkpoints");
    assert_eq!(
        checkpoint_files(&checkpoints),
        ["nets:000002.ckpt", "nets_ema:000002.ckpt", "optims:000002.ckpt"]
    );
    assert!(
        root.path()
            .join("samples/000002_latent_psi_1.0.jpg")
            .is_file()
    );

    let resumed = config.with_resume_iter(2).with_total_iters(3);
    let mut solver = Solver::<TestBackend>::new(resumed, device).unwrap();
    solver.train(&loaders).unwrap();
    assert_eq!(
        checkpoint_files(&checkpoints),
        ["nets:000003.ckpt", "nets_ema:000003.ckpt", "optims:000003.ckpt"]
    );
    assert_eq!(solver.config().total_iters, 3);
}

#[test]
fn resuming_without_checkpoints_fails() {
    let root = tempfile::tempdir().unwrap();
    let config = config(root.path()).with_resume_iter(5);

    let err = Solver::<TestBackend>::new(config, Default::default())
        .err()
        .expect("resume should fail");
    match err.downcast_ref::<TrainError>() {
        Some(TrainError::MissingCheckpoint(path)) => {
            assert!(path.ends_with("nets:000005.ckpt"), "{}", path.display())
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn no_sampling_when_disabled() {
    let root = tempfile::tempdir().unwrap();
    dataset(&root.path().join("data"));
    let device = Default::default();
    let config = config(root.path())
        .with_total_iters(1)
        .with_sample_every(0)
        .with_save_every(0);
    let loaders = build_loaders::<TestBackend>(&config, &device).unwrap();

    Solver::<TestBackend>::new(config, device)
        .unwrap()
        .train(&loaders)
        .unwrap();
    assert!(!root.path().join("samples").exists());
    assert!(!root.path().join("checkpoints").exists());
}
