use anyhow::{Context, Result};
use burn::data::dataloader::DataLoaderBuilder;
use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::prelude::*;
use burn::tensor::TensorData;
use image::RgbImage;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::TrainError;
use crate::fetcher::RawBatch;
use crate::training::{Loaders, TrainingConfig};

/// Dataset names accepted by [`build_loaders`].
pub const SUPPORTED_DATASETS: [&str; 2] = ["visda", "mnist_svhn"];

const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// One image on disk with the domain and class given by its parent directories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageItem {
    pub path: PathBuf,
    pub domain: i64,
    pub class: i64,
}

/// Images laid out as `{root}/{domain}/{class}/*.{png,jpg,jpeg}`.
///
/// Domains and classes are numbered by the sorted order of their directory names.
#[derive(Debug, Clone)]
pub struct ImageFolder {
    items: Vec<ImageItem>,
    domains: Vec<String>,
}

fn sorted_subdirs(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))? {
        let path = entry?.path();
        if path.is_dir()
            && let Some(name) = path.file_name().and_then(|name| name.to_str())
        {
            dirs.push((name.to_string(), path.clone()));
        }
    }
    dirs.sort();
    Ok(dirs)
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

impl ImageFolder {
    pub fn scan(root: &Path) -> Result<Self> {
        let mut items = Vec::new();
        let mut domains = Vec::new();

        for (domain, (domain_name, domain_dir)) in sorted_subdirs(root)?.into_iter().enumerate() {
            for (class, (_, class_dir)) in sorted_subdirs(&domain_dir)?.into_iter().enumerate() {
                let escaped = glob::Pattern::escape(&class_dir.display().to_string());
                let pattern = format!("{escaped}/*");
                let mut files: Vec<_> = glob::glob(&pattern)?
                    .filter_map(Result::ok)
                    .filter(|path| is_image(path))
                    .collect();
                files.sort();
                items.extend(files.into_iter().map(|path| ImageItem {
                    path,
                    domain: domain as i64,
                    class: class as i64,
                }));
            }
            domains.push(domain_name);
        }

        Ok(Self { items, domains })
    }

    pub fn domains(&self) -> &[String] {
        &self.domains
    }

    pub fn items(&self) -> &[ImageItem] {
        &self.items
    }
}

impl Dataset<ImageItem> for ImageFolder {
    fn get(&self, index: usize) -> Option<ImageItem> {
        self.items.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

/// Settings for decoding and assembling image batches.
#[derive(Debug, Clone)]
pub struct DataConfig {
    pub image_size: u32,
    /// Probability of a random-resized crop before resizing. Only applied when augmenting.
    pub randcrop_prob: f64,
}

/// Pairs every item with a reference image drawn at random from the whole set.
#[derive(Clone)]
pub struct PairedBatcher {
    config: DataConfig,
    references: Arc<Vec<ImageItem>>,
    augment: bool,
    rng: Arc<Mutex<StdRng>>,
}

impl PairedBatcher {
    pub fn new(config: DataConfig, references: Vec<ImageItem>, augment: bool, seed: u64) -> Self {
        Self {
            config,
            references: Arc::new(references),
            augment,
            rng: Arc::new(Mutex::new(StdRng::seed_from_u64(seed))),
        }
    }
}

impl<B: Backend> Batcher<B, ImageItem, RawBatch<B>> for PairedBatcher {
    fn batch(&self, items: Vec<ImageItem>, device: &B::Device) -> RawBatch<B> {
        let mut rng = self.rng.lock().expect("rng lock poisoned");
        build_batch::<B>(
            &items,
            &self.references,
            &self.config,
            self.augment,
            &mut *rng,
            device,
        )
        .expect("failed to build batch")
    }
}

/// Load `items` plus one random reference each into a normalized batch.
pub fn build_batch<B: Backend>(
    items: &[ImageItem],
    references: &[ImageItem],
    config: &DataConfig,
    augment: bool,
    rng: &mut impl Rng,
    device: &B::Device,
) -> Result<RawBatch<B>> {
    if references.is_empty() {
        return Err(TrainError::EmptyDataSource.into());
    }
    let batch_size = items.len();
    let image_size = config.image_size as usize;
    let per_image = 3 * image_size * image_size;
    let mut x = Vec::with_capacity(batch_size * per_image);
    let mut x2 = Vec::with_capacity(batch_size * per_image);
    let (mut y, mut d, mut y2, mut d2) = (Vec::new(), Vec::new(), Vec::new(), Vec::new());

    for item in items {
        let reference = &references[rng.gen_range(0..references.len())];
        x.append(&mut load_image(&item.path, config, augment, rng)?);
        x2.append(&mut load_image(&reference.path, config, augment, rng)?);
        y.push(item.class);
        d.push(item.domain);
        y2.push(reference.class);
        d2.push(reference.domain);
    }

    let shape = [batch_size, 3, image_size, image_size];
    let images =
        |values: Vec<f32>| Tensor::<B, 4>::from_data(TensorData::new(values, shape), device);
    let ids = |values: Vec<i64>| {
        Tensor::<B, 1, Int>::from_data(TensorData::new(values, [batch_size]), device)
    };

    Ok(RawBatch {
        x: images(x),
        y: ids(y),
        d: ids(d),
        x2: images(x2),
        y2: ids(y2),
        d2: ids(d2),
    })
}

/// Decode, optionally crop, resize and normalize one image file.
fn load_image(
    path: &Path,
    config: &DataConfig,
    augment: bool,
    rng: &mut impl Rng,
) -> Result<Vec<f32>> {
    let mut img = image::open(path)
        .with_context(|| format!("failed to decode {}", path.display()))?
        .to_rgb8();

    if augment && rng.gen_bool(config.randcrop_prob.clamp(0.0, 1.0)) {
        img = random_resized_crop(&img, rng);
    }
    if img.width() != config.image_size || img.height() != config.image_size {
        img = resize_image(&img, config.image_size, config.image_size);
    }
    Ok(image_to_chw(&img))
}

fn resize_image(img: &RgbImage, width: u32, height: u32) -> RgbImage {
    image::imageops::resize(img, width, height, image::imageops::FilterType::CatmullRom)
}

/// Crop a random region covering 80-100% of the area with an aspect ratio in 0.9-1.1.
///
/// Falls back to the whole image when no sampled region fits.
fn random_resized_crop(img: &RgbImage, rng: &mut impl Rng) -> RgbImage {
    let (width, height) = img.dimensions();
    let area = (width * height) as f64;
    let (log_min, log_max) = (0.9f64.ln(), 1.1f64.ln());

    for _ in 0..10 {
        let target_area = area * rng.gen_range(0.8..=1.0);
        let aspect = rng.gen_range(log_min..=log_max).exp();
        let crop_w = (target_area * aspect).sqrt().round() as u32;
        let crop_h = (target_area / aspect).sqrt().round() as u32;
        if crop_w == 0 || crop_h == 0 || crop_w > width || crop_h > height {
            continue;
        }
        let left = rng.gen_range(0..=width - crop_w);
        let top = rng.gen_range(0..=height - crop_h);
        return image::imageops::crop_imm(img, left, top, crop_w, crop_h).to_image();
    }

    img.clone()
}

/// Convert RGB image data to CHW floats normalized to [-1, 1].
fn image_to_chw(img: &RgbImage) -> Vec<f32> {
    let (width, height) = img.dimensions();
    let hw = (width * height) as usize;
    let mut out = vec![0.0f32; hw * 3];

    for y in 0..height {
        for x in 0..width {
            let pixel = img.get_pixel(x, y).0;
            let idx = (y * width + x) as usize;
            out[idx] = (pixel[0] as f32 / 127.5) - 1.0;
            out[hw + idx] = (pixel[1] as f32 / 127.5) - 1.0;
            out[2 * hw + idx] = (pixel[2] as f32 / 127.5) - 1.0;
        }
    }

    out
}

/// Training loader over `{dataset_loc}/train` and validation loader over `{dataset_loc}/test`.
pub fn build_loaders<B: Backend>(
    config: &TrainingConfig,
    device: &B::Device,
) -> Result<Loaders<B>> {
    if !SUPPORTED_DATASETS.contains(&config.dataset.as_str()) {
        return Err(TrainError::UnsupportedDataset(config.dataset.clone()).into());
    }

    let root = Path::new(&config.dataset_loc);
    let train = ImageFolder::scan(&root.join("train"))?;
    let test = ImageFolder::scan(&root.join("test"))?;
    tracing::info!(
        "Dataset {}: {} training images over domains {:?}, {} validation images",
        config.dataset,
        train.len(),
        train.domains(),
        test.len()
    );

    let data_config = DataConfig {
        image_size: config.model.img_size as u32,
        randcrop_prob: config.randcrop_prob,
    };
    let train_batcher =
        PairedBatcher::new(data_config.clone(), train.items().to_vec(), true, config.seed);
    let val_batcher = PairedBatcher::new(data_config, test.items().to_vec(), false, config.seed);

    let src = DataLoaderBuilder::<B, ImageItem, RawBatch<B>>::new(train_batcher)
        .batch_size(config.batch_size)
        .shuffle(config.seed)
        .num_workers(config.num_workers)
        .set_device(device.clone())
        .build(train);
    let val = DataLoaderBuilder::<B, ImageItem, RawBatch<B>>::new(val_batcher)
        .batch_size(config.val_batch_size)
        .shuffle(config.seed)
        .num_workers(config.num_workers)
        .set_device(device.clone())
        .build(test);

    Ok(Loaders { src, val })
}
