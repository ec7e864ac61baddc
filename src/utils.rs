use anyhow::{Context, Result};
use burn::prelude::*;
use image::{GenericImage, Rgb, RgbImage};
use std::path::Path;

/// Map [-1, 1] normalized values back to [0, 1].
pub fn scale_back(value: f32) -> f32 {
    (value + 1.0) * 0.5
}

/// Convert a BCHW tensor in [-1, 1] to a vector of RGB images.
pub fn tensor_to_images<B: Backend>(tensor: Tensor<B, 4>) -> Result<Vec<RgbImage>> {
    let [batch, channels, height, width] = tensor.dims();
    if channels != 3 {
        return Err(anyhow::anyhow!(
            "expected 3 channels for images, got {channels}"
        ));
    }

    let values = tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|err| anyhow::anyhow!("failed to read tensor data as f32: {err:?}"))?;
    let hw = height * width;
    let to_byte = |value: f32| (scale_back(value).clamp(0.0, 1.0) * 255.0).round() as u8;

    let images = values
        .chunks_exact(channels * hw)
        .take(batch)
        .map(|sample| {
            RgbImage::from_fn(width as u32, height as u32, |x, y| {
                let idx = y as usize * width + x as usize;
                Rgb([
                    to_byte(sample[idx]),
                    to_byte(sample[hw + idx]),
                    to_byte(sample[2 * hw + idx]),
                ])
            })
        })
        .collect();

    Ok(images)
}

/// Merge images into a fixed grid (rows x cols).
pub fn merge_images(images: &[RgbImage], rows: usize, cols: usize) -> Result<RgbImage> {
    if images.is_empty() {
        return Err(anyhow::anyhow!("no images to merge"));
    }
    let width = images[0].width();
    let height = images[0].height();
    let mut out = RgbImage::new(width * cols as u32, height * rows as u32);

    for (idx, img) in images.iter().enumerate() {
        let row = idx / cols;
        let col = idx % cols;
        if row >= rows {
            break;
        }
        out.copy_from(img, (col as u32) * width, (row as u32) * height)
            .context("failed to copy image into grid")?;
    }

    Ok(out)
}

/// Write a batch of [-1, 1] images as one grid, `ncol` images per row.
///
/// Values are mapped to [0, 1] and clamped before quantization. The format follows the extension
/// of `path`.
pub fn save_image_grid<B: Backend>(tensor: Tensor<B, 4>, ncol: usize, path: &Path) -> Result<()> {
    let images = tensor_to_images(tensor)?;
    let cols = ncol.clamp(1, images.len().max(1));
    let rows = images.len().div_ceil(cols);
    let grid = merge_images(&images, rows, cols)?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    grid.save(path)
        .with_context(|| format!("failed to save {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn grid_wraps_after_ncol_images() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grid.png");
        let device = Default::default();
        let batch = Tensor::<TestBackend, 4>::full([5, 3, 4, 6], 1.0, &device);

        save_image_grid(batch, 2, &path).unwrap();

        let grid = image::open(&path).unwrap().to_rgb8();
        assert_eq!(grid.dimensions(), (12, 12));
        assert_eq!(grid.get_pixel(0, 0), &Rgb([255, 255, 255]));
        assert_eq!(grid.get_pixel(11, 11), &Rgb([0, 0, 0]));
    }

    #[test]
    fn values_are_clamped_into_byte_range() {
        let device = Default::default();
        let data = TensorData::new(
            vec![-3.0f32, 0.0, 3.0],
            [1, 3, 1, 1],
        );
        let tensor = Tensor::<TestBackend, 4>::from_data(data, &device);
        let images = tensor_to_images(tensor).unwrap();
        assert_eq!(images[0].get_pixel(0, 0), &Rgb([0, 128, 255]));
    }
}
