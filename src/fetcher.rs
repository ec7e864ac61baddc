//! Endless batch stream over a finite data loader.

use burn::data::dataloader::{DataLoader, DataLoaderIterator};
use burn::prelude::*;

/// One batch as produced by the data loader: source images with their class labels and
/// domains, and a second set of images drawn as references.
#[derive(Clone, Debug)]
pub struct RawBatch<B: Backend> {
    pub x: Tensor<B, 4>,
    pub y: Tensor<B, 1, Int>,
    pub d: Tensor<B, 1, Int>,
    pub x2: Tensor<B, 4>,
    pub y2: Tensor<B, 1, Int>,
    pub d2: Tensor<B, 1, Int>,
}

/// Tensors consumed by one training step.
#[derive(Clone, Debug)]
pub struct Inputs<B: Backend> {
    pub x_src: Tensor<B, 4>,
    pub y_src: Tensor<B, 1, Int>,
    pub d_src: Tensor<B, 1, Int>,
    pub x_src2: Tensor<B, 4>,
    pub d_src2: Tensor<B, 1, Int>,
}

impl<B: Backend> Inputs<B> {
    fn from_batch(batch: RawBatch<B>, device: &B::Device) -> Self {
        Self {
            x_src: batch.x.to_device(device),
            y_src: batch.y.to_device(device),
            d_src: batch.d.to_device(device),
            x_src2: batch.x2.to_device(device),
            d_src2: batch.d2.to_device(device),
        }
    }
}

/// Cycles through a loader forever, restarting it whenever it runs out.
///
/// The loader is not touched until the first call to `next`.
pub struct InputFetcher<'a, B: Backend> {
    loader: &'a dyn DataLoader<B, RawBatch<B>>,
    iter: Option<Box<dyn DataLoaderIterator<RawBatch<B>> + 'a>>,
    device: B::Device,
}

impl<'a, B: Backend> InputFetcher<'a, B> {
    pub fn new(loader: &'a dyn DataLoader<B, RawBatch<B>>, device: &B::Device) -> Self {
        Self {
            loader,
            iter: None,
            device: device.clone(),
        }
    }

    fn fetch(&mut self) -> Option<RawBatch<B>> {
        if let Some(batch) = self.iter.as_mut().and_then(|iter| iter.next()) {
            return Some(batch);
        }
        let iter = self.iter.insert(self.loader.iter());
        iter.next()
    }
}

impl<B: Backend> Iterator for InputFetcher<'_, B> {
    type Item = Inputs<B>;

    /// Yields `None` only when the loader produces nothing even right after a restart.
    fn next(&mut self) -> Option<Self::Item> {
        let batch = self.fetch()?;
        Some(Inputs::from_batch(batch, &self.device))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::data::dataloader::DataLoaderBuilder;
    use burn::data::dataloader::batcher::Batcher;
    use burn::data::dataset::InMemDataset;
    use std::sync::Arc;

    type TestBackend = NdArray<f32>;

    /// Builds constant batches whose pixels and domains equal the item value.
    #[derive(Clone, Default)]
    pub(crate) struct ConstantBatcher {
        pub img_size: usize,
    }

    impl<B: Backend> Batcher<B, i64, RawBatch<B>> for ConstantBatcher {
        fn batch(&self, items: Vec<i64>, device: &B::Device) -> RawBatch<B> {
            let size = self.img_size.max(1);
            let images = items
                .iter()
                .map(|value| Tensor::<B, 4>::full([1, 3, size, size], *value as f32 / 10.0, device))
                .collect::<Vec<_>>();
            let x = Tensor::cat(images, 0);
            let ids = Tensor::<B, 1, Int>::from_data(
                TensorData::new(items.clone(), [items.len()]),
                device,
            );
            let domains = ids.clone().remainder_scalar(2);
            RawBatch {
                x: x.clone(),
                y: ids.clone(),
                d: domains.clone(),
                x2: x.flip([0]),
                y2: ids,
                d2: domains.flip([0]),
            }
        }
    }

    pub(crate) fn constant_loader<B: Backend>(
        values: Vec<i64>,
        batch_size: usize,
        img_size: usize,
    ) -> Arc<dyn DataLoader<B, RawBatch<B>>> {
        DataLoaderBuilder::<B, i64, RawBatch<B>>::new(ConstantBatcher { img_size })
            .batch_size(batch_size)
            .build(InMemDataset::new(values))
    }

    fn first_value(inputs: &Inputs<TestBackend>) -> f32 {
        inputs.x_src.clone().into_data().to_vec::<f32>().unwrap()[0]
    }

    #[test]
    fn restarts_after_exhaustion() {
        let device = Default::default();
        let loader = constant_loader::<TestBackend>(vec![1, 2, 3], 1, 1);
        let mut fetcher = InputFetcher::new(loader.as_ref(), &device);

        let seen: Vec<f32> = (0..4)
            .map(|_| first_value(&fetcher.next().unwrap()))
            .collect();
        assert_eq!(seen, vec![0.1, 0.2, 0.3, 0.1]);
    }

    #[test]
    fn empty_loader_yields_nothing() {
        let device = Default::default();
        let loader = constant_loader::<TestBackend>(Vec::new(), 2, 1);
        let mut fetcher = InputFetcher::new(loader.as_ref(), &device);
        assert!(fetcher.next().is_none());
    }

    #[test]
    fn keeps_domains_and_labels() {
        let device = Default::default();
        let loader = constant_loader::<TestBackend>(vec![4, 7], 2, 1);
        let inputs = InputFetcher::new(loader.as_ref(), &device).next().unwrap();

        let d_src = inputs.d_src.into_data().to_vec::<i64>().unwrap();
        let d_src2 = inputs.d_src2.into_data().to_vec::<i64>().unwrap();
        assert_eq!(d_src, vec![0, 1]);
        assert_eq!(d_src2, vec![1, 0]);
        assert_eq!(inputs.y_src.into_data().to_vec::<i64>().unwrap(), vec![4, 7]);
    }
}
