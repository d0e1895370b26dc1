use anyhow::Result;
use burn::tensor::backend::Backend;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// Trait for data loading
pub trait DataLoader<T> {
    /// Get the next batch of data
    fn next_batch(&mut self) -> Result<Option<T>>;

    /// Rewind to the beginning of the next epoch
    fn reset(&mut self);

    /// Get the total number of batches (if known)
    fn num_batches(&self) -> Option<usize>;
}

/// Turns a slice of samples into one batch of tensors.
pub trait Collate<B: Backend> {
    type Item;
    type Batch;

    fn collate(&self, items: &[&Self::Item], device: &B::Device) -> Self::Batch;
}

/// In-memory samples served in fixed-size batches.
pub struct BatchLoader<B: Backend, C: Collate<B>> {
    items: Vec<C::Item>,
    order: Vec<usize>,
    collate: C,
    batch_size: usize,
    drop_last: bool,
    shuffle_seed: Option<u64>,
    epoch: u64,
    cursor: usize,
    device: B::Device,
}

impl<B: Backend, C: Collate<B>> BatchLoader<B, C> {
    pub fn new(items: Vec<C::Item>, collate: C, batch_size: usize, device: B::Device) -> Self {
        let order = (0..items.len()).collect();
        Self {
            items,
            order,
            collate,
            batch_size: batch_size.max(1),
            drop_last: false,
            shuffle_seed: None,
            epoch: 0,
            cursor: 0,
            device,
        }
    }

    pub fn with_shuffle(mut self, seed: u64) -> Self {
        self.shuffle_seed = Some(seed);
        self
    }

    pub fn with_drop_last(mut self, drop_last: bool) -> Self {
        self.drop_last = drop_last;
        self
    }
}

impl<B: Backend, C: Collate<B>> DataLoader<C::Batch> for BatchLoader<B, C> {
    fn next_batch(&mut self) -> Result<Option<C::Batch>> {
        if self.cursor >= self.order.len() {
            return Ok(None);
        }
        let end = (self.cursor + self.batch_size).min(self.order.len());
        if self.drop_last && end - self.cursor < self.batch_size {
            return Ok(None);
        }

        let batch: Vec<&C::Item> = self.order[self.cursor..end]
            .iter()
            .map(|&i| &self.items[i])
            .collect();
        self.cursor = end;

        Ok(Some(self.collate.collate(&batch, &self.device)))
    }

    fn reset(&mut self) {
        self.cursor = 0;
        if let Some(seed) = self.shuffle_seed {
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(self.epoch));
            self.order.shuffle(&mut rng);
        }
        self.epoch += 1;
    }

    fn num_batches(&self) -> Option<usize> {
        let n = self.items.len();
        Some(if self.drop_last {
            n / self.batch_size
        } else {
            n.div_ceil(self.batch_size)
        })
    }
}
