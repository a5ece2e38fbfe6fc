use std::fmt;
use std::ops::Range;
use std::path::Path;

use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use tch::{Device, Kind, Tensor, TchError};
use thiserror::Error;

use crate::configs::N_ALPHABETS;


#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Split {
    Train,
    Val,
    Test,
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Split::Train => "train",
            Split::Val => "val",
            Split::Test => "test",
        };
        write!(f, "{}", name)
    }
}


#[derive(Debug, Error)]
pub enum DataError {
    #[error("failed to read dataset: {0}")]
    Read(#[from] TchError),
    #[error("expected a (classes, drawers, height, width) array, got shape {0:?}")]
    Shape(Vec<i64>),
    #[error("{split} split holds {classes} classes, at least 2 are needed")]
    EmptySplit { split: Split, classes: i64 },
    #[error("every class needs at least 2 drawings, got {0}")]
    TooFewDrawers(i64),
    #[error("image size must be positive, got {0}")]
    ImageSize(i64),
}


/// One verification batch. `images` is `(2B, side, side)`: the first `B`
/// images are set A, the last `B` are set B, pair `i` is `(A[i], B[i])`.
/// `labels` is `(B, 1)` with 1 for same-class pairs.
#[derive(Debug)]
pub struct Batch {
    pub images: Tensor,
    pub labels: Tensor,
}

impl Batch {
    pub fn to_device(&self, device: Device) -> Batch {
        Batch {
            images: self.images.to_device(device),
            labels: self.labels.to_device(device),
        }
    }
}


/// Anything that can hand out verification batches for a split.
pub trait BatchSource {
    fn fetch_batch(&mut self, batch_size: i64, split: Split) -> Result<Batch, DataError>;
}


/// Omniglot characters stored as a `(classes, drawers, height, width)` npy
/// array. Classes are split in order, proportionally to the alphabet split.
pub struct Omniglot {
    images: Tensor,
    n_drawers: i64,
    splits: [Range<i64>; 3],
    rng: StdRng,
}

impl Omniglot {
    pub fn load<P: AsRef<Path>>(
        path: P,
        image_size: i64,
        data_split: [usize; 2],
        seed: Option<u64>
        ) -> Result<Self, DataError> {

        let images = Tensor::read_npy(path)?;
        Self::from_tensor(images, image_size, data_split, seed)
    }

    pub fn from_tensor(
        images: Tensor,
        image_size: i64,
        data_split: [usize; 2],
        seed: Option<u64>
        ) -> Result<Self, DataError> {

        let size = images.size();
        let (n_classes, n_drawers, height, width) = match size.as_slice() {
            &[c, d, h, w] => (c, d, h, w),
            _ => return Err(DataError::Shape(size)),
        };
        if n_drawers < 2 {
            return Err(DataError::TooFewDrawers(n_drawers));
        }
        if image_size < 1 {
            return Err(DataError::ImageSize(image_size));
        }

        let mut images = images.to_kind(Kind::Float);
        if images.max().double_value(&[]) > 1.0 {
            images = images / 255.0;
        }
        let images = images.view([n_classes * n_drawers, 1, height, width])
                           .adaptive_avg_pool2d(&[image_size, image_size])
                           .view([n_classes * n_drawers, image_size, image_size]);

        let train_end = n_classes * data_split[0] as i64 / N_ALPHABETS as i64;
        let val_end = n_classes * (data_split[0] + data_split[1]) as i64 / N_ALPHABETS as i64;
        let splits = [0..train_end, train_end..val_end, val_end..n_classes];
        for (split, range) in [Split::Train, Split::Val, Split::Test].iter().zip(splits.iter()) {
            let classes = range.end - range.start;
            if classes < 2 {
                return Err(DataError::EmptySplit { split: *split, classes });
            }
        }

        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Ok(Omniglot { images, n_drawers, splits, rng })
    }

    pub fn n_classes(&self, split: Split) -> i64 {
        let range = self.split_range(split);
        range.end - range.start
    }

    fn split_range(&self, split: Split) -> Range<i64> {
        match split {
            Split::Train => self.splits[0].clone(),
            Split::Val => self.splits[1].clone(),
            Split::Test => self.splits[2].clone(),
        }
    }

    fn sample_pair(&mut self, classes: &Range<i64>, same: bool) -> (i64, i64) {
        let n_classes = classes.end - classes.start;
        let class_a = self.rng.gen_range(classes.clone());
        let drawer_a = self.rng.gen_range(0..self.n_drawers);

        let (class_b, drawer_b) = if same {
            let offset = self.rng.gen_range(1..self.n_drawers);
            (class_a, (drawer_a + offset) % self.n_drawers)
        } else {
            let offset = self.rng.gen_range(1..n_classes);
            let class_b = classes.start + (class_a - classes.start + offset) % n_classes;
            (class_b, self.rng.gen_range(0..self.n_drawers))
        };

        (class_a * self.n_drawers + drawer_a, class_b * self.n_drawers + drawer_b)
    }
}

impl BatchSource for Omniglot {
    /// Half of the pairs share a class, the other half do not, in random order.
    fn fetch_batch(&mut self, batch_size: i64, split: Split) -> Result<Batch, DataError> {
        let classes = self.split_range(split);

        let mut pairs: Vec<(i64, i64, f32)> = (0..batch_size)
            .map(|idx| {
                let same = idx < batch_size / 2;
                let (a, b) = self.sample_pair(&classes, same);
                (a, b, if same { 1.0 } else { 0.0 })
            })
            .collect();
        pairs.shuffle(&mut self.rng);

        let index: Vec<i64> = pairs.iter()
            .map(|(a, _, _)| *a)
            .chain(pairs.iter().map(|(_, b, _)| *b))
            .collect();
        let labels: Vec<f32> = pairs.iter().map(|(_, _, label)| *label).collect();

        Ok(Batch {
            images: self.images.index_select(0, &Tensor::of_slice(&index)),
            labels: Tensor::of_slice(&labels).view([batch_size, 1]),
        })
    }
}
