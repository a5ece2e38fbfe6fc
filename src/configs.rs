use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};


pub const VAL_FREQ: u64 = 1000;
pub const VAL_BATCH_MULTIPLIER: i64 = 4;
pub const VAL_NUM_BATCHES: usize = 200;
pub const TEST_NUM_BATCHES: usize = 2000;

// 30 alphabets for training, 10 for validation, the rest of the 50 for testing.
pub const DATA_SPLIT: [usize; 2] = [30, 10];
pub const N_ALPHABETS: usize = 50;

pub const BASE_FILTERS: i64 = 16;
pub const EMBEDDING_DIM: i64 = 128;
pub const DROPOUT_RATE: f64 = 0.3;
pub const L2_COEFFICIENT: f64 = 1e-4;
pub const BN_EPS: f64 = 1e-4;

// ln(2), the loss of a classifier that always answers 0.5.
pub const SMOOTH_LOSS_SEED: f64 = 0.6932;
pub const SMOOTHING: f64 = 0.95;


/// Hyperparameters of a single run. Fixed once the run starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub expt_name: String,
    pub learning_rate: f64,
    pub image_size: i64,
    pub batch_size: i64,
    pub testing: bool,
    pub max_iter: u64,
    pub depth: i64,
    pub width: i64,
    pub val_freq: u64,
    pub val_num_batches: usize,
    pub test_num_batches: usize,
    pub data_split: [usize; 2],
    pub seed: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            expt_name: String::from("w_o_test"),
            learning_rate: 1e-3,
            image_size: 32,
            batch_size: 32,
            testing: false,
            max_iter: 100_000,
            depth: 16,
            width: 4,
            val_freq: VAL_FREQ,
            val_num_batches: VAL_NUM_BATCHES,
            test_num_batches: TEST_NUM_BATCHES,
            data_split: DATA_SPLIT,
            seed: None,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.expt_name.is_empty() {
            bail!("experiment name must not be empty");
        }
        if !(self.learning_rate > 0.0) {
            bail!("learning rate must be positive, got {}", self.learning_rate);
        }
        if self.image_size < 4 {
            bail!("image size must be at least 4, got {}", self.image_size);
        }
        if self.batch_size < 1 {
            bail!("batch size must be at least 1, got {}", self.batch_size);
        }
        if self.depth < 1 || self.width < 1 {
            bail!("depth and width must be at least 1, got d={} k={}", self.depth, self.width);
        }
        if self.val_freq == 0 {
            bail!("validation frequency must be at least 1");
        }
        if self.val_num_batches == 0 || self.test_num_batches == 0 {
            bail!("validation and test phases need at least one batch each");
        }
        if self.data_split[0] + self.data_split[1] >= N_ALPHABETS {
            bail!("data split {:?} leaves no alphabets for testing", self.data_split);
        }
        Ok(())
    }

    /// Number of pairs per validation batch.
    pub fn val_batch_size(&self) -> i64 {
        self.batch_size * VAL_BATCH_MULTIPLIER
    }

    /// Filter count of the stem (stage 0) and of the three residual stages.
    pub fn n_filters(&self, stage: usize) -> i64 {
        match stage {
            0 => BASE_FILTERS,
            1 => BASE_FILTERS * self.width,
            2 => 2 * BASE_FILTERS * self.width,
            _ => 4 * BASE_FILTERS * self.width,
        }
    }
}
