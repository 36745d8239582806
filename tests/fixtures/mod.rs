//! Test fixtures for the selection algorithm.
//!
//! Provides a reusable builder for seeded synthetic regression data,
//! reducing boilerplate across test files.

use dclasso::data::DatasetSplit;
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

/// Builder for synthetic sparse-regression data with a fixed seed.
///
/// The design matrix has independent standard-normal entries; the response
/// is `y = Xβ + σ·ε` where β holds the configured leading coefficients
/// followed by zeros.
pub struct SyntheticDataBuilder {
    n_samples: usize,
    n_features: usize,
    true_coefficients: Vec<f64>,
    noise_std: f64,
    seed: u64,
    n_train: usize,
    n_val: usize,
}

impl SyntheticDataBuilder {
    /// Creates a builder with an even train/validation/test split and a
    /// single unit coefficient.
    pub fn new(n_samples: usize, n_features: usize) -> Self {
        Self {
            n_samples,
            n_features,
            true_coefficients: vec![1.0],
            noise_std: 1.0,
            seed: 42,
            n_train: n_samples / 3,
            n_val: n_samples / 3,
        }
    }

    /// Sets the leading entries of the true coefficient vector; the rest
    /// stay zero.
    pub fn with_true_coefficients(mut self, coefficients: Vec<f64>) -> Self {
        assert!(
            coefficients.len() <= self.n_features,
            "more true coefficients than features"
        );
        self.true_coefficients = coefficients;
        self
    }

    /// Sets the noise standard deviation σ.
    pub fn with_noise_std(mut self, noise_std: f64) -> Self {
        self.noise_std = noise_std;
        self
    }

    /// Sets the random seed for reproducibility.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Sets the training and validation row counts; the remainder of the
    /// rows becomes the test block.
    pub fn with_split(mut self, n_train: usize, n_val: usize) -> Self {
        assert!(
            n_train + n_val <= self.n_samples,
            "split exceeds the sample count"
        );
        self.n_train = n_train;
        self.n_val = n_val;
        self
    }

    /// Generates the dataset and partitions it by row ranges.
    pub fn build(self) -> DatasetSplit {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let x = Array2::from_shape_fn((self.n_samples, self.n_features), |_| {
            rng.sample::<f64, _>(StandardNormal)
        });

        let mut beta = Array1::zeros(self.n_features);
        for (slot, &value) in beta.iter_mut().zip(self.true_coefficients.iter()) {
            *slot = value;
        }

        let noise = Array1::from_shape_fn(self.n_samples, |_| {
            self.noise_std * rng.sample::<f64, _>(StandardNormal)
        });
        let y = x.dot(&beta) + noise;

        DatasetSplit::from_rows(x, y, self.n_train, self.n_val)
            .expect("builder split sizes are checked before generation")
    }
}
