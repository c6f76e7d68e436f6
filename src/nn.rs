use std::{ops::Range, time::Instant};

use nalgebra::DMatrix;
use rand::Rng;
use rand_distr::Uniform;
use rayon::prelude::*;

use crate::{Error, NetworkConfig};

/// Intermediate tensors of one forward pass. Produced by
/// [`Network::forward`], consumed by [`Network::cost`] and
/// [`Network::backprop`], then dropped; nothing is retained across calls.
pub struct Forward {
    /// Input with bias column, samples x (features + 1).
    pub a1: DMatrix<f64>,
    /// Hidden pre-activation, hidden x samples.
    pub z2: DMatrix<f64>,
    /// Hidden activation with bias row, (hidden + 1) x samples.
    pub a2: DMatrix<f64>,
    /// Output pre-activation, classes x samples.
    pub z3: DMatrix<f64>,
    /// Softmax output, classes x samples; every column sums to one.
    pub a3: DMatrix<f64>,
}

/// Feedforward classifier with a single hidden layer.
///
/// `w1` maps the biased input to the hidden layer, `w2` the biased hidden
/// activation to the output layer. Column 0 of each matrix is the bias
/// weight and stays out of the L2 penalty.
pub struct Network {
    config: NetworkConfig,
    w1: DMatrix<f64>,
    w2: DMatrix<f64>,
    /// Working learning rate; decays across epochs and is never reset.
    learning_rate: f64,
    /// One cross-entropy cost per minibatch step, in training order.
    pub costs: Vec<f64>,
}

impl Network {
    /// Validate the configuration and draw the initial weights from the
    /// caller's random source, uniform in [-1, 1] scaled by the inverse of
    /// the layer's fan-in plus bias.
    pub fn new(config: NetworkConfig, rng: &mut impl Rng) -> Result<Self, Error> {
        config.validate()?;

        let uniform = Uniform::new_inclusive(-1.0, 1.0).unwrap();
        let w1 = DMatrix::from_fn(config.n_hidden, config.n_features + 1, |_, _| {
            rng.sample(uniform) / (config.n_features + 1) as f64
        });
        let w2 = DMatrix::from_fn(config.n_output, config.n_hidden + 1, |_, _| {
            rng.sample(uniform) / (config.n_hidden + 1) as f64
        });

        let learning_rate = config.learning_rate;

        Ok(Self {
            config,
            w1,
            w2,
            learning_rate,
            costs: Vec::new(),
        })
    }

    /// Compute the feedforward step for a whole batch (samples x features).
    ///
    /// Bias units are prepended, the hidden pre-activation is mapped through
    /// the configured nonlinearity, and the output is normalized per sample
    /// column by a max-subtracted softmax. Pure; the caller's data is left
    /// untouched.
    pub fn forward(&self, x: &DMatrix<f64>) -> Forward {
        let a1 = add_bias_column(x);
        let z2 = &self.w1 * a1.transpose();
        let a2 = add_bias_row(&z2.map(self.config.activation.function()));
        let z3 = &self.w2 * &a2;
        let a3 = softmax(&z3);

        Forward { a1, z2, a2, z3, a3 }
    }

    /// Cross-entropy between one-hot labels and the softmax output,
    /// averaged over the batch, plus the raw (unaveraged) L2 penalty on the
    /// non-bias weights. `ln` is unguarded: an exact zero in `output`
    /// yields an infinite or NaN cost.
    pub fn cost(&self, y_enc: &DMatrix<f64>, output: &DMatrix<f64>) -> f64 {
        let samples = y_enc.ncols() as f64;
        let cross_entropy = -y_enc.component_mul(&output.map(f64::ln)).sum() / samples;

        let l2_term = (self.config.l2 / 2.0)
            * (self.w1.columns(1, self.w1.ncols() - 1).norm_squared()
                + self.w2.columns(1, self.w2.ncols() - 1).norm_squared());

        cross_entropy + l2_term
    }

    /// Manually derived gradients of the cost with respect to both weight
    /// matrices. Pure function of the cached activations and the labels.
    pub fn backprop(
        &self,
        cache: &Forward,
        y_enc: &DMatrix<f64>,
    ) -> (DMatrix<f64>, DMatrix<f64>) {
        // combined softmax + cross-entropy gradient at the output layer
        let sigma3 = &cache.a3 - y_enc;

        // the bias row carries no upstream error, drop it after the
        // elementwise product
        let z2 = add_bias_row(&cache.z2);
        let sigma2 = self
            .w2
            .tr_mul(&sigma3)
            .component_mul(&z2.map(self.config.activation.derivative()))
            .remove_row(0);

        let mut grad1 = &sigma2 * &cache.a1;
        let mut grad2 = &sigma3 * cache.a2.transpose();

        // derivative of (l2/2) * w^2, bias column excluded
        let l2 = self.config.l2;
        {
            let hidden = self.w1.ncols() - 1;
            let mut non_bias = grad1.columns_mut(1, hidden);
            non_bias += self.w1.columns(1, hidden) * l2;
        }
        {
            let output = self.w2.ncols() - 1;
            let mut non_bias = grad2.columns_mut(1, output);
            non_bias += self.w2.columns(1, output) * l2;
        }

        (grad1, grad2)
    }

    /// Train in place over `epochs` full passes and return `self`.
    ///
    /// Each epoch divides the already-decayed learning rate by
    /// `1 + decay_rate * epoch`, splits the sample range into `minibatches`
    /// contiguous partitions, and for each partition runs
    /// forward -> cost -> backprop -> update. The update subtracts
    /// `learning_rate * grad` plus the previous step's raw delta; the
    /// previous delta starts at zero and carries across epoch boundaries.
    /// There is no convergence check.
    pub fn fit(
        &mut self,
        x: &DMatrix<f64>,
        y: &[usize],
        print_progress: bool,
    ) -> Result<&mut Self, Error> {
        if x.ncols() != self.config.n_features {
            return Err(Error::InvalidConfig(
                "sample matrix width does not match n_features",
            ));
        }
        if x.nrows() != y.len() {
            return Err(Error::InvalidConfig(
                "sample matrix height does not match the label count",
            ));
        }

        let y_enc = encode_labels(y, self.config.n_output)?;

        let mut prev_step1 = DMatrix::zeros(self.w1.nrows(), self.w1.ncols());
        let mut prev_step2 = DMatrix::zeros(self.w2.nrows(), self.w2.ncols());

        let style = indicatif::ProgressStyle::with_template(
            "[{elapsed:.green}] [{wide_bar:.cyan/red}] {pos:.red}/{len:.green} ({eta})",
        )
        .unwrap()
        .progress_chars("=> ");

        if print_progress {
            println!(
                "Starting training:\n  epochs: {:>3}\n  minibatches: {}\n  examples: {}",
                self.config.epochs,
                self.config.minibatches,
                y.len()
            );
        }

        for epoch in 0..self.config.epochs {
            let start = Instant::now();

            // compounds: every epoch divides the rate that previous epochs
            // already shrank
            self.learning_rate /= 1.0 + self.config.decay_rate * epoch as f64;

            let partitions = split_indices(y.len(), self.config.minibatches);
            let bar = if print_progress {
                indicatif::ProgressBar::new(partitions.len() as u64).with_style(style.clone())
            } else {
                indicatif::ProgressBar::hidden()
            };

            for range in partitions {
                let batch = x.rows(range.start, range.len()).into_owned();
                let targets = y_enc.columns(range.start, range.len()).into_owned();

                let cache = self.forward(&batch);
                let cost = self.cost(&targets, &cache.a3);
                self.costs.push(cost);

                let (grad1, grad2) = self.backprop(&cache, &targets);

                let step1 = grad1 * self.learning_rate;
                let step2 = grad2 * self.learning_rate;

                // the previous raw step rides along unscaled, with no
                // separate momentum coefficient
                self.w1 -= &step1 + &prev_step1;
                self.w2 -= &step2 + &prev_step2;

                prev_step1 = step1;
                prev_step2 = step2;

                bar.inc(1);
            }
            bar.finish_and_clear();

            if print_progress {
                println!(
                    "epoch {:>3}: loss: {:#.10}  training accuracy: {:#.3}%  time: {:#?}",
                    epoch + 1,
                    self.costs.last().copied().unwrap_or(f64::NAN),
                    self.accuracy(x, y),
                    start.elapsed()
                );
            }
        }

        Ok(self)
    }

    /// Predicted class index per input row: argmax over each softmax
    /// output column.
    pub fn predict(&self, x: &DMatrix<f64>) -> Vec<usize> {
        let Forward { a3, .. } = self.forward(x);

        (0..a3.ncols())
            .into_par_iter()
            .map(|sample| {
                a3.column(sample)
                    .iter()
                    .enumerate()
                    .max_by(|(_, a), (_, b)| a.total_cmp(b))
                    .unwrap()
                    .0
            })
            .collect()
    }

    /// Percentage of correctly classified samples, in [0, 100]. Runs a
    /// fresh full forward pass every call.
    pub fn accuracy(&self, x: &DMatrix<f64>, y: &[usize]) -> f64 {
        let predictions = self.predict(x);
        let mismatches = predictions.iter().zip(y).filter(|(p, t)| p != t).count();

        100.0 * (1.0 - mismatches as f64 / y.len() as f64)
    }
}

/// One-hot encode integer labels into a (classes x samples) matrix.
pub fn encode_labels(y: &[usize], classes: usize) -> Result<DMatrix<f64>, Error> {
    let mut onehot = DMatrix::zeros(classes, y.len());

    for (sample, &label) in y.iter().enumerate() {
        if label >= classes {
            return Err(Error::InvalidLabel { label, classes });
        }
        onehot[(label, sample)] = 1.0;
    }

    Ok(onehot)
}

/// Column-wise softmax with the max-subtraction stability trick: the
/// column maximum is subtracted before exponentiating, so uniformly huge
/// scores normalize instead of overflowing.
pub fn softmax(z: &DMatrix<f64>) -> DMatrix<f64> {
    let mut out = z.clone();

    for mut column in out.column_iter_mut() {
        let max = column.max();
        column.apply(|v| *v = (*v - max).exp());
        let sum = column.sum();
        column.apply(|v| *v /= sum);
    }

    out
}

/// Prepend a constant-1 bias column: (m x n) -> (m x n+1).
fn add_bias_column(x: &DMatrix<f64>) -> DMatrix<f64> {
    let mut out = DMatrix::from_element(x.nrows(), x.ncols() + 1, 1.0);
    out.columns_mut(1, x.ncols()).copy_from(x);
    out
}

/// Prepend a constant-1 bias row: (m x n) -> (m+1 x n).
fn add_bias_row(x: &DMatrix<f64>) -> DMatrix<f64> {
    let mut out = DMatrix::from_element(x.nrows() + 1, x.ncols(), 1.0);
    out.rows_mut(1, x.nrows()).copy_from(x);
    out
}

/// Contiguous index partitions; the first `n % parts` partitions get one
/// extra sample.
fn split_indices(n: usize, parts: usize) -> Vec<Range<usize>> {
    let base = n / parts;
    let extra = n % parts;

    let mut ranges = Vec::with_capacity(parts);
    let mut start = 0;
    for i in 0..parts {
        let len = base + usize::from(i < extra);
        ranges.push(start..start + len);
        start += len;
    }

    ranges
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{Activation, NetworkConfig};
    use rand::{rngs::StdRng, SeedableRng};

    fn rng(seed: u64) -> StdRng {
        StdRng::seed_from_u64(seed)
    }

    /// Eight points in two well separated clusters, one per class.
    fn two_blobs() -> (DMatrix<f64>, Vec<usize>) {
        let rows: [[f64; 2]; 8] = [
            [-1.2, -0.8],
            [-0.8, -1.2],
            [-1.0, -1.0],
            [-1.1, -0.9],
            [1.2, 0.8],
            [0.8, 1.2],
            [1.0, 1.0],
            [1.1, 0.9],
        ];
        let x = DMatrix::from_fn(8, 2, |i, j| rows[i][j]);
        let y = vec![0, 0, 0, 0, 1, 1, 1, 1];

        (x, y)
    }

    #[test]
    fn weight_and_output_shapes() {
        let config = NetworkConfig {
            n_hidden: 5,
            ..NetworkConfig::new(3, 4)
        };
        let net = Network::new(config, &mut rng(7)).unwrap();

        assert_eq!(net.w1.shape(), (5, 5));
        assert_eq!(net.w2.shape(), (3, 6));

        let x = DMatrix::from_fn(9, 4, |i, j| (i * 4 + j) as f64 / 10.0 - 1.0);
        let out = net.forward(&x);

        assert_eq!(out.a1.shape(), (9, 5));
        assert_eq!(out.z2.shape(), (5, 9));
        assert_eq!(out.a2.shape(), (6, 9));
        assert_eq!(out.a3.shape(), (3, 9));

        for column in out.a3.column_iter() {
            assert!((column.sum() - 1.0).abs() < 1e-12);
            assert!(column.iter().all(|p| (0.0..=1.0).contains(p)));
        }
    }

    #[test]
    fn one_hot_encoding() {
        let onehot = encode_labels(&[0, 2, 1], 3).unwrap();

        #[rustfmt::skip]
        let expected = DMatrix::from_column_slice(3, 3, &[
            1.0, 0.0, 0.0,
            0.0, 0.0, 1.0,
            0.0, 1.0, 0.0,
        ]);
        assert_eq!(onehot, expected);
    }

    #[test]
    fn out_of_range_label_is_a_hard_error() {
        assert_eq!(
            encode_labels(&[0, 3], 3).unwrap_err(),
            Error::InvalidLabel { label: 3, classes: 3 }
        );
    }

    #[test]
    fn softmax_survives_huge_scores() {
        let z = DMatrix::from_element(3, 1, 1000.0);
        let p = softmax(&z);

        assert!(p.iter().all(|v| v.is_finite()));
        for v in p.iter() {
            assert!((v - 1.0 / 3.0).abs() < 1e-12);
        }
    }

    #[test]
    fn array_split_partition_sizes() {
        assert_eq!(split_indices(10, 3), vec![0..4, 4..7, 7..10]);
        assert_eq!(split_indices(8, 1), vec![0..8]);
        assert_eq!(split_indices(2, 4), vec![0..1, 1..2, 2..2, 2..2]);
    }

    #[test]
    fn backprop_matches_finite_differences() {
        // single sample, so the batch averaging of the cross-entropy term
        // cancels and the analytic gradient is directly comparable
        let config = NetworkConfig {
            n_hidden: 4,
            l2: 0.1,
            activation: Activation::Sigmoid,
            ..NetworkConfig::new(2, 3)
        };
        let mut net = Network::new(config, &mut rng(42)).unwrap();

        let x = DMatrix::from_row_slice(1, 3, &[0.3, -0.6, 0.9]);
        let y_enc = encode_labels(&[1], 2).unwrap();

        let cache = net.forward(&x);
        let (grad1, grad2) = net.backprop(&cache, &y_enc);

        let h = 1e-5;
        let check = |net: &mut Network, entry: (usize, usize), first_layer: bool| {
            let original = if first_layer {
                net.w1[entry]
            } else {
                net.w2[entry]
            };

            let mut cost_at = |net: &mut Network, value: f64| {
                if first_layer {
                    net.w1[entry] = value;
                } else {
                    net.w2[entry] = value;
                }
                let cache = net.forward(&x);
                net.cost(&y_enc, &cache.a3)
            };

            let plus = cost_at(net, original + h);
            let minus = cost_at(net, original - h);
            cost_at(net, original);

            let numeric = (plus - minus) / (2.0 * h);
            let analytic = if first_layer {
                grad1[entry]
            } else {
                grad2[entry]
            };

            assert!(
                (numeric - analytic).abs() < 1e-6,
                "gradient mismatch at {entry:?}: numeric {numeric}, analytic {analytic}"
            );
        };

        for entry in [(0, 0), (1, 2), (3, 3)] {
            check(&mut net, entry, true);
        }
        for entry in [(0, 0), (1, 4)] {
            check(&mut net, entry, false);
        }
    }

    #[test]
    fn training_cost_decreases_on_separable_data() {
        let (x, y) = two_blobs();
        let config = NetworkConfig {
            n_hidden: 8,
            epochs: 60,
            learning_rate: 0.05,
            minibatches: 2,
            activation: Activation::Tanh,
            ..NetworkConfig::new(2, 2)
        };
        let mut net = Network::new(config, &mut rng(3)).unwrap();
        net.fit(&x, &y, false).unwrap();

        let per_epoch = 2;
        assert_eq!(net.costs.len(), 60 * per_epoch);

        let first: f64 = net.costs[..per_epoch].iter().sum::<f64>() / per_epoch as f64;
        let last: f64 =
            net.costs[net.costs.len() - per_epoch..].iter().sum::<f64>() / per_epoch as f64;

        assert!(
            last < first,
            "average cost did not decrease: {first} -> {last}"
        );
    }

    #[test]
    fn separable_two_class_set_reaches_full_accuracy() {
        let (x, y) = two_blobs();
        let config = NetworkConfig {
            n_hidden: 8,
            epochs: 800,
            learning_rate: 0.02,
            activation: Activation::Tanh,
            ..NetworkConfig::new(2, 2)
        };
        let mut net = Network::new(config, &mut rng(11)).unwrap();
        net.fit(&x, &y, false).unwrap();

        assert_eq!(net.accuracy(&x, &y), 100.0);
    }

    #[test]
    fn accuracy_matches_predictions() {
        // 8 samples keeps every intermediate fraction exactly representable
        let (x, y) = two_blobs();
        let net = Network::new(NetworkConfig::new(2, 2), &mut rng(5)).unwrap();

        let predictions = net.predict(&x);
        let matches = predictions.iter().zip(&y).filter(|(p, t)| p == t).count();

        assert_eq!(
            net.accuracy(&x, &y),
            100.0 * matches as f64 / y.len() as f64
        );
    }

    #[test]
    fn learning_rate_decay_compounds_across_epochs() {
        let (x, y) = two_blobs();
        let config = NetworkConfig {
            epochs: 3,
            learning_rate: 1e-9,
            decay_rate: 1.0,
            ..NetworkConfig::new(2, 2)
        };
        let mut net = Network::new(config, &mut rng(1)).unwrap();
        net.fit(&x, &y, false).unwrap();

        // divided by 1, then 2, then 3
        assert!((net.learning_rate - 1e-9 / 6.0).abs() < 1e-20);
    }

    #[test]
    fn fit_rejects_mismatched_shapes() {
        let (x, y) = two_blobs();
        let mut net = Network::new(NetworkConfig::new(2, 3), &mut rng(1)).unwrap();
        assert!(matches!(
            net.fit(&x, &y, false),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn zero_minibatches_is_rejected() {
        let config = NetworkConfig {
            minibatches: 0,
            ..NetworkConfig::new(2, 2)
        };
        assert!(matches!(
            Network::new(config, &mut rng(1)),
            Err(Error::InvalidConfig(_))
        ));
    }
}
