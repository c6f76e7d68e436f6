//! A from-scratch two-layer softmax classifier for the MNIST digits,
//! trained by minibatch gradient descent with manually derived gradients.
//! No autograd anywhere: the forward pass, cross-entropy cost and
//! backpropagation live in [`nn`], the IDX dataset loader in [`mnist`].

pub mod mnist;
pub mod nn;

use std::str::FromStr;

pub use nn::{Forward, Network};

/// Failures surfaced eagerly at construction or encoding time.
///
/// Numerical trouble (softmax overflow, `ln` of an exact zero) is
/// deliberately *not* caught; it propagates as `NaN` through the cost.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("unsupported activation {0:?}, available: relu, tanh, sigmoid")]
    UnsupportedActivation(String),

    #[error("unsupported metric {0:?}, available: Accuracy, Precision, Recall, AUC")]
    UnsupportedMetric(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("label {label} out of range for {classes} classes")]
    InvalidLabel { label: usize, classes: usize },
}

/// Elementwise nonlinearity applied to the hidden pre-activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Relu,
    Tanh,
    Sigmoid,
}

impl Activation {
    pub fn function(&self) -> fn(f64) -> f64 {
        match self {
            Activation::Relu => |z| z.max(0.),
            Activation::Tanh => f64::tanh,
            Activation::Sigmoid => |z| 1. / (1. + (-z).exp()),
        }
    }

    /// Derivative with respect to the pre-activation. relu' is 0 at 0.
    pub fn derivative(&self) -> fn(f64) -> f64 {
        match self {
            Activation::Relu => |z| if z > 0. { 1. } else { 0. },
            Activation::Tanh => |z| 1. - z.tanh().powi(2),
            Activation::Sigmoid => |z| {
                let s = 1. / (1. + (-z).exp());
                s * (1. - s)
            },
        }
    }
}

impl FromStr for Activation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "relu" => Ok(Activation::Relu),
            "tanh" => Ok(Activation::Tanh),
            "sigmoid" => Ok(Activation::Sigmoid),
            other => Err(Error::UnsupportedActivation(other.to_string())),
        }
    }
}

/// Evaluation metrics a caller may request. Membership is validated at
/// configuration time; only `Accuracy` is ever computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    Accuracy,
    Precision,
    Recall,
    Auc,
}

impl FromStr for Metric {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "Accuracy" => Ok(Metric::Accuracy),
            "Precision" => Ok(Metric::Precision),
            "Recall" => Ok(Metric::Recall),
            "AUC" => Ok(Metric::Auc),
            other => Err(Error::UnsupportedMetric(other.to_string())),
        }
    }
}

/// Immutable training configuration, validated before any weight exists.
///
/// `minibatches` is a partition *count*, not a batch size: the sample range
/// is split into that many contiguous chunks per epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkConfig {
    /// Output units, equal to the number of class labels.
    pub n_output: usize,
    /// Features per input sample.
    pub n_features: usize,
    pub n_hidden: usize,
    /// Lambda for the L2 penalty on non-bias weights.
    pub l2: f64,
    pub epochs: usize,
    pub learning_rate: f64,
    /// Shrinks the learning rate after each epoch, compounding.
    pub decay_rate: f64,
    pub minibatches: usize,
    /// Stored for bookkeeping only; the update rule is plain gradient
    /// descent regardless.
    pub optimizer: String,
    pub activation: Activation,
    pub metrics: Vec<Metric>,
}

impl NetworkConfig {
    pub fn new(n_output: usize, n_features: usize) -> Self {
        Self {
            n_output,
            n_features,
            n_hidden: 30,
            l2: 0.0,
            epochs: 500,
            learning_rate: 0.001,
            decay_rate: 0.0,
            minibatches: 1,
            optimizer: "Gradient Descent".to_string(),
            activation: Activation::Relu,
            metrics: vec![Metric::Accuracy],
        }
    }

    /// Parse an activation by name, rejecting unknown ones immediately
    /// instead of leaving the choice unset until the first forward pass.
    pub fn with_activation(mut self, name: &str) -> Result<Self, Error> {
        self.activation = name.parse()?;
        Ok(self)
    }

    pub fn with_metrics(mut self, names: &[&str]) -> Result<Self, Error> {
        self.metrics = names
            .iter()
            .map(|name| name.parse())
            .collect::<Result<_, _>>()?;
        Ok(self)
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.n_output == 0 {
            return Err(Error::InvalidConfig("n_output must be at least 1"));
        }
        if self.n_features == 0 {
            return Err(Error::InvalidConfig("n_features must be at least 1"));
        }
        if self.n_hidden == 0 {
            return Err(Error::InvalidConfig("n_hidden must be at least 1"));
        }
        if self.minibatches == 0 {
            return Err(Error::InvalidConfig("minibatches must be at least 1"));
        }
        Ok(())
    }
}
