use serde::{Deserialize, Serialize};

use super::Optimizer;
use crate::{snapshot::Snapshot, NetErr, Result};

/// The hyperparameters of `Adam`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdamConfig {
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }
}

/// The moment estimates and bias correction terms of an `Adam` optimizer.
#[derive(Debug, Clone, PartialEq)]
pub struct AdamState {
    pub beta1_t: f32,
    pub beta2_t: f32,
    pub v: Box<[f32]>,
    pub s: Box<[f32]>,
}

#[derive(Debug)]
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    beta1_t: f32,
    beta2_t: f32,
    v: Box<[f32]>,
    s: Box<[f32]>,
    epsilon: f32,
}

impl Adam {
    /// Creates a new `Adam` optimizer.
    ///
    /// # Arguments
    /// * `len` - The amount of parameters this instance should hold.
    /// * `learning_rate` - The small coefficient that modulates the amount of training per update.
    /// * `config` - The `beta1`, `beta2` and `epsilon` hyperparameters.
    ///
    /// # Returns
    /// A new `Adam` instance.
    pub fn new(len: usize, learning_rate: f32, config: AdamConfig) -> Self {
        let AdamConfig {
            beta1,
            beta2,
            epsilon,
        } = config;

        Self {
            learning_rate,
            beta1,
            beta2,
            beta1_t: 1.,
            beta2_t: 1.,
            v: vec![0.; len].into_boxed_slice(),
            s: vec![0.; len].into_boxed_slice(),
            epsilon,
        }
    }

    /// The amount of updates taken so far, recovered from the bias correction term.
    pub fn steps(&self) -> usize {
        if self.beta1_t >= 1. {
            return 0;
        }

        (self.beta1_t.ln() / self.beta1.ln()).round() as usize
    }
}

impl Optimizer for Adam {
    fn update_params(&mut self, grad: &[f32], params: &mut [f32]) -> Result<()> {
        for (what, got) in [("gradient", grad.len()), ("parameters", params.len())] {
            if got != self.v.len() {
                return Err(NetErr::SizeMismatch {
                    what,
                    got,
                    expected: self.v.len(),
                });
            }
        }

        let Self {
            learning_rate: lr,
            beta1: b1,
            beta2: b2,
            epsilon: eps,
            ..
        } = *self;

        self.beta1_t *= b1;
        self.beta2_t *= b2;

        let step_size = lr / (1. - self.beta1_t);
        let bc2_sqrt = (1. - self.beta2_t).sqrt();

        params
            .iter_mut()
            .zip(grad)
            .zip(self.v.iter_mut())
            .zip(self.s.iter_mut())
            .for_each(|(((p, g), v), s)| {
                *v = b1 * *v + (1. - b1) * g;
                *s = b2 * *s + (1. - b2) * g.powi(2);
                *p -= step_size * *v / (s.sqrt() / bc2_sqrt + eps);
            });

        Ok(())
    }

    fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, learning_rate: f32) {
        self.learning_rate = learning_rate;
    }
}

/// The learning rate is left out, the training loop sets it before every epoch.
impl Snapshot for Adam {
    type State = AdamState;

    fn snapshot(&self) -> AdamState {
        AdamState {
            beta1_t: self.beta1_t,
            beta2_t: self.beta2_t,
            v: self.v.clone(),
            s: self.s.clone(),
        }
    }

    fn restore(&mut self, state: &AdamState) -> Result<()> {
        if state.v.len() != self.v.len() || state.s.len() != self.s.len() {
            return Err(NetErr::SizeMismatch {
                what: "optimizer state",
                got: state.v.len(),
                expected: self.v.len(),
            });
        }

        self.beta1_t = state.beta1_t;
        self.beta2_t = state.beta2_t;
        self.v.copy_from_slice(&state.v);
        self.s.copy_from_slice(&state.s);
        Ok(())
    }
}
