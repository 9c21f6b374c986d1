//! Few-shot adaptation step
//!
//! AdamW over the trainable variables of a [`ParamStore`], with optional
//! clipping of the global gradient norm. A non-finite loss stops the step
//! before any variable is updated.

use candle_core::backprop::GradStore;
use candle_core::{DType, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};

use crate::error::{GroundingError, Result};
use crate::loss::GroundingLoss;
use crate::params::ParamStore;

#[derive(Debug, Clone)]
pub struct TrainerConfig {
    pub learning_rate: f64,
    pub weight_decay: f64,
    /// Clip the global gradient norm to this value; 0 disables clipping
    pub max_norm: f64,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-4,
            weight_decay: 1e-4,
            max_norm: 0.0,
        }
    }
}

/// Host-side summary of one step
#[derive(Debug, Clone, Copy)]
pub struct StepStats {
    pub loss: f32,
    pub l1: f32,
    pub giou: f32,
    /// Global gradient norm before clipping, when clipping is enabled
    pub grad_norm: Option<f32>,
}

pub struct AdaptationTrainer {
    optimizer: AdamW,
    vars: Vec<Var>,
    max_norm: f64,
    step: usize,
}

impl AdaptationTrainer {
    /// Optimise the variables that are trainable in `store` right now
    pub fn new(store: &ParamStore, config: TrainerConfig) -> Result<Self> {
        let vars = store.trainable_vars();
        if vars.is_empty() {
            return Err(GroundingError::input("parameter store has no trainable variables"));
        }
        let params = ParamsAdamW {
            lr: config.learning_rate,
            weight_decay: config.weight_decay,
            ..Default::default()
        };
        let optimizer = AdamW::new(vars.clone(), params)?;
        tracing::info!(
            vars = vars.len(),
            lr = config.learning_rate,
            max_norm = config.max_norm,
            "created adaptation optimizer"
        );
        Ok(Self {
            optimizer,
            vars,
            max_norm: config.max_norm,
            step: 0,
        })
    }

    pub fn steps(&self) -> usize {
        self.step
    }

    /// Backpropagate `loss` and update the trainable variables
    pub fn step(&mut self, loss: &GroundingLoss) -> Result<StepStats> {
        let value = loss.total_value()?;
        if !value.is_finite() {
            tracing::error!(step = self.step, loss = value, "loss is not finite");
            return Err(GroundingError::NonFiniteLoss { value });
        }
        let (l1, giou) = loss.components()?;

        let mut grads = loss.total.backward()?;
        let grad_norm = if self.max_norm > 0.0 {
            Some(clip_grad_norm(&mut grads, &self.vars, self.max_norm)?)
        } else {
            None
        };
        self.optimizer.step(&grads)?;
        self.step += 1;

        tracing::debug!(step = self.step, loss = value, l1, giou, ?grad_norm, "adaptation step");
        Ok(StepStats {
            loss: value,
            l1,
            giou,
            grad_norm,
        })
    }
}

/// Scale the gradients of `vars` so their global L2 norm is at most
/// `max_norm`; returns the norm before scaling
pub fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> Result<f32> {
    let mut sum_sq = 0f32;
    for var in vars {
        if let Some(grad) = grads.get(var.as_tensor()) {
            sum_sq += grad.to_dtype(DType::F32)?.sqr()?.sum_all()?.to_scalar::<f32>()?;
        }
    }
    let total_norm = sum_sq.sqrt();

    let scale = max_norm / (total_norm as f64 + 1e-6);
    if scale < 1.0 {
        for var in vars {
            if let Some(grad) = grads.remove(var.as_tensor()) {
                grads.insert(var.as_tensor(), (grad * scale)?);
            }
        }
    }
    Ok(total_norm)
}
