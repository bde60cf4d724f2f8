//! Synthetic training loop driving the controller.
//!
//! Each step runs a forward pass over a stack of layers, saving every layer
//! input (and, every `reuse_every` layers, saving it twice, as a residual
//! branch would) plus a parameter tensor that is registered as excluded.
//! The backward pass restores everything in reverse order and measures the
//! reconstruction error against the original activations.

use serde::Serialize;
use tracing::{debug, info};

use crate::cache::controller::{CacheController, CacheError, SavedActivation};
use crate::config::SimulationConfig;
use crate::tensor::Tensor;

/// Outcome of one simulated training step.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StepReport {
    pub step: u64,
    pub saves: usize,
    pub restores: usize,
    /// Largest absolute reconstruction error over all compressed saves.
    pub max_abs_error: f32,
    /// Entries still cached after the backward pass.
    pub leftover_entries: usize,
}

/// Drives a [`CacheController`] through synthetic steps.
pub struct Simulation {
    config: SimulationConfig,
    weight: Tensor,
}

impl Simulation {
    pub fn new(config: SimulationConfig) -> Self {
        let weight = Tensor::from_fn(vec![config.channels, config.channels, 3, 3], |i| {
            ((i % 17) as f32 - 8.0) * 0.01
        })
        .with_requires_grad(true);
        Self { config, weight }
    }

    /// Register the parameters and run all configured steps.
    pub async fn run(&self, cache: &mut CacheController) -> Result<Vec<StepReport>, CacheError> {
        cache.register_excluded([self.weight.address()]);
        let mut reports = Vec::with_capacity(self.config.steps);
        for _ in 0..self.config.steps {
            reports.push(self.run_step(cache).await?);
        }
        Ok(reports)
    }

    /// One forward/backward pass followed by the step boundary.
    pub async fn run_step(&self, cache: &mut CacheController) -> Result<StepReport, CacheError> {
        let step = cache.step();
        let shape = self.config.activation_shape();
        let seed = step as f32;

        let mut x = Tensor::from_fn(shape.clone(), |i| ((i as f32) * 0.071 + seed).sin())
            .with_requires_grad(true);
        let mut saved: Vec<(SavedActivation, Tensor)> = Vec::new();

        for layer in 0..self.config.layers {
            saved.push((cache.save(x.clone())?, x.clone()));
            if self.config.reuse_every > 0 && layer % self.config.reuse_every == 0 {
                saved.push((cache.save(x.clone())?, x.clone()));
            }
            saved.push((cache.save(self.weight.clone())?, self.weight.clone()));

            let bias = layer as f32 * 0.05;
            let input = x.data();
            x = Tensor::from_fn(shape.clone(), |i| (input[i] * 0.9 + bias).tanh())
                .with_requires_grad(true);
            debug!(step, layer, "Forward layer");
        }

        let saves = saved.len();
        let mut max_abs_error = 0.0f32;
        while let Some((handle, original)) = saved.pop() {
            let passthrough = handle.is_passthrough();
            let restored = cache.restore(handle).await?;
            if !passthrough {
                let err = restored.max_abs_diff(&original).unwrap_or(f32::INFINITY);
                max_abs_error = max_abs_error.max(err);
            }
        }

        let report = StepReport {
            step,
            saves,
            restores: saves,
            max_abs_error,
            leftover_entries: cache.len(),
        };
        info!(
            step,
            saves,
            max_abs_error,
            leftover = report.leftover_entries,
            "Simulated step"
        );
        cache.end_step();
        Ok(report)
    }
}
