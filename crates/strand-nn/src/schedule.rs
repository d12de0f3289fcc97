// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of Strand — Licensed under AGPL-3.0-or-later.

//! Epoch-level learning-rate schedules.

use strand_tensor::{TensorError, TensorResult};

const PLATEAU_PATIENCE: u32 = 10;

/// Learning-rate policy, selected at construction. Every policy clamps its
/// result to at least `min_lr`.
#[derive(Clone, Debug)]
pub enum LrSchedule {
    /// Half-cosine decay from `base_lr` at epoch 0 to `min_lr` at
    /// `total_epochs`.
    Cosine {
        base_lr: f32,
        min_lr: f32,
        total_epochs: usize,
    },
    /// Linear ramp to `base_lr` over `warmup_steps`, then linear decay toward
    /// zero over the remaining horizon.
    WarmupLinear {
        base_lr: f32,
        min_lr: f32,
        warmup_steps: usize,
        total_steps: usize,
    },
    /// Halves the current rate after ten consecutive non-improving metric
    /// updates (lower metric is better), then resets its patience counter.
    Plateau {
        current_lr: f32,
        min_lr: f32,
        best_metric: Option<f32>,
        stale_updates: u32,
    },
    /// The rate never changes.
    Constant { base_lr: f32 },
}

impl LrSchedule {
    fn check_rates(base_lr: f32, min_lr: f32) -> TensorResult<()> {
        if !base_lr.is_finite() || base_lr <= 0.0 {
            return Err(TensorError::NonPositiveLearningRate { rate: base_lr });
        }
        if !min_lr.is_finite() || min_lr < 0.0 || min_lr > base_lr {
            return Err(TensorError::InvalidValue {
                label: "min_lr_must_sit_in_(0, base_lr]",
            });
        }
        Ok(())
    }

    pub fn cosine(base_lr: f32, min_lr: f32, total_epochs: usize) -> TensorResult<Self> {
        Self::check_rates(base_lr, min_lr)?;
        if total_epochs == 0 {
            return Err(TensorError::InvalidValue {
                label: "cosine_schedule_needs_a_horizon",
            });
        }
        Ok(Self::Cosine {
            base_lr,
            min_lr,
            total_epochs,
        })
    }

    pub fn warmup_linear(
        base_lr: f32,
        min_lr: f32,
        warmup_steps: usize,
        total_steps: usize,
    ) -> TensorResult<Self> {
        Self::check_rates(base_lr, min_lr)?;
        if warmup_steps == 0 || total_steps <= warmup_steps {
            return Err(TensorError::InvalidValue {
                label: "warmup_must_end_before_the_horizon",
            });
        }
        Ok(Self::WarmupLinear {
            base_lr,
            min_lr,
            warmup_steps,
            total_steps,
        })
    }

    pub fn plateau(base_lr: f32, min_lr: f32) -> TensorResult<Self> {
        Self::check_rates(base_lr, min_lr)?;
        Ok(Self::Plateau {
            current_lr: base_lr,
            min_lr,
            best_metric: None,
            stale_updates: 0,
        })
    }

    pub fn constant(base_lr: f32) -> TensorResult<Self> {
        if !base_lr.is_finite() || base_lr <= 0.0 {
            return Err(TensorError::NonPositiveLearningRate { rate: base_lr });
        }
        Ok(Self::Constant { base_lr })
    }

    /// Advances the schedule for `epoch` and returns the rate to push into
    /// the optimizer. The plateau policy consumes the validation metric
    /// (lower is better); the other policies ignore it.
    pub fn step(&mut self, epoch: usize, metric: Option<f32>) -> f32 {
        match self {
            Self::Cosine {
                base_lr,
                min_lr,
                total_epochs,
            } => {
                let progress = (epoch as f32 / *total_epochs as f32).min(1.0);
                let rate = *min_lr
                    + 0.5 * (*base_lr - *min_lr) * (1.0 + (std::f32::consts::PI * progress).cos());
                rate.max(*min_lr)
            }
            Self::WarmupLinear {
                base_lr,
                min_lr,
                warmup_steps,
                total_steps,
            } => {
                let rate = if epoch < *warmup_steps {
                    *base_lr * (epoch + 1) as f32 / *warmup_steps as f32
                } else if epoch >= *total_steps {
                    0.0
                } else {
                    let remaining = (*total_steps - *warmup_steps) as f32;
                    *base_lr * (1.0 - (epoch - *warmup_steps + 1) as f32 / remaining)
                };
                rate.max(*min_lr)
            }
            Self::Plateau {
                current_lr,
                min_lr,
                best_metric,
                stale_updates,
            } => {
                if let Some(value) = metric {
                    let improved = best_metric.map(|best| value < best).unwrap_or(true);
                    if improved {
                        *best_metric = Some(value);
                        *stale_updates = 0;
                    } else {
                        *stale_updates += 1;
                        if *stale_updates >= PLATEAU_PATIENCE {
                            *current_lr = (*current_lr * 0.5).max(*min_lr);
                            *stale_updates = 0;
                        }
                    }
                }
                (*current_lr).max(*min_lr)
            }
            Self::Constant { base_lr } => *base_lr,
        }
    }
}
