// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of Strand — Licensed under AGPL-3.0-or-later.

//! Neural building blocks for the Strand embedding refiner: attention-gated
//! graph layers, the InfoNCE contrastive objective, an Adam optimizer with
//! epoch-level learning-rate schedules, and parameter snapshot I/O.

pub mod gate;
pub mod io;
pub mod loss;
pub mod module;
pub mod optim;
pub mod schedule;
pub mod stack;

pub use gate::{AttentionGate, GateConfig};
pub use loss::InfoNceLoss;
pub use module::{Module, Parameter};
pub use optim::AdamOptimizer;
pub use schedule::LrSchedule;
pub use stack::RefinerStack;
