//! Pipeline-parallel training of reversible residual networks on an actor runtime.
//!
//! Every slice of the model (the embedding head, each reversible stage) lives in its own actor
//! on its own arbiter and owns its parameters, gradient accumulator and optimizer state. The
//! [`Orchestrator`] pushes one batch at a time forward through the chain and back again. On the
//! way back each stage rebuilds its input from its output instead of caching activations.

pub mod actors;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod error;
pub mod nn;
pub mod optimization;
pub mod orchestra;
pub mod params;
pub mod wire;

pub use config::SwarmConfig;
pub use error::{Result, SwarmError};
pub use orchestra::{Orchestrator, PipelineHandle, StepReport};
