//! The pipeline actors: a generic [`ParameterActor`] specialised by a [`Stage`] into the
//! embedding head/tail and the reversible blocks, plus the typed handles used to drive them.

mod embedding;
mod handle;
mod parameter;
mod reversible;
mod state;

pub use embedding::{
    DebedForward, DebedGrad, EmbedForward, EmbedGrad, Embedding, EmbeddingActor,
};
pub use handle::{ActorHandle, EmbeddingHandle, ReversibleHandle};
pub use parameter::{
    GetGradAccum, GetGradCount, GetParams, GetStep, Init, Load, NumParams, ParameterActor,
    ResetGradients, Save, Stage, Step,
};
pub use reversible::{Backward, Forward, ReversibleBlock, ReversibleLayerActor};
pub use state::ActorState;
