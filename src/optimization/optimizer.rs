use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    error::{Result, SwarmError},
    params::TensorTree,
};

/// Optimizer-internal state: named slot trees shaped like the parameters, and an update count.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptState {
    count: u64,
    slots: BTreeMap<String, TensorTree>,
}

impl OptState {
    pub fn new(slots: impl IntoIterator<Item = (String, TensorTree)>) -> Self {
        Self {
            count: 0,
            slots: slots.into_iter().collect(),
        }
    }

    /// How many updates produced this state.
    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn slot(&self, name: &str) -> Result<&TensorTree> {
        self.slots
            .get(name)
            .ok_or_else(|| SwarmError::Initialization(format!("missing optimizer slot `{name}`")))
    }

    pub fn slots(&self) -> impl Iterator<Item = (&str, &TensorTree)> {
        self.slots.iter().map(|(name, tree)| (name.as_str(), tree))
    }

    /// The state that follows this one, holding the given slots.
    pub fn next(&self, slots: impl IntoIterator<Item = (String, TensorTree)>) -> Self {
        Self {
            count: self.count + 1,
            slots: slots.into_iter().collect(),
        }
    }

    /// Checks that every slot shares the structure of `params`.
    pub fn ensure_matches(&self, params: &TensorTree) -> Result<()> {
        self.slots
            .iter()
            .try_for_each(|(name, slot)| params.ensure_same_structure(slot, name))
    }
}

/// Defines the strategy for turning an averaged gradient into a parameter update.
///
/// Implementations are pure: they never mutate their inputs and the same `(grad, state)` pair
/// always yields the same output.
pub trait Optimizer: Send + Sync {
    /// Creates the initial state for the given parameters.
    fn init(&self, params: &TensorTree) -> OptState;

    /// Computes the update for `grad`.
    ///
    /// # Returns
    /// The delta to add to the parameters and the next optimizer state.
    ///
    /// # Errors
    /// A `ShapeMismatch` if `grad` does not share the structure of the state's slots.
    fn update(&self, grad: &TensorTree, state: &OptState) -> Result<(TensorTree, OptState)>;
}

impl<O: Optimizer + ?Sized> Optimizer for Box<O> {
    fn init(&self, params: &TensorTree) -> OptState {
        (**self).init(params)
    }

    fn update(&self, grad: &TensorTree, state: &OptState) -> Result<(TensorTree, OptState)> {
        (**self).update(grad, state)
    }
}
