use std::collections::BTreeMap;

use ndarray::{Array, ArrayD, ArrayView1, ArrayView2, Dimension, Ix1, Ix2, Zip};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SwarmError};

/// A named collection of tensors, keyed by `/`-separated paths such as `f/ln/scale`.
///
/// Parameters, gradient accumulators and optimizer slots are all tensor trees. Two trees share
/// a *structure* when they hold the same keys with the same shapes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TensorTree {
    leaves: BTreeMap<String, ArrayD<f32>>,
}

impl TensorTree {
    /// Creates an empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts (or replaces) the tensor stored under `key`.
    pub fn insert<D: Dimension>(&mut self, key: impl Into<String>, value: Array<f32, D>) {
        self.leaves.insert(key.into(), value.into_dyn());
    }

    /// Returns the tensor stored under `key`.
    ///
    /// # Errors
    /// An `Initialization` error if the key does not exist, this only happens when a tree built
    /// for one layout is read with another.
    pub fn get(&self, key: &str) -> Result<&ArrayD<f32>> {
        self.leaves
            .get(key)
            .ok_or_else(|| SwarmError::Initialization(format!("missing tensor `{key}`")))
    }

    pub fn view1(&self, key: &str) -> Result<ArrayView1<'_, f32>> {
        let value = self.get(key)?;
        value
            .view()
            .into_dimensionality::<Ix1>()
            .map_err(|_| SwarmError::shape(key, value.shape(), &[value.len()]))
    }

    pub fn view2(&self, key: &str) -> Result<ArrayView2<'_, f32>> {
        let value = self.get(key)?;
        value
            .view()
            .into_dimensionality::<Ix2>()
            .map_err(|_| SwarmError::shape(key, value.shape(), &[0, 0]))
    }

    /// Number of tensors in the tree.
    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    /// Total number of scalars across all tensors.
    pub fn num_params(&self) -> usize {
        self.leaves.values().map(|leaf| leaf.len()).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ArrayD<f32>)> {
        self.leaves.iter().map(|(key, value)| (key.as_str(), value))
    }

    /// The `(key, shape)` pairs of this tree, in key order.
    pub fn shapes(&self) -> Vec<(&str, &[usize])> {
        self.leaves
            .iter()
            .map(|(key, value)| (key.as_str(), value.shape()))
            .collect()
    }

    /// Whether both trees hold the same keys with the same shapes.
    pub fn same_structure(&self, other: &TensorTree) -> bool {
        self.shapes() == other.shapes()
    }

    /// Checks that `other` has this tree's structure.
    ///
    /// # Errors
    /// A `ShapeMismatch` naming the first offending key, or an `Initialization` error if the
    /// key sets differ.
    pub fn ensure_same_structure(&self, other: &TensorTree, what: &str) -> Result<()> {
        if self.leaves.len() != other.leaves.len()
            || self.leaves.keys().zip(other.leaves.keys()).any(|(a, b)| a != b)
        {
            let ours: Vec<_> = self.leaves.keys().collect();
            let theirs: Vec<_> = other.leaves.keys().collect();
            return Err(SwarmError::Initialization(format!(
                "{what} has keys {theirs:?}, expected {ours:?}"
            )));
        }

        for ((key, a), b) in self.leaves.iter().zip(other.leaves.values()) {
            if a.shape() != b.shape() {
                return Err(SwarmError::shape(
                    format!("{what}/{key}"),
                    b.shape(),
                    a.shape(),
                ));
            }
        }

        Ok(())
    }

    /// A tree with this structure and every element set to zero.
    pub fn zeros_like(&self) -> Self {
        let leaves = self
            .leaves
            .iter()
            .map(|(key, value)| (key.clone(), ArrayD::zeros(value.raw_dim())))
            .collect();

        Self { leaves }
    }

    /// Applies `f` element-wise.
    pub fn map(&self, f: impl Fn(f32) -> f32) -> Self {
        let leaves = self
            .leaves
            .iter()
            .map(|(key, value)| (key.clone(), value.mapv(&f)))
            .collect();

        Self { leaves }
    }

    /// Combines two trees of the same structure element-wise.
    pub fn zip_with(&self, other: &TensorTree, f: impl Fn(f32, f32) -> f32) -> Result<Self> {
        self.ensure_same_structure(other, "tree")?;

        let leaves = self
            .leaves
            .iter()
            .zip(other.leaves.values())
            .map(|((key, a), b)| {
                let mut out = a.clone();
                Zip::from(&mut out).and(b).for_each(|o, &b| *o = f(*o, b));
                (key.clone(), out)
            })
            .collect();

        Ok(Self { leaves })
    }

    pub fn add(&self, other: &TensorTree) -> Result<Self> {
        self.zip_with(other, |a, b| a + b)
    }

    /// Adds `other` into a copy of this tree. `other` may cover only some of the keys, the rest
    /// are carried over unchanged.
    ///
    /// # Errors
    /// An `Initialization` error for a key this tree does not hold, a `ShapeMismatch` for a key
    /// whose shape differs.
    pub fn add_partial(&self, other: &TensorTree) -> Result<Self> {
        let mut out = self.clone();

        for (key, value) in &other.leaves {
            let leaf = out.leaves.get_mut(key).ok_or_else(|| {
                SwarmError::Initialization(format!("gradient for unknown tensor `{key}`"))
            })?;

            if leaf.shape() != value.shape() {
                return Err(SwarmError::shape(key.as_str(), value.shape(), leaf.shape()));
            }

            *leaf += value;
        }

        Ok(out)
    }

    pub fn scale(&self, factor: f32) -> Self {
        self.map(|x| x * factor)
    }

    /// Sum of squares of every element.
    pub fn sq_norm(&self) -> f32 {
        self.leaves
            .values()
            .map(|leaf| leaf.iter().map(|x| x * x).sum::<f32>())
            .sum()
    }

    pub fn is_zero(&self) -> bool {
        self.leaves.values().all(|leaf| leaf.iter().all(|&x| x == 0.))
    }

    /// Largest absolute element-wise difference between two trees of the same structure.
    pub fn max_abs_diff(&self, other: &TensorTree) -> Result<f32> {
        let diff = self.zip_with(other, |a, b| (a - b).abs())?;
        Ok(diff
            .leaves
            .values()
            .flat_map(|leaf| leaf.iter().copied())
            .fold(0., f32::max))
    }
}
