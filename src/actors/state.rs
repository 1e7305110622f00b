use serde::{Deserialize, Serialize};

use crate::{
    error::Result,
    optimization::{OptState, Optimizer},
    params::{Device, OnDevice, TensorTree},
};

/// Everything an actor owns: parameters, optimizer state, the gradient accumulator and counters.
///
/// Parameters and the accumulator live on the accelerator, optimizer state on the host. Every
/// mutating method computes the new trees first and only then replaces the old ones, so a failed
/// call leaves the state untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActorState {
    params: OnDevice<TensorTree>,
    opt_state: OnDevice<OptState>,
    grad_accum: OnDevice<TensorTree>,
    grad_count: u32,
    rng: u64,
    step: u64,
}

impl ActorState {
    /// Builds the initial state around freshly sampled `params`.
    ///
    /// # Arguments
    /// * `params` - The initial parameters.
    /// * `optimizer` - Used to create the optimizer state, which is placed on the host.
    /// * `rng` - The key left over after parameter sampling.
    pub fn new(params: TensorTree, optimizer: &dyn Optimizer, rng: u64) -> Self {
        let opt_state = OnDevice::host(optimizer.init(&params));
        let grad_accum = OnDevice::accelerator(params.zeros_like());

        Self {
            params: OnDevice::accelerator(params),
            opt_state,
            grad_accum,
            grad_count: 0,
            rng,
            step: 0,
        }
    }

    pub fn params(&self) -> &TensorTree {
        self.params.get()
    }

    pub fn grad_accum(&self) -> &TensorTree {
        self.grad_accum.get()
    }

    pub fn opt_state(&self) -> &OptState {
        self.opt_state.get()
    }

    pub fn grad_count(&self) -> u32 {
        self.grad_count
    }

    pub fn step_count(&self) -> u64 {
        self.step
    }

    pub fn rng(&self) -> u64 {
        self.rng
    }

    /// Where the parameters, optimizer state and accumulator currently reside.
    pub fn placement(&self) -> (Device, Device, Device) {
        (
            self.params.device(),
            self.opt_state.device(),
            self.grad_accum.device(),
        )
    }

    /// Adds one gradient contribution to the accumulator and counts it.
    ///
    /// `grads` may cover a subset of the parameters, missing tensors contribute zero.
    pub fn accumulate(&mut self, grads: &TensorTree) -> Result<()> {
        let grad_accum = self.grad_accum.get().add_partial(grads)?;

        self.grad_accum = OnDevice::accelerator(grad_accum);
        self.grad_count += 1;
        Ok(())
    }

    /// Applies the averaged accumulated gradient with `optimizer`.
    ///
    /// The accumulator and parameters are moved to the host to meet the optimizer state, the
    /// updated parameters are moved back to the accelerator and the accumulator restarts at zero.
    pub fn step(&mut self, optimizer: &dyn Optimizer) -> Result<()> {
        let count = self.grad_count.max(1) as f32;

        let grad = self.grad_accum.clone().to(Device::Host);
        let grad = grad.get().scale(1. / count);
        let params = self.params.clone().to(Device::Host);

        let (delta, opt_state) = optimizer.update(&grad, self.opt_state.get())?;
        let params = OnDevice::host(params.get().add(&delta)?).to(Device::Accelerator);
        let grad_accum = OnDevice::accelerator(params.get().zeros_like());

        self.params = params;
        self.opt_state = OnDevice::host(opt_state);
        self.grad_accum = grad_accum;
        self.grad_count = 0;
        self.step += 1;
        Ok(())
    }

    /// Drops whatever was accumulated since the last step.
    pub fn reset_gradients(&mut self) {
        self.grad_accum = OnDevice::accelerator(self.params.get().zeros_like());
        self.grad_count = 0;
    }

    /// Checks that the accumulator and every optimizer slot share the parameters' structure.
    pub fn ensure_consistent(&self) -> Result<()> {
        let params = self.params.get();
        params.ensure_same_structure(self.grad_accum.get(), "grad_accum")?;
        self.opt_state.get().ensure_matches(params)
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;
    use crate::optimization::{Adam, GradientDescent};

    fn params() -> TensorTree {
        let mut params = TensorTree::new();
        params.insert("w", array![[1., 2.], [3., 4.]]);
        params.insert("b", array![0., 0.]);
        params
    }

    #[test]
    fn new_state_is_placed_and_empty() {
        let state = ActorState::new(params(), &Adam::new(1e-3, 0.9, 0.99, 1e-8), 7);

        assert_eq!(
            state.placement(),
            (Device::Accelerator, Device::Host, Device::Accelerator)
        );
        assert_eq!(state.grad_count(), 0);
        assert_eq!(state.step_count(), 0);
        assert_eq!(state.rng(), 7);
        assert!(state.grad_accum().is_zero());
        tokio_test::assert_ok!(state.ensure_consistent());
    }

    #[test]
    fn step_averages_and_resets() {
        let optimizer = GradientDescent::new(1.);
        let mut state = ActorState::new(params(), &optimizer, 0);

        let mut grads = TensorTree::new();
        grads.insert("b", array![1., 2.]);
        state.accumulate(&grads).unwrap();

        grads.insert("b", array![3., 4.]);
        state.accumulate(&grads).unwrap();
        assert_eq!(state.grad_count(), 2);

        state.step(&optimizer).unwrap();

        assert_eq!(state.params().view1("b").unwrap(), array![-2., -3.]);
        assert_eq!(state.params().get("w").unwrap(), params().get("w").unwrap());
        assert_eq!(state.grad_count(), 0);
        assert!(state.grad_accum().is_zero());
        assert_eq!(state.step_count(), 1);
        assert_eq!(
            state.placement(),
            (Device::Accelerator, Device::Host, Device::Accelerator)
        );
        tokio_test::assert_ok!(state.ensure_consistent());
    }

    #[test]
    fn failed_accumulation_leaves_state_untouched() {
        let optimizer = GradientDescent::new(1.);
        let mut state = ActorState::new(params(), &optimizer, 0);
        let before = state.clone();

        let mut grads = TensorTree::new();
        grads.insert("b", array![1., 2., 3.]);
        tokio_test::assert_err!(state.accumulate(&grads));

        assert_eq!(state, before);
    }
}
