use log::trace;
use serde::{Deserialize, Serialize};

/// Where a piece of actor state lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Device {
    /// Host memory, where optimizer state is pinned.
    Host,
    /// Accelerator memory, where parameters and gradients are kept.
    Accelerator,
}

/// A value tagged with the memory it resides in.
///
/// Crossing devices only happens through [`OnDevice::to`], so every transfer in the code base is
/// explicit and visible at the call site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OnDevice<T> {
    device: Device,
    value: T,
}

impl<T> OnDevice<T> {
    pub fn new(device: Device, value: T) -> Self {
        Self { device, value }
    }

    pub fn host(value: T) -> Self {
        Self::new(Device::Host, value)
    }

    pub fn accelerator(value: T) -> Self {
        Self::new(Device::Accelerator, value)
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    pub fn into_inner(self) -> T {
        self.value
    }

    /// Transfers the value to `device`.
    pub fn to(self, device: Device) -> Self {
        if self.device != device {
            trace!(from:? = self.device, to:? = device; "moving tensors");
        }

        Self {
            device,
            value: self.value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_retags() {
        let on_acc = OnDevice::accelerator(3);
        let on_host = on_acc.to(Device::Host);

        assert_eq!(on_host.device(), Device::Host);
        assert_eq!(*on_host.get(), 3);
        assert_eq!(on_host.to(Device::Accelerator).device(), Device::Accelerator);
    }
}
