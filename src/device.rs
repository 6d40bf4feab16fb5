/// Explicit device selection for model replicas
use candle_core::Device;

/// Ordered set of devices a run is allowed to use.
///
/// The first device is the primary: it owns the canonical model, the optimizer
/// state and every checkpoint. Additional devices only host replicas.
#[derive(Debug, Clone)]
pub struct DeviceContext {
    devices: Vec<Device>,
}

impl DeviceContext {
    /// Single CPU device
    pub fn cpu() -> Self {
        Self {
            devices: vec![Device::Cpu],
        }
    }

    /// Build a context from explicit devices; at least one is required.
    pub fn new(devices: Vec<Device>) -> crate::Result<Self> {
        if devices.is_empty() {
            return Err(crate::FcnError::Config(
                "at least one device is required".to_string(),
            ));
        }
        Ok(Self { devices })
    }

    /// Resolve CUDA ordinals, falling back to the CPU when CUDA is unavailable.
    pub fn from_ordinals(ordinals: &[usize]) -> crate::Result<Self> {
        if ordinals.is_empty() {
            return Err(crate::FcnError::Config(
                "at least one device id is required".to_string(),
            ));
        }

        if !candle_core::utils::cuda_is_available() {
            log::warn!("CUDA not available, running on CPU");
            return Ok(Self::cpu());
        }

        let devices = ordinals
            .iter()
            .map(|&ordinal| Device::new_cuda(ordinal))
            .collect::<candle_core::Result<Vec<_>>>()?;
        Self::new(devices)
    }

    pub fn primary(&self) -> &Device {
        &self.devices[0]
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Seed every device RNG that supports it.
    ///
    /// Returns `false` when at least one device kept an unseeded RNG; the CPU
    /// device never accepts a seed.
    pub fn set_seed(&self, seed: u64) -> bool {
        let mut all_seeded = true;
        for device in &self.devices {
            if let Err(e) = device.set_seed(seed) {
                log::warn!("Device {:?} does not accept a seed: {}", device, e);
                all_seeded = false;
            }
        }
        all_seeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_context_rejected() {
        assert!(DeviceContext::new(Vec::new()).is_err());
        assert!(DeviceContext::from_ordinals(&[]).is_err());
    }

    #[test]
    fn test_primary_is_first() -> crate::Result<()> {
        let ctx = DeviceContext::new(vec![Device::Cpu, Device::Cpu])?;
        assert_eq!(ctx.len(), 2);
        assert!(ctx.primary().is_cpu());
        Ok(())
    }

    #[test]
    fn test_cpu_seed_is_reported() {
        assert!(!DeviceContext::cpu().set_seed(1337));
    }
}
