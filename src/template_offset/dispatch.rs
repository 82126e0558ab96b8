//! Host versus device dispatch.
//!
//! Offload is a performance path only: every operator produces the same
//! numbers on either side. A call goes to the device when
//!
//! ```text
//! use_accel && !device_is_host && (built with the "offload" feature)
//! ```
//!
//! and otherwise runs on the host without reporting anything to the caller.

use super::types::KernelConfig;
use crate::accel::{DeviceId, DeviceManager};

/// Whether the device code path was compiled in.
pub const OFFLOAD_BUILT: bool = cfg!(feature = "offload");

static HOST_DEVICE: DeviceManager = DeviceManager::host();

/// Per-call execution context: the device to offload to and kernel settings.
#[derive(Clone, Copy, Debug)]
pub struct ExecContext<'a> {
    pub device: &'a DeviceManager,
    pub config: KernelConfig,
}

impl<'a> ExecContext<'a> {
    pub fn new(device: &'a DeviceManager) -> Self {
        Self {
            device,
            config: KernelConfig::default(),
        }
    }

    pub fn with_config(device: &'a DeviceManager, config: KernelConfig) -> Self {
        Self { device, config }
    }
}

impl ExecContext<'static> {
    /// Context for host-only execution.
    pub fn host() -> Self {
        Self::new(&HOST_DEVICE)
    }
}

/// Where a call executes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dispatch {
    Host,
    Device(DeviceId),
}

impl Dispatch {
    pub fn select(use_accel: bool, device: &DeviceManager) -> Self {
        Self::decide(use_accel, device, OFFLOAD_BUILT)
    }

    fn decide(use_accel: bool, device: &DeviceManager, offload_built: bool) -> Self {
        if !use_accel || device.device_is_host() {
            return Dispatch::Host;
        }
        if !offload_built {
            log::debug!(
                "offload to device {} requested, but offload support is not built; using host",
                device.current_device().0
            );
            return Dispatch::Host;
        }
        Dispatch::Device(device.current_device())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_device_never_offloads() {
        let host = DeviceManager::host();
        for built in [false, true] {
            assert_eq!(Dispatch::decide(true, &host, built), Dispatch::Host);
            assert_eq!(Dispatch::decide(false, &host, built), Dispatch::Host);
        }
    }

    #[test]
    fn test_offload_requires_request_and_build() {
        let dev = DeviceManager::with_device_memory(DeviceId(2));
        assert_eq!(Dispatch::decide(false, &dev, true), Dispatch::Host);
        assert_eq!(Dispatch::decide(true, &dev, false), Dispatch::Host);
        assert_eq!(
            Dispatch::decide(true, &dev, true),
            Dispatch::Device(DeviceId(2))
        );
    }

    #[test]
    fn test_select_follows_build() {
        let dev = DeviceManager::mirrored(DeviceId(0));
        let expected = if OFFLOAD_BUILT {
            Dispatch::Device(DeviceId(0))
        } else {
            Dispatch::Host
        };
        assert_eq!(Dispatch::select(true, &dev), expected);
    }

    #[test]
    fn test_host_context() {
        let ctx = ExecContext::host();
        assert!(ctx.device.device_is_host());
        assert_eq!(ctx.config.min_parallel_len, KernelConfig::default().min_parallel_len);
    }
}
