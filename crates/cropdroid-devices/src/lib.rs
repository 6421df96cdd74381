//! # CropDroid Devices
//!
//! Clients that speak the device contract (HTTP or in-process virtual) and
//! the per-device worker that owns channel tracking, the debounce/backoff
//! gate, health counting and the actuation lock.

pub mod health;
pub mod http;
pub mod virtual_device;
pub mod worker;

use std::sync::Arc;

use cropdroid_core::config::CropDroidConfig;
use cropdroid_core::context::Clock;
use cropdroid_core::error::{CropDroidError, Result};
use cropdroid_core::ids::IdHasher;
use cropdroid_core::model::{Device, Farm, FarmMode};
use cropdroid_core::traits::DeviceClient;

pub use health::{DeviceHealth, HealthStatus, HealthTransition};
pub use http::HttpDeviceClient;
pub use virtual_device::VirtualDevice;
pub use worker::{ChannelTracker, DeviceWorker, SwitchOutcome};

/// Pick the client for a device from the farm's mode.
pub fn build_client(
    farm: &Farm,
    device: &Device,
    config: &CropDroidConfig,
    clock: Arc<dyn Clock>,
) -> Result<Arc<dyn DeviceClient>> {
    match farm.mode {
        FarmMode::Virtual => Ok(Arc::new(VirtualDevice::from_device(
            farm.id,
            device,
            IdHasher::new(config.id_width),
            clock,
        ))),
        FarmMode::Server | FarmMode::Cloud | FarmMode::Maintenance => {
            if device.uri.is_empty() {
                return Err(CropDroidError::Config(format!(
                    "device {} has no uri but farm {} is in {} mode",
                    device.device_type,
                    farm.name,
                    farm.mode.as_str()
                )));
            }
            Ok(Arc::new(HttpDeviceClient::new(
                &device.device_type,
                &device.uri,
                config.device_timeout(farm.interval),
            )?))
        }
    }
}
