//! Device conditions and the pre-sync gate.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::RwLock;

use fieldsync_common::Result;

use crate::config::SchedulerConfig;

/// Kind of network the device is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    Wifi,
    Cellular,
    Ethernet,
    Unknown,
    None,
}

/// Connectivity as reported by the platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectivityState {
    pub is_connected: bool,
    pub network_type: NetworkType,
    /// Metered or otherwise costly connection.
    pub is_expensive: bool,
}

impl ConnectivityState {
    pub fn wifi() -> Self {
        Self {
            is_connected: true,
            network_type: NetworkType::Wifi,
            is_expensive: false,
        }
    }

    pub fn cellular() -> Self {
        Self {
            is_connected: true,
            network_type: NetworkType::Cellular,
            is_expensive: true,
        }
    }

    pub fn offline() -> Self {
        Self {
            is_connected: false,
            network_type: NetworkType::None,
            is_expensive: false,
        }
    }
}

/// Charging state of the battery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatteryState {
    Charging,
    Full,
    Unplugged,
    Unknown,
}

/// Battery as reported by the platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatteryStatus {
    /// Charge level in `[0, 1]`.
    pub level: f32,
    pub state: BatteryState,
}

impl BatteryStatus {
    pub fn is_charging(&self) -> bool {
        matches!(self.state, BatteryState::Charging | BatteryState::Full)
    }

    /// Charge level as a whole percentage.
    pub fn percent(&self) -> u8 {
        (self.level.clamp(0.0, 1.0) * 100.0).round() as u8
    }
}

/// Device conditions consulted before every sync attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub connectivity: ConnectivityState,
    pub battery: BatteryStatus,
}

/// Platform sensors for connectivity and power.
#[async_trait]
pub trait DeviceConditions: Send + Sync {
    async fn connectivity(&self) -> Result<ConnectivityState>;

    async fn battery(&self) -> Result<BatteryStatus>;

    /// Query both sensors.
    async fn status(&self) -> Result<DeviceStatus> {
        Ok(DeviceStatus {
            connectivity: self.connectivity().await?,
            battery: self.battery().await?,
        })
    }
}

/// Device conditions set explicitly, for tests and tooling.
pub struct StaticConditions {
    status: RwLock<DeviceStatus>,
}

impl StaticConditions {
    pub fn new(status: DeviceStatus) -> Self {
        Self {
            status: RwLock::new(status),
        }
    }

    /// Wi-Fi, full battery, plugged in.
    pub fn ideal() -> Self {
        Self::new(DeviceStatus {
            connectivity: ConnectivityState::wifi(),
            battery: BatteryStatus {
                level: 1.0,
                state: BatteryState::Full,
            },
        })
    }

    pub fn set_connectivity(&self, connectivity: ConnectivityState) {
        let mut status = self.status.write().unwrap_or_else(|e| e.into_inner());
        status.connectivity = connectivity;
    }

    pub fn set_battery(&self, battery: BatteryStatus) {
        let mut status = self.status.write().unwrap_or_else(|e| e.into_inner());
        status.battery = battery;
    }

    fn current(&self) -> DeviceStatus {
        self.status.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl DeviceConditions for StaticConditions {
    async fn connectivity(&self) -> Result<ConnectivityState> {
        Ok(self.current().connectivity)
    }

    async fn battery(&self) -> Result<BatteryStatus> {
        Ok(self.current().battery)
    }
}

/// Why a sync attempt did not run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "camelCase")]
pub enum SkipReason {
    /// Background sync is switched off.
    Disabled,
    /// This trigger kind is switched off in the configuration.
    TriggerDisabled,
    Offline,
    WifiRequired,
    /// Data saver forbids metered connections.
    DataSaver,
    ChargingRequired,
    LowBattery { level: u8, floor: u8 },
    /// Sensors could not be queried.
    ConditionsUnavailable,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Disabled => write!(f, "sync disabled"),
            SkipReason::TriggerDisabled => write!(f, "trigger disabled"),
            SkipReason::Offline => write!(f, "no connectivity"),
            SkipReason::WifiRequired => write!(f, "Wi-Fi required"),
            SkipReason::DataSaver => write!(f, "data saver on a metered connection"),
            SkipReason::ChargingRequired => write!(f, "charging required"),
            SkipReason::LowBattery { level, floor } => {
                write!(f, "battery at {}%, below {}%", level, floor)
            }
            SkipReason::ConditionsUnavailable => write!(f, "device conditions unavailable"),
        }
    }
}

/// Check device conditions against the configured gates.
pub fn evaluate_gate(
    config: &SchedulerConfig,
    status: &DeviceStatus,
) -> std::result::Result<(), SkipReason> {
    let connectivity = &status.connectivity;
    if !connectivity.is_connected || connectivity.network_type == NetworkType::None {
        return Err(SkipReason::Offline);
    }

    if config.require_wifi && connectivity.network_type != NetworkType::Wifi {
        return Err(SkipReason::WifiRequired);
    }

    if config.data_saver_mode
        && (connectivity.is_expensive || connectivity.network_type == NetworkType::Cellular)
    {
        return Err(SkipReason::DataSaver);
    }

    if config.require_charging && !status.battery.is_charging() {
        return Err(SkipReason::ChargingRequired);
    }

    let level = status.battery.percent();
    if level < config.sync_when_battery_above {
        return Err(SkipReason::LowBattery {
            level,
            floor: config.sync_when_battery_above,
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(connectivity: ConnectivityState, level: f32, state: BatteryState) -> DeviceStatus {
        DeviceStatus {
            connectivity,
            battery: BatteryStatus { level, state },
        }
    }

    #[test]
    fn test_default_config_passes_on_wifi() {
        let config = SchedulerConfig::default();
        let ok = status(ConnectivityState::wifi(), 0.8, BatteryState::Unplugged);
        assert_eq!(evaluate_gate(&config, &ok), Ok(()));

        let cell = status(ConnectivityState::cellular(), 0.8, BatteryState::Unplugged);
        assert_eq!(evaluate_gate(&config, &cell), Ok(()));
    }

    #[test]
    fn test_offline_is_skipped() {
        let config = SchedulerConfig::default();
        let offline = status(ConnectivityState::offline(), 1.0, BatteryState::Full);
        assert_eq!(evaluate_gate(&config, &offline), Err(SkipReason::Offline));
    }

    #[test]
    fn test_wifi_requirement() {
        let config = SchedulerConfig {
            require_wifi: true,
            ..SchedulerConfig::default()
        };
        let cell = status(ConnectivityState::cellular(), 1.0, BatteryState::Full);
        assert_eq!(evaluate_gate(&config, &cell), Err(SkipReason::WifiRequired));
    }

    #[test]
    fn test_data_saver_blocks_expensive_connections() {
        let config = SchedulerConfig {
            data_saver_mode: true,
            ..SchedulerConfig::default()
        };
        let metered_wifi = status(
            ConnectivityState {
                is_connected: true,
                network_type: NetworkType::Wifi,
                is_expensive: true,
            },
            1.0,
            BatteryState::Full,
        );
        assert_eq!(evaluate_gate(&config, &metered_wifi), Err(SkipReason::DataSaver));

        let wifi = status(ConnectivityState::wifi(), 1.0, BatteryState::Full);
        assert_eq!(evaluate_gate(&config, &wifi), Ok(()));
    }

    #[test]
    fn test_charging_requirement() {
        let config = SchedulerConfig {
            require_charging: true,
            ..SchedulerConfig::default()
        };
        let unplugged = status(ConnectivityState::wifi(), 0.9, BatteryState::Unplugged);
        assert_eq!(
            evaluate_gate(&config, &unplugged),
            Err(SkipReason::ChargingRequired)
        );

        let full = status(ConnectivityState::wifi(), 1.0, BatteryState::Full);
        assert_eq!(evaluate_gate(&config, &full), Ok(()));
    }

    #[test]
    fn test_battery_floor() {
        let config = SchedulerConfig::default();
        let low = status(ConnectivityState::wifi(), 0.10, BatteryState::Unplugged);
        assert_eq!(
            evaluate_gate(&config, &low),
            Err(SkipReason::LowBattery {
                level: 10,
                floor: 20
            })
        );

        // At the floor is enough
        let at_floor = status(ConnectivityState::wifi(), 0.20, BatteryState::Unplugged);
        assert_eq!(evaluate_gate(&config, &at_floor), Ok(()));
    }

    #[tokio::test]
    async fn test_static_conditions() {
        let device = StaticConditions::ideal();
        device.set_connectivity(ConnectivityState::offline());
        device.set_battery(BatteryStatus {
            level: 0.5,
            state: BatteryState::Charging,
        });

        let status = device.status().await.unwrap();
        assert!(!status.connectivity.is_connected);
        assert_eq!(status.battery.percent(), 50);
        assert!(status.battery.is_charging());
    }
}
