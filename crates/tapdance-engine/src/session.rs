//! Device session management.
//!
//! All higher components ask this manager for a ready session instead of
//! holding device handles directly. Selection across multiple connected
//! devices is a heuristic behind [`SelectionPolicy`], not a stable contract:
//! parallel CI fan-out pins a device with [`DeviceSessionManager::set_active_device`]
//! when determinism matters.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use tapdance_adb::{AdbBridge, Device, Platform, discover_devices};

use crate::{EngineError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSession {
    pub session_id: Uuid,
    pub device: Device,
    pub platform: Platform,
    pub started_at: DateTime<Utc>,
    pub bridge_port: Option<u16>,
}

#[derive(Debug, Clone, Default)]
pub struct SessionCriteria {
    pub device_id: Option<String>,
    pub platform: Option<Platform>,
}

impl SessionCriteria {
    pub fn device(id: impl Into<String>) -> Self {
        Self {
            device_id: Some(id.into()),
            platform: None,
        }
    }

    fn admits(&self, device: &Device) -> bool {
        if let Some(id) = &self.device_id {
            if device.id != *id {
                return false;
            }
        }
        if let Some(platform) = self.platform {
            if device.platform != platform {
                return false;
            }
        }
        true
    }
}

/// Source of connected devices; swapped for a scripted list in tests.
#[async_trait]
pub trait DeviceDiscovery: Send + Sync {
    async fn list(&self) -> Result<Vec<Device>>;
}

pub struct AdbDiscovery {
    bridge: Arc<AdbBridge>,
}

impl AdbDiscovery {
    pub fn new(bridge: Arc<AdbBridge>) -> Self {
        Self { bridge }
    }
}

#[async_trait]
impl DeviceDiscovery for AdbDiscovery {
    async fn list(&self) -> Result<Vec<Device>> {
        Ok(discover_devices(&self.bridge).await?)
    }
}

/// Which device gets picked when several are ready and none is pinned.
/// Deliberately heuristic; see module docs.
pub trait SelectionPolicy: Send + Sync {
    fn select<'a>(&self, ready: &'a [Device]) -> Option<&'a Device>;
}

/// Default policy: first ready device in discovery order.
pub struct FirstReady;

impl SelectionPolicy for FirstReady {
    fn select<'a>(&self, ready: &'a [Device]) -> Option<&'a Device> {
        ready.first()
    }
}

pub struct DeviceSessionManager {
    discovery: Arc<dyn DeviceDiscovery>,
    policy: Box<dyn SelectionPolicy>,
    sessions: Mutex<HashMap<String, Arc<DeviceSession>>>,
    active_device_id: Mutex<Option<String>>,
    known_devices: Mutex<Vec<Device>>,
}

impl DeviceSessionManager {
    pub fn new(discovery: Arc<dyn DeviceDiscovery>) -> Self {
        Self::with_policy(discovery, Box::new(FirstReady))
    }

    pub fn with_policy(
        discovery: Arc<dyn DeviceDiscovery>,
        policy: Box<dyn SelectionPolicy>,
    ) -> Self {
        Self {
            discovery,
            policy,
            sessions: Mutex::new(HashMap::new()),
            active_device_id: Mutex::new(None),
            known_devices: Mutex::new(Vec::new()),
        }
    }

    /// Refresh and return the connected device list.
    pub async fn list_devices(&self) -> Result<Vec<Device>> {
        let devices = self.discovery.list().await?;
        *self.known_devices.lock().unwrap() = devices.clone();
        Ok(devices)
    }

    /// Pin device selection deterministically. Fails if the id is not among
    /// currently discovered devices.
    pub async fn set_active_device(&self, device_id: &str) -> Result<()> {
        let devices = self.list_devices().await?;
        if !devices.iter().any(|d| d.id == device_id) {
            return Err(EngineError::NoDeviceAvailable(format!(
                "device '{device_id}' is not connected"
            )));
        }
        info!(device_id, "active device pinned");
        *self.active_device_id.lock().unwrap() = Some(device_id.to_string());
        Ok(())
    }

    pub fn active_device_id(&self) -> Option<String> {
        self.active_device_id.lock().unwrap().clone()
    }

    /// Return a live session for a device satisfying `criteria`, creating
    /// one if an existing session does not already cover it.
    pub async fn ensure_ready(&self, criteria: &SessionCriteria) -> Result<Arc<DeviceSession>> {
        // A pinned device narrows unconstrained criteria.
        let mut criteria = criteria.clone();
        if criteria.device_id.is_none() {
            criteria.device_id = self.active_device_id();
        }

        if let Some(id) = &criteria.device_id {
            if let Some(session) = self.sessions.lock().unwrap().get(id) {
                return Ok(session.clone());
            }
        }

        let devices = self.list_devices().await?;
        let ready: Vec<Device> = devices
            .into_iter()
            .filter(|d| d.running && criteria.admits(d))
            .collect();

        // Reuse an existing session when the selected device already has one.
        let chosen = self
            .policy
            .select(&ready)
            .cloned()
            .ok_or_else(|| match &criteria.device_id {
                Some(id) => {
                    EngineError::NoDeviceAvailable(format!("device '{id}' is not ready"))
                }
                None => EngineError::NoDeviceAvailable(
                    "no device or emulator is connected and ready".into(),
                ),
            })?;

        let mut sessions = self.sessions.lock().unwrap();
        if let Some(existing) = sessions.get(&chosen.id) {
            return Ok(existing.clone());
        }
        let session = Arc::new(DeviceSession {
            session_id: Uuid::new_v4(),
            platform: chosen.platform,
            started_at: Utc::now(),
            bridge_port: None,
            device: chosen,
        });
        debug!(device_id = %session.device.id, session_id = %session.session_id, "session created");
        sessions.insert(session.device.id.clone(), session.clone());
        Ok(session)
    }

    /// Tear down the session for a device, if any.
    pub fn release(&self, device_id: &str) -> bool {
        let removed = self.sessions.lock().unwrap().remove(device_id).is_some();
        if removed {
            info!(device_id, "session released");
        }
        removed
    }

    pub fn session_for(&self, device_id: &str) -> Option<Arc<DeviceSession>> {
        self.sessions.lock().unwrap().get(device_id).cloned()
    }

    pub fn active_sessions(&self) -> Vec<Arc<DeviceSession>> {
        self.sessions.lock().unwrap().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tapdance_adb::DeviceSource;

    struct StaticDiscovery(Vec<Device>);

    #[async_trait]
    impl DeviceDiscovery for StaticDiscovery {
        async fn list(&self) -> Result<Vec<Device>> {
            Ok(self.0.clone())
        }
    }

    fn device(id: &str, running: bool) -> Device {
        Device {
            id: id.to_string(),
            platform: Platform::Android,
            running,
            source: DeviceSource::Local,
            model: None,
        }
    }

    fn manager(devices: Vec<Device>) -> DeviceSessionManager {
        DeviceSessionManager::new(Arc::new(StaticDiscovery(devices)))
    }

    #[tokio::test]
    async fn ensure_ready_picks_first_ready_device() {
        let mgr = manager(vec![
            device("emulator-5554", false),
            device("emulator-5556", true),
            device("emulator-5558", true),
        ]);
        let session = mgr.ensure_ready(&SessionCriteria::default()).await.unwrap();
        assert_eq!(session.device.id, "emulator-5556");
    }

    #[tokio::test]
    async fn no_device_available_is_typed() {
        let mgr = manager(vec![device("emulator-5554", false)]);
        let err = mgr.ensure_ready(&SessionCriteria::default()).await.unwrap_err();
        assert!(matches!(err, EngineError::NoDeviceAvailable(_)));

        let mgr = manager(vec![]);
        let err = mgr.ensure_ready(&SessionCriteria::default()).await.unwrap_err();
        assert!(matches!(err, EngineError::NoDeviceAvailable(_)));
    }

    #[tokio::test]
    async fn pinning_overrides_policy() {
        let mgr = manager(vec![
            device("emulator-5554", true),
            device("emulator-5556", true),
        ]);
        mgr.set_active_device("emulator-5556").await.unwrap();
        let session = mgr.ensure_ready(&SessionCriteria::default()).await.unwrap();
        assert_eq!(session.device.id, "emulator-5556");
    }

    #[tokio::test]
    async fn pinning_unknown_device_fails() {
        let mgr = manager(vec![device("emulator-5554", true)]);
        let err = mgr.set_active_device("nope").await.unwrap_err();
        assert!(matches!(err, EngineError::NoDeviceAvailable(_)));
    }

    #[tokio::test]
    async fn sessions_are_reused_until_released() {
        let mgr = manager(vec![device("emulator-5554", true)]);
        let first = mgr.ensure_ready(&SessionCriteria::default()).await.unwrap();
        let second = mgr.ensure_ready(&SessionCriteria::default()).await.unwrap();
        assert_eq!(first.session_id, second.session_id);

        assert!(mgr.release("emulator-5554"));
        assert!(!mgr.release("emulator-5554"));
        let third = mgr.ensure_ready(&SessionCriteria::default()).await.unwrap();
        assert_ne!(first.session_id, third.session_id);
    }

    #[tokio::test]
    async fn criteria_device_id_must_be_ready() {
        let mgr = manager(vec![
            device("emulator-5554", true),
            device("emulator-5556", false),
        ]);
        let session = mgr
            .ensure_ready(&SessionCriteria::device("emulator-5554"))
            .await
            .unwrap();
        assert_eq!(session.device.id, "emulator-5554");

        let err = mgr
            .ensure_ready(&SessionCriteria::device("emulator-5556"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NoDeviceAvailable(_)));
    }

    #[tokio::test]
    async fn custom_policy_is_honored() {
        struct LastReady;
        impl SelectionPolicy for LastReady {
            fn select<'a>(&self, ready: &'a [Device]) -> Option<&'a Device> {
                ready.last()
            }
        }
        let mgr = DeviceSessionManager::with_policy(
            Arc::new(StaticDiscovery(vec![
                device("emulator-5554", true),
                device("emulator-5556", true),
            ])),
            Box::new(LastReady),
        );
        let session = mgr.ensure_ready(&SessionCriteria::default()).await.unwrap();
        assert_eq!(session.device.id, "emulator-5556");
    }
}
