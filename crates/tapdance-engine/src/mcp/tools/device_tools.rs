//! Device provisioning and lifecycle tools.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::info;

use crate::mcp::context::EngineContext;
use crate::mcp::server::{Tool, ToolRegistry, ToolSchema};
use crate::{EngineError, Result};

pub fn register_device_tools(
    registry: &mut ToolRegistry,
    context: Arc<EngineContext>,
) -> Result<()> {
    registry.register(Arc::new(ListDevicesTool::new(context.clone())))?;
    registry.register(Arc::new(SetActiveDeviceTool::new(context.clone())))?;
    registry.register(Arc::new(BootDeviceTool::new()))?;
    registry.register(Arc::new(DeviceInfoTool::new(context.clone())))?;
    registry.register(Arc::new(LaunchAppTool::new(context.clone())))?;
    registry.register(Arc::new(StopAppTool::new(context)))?;
    Ok(())
}

fn require_str<'a>(params: &'a Value, key: &str) -> Result<&'a str> {
    params
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| EngineError::Validation(format!("missing required parameter '{key}'")))
}

pub struct ListDevicesTool {
    schema: ToolSchema,
    context: Arc<EngineContext>,
}

impl ListDevicesTool {
    pub fn new(context: Arc<EngineContext>) -> Self {
        Self {
            schema: ToolSchema {
                name: "list_devices".to_string(),
                description: "List connected devices and emulators with their readiness state"
                    .to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {},
                    "additionalProperties": false
                }),
                reports_progress: false,
            },
            context,
        }
    }
}

#[async_trait]
impl Tool for ListDevicesTool {
    fn schema(&self) -> &ToolSchema {
        &self.schema
    }

    async fn execute(&self, _params: Value) -> Result<Value> {
        let devices = self.context.sessions.list_devices().await?;
        Ok(json!({
            "devices": devices,
            "active_device": self.context.sessions.active_device_id(),
        }))
    }
}

pub struct SetActiveDeviceTool {
    schema: ToolSchema,
    context: Arc<EngineContext>,
}

impl SetActiveDeviceTool {
    pub fn new(context: Arc<EngineContext>) -> Self {
        Self {
            schema: ToolSchema {
                name: "set_active_device".to_string(),
                description: "Pin device selection to one device for subsequent calls".to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "device_id": {
                            "type": "string",
                            "description": "Serial of the device to pin"
                        }
                    },
                    "required": ["device_id"],
                    "additionalProperties": false
                }),
                reports_progress: false,
            },
            context,
        }
    }
}

#[async_trait]
impl Tool for SetActiveDeviceTool {
    fn schema(&self) -> &ToolSchema {
        &self.schema
    }

    async fn execute(&self, params: Value) -> Result<Value> {
        let device_id = require_str(&params, "device_id")?;
        self.context.sessions.set_active_device(device_id).await?;
        Ok(json!({ "active_device": device_id }))
    }
}

/// Starts an emulator by AVD name. The emulator boots in the background;
/// poll `list_devices` until it reports ready.
pub struct BootDeviceTool {
    schema: ToolSchema,
}

impl BootDeviceTool {
    pub fn new() -> Self {
        Self {
            schema: ToolSchema {
                name: "boot_device".to_string(),
                description: "Boot an Android emulator by AVD name".to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "avd": {
                            "type": "string",
                            "description": "Name of the AVD to boot (see `emulator -list-avds`)"
                        }
                    },
                    "required": ["avd"],
                    "additionalProperties": false
                }),
                reports_progress: false,
            },
        }
    }

    fn emulator_binary() -> PathBuf {
        if let Ok(explicit) = std::env::var("TAPDANCE_EMULATOR") {
            return PathBuf::from(explicit);
        }
        for var in ["ANDROID_HOME", "ANDROID_SDK_ROOT"] {
            if let Ok(sdk) = std::env::var(var) {
                let p = PathBuf::from(sdk).join("emulator").join("emulator");
                if p.exists() {
                    return p;
                }
            }
        }
        PathBuf::from("emulator")
    }
}

impl Default for BootDeviceTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for BootDeviceTool {
    fn schema(&self) -> &ToolSchema {
        &self.schema
    }

    async fn execute(&self, params: Value) -> Result<Value> {
        let avd = require_str(&params, "avd")?;
        let binary = Self::emulator_binary();
        tokio::process::Command::new(&binary)
            .args(["-avd", avd, "-no-snapshot-save"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                EngineError::Validation(format!(
                    "failed to start emulator '{}': {e}",
                    binary.display()
                ))
            })?;
        info!(avd, "emulator boot started");
        Ok(json!({ "avd": avd, "status": "booting" }))
    }
}

pub struct DeviceInfoTool {
    schema: ToolSchema,
    context: Arc<EngineContext>,
}

impl DeviceInfoTool {
    pub fn new(context: Arc<EngineContext>) -> Self {
        Self {
            schema: ToolSchema {
                name: "device_info".to_string(),
                description: "Report model, OS version, and session details for a device"
                    .to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "device_id": { "type": "string" }
                    },
                    "additionalProperties": false
                }),
                reports_progress: false,
            },
            context,
        }
    }

    async fn prop(&self, serial: &str, key: &str) -> Option<String> {
        let out = self
            .context
            .bridge
            .shell(serial, &["getprop", key])
            .await
            .ok()?;
        let value = out.stdout.trim().to_string();
        (!value.is_empty()).then_some(value)
    }
}

#[async_trait]
impl Tool for DeviceInfoTool {
    fn schema(&self) -> &ToolSchema {
        &self.schema
    }

    async fn execute(&self, params: Value) -> Result<Value> {
        let serial = self.context.target_serial(&params).await?;
        let session = self.context.sessions.session_for(&serial);
        Ok(json!({
            "device_id": serial,
            "model": self.prop(&serial, "ro.product.model").await,
            "manufacturer": self.prop(&serial, "ro.product.manufacturer").await,
            "os_version": self.prop(&serial, "ro.build.version.release").await,
            "sdk": self.prop(&serial, "ro.build.version.sdk").await,
            "session": session.map(|s| json!({
                "session_id": s.session_id,
                "platform": s.platform,
                "started_at": s.started_at,
            })),
        }))
    }
}

pub struct LaunchAppTool {
    schema: ToolSchema,
    context: Arc<EngineContext>,
}

impl LaunchAppTool {
    pub fn new(context: Arc<EngineContext>) -> Self {
        Self {
            schema: ToolSchema {
                name: "launch_app".to_string(),
                description: "Launch an app by package name, optionally at a specific activity"
                    .to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "package": { "type": "string" },
                        "activity": {
                            "type": "string",
                            "description": "Explicit activity to start, e.g. .MainActivity"
                        },
                        "device_id": { "type": "string" }
                    },
                    "required": ["package"],
                    "additionalProperties": false
                }),
                reports_progress: false,
            },
            context,
        }
    }
}

#[async_trait]
impl Tool for LaunchAppTool {
    fn schema(&self) -> &ToolSchema {
        &self.schema
    }

    async fn execute(&self, params: Value) -> Result<Value> {
        let serial = self.context.target_serial(&params).await?;
        let package = require_str(&params, "package")?;
        let activity = params.get("activity").and_then(Value::as_str);

        let (out, verdict) = self
            .context
            .with_settling(&serial, || async {
                Ok(self
                    .context
                    .bridge
                    .launch_app(&serial, package, activity)
                    .await?)
            })
            .await?;
        if !out.success() {
            return Err(EngineError::Validation(format!(
                "launch of '{package}' failed: {}",
                out.stderr.trim()
            )));
        }
        Ok(json!({ "package": package, "launched": true, "stability": verdict }))
    }
}

pub struct StopAppTool {
    schema: ToolSchema,
    context: Arc<EngineContext>,
}

impl StopAppTool {
    pub fn new(context: Arc<EngineContext>) -> Self {
        Self {
            schema: ToolSchema {
                name: "stop_app".to_string(),
                description: "Force-stop an app by package name".to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "package": { "type": "string" },
                        "device_id": { "type": "string" }
                    },
                    "required": ["package"],
                    "additionalProperties": false
                }),
                reports_progress: false,
            },
            context,
        }
    }
}

#[async_trait]
impl Tool for StopAppTool {
    fn schema(&self) -> &ToolSchema {
        &self.schema
    }

    async fn execute(&self, params: Value) -> Result<Value> {
        let serial = self.context.target_serial(&params).await?;
        let package = require_str(&params, "package")?;
        let out = self.context.bridge.stop_app(&serial, package).await?;
        if !out.success() {
            return Err(EngineError::Validation(format!(
                "force-stop of '{package}' failed: {}",
                out.stderr.trim()
            )));
        }
        Ok(json!({ "package": package, "stopped": true }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::DeviceSessionManager;
    use crate::testutil::MockBridge;
    use tapdance_adb::{Device, DeviceSource, Platform};

    struct StaticDiscovery(Vec<Device>);

    #[async_trait]
    impl crate::session::DeviceDiscovery for StaticDiscovery {
        async fn list(&self) -> Result<Vec<Device>> {
            Ok(self.0.clone())
        }
    }

    fn context_with(devices: Vec<Device>) -> (Arc<MockBridge>, Arc<EngineContext>) {
        let bridge = Arc::new(MockBridge::new());
        let sessions = Arc::new(DeviceSessionManager::new(Arc::new(StaticDiscovery(devices))));
        let ctx = Arc::new(EngineContext::new(bridge.clone(), sessions));
        (bridge, ctx)
    }

    fn emulator(id: &str) -> Device {
        Device {
            id: id.to_string(),
            platform: Platform::Android,
            running: true,
            source: DeviceSource::Local,
            model: None,
        }
    }

    #[tokio::test]
    async fn list_devices_reports_connected_and_pinned() {
        let (_bridge, ctx) = context_with(vec![emulator("emulator-5554")]);
        let tool = ListDevicesTool::new(ctx.clone());
        let result = tool.execute(json!({})).await.unwrap();
        assert_eq!(result["devices"][0]["id"], "emulator-5554");
        assert!(result["active_device"].is_null());

        ctx.sessions.set_active_device("emulator-5554").await.unwrap();
        let result = tool.execute(json!({})).await.unwrap();
        assert_eq!(result["active_device"], "emulator-5554");
    }

    #[tokio::test]
    async fn set_active_device_rejects_unknown_serial() {
        let (_bridge, ctx) = context_with(vec![emulator("emulator-5554")]);
        let tool = SetActiveDeviceTool::new(ctx);
        let err = tool
            .execute(json!({ "device_id": "emulator-9999" }))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NoDeviceAvailable(_)));
    }

    #[tokio::test]
    async fn stop_app_issues_force_stop() {
        let (bridge, ctx) = context_with(vec![emulator("emulator-5554")]);
        let tool = StopAppTool::new(ctx);
        let result = tool
            .execute(json!({ "package": "com.example.app" }))
            .await
            .unwrap();
        assert_eq!(result["stopped"], true);
        assert!(
            bridge
                .calls()
                .iter()
                .any(|c| c.contains("force-stop com.example.app"))
        );
    }
}
