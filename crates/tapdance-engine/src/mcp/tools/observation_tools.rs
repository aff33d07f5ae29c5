//! Screen observation tools: hierarchy reads, element lookup, screenshots.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::time::timeout;
use tracing::debug;

use crate::mcp::context::EngineContext;
use crate::mcp::server::{Tool, ToolRegistry, ToolSchema};
use crate::observation::ObserveOptions;
use crate::resolve::ElementQuery;
use crate::{EngineError, Result};

pub fn register_observation_tools(
    registry: &mut ToolRegistry,
    context: Arc<EngineContext>,
) -> Result<()> {
    registry.register(Arc::new(ObserveTool::new(context.clone())))?;
    registry.register(Arc::new(FindElementTool::new(context.clone())))?;
    registry.register(Arc::new(ScreenshotTool::new(context)))?;
    Ok(())
}

fn observe_options(params: &Value) -> ObserveOptions {
    let defaults = ObserveOptions::default();
    ObserveOptions {
        use_cache: params
            .get("use_cache")
            .and_then(Value::as_bool)
            .unwrap_or(defaults.use_cache),
        wait_for_stable: params
            .get("wait_for_stable")
            .and_then(Value::as_bool)
            .unwrap_or(defaults.wait_for_stable),
    }
}

pub struct ObserveTool {
    schema: ToolSchema,
    context: Arc<EngineContext>,
}

impl ObserveTool {
    pub fn new(context: Arc<EngineContext>) -> Self {
        Self {
            schema: ToolSchema {
                name: "observe".to_string(),
                description: "Capture the current screen state: view hierarchy, interactable \
                              element buckets, screen metrics"
                    .to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "use_cache": {
                            "type": "boolean",
                            "description": "Serve a cached result when the screen signature is unchanged (default true)"
                        },
                        "wait_for_stable": {
                            "type": "boolean",
                            "description": "Wait for UI settling before reading (default true)"
                        },
                        "timeout_ms": {
                            "type": "integer",
                            "minimum": 1,
                            "description": "Overall deadline for the observation"
                        },
                        "device_id": { "type": "string" }
                    },
                    "additionalProperties": false
                }),
                reports_progress: false,
            },
            context,
        }
    }
}

#[async_trait]
impl Tool for ObserveTool {
    fn schema(&self) -> &ToolSchema {
        &self.schema
    }

    async fn execute(&self, params: Value) -> Result<Value> {
        let serial = self.context.target_serial(&params).await?;
        let options = observe_options(&params);

        let observed = match params.get("timeout_ms").and_then(Value::as_u64) {
            Some(ms) => timeout(
                Duration::from_millis(ms),
                self.context.observe(&serial, options),
            )
            .await
            .map_err(|_| EngineError::Timeout(format!("observation exceeded {ms}ms")))??,
            None => self.context.observe(&serial, options).await?,
        };

        let mut result = serde_json::to_value(&observed)?;
        result["device_id"] = json!(serial);
        Ok(result)
    }
}

pub struct FindElementTool {
    schema: ToolSchema,
    context: Arc<EngineContext>,
}

impl FindElementTool {
    pub fn new(context: Arc<EngineContext>) -> Self {
        Self {
            schema: ToolSchema {
                name: "find_element".to_string(),
                description: "Resolve an element query against the current screen".to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "target": {
                            "type": "object",
                            "description": "Element query: index, text, content_desc, or \
                                            resource_id, with optional exact, case_sensitive, \
                                            and container_id",
                            "properties": {
                                "index": { "type": "integer", "minimum": 0 },
                                "text": { "type": "string" },
                                "content_desc": { "type": "string" },
                                "resource_id": { "type": "string" },
                                "container_id": { "type": "string" },
                                "exact": { "type": "boolean" },
                                "case_sensitive": { "type": "boolean" }
                            }
                        },
                        "use_cache": { "type": "boolean" },
                        "device_id": { "type": "string" }
                    },
                    "required": ["target"],
                    "additionalProperties": false
                }),
                reports_progress: false,
            },
            context,
        }
    }
}

#[async_trait]
impl Tool for FindElementTool {
    fn schema(&self) -> &ToolSchema {
        &self.schema
    }

    async fn execute(&self, params: Value) -> Result<Value> {
        let serial = self.context.target_serial(&params).await?;
        let target = params
            .get("target")
            .ok_or_else(|| EngineError::Validation("missing required parameter 'target'".into()))?;
        let query = ElementQuery::from_json(target)?;
        let element = self
            .context
            .resolve_on_screen(&serial, &query, observe_options(&params))
            .await?;
        Ok(json!({ "found": true, "element": element }))
    }
}

/// Captures to the device then pulls the PNG locally. Screenshots are the
/// first thing the cache sheds under pressure.
pub struct ScreenshotTool {
    schema: ToolSchema,
    context: Arc<EngineContext>,
}

impl ScreenshotTool {
    pub fn new(context: Arc<EngineContext>) -> Self {
        Self {
            schema: ToolSchema {
                name: "screenshot".to_string(),
                description: "Capture the device screen to a local PNG file".to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "path": {
                            "type": "string",
                            "description": "Local destination; a temp path is chosen when omitted"
                        },
                        "device_id": { "type": "string" }
                    },
                    "additionalProperties": false
                }),
                reports_progress: false,
            },
            context,
        }
    }
}

const SCREENSHOT_REMOTE_PATH: &str = "/sdcard/tapdance_screen.png";

#[async_trait]
impl Tool for ScreenshotTool {
    fn schema(&self) -> &ToolSchema {
        &self.schema
    }

    async fn execute(&self, params: Value) -> Result<Value> {
        let serial = self.context.target_serial(&params).await?;
        let local = match params.get("path").and_then(Value::as_str) {
            Some(p) => std::path::PathBuf::from(p),
            None => std::env::temp_dir().join(format!(
                "tapdance-{serial}-{}.png",
                chrono::Utc::now().timestamp_millis()
            )),
        };

        let out = self
            .context
            .bridge
            .screencap(&serial, SCREENSHOT_REMOTE_PATH)
            .await?;
        if !out.success() {
            return Err(EngineError::Validation(format!(
                "screencap failed: {}",
                out.stderr.trim()
            )));
        }
        self.context
            .bridge
            .pull(&serial, SCREENSHOT_REMOTE_PATH, &local)
            .await?;

        // Remember the file against the current screen so repeat requests
        // can skip the capture round-trip until the screen changes.
        if let Ok(signature) = self.context.observer.signature(&serial).await {
            debug!(?signature, path = %local.display(), "screenshot cached");
            self.context.cache.attach_screenshot(&signature, local.clone());
        }

        Ok(json!({ "path": local.display().to_string(), "device_id": serial }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{DeviceDiscovery, DeviceSessionManager};
    use crate::testutil::MockBridge;
    use tapdance_adb::{Device, DeviceSource, Platform};

    struct StaticDiscovery(Vec<Device>);

    #[async_trait]
    impl DeviceDiscovery for StaticDiscovery {
        async fn list(&self) -> Result<Vec<Device>> {
            Ok(self.0.clone())
        }
    }

    const DUMP: &str = r#"<?xml version='1.0' encoding='UTF-8' standalone='yes' ?>
<hierarchy rotation="0">
  <node index="0" text="" resource-id="" class="android.widget.FrameLayout" package="com.example" content-desc="" checkable="false" checked="false" clickable="false" enabled="true" focusable="false" focused="false" scrollable="false" long-clickable="false" password="false" selected="false" bounds="[0,0][1080,1920]">
    <node index="0" text="Submit" resource-id="com.example:id/submit" class="android.widget.Button" package="com.example" content-desc="" checkable="false" checked="false" clickable="true" enabled="true" focusable="true" focused="false" scrollable="false" long-clickable="false" password="false" selected="false" bounds="[100,800][500,900]" />
  </node>
</hierarchy>"#;

    fn context_with(serials: &[&str]) -> (Arc<MockBridge>, Arc<EngineContext>) {
        let bridge = Arc::new(MockBridge::new());
        bridge.on("shell dumpsys activity activities", "    mResumedActivity: ActivityRecord{abc u0 com.example/.MainActivity t12}");
        bridge.on("shell dumpsys window", "  mLayoutSeq=42");
        bridge.on("shell wm size", "Physical size: 1080x1920");
        bridge.on("shell uiautomator dump", "UI hierchary dumped to: /sdcard/window_dump.xml");
        bridge.on("shell cat /sdcard/window_dump.xml", DUMP);
        let devices = serials
            .iter()
            .map(|serial| Device {
                id: serial.to_string(),
                platform: Platform::Android,
                running: true,
                source: DeviceSource::Local,
                model: None,
            })
            .collect();
        let sessions = Arc::new(DeviceSessionManager::new(Arc::new(StaticDiscovery(devices))));
        let ctx = Arc::new(EngineContext::new(bridge.clone(), sessions));
        (bridge, ctx)
    }

    fn context() -> (Arc<MockBridge>, Arc<EngineContext>) {
        context_with(&["emulator-5554"])
    }

    #[tokio::test]
    async fn observe_returns_categorized_screen() {
        let (_bridge, ctx) = context();
        let tool = ObserveTool::new(ctx);
        let result = tool.execute(json!({})).await.unwrap();
        assert_eq!(result["device_id"], "emulator-5554");
        assert_eq!(result["screen_size"]["width"], 1080);
        assert_eq!(result["clickable_elements"][0]["text"], "Submit");
    }

    #[tokio::test]
    async fn observe_serves_cache_on_unchanged_signature() {
        let (bridge, ctx) = context();
        let tool = ObserveTool::new(ctx);
        tool.execute(json!({})).await.unwrap();
        tool.execute(json!({})).await.unwrap();
        // One hierarchy pull despite two observes.
        assert_eq!(bridge.calls_matching("shell uiautomator dump"), 1);
    }

    #[tokio::test]
    async fn observe_extracts_per_device_even_on_matching_screens() {
        let (bridge, ctx) = context_with(&["emulator-5554", "emulator-5556"]);
        let tool = ObserveTool::new(ctx);
        // Both devices report the same activity and layout sequence; the
        // second device must still get its own extraction, not the first
        // device's cached tree.
        tool.execute(json!({ "device_id": "emulator-5554" }))
            .await
            .unwrap();
        tool.execute(json!({ "device_id": "emulator-5556" }))
            .await
            .unwrap();
        assert_eq!(bridge.calls_matching("shell uiautomator dump"), 2);
    }

    #[tokio::test]
    async fn find_element_resolves_text_query() {
        let (_bridge, ctx) = context();
        let tool = FindElementTool::new(ctx);
        let result = tool
            .execute(json!({ "target": { "text": "submit" } }))
            .await
            .unwrap();
        assert_eq!(result["found"], true);
        assert_eq!(result["element"]["text"], "Submit");
    }

    #[tokio::test]
    async fn find_element_miss_carries_nearby_candidates() {
        let (_bridge, ctx) = context();
        let tool = FindElementTool::new(ctx);
        let err = tool
            .execute(json!({ "target": { "text": "Cancel" } }))
            .await
            .unwrap_err();
        match err {
            EngineError::ElementNotFound { nearby, .. } => {
                assert!(nearby.iter().any(|c| c.contains("Submit")));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
