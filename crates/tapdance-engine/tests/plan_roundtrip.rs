//! End-to-end plan lifecycle through the live tool server: record a session,
//! export it as a plan, import the file back, and replay it.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Value, json};
use tapdance_adb::{CommandOutput, Device, DeviceBridge, DeviceSource, Platform};
use tapdance_engine::Result;
use tapdance_engine::mcp::context::EngineContext;
use tapdance_engine::mcp::server::{McpServer, ToolRequest};
use tapdance_engine::session::{DeviceDiscovery, DeviceSessionManager};

const DUMP: &str = r#"<?xml version='1.0' encoding='UTF-8' standalone='yes' ?>
<hierarchy rotation="0">
  <node index="0" text="" resource-id="" class="android.widget.FrameLayout" package="com.example" content-desc="" checkable="false" checked="false" clickable="false" enabled="true" focusable="false" focused="false" scrollable="false" long-clickable="false" password="false" selected="false" bounds="[0,0][1080,1920]">
    <node index="0" text="Submit" resource-id="com.example:id/submit" class="android.widget.Button" package="com.example" content-desc="" checkable="false" checked="false" clickable="true" enabled="true" focusable="true" focused="false" scrollable="false" long-clickable="false" password="false" selected="false" bounds="[100,800][500,900]" />
  </node>
</hierarchy>"#;

/// Prefix-scripted bridge; unmatched commands succeed with empty output.
struct ScriptedBridge {
    responses: HashMap<&'static str, &'static str>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedBridge {
    fn for_example_app() -> Self {
        let mut responses = HashMap::new();
        responses.insert(
            "shell dumpsys activity activities",
            "    mResumedActivity: ActivityRecord{abc u0 com.example/.MainActivity t12}",
        );
        responses.insert("shell dumpsys window", "  mLayoutSeq=42");
        responses.insert("shell wm size", "Physical size: 1080x1920");
        responses.insert(
            "shell uiautomator dump",
            "UI hierchary dumped to: /sdcard/window_dump.xml",
        );
        responses.insert("shell cat /sdcard/window_dump.xml", DUMP);
        responses.insert(
            "shell dumpsys gfxinfo",
            "Total frames rendered: 100\nNumber Missed Vsync: 0\nNumber Slow UI thread: 0\nNumber Frame deadline missed: 0",
        );
        Self {
            responses,
            calls: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl DeviceBridge for ScriptedBridge {
    async fn execute(&self, _serial: &str, args: &[&str]) -> tapdance_adb::Result<CommandOutput> {
        let joined = args.join(" ");
        self.calls.lock().unwrap().push(joined.clone());
        let stdout = self
            .responses
            .iter()
            .find(|(prefix, _)| joined.starts_with(**prefix))
            .map(|(_, out)| out.to_string())
            .unwrap_or_default();
        Ok(CommandOutput {
            stdout,
            stderr: String::new(),
            exit_code: 0,
        })
    }

    async fn pull(&self, _serial: &str, _remote: &str, _local: &Path) -> tapdance_adb::Result<()> {
        Ok(())
    }
}

struct OneEmulator;

#[async_trait]
impl DeviceDiscovery for OneEmulator {
    async fn list(&self) -> Result<Vec<Device>> {
        Ok(vec![Device {
            id: "emulator-5554".to_string(),
            platform: Platform::Android,
            running: true,
            source: DeviceSource::Local,
            model: None,
        }])
    }
}

fn make_server() -> Arc<McpServer> {
    let bridge = Arc::new(ScriptedBridge::for_example_app());
    let sessions = Arc::new(DeviceSessionManager::new(Arc::new(OneEmulator)));
    let context = Arc::new(EngineContext::new(bridge, sessions));
    McpServer::new(context).expect("server construction")
}

async fn call(server: &McpServer, tool: &str, params: Value) -> Value {
    let response = server
        .call_tool(ToolRequest {
            tool_name: tool.to_string(),
            params,
        })
        .await
        .expect("routable call");
    assert!(
        response.success,
        "tool {tool} failed: {}",
        response.result
    );
    response.result
}

#[tokio::test]
async fn recorded_session_exports_imports_and_replays() {
    let server = make_server();

    // A session: provisioning, an action, some observes, another action.
    call(&server, "list_devices", json!({})).await;
    call(&server, "tap", json!({ "x": 300, "y": 850 })).await;
    call(&server, "observe", json!({})).await;
    call(&server, "observe", json!({ "use_cache": false })).await;
    call(&server, "type_text", json!({ "text": "hello" })).await;
    call(&server, "observe", json!({})).await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("flow.json");
    let exported = call(
        &server,
        "plan_export",
        json!({ "name": "flow", "path": path.to_str().unwrap() }),
    )
    .await;

    // Provisioning dropped; observe runs collapsed to the trailing one.
    let steps = exported["plan"]["steps"].as_array().unwrap();
    let tools: Vec<&str> = steps.iter().map(|s| s["tool"].as_str().unwrap()).collect();
    assert_eq!(tools, vec!["tap", "type_text", "observe"]);

    // A fresh server replays the file from scratch.
    let replayer = make_server();
    let imported = call(
        &replayer,
        "plan_import",
        json!({ "path": path.to_str().unwrap() }),
    )
    .await;
    assert_eq!(imported["name"], "flow");
    assert_eq!(imported["total_steps"], 3);

    let executed = call(&replayer, "plan_execute", json!({ "name": "flow" })).await;
    assert_eq!(executed["completed"], true);
    assert_eq!(executed["executed_steps"], 3);
    assert!(executed.get("failed_step").is_none());

    let status = call(&replayer, "plan_status", json!({})).await;
    assert_eq!(status["last_execution"]["plan_name"], "flow");
}

#[tokio::test]
async fn replay_resume_index_is_bounds_checked() {
    let server = make_server();
    call(
        &server,
        "plan_import",
        json!({ "plan": {
            "name": "two-step",
            "steps": [
                { "tool": "tap", "params": { "x": 1, "y": 2 } },
                { "tool": "observe", "params": {} }
            ]
        }}),
    )
    .await;

    let response = server
        .call_tool(ToolRequest {
            tool_name: "plan_execute".to_string(),
            params: json!({ "name": "two-step", "start_step": 5 }),
        })
        .await
        .expect("routable call");
    assert!(!response.success);
    assert_eq!(response.result["error"]["kind"], "OUT_OF_BOUNDS");
    let message = response.result["error"]["message"].as_str().unwrap();
    assert!(message.contains("0..2"));
}

#[tokio::test]
async fn failed_step_stops_replay_and_is_reported() {
    let server = make_server();
    call(
        &server,
        "plan_import",
        json!({ "plan": {
            "name": "breaks",
            "steps": [
                { "tool": "tap", "params": { "x": 1, "y": 2 } },
                { "tool": "no_such_tool", "params": {} },
                { "tool": "observe", "params": {} }
            ]
        }}),
    )
    .await;

    let result = call(&server, "plan_execute", json!({ "name": "breaks" })).await;
    assert_eq!(result["completed"], false);
    assert_eq!(result["executed_steps"], 1);
    assert_eq!(result["failed_step"]["step_index"], 1);
    assert_eq!(result["failed_step"]["tool"], "no_such_tool");
}
