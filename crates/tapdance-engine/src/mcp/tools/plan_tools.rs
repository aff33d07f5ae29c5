//! Plan recording surface: export the session log, import plan files, and
//! replay them through the live tool server.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::info;

use crate::mcp::context::{EngineContext, ProgressEvent};
use crate::mcp::server::{McpServer, Tool, ToolRegistry, ToolSchema};
use crate::plan::{Plan, StepRunner, execute_plan};
use crate::{EngineError, Result};

pub fn register_plan_tools(
    registry: &mut ToolRegistry,
    context: Arc<EngineContext>,
    server: Weak<McpServer>,
) -> Result<()> {
    registry.register(Arc::new(PlanExportTool::new(context.clone())))?;
    registry.register(Arc::new(PlanImportTool::new(context.clone())))?;
    registry.register(Arc::new(PlanExecuteTool::new(context.clone(), server)))?;
    registry.register(Arc::new(PlanStatusTool::new(context)))?;
    Ok(())
}

pub struct PlanExportTool {
    schema: ToolSchema,
    context: Arc<EngineContext>,
}

impl PlanExportTool {
    pub fn new(context: Arc<EngineContext>) -> Self {
        Self {
            schema: ToolSchema {
                name: "plan_export".to_string(),
                description: "Compress the session's recorded tool calls into a named, \
                              replayable plan"
                    .to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "name": { "type": "string" },
                        "description": { "type": "string" },
                        "path": {
                            "type": "string",
                            "description": "Also write the plan to this JSON file"
                        }
                    },
                    "required": ["name"],
                    "additionalProperties": false
                }),
                reports_progress: false,
            },
            context,
        }
    }
}

#[async_trait]
impl Tool for PlanExportTool {
    fn schema(&self) -> &ToolSchema {
        &self.schema
    }

    async fn execute(&self, params: Value) -> Result<Value> {
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::Validation("missing required parameter 'name'".into()))?;
        let description = params
            .get("description")
            .and_then(Value::as_str)
            .map(String::from);

        let plan = self.context.log.export(name, description);
        if let Some(path) = params.get("path").and_then(Value::as_str) {
            plan.save(Path::new(path))?;
        }

        let doc = plan.to_json();
        let total_steps = plan.steps.len();
        self.context
            .plans
            .lock()
            .unwrap()
            .insert(name.to_string(), plan);
        Ok(json!({ "plan": doc, "total_steps": total_steps }))
    }
}

pub struct PlanImportTool {
    schema: ToolSchema,
    context: Arc<EngineContext>,
}

impl PlanImportTool {
    pub fn new(context: Arc<EngineContext>) -> Self {
        Self {
            schema: ToolSchema {
                name: "plan_import".to_string(),
                description: "Load a plan from a JSON file or an inline document".to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "path": { "type": "string" },
                        "plan": {
                            "type": "object",
                            "description": "Inline plan document, alternative to 'path'"
                        }
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
impl Tool for PlanImportTool {
    fn schema(&self) -> &ToolSchema {
        &self.schema
    }

    async fn execute(&self, params: Value) -> Result<Value> {
        let plan = match (
            params.get("path").and_then(Value::as_str),
            params.get("plan"),
        ) {
            (Some(path), None) => Plan::load(Path::new(path))?,
            (None, Some(doc)) => Plan::from_json(doc)?,
            _ => {
                return Err(EngineError::Validation(
                    "provide exactly one of 'path' or 'plan'".into(),
                ));
            }
        };

        info!(name = %plan.name, steps = plan.steps.len(), "plan imported");
        let summary = json!({ "name": plan.name, "total_steps": plan.steps.len() });
        self.context
            .plans
            .lock()
            .unwrap()
            .insert(plan.name.clone(), plan);
        Ok(summary)
    }
}

/// Replays a plan through the server's own validated call path, so replayed
/// steps behave exactly like live client calls.
pub struct PlanExecuteTool {
    schema: ToolSchema,
    context: Arc<EngineContext>,
    server: Weak<McpServer>,
}

impl PlanExecuteTool {
    pub fn new(context: Arc<EngineContext>, server: Weak<McpServer>) -> Self {
        Self {
            schema: ToolSchema {
                name: "plan_execute".to_string(),
                description: "Execute an imported plan from a given step, stopping at the \
                              first failure"
                    .to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "name": { "type": "string", "description": "Name of an imported plan" },
                        "path": {
                            "type": "string",
                            "description": "Plan file to load and run, alternative to 'name'"
                        },
                        "start_step": { "type": "integer" }
                    },
                    "additionalProperties": false
                }),
                reports_progress: true,
            },
            context,
            server,
        }
    }
}

#[async_trait]
impl Tool for PlanExecuteTool {
    fn schema(&self) -> &ToolSchema {
        &self.schema
    }

    async fn execute(&self, params: Value) -> Result<Value> {
        let plan = match (
            params.get("name").and_then(Value::as_str),
            params.get("path").and_then(Value::as_str),
        ) {
            (Some(name), None) => self
                .context
                .plans
                .lock()
                .unwrap()
                .get(name)
                .cloned()
                .ok_or_else(|| {
                    EngineError::Validation(format!("no imported plan named '{name}'"))
                })?,
            (None, Some(path)) => Plan::load(Path::new(path))?,
            _ => {
                return Err(EngineError::Validation(
                    "provide exactly one of 'name' or 'path'".into(),
                ));
            }
        };
        let start_step = params.get("start_step").and_then(Value::as_i64).unwrap_or(0);

        let server = self.server.upgrade().ok_or_else(|| {
            EngineError::Validation("tool server is no longer running".into())
        })?;
        let runner = ReportingRunner {
            server: &server,
            context: &self.context,
            total: plan.steps.len() as u64,
            done: AtomicU64::new(0),
        };
        let result = execute_plan(&runner, &plan, start_step).await?;
        *self.context.last_execution.lock().unwrap() = Some(result.clone());
        Ok(serde_json::to_value(&result)?)
    }
}

/// Delegates each step to the live server and announces progress on the
/// context's broadcast channel.
struct ReportingRunner<'a> {
    server: &'a McpServer,
    context: &'a EngineContext,
    total: u64,
    done: AtomicU64,
}

#[async_trait]
impl StepRunner for ReportingRunner<'_> {
    async fn run_step(&self, tool: &str, params: &Value) -> Result<Value> {
        let current = self.done.fetch_add(1, Ordering::SeqCst) + 1;
        self.context.report_progress(ProgressEvent {
            tool: "plan_execute".to_string(),
            message: format!("running step: {tool}"),
            current,
            total: Some(self.total),
        });
        self.server.run_step(tool, params).await
    }
}

pub struct PlanStatusTool {
    schema: ToolSchema,
    context: Arc<EngineContext>,
}

impl PlanStatusTool {
    pub fn new(context: Arc<EngineContext>) -> Self {
        Self {
            schema: ToolSchema {
                name: "plan_status".to_string(),
                description: "Report loaded plans, recorded call count, and the last \
                              execution result"
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
impl Tool for PlanStatusTool {
    fn schema(&self) -> &ToolSchema {
        &self.schema
    }

    async fn execute(&self, _params: Value) -> Result<Value> {
        let plans: Vec<Value> = self
            .context
            .plans
            .lock()
            .unwrap()
            .values()
            .map(|p| json!({ "name": p.name, "total_steps": p.steps.len() }))
            .collect();
        Ok(json!({
            "plans": plans,
            "recorded_calls": self.context.log.len(),
            "last_execution": *self.context.last_execution.lock().unwrap(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{DeviceDiscovery, DeviceSessionManager};
    use crate::testutil::MockBridge;
    use tapdance_adb::Device;
    use tempfile::tempdir;

    struct EmptyDiscovery;

    #[async_trait]
    impl DeviceDiscovery for EmptyDiscovery {
        async fn list(&self) -> Result<Vec<Device>> {
            Ok(Vec::new())
        }
    }

    fn context() -> Arc<EngineContext> {
        let bridge = Arc::new(MockBridge::new());
        let sessions = Arc::new(DeviceSessionManager::new(Arc::new(EmptyDiscovery)));
        Arc::new(EngineContext::new(bridge, sessions))
    }

    #[tokio::test]
    async fn export_names_and_stores_the_plan() {
        let ctx = context();
        ctx.log.record("tap", json!({ "x": 1, "y": 2 }), true, None);
        ctx.log.record("observe", json!({}), true, None);

        let tool = PlanExportTool::new(ctx.clone());
        let result = tool
            .execute(json!({ "name": "login", "description": "sign-in flow" }))
            .await
            .unwrap();
        assert_eq!(result["total_steps"], 2);
        assert_eq!(result["plan"]["name"], "login");
        assert!(ctx.plans.lock().unwrap().contains_key("login"));
    }

    #[tokio::test]
    async fn export_writes_plan_file_when_asked() {
        let ctx = context();
        ctx.log.record("tap", json!({ "x": 1, "y": 2 }), true, None);
        let dir = tempdir().unwrap();
        let path = dir.path().join("login.json");

        let tool = PlanExportTool::new(ctx);
        tool.execute(json!({ "name": "login", "path": path.to_str().unwrap() }))
            .await
            .unwrap();
        let reloaded = Plan::load(&path).unwrap();
        assert_eq!(reloaded.name, "login");
        assert_eq!(reloaded.steps.len(), 1);
    }

    #[tokio::test]
    async fn import_rejects_ambiguous_sources() {
        let tool = PlanImportTool::new(context());
        let err = tool
            .execute(json!({ "path": "a.json", "plan": { "name": "x", "steps": [] } }))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn import_surfaces_structural_defects() {
        let tool = PlanImportTool::new(context());
        let err = tool
            .execute(json!({ "plan": { "name": "broken", "steps": [{ "params": {} }] } }))
            .await
            .unwrap_err();
        match err {
            EngineError::Structural(msg) => assert!(msg.contains("step 0")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn execute_requires_a_live_server() {
        let ctx = context();
        ctx.plans.lock().unwrap().insert(
            "p".to_string(),
            Plan::from_json(&json!({ "name": "p", "steps": [] })).unwrap(),
        );
        let tool = PlanExecuteTool::new(ctx, Weak::new());
        let err = tool.execute(json!({ "name": "p" })).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn status_reports_loaded_plans() {
        let ctx = context();
        ctx.plans.lock().unwrap().insert(
            "login".to_string(),
            Plan::from_json(&json!({ "name": "login", "steps": [] })).unwrap(),
        );
        let tool = PlanStatusTool::new(ctx);
        let result = tool.execute(json!({})).await.unwrap();
        assert_eq!(result["plans"][0]["name"], "login");
        assert_eq!(result["recorded_calls"], 0);
        assert!(result["last_execution"].is_null());
    }
}
