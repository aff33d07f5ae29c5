//! Tool registry and protocol server core.
//!
//! The registry is a process-wide table populated once at startup; the
//! server validates parameters against each tool's JSON schema, dispatches
//! with a per-call timeout, and turns every failure into a structured
//! payload instead of crashing the process. Transports (stdio, HTTP, SSE)
//! frame requests differently but share these semantics.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::time::timeout;
use tracing::{debug, warn};

use super::context::EngineContext;
use super::error_codes::ErrorCode;
use crate::plan::StepRunner;
use crate::{EngineError, Result};

#[derive(Debug, Serialize, Deserialize)]
pub struct ToolRequest {
    pub tool_name: String,
    pub params: Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ToolResponse {
    pub tool_name: String,
    pub result: Value,
    pub success: bool,
}

#[derive(Debug, Clone)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
    pub reports_progress: bool,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn schema(&self) -> &ToolSchema;
    async fn execute(&self, params: Value) -> Result<Value>;
}

struct RegisteredTool {
    tool: Arc<dyn Tool>,
    validator: jsonschema::Validator,
}

/// Process-wide tool table. Built once at startup, rebuildable per test
/// fixture; lookups are exact and case-sensitive.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<()> {
        let schema = tool.schema().clone();
        let validator = jsonschema::validator_for(&schema.parameters).map_err(|e| {
            EngineError::Validation(format!("tool '{}' has an invalid schema: {e}", schema.name))
        })?;
        self.tools
            .insert(schema.name.clone(), RegisteredTool { tool, validator });
        Ok(())
    }

    fn get(&self, name: &str) -> Option<&RegisteredTool> {
        self.tools.get(name)
    }

    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self
            .tools
            .values()
            .map(|t| t.tool.schema().clone())
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

pub struct McpServer {
    registry: RwLock<ToolRegistry>,
    context: Arc<EngineContext>,
    call_timeout: Duration,
}

impl McpServer {
    /// Build the server and populate the registry with every tool category.
    /// Plan execution replays steps through the server itself, so the plan
    /// tools get a weak handle to the server being constructed.
    pub fn new(context: Arc<EngineContext>) -> Result<Arc<Self>> {
        let mut registration: Result<()> = Ok(());
        let server = Arc::new_cyclic(|weak: &Weak<McpServer>| {
            let mut registry = ToolRegistry::new();
            registration = super::tools::register_all(&mut registry, context.clone(), weak.clone());
            Self {
                registry: RwLock::new(registry),
                context: context.clone(),
                call_timeout: Duration::from_secs(60),
            }
        });
        registration?;
        Ok(server)
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.context
    }

    pub fn tool_schemas(&self) -> Vec<ToolSchema> {
        self.registry
            .read()
            .map(|r| r.schemas())
            .unwrap_or_default()
    }

    pub fn ping(&self) -> Value {
        json!({
            "status": "ok",
            "tools": self.registry.read().map(|r| r.len()).unwrap_or(0),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        })
    }

    /// Validate, dispatch, and record one tool call. Tool-level failures
    /// come back as a structured `success: false` payload; `Err` is
    /// reserved for requests the server cannot route (unknown tool).
    pub async fn call_tool(&self, request: ToolRequest) -> Result<ToolResponse> {
        let ToolRequest { tool_name, params } = request;
        debug!(tool = %tool_name, "tool call");

        let (tool, validation_error) = {
            let registry = self
                .registry
                .read()
                .map_err(|_| EngineError::Validation("tool registry is poisoned".into()))?;
            let Some(registered) = registry.get(&tool_name) else {
                return Err(EngineError::Validation(format!(
                    "tool not found: {tool_name}"
                )));
            };
            let validation_error = registered
                .validator
                .iter_errors(&params)
                .map(|e| format!("{} (at {})", e, e.instance_path))
                .next();
            (registered.tool.clone(), validation_error)
        };

        if let Some(detail) = validation_error {
            let error = EngineError::Validation(detail);
            self.context
                .log
                .record(&tool_name, params, false, Some(error.to_string()));
            return Ok(failure_response(tool_name, &error));
        }

        let outcome = timeout(self.call_timeout, tool.execute(params.clone()))
            .await
            .unwrap_or_else(|_| {
                Err(EngineError::Timeout(format!(
                    "tool '{tool_name}' exceeded {:?}",
                    self.call_timeout
                )))
            });

        match outcome {
            Ok(result) => {
                self.context.log.record(&tool_name, params, true, None);
                Ok(ToolResponse {
                    tool_name,
                    result,
                    success: true,
                })
            }
            Err(error) => {
                warn!(tool = %tool_name, %error, "tool call failed");
                self.context
                    .log
                    .record(&tool_name, params, false, Some(error.to_string()));
                Ok(failure_response(tool_name, &error))
            }
        }
    }
}

fn failure_response(tool_name: String, error: &EngineError) -> ToolResponse {
    ToolResponse {
        tool_name,
        result: json!({
            "error": {
                "kind": error.kind(),
                "code": ErrorCode::for_error(error),
                "message": error.to_string(),
            }
        }),
        success: false,
    }
}

/// Plan steps replay through the same validated call path as live clients.
#[async_trait]
impl StepRunner for McpServer {
    async fn run_step(&self, tool: &str, params: &Value) -> Result<Value> {
        let response = self
            .call_tool(ToolRequest {
                tool_name: tool.to_string(),
                params: params.clone(),
            })
            .await?;
        if response.success {
            Ok(response.result)
        } else {
            let message = response.result["error"]["message"]
                .as_str()
                .unwrap_or("tool reported failure")
                .to_string();
            Err(EngineError::Validation(message))
        }
    }
}
