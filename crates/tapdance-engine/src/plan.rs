//! Replayable automation plans.
//!
//! Every tool invocation in a session is appended to an [`InvocationLog`].
//! Export compresses the log into a [`Plan`]: provisioning calls are
//! environment setup and are dropped; observe calls are evidence-gathering,
//! not effects, so only a trailing observe survives as the plan's final
//! verification step. Execution replays steps strictly in order and stops on
//! the first failure.

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{EngineError, Result};

pub const OBSERVE_TOOL: &str = "observe";

/// Tools that set up the environment rather than express user intent; they
/// never appear in an exported plan.
const PROVISIONING_TOOLS: &[&str] = &[
    "list_devices",
    "set_active_device",
    "boot_device",
    "device_info",
];

/// Tools excluded from recording entirely (the plan machinery itself).
const UNRECORDED_TOOLS: &[&str] = &["plan_export", "plan_import", "plan_execute", "plan_status"];

pub fn is_provisioning(tool: &str) -> bool {
    PROVISIONING_TOOLS.contains(&tool)
}

pub fn is_recordable(tool: &str) -> bool {
    !UNRECORDED_TOOLS.contains(&tool)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggedCall {
    pub timestamp: DateTime<Utc>,
    pub tool: String,
    pub params: Value,
    pub success: bool,
    pub error: Option<String>,
}

/// Append-only record of a session's tool invocations.
#[derive(Default)]
pub struct InvocationLog {
    calls: Mutex<Vec<LoggedCall>>,
}

impl InvocationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, tool: &str, params: Value, success: bool, error: Option<String>) {
        if !is_recordable(tool) {
            return;
        }
        self.calls.lock().unwrap().push(LoggedCall {
            timestamp: Utc::now(),
            tool: tool.to_string(),
            params,
            success,
            error,
        });
    }

    pub fn calls(&self) -> Vec<LoggedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }

    /// Compress the log into a replayable plan. Provisioning calls are
    /// dropped; all observes are dropped except the final one when it trails
    /// the last state-changing step.
    pub fn export(&self, name: &str, description: Option<String>) -> Plan {
        let calls = self.calls();
        let mut steps = Vec::new();
        let mut trailing_observe: Option<PlanStep> = None;

        for call in &calls {
            if is_provisioning(&call.tool) {
                continue;
            }
            if call.tool == OBSERVE_TOOL {
                trailing_observe = Some(PlanStep {
                    tool: call.tool.clone(),
                    params: call.params.clone(),
                });
                continue;
            }
            // A state-changing step invalidates any buffered observe: the
            // evidence it gathered belongs before this action, not after.
            trailing_observe = None;
            steps.push(PlanStep {
                tool: call.tool.clone(),
                params: call.params.clone(),
            });
        }
        if let Some(observe) = trailing_observe {
            steps.push(observe);
        }

        info!(name, steps = steps.len(), recorded = calls.len(), "plan exported");
        Plan {
            name: name.to_string(),
            description,
            metadata: PlanMetadata::now(),
            steps,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub tool: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanMetadata {
    pub created_at: DateTime<Utc>,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub treatment: Option<String>,
}

impl PlanMetadata {
    fn now() -> Self {
        Self {
            created_at: Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            experiment: None,
            treatment: None,
        }
    }
}

/// A named, ordered, replayable sequence of tool invocations. Immutable once
/// loaded; steps are 0-indexed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub metadata: PlanMetadata,
    pub steps: Vec<PlanStep>,
}

impl Plan {
    /// Import a plan document, rejecting structural defects with an error
    /// that names what is wrong.
    pub fn from_json(doc: &Value) -> Result<Self> {
        let obj = doc
            .as_object()
            .ok_or_else(|| EngineError::Structural("plan document must be an object".into()))?;

        let name = obj
            .get("name")
            .and_then(Value::as_str)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| EngineError::Structural("plan document is missing 'name'".into()))?;
        let steps_value = obj
            .get("steps")
            .and_then(Value::as_array)
            .ok_or_else(|| EngineError::Structural("plan document is missing 'steps'".into()))?;

        let mut steps = Vec::with_capacity(steps_value.len());
        for (i, step) in steps_value.iter().enumerate() {
            let tool = step
                .get("tool")
                .and_then(Value::as_str)
                .filter(|t| !t.is_empty())
                .ok_or_else(|| {
                    EngineError::Structural(format!("step {i} has no recognizable 'tool' field"))
                })?;
            steps.push(PlanStep {
                tool: tool.to_string(),
                params: step.get("params").cloned().unwrap_or(Value::Null),
            });
        }

        let metadata = match obj.get("metadata") {
            Some(m) => serde_json::from_value(m.clone())
                .map_err(|e| EngineError::Structural(format!("bad plan metadata: {e}")))?,
            None => PlanMetadata::now(),
        };

        Ok(Plan {
            name: name.to_string(),
            description: obj
                .get("description")
                .and_then(Value::as_str)
                .map(String::from),
            metadata,
            steps,
        })
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).expect("plan serialization is infallible")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let doc: Value = serde_json::from_str(&raw)
            .map_err(|e| EngineError::Structural(format!("plan file is not valid JSON: {e}")))?;
        Self::from_json(&doc)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(&self.to_json())?)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedStep {
    pub step_index: usize,
    pub tool: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanExecutionResult {
    pub plan_name: String,
    pub total_steps: usize,
    pub start_step: usize,
    pub executed_steps: usize,
    pub completed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<FailedStep>,
}

/// Executes one plan step; implemented by the tool server so the executor
/// stays transport- and registry-agnostic.
#[async_trait]
pub trait StepRunner: Send + Sync {
    async fn run_step(&self, tool: &str, params: &Value) -> Result<Value>;
}

/// Replay `plan` from `start_step_index`. Steps run strictly in order; the
/// first failing step stops execution (retries are the concern of individual
/// tools, not this layer). A step failure is reported in the result, not as
/// `Err`; only an invalid resume index is an error.
pub async fn execute_plan(
    runner: &dyn StepRunner,
    plan: &Plan,
    start_step_index: i64,
) -> Result<PlanExecutionResult> {
    let total = plan.steps.len();
    if start_step_index < 0 || (start_step_index as usize >= total && !(total == 0 && start_step_index == 0)) {
        return Err(EngineError::OutOfBounds {
            index: start_step_index,
            max: total,
        });
    }
    let start = start_step_index as usize;

    let mut result = PlanExecutionResult {
        plan_name: plan.name.clone(),
        total_steps: total,
        start_step: start,
        executed_steps: 0,
        completed: false,
        failed_step: None,
    };

    for (offset, step) in plan.steps[start..].iter().enumerate() {
        let index = start + offset;
        debug!(plan = %plan.name, index, tool = %step.tool, "executing plan step");
        match runner.run_step(&step.tool, &step.params).await {
            Ok(_) => result.executed_steps += 1,
            Err(e) => {
                warn!(plan = %plan.name, index, tool = %step.tool, error = %e, "plan step failed");
                result.failed_step = Some(FailedStep {
                    step_index: index,
                    tool: step.tool.clone(),
                    error: e.to_string(),
                });
                return Ok(result);
            }
        }
    }
    result.completed = true;
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn log_with(calls: &[(&str, Value)]) -> InvocationLog {
        let log = InvocationLog::new();
        for (tool, params) in calls {
            log.record(tool, params.clone(), true, None);
        }
        log
    }

    #[test]
    fn export_drops_provisioning_and_collapses_observes() {
        let log = log_with(&[
            ("list_devices", json!({})),
            ("boot_device", json!({"device_id": "emulator-5554"})),
            ("observe", json!({"use_cache": false})),
            ("observe", json!({"use_cache": true})),
            ("tap", json!({"target": {"text": "Submit"}})),
            ("observe", json!({})),
            ("swipe", json!({"direction": "up"})),
            ("observe", json!({"final": true})),
        ]);
        let plan = log.export("checkout", None);

        let tools: Vec<&str> = plan.steps.iter().map(|s| s.tool.as_str()).collect();
        assert_eq!(tools, vec!["tap", "swipe", "observe"]);
        // Exactly the trailing observe survives, with its own params.
        assert_eq!(plan.steps[2].params, json!({"final": true}));
    }

    #[test]
    fn export_without_trailing_observe_keeps_actions_only() {
        let log = log_with(&[
            ("observe", json!({})),
            ("tap", json!({"x": 1})),
            ("observe", json!({})),
            ("tap", json!({"x": 2})),
        ]);
        let plan = log.export("taps", None);
        let tools: Vec<&str> = plan.steps.iter().map(|s| s.tool.as_str()).collect();
        assert_eq!(tools, vec!["tap", "tap"]);
    }

    #[test]
    fn plan_round_trip_preserves_step_list() {
        let log = log_with(&[
            ("set_active_device", json!({"device_id": "emulator-5554"})),
            ("observe", json!({})),
            ("tap", json!({"target": {"text": "Login"}})),
            ("type_text", json!({"text": "hunter2"})),
            ("observe", json!({})),
        ]);
        let exported = log.export("login", Some("log in flow".into()));
        let imported = Plan::from_json(&exported.to_json()).unwrap();
        assert_eq!(imported, exported);
        assert_eq!(imported.steps.len(), 3);
    }

    #[test]
    fn recorder_skips_plan_machinery() {
        let log = InvocationLog::new();
        log.record("plan_execute", json!({}), true, None);
        log.record("tap", json!({}), true, None);
        assert_eq!(log.len(), 1);
        assert_eq!(log.calls()[0].tool, "tap");
    }

    #[test]
    fn import_rejects_structural_defects() {
        let missing_name = json!({"steps": []});
        let err = Plan::from_json(&missing_name).unwrap_err();
        assert!(err.to_string().contains("name"), "{err}");

        let missing_steps = json!({"name": "p"});
        let err = Plan::from_json(&missing_steps).unwrap_err();
        assert!(err.to_string().contains("steps"), "{err}");

        let bad_step = json!({"name": "p", "steps": [{"params": {}}]});
        let err = Plan::from_json(&bad_step).unwrap_err();
        assert!(matches!(err, EngineError::Structural(_)));
        assert!(err.to_string().contains("step 0"), "{err}");

        assert!(Plan::from_json(&json!([1, 2])).is_err());
    }

    #[test]
    fn import_accepts_minimal_document() {
        let doc = json!({
            "name": "minimal",
            "steps": [{"tool": "tap", "params": {"x": 1, "y": 2}}, {"tool": "observe"}]
        });
        let plan = Plan::from_json(&doc).unwrap();
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[1].params, Value::Null);
    }

    struct ScriptedRunner {
        fail_at: Option<usize>,
        ran: Mutex<Vec<String>>,
    }

    impl ScriptedRunner {
        fn new(fail_at: Option<usize>) -> Self {
            Self {
                fail_at,
                ran: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl StepRunner for ScriptedRunner {
        async fn run_step(&self, tool: &str, _params: &Value) -> Result<Value> {
            let count = {
                let mut ran = self.ran.lock().unwrap();
                ran.push(tool.to_string());
                ran.len() - 1
            };
            if Some(count) == self.fail_at {
                return Err(EngineError::Timeout(format!("{tool} timed out")));
            }
            Ok(json!({"ok": true}))
        }
    }

    fn three_step_plan() -> Plan {
        Plan::from_json(&json!({
            "name": "p",
            "steps": [
                {"tool": "tap", "params": {"x": 1}},
                {"tool": "swipe", "params": {}},
                {"tool": "observe", "params": {}}
            ]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn full_run_executes_all_steps() {
        let runner = ScriptedRunner::new(None);
        let result = execute_plan(&runner, &three_step_plan(), 0).await.unwrap();
        assert!(result.completed);
        assert_eq!(result.executed_steps, 3);
        assert!(result.failed_step.is_none());
    }

    #[tokio::test]
    async fn resume_executes_remaining_steps() {
        let runner = ScriptedRunner::new(None);
        let result = execute_plan(&runner, &three_step_plan(), 1).await.unwrap();
        assert_eq!(result.executed_steps, 2);
        assert_eq!(result.start_step, 1);
        assert_eq!(runner.ran.lock().unwrap().as_slice(), ["swipe", "observe"]);
    }

    #[tokio::test]
    async fn failure_short_circuits() {
        // Runner fails on its second invocation, which is absolute step 2
        // when resuming from step 1.
        let runner = ScriptedRunner::new(Some(1));
        let result = execute_plan(&runner, &three_step_plan(), 1).await.unwrap();
        assert!(!result.completed);
        assert_eq!(result.executed_steps, 1);
        let failed = result.failed_step.unwrap();
        assert_eq!(failed.step_index, 2);
        assert_eq!(failed.tool, "observe");
        assert!(failed.error.contains("timed out"));
        // Nothing after the failed step ran.
        assert_eq!(runner.ran.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn out_of_bounds_resume_indexes() {
        let runner = ScriptedRunner::new(None);
        let plan = three_step_plan();

        let err = execute_plan(&runner, &plan, 3).await.unwrap_err();
        match err {
            EngineError::OutOfBounds { index, max } => {
                assert_eq!(index, 3);
                assert_eq!(max, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(execute_plan(&runner, &plan, -1).await.is_err());
    }

    #[tokio::test]
    async fn empty_plan_from_zero_succeeds() {
        let runner = ScriptedRunner::new(None);
        let empty = Plan::from_json(&json!({"name": "empty", "steps": []})).unwrap();
        let result = execute_plan(&runner, &empty, 0).await.unwrap();
        assert!(result.completed);
        assert_eq!(result.executed_steps, 0);

        assert!(execute_plan(&runner, &empty, 1).await.is_err());
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.json");
        let plan = three_step_plan();
        plan.save(&path).unwrap();
        let loaded = Plan::load(&path).unwrap();
        assert_eq!(loaded, plan);
    }
}
