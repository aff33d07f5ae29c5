//! Gesture and input tools. Every tool accepts either explicit coordinates
//! or an element query under `target`, and arms the stability detector
//! around the action so the next observation waits for the UI to settle.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::gesture::{Easing, GestureOptions, build_paths, build_pinch};
use crate::mcp::context::EngineContext;
use crate::mcp::server::{Tool, ToolRegistry, ToolSchema};
use crate::observation::{Insets, ObserveOptions, ScreenSize};
use crate::resolve::ElementQuery;
use crate::{EngineError, Result};

pub fn register_interaction_tools(
    registry: &mut ToolRegistry,
    context: Arc<EngineContext>,
) -> Result<()> {
    registry.register(Arc::new(TapTool::new(context.clone())))?;
    registry.register(Arc::new(LongPressTool::new(context.clone())))?;
    registry.register(Arc::new(SwipeTool::new(context.clone())))?;
    registry.register(Arc::new(PinchTool::new(context.clone())))?;
    registry.register(Arc::new(MultiFingerGestureTool::new(context.clone())))?;
    registry.register(Arc::new(TypeTextTool::new(context.clone())))?;
    registry.register(Arc::new(PressKeyTool::new(context)))?;
    Ok(())
}

/// Coordinates from `x`/`y` (or the given key names) or a resolved `target`
/// query, in that order of preference.
async fn resolve_point(
    context: &EngineContext,
    serial: &str,
    params: &Value,
    x_key: &str,
    y_key: &str,
) -> Result<(i32, i32)> {
    if let (Some(x), Some(y)) = (
        params.get(x_key).and_then(Value::as_i64),
        params.get(y_key).and_then(Value::as_i64),
    ) {
        return Ok((x as i32, y as i32));
    }
    if let Some(target) = params.get("target") {
        let query = ElementQuery::from_json(target)?;
        let element = context
            .resolve_on_screen(serial, &query, ObserveOptions::default())
            .await?;
        return Ok(element.center);
    }
    Err(EngineError::Validation(format!(
        "provide '{x_key}'/'{y_key}' coordinates or a 'target' query"
    )))
}

/// Screen metrics for path building, served from the observation cache
/// when the screen has not changed.
async fn screen_metrics(
    context: &EngineContext,
    serial: &str,
) -> Result<(ScreenSize, Insets)> {
    let observed = context
        .observe(
            serial,
            ObserveOptions {
                use_cache: true,
                wait_for_stable: false,
            },
        )
        .await?;
    Ok((observed.screen_size, observed.insets))
}

fn parse_easing(params: &Value) -> Result<Easing> {
    match params.get("easing").and_then(Value::as_str) {
        None => Ok(Easing::Linear),
        Some("linear") => Ok(Easing::Linear),
        Some("accelerate") => Ok(Easing::Accelerate),
        Some("decelerate") => Ok(Easing::Decelerate),
        Some("accelerate_decelerate") => Ok(Easing::AccelerateDecelerate),
        Some(other) => Err(EngineError::Validation(format!(
            "unknown easing '{other}' (expected linear, accelerate, decelerate, or accelerate_decelerate)"
        ))),
    }
}

fn gesture_options(params: &Value, default_duration_ms: u64) -> Result<GestureOptions> {
    let defaults = GestureOptions::default();
    Ok(GestureOptions {
        duration: Duration::from_millis(
            params
                .get("duration_ms")
                .and_then(Value::as_u64)
                .unwrap_or(default_duration_ms),
        ),
        easing: parse_easing(params)?,
        fingers: params
            .get("fingers")
            .and_then(Value::as_u64)
            .unwrap_or(1) as u8,
        randomize: params
            .get("randomize")
            .and_then(Value::as_bool)
            .unwrap_or(defaults.randomize),
        lift_at_end: params
            .get("lift_at_end")
            .and_then(Value::as_bool)
            .unwrap_or(defaults.lift_at_end),
        pressure: params
            .get("pressure")
            .and_then(Value::as_f64)
            .unwrap_or(defaults.pressure),
        include_system_insets: params
            .get("include_system_insets")
            .and_then(Value::as_bool)
            .unwrap_or(defaults.include_system_insets),
    })
}

fn target_schema() -> Value {
    json!({
        "type": "object",
        "description": "Element query: index, text, content_desc, or resource_id, \
                        with optional exact, case_sensitive, and container_id"
    })
}

pub struct TapTool {
    schema: ToolSchema,
    context: Arc<EngineContext>,
}

impl TapTool {
    pub fn new(context: Arc<EngineContext>) -> Self {
        Self {
            schema: ToolSchema {
                name: "tap".to_string(),
                description: "Tap at coordinates or on a resolved element".to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "x": { "type": "integer" },
                        "y": { "type": "integer" },
                        "target": target_schema(),
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
impl Tool for TapTool {
    fn schema(&self) -> &ToolSchema {
        &self.schema
    }

    async fn execute(&self, params: Value) -> Result<Value> {
        let serial = self.context.target_serial(&params).await?;
        let (x, y) = resolve_point(&self.context, &serial, &params, "x", "y").await?;
        let (_, verdict) = self
            .context
            .with_settling(&serial, || self.context.gestures.tap(&serial, x, y))
            .await?;
        Ok(json!({ "tapped": { "x": x, "y": y }, "stability": verdict }))
    }
}

pub struct LongPressTool {
    schema: ToolSchema,
    context: Arc<EngineContext>,
}

impl LongPressTool {
    pub fn new(context: Arc<EngineContext>) -> Self {
        Self {
            schema: ToolSchema {
                name: "long_press".to_string(),
                description: "Press and hold at coordinates or on a resolved element".to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "x": { "type": "integer" },
                        "y": { "type": "integer" },
                        "target": target_schema(),
                        "duration_ms": { "type": "integer", "minimum": 1 },
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
impl Tool for LongPressTool {
    fn schema(&self) -> &ToolSchema {
        &self.schema
    }

    async fn execute(&self, params: Value) -> Result<Value> {
        let serial = self.context.target_serial(&params).await?;
        let (x, y) = resolve_point(&self.context, &serial, &params, "x", "y").await?;
        let duration = Duration::from_millis(
            params.get("duration_ms").and_then(Value::as_u64).unwrap_or(800),
        );
        let (_, verdict) = self
            .context
            .with_settling(&serial, || {
                self.context.gestures.long_press(&serial, x, y, duration)
            })
            .await?;
        Ok(json!({
            "pressed": { "x": x, "y": y },
            "duration_ms": duration.as_millis() as u64,
            "stability": verdict
        }))
    }
}

pub struct SwipeTool {
    schema: ToolSchema,
    context: Arc<EngineContext>,
}

impl SwipeTool {
    pub fn new(context: Arc<EngineContext>) -> Self {
        Self {
            schema: ToolSchema {
                name: "swipe".to_string(),
                description: "Swipe from a start point (coordinates or element) to an end point"
                    .to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "x1": { "type": "integer" },
                        "y1": { "type": "integer" },
                        "target": target_schema(),
                        "x2": { "type": "integer" },
                        "y2": { "type": "integer" },
                        "dx": { "type": "integer", "description": "End offset from start, alternative to x2/y2" },
                        "dy": { "type": "integer" },
                        "duration_ms": { "type": "integer", "minimum": 1 },
                        "easing": { "type": "string", "enum": ["linear", "accelerate", "decelerate", "accelerate_decelerate"] },
                        "randomize": { "type": "boolean" },
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
impl Tool for SwipeTool {
    fn schema(&self) -> &ToolSchema {
        &self.schema
    }

    async fn execute(&self, params: Value) -> Result<Value> {
        let serial = self.context.target_serial(&params).await?;
        let (x1, y1) = resolve_point(&self.context, &serial, &params, "x1", "y1").await?;
        let (x2, y2) = if let (Some(x2), Some(y2)) = (
            params.get("x2").and_then(Value::as_i64),
            params.get("y2").and_then(Value::as_i64),
        ) {
            (x2 as i32, y2 as i32)
        } else if let (Some(dx), Some(dy)) = (
            params.get("dx").and_then(Value::as_i64),
            params.get("dy").and_then(Value::as_i64),
        ) {
            (x1 + dx as i32, y1 + dy as i32)
        } else {
            return Err(EngineError::Validation(
                "provide an end point as 'x2'/'y2' or 'dx'/'dy'".into(),
            ));
        };

        let options = gesture_options(&params, 300)?;
        let (screen, insets) = screen_metrics(&self.context, &serial).await?;
        let paths = build_paths(&[(x1, y1), (x2, y2)], screen, insets, &options)?;
        let (_, verdict) = self
            .context
            .with_settling(&serial, || {
                self.context.gestures.dispatch(&serial, &paths, &options)
            })
            .await?;
        Ok(json!({
            "swiped": { "from": { "x": x1, "y": y1 }, "to": { "x": x2, "y": y2 } },
            "stability": verdict
        }))
    }
}

pub struct PinchTool {
    schema: ToolSchema,
    context: Arc<EngineContext>,
}

impl PinchTool {
    pub fn new(context: Arc<EngineContext>) -> Self {
        Self {
            schema: ToolSchema {
                name: "pinch".to_string(),
                description: "Two-finger pinch around a center point; spread growing from \
                              start_spread to end_spread zooms in, shrinking zooms out \
                              (requires a rooted device)"
                    .to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "x": { "type": "integer" },
                        "y": { "type": "integer" },
                        "target": target_schema(),
                        "start_spread": { "type": "integer", "minimum": 1 },
                        "end_spread": { "type": "integer", "minimum": 1 },
                        "duration_ms": { "type": "integer", "minimum": 1 },
                        "easing": { "type": "string", "enum": ["linear", "accelerate", "decelerate", "accelerate_decelerate"] },
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
impl Tool for PinchTool {
    fn schema(&self) -> &ToolSchema {
        &self.schema
    }

    async fn execute(&self, params: Value) -> Result<Value> {
        let serial = self.context.target_serial(&params).await?;
        let center = resolve_point(&self.context, &serial, &params, "x", "y").await?;
        let start_spread = params
            .get("start_spread")
            .and_then(Value::as_i64)
            .unwrap_or(100) as i32;
        let end_spread = params
            .get("end_spread")
            .and_then(Value::as_i64)
            .unwrap_or(300) as i32;

        let mut options = gesture_options(&params, 400)?;
        options.fingers = 2;
        let (screen, insets) = screen_metrics(&self.context, &serial).await?;
        let paths = build_pinch(center, start_spread, end_spread, screen, insets, &options)?;
        let (_, verdict) = self
            .context
            .with_settling(&serial, || {
                self.context.gestures.dispatch(&serial, &paths, &options)
            })
            .await?;
        Ok(json!({
            "pinched": {
                "center": { "x": center.0, "y": center.1 },
                "start_spread": start_spread,
                "end_spread": end_spread
            },
            "stability": verdict
        }))
    }
}

pub struct MultiFingerGestureTool {
    schema: ToolSchema,
    context: Arc<EngineContext>,
}

impl MultiFingerGestureTool {
    pub fn new(context: Arc<EngineContext>) -> Self {
        Self {
            schema: ToolSchema {
                name: "multi_finger_gesture".to_string(),
                description: "Drag one or more fingers along a point path (more than one \
                              finger requires a rooted device)"
                    .to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "points": {
                            "type": "array",
                            "minItems": 1,
                            "items": {
                                "type": "array",
                                "items": { "type": "integer" },
                                "minItems": 2,
                                "maxItems": 2
                            },
                            "description": "Path waypoints as [x, y] pairs"
                        },
                        "fingers": { "type": "integer", "minimum": 1, "maximum": 10 },
                        "duration_ms": { "type": "integer", "minimum": 1 },
                        "easing": { "type": "string", "enum": ["linear", "accelerate", "decelerate", "accelerate_decelerate"] },
                        "randomize": { "type": "boolean" },
                        "pressure": { "type": "number", "minimum": 0, "maximum": 1 },
                        "lift_at_end": { "type": "boolean" },
                        "device_id": { "type": "string" }
                    },
                    "required": ["points"],
                    "additionalProperties": false
                }),
                reports_progress: false,
            },
            context,
        }
    }
}

fn parse_points(params: &Value) -> Result<Vec<(i32, i32)>> {
    let raw = params
        .get("points")
        .and_then(Value::as_array)
        .ok_or_else(|| EngineError::Validation("missing required parameter 'points'".into()))?;
    raw.iter()
        .map(|pair| {
            let xy = pair.as_array().filter(|a| a.len() == 2).ok_or_else(|| {
                EngineError::Validation("each point must be an [x, y] pair".into())
            })?;
            match (xy[0].as_i64(), xy[1].as_i64()) {
                (Some(x), Some(y)) => Ok((x as i32, y as i32)),
                _ => Err(EngineError::Validation(
                    "point coordinates must be integers".into(),
                )),
            }
        })
        .collect()
}

#[async_trait]
impl Tool for MultiFingerGestureTool {
    fn schema(&self) -> &ToolSchema {
        &self.schema
    }

    async fn execute(&self, params: Value) -> Result<Value> {
        let serial = self.context.target_serial(&params).await?;
        let points = parse_points(&params)?;
        let options = gesture_options(&params, 500)?;
        let (screen, insets) = screen_metrics(&self.context, &serial).await?;
        let paths = build_paths(&points, screen, insets, &options)?;
        let (_, verdict) = self
            .context
            .with_settling(&serial, || {
                self.context.gestures.dispatch(&serial, &paths, &options)
            })
            .await?;
        Ok(json!({
            "fingers": options.fingers,
            "samples_per_finger": paths.first().map(|p| p.samples.len()).unwrap_or(0),
            "stability": verdict
        }))
    }
}

pub struct TypeTextTool {
    schema: ToolSchema,
    context: Arc<EngineContext>,
}

impl TypeTextTool {
    pub fn new(context: Arc<EngineContext>) -> Self {
        Self {
            schema: ToolSchema {
                name: "type_text".to_string(),
                description: "Type text into the focused field, optionally tapping a target \
                              element first to focus it"
                    .to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "text": { "type": "string" },
                        "target": target_schema(),
                        "device_id": { "type": "string" }
                    },
                    "required": ["text"],
                    "additionalProperties": false
                }),
                reports_progress: false,
            },
            context,
        }
    }
}

#[async_trait]
impl Tool for TypeTextTool {
    fn schema(&self) -> &ToolSchema {
        &self.schema
    }

    async fn execute(&self, params: Value) -> Result<Value> {
        let serial = self.context.target_serial(&params).await?;
        let text = params
            .get("text")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::Validation("missing required parameter 'text'".into()))?;

        if let Some(target) = params.get("target") {
            let query = ElementQuery::from_json(target)?;
            let element = self
                .context
                .resolve_on_screen(&serial, &query, ObserveOptions::default())
                .await?;
            self.context
                .gestures
                .tap(&serial, element.center.0, element.center.1)
                .await?;
        }

        let (out, verdict) = self
            .context
            .with_settling(&serial, || async {
                Ok(self.context.bridge.type_text(&serial, text).await?)
            })
            .await?;
        if !out.success() {
            return Err(EngineError::Validation(format!(
                "text input failed: {}",
                out.stderr.trim()
            )));
        }
        Ok(json!({ "typed": text, "stability": verdict }))
    }
}

/// Friendly key names map to Android keycodes; anything else passes through
/// (raw `KEYCODE_*` names and numeric codes both work).
fn keycode_for(key: &str) -> String {
    match key.to_ascii_lowercase().as_str() {
        "back" => "KEYCODE_BACK".to_string(),
        "home" => "KEYCODE_HOME".to_string(),
        "enter" => "KEYCODE_ENTER".to_string(),
        "tab" => "KEYCODE_TAB".to_string(),
        "delete" | "backspace" => "KEYCODE_DEL".to_string(),
        "menu" => "KEYCODE_MENU".to_string(),
        "app_switch" | "recents" => "KEYCODE_APP_SWITCH".to_string(),
        "volume_up" => "KEYCODE_VOLUME_UP".to_string(),
        "volume_down" => "KEYCODE_VOLUME_DOWN".to_string(),
        "power" => "KEYCODE_POWER".to_string(),
        _ => key.to_string(),
    }
}

pub struct PressKeyTool {
    schema: ToolSchema,
    context: Arc<EngineContext>,
}

impl PressKeyTool {
    pub fn new(context: Arc<EngineContext>) -> Self {
        Self {
            schema: ToolSchema {
                name: "press_key".to_string(),
                description: "Send a key event by friendly name (back, home, enter, ...), \
                              KEYCODE_* constant, or numeric code"
                    .to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "key": { "type": "string" },
                        "device_id": { "type": "string" }
                    },
                    "required": ["key"],
                    "additionalProperties": false
                }),
                reports_progress: false,
            },
            context,
        }
    }
}

#[async_trait]
impl Tool for PressKeyTool {
    fn schema(&self) -> &ToolSchema {
        &self.schema
    }

    async fn execute(&self, params: Value) -> Result<Value> {
        let serial = self.context.target_serial(&params).await?;
        let key = params
            .get("key")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::Validation("missing required parameter 'key'".into()))?;
        let keycode = keycode_for(key);
        let (out, verdict) = self
            .context
            .with_settling(&serial, || async {
                Ok(self.context.bridge.key_event(&serial, &keycode).await?)
            })
            .await?;
        if !out.success() {
            return Err(EngineError::Validation(format!(
                "key event '{keycode}' failed: {}",
                out.stderr.trim()
            )));
        }
        Ok(json!({ "key": keycode, "stability": verdict }))
    }
}
