//! The registered tool surface, grouped by concern.

pub mod device_tools;
pub mod interaction_tools;
pub mod observation_tools;
pub mod plan_tools;

use std::sync::{Arc, Weak};

use crate::Result;

use super::context::EngineContext;
use super::server::{McpServer, ToolRegistry};

/// Populate a registry with the full tool surface.
pub fn register_all(
    registry: &mut ToolRegistry,
    context: Arc<EngineContext>,
    server: Weak<McpServer>,
) -> Result<()> {
    device_tools::register_device_tools(registry, context.clone())?;
    observation_tools::register_observation_tools(registry, context.clone())?;
    interaction_tools::register_interaction_tools(registry, context.clone())?;
    plan_tools::register_plan_tools(registry, context, server)?;
    Ok(())
}
