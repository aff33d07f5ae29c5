//! Shared engine state behind the tool surface.
//!
//! One context per process wires the bridge, session manager, observation
//! cache, stability detector, and gesture dispatcher into the observe →
//! wait-for-stable → resolve → act pipeline the tools compose.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

use tapdance_adb::DeviceBridge;

use crate::cache::{CacheBudget, ScreenSignature, ViewHierarchyCache};
use crate::gesture::GestureDispatcher;
use crate::observation::{ObserveOptions, ObserveResult, Observer};
use crate::plan::{InvocationLog, Plan, PlanExecutionResult};
use crate::resolve::{Element, ElementQuery, resolve_required};
use crate::session::{DeviceSessionManager, SessionCriteria};
use crate::stability::{StabilityConfig, StabilityDetector, StabilityState, StabilityVerdict};
use crate::{EngineError, Result};

/// Progress event streamed to transports that support it.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub tool: String,
    pub message: String,
    pub current: u64,
    pub total: Option<u64>,
}

pub struct EngineContext {
    pub bridge: Arc<dyn DeviceBridge>,
    pub sessions: Arc<DeviceSessionManager>,
    pub observer: Observer,
    pub cache: ViewHierarchyCache,
    pub stability: StabilityDetector,
    pub gestures: GestureDispatcher,
    pub log: InvocationLog,
    /// Imported and exported plans, by name.
    pub plans: Mutex<HashMap<String, Plan>>,
    /// Result of the most recent plan run, for status queries.
    pub last_execution: Mutex<Option<PlanExecutionResult>>,
    /// Most recent signature per device serial. Devices are observed
    /// independently; one device's screen change never touches another's.
    last_signature: Mutex<HashMap<String, ScreenSignature>>,
    progress: broadcast::Sender<ProgressEvent>,
}

impl EngineContext {
    pub fn new(bridge: Arc<dyn DeviceBridge>, sessions: Arc<DeviceSessionManager>) -> Self {
        let (progress, _) = broadcast::channel(64);
        Self {
            observer: Observer::new(bridge.clone()),
            cache: ViewHierarchyCache::new(CacheBudget::default()),
            stability: StabilityDetector::new(bridge.clone(), StabilityConfig::default()),
            gestures: GestureDispatcher::new(bridge.clone()),
            log: InvocationLog::new(),
            plans: Mutex::new(HashMap::new()),
            last_execution: Mutex::new(None),
            last_signature: Mutex::new(HashMap::new()),
            progress,
            bridge,
            sessions,
        }
    }

    pub fn subscribe_progress(&self) -> broadcast::Receiver<ProgressEvent> {
        self.progress.subscribe()
    }

    pub fn report_progress(&self, event: ProgressEvent) {
        // Nobody listening is fine; progress is best-effort.
        let _ = self.progress.send(event);
    }

    /// Resolve the device a tool call addresses: an explicit `device_id`
    /// param, the pinned device, or the selection policy's pick.
    pub async fn target_serial(&self, params: &Value) -> Result<String> {
        let criteria = match params.get("device_id").and_then(Value::as_str) {
            Some(id) => SessionCriteria::device(id),
            None => SessionCriteria::default(),
        };
        let session = self.sessions.ensure_ready(&criteria).await?;
        Ok(session.device.id.clone())
    }

    /// The observation pipeline: gate on stability, then serve from cache on
    /// an unchanged signature, else extract fresh and re-populate.
    pub async fn observe(&self, serial: &str, options: ObserveOptions) -> Result<ObserveResult> {
        let mut signature = self.observer.signature(serial).await?;

        if options.wait_for_stable && self.stability.state(serial) == StabilityState::Settling {
            let verdict = self
                .stability
                .wait_for_stable(serial, &signature.package)
                .await?;
            if !verdict.stable {
                debug!(serial, "proceeding with unstable UI after timeout");
            }
            // The layout may have advanced while settling.
            signature = self.observer.signature(serial).await?;
        }

        let prior = self
            .last_signature
            .lock()
            .unwrap()
            .insert(serial.to_string(), signature.clone());
        if let Some(prior) = prior {
            if prior != signature {
                self.cache.invalidate(&prior);
            }
        }

        if options.use_cache {
            if let Some(hit) = self.cache.get(&signature) {
                debug!(serial, "observation served from cache");
                return Ok(hit);
            }
        }

        let fresh = self.observer.extract(serial).await?;
        self.cache.insert(signature, fresh.clone());
        Ok(fresh)
    }

    /// Observe and resolve a query to a concrete element.
    pub async fn resolve_on_screen(
        &self,
        serial: &str,
        query: &ElementQuery,
        options: ObserveOptions,
    ) -> Result<Element> {
        let observed = self.observe(serial, options).await?;
        let root = observed.root.as_ref().ok_or_else(|| {
            EngineError::Validation(format!(
                "no hierarchy available: {}",
                observed.error.as_deref().unwrap_or("unknown extraction failure")
            ))
        })?;
        resolve_required(query, root)
    }

    /// Arm the stability detector, run the action, then evaluate settling.
    pub async fn with_settling<F, Fut, T>(&self, serial: &str, action: F) -> Result<(T, StabilityVerdict)>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        self.stability.arm(serial);
        let value = action().await?;
        let known = self
            .last_signature
            .lock()
            .unwrap()
            .get(serial)
            .map(|s| s.package.clone());
        let package = match known {
            Some(package) => package,
            // Nothing observed yet; ask the device who is foreground.
            None => self.observer.signature(serial).await?.package,
        };
        let verdict = self.stability.wait_for_stable(serial, &package).await?;
        Ok((value, verdict))
    }
}
