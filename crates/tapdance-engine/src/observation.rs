//! Screen observation: raw dump extraction, dumpsys parsing, and the
//! categorized [`ObserveResult`] the rest of the engine works from.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use tapdance_adb::DeviceBridge;

use crate::Result;
use crate::cache::ScreenSignature;
use crate::hierarchy::{Bounds, ViewHierarchyNode, parse_dump};

const DUMP_REMOTE_PATH: &str = "/sdcard/window_dump.xml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ScreenSize {
    pub width: i32,
    pub height: i32,
}

/// Pixels reserved by system UI on each edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Insets {
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
    pub left: i32,
}

/// Lightweight, serializable view of one node for the categorized buckets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementSummary {
    pub index: usize,
    pub text: Option<String>,
    pub content_desc: Option<String>,
    pub resource_id: Option<String>,
    pub class: Option<String>,
    pub bounds: Bounds,
    pub center: (i32, i32),
}

impl ElementSummary {
    pub fn from_node(index: usize, node: &ViewHierarchyNode) -> Self {
        Self {
            index,
            text: node.text().map(String::from),
            content_desc: node.content_desc().map(String::from),
            resource_id: node.resource_id().map(String::from),
            class: node.class_name().map(String::from),
            bounds: node.bounds,
            center: node.bounds.center(),
        }
    }
}

/// What the engine currently believes about the screen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObserveResult {
    pub timestamp: DateTime<Utc>,
    pub screen_size: ScreenSize,
    pub insets: Insets,
    pub rotation: Option<u32>,
    pub root: Option<ViewHierarchyNode>,
    pub clickable_elements: Vec<ElementSummary>,
    pub scrollable_elements: Vec<ElementSummary>,
    pub text_elements: Vec<ElementSummary>,
    pub focused_element: Option<ElementSummary>,
    /// Partial-failure report (locked screen, missing root). Callers can
    /// still inspect screen size and insets when this is set.
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct ObserveOptions {
    pub use_cache: bool,
    /// Gate the read on the stability detector when the UI is settling.
    pub wait_for_stable: bool,
}

impl Default for ObserveOptions {
    fn default() -> Self {
        Self {
            use_cache: true,
            wait_for_stable: true,
        }
    }
}

/// Pulls raw screen state through the bridge and shapes it into
/// [`ObserveResult`]s. Caching lives one layer up in the session pipeline.
pub struct Observer {
    bridge: Arc<dyn DeviceBridge>,
}

impl Observer {
    pub fn new(bridge: Arc<dyn DeviceBridge>) -> Self {
        Self { bridge }
    }

    /// Perform a full extraction round-trip. Failures to obtain the
    /// hierarchy are reported inside the result, not as `Err`, so callers
    /// still get screen metrics.
    pub async fn extract(&self, serial: &str) -> Result<ObserveResult> {
        let screen_size = self.screen_size(serial).await.unwrap_or_default();
        let insets = self.insets(serial).await.unwrap_or_default();

        let (root, rotation, error) = match self.pull_hierarchy(serial).await {
            Ok(parsed) => (Some(parsed.root), parsed.rotation, None),
            Err(e) => {
                warn!(serial, error = %e, "hierarchy extraction failed");
                (None, None, Some(e.to_string()))
            }
        };

        let mut result = ObserveResult {
            timestamp: Utc::now(),
            screen_size,
            insets,
            rotation,
            root,
            clickable_elements: Vec::new(),
            scrollable_elements: Vec::new(),
            text_elements: Vec::new(),
            focused_element: None,
            error,
        };
        if let Some(root) = &result.root {
            let (clickable, scrollable, text, focused) = categorize(root);
            result.clickable_elements = clickable;
            result.scrollable_elements = scrollable;
            result.text_elements = text;
            result.focused_element = focused;
        }
        Ok(result)
    }

    /// Compute the active screen signature without a full hierarchy pull.
    pub async fn signature(&self, serial: &str) -> Result<ScreenSignature> {
        let activity_out = self
            .bridge
            .shell(serial, &["dumpsys", "activity", "activities"])
            .await?;
        let (package, activity) = parse_resumed_activity(&activity_out.stdout)
            .unwrap_or_else(|| ("unknown".into(), "unknown".into()));

        let window_out = self.bridge.shell(serial, &["dumpsys", "window"]).await?;
        let layout_seq = parse_layout_seq_sum(&window_out.stdout);

        Ok(ScreenSignature {
            serial: serial.to_string(),
            package,
            activity,
            layout_seq,
        })
    }

    async fn pull_hierarchy(&self, serial: &str) -> Result<crate::hierarchy::ParsedDump> {
        let dump = self
            .bridge
            .shell(serial, &["uiautomator", "dump", DUMP_REMOTE_PATH])
            .await?;
        if !dump.success() {
            return Err(crate::EngineError::Structural(format!(
                "uiautomator dump failed: {}",
                dump.stderr.trim()
            )));
        }
        let cat = self.bridge.shell(serial, &["cat", DUMP_REMOTE_PATH]).await?;
        debug!(serial, bytes = cat.stdout.len(), "hierarchy dump pulled");
        parse_dump(&cat.stdout)
    }

    async fn screen_size(&self, serial: &str) -> Result<ScreenSize> {
        let out = self.bridge.shell(serial, &["wm", "size"]).await?;
        Ok(parse_wm_size(&out.stdout).unwrap_or_default())
    }

    async fn insets(&self, serial: &str) -> Result<Insets> {
        let out = self.bridge.shell(serial, &["dumpsys", "window"]).await?;
        Ok(parse_stable_insets(&out.stdout).unwrap_or_default())
    }
}

fn categorize(
    root: &ViewHierarchyNode,
) -> (
    Vec<ElementSummary>,
    Vec<ElementSummary>,
    Vec<ElementSummary>,
    Option<ElementSummary>,
) {
    let mut clickable = Vec::new();
    let mut scrollable = Vec::new();
    let mut text = Vec::new();
    let mut focused = None;
    for entry in root.flatten() {
        let summary = || ElementSummary::from_node(entry.index, entry.node);
        if entry.node.is_clickable() {
            clickable.push(summary());
        }
        if entry.node.is_scrollable() {
            scrollable.push(summary());
        }
        if entry.node.text().is_some() {
            text.push(summary());
        }
        if entry.node.is_focused() && focused.is_none() {
            focused = Some(summary());
        }
    }
    (clickable, scrollable, text, focused)
}

/// Parse `wm size` output, preferring an override size when present.
///
/// ```text
/// Physical size: 1080x2400
/// Override size: 1080x2220
/// ```
pub fn parse_wm_size(stdout: &str) -> Option<ScreenSize> {
    let mut physical = None;
    for line in stdout.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("Override size:") {
            if let Some(size) = parse_size_pair(rest) {
                return Some(size);
            }
        }
        if let Some(rest) = line.strip_prefix("Physical size:") {
            physical = parse_size_pair(rest);
        }
    }
    physical
}

fn parse_size_pair(s: &str) -> Option<ScreenSize> {
    let (w, h) = s.trim().split_once('x')?;
    Some(ScreenSize {
        width: w.trim().parse().ok()?,
        height: h.trim().parse().ok()?,
    })
}

/// Parse stable insets from `dumpsys window` output:
/// `mStableInsets=Rect(0, 63 - 0, 126)` means left 0, top 63, right 0,
/// bottom 126.
pub fn parse_stable_insets(stdout: &str) -> Option<Insets> {
    for line in stdout.lines() {
        let line = line.trim();
        let rect = match line.split_once("stableInsets=Rect(") {
            Some((_, rest)) => rest,
            None => continue,
        };
        let rect = rect.split(')').next()?;
        // "l, t - r, b"
        let (lt, rb) = rect.split_once('-')?;
        let (l, t) = lt.split_once(',')?;
        let (r, b) = rb.split_once(',')?;
        return Some(Insets {
            left: l.trim().parse().ok()?,
            top: t.trim().parse().ok()?,
            right: r.trim().parse().ok()?,
            bottom: b.trim().parse().ok()?,
        });
    }
    None
}

/// Extract `(package, activity)` from the resumed-activity line of
/// `dumpsys activity activities`:
/// `mResumedActivity: ActivityRecord{c38ee4d u0 com.example.app/.MainActivity t42}`
pub fn parse_resumed_activity(stdout: &str) -> Option<(String, String)> {
    for line in stdout.lines() {
        let line = line.trim();
        if !line.starts_with("mResumedActivity:") && !line.starts_with("topResumedActivity=") {
            continue;
        }
        let component = line
            .split_whitespace()
            .find(|token| token.contains('/'))?;
        let component = component.trim_end_matches('}');
        let (package, activity) = component.split_once('/')?;
        let activity = if let Some(short) = activity.strip_prefix('.') {
            format!("{package}.{short}")
        } else {
            activity.to_string()
        };
        return Some((package.to_string(), activity));
    }
    None
}

/// Coarse layout digest: sum of `mLayoutSeq=` counters across windows. Two
/// frames with identical addressable structure keep the same sum even when
/// volatile node text (clocks, counters) differs, so this is deliberately
/// NOT a hash of the tree.
pub fn parse_layout_seq_sum(stdout: &str) -> u64 {
    let mut sum = 0u64;
    for line in stdout.lines() {
        let mut rest = line;
        while let Some(pos) = rest.find("mLayoutSeq=") {
            rest = &rest[pos + "mLayoutSeq=".len()..];
            let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
            if let Ok(n) = digits.parse::<u64>() {
                sum = sum.wrapping_add(n);
            }
        }
    }
    sum
}
