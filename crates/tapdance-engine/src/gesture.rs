//! Gesture synthesis and dispatch.
//!
//! A high-level intent (tap, swipe, pinch, multi-finger path) becomes a set
//! of per-finger timed sample sequences. All fingers of one gesture share
//! the same sample count and total duration so the dispatcher can emit them
//! as a single coordinated gesture.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use tapdance_adb::DeviceBridge;

use crate::observation::{Insets, ScreenSize};
use crate::{EngineError, Result};

/// Maximum multitouch slots exposed by the kernel protocol.
pub const MAX_FINGERS: u8 = 10;

const SAMPLE_INTERVAL_MS: u64 = 12;
const FINGER_SPACING_PX: i32 = 60;
const JITTER_PX: i32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Easing {
    Linear,
    Decelerate,
    Accelerate,
    AccelerateDecelerate,
}

impl Easing {
    /// Warp the time parameter `t` in `[0, 1]` before linear interpolation.
    /// `Accelerate` covers little distance early (samples bunch at the
    /// start), `Decelerate` the reverse, `AccelerateDecelerate` bunches at
    /// both ends and thins the middle.
    pub fn apply(self, t: f64) -> f64 {
        match self {
            Easing::Linear => t,
            Easing::Accelerate => t * t,
            Easing::Decelerate => 1.0 - (1.0 - t) * (1.0 - t),
            Easing::AccelerateDecelerate => 0.5 - (std::f64::consts::PI * t).cos() / 2.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GestureOptions {
    pub duration: Duration,
    pub easing: Easing,
    pub fingers: u8,
    /// Add small positional jitter to interior samples, for apps that
    /// de-bounce perfectly straight machine swipes.
    pub randomize: bool,
    pub lift_at_end: bool,
    pub pressure: f64,
    /// When false, generated coordinates are clipped to the drawable area
    /// outside system insets.
    pub include_system_insets: bool,
}

impl Default for GestureOptions {
    fn default() -> Self {
        Self {
            duration: Duration::from_millis(300),
            easing: Easing::Linear,
            fingers: 1,
            randomize: false,
            lift_at_end: true,
            pressure: 1.0,
            include_system_insets: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TouchSample {
    pub x: i32,
    pub y: i32,
    /// Delay before this sample is dispatched, relative to the previous one.
    pub delay_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FingerPath {
    pub finger: u8,
    pub samples: Vec<TouchSample>,
}

impl FingerPath {
    pub fn total_duration_ms(&self) -> u64 {
        self.samples.iter().map(|s| s.delay_ms).sum()
    }
}

/// Build per-finger sample paths along `points` (two points for a plain
/// swipe, more for a multi-segment path, one for a press). Fingers beyond
/// the first are offset perpendicular-ish to the path by a fixed spacing.
pub fn build_paths(
    points: &[(i32, i32)],
    screen: ScreenSize,
    insets: Insets,
    options: &GestureOptions,
) -> Result<Vec<FingerPath>> {
    if points.is_empty() {
        return Err(EngineError::Validation("gesture needs at least one point".into()));
    }
    if options.fingers == 0 || options.fingers > MAX_FINGERS {
        return Err(EngineError::Validation(format!(
            "finger count must be 1..={MAX_FINGERS}, got {}",
            options.fingers
        )));
    }

    let duration_ms = options.duration.as_millis() as u64;
    let sample_count = ((duration_ms / SAMPLE_INTERVAL_MS) as usize).clamp(2, 64);
    let step_ms = duration_ms / (sample_count as u64 - 1);

    let mut rng = rand::thread_rng();
    let mut paths = Vec::with_capacity(options.fingers as usize);
    for finger in 0..options.fingers {
        // Spread fingers symmetrically around the requested points.
        let spread = finger as i32 - (options.fingers as i32 - 1) / 2;
        let offset = spread * FINGER_SPACING_PX;

        let mut samples = Vec::with_capacity(sample_count);
        for i in 0..sample_count {
            let t = i as f64 / (sample_count - 1) as f64;
            let eased = options.easing.apply(t);
            let (mut x, mut y) = point_along(points, eased);
            x += offset;

            if options.randomize && i > 0 && i < sample_count - 1 {
                x += rng.gen_range(-JITTER_PX..=JITTER_PX);
                y += rng.gen_range(-JITTER_PX..=JITTER_PX);
            }
            if !options.include_system_insets {
                (x, y) = clip_to_drawable(x, y, screen, insets);
            }
            samples.push(TouchSample {
                x,
                y,
                delay_ms: if i == 0 { 0 } else { step_ms },
            });
        }
        paths.push(FingerPath { finger, samples });
    }
    Ok(paths)
}

/// Two opposed paths moving between `start_spread` and `end_spread` pixels
/// from the center: spread out for zoom-in, together for zoom-out.
pub fn build_pinch(
    center: (i32, i32),
    start_spread: i32,
    end_spread: i32,
    screen: ScreenSize,
    insets: Insets,
    options: &GestureOptions,
) -> Result<Vec<FingerPath>> {
    let (cx, cy) = center;
    let mut two_finger = *options;
    two_finger.fingers = 1;

    let upper = build_paths(
        &[(cx, cy - start_spread), (cx, cy - end_spread)],
        screen,
        insets,
        &two_finger,
    )?;
    let lower = build_paths(
        &[(cx, cy + start_spread), (cx, cy + end_spread)],
        screen,
        insets,
        &two_finger,
    )?;

    let mut paths = upper;
    let mut second = lower.into_iter().next().expect("one path per finger");
    second.finger = 1;
    paths.push(second);
    Ok(paths)
}

/// Interpolate along the polyline at arc-length fraction `t`.
fn point_along(points: &[(i32, i32)], t: f64) -> (i32, i32) {
    if points.len() == 1 {
        return points[0];
    }
    let lengths: Vec<f64> = points
        .windows(2)
        .map(|w| {
            let dx = (w[1].0 - w[0].0) as f64;
            let dy = (w[1].1 - w[0].1) as f64;
            (dx * dx + dy * dy).sqrt()
        })
        .collect();
    let total: f64 = lengths.iter().sum();
    if total == 0.0 {
        return points[0];
    }
    let mut remaining = t.clamp(0.0, 1.0) * total;
    for (i, len) in lengths.iter().enumerate() {
        if remaining <= *len || i == lengths.len() - 1 {
            let f = if *len == 0.0 { 0.0 } else { remaining / len };
            let (x0, y0) = points[i];
            let (x1, y1) = points[i + 1];
            return (
                (x0 as f64 + (x1 - x0) as f64 * f).round() as i32,
                (y0 as f64 + (y1 - y0) as f64 * f).round() as i32,
            );
        }
        remaining -= len;
    }
    *points.last().expect("points is non-empty")
}

fn clip_to_drawable(x: i32, y: i32, screen: ScreenSize, insets: Insets) -> (i32, i32) {
    if screen.width == 0 || screen.height == 0 {
        return (x, y);
    }
    (
        x.clamp(insets.left, (screen.width - insets.right - 1).max(insets.left)),
        y.clamp(insets.top, (screen.height - insets.bottom - 1).max(insets.top)),
    )
}

/// Sends synthesized gestures to a device. Single-finger gestures go through
/// `input tap`/`input swipe`; multi-finger dispatch writes the kernel
/// multitouch protocol via `sendevent`, which needs a rooted device.
pub struct GestureDispatcher {
    bridge: Arc<dyn DeviceBridge>,
    /// Root capability per serial, probed once.
    root_cache: Mutex<HashMap<String, bool>>,
}

impl GestureDispatcher {
    pub fn new(bridge: Arc<dyn DeviceBridge>) -> Self {
        Self {
            bridge,
            root_cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn tap(&self, serial: &str, x: i32, y: i32) -> Result<()> {
        self.input(serial, &["tap", &x.to_string(), &y.to_string()]).await
    }

    pub async fn long_press(&self, serial: &str, x: i32, y: i32, duration: Duration) -> Result<()> {
        let (xs, ys) = (x.to_string(), y.to_string());
        let ms = duration.as_millis().to_string();
        self.input(serial, &["swipe", &xs, &ys, &xs, &ys, &ms]).await
    }

    /// Dispatch one coordinated gesture. Fingers run to completion; there is
    /// no mid-gesture cancellation.
    pub async fn dispatch(
        &self,
        serial: &str,
        paths: &[FingerPath],
        options: &GestureOptions,
    ) -> Result<()> {
        match paths {
            [] => Err(EngineError::Validation("no finger paths to dispatch".into())),
            [single] => self.dispatch_single(serial, single).await,
            many => self.dispatch_multi(serial, many, options).await,
        }
    }

    async fn dispatch_single(&self, serial: &str, path: &FingerPath) -> Result<()> {
        let (first, last) = match (path.samples.first(), path.samples.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => {
                return Err(EngineError::Validation("finger path has no samples".into()));
            }
        };
        if path.samples.len() == 1 || (first.x == last.x && first.y == last.y) {
            return self.tap(serial, first.x, first.y).await;
        }
        let ms = path.total_duration_ms().to_string();
        let (x1, y1) = (first.x.to_string(), first.y.to_string());
        let (x2, y2) = (last.x.to_string(), last.y.to_string());
        self.input(serial, &["swipe", &x1, &y1, &x2, &y2, &ms]).await
    }

    async fn dispatch_multi(
        &self,
        serial: &str,
        paths: &[FingerPath],
        options: &GestureOptions,
    ) -> Result<()> {
        if !self.is_rooted(serial).await? {
            return Err(EngineError::CapabilityUnsupported(
                "multi-finger gestures require a rooted device (sendevent injection)".into(),
            ));
        }
        let device = std::env::var("TAPDANCE_TOUCH_DEVICE")
            .unwrap_or_else(|_| "/dev/input/event1".to_string());
        let script = sendevent_script(&device, paths, options);
        debug!(serial, fingers = paths.len(), "dispatching multitouch gesture");
        let out = self.bridge.shell(serial, &["sh", "-c", &script]).await?;
        if !out.success() {
            return Err(EngineError::Bridge(tapdance_adb::BridgeError::CommandFailed {
                code: out.exit_code,
                stderr: out.stderr,
            }));
        }
        Ok(())
    }

    async fn is_rooted(&self, serial: &str) -> Result<bool> {
        if let Some(cached) = self.root_cache.lock().unwrap().get(serial) {
            return Ok(*cached);
        }
        let out = self.bridge.shell(serial, &["id", "-u"]).await?;
        let rooted = out.stdout.trim() == "0";
        self.root_cache.lock().unwrap().insert(serial.to_string(), rooted);
        Ok(rooted)
    }

    async fn input(&self, serial: &str, args: &[&str]) -> Result<()> {
        let mut cmd = vec!["input"];
        cmd.extend_from_slice(args);
        let out = self.bridge.shell(serial, &cmd).await?;
        if !out.success() {
            return Err(EngineError::Bridge(tapdance_adb::BridgeError::CommandFailed {
                code: out.exit_code,
                stderr: out.stderr,
            }));
        }
        Ok(())
    }
}

// Linux multitouch protocol B constants.
const EV_SYN: u16 = 0x00;
const EV_ABS: u16 = 0x03;
const ABS_MT_SLOT: u16 = 0x2f;
const ABS_MT_TRACKING_ID: u16 = 0x39;
const ABS_MT_POSITION_X: u16 = 0x35;
const ABS_MT_POSITION_Y: u16 = 0x36;
const ABS_MT_PRESSURE: u16 = 0x3a;

/// Emit a shell script of `sendevent` lines interleaved with `sleep`
/// commands, one SYN_REPORT per aligned sample frame across all fingers.
fn sendevent_script(device: &str, paths: &[FingerPath], options: &GestureOptions) -> String {
    fn ev(lines: &mut Vec<String>, device: &str, etype: u16, code: u16, value: i64) {
        lines.push(format!("sendevent {device} {etype} {code} {value}"));
    }

    let mut lines = Vec::new();
    let pressure = (options.pressure.clamp(0.0, 1.0) * 100.0).round() as i64;
    let frames = paths.iter().map(|p| p.samples.len()).max().unwrap_or(0);
    for frame in 0..frames {
        let mut frame_delay = 0;
        for path in paths {
            let Some(sample) = path.samples.get(frame) else {
                continue;
            };
            frame_delay = frame_delay.max(sample.delay_ms);
            ev(&mut lines, device, EV_ABS, ABS_MT_SLOT, path.finger as i64);
            if frame == 0 {
                // Touch down: assign a tracking id per finger.
                ev(
                    &mut lines,
                    device,
                    EV_ABS,
                    ABS_MT_TRACKING_ID,
                    1000 + path.finger as i64,
                );
                ev(&mut lines, device, EV_ABS, ABS_MT_PRESSURE, pressure);
            }
            ev(&mut lines, device, EV_ABS, ABS_MT_POSITION_X, sample.x as i64);
            ev(&mut lines, device, EV_ABS, ABS_MT_POSITION_Y, sample.y as i64);
        }
        if frame_delay > 0 {
            lines.push(format!("sleep {:.3}", frame_delay as f64 / 1000.0));
        }
        ev(&mut lines, device, EV_SYN, 0, 0);
    }
    if options.lift_at_end {
        for path in paths {
            ev(&mut lines, device, EV_ABS, ABS_MT_SLOT, path.finger as i64);
            ev(&mut lines, device, EV_ABS, ABS_MT_TRACKING_ID, -1);
        }
        ev(&mut lines, device, EV_SYN, 0, 0);
    }
    lines.join("; ")
}
