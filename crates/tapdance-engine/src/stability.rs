//! UI stability detection.
//!
//! After every action the UI is assumed to be in motion (`Settling`); the
//! detector polls device jank counters until they go quiet for N consecutive
//! polls, then reports `Stable`. A timeout yields an *unstable verdict*, not
//! an error; callers decide whether to proceed with the last-known snapshot
//! or fail.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{Instant, sleep};
use tracing::{debug, trace};

use tapdance_adb::DeviceBridge;

use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StabilityState {
    #[default]
    Unknown,
    Settling,
    Stable,
}

/// Frame-production counters from `dumpsys gfxinfo <package>`. Any delta
/// between two polls counts as a qualifying event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JankSignals {
    pub missed_vsync: u64,
    pub slow_ui_thread: u64,
    pub frame_deadline_missed: u64,
    pub total_frames: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct StabilityConfig {
    /// Consecutive quiet polls required before declaring `Stable`.
    pub required_quiet_polls: u32,
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            required_quiet_polls: 3,
            poll_interval: Duration::from_millis(100),
            timeout: Duration::from_secs(5),
        }
    }
}

/// Outcome of one wait. `stable == false` means the timeout elapsed or the
/// wait was superseded by a re-arm; the caller still gets a usable answer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StabilityVerdict {
    pub state: StabilityState,
    pub stable: bool,
    pub superseded: bool,
    pub polls: u32,
    pub elapsed_ms: u64,
}

/// Settling state and re-arm counter for one device. The generation is
/// bumped on every arm; an in-flight wait whose generation no longer
/// matches has been cancelled by a newer action on the same device.
#[derive(Debug, Clone, Copy, Default)]
struct DeviceState {
    state: StabilityState,
    generation: u64,
}

pub struct StabilityDetector {
    bridge: Arc<dyn DeviceBridge>,
    config: StabilityConfig,
    /// Keyed by serial; devices settle independently and an arm on one must
    /// never cancel a wait on another.
    devices: Mutex<HashMap<String, DeviceState>>,
}

impl StabilityDetector {
    pub fn new(bridge: Arc<dyn DeviceBridge>, config: StabilityConfig) -> Self {
        Self {
            bridge,
            config,
            devices: Mutex::new(HashMap::new()),
        }
    }

    pub fn state(&self, serial: &str) -> StabilityState {
        self.devices
            .lock()
            .unwrap()
            .get(serial)
            .map(|d| d.state)
            .unwrap_or_default()
    }

    fn generation(&self, serial: &str) -> u64 {
        self.devices
            .lock()
            .unwrap()
            .get(serial)
            .map(|d| d.generation)
            .unwrap_or(0)
    }

    fn set_state(&self, serial: &str, state: StabilityState) {
        self.devices
            .lock()
            .unwrap()
            .entry(serial.to_string())
            .or_default()
            .state = state;
    }

    /// Arm before an action: the device's UI is now assumed to be settling,
    /// and any outstanding wait on that device is cancelled.
    pub fn arm(&self, serial: &str) -> u64 {
        let mut devices = self.devices.lock().unwrap();
        let device = devices.entry(serial.to_string()).or_default();
        device.state = StabilityState::Settling;
        device.generation += 1;
        device.generation
    }

    /// Poll until the device reports no new jank events for N consecutive
    /// polls, or the timeout elapses.
    pub async fn wait_for_stable(&self, serial: &str, package: &str) -> Result<StabilityVerdict> {
        let my_generation = self.generation(serial);
        let started = Instant::now();
        let deadline = started + self.config.timeout;

        let mut previous = self.poll_signals(serial, package).await?;
        let mut quiet: u32 = 0;
        let mut polls: u32 = 1;

        loop {
            if self.generation(serial) != my_generation {
                debug!(serial, "stability wait superseded by re-arm");
                return Ok(self.verdict(StabilityState::Settling, false, true, polls, started));
            }
            if Instant::now() >= deadline {
                debug!(serial, polls, "stability wait timed out");
                return Ok(self.verdict(StabilityState::Settling, false, false, polls, started));
            }

            sleep(self.config.poll_interval).await;
            let current = self.poll_signals(serial, package).await?;
            polls += 1;

            if current == previous {
                quiet += 1;
                trace!(serial, quiet, "quiet poll");
                if quiet >= self.config.required_quiet_polls {
                    self.set_state(serial, StabilityState::Stable);
                    return Ok(self.verdict(StabilityState::Stable, true, false, polls, started));
                }
            } else {
                quiet = 0;
                previous = current;
            }
        }
    }

    fn verdict(
        &self,
        state: StabilityState,
        stable: bool,
        superseded: bool,
        polls: u32,
        started: Instant,
    ) -> StabilityVerdict {
        StabilityVerdict {
            state,
            stable,
            superseded,
            polls,
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }

    async fn poll_signals(&self, serial: &str, package: &str) -> Result<JankSignals> {
        let out = self
            .bridge
            .shell(serial, &["dumpsys", "gfxinfo", package])
            .await?;
        Ok(parse_gfxinfo(&out.stdout))
    }
}

/// Parse the jank summary block of `dumpsys gfxinfo`:
///
/// ```text
/// Total frames rendered: 1402
/// Number Missed Vsync: 41
/// Number Slow UI thread: 20
/// Number Frame deadline missed: 20
/// ```
pub fn parse_gfxinfo(stdout: &str) -> JankSignals {
    let mut signals = JankSignals::default();
    for line in stdout.lines() {
        let line = line.trim();
        let set = |prefix: &str, field: &mut u64| {
            if let Some(rest) = line.strip_prefix(prefix) {
                if let Ok(n) = rest.trim().parse() {
                    *field = n;
                }
            }
        };
        set("Total frames rendered:", &mut signals.total_frames);
        set("Number Missed Vsync:", &mut signals.missed_vsync);
        set("Number Slow UI thread:", &mut signals.slow_ui_thread);
        set(
            "Number Frame deadline missed:",
            &mut signals.frame_deadline_missed,
        );
    }
    signals
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockBridge;

    fn gfx(frames: u64, vsync: u64) -> String {
        format!(
            "Total frames rendered: {frames}\nNumber Missed Vsync: {vsync}\n\
             Number Slow UI thread: 0\nNumber Frame deadline missed: 0\n"
        )
    }

    fn fast_config() -> StabilityConfig {
        StabilityConfig {
            required_quiet_polls: 2,
            poll_interval: Duration::from_millis(1),
            timeout: Duration::from_millis(500),
        }
    }

    #[test]
    fn gfxinfo_parse() {
        let signals = parse_gfxinfo(
            "Total frames rendered: 1402\nNumber Missed Vsync: 41\n\
             Number Slow UI thread: 20\nNumber Frame deadline missed: 7\n",
        );
        assert_eq!(signals.total_frames, 1402);
        assert_eq!(signals.missed_vsync, 41);
        assert_eq!(signals.slow_ui_thread, 20);
        assert_eq!(signals.frame_deadline_missed, 7);
    }

    #[tokio::test]
    async fn reaches_stable_after_quiet_polls() {
        let bridge = Arc::new(MockBridge::new());
        // Two changing polls, then the counters freeze.
        bridge.on("shell dumpsys gfxinfo", &gfx(100, 1));
        bridge.on("shell dumpsys gfxinfo", &gfx(110, 2));
        bridge.on("shell dumpsys gfxinfo", &gfx(120, 2));

        let detector = StabilityDetector::new(bridge, fast_config());
        detector.arm("emulator-5554");
        assert_eq!(detector.state("emulator-5554"), StabilityState::Settling);

        let verdict = detector
            .wait_for_stable("emulator-5554", "com.example.app")
            .await
            .unwrap();
        assert!(verdict.stable);
        assert_eq!(verdict.state, StabilityState::Stable);
        assert_eq!(detector.state("emulator-5554"), StabilityState::Stable);
    }

    #[tokio::test]
    async fn timeout_yields_unstable_verdict_not_error() {
        let bridge = Arc::new(MockBridge::new());
        // Counters keep moving: queue a long run of distinct outputs.
        for i in 0..200 {
            bridge.on("shell dumpsys gfxinfo", &gfx(100 + i, i));
        }
        let config = StabilityConfig {
            required_quiet_polls: 3,
            poll_interval: Duration::from_millis(1),
            timeout: Duration::from_millis(20),
        };
        let detector = StabilityDetector::new(bridge, config);
        detector.arm("emulator-5554");

        let verdict = detector
            .wait_for_stable("emulator-5554", "com.example.app")
            .await
            .unwrap();
        assert!(!verdict.stable);
        assert!(!verdict.superseded);
        assert_eq!(verdict.state, StabilityState::Settling);
    }

    #[tokio::test]
    async fn rearm_supersedes_outstanding_wait() {
        let bridge = Arc::new(MockBridge::new());
        for i in 0..200 {
            bridge.on("shell dumpsys gfxinfo", &gfx(100 + i, 0));
        }
        let detector = Arc::new(StabilityDetector::new(bridge, fast_config()));
        detector.arm("emulator-5554");

        let waiter = {
            let detector = detector.clone();
            tokio::spawn(async move {
                detector
                    .wait_for_stable("emulator-5554", "com.example.app")
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        detector.arm("emulator-5554");

        let verdict = waiter.await.unwrap().unwrap();
        assert!(verdict.superseded);
        assert!(!verdict.stable);
    }

    #[tokio::test]
    async fn arming_another_device_does_not_supersede() {
        let bridge = Arc::new(MockBridge::new());
        // First device goes quiet immediately.
        bridge.on("shell dumpsys gfxinfo", &gfx(100, 0));

        let detector = Arc::new(StabilityDetector::new(bridge, fast_config()));
        detector.arm("emulator-5554");

        let waiter = {
            let detector = detector.clone();
            tokio::spawn(async move {
                detector
                    .wait_for_stable("emulator-5554", "com.example.app")
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(2)).await;
        detector.arm("emulator-5556");

        let verdict = waiter.await.unwrap().unwrap();
        assert!(!verdict.superseded);
        assert!(verdict.stable);
        // Each device keeps its own settling state.
        assert_eq!(detector.state("emulator-5554"), StabilityState::Stable);
        assert_eq!(detector.state("emulator-5556"), StabilityState::Settling);
    }

    #[test]
    fn initial_state_is_unknown() {
        let detector = StabilityDetector::new(
            Arc::new(MockBridge::new()),
            StabilityConfig::default(),
        );
        assert_eq!(detector.state("emulator-5554"), StabilityState::Unknown);
    }
}
