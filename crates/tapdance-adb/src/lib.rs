//! Android Debug Bridge adapter.
//!
//! The engine never shells out to `adb` directly; everything goes through the
//! [`DeviceBridge`] trait so tests can substitute a scripted bridge and an iOS
//! backend can slot in later without touching the engine.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

mod discovery;

pub use discovery::{Device, DeviceSource, Platform, discover_devices, parse_devices_output};

pub type Result<T> = std::result::Result<T, BridgeError>;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("adb binary not found (set ANDROID_HOME or TAPDANCE_ADB)")]
    AdbNotFound,
    #[error("device command timed out after {0:?}")]
    Timeout(Duration),
    #[error("command failed with exit code {code}: {stderr}")]
    CommandFailed { code: i32, stderr: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Raw output of one bridge command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Narrow command channel to one device: shell execution plus file pull.
#[async_trait]
pub trait DeviceBridge: Send + Sync {
    /// Run `adb -s <serial> <args...>` and collect its output. A non-zero
    /// exit code is returned in [`CommandOutput`], not as an error; only
    /// transport-level failures (spawn, timeout) produce `Err`.
    async fn execute(&self, serial: &str, args: &[&str]) -> Result<CommandOutput>;

    /// Run a shell command on the device (`adb -s <serial> shell ...`).
    async fn shell(&self, serial: &str, cmd: &[&str]) -> Result<CommandOutput> {
        let mut args = vec!["shell"];
        args.extend_from_slice(cmd);
        self.execute(serial, &args).await
    }

    /// Pull a file from the device to a local path.
    async fn pull(&self, serial: &str, remote: &str, local: &Path) -> Result<()>;

    /// Send a single key event (`KEYCODE_BACK`, `KEYCODE_HOME`, or a raw
    /// numeric code).
    async fn key_event(&self, serial: &str, keycode: &str) -> Result<CommandOutput> {
        self.shell(serial, &["input", "keyevent", keycode]).await
    }

    /// Type text into the focused field. The text is escaped for the
    /// `input text` shell grammar (spaces become `%s`).
    async fn type_text(&self, serial: &str, text: &str) -> Result<CommandOutput> {
        let escaped = escape_input_text(text);
        self.shell(serial, &["input", "text", &escaped]).await
    }

    /// Launch an app by package, optionally at an explicit activity.
    async fn launch_app(
        &self,
        serial: &str,
        package: &str,
        activity: Option<&str>,
    ) -> Result<CommandOutput> {
        match activity {
            Some(activity) => {
                let component = format!("{package}/{activity}");
                self.shell(serial, &["am", "start", "-n", &component]).await
            }
            None => {
                self.shell(
                    serial,
                    &["monkey", "-p", package, "-c", "android.intent.category.LAUNCHER", "1"],
                )
                .await
            }
        }
    }

    /// Force-stop an app.
    async fn stop_app(&self, serial: &str, package: &str) -> Result<CommandOutput> {
        self.shell(serial, &["am", "force-stop", package]).await
    }

    /// Capture the screen to a file on the device.
    async fn screencap(&self, serial: &str, remote: &str) -> Result<CommandOutput> {
        self.shell(serial, &["screencap", "-p", remote]).await
    }
}

/// Escape text for `input text`: spaces become `%s` and shell
/// metacharacters get a backslash.
pub fn escape_input_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            ' ' => out.push_str("%s"),
            '\'' | '"' | '`' | '\\' | '$' | '&' | '|' | ';' | '(' | ')' | '<' | '>' => {
                out.push('\\');
                out.push(ch);
            }
            _ => out.push(ch),
        }
    }
    out
}

/// Production bridge backed by the `adb` binary.
pub struct AdbBridge {
    adb_path: PathBuf,
    command_timeout: Duration,
}

impl AdbBridge {
    pub fn new() -> Result<Self> {
        Ok(Self {
            adb_path: locate_adb()?,
            command_timeout: Duration::from_secs(30),
        })
    }

    pub fn with_timeout(mut self, command_timeout: Duration) -> Self {
        self.command_timeout = command_timeout;
        self
    }

    pub fn adb_path(&self) -> &Path {
        &self.adb_path
    }

    async fn run(&self, args: &[&str]) -> Result<CommandOutput> {
        debug!(?args, "adb");
        let fut = Command::new(&self.adb_path)
            .args(args)
            .kill_on_drop(true)
            .output();
        let output = timeout(self.command_timeout, fut)
            .await
            .map_err(|_| BridgeError::Timeout(self.command_timeout))??;
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }
}

#[async_trait]
impl DeviceBridge for AdbBridge {
    async fn execute(&self, serial: &str, args: &[&str]) -> Result<CommandOutput> {
        let mut full = vec!["-s", serial];
        full.extend_from_slice(args);
        self.run(&full).await
    }

    async fn pull(&self, serial: &str, remote: &str, local: &Path) -> Result<()> {
        let local_str = local.to_string_lossy();
        let out = self
            .run(&["-s", serial, "pull", remote, local_str.as_ref()])
            .await?;
        if !out.success() {
            return Err(BridgeError::CommandFailed {
                code: out.exit_code,
                stderr: out.stderr,
            });
        }
        Ok(())
    }
}

/// Locate the adb binary: explicit override, then SDK install, then PATH.
fn locate_adb() -> Result<PathBuf> {
    if let Ok(explicit) = std::env::var("TAPDANCE_ADB") {
        let p = PathBuf::from(explicit);
        if p.exists() {
            return Ok(p);
        }
    }
    for var in ["ANDROID_HOME", "ANDROID_SDK_ROOT"] {
        if let Ok(sdk) = std::env::var(var) {
            let p = PathBuf::from(sdk).join("platform-tools").join("adb");
            if p.exists() {
                return Ok(p);
            }
        }
    }
    // Fall back to PATH resolution; `adb` may still be absent at run time,
    // which surfaces as a spawn error on first use.
    Ok(PathBuf::from("adb"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_passes_through() {
        assert_eq!(escape_input_text("hello"), "hello");
    }

    #[test]
    fn spaces_become_percent_s() {
        assert_eq!(escape_input_text("hello world"), "hello%sworld");
    }

    #[test]
    fn shell_metacharacters_are_escaped() {
        assert_eq!(escape_input_text("a&b"), "a\\&b");
        assert_eq!(escape_input_text("it's"), "it\\'s");
        assert_eq!(escape_input_text("$HOME"), "\\$HOME");
    }
}
