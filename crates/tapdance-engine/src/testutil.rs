//! Scripted in-memory bridge for engine tests.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use tapdance_adb::{CommandOutput, DeviceBridge};

fn ok(stdout: &str) -> CommandOutput {
    CommandOutput {
        stdout: stdout.to_string(),
        stderr: String::new(),
        exit_code: 0,
    }
}

/// Bridge that answers commands from a prefix-keyed script. Each prefix
/// holds a queue of responses; the last response repeats once the queue is
/// down to one entry. Unmatched commands succeed with empty output.
#[derive(Default)]
pub struct MockBridge {
    scripts: Mutex<HashMap<String, VecDeque<CommandOutput>>>,
    calls: Mutex<Vec<String>>,
}

impl MockBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, prefix: &str, stdout: &str) {
        self.on_output(prefix, ok(stdout));
    }

    pub fn on_output(&self, prefix: &str, output: CommandOutput) {
        self.scripts
            .lock()
            .unwrap()
            .entry(prefix.to_string())
            .or_default()
            .push_back(output);
    }

    pub fn calls_matching(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeviceBridge for MockBridge {
    async fn execute(
        &self,
        _serial: &str,
        args: &[&str],
    ) -> tapdance_adb::Result<CommandOutput> {
        let joined = args.join(" ");
        self.calls.lock().unwrap().push(joined.clone());

        let mut scripts = self.scripts.lock().unwrap();
        for (prefix, queue) in scripts.iter_mut() {
            if joined.starts_with(prefix.as_str()) {
                let response = if queue.len() > 1 {
                    queue.pop_front()
                } else {
                    queue.front().cloned()
                };
                if let Some(r) = response {
                    return Ok(r);
                }
            }
        }
        Ok(ok(""))
    }

    async fn pull(
        &self,
        _serial: &str,
        remote: &str,
        _local: &Path,
    ) -> tapdance_adb::Result<()> {
        self.calls.lock().unwrap().push(format!("pull {remote}"));
        Ok(())
    }
}
