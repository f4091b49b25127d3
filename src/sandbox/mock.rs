//! Scriptable in-memory provider for tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::provider::{CommandOutput, SandboxProvider};
use crate::errors::SandboxError;

type RunHandler = Box<dyn Fn(&str) -> Result<CommandOutput, SandboxError> + Send + Sync>;

pub struct MockProvider {
    pub creates: AtomicU32,
    pub closes: AtomicU32,
    pub runs: Mutex<Vec<String>>,
    create_failures: Mutex<VecDeque<SandboxError>>,
    handler: RunHandler,
}

impl MockProvider {
    /// Every command succeeds with empty output.
    pub fn healthy() -> Self {
        Self::with_handler(|_| Ok(CommandOutput::default()))
    }

    pub fn with_handler<F>(handler: F) -> Self
    where
        F: Fn(&str) -> Result<CommandOutput, SandboxError> + Send + Sync + 'static,
    {
        Self {
            creates: AtomicU32::new(0),
            closes: AtomicU32::new(0),
            runs: Mutex::new(Vec::new()),
            create_failures: Mutex::new(VecDeque::new()),
            handler: Box::new(handler),
        }
    }

    /// Fail the next `create` calls with these errors, in order.
    pub fn fail_creates(self, errors: Vec<SandboxError>) -> Self {
        *self.create_failures.lock().unwrap() = errors.into();
        self
    }

    pub fn commands(&self) -> Vec<String> {
        self.runs.lock().unwrap().clone()
    }

    pub fn count_matching(&self, needle: &str) -> usize {
        self.runs
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.contains(needle))
            .count()
    }
}

pub fn output(stdout: &str, exit_code: i32) -> CommandOutput {
    CommandOutput {
        stdout: stdout.to_string(),
        stderr: String::new(),
        exit_code,
    }
}

#[async_trait]
impl SandboxProvider for MockProvider {
    async fn create(&self, _template: &str, _lifetime: Duration) -> Result<String, SandboxError> {
        if let Some(err) = self.create_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        let n = self.creates.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("sbx-{}", n))
    }

    async fn run(
        &self,
        _session_id: &str,
        command: &str,
        _timeout: Duration,
    ) -> Result<CommandOutput, SandboxError> {
        self.runs.lock().unwrap().push(command.to_string());
        (self.handler)(command)
    }

    async fn close(&self, _session_id: &str) -> Result<(), SandboxError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn ping(&self) -> Result<(), SandboxError> {
        Ok(())
    }
}
