//! Scripted kernel doubles for unit tests.
//!
//! `MockConnection` replays a fixed script of stream events;
//! `MockLauncher` hands out scripted connections and records launches.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use super::{KernelConnection, KernelLauncher, KernelMessage, LaunchError};

/// One step of a scripted kernel output stream.
#[derive(Debug, Clone)]
pub enum Script {
    /// Deliver this message.
    Message(KernelMessage),
    /// Let the poll window elapse with nothing to read.
    Silence,
    /// Fail the read with a transient (retryable) error.
    TransientError,
    /// Fail the read as a closed channel and mark the kernel dead.
    Eof,
}

/// Connection that replays a script. An exhausted script behaves as silence.
pub struct MockConnection {
    script: VecDeque<Script>,
    alive: bool,
    next_submission: u64,
    pub submissions: Vec<String>,
}

impl MockConnection {
    pub fn new(script: Vec<Script>) -> Self {
        Self {
            script: script.into(),
            alive: true,
            next_submission: 0,
            submissions: Vec::new(),
        }
    }
}

#[async_trait]
impl KernelConnection for MockConnection {
    async fn submit(&mut self, code: &str) -> Result<String> {
        anyhow::ensure!(self.alive, "Kernel process is not alive");
        self.next_submission += 1;
        self.submissions.push(code.to_string());
        Ok(self.next_submission.to_string())
    }

    async fn recv(&mut self, poll: Duration) -> Result<Option<KernelMessage>> {
        match self.script.pop_front() {
            Some(Script::Message(msg)) => Ok(Some(msg)),
            Some(Script::Silence) | None => {
                tokio::time::sleep(poll).await;
                Ok(None)
            }
            Some(Script::TransientError) => Err(anyhow::anyhow!("transient read failure")),
            Some(Script::Eof) => {
                self.alive = false;
                Err(anyhow::Error::new(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "kernel closed its output stream",
                )))
            }
        }
    }

    async fn kill(&mut self) {
        self.alive = false;
    }

    fn is_alive(&self) -> bool {
        self.alive
    }
}

/// What a `MockLauncher` does when asked for a kernel.
#[derive(Debug, Clone)]
pub enum LaunchBehavior {
    /// Hand out a connection replaying this script.
    Succeed(Vec<Script>),
    /// Fail as if the kernel never became ready.
    ReadyTimeout,
    /// Fail with a generic spawn error.
    Fail,
}

/// Launcher double that records how many kernels were started.
pub struct MockLauncher {
    behavior: LaunchBehavior,
    pub launches: AtomicUsize,
}

impl MockLauncher {
    pub fn new(behavior: LaunchBehavior) -> Self {
        Self {
            behavior,
            launches: AtomicUsize::new(0),
        }
    }

    /// Launcher whose kernels immediately acknowledge every submission
    /// with an idle status (enough for bootstrap and empty executions).
    pub fn always_idle() -> Self {
        use super::protocol::ExecutionState;
        let idle = KernelMessage::Status {
            execution_state: ExecutionState::Idle,
        };
        // Enough idle acknowledgements for bootstrap plus a few runs.
        Self::new(LaunchBehavior::Succeed(vec![Script::Message(idle); 16]))
    }

    pub fn launch_count(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KernelLauncher for MockLauncher {
    async fn launch(
        &self,
        _working_dir: &Path,
        ready_timeout: Duration,
    ) -> Result<Box<dyn KernelConnection>, LaunchError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        match &self.behavior {
            LaunchBehavior::Succeed(script) => Ok(Box::new(MockConnection::new(script.clone()))),
            LaunchBehavior::ReadyTimeout => Err(LaunchError::ReadyTimeout(ready_timeout)),
            LaunchBehavior::Fail => Err(anyhow::anyhow!("spawn failed: no such file").into()),
        }
    }
}
