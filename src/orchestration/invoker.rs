//! Agent invocation contract.
//!
//! The engine never talks to an agent directly. It hands an
//! [`InvocationRequest`] to an injected [`AgentInvoker`] and interprets the
//! returned output map or [`InvokeError`]. [`CommandInvoker`] is the invoker
//! the command line uses: one child process per invocation, request on
//! stdin as JSON, outputs on stdout as a flat JSON object.

use crate::config::AgentCommand;
use crate::context::ContextMap;
use crate::core::task::TaskId;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Exit code a command agent uses to report a transient failure (`EX_TEMPFAIL`).
pub const TRANSIENT_EXIT_CODE: i32 = 75;

/// Everything an agent needs to run one attempt of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationRequest {
    pub task_id: TaskId,
    /// Agent role from the task definition.
    pub agent: String,
    /// Input slice: the task's readable keys at their latest versions.
    pub inputs: ContextMap,
    pub timeout_ms: u64,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Dependencies that failed or were skipped; their outputs are absent.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub degraded_dependencies: Vec<TaskId>,
}

impl InvocationRequest {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Failure reported for one invocation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvokeError {
    #[error("Invocation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Transient agent failure: {0}")]
    Transient(String),

    #[error("Agent rejected the task: {0}")]
    Rejected(String),
}

impl InvokeError {
    /// Timeouts and transient failures may succeed on another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, InvokeError::Timeout(_) | InvokeError::Transient(_))
    }
}

/// Capability to run one task against one agent.
///
/// Implementations need not enforce the timeout; the scheduler abandons
/// the returned future once `request.timeout()` elapses.
pub trait AgentInvoker: Send + Sync {
    fn invoke(&self, request: InvocationRequest) -> BoxFuture<'_, Result<ContextMap, InvokeError>>;
}

/// Runs each agent role as a configured child process.
#[derive(Debug, Clone, Default)]
pub struct CommandInvoker {
    agents: BTreeMap<String, AgentCommand>,
}

impl CommandInvoker {
    pub fn new(agents: BTreeMap<String, AgentCommand>) -> Self {
        Self { agents }
    }

    pub fn with_agent(mut self, role: impl Into<String>, command: AgentCommand) -> Self {
        self.agents.insert(role.into(), command);
        self
    }

    pub fn roles(&self) -> impl Iterator<Item = &str> {
        self.agents.keys().map(String::as_str)
    }

    async fn run(&self, request: InvocationRequest) -> Result<ContextMap, InvokeError> {
        let agent = self.agents.get(&request.agent).ok_or_else(|| {
            InvokeError::Rejected(format!(
                "no command configured for agent role {}",
                request.agent
            ))
        })?;
        let (program, args) = agent.command.split_first().ok_or_else(|| {
            InvokeError::Rejected(format!("empty command for agent role {}", request.agent))
        })?;

        debug!(task = %request.task_id, agent = %request.agent, program, "spawning agent command");

        let payload = serde_json::to_vec(&request)
            .map_err(|e| InvokeError::Rejected(format!("cannot encode request: {}", e)))?;

        let mut child = Command::new(program)
            .args(args)
            .envs(&agent.env)
            .env("MAESTRO_TASK_ID", request.task_id.as_str())
            .env("MAESTRO_ATTEMPT", request.attempt.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| InvokeError::Transient(format!("failed to spawn {}: {}", program, e)))?;

        // The request is written while stdout is collected, so an agent that
        // answers before reading all of its input cannot deadlock the pipes.
        let stdin = child.stdin.take();
        let write_request = async move {
            let Some(mut stdin) = stdin else {
                return Ok(());
            };
            match stdin.write_all(&payload).await {
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                    debug!("agent closed stdin before reading the whole request");
                    Ok(())
                }
                written => written,
            }
        };
        let (written, output) = tokio::join!(write_request, child.wait_with_output());

        let output =
            output.map_err(|e| InvokeError::Transient(format!("failed to wait for agent: {}", e)))?;
        written.map_err(|e| InvokeError::Transient(format!("failed to write request: {}", e)))?;

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        match output.status.code() {
            Some(0) => parse_outputs(&output.stdout),
            Some(TRANSIENT_EXIT_CODE) => Err(InvokeError::Transient(describe(&stderr, 75))),
            Some(code) => Err(InvokeError::Rejected(describe(&stderr, code))),
            None => Err(InvokeError::Transient("agent terminated by signal".to_string())),
        }
    }
}

impl AgentInvoker for CommandInvoker {
    fn invoke(&self, request: InvocationRequest) -> BoxFuture<'_, Result<ContextMap, InvokeError>> {
        Box::pin(self.run(request))
    }
}

/// Parse an agent's stdout. Empty output means nothing was written.
fn parse_outputs(stdout: &[u8]) -> Result<ContextMap, InvokeError> {
    let text = String::from_utf8_lossy(stdout);
    let text = text.trim();
    if text.is_empty() {
        return Ok(ContextMap::new());
    }
    serde_json::from_str(text)
        .map_err(|e| InvokeError::Rejected(format!("agent output is not a JSON object: {}", e)))
}

fn describe(stderr: &str, code: i32) -> String {
    if stderr.is_empty() {
        format!("agent exited with code {}", code)
    } else {
        stderr.to_string()
    }
}
