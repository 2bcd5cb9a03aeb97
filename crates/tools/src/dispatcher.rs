//! Correlated async tool dispatch
//!
//! Every inbound call gets a response carrying the same id, always: unknown
//! tools, bad arguments, handler failures and timeouts all answer as error
//! responses rather than silence, because the backend is waiting on the id
//! and will stall the conversation without one. Calls run concurrently and
//! responses go out in completion order.

use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use voice_session_core::{ToolCallRequest, ToolCallResponse};

use crate::registry::{RegisteredTool, ToolRegistry};
use crate::ToolError;

/// Dispatch counters
#[derive(Debug, Clone, Default)]
pub struct DispatchStats {
    pub dispatched: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
}

/// Runs tool calls off the session loop and feeds responses back
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    responses: mpsc::Sender<ToolCallResponse>,
    in_flight: Arc<DashMap<String, JoinHandle<()>>>,
    stats: Arc<RwLock<DispatchStats>>,
}

impl ToolDispatcher {
    pub fn new(registry: Arc<ToolRegistry>, responses: mpsc::Sender<ToolCallResponse>) -> Self {
        Self {
            registry,
            responses,
            in_flight: Arc::new(DashMap::new()),
            stats: Arc::new(RwLock::new(DispatchStats::default())),
        }
    }

    /// Start executing one call. Never blocks the caller.
    pub fn dispatch(&self, request: ToolCallRequest) {
        self.in_flight.retain(|_, task| !task.is_finished());

        let ToolCallRequest { id, name, args } = request;
        self.stats.write().dispatched += 1;

        let tool = self.registry.get(&name);
        let responses = self.responses.clone();
        let in_flight = Arc::clone(&self.in_flight);
        let stats = Arc::clone(&self.stats);
        let task_key = id.clone();

        let task = tokio::spawn(async move {
            let response = match tool {
                Some(tool) => run_tool(tool, id.clone(), name, args, &stats).await,
                None => {
                    tracing::warn!(id = %id, tool = %name, "call for unknown tool");
                    stats.write().failed += 1;
                    let message = ToolError::Unknown(name.clone()).to_string();
                    ToolCallResponse::error(id.clone(), name, message)
                },
            };

            if responses.send(response).await.is_err() {
                tracing::debug!("tool response channel closed");
            }
            in_flight.remove(&id);
        });
        self.in_flight.insert(task_key, task);
    }

    /// Calls currently executing
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Abort every running call. Aborted calls never produce a response.
    pub fn abort_all(&self) {
        let aborted = self.in_flight.len();
        for entry in self.in_flight.iter() {
            entry.value().abort();
        }
        self.in_flight.clear();
        if aborted > 0 {
            tracing::debug!(aborted, "in-flight tool calls aborted");
        }
    }

    /// Snapshot of the dispatch counters
    pub fn stats(&self) -> DispatchStats {
        self.stats.read().clone()
    }
}

async fn run_tool(
    tool: Arc<RegisteredTool>,
    id: String,
    name: String,
    args: Value,
    stats: &RwLock<DispatchStats>,
) -> ToolCallResponse {
    if let Err(err) = tool.validate_args(&args) {
        tracing::warn!(id = %id, tool = %name, error = %err, "tool arguments rejected");
        stats.write().failed += 1;
        let message = err.to_string();
        return ToolCallResponse::error(id, name, message);
    }

    let budget = tool.timeout();
    match tokio::time::timeout(budget, tool.call(args)).await {
        Ok(Ok(result)) => {
            tracing::debug!(id = %id, tool = %name, "tool call completed");
            stats.write().completed += 1;
            ToolCallResponse::ok(id, name, result)
        },
        Ok(Err(err)) => {
            tracing::warn!(id = %id, tool = %name, error = %err, "tool call failed");
            stats.write().failed += 1;
            let message = err.to_string();
            ToolCallResponse::error(id, name, message)
        },
        Err(_) => {
            tracing::warn!(id = %id, tool = %name, timeout_ms = budget.as_millis() as u64, "tool call timed out");
            stats.write().timed_out += 1;
            let message = ToolError::Timeout {
                name: name.clone(),
                timeout_ms: budget.as_millis() as u64,
            }
            .to_string();
            ToolCallResponse::error(id, name, message)
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::FnTool;
    use serde_json::json;
    use std::time::Duration;
    use voice_session_core::ToolOutcome;

    fn request(id: &str, name: &str, args: Value) -> ToolCallRequest {
        ToolCallRequest {
            id: id.into(),
            name: name.into(),
            args,
        }
    }

    fn dispatcher_with(
        registry: ToolRegistry,
    ) -> (ToolDispatcher, mpsc::Receiver<ToolCallResponse>) {
        let (tx, rx) = mpsc::channel(16);
        (ToolDispatcher::new(Arc::new(registry), tx), rx)
    }

    #[tokio::test]
    async fn test_response_carries_the_request_id() {
        let mut registry = ToolRegistry::new();
        registry
            .register(FnTool::new("echo", |args| async move { Ok(args) }))
            .unwrap();
        let (dispatcher, mut responses) = dispatcher_with(registry);

        dispatcher.dispatch(request("call-7", "echo", json!({"q": 1})));

        let response = responses.recv().await.unwrap();
        assert_eq!(response.id, "call-7");
        assert_eq!(response.name, "echo");
        assert_eq!(response.outcome, ToolOutcome::Success(json!({"q": 1})));
    }

    #[tokio::test]
    async fn test_unknown_tool_answers_with_error_same_id() {
        let (dispatcher, mut responses) = dispatcher_with(ToolRegistry::new());

        dispatcher.dispatch(request("ghost-1", "ghost", json!({})));

        let response = responses.recv().await.unwrap();
        assert_eq!(response.id, "ghost-1");
        match response.outcome {
            ToolOutcome::Error(message) => assert!(message.contains("unknown tool")),
            other => panic!("expected error outcome, got {other:?}"),
        }
        assert_eq!(dispatcher.stats().failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_responses_arrive_in_completion_order() {
        let mut registry = ToolRegistry::new();
        registry
            .register(FnTool::new("slow", |_| async move {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(json!("slow done"))
            }))
            .unwrap();
        registry
            .register(FnTool::new("fast", |_| async move { Ok(json!("fast done")) }))
            .unwrap();
        let (dispatcher, mut responses) = dispatcher_with(registry);

        dispatcher.dispatch(request("a", "slow", json!({})));
        dispatcher.dispatch(request("b", "fast", json!({})));

        let first = responses.recv().await.unwrap();
        let second = responses.recv().await.unwrap();
        assert_eq!(first.id, "b");
        assert_eq!(second.id, "a");
        assert_eq!(second.outcome, ToolOutcome::Success(json!("slow done")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_call_answers_with_error() {
        let mut registry = ToolRegistry::new();
        registry
            .register(
                FnTool::new("stuck", |_| async move {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(json!(null))
                })
                .with_timeout(Duration::from_millis(50)),
            )
            .unwrap();
        let (dispatcher, mut responses) = dispatcher_with(registry);

        dispatcher.dispatch(request("t-1", "stuck", json!({})));

        let response = responses.recv().await.unwrap();
        assert_eq!(response.id, "t-1");
        match response.outcome {
            ToolOutcome::Error(message) => assert!(message.contains("timed out")),
            other => panic!("expected error outcome, got {other:?}"),
        }
        assert_eq!(dispatcher.stats().timed_out, 1);
    }

    #[tokio::test]
    async fn test_rejected_arguments_answer_with_error() {
        let mut registry = ToolRegistry::new();
        registry
            .register(
                FnTool::new("strict", |args| async move { Ok(args) }).with_parameters(json!({
                    "type": "object",
                    "required": ["key"],
                })),
            )
            .unwrap();
        let (dispatcher, mut responses) = dispatcher_with(registry);

        dispatcher.dispatch(request("v-1", "strict", json!({})));

        let response = responses.recv().await.unwrap();
        assert_eq!(response.id, "v-1");
        assert!(matches!(response.outcome, ToolOutcome::Error(_)));
    }

    #[tokio::test]
    async fn test_handler_failure_answers_with_error() {
        let mut registry = ToolRegistry::new();
        registry
            .register(FnTool::new("flaky", |_| async move {
                Err::<Value, _>(ToolError::Execution("backend unreachable".into()))
            }))
            .unwrap();
        let (dispatcher, mut responses) = dispatcher_with(registry);

        dispatcher.dispatch(request("f-1", "flaky", json!({})));

        let response = responses.recv().await.unwrap();
        assert_eq!(response.id, "f-1");
        match response.outcome {
            ToolOutcome::Error(message) => assert!(message.contains("backend unreachable")),
            other => panic!("expected error outcome, got {other:?}"),
        }
        assert_eq!(dispatcher.stats().failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_all_silences_in_flight_calls() {
        let mut registry = ToolRegistry::new();
        registry
            .register(FnTool::new("slow", |_| async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(json!(null))
            }))
            .unwrap();
        let (dispatcher, mut responses) = dispatcher_with(registry);

        dispatcher.dispatch(request("a-1", "slow", json!({})));
        tokio::task::yield_now().await;
        assert_eq!(dispatcher.in_flight(), 1);

        dispatcher.abort_all();
        assert_eq!(dispatcher.in_flight(), 0);

        // No response ever arrives for the aborted call
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(responses.try_recv().is_err());
    }
}
