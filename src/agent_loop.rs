//! The reasoning and tool-execution loop
//!
//! ```text
//! Idle -> AwaitingModel -> ModelDone
//!                       -> AwaitingTools -> ExecutingTools -> AwaitingModel ...
//! ```
//!
//! Tool calls run one at a time in the order the model listed them, whether
//! or not they touch the signer. A failing tool is reported back to the
//! model; only a failed model call ends the loop early.

use crate::anchor_chain::{summarize_input, tool_call_data, AnchorChain, AnchorType};
use crate::errors::AgidResult;
use crate::history::SessionHistory;
use crate::messages::{ProgressEvent, ProgressKind, ProgressStatus};
use crate::model::{ChatMessage, ModelClient, ModelRequest};
use crate::signer::SigningCapability;
use crate::tools::{ToolContext, ToolRegistry, ToolResult};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub const DEGRADED_RESPONSE: &str =
    "I'm sorry, I'm temporarily unable to respond. Please try again later.";
pub const MAX_ITERATIONS_RESPONSE: &str =
    "I was unable to finish this request within the allowed number of reasoning steps.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    AwaitingModel,
    ModelDone,
    AwaitingTools,
    ExecutingTools,
    MaxIterationsExceeded,
}

/// One run's input. `history_key` selects the turn history; `session_id`
/// is what tools see as their session.
#[derive(Debug, Clone)]
pub struct LoopInput {
    pub user_message: String,
    pub history_key: String,
    pub session_id: String,
    pub sender: Option<String>,
    pub request_id: String,
    /// Extra line for the system prompt, such as an integrity warning.
    pub context_warning: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AgentRunOutcome {
    pub response: String,
    pub iterations: usize,
    pub tool_results: Vec<ToolResult>,
    pub terminal_state: LoopState,
    /// The model call failed and `response` is the fixed apology.
    pub degraded: bool,
}

pub struct AgentLoop {
    model: Arc<dyn ModelClient>,
    tools: Arc<ToolRegistry>,
    signer: SigningCapability,
    history: Arc<SessionHistory>,
    system_prompt: String,
    max_iterations: usize,
}

impl AgentLoop {
    pub fn new(
        model: Arc<dyn ModelClient>,
        tools: Arc<ToolRegistry>,
        signer: SigningCapability,
        history: Arc<SessionHistory>,
        system_prompt: impl Into<String>,
        max_iterations: usize,
    ) -> Self {
        Self {
            model,
            tools,
            signer,
            history,
            system_prompt: system_prompt.into(),
            max_iterations: max_iterations.max(1),
        }
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    fn system_prompt(&self, warning: Option<&str>) -> String {
        let identity = self.signer.identity();
        let mut prompt = format!(
            "{}\n\nYour identity public key is {} on {}.",
            self.system_prompt, identity.public_key, identity.network
        );
        if let Some(warning) = warning {
            prompt.push_str("\n\n");
            prompt.push_str(warning);
        }
        prompt
    }

    pub async fn run(
        &self,
        input: LoopInput,
        mut chain: Option<&mut AnchorChain>,
        progress: Option<&mpsc::Sender<ProgressEvent>>,
    ) -> AgidResult<AgentRunOutcome> {
        let mut messages = self.history.load(&input.history_key)?;
        let first_new = messages.len();
        messages.push(ChatMessage::user_text(input.user_message.clone()));

        let system = self.system_prompt(input.context_warning.as_deref());
        let definitions = self.tools.definitions();
        let mut all_results = Vec::new();
        let mut state = LoopState::Idle;
        debug!(session_id = %input.session_id, state = ?state, "agent loop starting");

        for iteration in 1..=self.max_iterations {
            state = LoopState::AwaitingModel;
            let request = ModelRequest {
                system: system.clone(),
                messages: messages.clone(),
                tools: definitions.clone(),
            };
            let response = match self.model.complete(&request).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(
                        session_id = %input.session_id,
                        iteration,
                        error = %e,
                        "model call failed, answering degraded"
                    );
                    return Ok(AgentRunOutcome {
                        response: DEGRADED_RESPONSE.to_string(),
                        iterations: iteration,
                        tool_results: all_results,
                        terminal_state: state,
                        degraded: true,
                    });
                }
            };

            let tool_uses = response.tool_uses();
            messages.push(ChatMessage::assistant(response.content.clone()));

            if tool_uses.is_empty() {
                state = LoopState::ModelDone;
                self.history.append(&input.history_key, &messages[first_new..])?;
                info!(
                    session_id = %input.session_id,
                    iterations = iteration,
                    tools = all_results.len(),
                    "agent loop complete"
                );
                return Ok(AgentRunOutcome {
                    response: response.text(),
                    iterations: iteration,
                    tool_results: all_results,
                    terminal_state: state,
                    degraded: false,
                });
            }

            state = LoopState::AwaitingTools;
            debug!(
                session_id = %input.session_id,
                requested = tool_uses.len(),
                state = ?state,
                "model requested tools"
            );
            state = LoopState::ExecutingTools;

            let mut turn_results = Vec::with_capacity(tool_uses.len());
            for tool_use in tool_uses {
                notify(
                    progress,
                    &input.request_id,
                    &tool_use.name,
                    ProgressKind::ToolStart,
                    ProgressStatus::Running,
                    None,
                );

                let ctx = ToolContext::new(
                    input.session_id.clone(),
                    self.signer.identity().clone(),
                    input.sender.clone(),
                );
                let result = self
                    .tools
                    .execute(
                        &tool_use.id,
                        &tool_use.name,
                        tool_use.input.clone(),
                        ctx,
                        &self.signer,
                    )
                    .await;

                if let Some(chain) = chain.as_deref_mut() {
                    chain.add_anchor(
                        AnchorType::ToolCall,
                        tool_call_data(
                            &tool_use.name,
                            &tool_use.input,
                            &result.content,
                            result.is_error,
                        ),
                        format!("{}({})", tool_use.name, summarize_input(&tool_use.input)),
                        json!({ "toolUseId": tool_use.id, "iteration": iteration }),
                    )?;
                }

                let status = if result.is_error {
                    ProgressStatus::Error
                } else {
                    ProgressStatus::Success
                };
                notify(
                    progress,
                    &input.request_id,
                    &tool_use.name,
                    ProgressKind::ToolResult,
                    status,
                    result.error_kind.clone(),
                );
                turn_results.push(result);
            }

            messages.push(ChatMessage::tool_results(&turn_results));
            all_results.extend(turn_results);
        }

        state = LoopState::MaxIterationsExceeded;
        warn!(
            session_id = %input.session_id,
            max_iterations = self.max_iterations,
            "agent loop hit iteration bound"
        );
        self.history.append(&input.history_key, &messages[first_new..])?;
        Ok(AgentRunOutcome {
            response: MAX_ITERATIONS_RESPONSE.to_string(),
            iterations: self.max_iterations,
            tool_results: all_results,
            terminal_state: state,
            degraded: false,
        })
    }
}

/// Progress is best-effort: a full or closed channel drops the event.
fn notify(
    progress: Option<&mpsc::Sender<ProgressEvent>>,
    request_id: &str,
    tool_name: &str,
    kind: ProgressKind,
    status: ProgressStatus,
    error_type: Option<String>,
) {
    if let Some(tx) = progress {
        let event = ProgressEvent {
            kind,
            request_id: request_id.to_string(),
            tool_name: tool_name.to_string(),
            status,
            error_type,
        };
        if tx.try_send(event).is_err() {
            debug!(tool = %tool_name, "progress event dropped");
        }
    }
}
