use crate::agent_loop::{
    AgentLoop, LoopInput, LoopState, DEGRADED_RESPONSE, MAX_ITERATIONS_RESPONSE,
};
use crate::anchor_chain::{AnchorChain, AnchorType};
use crate::history::SessionHistory;
use crate::messages::{ProgressKind, ProgressStatus};
use crate::model::{ContentBlock, Role};
use crate::signer::{LocalSigner, Network, SigningCapability};
use crate::tests::test_utils::{
    registry_with, text_response, tool_use_response, FailingTool, ScriptedModel, TEST_TIMEOUT,
};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;

struct Fixture {
    agent: AgentLoop,
    model: Arc<ScriptedModel>,
    history: Arc<SessionHistory>,
    signer: SigningCapability,
}

fn fixture(model: ScriptedModel, max_iterations: usize) -> Fixture {
    let signer =
        SigningCapability::new(Arc::new(LocalSigner::generate(Network::Local)), TEST_TIMEOUT);
    let model = Arc::new(model);
    let history = Arc::new(SessionHistory::new(40));
    let agent = AgentLoop::new(
        model.clone(),
        Arc::new(registry_with(vec![Arc::new(FailingTool)])),
        signer.clone(),
        history.clone(),
        "You are a test agent.",
        max_iterations,
    );
    Fixture {
        agent,
        model,
        history,
        signer,
    }
}

fn input(message: &str) -> LoopInput {
    LoopInput {
        user_message: message.to_string(),
        history_key: "alice:conv-1".to_string(),
        session_id: "conv-1".to_string(),
        sender: Some("alice".to_string()),
        request_id: "req-1".to_string(),
        context_warning: None,
    }
}

fn three_tools() -> ScriptedModel {
    ScriptedModel::new(vec![
        Ok(tool_use_response(&[
            ("t1", "current_time", json!({})),
            ("t2", "always_fails", json!({})),
            ("t3", "identity_info", json!({})),
        ])),
        Ok(text_response("all done")),
    ])
}

#[tokio::test]
async fn test_failing_tool_does_not_stop_the_others() {
    let f = fixture(three_tools(), 10);
    let mut chain = AnchorChain::new("session-1", f.signer.identity().public_key.clone());

    let outcome = f.agent.run(input("what time is it"), Some(&mut chain), None).await.unwrap();

    assert_eq!(outcome.response, "all done");
    assert_eq!(outcome.iterations, 2);
    assert_eq!(outcome.terminal_state, LoopState::ModelDone);
    assert!(!outcome.degraded);

    let names: Vec<_> = outcome.tool_results.iter().map(|r| r.tool_name.as_str()).collect();
    assert_eq!(names, vec!["current_time", "always_fails", "identity_info"]);
    let errors: Vec<_> = outcome.tool_results.iter().map(|r| r.is_error).collect();
    assert_eq!(errors, vec![false, true, false]);
    assert_eq!(outcome.tool_results[1].error_kind.as_deref(), Some("tool_execution"));

    assert_eq!(chain.count_of(AnchorType::ToolCall), 3);
    assert!(chain.verify().valid);

    // The second model call sees all three results, the failure flagged.
    let requests = f.model.requests();
    assert_eq!(requests.len(), 2);
    let results = &requests[1].messages.last().unwrap().content;
    assert_eq!(results.len(), 3);
    assert!(matches!(
        &results[1],
        ContentBlock::ToolResult { is_error: true, tool_use_id, .. } if tool_use_id == "t2"
    ));
}

#[tokio::test]
async fn test_tools_see_session_and_sender() {
    let f = fixture(
        ScriptedModel::new(vec![
            Ok(tool_use_response(&[("t1", "identity_info", json!({}))])),
            Ok(text_response("ok")),
        ]),
        10,
    );
    let outcome = f.agent.run(input("who are you"), None, None).await.unwrap();

    let body: serde_json::Value = serde_json::from_str(&outcome.tool_results[0].content).unwrap();
    assert_eq!(body["sessionId"], "conv-1");
    assert_eq!(body["sender"], "alice");
    assert_eq!(body["publicKey"], f.signer.identity().public_key.as_str());
}

#[tokio::test]
async fn test_model_failure_gives_degraded_response() {
    let f = fixture(ScriptedModel::failing(), 10);
    let outcome = f.agent.run(input("hello"), None, None).await.unwrap();

    assert!(outcome.degraded);
    assert_eq!(outcome.response, DEGRADED_RESPONSE);
    assert!(outcome.tool_results.is_empty());
    assert!(f.history.load("alice:conv-1").unwrap().is_empty());
}

#[tokio::test]
async fn test_iteration_bound() {
    let f = fixture(
        ScriptedModel::always(tool_use_response(&[("t", "current_time", json!({}))])),
        3,
    );
    let outcome = f.agent.run(input("loop forever"), None, None).await.unwrap();

    assert_eq!(outcome.terminal_state, LoopState::MaxIterationsExceeded);
    assert_eq!(outcome.response, MAX_ITERATIONS_RESPONSE);
    assert_eq!(outcome.iterations, 3);
    assert_eq!(outcome.tool_results.len(), 3);
    assert_eq!(f.model.calls(), 3);
}

#[tokio::test]
async fn test_progress_events_in_order() {
    let f = fixture(three_tools(), 10);
    let (tx, mut rx) = mpsc::channel(16);

    f.agent.run(input("go"), None, Some(&tx)).await.unwrap();
    drop(tx);

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    assert_eq!(events.len(), 6);
    assert!(events.iter().all(|e| e.request_id == "req-1"));

    let shape: Vec<_> = events.iter().map(|e| (e.kind, e.tool_name.as_str(), e.status)).collect();
    assert_eq!(
        shape,
        vec![
            (ProgressKind::ToolStart, "current_time", ProgressStatus::Running),
            (ProgressKind::ToolResult, "current_time", ProgressStatus::Success),
            (ProgressKind::ToolStart, "always_fails", ProgressStatus::Running),
            (ProgressKind::ToolResult, "always_fails", ProgressStatus::Error),
            (ProgressKind::ToolStart, "identity_info", ProgressStatus::Running),
            (ProgressKind::ToolResult, "identity_info", ProgressStatus::Success),
        ]
    );
    assert_eq!(events[3].error_type.as_deref(), Some("tool_execution"));
}

#[tokio::test]
async fn test_full_or_closed_progress_channel_is_ignored() {
    let f = fixture(three_tools(), 10);
    let (tx, rx) = mpsc::channel(1);
    drop(rx);

    let outcome = f.agent.run(input("go"), None, Some(&tx)).await.unwrap();
    assert_eq!(outcome.tool_results.len(), 3);
}

#[tokio::test]
async fn test_history_carries_across_runs() {
    let f = fixture(
        ScriptedModel::new(vec![
            Ok(text_response("hi alice")),
            Ok(text_response("you said hello")),
        ]),
        10,
    );
    f.agent.run(input("hello"), None, None).await.unwrap();
    f.agent.run(input("what did I say"), None, None).await.unwrap();

    let second = &f.model.requests()[1];
    assert_eq!(second.messages.len(), 3);
    assert_eq!(second.messages[0].text(), "hello");
    assert_eq!(second.messages[1].role, Role::Assistant);
    assert_eq!(f.history.load("alice:conv-1").unwrap().len(), 4);
}

#[tokio::test]
async fn test_context_warning_reaches_system_prompt() {
    let f = fixture(ScriptedModel::replying("noted"), 10);
    let mut with_warning = input("hello");
    with_warning.context_warning = Some("WARNING: workspace changed".to_string());

    f.agent.run(with_warning, None, None).await.unwrap();
    let system = &f.model.requests()[0].system;
    assert!(system.contains("WARNING: workspace changed"));
    assert!(system.contains(&f.signer.identity().public_key));
}
