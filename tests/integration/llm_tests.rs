use super::common::*;
use planwright::actors::ActorRegistry;
use planwright::approval::AutoApprove;
use planwright::decomposer::{Decomposer, DecompositionContext, LlmDecomposer};
use planwright::llm::create_generator;
use planwright::persistence::{MemoryStore, PlanStore};
use planwright::planning::{StepStatus, Task, TaskStatus};
use planwright::Coordinator;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn completion(text: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "choices": [{"message": {"role": "assistant", "content": text}}],
        "usage": {"prompt_tokens": 100, "completion_tokens": 40}
    }))
}

const PLAN_REPLY: &str = r#"Here is the plan:
```json
{
  "goal": "Say hello",
  "strategy": {"approach": "echo twice"},
  "steps": [
    {"id": "greet", "description": "Greet", "actor": "echo", "invocation": {"text": "hello"}},
    {"id": "wave", "description": "Wave", "actor": "echo", "dependencies": ["greet"]}
  ]
}
```"#;

async fn mock_model() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_string_contains("Say hello to the team"))
        .respond_with(completion(PLAN_REPLY))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn test_llm_decomposer_over_http() {
    let server = mock_model().await;
    let mut config = fast_config();
    config.llm.base_url = format!("{}/v1", server.uri());
    config.llm.api_key = Some("test-key".to_string());

    let decomposer = LlmDecomposer::new(Arc::new(create_generator(&config.llm).unwrap()));
    let plan = decomposer
        .decompose("Say hello to the team", &DecompositionContext::new("t"))
        .await
        .unwrap();

    assert_eq!(plan.goal, "Say hello");
    assert_eq!(plan.strategy.approach, "echo twice");
    assert_eq!(plan.steps.len(), 2);
    assert_eq!(plan.steps[1].dependencies, vec!["greet"]);
}

#[tokio::test]
async fn test_task_planned_by_model_runs_to_completion() {
    let server = mock_model().await;
    let mut config = fast_config();
    config.llm.base_url = format!("{}/v1", server.uri());
    config.actors.shell_enabled = false;

    let registry = ActorRegistry::with_builtins(&config.actors);
    let decomposer = LlmDecomposer::new(Arc::new(create_generator(&config.llm).unwrap()))
        .with_environment(registry.describe());
    let store: Arc<dyn PlanStore> = Arc::new(MemoryStore::new());
    let (tx, _rx) = mpsc::unbounded_channel();
    let coordinator = Coordinator::new(
        &config,
        store.clone(),
        Arc::new(decomposer),
        Arc::new(registry),
        Arc::new(AutoApprove),
        tx,
    );

    let task = coordinator
        .submit_task(Task::new("task-llm", "Say hello to the team"))
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::Completed);

    let plan = store.latest_plan("task-llm").await.unwrap().unwrap();
    assert!(plan.steps.iter().all(|s| s.status == StepStatus::Completed));
    assert_eq!(plan.step("greet").unwrap().result, Some(json!({"text": "hello"})));
    // echo answers with the description when there is no payload
    assert_eq!(plan.step("wave").unwrap().result, Some(json!("Wave")));
}

#[tokio::test]
async fn test_model_error_fails_the_task() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429).set_body_string("rate limit exceeded"))
        .mount(&server)
        .await;

    let mut config = fast_config();
    config.llm.base_url = server.uri();
    let decomposer = LlmDecomposer::new(Arc::new(create_generator(&config.llm).unwrap()));
    let store: Arc<dyn PlanStore> = Arc::new(MemoryStore::new());
    let (tx, _rx) = mpsc::unbounded_channel();
    let coordinator = Coordinator::new(
        &config,
        store.clone(),
        Arc::new(decomposer),
        Arc::new(ScriptedActor::new()),
        Arc::new(AutoApprove),
        tx,
    );

    let err = coordinator
        .submit_task(Task::new("task-429", "anything"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("decomposition failed"));
    assert_eq!(
        store.require_task("task-429").await.unwrap().status,
        TaskStatus::Failed
    );
}
