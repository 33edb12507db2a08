//! Cross-module integration tests: each test drives a task through the
//! real `TaskManager` + `Orchestrator` + `AgentRegistry` stack against a
//! mocked backend, exercising one of the end-to-end scenarios the unit
//! tests in each module can't reach on their own.

use crate::agents::AgentRegistry;
use crate::events::EventBus;
use crate::memory::MemoryStore;
use crate::models::{
    AgentDefinition, CreatedBy, PreferredAgent, Priority, ProviderKind, TaskStatus,
};
use crate::orchestrator::Orchestrator;
use crate::scorer::RlScorer;
use crate::tasks::TaskManager;
use crate::workspace::WorkspaceExecutor;
use std::sync::Arc;
use std::time::Duration;

fn openai_agent(id: &str, endpoint: &str) -> AgentDefinition {
    AgentDefinition {
        id: id.to_string(),
        display_name: id.to_string(),
        provider_kind: ProviderKind::OpenAiCompatible,
        endpoint: Some(endpoint.to_string()),
        credential_env_var: None,
        model_id: "test-model".to_string(),
        avatar_tag: None,
        role_tag: "developer".to_string(),
        max_tokens: None,
        energy_recharge_rate: None,
        streaming: false,
    }
}

fn chat_completion_body(content: &str) -> String {
    serde_json::json!({
        "model": "test-model",
        "choices": [{"message": {"content": content}, "finish_reason": "stop"}],
        "usage": {"total_tokens": 120},
    })
    .to_string()
}

struct Harness {
    orchestrator: Arc<Orchestrator>,
    agents: Arc<AgentRegistry>,
    tasks: Arc<TaskManager>,
    _dir: tempfile::TempDir,
}

async fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let events = Arc::new(EventBus::new());
    let agents = Arc::new(AgentRegistry::new(events.clone()));
    let tasks = Arc::new(TaskManager::new(events.clone()));
    let scorer = Arc::new(RlScorer::new());
    let memory = Arc::new(MemoryStore::load(dir.path().join("memory")).await.unwrap());
    let workspace = Arc::new(WorkspaceExecutor::new(dir.path().join("workspace"), events.clone()));
    let orchestrator = Arc::new(Orchestrator::new(
        agents.clone(),
        tasks.clone(),
        scorer,
        memory,
        workspace,
        events,
    ));
    Harness {
        orchestrator,
        agents,
        tasks,
        _dir: dir,
    }
}

/// Polls until the task reaches `want` or the deadline passes. The
/// dispatch loop runs on its own tick interval, so tests drive it via
/// `orchestrator.clone().run()` rather than calling private internals.
async fn wait_for_status(tasks: &TaskManager, task_id: &str, want: TaskStatus) -> crate::models::Task {
    for _ in 0..100 {
        if let Some(task) = tasks.get(task_id).await {
            if task.status == want {
                return task;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("task {task_id} did not reach {want:?} within the test deadline");
}

#[tokio::test]
async fn s1_auto_apply_happy_path_writes_file_and_completes() {
    let h = harness().await;
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/v1/chat/completions")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(chat_completion_body(
            "FILE\npath: hello.js\nCONTENT\nconsole.log(\"hi\");\nEND_FILE\n",
        ))
        .create_async()
        .await;
    let endpoint = format!("{}/v1/chat/completions", server.url());
    h.agents.load(vec![openai_agent("a", &endpoint)], &Default::default()).await;
    h.tasks.set_auto_approve_all(true);

    let task = h
        .tasks
        .create(
            "write hello.js".into(),
            "write workspace/hello.js that prints hi".into(),
            Priority::Medium,
            CreatedBy::User,
            None,
            0,
            PreferredAgent::Auto,
            vec![],
        )
        .await
        .unwrap();

    h.orchestrator.clone().run();
    let completed = wait_for_status(&h.tasks, &task.id, TaskStatus::Completed).await;
    assert!(completed.result.as_ref().unwrap().perf_score >= 35);

    let written = h.orchestrator_workspace_file("hello.js").await;
    assert_eq!(written, "console.log(\"hi\");");
    mock.assert_async().await;
}

#[tokio::test]
async fn s2_rate_limit_sends_agent_to_cooldown_and_fails_task() {
    let h = harness().await;
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/v1/chat/completions")
        .with_status(429)
        .with_header("retry-after", "60")
        .create_async()
        .await;
    let endpoint = format!("{}/v1/chat/completions", server.url());
    h.agents.load(vec![openai_agent("a", &endpoint)], &Default::default()).await;

    let task = h
        .tasks
        .create(
            "write something".into(),
            "d".into(),
            Priority::Medium,
            CreatedBy::User,
            None,
            0,
            PreferredAgent::Id("a".into()),
            vec![],
        )
        .await
        .unwrap();

    h.orchestrator.clone().run();
    let failed = wait_for_status(&h.tasks, &task.id, TaskStatus::Failed).await;
    assert_eq!(failed.result, None);

    let agent = h.agents.get("a").await.unwrap();
    assert_eq!(agent.status, crate::models::AgentStatus::Cooldown);
    assert!(agent.cooldown_until.is_some());
    mock.assert_async().await;
}

#[tokio::test]
async fn s3_subtask_spawns_child_with_incremented_depth() {
    let h = harness().await;
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/v1/chat/completions")
        .with_status(200)
        .with_body(chat_completion_body(
            "SUBTASK\ntitle: add test\nagent: auto\ndescription: add a unit test for hello.js\nEND_SUBTASK\n",
        ))
        .create_async()
        .await;
    let endpoint = format!("{}/v1/chat/completions", server.url());
    h.agents.load(vec![openai_agent("a", &endpoint)], &Default::default()).await;
    h.tasks.set_auto_approve_all(true);

    let parent = h
        .tasks
        .create(
            "implement feature".into(),
            "d".into(),
            Priority::Medium,
            CreatedBy::User,
            None,
            0,
            PreferredAgent::Auto,
            vec![],
        )
        .await
        .unwrap();

    h.orchestrator.clone().run();
    wait_for_status(&h.tasks, &parent.id, TaskStatus::Completed).await;

    let child = wait_for_child_of(&h.tasks, &parent.id).await;
    assert_eq!(child.depth, 1);
    assert_eq!(child.parent_task_id.as_deref(), Some(parent.id.as_str()));
    assert!(matches!(child.created_by, CreatedBy::Agent(ref id) if id == "a"));
    mock.assert_async().await;
}

#[tokio::test]
async fn s4_depth_cap_drops_subtasks_but_still_completes() {
    let h = harness().await;
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/v1/chat/completions")
        .with_status(200)
        .with_body(chat_completion_body(
            "SUBTASK\ntitle: add test\nagent: auto\ndescription: never created\nEND_SUBTASK\n",
        ))
        .create_async()
        .await;
    let endpoint = format!("{}/v1/chat/completions", server.url());
    h.agents.load(vec![openai_agent("a", &endpoint)], &Default::default()).await;
    h.tasks.set_auto_approve_all(true);

    let parent = h
        .tasks
        .create(
            "deeply nested task".into(),
            "d".into(),
            Priority::Medium,
            CreatedBy::User,
            None,
            crate::models::MAX_TASK_DEPTH,
            PreferredAgent::Auto,
            vec![],
        )
        .await
        .unwrap();

    h.orchestrator.clone().run();
    wait_for_status(&h.tasks, &parent.id, TaskStatus::Completed).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    let has_child = h
        .tasks
        .list()
        .await
        .into_iter()
        .any(|t| t.parent_task_id.as_deref() == Some(parent.id.as_str()));
    assert!(!has_child, "no child task should be created once depth hits the cap");
    mock.assert_async().await;
}

#[tokio::test]
async fn s5_high_risk_task_waits_for_approval_then_writes_file() {
    let h = harness().await;
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/v1/chat/completions")
        .with_status(200)
        .with_body(chat_completion_body(
            "FILE\npath: db.rs\nCONTENT\n// migration\nEND_FILE\n",
        ))
        .create_async()
        .await;
    let endpoint = format!("{}/v1/chat/completions", server.url());
    h.agents.load(vec![openai_agent("a", &endpoint)], &Default::default()).await;

    let task = h
        .tasks
        .create(
            "rewrite the database layer".into(),
            "d".into(),
            Priority::Medium,
            CreatedBy::User,
            None,
            0,
            PreferredAgent::Auto,
            vec![],
        )
        .await
        .unwrap();

    h.orchestrator.clone().run();
    wait_for_status(&h.tasks, &task.id, TaskStatus::Review).await;
    assert!(!h.workspace_has_file("db.rs").await);

    h.orchestrator.approve_task(&task.id).await.unwrap();
    let approved = h.tasks.get(&task.id).await.unwrap();
    assert_eq!(approved.status, TaskStatus::Completed);
    assert!(h.workspace_has_file("db.rs").await);
    mock.assert_async().await;
}

#[tokio::test]
async fn s6_performance_log_converges_to_rounded_mean_of_last_twenty() {
    let scorer = RlScorer::new();
    for i in 0..17 {
        scorer
            .record_performance("agent-a", &["javascript".to_string()], 50, &format!("T{i}"))
            .await;
    }
    for i in 17..20 {
        scorer
            .record_performance("agent-a", &["javascript".to_string()], 90, &format!("T{i}"))
            .await;
    }
    let avg = scorer.agent_category_score("agent-a", "javascript").await;
    assert_eq!(avg, 56.0);
    assert_eq!(scorer.total_observations("agent-a").await, 20);

    // one more observation evicts the oldest (a 50), nudging the mean up
    scorer
        .record_performance("agent-a", &["javascript".to_string()], 90, "T20")
        .await;
    let avg_after_eviction = scorer.agent_category_score("agent-a", "javascript").await;
    assert!(avg_after_eviction > 56.0);
    assert_eq!(scorer.total_observations("agent-a").await, 20);
}

impl Harness {
    async fn orchestrator_workspace_file(&self, name: &str) -> String {
        let path = self._dir.path().join("workspace").join(name);
        tokio::fs::read_to_string(path).await.unwrap()
    }

    async fn workspace_has_file(&self, name: &str) -> bool {
        tokio::fs::try_exists(self._dir.path().join("workspace").join(name))
            .await
            .unwrap_or(false)
    }
}

async fn wait_for_child_of(tasks: &TaskManager, parent_id: &str) -> crate::models::Task {
    for _ in 0..100 {
        if let Some(child) = tasks
            .list()
            .await
            .into_iter()
            .find(|t| t.parent_task_id.as_deref() == Some(parent_id))
        {
            return child;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("no child task of {parent_id} appeared within the test deadline");
}
