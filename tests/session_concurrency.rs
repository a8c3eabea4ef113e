//! 多会话集成测试：会话间隔离、忙碌拒绝、取消、令牌关联与损坏快照

use std::sync::Arc;
use std::time::{Duration, Instant};

use ark::agent::{TurnInput, TurnStatus};
use ark::core::AgentError;
use ark::flow::{Flow, FlowBuilder, ToolBinding};
use ark::llm::MockLlmClient;
use ark::memory::{FileStore, InMemoryStore, SnapshotStore};
use ark::session::SessionManager;
use ark::tools::{ChannelTransport, LocalTool, LocalTransport, RetryPolicy, ToolSpec};
use async_trait::async_trait;
use serde_json::{json, Value};

fn lookup_flow(timeout_ms: u64) -> Arc<Flow> {
    Arc::new(
        FlowBuilder::new("lookup")
            .tool(
                ToolSpec::new("lookup")
                    .idempotent(true)
                    .with_timeout_ms(timeout_ms)
                    .with_request_schema(json!({
                        "type": "object",
                        "required": ["query"],
                        "properties": { "query": { "type": "string" } }
                    }))
                    .with_response_schema(json!({
                        "type": "object",
                        "required": ["answer"]
                    })),
            )
            .state("lookup", &["query"])
            .bind_tool(ToolBinding {
                name: "lookup".into(),
                output_mapping: [("answer".to_string(), "/answer".to_string())].into(),
                ..ToolBinding::default()
            })
            .response("Found {answer}")
            .build()
            .unwrap(),
    )
}

/// query 为 "slow" 时挂起，其余立即返回大写
struct SlowLookup;

#[async_trait]
impl LocalTool for SlowLookup {
    fn name(&self) -> &str {
        "lookup"
    }

    async fn call(&self, parameters: Value) -> Result<Value, String> {
        let query = parameters["query"].as_str().unwrap_or_default().to_string();
        if query == "slow" {
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
        Ok(json!({ "answer": query.to_uppercase() }))
    }
}

fn query(q: &str) -> TurnInput {
    TurnInput::new("").with_fact("query", q)
}

#[tokio::test]
async fn test_slow_session_does_not_delay_others() {
    let mgr = Arc::new(
        SessionManager::new(
            Arc::new(MockLlmClient::failing()),
            Arc::new(LocalTransport::new().with_tool(SlowLookup)),
        )
        .with_retry(RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(20),
            multiplier: 2.0,
        }),
    );
    mgr.register_flow(lookup_flow(60)).await;
    let a = mgr.create("lookup").await.unwrap();
    let b = mgr.create("lookup").await.unwrap();

    let slow = {
        let mgr = Arc::clone(&mgr);
        let a = a.clone();
        tokio::spawn(async move { mgr.step(&a, query("slow")).await })
    };

    let start = Instant::now();
    for q in ["alpha", "beta", "gamma"] {
        let outcome = mgr.step(&b, query(q)).await.unwrap();
        assert_eq!(outcome.status, TurnStatus::ToolCompleted { tool: "lookup".into() });
        assert_eq!(outcome.reply, format!("Found {}", q.to_uppercase()));
    }
    // A 至少需要 3 次超时（约 180ms）
    assert!(start.elapsed() < Duration::from_millis(150));
    assert!(!slow.is_finished());

    let err = slow.await.unwrap().unwrap_err();
    assert!(matches!(err, AgentError::ToolUnavailable { attempts: 3, .. }));
}

#[tokio::test]
async fn test_concurrent_step_is_rejected_while_tool_pending() {
    let (transport, mut requests) = ChannelTransport::new();
    let mailbox = transport.mailbox();
    let mgr = Arc::new(SessionManager::new(
        Arc::new(MockLlmClient::failing()),
        Arc::new(transport),
    ));
    mgr.register_flow(lookup_flow(5_000)).await;
    let id = mgr.create("lookup").await.unwrap();

    let first = {
        let mgr = Arc::clone(&mgr);
        let id = id.clone();
        tokio::spawn(async move { mgr.step(&id, query("q1")).await })
    };

    let request = requests.recv().await.unwrap();
    assert_eq!(request.tool_name, "lookup");
    assert_eq!(request.session_token, format!("{}:1", id));

    let err = mgr.step(&id, "are you there?").await.unwrap_err();
    assert!(matches!(err, AgentError::Busy(_)));

    assert!(mailbox.respond(
        &request.session_token,
        json!({ "status": "ok", "result": { "answer": "Q1" } })
    ));
    let outcome = first.await.unwrap().unwrap();
    assert_eq!(outcome.reply, "Found Q1");

    // 重复响应被丢弃
    assert!(!mailbox.respond(
        &request.session_token,
        json!({ "status": "ok", "result": { "answer": "again" } })
    ));

    // 空闲后接受下一轮
    let second = {
        let mgr = Arc::clone(&mgr);
        let id = id.clone();
        tokio::spawn(async move { mgr.step(&id, query("q2")).await })
    };
    let request = requests.recv().await.unwrap();
    assert_eq!(request.session_token, format!("{}:2", id));
    mailbox.respond(
        &request.session_token,
        json!({ "status": "ok", "result": { "answer": "Q2" } }),
    );
    assert_eq!(second.await.unwrap().unwrap().reply, "Found Q2");
}

#[tokio::test]
async fn test_cancel_discards_pending_tool_call() {
    let store = Arc::new(InMemoryStore::new());
    let (transport, mut requests) = ChannelTransport::new();
    let mailbox = transport.mailbox();
    let mgr = Arc::new(
        SessionManager::new(Arc::new(MockLlmClient::failing()), Arc::new(transport))
            .with_store(store.clone()),
    );
    mgr.register_flow(lookup_flow(5_000)).await;
    let id = mgr.create("lookup").await.unwrap();

    let turn = {
        let mgr = Arc::clone(&mgr);
        let id = id.clone();
        tokio::spawn(async move { mgr.step(&id, query("q1")).await })
    };
    let request = requests.recv().await.unwrap();
    assert_eq!(mailbox.pending_count(), 1);

    assert!(mgr.cancel(&id).await.unwrap());
    let err = turn.await.unwrap().unwrap_err();
    assert!(matches!(err, AgentError::Cancelled));
    assert_eq!(mailbox.pending_count(), 0);

    // 迟到的结果不会写入记忆
    assert!(!mailbox.respond(
        &request.session_token,
        json!({ "status": "ok", "result": { "answer": "Q1" } })
    ));
    let log = store.load_memory(&id).unwrap();
    assert_eq!(log.entries.len(), 1);
    assert!(log.entries[0].tool_result.is_none());

    assert!(!mgr.cancel(&id).await.unwrap());
}

#[tokio::test]
async fn test_corrupt_snapshot_only_affects_its_session() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileStore::new(dir.path()).unwrap());
    let mgr = SessionManager::new(
        Arc::new(MockLlmClient::failing()),
        Arc::new(LocalTransport::new().with_tool(SlowLookup)),
    )
    .with_store(store.clone());
    mgr.register_flow(lookup_flow(1_000)).await;

    std::fs::write(dir.path().join("sessions/session_broken.json"), "{ not json").unwrap();
    let err = mgr.resume("session_broken").await.unwrap_err();
    assert!(matches!(err, AgentError::Corruption(_)));
    assert!(err.is_fatal_to_session());

    let id = mgr.create("lookup").await.unwrap();
    let outcome = mgr.step(&id, query("ok")).await.unwrap();
    assert_eq!(outcome.reply, "Found OK");
    assert!(store.list_sessions().unwrap().contains(&id));
}
